#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_docs_in_private_items)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

//! # Reference Repository Core
//!
//! Core of a bibliographic reference repository for evidence-synthesis
//! workflows: batch JSONL ingestion, deduplication against a canonical set,
//! robot-driven enhancement, and a search index serving the deduplicated
//! projection of each canonical reference.
//!
//! ## Module Organization
//!
//! ### Domain
//! - [`reference`]: the reference aggregate
//! - [`identifiers`]: DOI / PubMed / OpenAlex / other identifiers
//! - [`enhancements`]: enhancement content sum type and hashing
//! - [`decisions`]: duplicate decisions and their state machine
//! - [`imports`]: import records, batches and results
//! - [`robots`]: robots, automations and the enhancement work queue
//! - [`projections`]: search fields, fingerprints, deduplicated view,
//!   status projections
//! - [`wire`]: JSONL wire formats
//!
//! ### Capabilities
//! - [`store`]: transactional [`ReferenceStore`](store::ReferenceStore)
//! - [`search`]: [`SearchStore`](search::SearchStore) with percolation
//! - [`blob`]: [`BlobStore`](blob::BlobStore) with streamed JSONL
//! - [`tasks`]: [`TaskQueue`](tasks::TaskQueue) and the in-process broker
//!
//! ### Services
//! - [`services::ingestion`]: line parsing and validation
//! - [`services::deduplication`]: the four-phase dedup pipeline
//! - [`services::enhancement`]: batch leasing, leases, retries
//! - [`services::reference`]: the orchestrating reference service
//! - [`services::import`]: import batch processing and callbacks
//! - [`services::synchronizer`]: store-to-index mirroring
//! - [`repository`]: explicit boot-time wiring
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use refrepo_core::config::RepositoryConfig;
//! use refrepo_core::repository::Repository;
//! # async fn example(
//! #     store: Arc<dyn refrepo_core::store::ReferenceStore>,
//! #     search: Arc<dyn refrepo_core::search::SearchStore>,
//! #     blobs: Arc<dyn refrepo_core::blob::BlobStore>,
//! # ) -> refrepo_core::error::Result<()> {
//! let repository = Repository::with_in_process_worker(
//!     RepositoryConfig::default(),
//!     store,
//!     search,
//!     blobs,
//! );
//! let hits = repository
//!     .references
//!     .search_references("title:heat", 1, vec![], None, vec![])
//!     .await?;
//! println!("found {} references", hits.total.value);
//! # Ok(())
//! # }
//! ```

pub mod blob;
pub mod config;
pub mod decisions;
pub mod enhancements;
pub mod error;
pub mod identifiers;
pub mod imports;
pub mod projections;
pub mod reference;
pub mod repository;
pub mod robots;
pub mod search;
pub mod services;
pub mod store;
pub mod tasks;
pub mod wire;

pub use error::{Error, Result};
pub use reference::Reference;
pub use repository::Repository;
