#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_docs_in_private_items)]

//! # Reference storage - libSQL
//!
//! libSQL/Turso backend for the transactional reference store.
//!
//! This crate provides:
//! - Connection management for local, in-memory and remote databases
//! - SQL schema creation for all repository entities
//! - Transactional [`ReferenceScope`](refrepo_core::store::ReferenceScope)s:
//!   one connection per scope, `BEGIN` on open, explicit `COMMIT`, implicit
//!   rollback when the scope is dropped
//! - Uniqueness constraints matching the domain's ownership rules,
//!   including at-most-one active duplicate decision per reference
//!
//! ## Example
//!
//! ```no_run
//! use refrepo_storage_libsql::LibsqlReferenceStore;
//!
//! # async fn example() -> refrepo_core::error::Result<()> {
//! let store = LibsqlReferenceStore::open_local("refrepo.db").await?;
//! store.initialize_schema().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use libsql::{Builder, Database};
use tracing::{debug, info};

use refrepo_core::error::{Error, Result};
use refrepo_core::store::{ReferenceScope, ReferenceStore};

mod decisions;
mod imports;
mod pendings;
mod references;
mod robots;
mod schema;
mod scope;

#[cfg(test)]
mod tests;

pub use scope::LibsqlScope;

/// libSQL-backed reference store.
pub struct LibsqlReferenceStore {
    db: Arc<Database>,
}

impl LibsqlReferenceStore {
    /// Open a remote Turso database.
    pub async fn open_remote(url: &str, token: &str) -> Result<Self> {
        if !url.starts_with("libsql://") {
            return Err(Error::Store(format!(
                "remote connections must use the libsql:// protocol, got {url}"
            )));
        }
        let db = Builder::new_remote(url.to_string(), token.to_string())
            .build()
            .await
            .map_err(|e| Error::Store(format!("failed to open remote database: {e}")))?;
        info!(url, "opened remote reference store");
        Ok(Self { db: Arc::new(db) })
    }

    /// Open (or create) a local database file.
    pub async fn open_local(path: &str) -> Result<Self> {
        let db = Builder::new_local(path)
            .build()
            .await
            .map_err(|e| Error::Store(format!("failed to open local database: {e}")))?;
        debug!(path, "opened local reference store");
        Ok(Self { db: Arc::new(db) })
    }

    /// Create all tables and indexes. Idempotent.
    pub async fn initialize_schema(&self) -> Result<()> {
        let conn = self
            .db
            .connect()
            .map_err(|e| Error::Store(format!("failed to connect: {e}")))?;
        for statement in schema::ALL_STATEMENTS {
            conn.execute(statement, ())
                .await
                .map_err(|e| Error::Store(format!("failed to initialize schema: {e}")))?;
        }
        info!("reference store schema initialized");
        Ok(())
    }
}

#[async_trait]
impl ReferenceStore for LibsqlReferenceStore {
    async fn begin(&self) -> Result<Box<dyn ReferenceScope>> {
        let conn = self
            .db
            .connect()
            .map_err(|e| Error::Store(format!("failed to connect: {e}")))?;
        let scope = LibsqlScope::begin(conn).await?;
        Ok(Box::new(scope))
    }
}
