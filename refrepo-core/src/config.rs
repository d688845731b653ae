//! Repository configuration.
//!
//! One `RepositoryConfig` is constructed at process boot (from defaults or a
//! TOML file) and threaded through services explicitly. There is no global
//! mutable configuration; tests construct alternate configs directly.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::identifiers::ExternalIdentifierType;
use crate::projections::{default_singly_projected_annotations, SinglyProjectedAnnotation};

/// Chain-length cap for duplicate trees (direct duplicates only).
pub const DEFAULT_MAX_REFERENCE_DUPLICATE_DEPTH: u32 = 2;

/// Default retry budget for expired pending enhancements.
pub const DEFAULT_MAX_RETRY_COUNT: u32 = 3;

/// Default chunk size when percolating enhancement changesets.
pub const DEFAULT_PERCOLATION_CHUNK_SIZE: usize = 100;

/// Default chunk size when hydrating references into an upload stream.
pub const DEFAULT_UPLOAD_FILE_CHUNK_SIZE: usize = 500;

/// Operations with a configurable percolation chunk size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PercolationOperation {
    /// Percolating imported enhancements against robot automations.
    RobotAutomation,
}

/// Operations with a configurable upload chunk size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadOperation {
    /// Hydrated reference data handed to a robot enhancement batch.
    RobotEnhancementReferenceData,
}

/// Configuration for the reference repository core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Identifier types trusted to uniquely identify a work. Sharing one of
    /// these with an existing reference bypasses fingerprint deduplication.
    pub trusted_unique_identifier_types: Vec<ExternalIdentifierType>,

    /// Maximum duplicate chain depth. Links that would exceed this are
    /// refused and the chain end is decoupled for human review.
    pub max_reference_duplicate_depth: u32,

    /// Maximum retry depth for expired pending enhancements.
    pub max_retry_count: u32,

    /// Relevance score at or above which a fingerprint candidate is a
    /// confident duplicate.
    pub candidate_duplicate_score_threshold: f64,

    pub default_percolation_chunk_size: usize,
    pub percolation_chunk_size_override: HashMap<PercolationOperation, usize>,

    pub default_upload_file_chunk_size: usize,
    pub upload_file_chunk_size_override: HashMap<UploadOperation, usize>,

    /// Storage location label for blobs written by the repository.
    pub default_blob_location: String,
    /// Container for blobs written by the repository.
    pub default_blob_container: String,

    pub presigned_url_expiry_seconds: u64,

    /// Lease applied to a robot enhancement batch when the robot does not
    /// supply one.
    pub default_robot_lease_duration_seconds: u64,

    /// Annotation keys projected singly to the root of the search document.
    pub singly_projected_annotations: Vec<SinglyProjectedAnnotation>,

    /// Feature flag: run the deduplication pipeline on ingest. When off,
    /// every reference is stored as its own canonical.
    pub deduplication: bool,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            trusted_unique_identifier_types: Vec::new(),
            max_reference_duplicate_depth: DEFAULT_MAX_REFERENCE_DUPLICATE_DEPTH,
            max_retry_count: DEFAULT_MAX_RETRY_COUNT,
            candidate_duplicate_score_threshold: 0.9,
            default_percolation_chunk_size: DEFAULT_PERCOLATION_CHUNK_SIZE,
            percolation_chunk_size_override: HashMap::new(),
            default_upload_file_chunk_size: DEFAULT_UPLOAD_FILE_CHUNK_SIZE,
            upload_file_chunk_size_override: HashMap::new(),
            default_blob_location: "local".to_string(),
            default_blob_container: "refrepo".to_string(),
            presigned_url_expiry_seconds: 3600,
            default_robot_lease_duration_seconds: 600,
            singly_projected_annotations: default_singly_projected_annotations(),
            deduplication: true,
        }
    }
}

impl RepositoryConfig {
    /// Load configuration from a TOML string, filling gaps with defaults.
    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::InvalidInput(format!("invalid config: {e}")))
    }

    /// Chunk size for a percolation operation.
    pub fn percolation_chunk_size(&self, op: PercolationOperation) -> usize {
        *self
            .percolation_chunk_size_override
            .get(&op)
            .unwrap_or(&self.default_percolation_chunk_size)
    }

    /// Chunk size for an upload operation.
    pub fn upload_file_chunk_size(&self, op: UploadOperation) -> usize {
        *self
            .upload_file_chunk_size_override
            .get(&op)
            .unwrap_or(&self.default_upload_file_chunk_size)
    }

    /// Default lease duration as a [`Duration`].
    pub fn default_robot_lease_duration(&self) -> Duration {
        Duration::from_secs(self.default_robot_lease_duration_seconds)
    }
}
