//! Import campaigns, batches and per-reference results.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of an import record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportRecordStatus {
    Created,
    Started,
    Completed,
    Cancelled,
}

/// Status of an import batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportBatchStatus {
    Created,
    Started,
    Failed,
    PartiallyFailed,
    /// Records imported; search indexing in progress.
    Indexing,
    IndexingFailed,
    Completed,
    Cancelled,
}

impl ImportBatchStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ImportBatchStatus::Failed
                | ImportBatchStatus::PartiallyFailed
                | ImportBatchStatus::IndexingFailed
                | ImportBatchStatus::Completed
                | ImportBatchStatus::Cancelled
        )
    }
}

/// Status of one import result (one JSONL entry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportResultStatus {
    Created,
    Started,
    Completed,
    PartiallyFailed,
    Failed,
    Cancelled,
}

/// A logical import campaign. Owns its batches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportRecord {
    pub id: Uuid,
    pub processor_name: String,
    pub processor_version: String,
    pub source_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_string: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Number of references expected across all batches; -1 when unknown.
    pub expected_reference_count: i64,
    pub status: ImportRecordStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batches: Option<Vec<ImportBatch>>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl ImportRecord {
    pub fn new(
        processor_name: impl Into<String>,
        processor_version: impl Into<String>,
        source_name: impl Into<String>,
        expected_reference_count: i64,
    ) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Uuid::new_v4(),
            processor_name: processor_name.into(),
            processor_version: processor_version.into(),
            source_name: source_name.into(),
            search_string: None,
            notes: None,
            expected_reference_count,
            status: ImportRecordStatus::Created,
            batches: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One JSONL file within an import. Unique per (import record, storage URL).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportBatch {
    pub id: Uuid,
    pub import_record_id: Uuid,
    /// Where the batch's reference JSONL is streamed from.
    pub storage_url: String,
    /// Posted a summary after processing, when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    pub status: ImportBatchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import_results: Option<Vec<ImportResult>>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl ImportBatch {
    pub fn new(import_record_id: Uuid, storage_url: impl Into<String>) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Uuid::new_v4(),
            import_record_id,
            storage_url: storage_url.into(),
            callback_url: None,
            status: ImportBatchStatus::Created,
            import_results: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Result status counts plus collected failure details, for the summary
    /// endpoint and callback payload.
    pub fn summary(&self) -> ImportBatchSummary {
        let mut results: BTreeMap<ImportResultStatus, u64> = BTreeMap::new();
        let mut failure_details = Vec::new();
        for result in self.import_results.iter().flatten() {
            *results.entry(result.status).or_insert(0) += 1;
            if matches!(
                result.status,
                ImportResultStatus::Failed | ImportResultStatus::PartiallyFailed
            ) {
                if let Some(details) = &result.failure_details {
                    failure_details.push(details.clone());
                }
            }
        }
        ImportBatchSummary {
            import_batch_id: self.id,
            import_batch_status: self.status,
            results,
            failure_details,
        }
    }

    /// Set of result statuses, input to the batch status projection.
    pub fn result_status_set(&self) -> HashSet<ImportResultStatus> {
        self.import_results
            .iter()
            .flatten()
            .map(|r| r.status)
            .collect()
    }
}

/// Per-reference outcome of one batch entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportResult {
    pub id: Uuid,
    pub import_batch_id: Uuid,
    pub status: ImportResultStatus,
    /// The reference produced by this entry; absent on total failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_details: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl ImportResult {
    pub fn new(import_batch_id: Uuid) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Uuid::new_v4(),
            import_batch_id,
            status: ImportResultStatus::Created,
            reference_id: None,
            failure_details: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Batch summary shipped to the callback URL and the summary endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportBatchSummary {
    pub import_batch_id: Uuid,
    pub import_batch_status: ImportBatchStatus,
    pub results: BTreeMap<ImportResultStatus, u64>,
    pub failure_details: Vec<String>,
}
