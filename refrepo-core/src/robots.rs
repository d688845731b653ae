//! Robots, automations, and the enhancement work-queue entities.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::blob::BlobFile;

/// An external enhancing worker. Robots poll the repository for batches;
/// the repository never calls them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Robot {
    pub id: Uuid,
    /// Unique across robots.
    pub name: String,
    /// Where the robot lives. Metadata only.
    pub base_url: String,
    pub description: String,
    pub owner: String,
    /// Shared secret for the robot's requests. Never serialized outward.
    #[serde(default, skip_serializing)]
    pub client_secret: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl Robot {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        description: impl Into<String>,
        owner: impl Into<String>,
    ) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            base_url: base_url.into(),
            description: description.into(),
            owner: owner.into(),
            client_secret: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A saved percolator query. Mirrored into the search index; references or
/// enhancement changesets that match enqueue pending enhancements for the
/// automation's robot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotAutomation {
    pub id: Uuid,
    pub robot_id: Uuid,
    /// Percolator query in the index's native JSON syntax. Unique per
    /// (robot, query).
    pub query: serde_json::Value,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl RobotAutomation {
    pub fn new(robot_id: Uuid, query: serde_json::Value) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Uuid::new_v4(),
            robot_id,
            query,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One automation match: a robot and the references it should enhance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotAutomationPercolationResult {
    pub robot_id: Uuid,
    pub reference_ids: Vec<Uuid>,
}

/// Status of a pending enhancement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingEnhancementStatus {
    /// Waiting to be picked up by a robot batch.
    Pending,
    /// Leased to a robot enhancement batch.
    Processing,
    /// Result received; being imported.
    Importing,
    /// Imported; search indexing in progress.
    Indexing,
    /// Imported but the search index could not be updated.
    IndexingFailed,
    Completed,
    Failed,
    /// The robot's result was an exact duplicate of existing content.
    Discarded,
    /// The lease lapsed; superseded by a retry or dropped.
    Expired,
}

impl PendingEnhancementStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            PendingEnhancementStatus::Pending
                | PendingEnhancementStatus::Processing
                | PendingEnhancementStatus::Importing
                | PendingEnhancementStatus::Indexing
        )
    }
}

/// A unit of work for one robot on one reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEnhancement {
    pub id: Uuid,
    pub reference_id: Uuid,
    pub robot_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enhancement_request_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub robot_enhancement_batch_id: Option<Uuid>,
    /// Triggering context, e.g. `DuplicateDecision:<id>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub status: PendingEnhancementStatus,
    /// Lease expiry while `Processing`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
    /// The expired pending enhancement this one retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<Uuid>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl PendingEnhancement {
    pub fn new(reference_id: Uuid, robot_id: Uuid) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Uuid::new_v4(),
            reference_id,
            robot_id,
            enhancement_request_id: None,
            robot_enhancement_batch_id: None,
            source: None,
            status: PendingEnhancementStatus::Pending,
            expires_at: None,
            retry_of: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A fresh replacement for this (expired) pending enhancement,
    /// preserving reference, robot, request and source.
    pub fn retry(&self) -> Self {
        let mut replacement = Self::new(self.reference_id, self.robot_id);
        replacement.enhancement_request_id = self.enhancement_request_id;
        replacement.source = self.source.clone();
        replacement.retry_of = Some(self.id);
        replacement
    }
}

/// Projected status of an enhancement request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnhancementRequestStatus {
    Received,
    Processing,
    Completed,
    Failed,
    PartialFailed,
}

/// A logical multi-reference enhancement request for one robot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhancementRequest {
    pub id: Uuid,
    pub robot_id: Uuid,
    pub reference_ids: Vec<Uuid>,
    /// Derived from the statuses of the request's pending enhancements.
    pub request_status: EnhancementRequestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl EnhancementRequest {
    pub fn new(robot_id: Uuid, reference_ids: Vec<Uuid>) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Uuid::new_v4(),
            robot_id,
            reference_ids,
            request_status: EnhancementRequestStatus::Received,
            source: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A unit of work leased to one robot poll.
///
/// Owns the lease over its pending enhancements and the three blobs of the
/// exchange: reference data (repository output), result (robot output) and
/// validation result (repository verdict on the result).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotEnhancementBatch {
    pub id: Uuid,
    pub robot_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_data_file: Option<BlobFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_file: Option<BlobFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_result_file: Option<BlobFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_enhancements: Option<Vec<PendingEnhancement>>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl RobotEnhancementBatch {
    pub fn new(robot_id: Uuid) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Uuid::new_v4(),
            robot_id,
            reference_data_file: None,
            result_file: None,
            validation_result_file: None,
            error: None,
            pending_enhancements: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// What a polling robot receives: the batch plus signed URLs for the
/// reference data (read) and the result upload (write).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RobotEnhancementBatchBundle {
    pub robot_enhancement_batch_id: Uuid,
    pub reference_data_url: String,
    pub result_upload_url: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}
