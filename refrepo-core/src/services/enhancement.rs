//! The robot enhancement lifecycle: requests, batch leasing, lease renewal,
//! expiry sweep with retries, and result categorization.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use crate::blob::{BlobFile, BlobStore, SignedUrlKind};
use crate::config::{RepositoryConfig, UploadOperation};
use crate::error::{Error, Result};
use crate::robots::{
    EnhancementRequest, PendingEnhancement, PendingEnhancementStatus, RobotEnhancementBatch,
    RobotEnhancementBatchBundle,
};
use crate::store::{ReferenceInclude, ReferenceScope};
use crate::wire::reference_to_jsonl;

/// Blob path for robot reference-data files.
const REFERENCE_DATA_PATH: &str = "robot_enhancement_batch_reference_data";
/// Blob path for robot result uploads.
const RESULT_DATA_PATH: &str = "robot_enhancement_batch_result_data";
/// Blob path for repository validation reports.
pub const ENHANCEMENT_RESULT_PATH: &str = "enhancement_result";

/// Ids of pending enhancements bucketed by their result-ingestion outcome.
#[derive(Debug, Default, Clone)]
pub struct CategorizedPendings {
    pub successful: Vec<Uuid>,
    pub discarded: Vec<Uuid>,
    pub failed: Vec<Uuid>,
}

/// Counts from one lease-expiry sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepOutcome {
    pub expired: usize,
    pub replaced_with: usize,
}

/// Service for managing robot enhancement work.
pub struct EnhancementService {
    blob_store: Arc<dyn BlobStore>,
    config: Arc<RepositoryConfig>,
}

impl EnhancementService {
    pub fn new(blob_store: Arc<dyn BlobStore>, config: Arc<RepositoryConfig>) -> Self {
        Self { blob_store, config }
    }

    // ========== Request creation ==========

    /// Create an enhancement request: verify the targets exist, persist the
    /// request, and enqueue one pending enhancement per reference.
    pub async fn create_request(
        &self,
        scope: &mut dyn ReferenceScope,
        request: &EnhancementRequest,
    ) -> Result<()> {
        scope.get_robot(request.robot_id).await?;
        scope.verify_reference_ids(&request.reference_ids).await?;
        scope.add_enhancement_request(request).await?;
        self.create_pending_enhancements(
            scope,
            request.robot_id,
            &request.reference_ids,
            Some(request.id),
            request.source.clone(),
        )
        .await?;
        Ok(())
    }

    pub async fn create_pending_enhancements(
        &self,
        scope: &mut dyn ReferenceScope,
        robot_id: Uuid,
        reference_ids: &[Uuid],
        enhancement_request_id: Option<Uuid>,
        source: Option<String>,
    ) -> Result<Vec<PendingEnhancement>> {
        let pending: Vec<PendingEnhancement> = reference_ids
            .iter()
            .map(|reference_id| {
                let mut p = PendingEnhancement::new(*reference_id, robot_id);
                p.enhancement_request_id = enhancement_request_id;
                p.source = source.clone();
                p
            })
            .collect();
        if !pending.is_empty() {
            scope.add_pending_enhancements(&pending).await?;
        }
        Ok(pending)
    }

    /// An enhancement request with its status projected from its pending
    /// enhancements.
    pub async fn request_with_calculated_status(
        &self,
        scope: &mut dyn ReferenceScope,
        request_id: Uuid,
    ) -> Result<EnhancementRequest> {
        let mut request = scope.get_enhancement_request(request_id).await?;
        let statuses: HashSet<PendingEnhancementStatus> = scope
            .pending_statuses_for_request(request_id)
            .await?
            .into_iter()
            .collect();
        if let Some(status) = crate::projections::enhancement_request_status(&statuses) {
            request.request_status = status;
        }
        Ok(request)
    }

    // ========== Batch leasing ==========

    /// Select pending work for a robot poll, deduplicated by reference id.
    ///
    /// A single batch never carries two pending enhancements for the same
    /// reference; the oldest wins and the rest stay pending for a future
    /// batch.
    pub async fn select_pendings_for_batch(
        &self,
        scope: &mut dyn ReferenceScope,
        robot_id: Uuid,
        limit: usize,
    ) -> Result<Vec<PendingEnhancement>> {
        let pending = scope.find_pending_for_robot(robot_id, limit).await?;
        let mut seen: HashSet<Uuid> = HashSet::new();
        Ok(pending
            .into_iter()
            .filter(|p| seen.insert(p.reference_id))
            .collect())
    }

    /// Create a robot enhancement batch over the selected pending
    /// enhancements: lease them, stream the hydrated reference JSONL to
    /// blob storage, and pre-allocate the result upload handle.
    pub async fn create_robot_batch(
        &self,
        scope: &mut dyn ReferenceScope,
        robot_id: Uuid,
        pending: &[PendingEnhancement],
        lease_duration: Duration,
    ) -> Result<(RobotEnhancementBatch, chrono::DateTime<chrono::Utc>)> {
        let mut batch = RobotEnhancementBatch::new(robot_id);
        scope.add_robot_batch(&batch).await?;

        let expires_at = chrono::Utc::now()
            + chrono::Duration::from_std(lease_duration)
                .map_err(|e| Error::InvalidInput(format!("invalid lease duration: {e}")))?;
        let pending_ids: Vec<Uuid> = pending.iter().map(|p| p.id).collect();
        scope.lease_pending(&pending_ids, batch.id, expires_at).await?;

        let reference_data_file = self
            .upload_reference_data(scope, &batch, pending)
            .await?;
        let result_file = BlobFile::new(
            &self.config.default_blob_location,
            &self.config.default_blob_container,
            RESULT_DATA_PATH,
            format!("{}_robot.jsonl", batch.id),
        );
        scope
            .set_robot_batch_files(batch.id, &reference_data_file, &result_file)
            .await?;

        batch.reference_data_file = Some(reference_data_file);
        batch.result_file = Some(result_file);
        info!(
            robot_enhancement_batch_id = %batch.id,
            robot_id = %robot_id,
            pending = pending.len(),
            "created robot enhancement batch"
        );
        Ok((batch, expires_at))
    }

    /// Stream hydrated reference JSONL for the batch to blob storage at a
    /// deterministic path.
    async fn upload_reference_data(
        &self,
        scope: &mut dyn ReferenceScope,
        batch: &RobotEnhancementBatch,
        pending: &[PendingEnhancement],
    ) -> Result<BlobFile> {
        let reference_ids: Vec<Uuid> = pending.iter().map(|p| p.reference_id).collect();
        let chunk_size = self
            .config
            .upload_file_chunk_size(UploadOperation::RobotEnhancementReferenceData);

        let mut writer = self
            .blob_store
            .create(REFERENCE_DATA_PATH, &format!("{}.jsonl", batch.id))
            .await?;
        for chunk in reference_ids.chunks(chunk_size.max(1)) {
            let references = scope
                .get_references(chunk, ReferenceInclude::CONTENT, true)
                .await?;
            for reference in &references {
                writer.write_line(&reference_to_jsonl(reference)?).await?;
            }
        }
        writer.finish().await
    }

    /// Signed URLs for the robot to download reference data and upload its
    /// result.
    pub async fn bundle_for_robot(
        &self,
        batch: &RobotEnhancementBatch,
        expires_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<RobotEnhancementBatchBundle> {
        let reference_data_file = batch.reference_data_file.as_ref().ok_or_else(|| {
            Error::Store("robot enhancement batch has no reference data file".to_string())
        })?;
        let result_file = batch
            .result_file
            .as_ref()
            .ok_or_else(|| Error::Store("robot enhancement batch has no result file".to_string()))?;
        Ok(RobotEnhancementBatchBundle {
            robot_enhancement_batch_id: batch.id,
            reference_data_url: self
                .blob_store
                .signed_url(reference_data_file, SignedUrlKind::Download)
                .await?,
            result_upload_url: self
                .blob_store
                .signed_url(result_file, SignedUrlKind::Upload)
                .await?,
            expires_at,
        })
    }

    // ========== Lease renewal ==========

    /// Extend the lease on a batch's still-processing pending enhancements.
    ///
    /// Once a lease has expired the sweep owns the work; renewal is refused
    /// and the robot must request a new batch.
    pub async fn renew_lease(
        &self,
        scope: &mut dyn ReferenceScope,
        batch_id: Uuid,
        lease_duration: Duration,
    ) -> Result<(u64, chrono::DateTime<chrono::Utc>)> {
        scope.get_robot_batch(batch_id, false).await?;
        let expires_at = chrono::Utc::now()
            + chrono::Duration::from_std(lease_duration)
                .map_err(|e| Error::InvalidInput(format!("invalid lease duration: {e}")))?;
        let renewed = scope.renew_leases(batch_id, expires_at).await?;
        if renewed == 0 {
            return Err(Error::InvalidInput(
                "no leases to renew; the batch has expired or completed".to_string(),
            ));
        }
        Ok((renewed, expires_at))
    }

    // ========== Lease expiry & retry ==========

    /// Move stale leases to `Expired` and create retry replacements up to
    /// the configured retry depth. Idempotent: an already-swept record is
    /// not `Processing` any more and is not matched again.
    pub async fn expire_and_retry_stale_pendings(
        &self,
        scope: &mut dyn ReferenceScope,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<SweepOutcome> {
        let expired = scope.expire_stale_pending(now).await?;
        if expired.is_empty() {
            return Ok(SweepOutcome::default());
        }
        info!(count = expired.len(), "found stale pending enhancements");

        let mut replacements = Vec::new();
        let mut exhausted = Vec::new();
        for stale in &expired {
            let retry_depth = scope.retry_depth(stale.id).await?;
            if retry_depth < self.config.max_retry_count {
                replacements.push(stale.retry());
            } else {
                warn!(
                    pending_enhancement_id = %stale.id,
                    reference_id = %stale.reference_id,
                    retry_depth,
                    max_retry_count = self.config.max_retry_count,
                    "pending enhancement exceeded retry limit"
                );
                exhausted.push(stale.id);
            }
        }
        if !replacements.is_empty() {
            scope.add_pending_enhancements(&replacements).await?;
        }
        // An expired record with no retry left is the end of the line; fail
        // it so the request status projection can settle.
        if !exhausted.is_empty() {
            scope
                .update_pending_status(&exhausted, PendingEnhancementStatus::Failed)
                .await?;
        }
        Ok(SweepOutcome {
            expired: expired.len(),
            replaced_with: replacements.len(),
        })
    }

    // ========== Result categorization ==========

    /// Bucket a batch's pending enhancements by the reference-id outcome
    /// sets collected while consuming the robot's result stream.
    pub fn categorize_pendings(
        &self,
        pending: &[PendingEnhancement],
        successful_reference_ids: &HashSet<Uuid>,
        discarded_reference_ids: &HashSet<Uuid>,
    ) -> CategorizedPendings {
        let mut categorized = CategorizedPendings::default();
        for p in pending {
            if successful_reference_ids.contains(&p.reference_id) {
                categorized.successful.push(p.id);
            } else if discarded_reference_ids.contains(&p.reference_id) {
                categorized.discarded.push(p.id);
            } else {
                categorized.failed.push(p.id);
            }
        }
        categorized
    }

    /// Mark a robot enhancement batch failed, failing its pending
    /// enhancements with it.
    pub async fn mark_batch_failed(
        &self,
        scope: &mut dyn ReferenceScope,
        batch_id: Uuid,
        error: &str,
    ) -> Result<()> {
        let pending = scope.find_pending_by_batch(batch_id).await?;
        let ids: Vec<Uuid> = pending.iter().map(|p| p.id).collect();
        if !ids.is_empty() {
            scope
                .update_pending_status(&ids, PendingEnhancementStatus::Failed)
                .await?;
        }
        scope.set_robot_batch_error(batch_id, error).await?;
        Ok(())
    }
}
