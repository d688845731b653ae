//! The transactional store capability.
//!
//! [`ReferenceStore`] hands out [`ReferenceScope`]s: transactional units of
//! work over the repository's entities. All writes within a scope commit or
//! roll back together; dropping a scope without committing rolls back. Scope
//! misuse (commit twice, write after commit) is a programmer error surfaced
//! as [`Error::UnitOfWork`](crate::error::Error::UnitOfWork).
//!
//! Relationship loading uses typed preload sets instead of stringly-typed
//! relationship names; the store decides the join strategy.

use async_trait::async_trait;
use uuid::Uuid;

use crate::decisions::ReferenceDuplicateDecision;
use crate::enhancements::Enhancement;
use crate::error::Result;
use crate::identifiers::{IdentifierKey, LinkedExternalIdentifier};
use crate::imports::{
    ImportBatch, ImportBatchStatus, ImportRecord, ImportRecordStatus, ImportResult,
};
use crate::reference::Reference;
use crate::robots::{
    EnhancementRequest, EnhancementRequestStatus, PendingEnhancement, PendingEnhancementStatus,
    Robot, RobotAutomation, RobotEnhancementBatch,
};

/// Typed preload set for reference loads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReferenceInclude {
    pub identifiers: bool,
    pub enhancements: bool,
    pub duplicate_decision: bool,
    pub duplicate_references: bool,
    pub canonical_reference: bool,
}

impl ReferenceInclude {
    pub const NONE: Self = Self {
        identifiers: false,
        enhancements: false,
        duplicate_decision: false,
        duplicate_references: false,
        canonical_reference: false,
    };

    /// Identifiers and enhancements: the reference's own content.
    pub const CONTENT: Self = Self {
        identifiers: true,
        enhancements: true,
        duplicate_decision: false,
        duplicate_references: false,
        canonical_reference: false,
    };

    /// Everything needed to compute the deduplicated projection.
    pub const DEDUPLICATED: Self = Self {
        identifiers: true,
        enhancements: true,
        duplicate_decision: true,
        duplicate_references: true,
        canonical_reference: false,
    };

    /// Everything, including the canonical redirect.
    pub const FULL: Self = Self {
        identifiers: true,
        enhancements: true,
        duplicate_decision: true,
        duplicate_references: true,
        canonical_reference: true,
    };

    pub const fn with_decision(mut self) -> Self {
        self.duplicate_decision = true;
        self
    }
}

/// Match mode for identifier-based reference lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierMatch {
    /// References sharing any of the given identifiers.
    Any,
}

/// Produces transactional scopes over the reference store.
#[async_trait]
pub trait ReferenceStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn ReferenceScope>>;
}

/// One transactional unit of work.
///
/// Method groups mirror the entity ownership in the data model. Uniqueness
/// violations surface as [`Error::Duplicate`](crate::error::Error::Duplicate)
/// with a best-effort parse of the constraint; primary-key misses surface as
/// [`Error::NotFound`](crate::error::Error::NotFound).
#[allow(clippy::too_many_arguments)]
#[async_trait]
pub trait ReferenceScope: Send {
    async fn commit(&mut self) -> Result<()>;
    async fn rollback(&mut self) -> Result<()>;

    // ========== References ==========

    async fn add_reference(&mut self, reference: &Reference) -> Result<()>;

    /// Idempotent aggregate upsert: replaces the reference row and its
    /// identifiers and enhancements in place.
    async fn merge_reference(&mut self, reference: &Reference) -> Result<()>;

    async fn get_reference(&mut self, id: Uuid, include: ReferenceInclude) -> Result<Reference>;

    async fn get_references(
        &mut self,
        ids: &[Uuid],
        include: ReferenceInclude,
        fail_on_missing: bool,
    ) -> Result<Vec<Reference>>;

    /// Error with the missing ids if any of the given ids do not exist.
    async fn verify_reference_ids(&mut self, ids: &[Uuid]) -> Result<()>;

    async fn all_reference_ids(&mut self) -> Result<Vec<Uuid>>;

    /// References holding any of the given identifiers.
    async fn find_references_with_identifiers(
        &mut self,
        keys: &[IdentifierKey],
        match_mode: IdentifierMatch,
        include: ReferenceInclude,
    ) -> Result<Vec<Reference>>;

    // ========== Identifiers & enhancements ==========

    async fn add_identifier(&mut self, identifier: &LinkedExternalIdentifier) -> Result<()>;

    /// All enhancements with the given ids; errors listing the missing ids
    /// if any are absent.
    async fn get_enhancements(&mut self, ids: &[Uuid]) -> Result<Vec<Enhancement>>;

    // ========== Duplicate decisions ==========

    async fn add_decision(&mut self, decision: &ReferenceDuplicateDecision) -> Result<()>;

    async fn add_decisions(&mut self, decisions: &[ReferenceDuplicateDecision]) -> Result<()>;

    /// Full-row update of an existing decision.
    async fn update_decision(&mut self, decision: &ReferenceDuplicateDecision) -> Result<()>;

    async fn get_decision(&mut self, id: Uuid) -> Result<ReferenceDuplicateDecision>;

    async fn active_decision_for(
        &mut self,
        reference_id: Uuid,
    ) -> Result<Option<ReferenceDuplicateDecision>>;

    /// Active decisions naming `canonical_id` as their canonical.
    async fn active_decisions_pointing_to(
        &mut self,
        canonical_id: Uuid,
    ) -> Result<Vec<ReferenceDuplicateDecision>>;

    /// Deactivate every active decision for a reference except `keep`.
    /// Returns the number of decisions deactivated.
    async fn deactivate_decisions_for(&mut self, reference_id: Uuid, keep: Uuid) -> Result<u64>;

    // ========== Imports ==========

    async fn add_import_record(&mut self, record: &ImportRecord) -> Result<()>;
    async fn get_import_record(&mut self, id: Uuid, with_batches: bool) -> Result<ImportRecord>;
    async fn update_import_record_status(
        &mut self,
        id: Uuid,
        status: ImportRecordStatus,
    ) -> Result<()>;

    async fn add_import_batch(&mut self, batch: &ImportBatch) -> Result<()>;
    async fn get_import_batch(&mut self, id: Uuid, with_results: bool) -> Result<ImportBatch>;
    async fn update_import_batch_status(
        &mut self,
        id: Uuid,
        status: ImportBatchStatus,
    ) -> Result<()>;
    async fn find_import_batches(&mut self, import_record_id: Uuid) -> Result<Vec<ImportBatch>>;

    async fn add_import_result(&mut self, result: &ImportResult) -> Result<()>;
    async fn update_import_result(&mut self, result: &ImportResult) -> Result<()>;
    async fn find_import_results(&mut self, import_batch_id: Uuid) -> Result<Vec<ImportResult>>;

    // ========== Robots & automations ==========

    async fn add_robot(&mut self, robot: &Robot) -> Result<()>;
    async fn get_robot(&mut self, id: Uuid) -> Result<Robot>;
    async fn get_robot_by_name(&mut self, name: &str) -> Result<Robot>;
    async fn update_robot(&mut self, robot: &Robot) -> Result<()>;
    async fn delete_robot(&mut self, id: Uuid) -> Result<()>;
    async fn list_robots(&mut self) -> Result<Vec<Robot>>;

    async fn add_automation(&mut self, automation: &RobotAutomation) -> Result<()>;
    async fn merge_automation(&mut self, automation: &RobotAutomation) -> Result<()>;
    async fn get_automation(&mut self, id: Uuid) -> Result<RobotAutomation>;
    async fn delete_automation(&mut self, id: Uuid) -> Result<()>;
    async fn all_automations(&mut self) -> Result<Vec<RobotAutomation>>;

    // ========== Enhancement requests ==========

    async fn add_enhancement_request(&mut self, request: &EnhancementRequest) -> Result<()>;
    async fn get_enhancement_request(&mut self, id: Uuid) -> Result<EnhancementRequest>;
    async fn update_enhancement_request_status(
        &mut self,
        id: Uuid,
        status: EnhancementRequestStatus,
    ) -> Result<()>;
    /// Statuses of all pending enhancements linked to the request.
    async fn pending_statuses_for_request(
        &mut self,
        request_id: Uuid,
    ) -> Result<Vec<PendingEnhancementStatus>>;

    // ========== Pending enhancements ==========

    async fn add_pending_enhancements(
        &mut self,
        pending: &[PendingEnhancement],
    ) -> Result<()>;

    async fn get_pending_enhancement(&mut self, id: Uuid) -> Result<PendingEnhancement>;

    /// Pending, unbatched enhancements for a robot, oldest first.
    async fn find_pending_for_robot(
        &mut self,
        robot_id: Uuid,
        limit: usize,
    ) -> Result<Vec<PendingEnhancement>>;

    async fn find_pending_by_batch(&mut self, batch_id: Uuid)
        -> Result<Vec<PendingEnhancement>>;

    async fn update_pending_status(
        &mut self,
        ids: &[Uuid],
        status: PendingEnhancementStatus,
    ) -> Result<u64>;

    /// Move the given pending enhancements to `Processing`, binding them to
    /// the batch and stamping the lease expiry.
    async fn lease_pending(
        &mut self,
        ids: &[Uuid],
        batch_id: Uuid,
        expires_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<u64>;

    /// Extend the lease of a batch's still-`Processing` pending
    /// enhancements. Expired ones are not resurrected.
    async fn renew_leases(
        &mut self,
        batch_id: Uuid,
        expires_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<u64>;

    /// Atomically move `Processing` pending enhancements whose lease has
    /// lapsed to `Expired`, returning the affected rows.
    async fn expire_stale_pending(
        &mut self,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<PendingEnhancement>>;

    /// Retry depth of a pending enhancement: the number of `retry_of` hops
    /// back to the original.
    async fn retry_depth(&mut self, pending_id: Uuid) -> Result<u32>;

    // ========== Robot enhancement batches ==========

    async fn add_robot_batch(&mut self, batch: &RobotEnhancementBatch) -> Result<()>;
    async fn get_robot_batch(
        &mut self,
        id: Uuid,
        with_pending: bool,
    ) -> Result<RobotEnhancementBatch>;
    /// Record the reference-data and pre-allocated result file handles.
    async fn set_robot_batch_files(
        &mut self,
        id: Uuid,
        reference_data_file: &crate::blob::BlobFile,
        result_file: &crate::blob::BlobFile,
    ) -> Result<()>;
    async fn set_robot_batch_validation_file(
        &mut self,
        id: Uuid,
        validation_result_file: &crate::blob::BlobFile,
    ) -> Result<()>;
    async fn set_robot_batch_error(&mut self, id: Uuid, error: &str) -> Result<()>;
}
