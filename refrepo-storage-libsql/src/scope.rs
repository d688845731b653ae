//! Transactional scope over one libSQL connection.
//!
//! A scope owns its connection: `BEGIN` runs when the scope opens, `COMMIT`
//! and `ROLLBACK` are explicit, and dropping an unfinished scope drops the
//! connection, which discards the open transaction. Reuse after commit or
//! rollback is a programmer error.

use async_trait::async_trait;
use libsql::Connection;
use uuid::Uuid;

use refrepo_core::blob::BlobFile;
use refrepo_core::decisions::ReferenceDuplicateDecision;
use refrepo_core::enhancements::Enhancement;
use refrepo_core::error::{Error, Result};
use refrepo_core::identifiers::{IdentifierKey, LinkedExternalIdentifier};
use refrepo_core::imports::{
    ImportBatch, ImportBatchStatus, ImportRecord, ImportRecordStatus, ImportResult,
};
use refrepo_core::reference::Reference;
use refrepo_core::robots::{
    EnhancementRequest, EnhancementRequestStatus, PendingEnhancement, PendingEnhancementStatus,
    Robot, RobotAutomation, RobotEnhancementBatch,
};
use refrepo_core::store::{IdentifierMatch, ReferenceInclude, ReferenceScope};

/// One unit of work over the reference store.
pub struct LibsqlScope {
    pub(crate) conn: Connection,
    open: bool,
}

impl LibsqlScope {
    pub(crate) async fn begin(conn: Connection) -> Result<Self> {
        conn.execute("BEGIN", ())
            .await
            .map_err(|e| Error::Store(format!("failed to begin transaction: {e}")))?;
        Ok(Self { conn, open: true })
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(Error::UnitOfWork(
                "scope used after commit or rollback".to_string(),
            ))
        }
    }

    /// Map a libSQL error, parsing uniqueness violations into
    /// [`Error::Duplicate`] with the constraint name where possible.
    pub(crate) fn map_store_error(
        entity: &'static str,
        context: &str,
        error: &libsql::Error,
    ) -> Error {
        let message = error.to_string();
        if message.contains("UNIQUE constraint failed") {
            let constraint = message
                .split("UNIQUE constraint failed:")
                .nth(1)
                .map(str::trim)
                .unwrap_or("unknown constraint");
            return Error::Duplicate {
                entity,
                detail: constraint.to_string(),
            };
        }
        Error::Store(format!("{context}: {message}"))
    }
}

// ============================================================================
// Timestamp and value helpers shared by the entity modules
// ============================================================================

pub(crate) fn to_micros(ts: chrono::DateTime<chrono::Utc>) -> i64 {
    ts.timestamp_micros()
}

pub(crate) fn from_micros(micros: i64) -> Result<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| Error::Store(format!("invalid stored timestamp: {micros}")))
}

pub(crate) fn parse_uuid(raw: &str) -> Result<Uuid> {
    raw.parse()
        .map_err(|_| Error::Store(format!("invalid stored uuid: {raw}")))
}

pub(crate) fn parse_opt_uuid(raw: Option<String>) -> Result<Option<Uuid>> {
    raw.map(|s| parse_uuid(&s)).transpose()
}

pub(crate) fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

pub(crate) fn from_json<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T> {
    Ok(serde_json::from_str(raw)?)
}

/// Placeholder list `?, ?, ...` for an `IN` clause of the given arity.
pub(crate) fn placeholders(count: usize) -> String {
    std::iter::repeat_n("?", count).collect::<Vec<_>>().join(", ")
}

/// Serialize a unit-variant enum to its bare serde name (no quotes).
pub(crate) fn enum_to_string<T: serde::Serialize>(value: &T) -> Result<String> {
    let json = serde_json::to_string(value)?;
    Ok(json.trim_matches('"').to_string())
}

/// Parse a unit-variant enum from its bare serde name.
pub(crate) fn enum_from_string<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T> {
    Ok(serde_json::from_str(&format!("\"{raw}\""))?)
}

#[async_trait]
impl ReferenceScope for LibsqlScope {
    async fn commit(&mut self) -> Result<()> {
        self.check_open()?;
        self.open = false;
        self.conn
            .execute("COMMIT", ())
            .await
            .map_err(|e| Error::Store(format!("failed to commit: {e}")))?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.check_open()?;
        self.open = false;
        self.conn
            .execute("ROLLBACK", ())
            .await
            .map_err(|e| Error::Store(format!("failed to roll back: {e}")))?;
        Ok(())
    }

    // ========== References ==========

    async fn add_reference(&mut self, reference: &Reference) -> Result<()> {
        self.check_open()?;
        self.insert_reference(reference).await
    }

    async fn merge_reference(&mut self, reference: &Reference) -> Result<()> {
        self.check_open()?;
        self.merge_reference_aggregate(reference).await
    }

    async fn get_reference(&mut self, id: Uuid, include: ReferenceInclude) -> Result<Reference> {
        self.check_open()?;
        self.load_reference(id, include).await
    }

    async fn get_references(
        &mut self,
        ids: &[Uuid],
        include: ReferenceInclude,
        fail_on_missing: bool,
    ) -> Result<Vec<Reference>> {
        self.check_open()?;
        self.load_references(ids, include, fail_on_missing).await
    }

    async fn verify_reference_ids(&mut self, ids: &[Uuid]) -> Result<()> {
        self.check_open()?;
        self.verify_reference_ids_exist(ids).await
    }

    async fn all_reference_ids(&mut self) -> Result<Vec<Uuid>> {
        self.check_open()?;
        self.select_all_reference_ids().await
    }

    async fn find_references_with_identifiers(
        &mut self,
        keys: &[IdentifierKey],
        match_mode: IdentifierMatch,
        include: ReferenceInclude,
    ) -> Result<Vec<Reference>> {
        self.check_open()?;
        self.find_by_identifiers(keys, match_mode, include).await
    }

    // ========== Identifiers & enhancements ==========

    async fn add_identifier(&mut self, identifier: &LinkedExternalIdentifier) -> Result<()> {
        self.check_open()?;
        self.insert_identifier(identifier).await
    }

    async fn get_enhancements(&mut self, ids: &[Uuid]) -> Result<Vec<Enhancement>> {
        self.check_open()?;
        self.load_enhancements(ids).await
    }

    // ========== Duplicate decisions ==========

    async fn add_decision(&mut self, decision: &ReferenceDuplicateDecision) -> Result<()> {
        self.check_open()?;
        self.insert_decision(decision).await
    }

    async fn add_decisions(&mut self, decisions: &[ReferenceDuplicateDecision]) -> Result<()> {
        self.check_open()?;
        for decision in decisions {
            self.insert_decision(decision).await?;
        }
        Ok(())
    }

    async fn update_decision(&mut self, decision: &ReferenceDuplicateDecision) -> Result<()> {
        self.check_open()?;
        self.update_decision_row(decision).await
    }

    async fn get_decision(&mut self, id: Uuid) -> Result<ReferenceDuplicateDecision> {
        self.check_open()?;
        self.load_decision(id).await
    }

    async fn active_decision_for(
        &mut self,
        reference_id: Uuid,
    ) -> Result<Option<ReferenceDuplicateDecision>> {
        self.check_open()?;
        self.load_active_decision(reference_id).await
    }

    async fn active_decisions_pointing_to(
        &mut self,
        canonical_id: Uuid,
    ) -> Result<Vec<ReferenceDuplicateDecision>> {
        self.check_open()?;
        self.load_decisions_pointing_to(canonical_id).await
    }

    async fn deactivate_decisions_for(&mut self, reference_id: Uuid, keep: Uuid) -> Result<u64> {
        self.check_open()?;
        self.deactivate_other_decisions(reference_id, keep).await
    }

    // ========== Imports ==========

    async fn add_import_record(&mut self, record: &ImportRecord) -> Result<()> {
        self.check_open()?;
        self.insert_import_record(record).await
    }

    async fn get_import_record(&mut self, id: Uuid, with_batches: bool) -> Result<ImportRecord> {
        self.check_open()?;
        self.load_import_record(id, with_batches).await
    }

    async fn update_import_record_status(
        &mut self,
        id: Uuid,
        status: ImportRecordStatus,
    ) -> Result<()> {
        self.check_open()?;
        self.set_import_record_status(id, status).await
    }

    async fn add_import_batch(&mut self, batch: &ImportBatch) -> Result<()> {
        self.check_open()?;
        self.insert_import_batch(batch).await
    }

    async fn get_import_batch(&mut self, id: Uuid, with_results: bool) -> Result<ImportBatch> {
        self.check_open()?;
        self.load_import_batch(id, with_results).await
    }

    async fn update_import_batch_status(
        &mut self,
        id: Uuid,
        status: ImportBatchStatus,
    ) -> Result<()> {
        self.check_open()?;
        self.set_import_batch_status(id, status).await
    }

    async fn find_import_batches(&mut self, import_record_id: Uuid) -> Result<Vec<ImportBatch>> {
        self.check_open()?;
        self.load_import_batches_for_record(import_record_id).await
    }

    async fn add_import_result(&mut self, result: &ImportResult) -> Result<()> {
        self.check_open()?;
        self.insert_import_result(result).await
    }

    async fn update_import_result(&mut self, result: &ImportResult) -> Result<()> {
        self.check_open()?;
        self.update_import_result_row(result).await
    }

    async fn find_import_results(&mut self, import_batch_id: Uuid) -> Result<Vec<ImportResult>> {
        self.check_open()?;
        self.load_import_results(import_batch_id).await
    }

    // ========== Robots & automations ==========

    async fn add_robot(&mut self, robot: &Robot) -> Result<()> {
        self.check_open()?;
        self.insert_robot(robot).await
    }

    async fn get_robot(&mut self, id: Uuid) -> Result<Robot> {
        self.check_open()?;
        self.load_robot(id).await
    }

    async fn get_robot_by_name(&mut self, name: &str) -> Result<Robot> {
        self.check_open()?;
        self.load_robot_by_name(name).await
    }

    async fn update_robot(&mut self, robot: &Robot) -> Result<()> {
        self.check_open()?;
        self.update_robot_row(robot).await
    }

    async fn delete_robot(&mut self, id: Uuid) -> Result<()> {
        self.check_open()?;
        self.delete_robot_row(id).await
    }

    async fn list_robots(&mut self) -> Result<Vec<Robot>> {
        self.check_open()?;
        self.load_all_robots().await
    }

    async fn add_automation(&mut self, automation: &RobotAutomation) -> Result<()> {
        self.check_open()?;
        self.insert_automation(automation).await
    }

    async fn merge_automation(&mut self, automation: &RobotAutomation) -> Result<()> {
        self.check_open()?;
        self.merge_automation_row(automation).await
    }

    async fn get_automation(&mut self, id: Uuid) -> Result<RobotAutomation> {
        self.check_open()?;
        self.load_automation(id).await
    }

    async fn delete_automation(&mut self, id: Uuid) -> Result<()> {
        self.check_open()?;
        self.delete_automation_row(id).await
    }

    async fn all_automations(&mut self) -> Result<Vec<RobotAutomation>> {
        self.check_open()?;
        self.load_all_automations().await
    }

    // ========== Enhancement requests ==========

    async fn add_enhancement_request(&mut self, request: &EnhancementRequest) -> Result<()> {
        self.check_open()?;
        self.insert_enhancement_request(request).await
    }

    async fn get_enhancement_request(&mut self, id: Uuid) -> Result<EnhancementRequest> {
        self.check_open()?;
        self.load_enhancement_request(id).await
    }

    async fn update_enhancement_request_status(
        &mut self,
        id: Uuid,
        status: EnhancementRequestStatus,
    ) -> Result<()> {
        self.check_open()?;
        self.set_enhancement_request_status(id, status).await
    }

    async fn pending_statuses_for_request(
        &mut self,
        request_id: Uuid,
    ) -> Result<Vec<PendingEnhancementStatus>> {
        self.check_open()?;
        self.load_pending_statuses_for_request(request_id).await
    }

    // ========== Pending enhancements ==========

    async fn add_pending_enhancements(&mut self, pending: &[PendingEnhancement]) -> Result<()> {
        self.check_open()?;
        for p in pending {
            self.insert_pending_enhancement(p).await?;
        }
        Ok(())
    }

    async fn get_pending_enhancement(&mut self, id: Uuid) -> Result<PendingEnhancement> {
        self.check_open()?;
        self.load_pending_enhancement(id).await
    }

    async fn find_pending_for_robot(
        &mut self,
        robot_id: Uuid,
        limit: usize,
    ) -> Result<Vec<PendingEnhancement>> {
        self.check_open()?;
        self.load_pending_for_robot(robot_id, limit).await
    }

    async fn find_pending_by_batch(
        &mut self,
        batch_id: Uuid,
    ) -> Result<Vec<PendingEnhancement>> {
        self.check_open()?;
        self.load_pending_by_batch(batch_id).await
    }

    async fn update_pending_status(
        &mut self,
        ids: &[Uuid],
        status: PendingEnhancementStatus,
    ) -> Result<u64> {
        self.check_open()?;
        self.set_pending_status(ids, status).await
    }

    async fn lease_pending(
        &mut self,
        ids: &[Uuid],
        batch_id: Uuid,
        expires_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<u64> {
        self.check_open()?;
        self.lease_pending_rows(ids, batch_id, expires_at).await
    }

    async fn renew_leases(
        &mut self,
        batch_id: Uuid,
        expires_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<u64> {
        self.check_open()?;
        self.renew_batch_leases(batch_id, expires_at).await
    }

    async fn expire_stale_pending(
        &mut self,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<PendingEnhancement>> {
        self.check_open()?;
        self.expire_stale_rows(now).await
    }

    async fn retry_depth(&mut self, pending_id: Uuid) -> Result<u32> {
        self.check_open()?;
        self.count_retry_depth(pending_id).await
    }

    // ========== Robot enhancement batches ==========

    async fn add_robot_batch(&mut self, batch: &RobotEnhancementBatch) -> Result<()> {
        self.check_open()?;
        self.insert_robot_batch(batch).await
    }

    async fn get_robot_batch(
        &mut self,
        id: Uuid,
        with_pending: bool,
    ) -> Result<RobotEnhancementBatch> {
        self.check_open()?;
        self.load_robot_batch(id, with_pending).await
    }

    async fn set_robot_batch_files(
        &mut self,
        id: Uuid,
        reference_data_file: &BlobFile,
        result_file: &BlobFile,
    ) -> Result<()> {
        self.check_open()?;
        self.update_robot_batch_files(id, reference_data_file, result_file)
            .await
    }

    async fn set_robot_batch_validation_file(
        &mut self,
        id: Uuid,
        validation_result_file: &BlobFile,
    ) -> Result<()> {
        self.check_open()?;
        self.update_robot_batch_validation_file(id, validation_result_file)
            .await
    }

    async fn set_robot_batch_error(&mut self, id: Uuid, error: &str) -> Result<()> {
        self.check_open()?;
        self.update_robot_batch_error(id, error).await
    }
}
