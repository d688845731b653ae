//! Duplicate decision persistence.

use libsql::{params, Row};
use uuid::Uuid;

use refrepo_core::decisions::ReferenceDuplicateDecision;
use refrepo_core::error::{Error, Result};

use crate::scope::{
    enum_from_string, enum_to_string, from_json, from_micros, parse_opt_uuid, parse_uuid, to_json,
    to_micros, LibsqlScope,
};

const DECISION_COLUMNS: &str = "id, reference_id, duplicate_determination, fingerprint, \
     candidate_canonical_ids, canonical_reference_id, active_decision, detail, \
     created_at, updated_at";

impl LibsqlScope {
    pub(crate) async fn insert_decision(
        &self,
        decision: &ReferenceDuplicateDecision,
    ) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO reference_duplicate_decisions ({DECISION_COLUMNS})
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
                ),
                params![
                    decision.id.to_string(),
                    decision.reference_id.to_string(),
                    enum_to_string(&decision.duplicate_determination)?,
                    decision.fingerprint.as_ref().map(to_json).transpose()?,
                    to_json(&decision.candidate_canonical_ids)?,
                    decision.canonical_reference_id.map(|id| id.to_string()),
                    i64::from(decision.active_decision),
                    decision.detail.clone(),
                    to_micros(decision.created_at),
                    to_micros(decision.updated_at),
                ],
            )
            .await
            .map_err(|e| {
                Self::map_store_error(
                    "ReferenceDuplicateDecision",
                    "failed to insert decision",
                    &e,
                )
            })?;
        Ok(())
    }

    pub(crate) async fn update_decision_row(
        &self,
        decision: &ReferenceDuplicateDecision,
    ) -> Result<()> {
        let affected = self
            .conn
            .execute(
                "UPDATE reference_duplicate_decisions SET
                     duplicate_determination = ?,
                     fingerprint = ?,
                     candidate_canonical_ids = ?,
                     canonical_reference_id = ?,
                     active_decision = ?,
                     detail = ?,
                     updated_at = ?
                 WHERE id = ?",
                params![
                    enum_to_string(&decision.duplicate_determination)?,
                    decision.fingerprint.as_ref().map(to_json).transpose()?,
                    to_json(&decision.candidate_canonical_ids)?,
                    decision.canonical_reference_id.map(|id| id.to_string()),
                    i64::from(decision.active_decision),
                    decision.detail.clone(),
                    to_micros(chrono::Utc::now()),
                    decision.id.to_string(),
                ],
            )
            .await
            .map_err(|e| {
                Self::map_store_error(
                    "ReferenceDuplicateDecision",
                    "failed to update decision",
                    &e,
                )
            })?;
        if affected == 0 {
            return Err(Error::NotFound {
                entity: "ReferenceDuplicateDecision",
                id: decision.id,
            });
        }
        Ok(())
    }

    pub(crate) async fn load_decision(&self, id: Uuid) -> Result<ReferenceDuplicateDecision> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {DECISION_COLUMNS} FROM reference_duplicate_decisions WHERE id = ?"
                ),
                params![id.to_string()],
            )
            .await
            .map_err(|e| {
                Self::map_store_error("ReferenceDuplicateDecision", "failed to query", &e)
            })?;
        let row = rows
            .next()
            .await
            .map_err(|e| {
                Self::map_store_error("ReferenceDuplicateDecision", "failed to fetch row", &e)
            })?
            .ok_or(Error::NotFound {
                entity: "ReferenceDuplicateDecision",
                id,
            })?;
        Self::row_to_decision(&row)
    }

    pub(crate) async fn load_active_decision(
        &self,
        reference_id: Uuid,
    ) -> Result<Option<ReferenceDuplicateDecision>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {DECISION_COLUMNS} FROM reference_duplicate_decisions
                     WHERE reference_id = ? AND active_decision = 1"
                ),
                params![reference_id.to_string()],
            )
            .await
            .map_err(|e| {
                Self::map_store_error("ReferenceDuplicateDecision", "failed to query", &e)
            })?;
        rows.next()
            .await
            .map_err(|e| {
                Self::map_store_error("ReferenceDuplicateDecision", "failed to fetch row", &e)
            })?
            .map(|row| Self::row_to_decision(&row))
            .transpose()
    }

    pub(crate) async fn load_decisions_pointing_to(
        &self,
        canonical_id: Uuid,
    ) -> Result<Vec<ReferenceDuplicateDecision>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {DECISION_COLUMNS} FROM reference_duplicate_decisions
                     WHERE canonical_reference_id = ? AND active_decision = 1
                     ORDER BY created_at, id"
                ),
                params![canonical_id.to_string()],
            )
            .await
            .map_err(|e| {
                Self::map_store_error("ReferenceDuplicateDecision", "failed to query", &e)
            })?;
        let mut decisions = Vec::new();
        while let Some(row) = rows.next().await.map_err(|e| {
            Self::map_store_error("ReferenceDuplicateDecision", "failed to fetch row", &e)
        })? {
            decisions.push(Self::row_to_decision(&row)?);
        }
        Ok(decisions)
    }

    pub(crate) async fn deactivate_other_decisions(
        &self,
        reference_id: Uuid,
        keep: Uuid,
    ) -> Result<u64> {
        let affected = self
            .conn
            .execute(
                "UPDATE reference_duplicate_decisions
                 SET active_decision = 0, updated_at = ?
                 WHERE reference_id = ? AND active_decision = 1 AND id != ?",
                params![
                    to_micros(chrono::Utc::now()),
                    reference_id.to_string(),
                    keep.to_string(),
                ],
            )
            .await
            .map_err(|e| {
                Self::map_store_error("ReferenceDuplicateDecision", "failed to deactivate", &e)
            })?;
        Ok(affected)
    }

    fn row_to_decision(row: &Row) -> Result<ReferenceDuplicateDecision> {
        let id: String = row
            .get(0)
            .map_err(|e| Error::Store(format!("failed to read id: {e}")))?;
        let reference_id: String = row
            .get(1)
            .map_err(|e| Error::Store(format!("failed to read reference_id: {e}")))?;
        let determination: String = row
            .get(2)
            .map_err(|e| Error::Store(format!("failed to read determination: {e}")))?;
        let fingerprint: Option<String> = row.get(3).ok();
        let candidate_ids: String = row
            .get(4)
            .map_err(|e| Error::Store(format!("failed to read candidates: {e}")))?;
        let canonical_reference_id: Option<String> = row.get(5).ok();
        let active: i64 = row
            .get(6)
            .map_err(|e| Error::Store(format!("failed to read active_decision: {e}")))?;
        let detail: Option<String> = row.get(7).ok();
        let created_at: i64 = row
            .get(8)
            .map_err(|e| Error::Store(format!("failed to read created_at: {e}")))?;
        let updated_at: i64 = row
            .get(9)
            .map_err(|e| Error::Store(format!("failed to read updated_at: {e}")))?;
        Ok(ReferenceDuplicateDecision {
            id: parse_uuid(&id)?,
            reference_id: parse_uuid(&reference_id)?,
            duplicate_determination: enum_from_string(&determination)?,
            fingerprint: fingerprint.map(|raw| from_json(&raw)).transpose()?,
            candidate_canonical_ids: from_json(&candidate_ids)?,
            canonical_reference_id: parse_opt_uuid(canonical_reference_id)?,
            active_decision: active != 0,
            detail,
            created_at: from_micros(created_at)?,
            updated_at: from_micros(updated_at)?,
        })
    }
}
