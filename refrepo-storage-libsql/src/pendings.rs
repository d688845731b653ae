//! Pending enhancement persistence: the robot work queue.

use libsql::{params, params_from_iter, Row};
use uuid::Uuid;

use refrepo_core::error::{Error, Result};
use refrepo_core::robots::{PendingEnhancement, PendingEnhancementStatus};

use crate::scope::{
    enum_from_string, enum_to_string, from_micros, parse_opt_uuid, parse_uuid, placeholders,
    to_micros, LibsqlScope,
};

const PENDING_COLUMNS: &str = "id, reference_id, robot_id, enhancement_request_id, \
     robot_enhancement_batch_id, source, status, expires_at, retry_of, \
     created_at, updated_at";

impl LibsqlScope {
    pub(crate) async fn insert_pending_enhancement(
        &self,
        pending: &PendingEnhancement,
    ) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO pending_enhancements ({PENDING_COLUMNS})
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
                ),
                params![
                    pending.id.to_string(),
                    pending.reference_id.to_string(),
                    pending.robot_id.to_string(),
                    pending.enhancement_request_id.map(|id| id.to_string()),
                    pending.robot_enhancement_batch_id.map(|id| id.to_string()),
                    pending.source.clone(),
                    enum_to_string(&pending.status)?,
                    pending.expires_at.map(to_micros),
                    pending.retry_of.map(|id| id.to_string()),
                    to_micros(pending.created_at),
                    to_micros(pending.updated_at),
                ],
            )
            .await
            .map_err(|e| Self::map_store_error("PendingEnhancement", "failed to insert", &e))?;
        Ok(())
    }

    pub(crate) async fn load_pending_enhancement(&self, id: Uuid) -> Result<PendingEnhancement> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {PENDING_COLUMNS} FROM pending_enhancements WHERE id = ?"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| Self::map_store_error("PendingEnhancement", "failed to query", &e))?;
        let row = rows
            .next()
            .await
            .map_err(|e| Self::map_store_error("PendingEnhancement", "failed to fetch row", &e))?
            .ok_or(Error::NotFound {
                entity: "PendingEnhancement",
                id,
            })?;
        Self::row_to_pending(&row)
    }

    /// Pending, unbatched work for a robot, oldest first.
    pub(crate) async fn load_pending_for_robot(
        &self,
        robot_id: Uuid,
        limit: usize,
    ) -> Result<Vec<PendingEnhancement>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {PENDING_COLUMNS} FROM pending_enhancements
                     WHERE robot_id = ? AND status = 'pending'
                       AND robot_enhancement_batch_id IS NULL
                     ORDER BY created_at, id
                     LIMIT ?"
                ),
                params![robot_id.to_string(), limit as i64],
            )
            .await
            .map_err(|e| Self::map_store_error("PendingEnhancement", "failed to query", &e))?;
        let mut pending = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| Self::map_store_error("PendingEnhancement", "failed to fetch row", &e))?
        {
            pending.push(Self::row_to_pending(&row)?);
        }
        Ok(pending)
    }

    pub(crate) async fn load_pending_by_batch(
        &self,
        batch_id: Uuid,
    ) -> Result<Vec<PendingEnhancement>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {PENDING_COLUMNS} FROM pending_enhancements
                     WHERE robot_enhancement_batch_id = ?
                     ORDER BY created_at, id"
                ),
                params![batch_id.to_string()],
            )
            .await
            .map_err(|e| Self::map_store_error("PendingEnhancement", "failed to query", &e))?;
        let mut pending = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| Self::map_store_error("PendingEnhancement", "failed to fetch row", &e))?
        {
            pending.push(Self::row_to_pending(&row)?);
        }
        Ok(pending)
    }

    pub(crate) async fn load_pending_statuses_for_request(
        &self,
        request_id: Uuid,
    ) -> Result<Vec<PendingEnhancementStatus>> {
        let mut rows = self
            .conn
            .query(
                "SELECT status FROM pending_enhancements WHERE enhancement_request_id = ?",
                params![request_id.to_string()],
            )
            .await
            .map_err(|e| Self::map_store_error("PendingEnhancement", "failed to query", &e))?;
        let mut statuses = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| Self::map_store_error("PendingEnhancement", "failed to fetch row", &e))?
        {
            let status: String = row
                .get(0)
                .map_err(|e| Error::Store(format!("failed to read status: {e}")))?;
            statuses.push(enum_from_string(&status)?);
        }
        Ok(statuses)
    }

    pub(crate) async fn set_pending_status(
        &self,
        ids: &[Uuid],
        status: PendingEnhancementStatus,
    ) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE pending_enhancements SET status = ?, updated_at = ?
             WHERE id IN ({})",
            placeholders(ids.len())
        );
        let mut bindings: Vec<libsql::Value> = vec![
            libsql::Value::Text(enum_to_string(&status)?),
            libsql::Value::Integer(to_micros(chrono::Utc::now())),
        ];
        bindings.extend(ids.iter().map(|id| libsql::Value::Text(id.to_string())));
        let affected = self
            .conn
            .execute(&sql, params_from_iter(bindings))
            .await
            .map_err(|e| {
                Self::map_store_error("PendingEnhancement", "failed to update status", &e)
            })?;
        Ok(affected)
    }

    pub(crate) async fn lease_pending_rows(
        &self,
        ids: &[Uuid],
        batch_id: Uuid,
        expires_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE pending_enhancements SET
                 status = 'processing',
                 robot_enhancement_batch_id = ?,
                 expires_at = ?,
                 updated_at = ?
             WHERE id IN ({}) AND status = 'pending'",
            placeholders(ids.len())
        );
        let mut bindings: Vec<libsql::Value> = vec![
            libsql::Value::Text(batch_id.to_string()),
            libsql::Value::Integer(to_micros(expires_at)),
            libsql::Value::Integer(to_micros(chrono::Utc::now())),
        ];
        bindings.extend(ids.iter().map(|id| libsql::Value::Text(id.to_string())));
        let affected = self
            .conn
            .execute(&sql, params_from_iter(bindings))
            .await
            .map_err(|e| Self::map_store_error("PendingEnhancement", "failed to lease", &e))?;
        Ok(affected)
    }

    /// A lapsed lease is owned by the sweep; renewal deliberately skips
    /// anything no longer `processing`.
    pub(crate) async fn renew_batch_leases(
        &self,
        batch_id: Uuid,
        expires_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<u64> {
        let affected = self
            .conn
            .execute(
                "UPDATE pending_enhancements SET expires_at = ?, updated_at = ?
                 WHERE robot_enhancement_batch_id = ? AND status = 'processing'",
                params![
                    to_micros(expires_at),
                    to_micros(chrono::Utc::now()),
                    batch_id.to_string(),
                ],
            )
            .await
            .map_err(|e| Self::map_store_error("PendingEnhancement", "failed to renew", &e))?;
        Ok(affected)
    }

    /// Select-then-update inside the scope's transaction, so the sweep is
    /// atomic with respect to concurrent renewals.
    pub(crate) async fn expire_stale_rows(
        &self,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<PendingEnhancement>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {PENDING_COLUMNS} FROM pending_enhancements
                     WHERE status = 'processing' AND expires_at IS NOT NULL
                       AND expires_at <= ?
                     ORDER BY created_at, id"
                ),
                params![to_micros(now)],
            )
            .await
            .map_err(|e| Self::map_store_error("PendingEnhancement", "failed to query", &e))?;
        let mut stale = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| Self::map_store_error("PendingEnhancement", "failed to fetch row", &e))?
        {
            stale.push(Self::row_to_pending(&row)?);
        }
        if stale.is_empty() {
            return Ok(stale);
        }
        let ids: Vec<Uuid> = stale.iter().map(|p| p.id).collect();
        self.set_pending_status(&ids, PendingEnhancementStatus::Expired)
            .await?;
        for pending in &mut stale {
            pending.status = PendingEnhancementStatus::Expired;
        }
        Ok(stale)
    }

    /// Walk the `retry_of` chain back to the original.
    pub(crate) async fn count_retry_depth(&self, pending_id: Uuid) -> Result<u32> {
        let mut depth = 0u32;
        let mut current = pending_id;
        loop {
            let mut rows = self
                .conn
                .query(
                    "SELECT retry_of FROM pending_enhancements WHERE id = ?",
                    params![current.to_string()],
                )
                .await
                .map_err(|e| Self::map_store_error("PendingEnhancement", "failed to query", &e))?;
            let row = rows
                .next()
                .await
                .map_err(|e| {
                    Self::map_store_error("PendingEnhancement", "failed to fetch row", &e)
                })?
                .ok_or(Error::NotFound {
                    entity: "PendingEnhancement",
                    id: current,
                })?;
            let retry_of: Option<String> = row.get(0).ok();
            match parse_opt_uuid(retry_of)? {
                Some(parent) => {
                    depth += 1;
                    current = parent;
                }
                None => return Ok(depth),
            }
        }
    }

    fn row_to_pending(row: &Row) -> Result<PendingEnhancement> {
        let id: String = row
            .get(0)
            .map_err(|e| Error::Store(format!("failed to read id: {e}")))?;
        let reference_id: String = row
            .get(1)
            .map_err(|e| Error::Store(format!("failed to read reference_id: {e}")))?;
        let robot_id: String = row
            .get(2)
            .map_err(|e| Error::Store(format!("failed to read robot_id: {e}")))?;
        let enhancement_request_id: Option<String> = row.get(3).ok();
        let robot_enhancement_batch_id: Option<String> = row.get(4).ok();
        let source: Option<String> = row.get(5).ok();
        let status: String = row
            .get(6)
            .map_err(|e| Error::Store(format!("failed to read status: {e}")))?;
        let expires_at: Option<i64> = row.get(7).ok();
        let retry_of: Option<String> = row.get(8).ok();
        let created_at: i64 = row
            .get(9)
            .map_err(|e| Error::Store(format!("failed to read created_at: {e}")))?;
        let updated_at: i64 = row
            .get(10)
            .map_err(|e| Error::Store(format!("failed to read updated_at: {e}")))?;
        Ok(PendingEnhancement {
            id: parse_uuid(&id)?,
            reference_id: parse_uuid(&reference_id)?,
            robot_id: parse_uuid(&robot_id)?,
            enhancement_request_id: parse_opt_uuid(enhancement_request_id)?,
            robot_enhancement_batch_id: parse_opt_uuid(robot_enhancement_batch_id)?,
            source,
            status: enum_from_string(&status)?,
            expires_at: expires_at.map(from_micros).transpose()?,
            retry_of: parse_opt_uuid(retry_of)?,
            created_at: from_micros(created_at)?,
            updated_at: from_micros(updated_at)?,
        })
    }
}
