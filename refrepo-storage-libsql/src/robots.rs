//! Robot, automation, request and batch persistence.

use libsql::{params, Row};
use uuid::Uuid;

use refrepo_core::blob::BlobFile;
use refrepo_core::error::{Error, Result};
use refrepo_core::robots::{
    EnhancementRequest, EnhancementRequestStatus, Robot, RobotAutomation, RobotEnhancementBatch,
};

use crate::scope::{
    enum_from_string, enum_to_string, from_json, from_micros, parse_uuid, to_json, to_micros,
    LibsqlScope,
};

impl LibsqlScope {
    // ========== Robots ==========

    pub(crate) async fn insert_robot(&self, robot: &Robot) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO robots
                 (id, name, base_url, description, owner, client_secret,
                  created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    robot.id.to_string(),
                    robot.name.clone(),
                    robot.base_url.clone(),
                    robot.description.clone(),
                    robot.owner.clone(),
                    robot.client_secret.clone(),
                    to_micros(robot.created_at),
                    to_micros(robot.updated_at),
                ],
            )
            .await
            .map_err(|e| Self::map_store_error("Robot", "failed to insert", &e))?;
        Ok(())
    }

    pub(crate) async fn load_robot(&self, id: Uuid) -> Result<Robot> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, base_url, description, owner, client_secret,
                        created_at, updated_at
                 FROM robots WHERE id = ?",
                params![id.to_string()],
            )
            .await
            .map_err(|e| Self::map_store_error("Robot", "failed to query", &e))?;
        let row = rows
            .next()
            .await
            .map_err(|e| Self::map_store_error("Robot", "failed to fetch row", &e))?
            .ok_or(Error::NotFound {
                entity: "Robot",
                id,
            })?;
        Self::row_to_robot(&row)
    }

    pub(crate) async fn load_robot_by_name(&self, name: &str) -> Result<Robot> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, base_url, description, owner, client_secret,
                        created_at, updated_at
                 FROM robots WHERE name = ?",
                params![name],
            )
            .await
            .map_err(|e| Self::map_store_error("Robot", "failed to query", &e))?;
        let row = rows
            .next()
            .await
            .map_err(|e| Self::map_store_error("Robot", "failed to fetch row", &e))?
            .ok_or_else(|| Error::NotFoundBy {
                entity: "Robot",
                lookup: "name",
                value: name.to_string(),
            })?;
        Self::row_to_robot(&row)
    }

    pub(crate) async fn update_robot_row(&self, robot: &Robot) -> Result<()> {
        let affected = self
            .conn
            .execute(
                "UPDATE robots SET
                     name = ?, base_url = ?, description = ?, owner = ?,
                     client_secret = ?, updated_at = ?
                 WHERE id = ?",
                params![
                    robot.name.clone(),
                    robot.base_url.clone(),
                    robot.description.clone(),
                    robot.owner.clone(),
                    robot.client_secret.clone(),
                    to_micros(chrono::Utc::now()),
                    robot.id.to_string(),
                ],
            )
            .await
            .map_err(|e| Self::map_store_error("Robot", "failed to update", &e))?;
        if affected == 0 {
            return Err(Error::NotFound {
                entity: "Robot",
                id: robot.id,
            });
        }
        Ok(())
    }

    pub(crate) async fn delete_robot_row(&self, id: Uuid) -> Result<()> {
        let affected = self
            .conn
            .execute("DELETE FROM robots WHERE id = ?", params![id.to_string()])
            .await
            .map_err(|e| Self::map_store_error("Robot", "failed to delete", &e))?;
        if affected == 0 {
            return Err(Error::NotFound {
                entity: "Robot",
                id,
            });
        }
        Ok(())
    }

    pub(crate) async fn load_all_robots(&self) -> Result<Vec<Robot>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, base_url, description, owner, client_secret,
                        created_at, updated_at
                 FROM robots ORDER BY name",
                (),
            )
            .await
            .map_err(|e| Self::map_store_error("Robot", "failed to query", &e))?;
        let mut robots = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| Self::map_store_error("Robot", "failed to fetch row", &e))?
        {
            robots.push(Self::row_to_robot(&row)?);
        }
        Ok(robots)
    }

    // ========== Robot automations ==========

    pub(crate) async fn insert_automation(&self, automation: &RobotAutomation) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO robot_automations (id, robot_id, query, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?)",
                params![
                    automation.id.to_string(),
                    automation.robot_id.to_string(),
                    to_json(&automation.query)?,
                    to_micros(automation.created_at),
                    to_micros(automation.updated_at),
                ],
            )
            .await
            .map_err(|e| Self::map_store_error("RobotAutomation", "failed to insert", &e))?;
        Ok(())
    }

    pub(crate) async fn merge_automation_row(&self, automation: &RobotAutomation) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO robot_automations (id, robot_id, query, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET
                     robot_id = excluded.robot_id,
                     query = excluded.query,
                     updated_at = excluded.updated_at",
                params![
                    automation.id.to_string(),
                    automation.robot_id.to_string(),
                    to_json(&automation.query)?,
                    to_micros(automation.created_at),
                    to_micros(chrono::Utc::now()),
                ],
            )
            .await
            .map_err(|e| Self::map_store_error("RobotAutomation", "failed to merge", &e))?;
        Ok(())
    }

    pub(crate) async fn load_automation(&self, id: Uuid) -> Result<RobotAutomation> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, robot_id, query, created_at, updated_at
                 FROM robot_automations WHERE id = ?",
                params![id.to_string()],
            )
            .await
            .map_err(|e| Self::map_store_error("RobotAutomation", "failed to query", &e))?;
        let row = rows
            .next()
            .await
            .map_err(|e| Self::map_store_error("RobotAutomation", "failed to fetch row", &e))?
            .ok_or(Error::NotFound {
                entity: "RobotAutomation",
                id,
            })?;
        Self::row_to_automation(&row)
    }

    pub(crate) async fn delete_automation_row(&self, id: Uuid) -> Result<()> {
        let affected = self
            .conn
            .execute(
                "DELETE FROM robot_automations WHERE id = ?",
                params![id.to_string()],
            )
            .await
            .map_err(|e| Self::map_store_error("RobotAutomation", "failed to delete", &e))?;
        if affected == 0 {
            return Err(Error::NotFound {
                entity: "RobotAutomation",
                id,
            });
        }
        Ok(())
    }

    pub(crate) async fn load_all_automations(&self) -> Result<Vec<RobotAutomation>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, robot_id, query, created_at, updated_at
                 FROM robot_automations ORDER BY created_at, id",
                (),
            )
            .await
            .map_err(|e| Self::map_store_error("RobotAutomation", "failed to query", &e))?;
        let mut automations = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| Self::map_store_error("RobotAutomation", "failed to fetch row", &e))?
        {
            automations.push(Self::row_to_automation(&row)?);
        }
        Ok(automations)
    }

    // ========== Enhancement requests ==========

    pub(crate) async fn insert_enhancement_request(
        &self,
        request: &EnhancementRequest,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO enhancement_requests
                 (id, robot_id, reference_ids, request_status, source,
                  created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                params![
                    request.id.to_string(),
                    request.robot_id.to_string(),
                    to_json(&request.reference_ids)?,
                    enum_to_string(&request.request_status)?,
                    request.source.clone(),
                    to_micros(request.created_at),
                    to_micros(request.updated_at),
                ],
            )
            .await
            .map_err(|e| Self::map_store_error("EnhancementRequest", "failed to insert", &e))?;
        Ok(())
    }

    pub(crate) async fn load_enhancement_request(&self, id: Uuid) -> Result<EnhancementRequest> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, robot_id, reference_ids, request_status, source,
                        created_at, updated_at
                 FROM enhancement_requests WHERE id = ?",
                params![id.to_string()],
            )
            .await
            .map_err(|e| Self::map_store_error("EnhancementRequest", "failed to query", &e))?;
        let row = rows
            .next()
            .await
            .map_err(|e| Self::map_store_error("EnhancementRequest", "failed to fetch row", &e))?
            .ok_or(Error::NotFound {
                entity: "EnhancementRequest",
                id,
            })?;
        Self::row_to_enhancement_request(&row)
    }

    pub(crate) async fn set_enhancement_request_status(
        &self,
        id: Uuid,
        status: EnhancementRequestStatus,
    ) -> Result<()> {
        let affected = self
            .conn
            .execute(
                "UPDATE enhancement_requests SET request_status = ?, updated_at = ?
                 WHERE id = ?",
                params![
                    enum_to_string(&status)?,
                    to_micros(chrono::Utc::now()),
                    id.to_string(),
                ],
            )
            .await
            .map_err(|e| {
                Self::map_store_error("EnhancementRequest", "failed to update status", &e)
            })?;
        if affected == 0 {
            return Err(Error::NotFound {
                entity: "EnhancementRequest",
                id,
            });
        }
        Ok(())
    }

    // ========== Robot enhancement batches ==========

    pub(crate) async fn insert_robot_batch(&self, batch: &RobotEnhancementBatch) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO robot_enhancement_batches
                 (id, robot_id, reference_data_file, result_file,
                  validation_result_file, error, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    batch.id.to_string(),
                    batch.robot_id.to_string(),
                    batch
                        .reference_data_file
                        .as_ref()
                        .map(to_json)
                        .transpose()?,
                    batch.result_file.as_ref().map(to_json).transpose()?,
                    batch
                        .validation_result_file
                        .as_ref()
                        .map(to_json)
                        .transpose()?,
                    batch.error.clone(),
                    to_micros(batch.created_at),
                    to_micros(batch.updated_at),
                ],
            )
            .await
            .map_err(|e| {
                Self::map_store_error("RobotEnhancementBatch", "failed to insert", &e)
            })?;
        Ok(())
    }

    pub(crate) async fn load_robot_batch(
        &self,
        id: Uuid,
        with_pending: bool,
    ) -> Result<RobotEnhancementBatch> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, robot_id, reference_data_file, result_file,
                        validation_result_file, error, created_at, updated_at
                 FROM robot_enhancement_batches WHERE id = ?",
                params![id.to_string()],
            )
            .await
            .map_err(|e| Self::map_store_error("RobotEnhancementBatch", "failed to query", &e))?;
        let row = rows
            .next()
            .await
            .map_err(|e| {
                Self::map_store_error("RobotEnhancementBatch", "failed to fetch row", &e)
            })?
            .ok_or(Error::NotFound {
                entity: "RobotEnhancementBatch",
                id,
            })?;
        let mut batch = Self::row_to_robot_batch(&row)?;
        if with_pending {
            batch.pending_enhancements = Some(self.load_pending_by_batch(id).await?);
        }
        Ok(batch)
    }

    pub(crate) async fn update_robot_batch_files(
        &self,
        id: Uuid,
        reference_data_file: &BlobFile,
        result_file: &BlobFile,
    ) -> Result<()> {
        let affected = self
            .conn
            .execute(
                "UPDATE robot_enhancement_batches SET
                     reference_data_file = ?, result_file = ?, updated_at = ?
                 WHERE id = ?",
                params![
                    to_json(reference_data_file)?,
                    to_json(result_file)?,
                    to_micros(chrono::Utc::now()),
                    id.to_string(),
                ],
            )
            .await
            .map_err(|e| {
                Self::map_store_error("RobotEnhancementBatch", "failed to update files", &e)
            })?;
        if affected == 0 {
            return Err(Error::NotFound {
                entity: "RobotEnhancementBatch",
                id,
            });
        }
        Ok(())
    }

    pub(crate) async fn update_robot_batch_validation_file(
        &self,
        id: Uuid,
        validation_result_file: &BlobFile,
    ) -> Result<()> {
        let affected = self
            .conn
            .execute(
                "UPDATE robot_enhancement_batches SET
                     validation_result_file = ?, updated_at = ?
                 WHERE id = ?",
                params![
                    to_json(validation_result_file)?,
                    to_micros(chrono::Utc::now()),
                    id.to_string(),
                ],
            )
            .await
            .map_err(|e| {
                Self::map_store_error(
                    "RobotEnhancementBatch",
                    "failed to update validation file",
                    &e,
                )
            })?;
        if affected == 0 {
            return Err(Error::NotFound {
                entity: "RobotEnhancementBatch",
                id,
            });
        }
        Ok(())
    }

    pub(crate) async fn update_robot_batch_error(&self, id: Uuid, error: &str) -> Result<()> {
        let affected = self
            .conn
            .execute(
                "UPDATE robot_enhancement_batches SET error = ?, updated_at = ? WHERE id = ?",
                params![error, to_micros(chrono::Utc::now()), id.to_string()],
            )
            .await
            .map_err(|e| {
                Self::map_store_error("RobotEnhancementBatch", "failed to update error", &e)
            })?;
        if affected == 0 {
            return Err(Error::NotFound {
                entity: "RobotEnhancementBatch",
                id,
            });
        }
        Ok(())
    }

    // ========== Row mappers ==========

    fn row_to_robot(row: &Row) -> Result<Robot> {
        let id: String = row
            .get(0)
            .map_err(|e| Error::Store(format!("failed to read id: {e}")))?;
        let name: String = row
            .get(1)
            .map_err(|e| Error::Store(format!("failed to read name: {e}")))?;
        let base_url: String = row
            .get(2)
            .map_err(|e| Error::Store(format!("failed to read base_url: {e}")))?;
        let description: String = row
            .get(3)
            .map_err(|e| Error::Store(format!("failed to read description: {e}")))?;
        let owner: String = row
            .get(4)
            .map_err(|e| Error::Store(format!("failed to read owner: {e}")))?;
        let client_secret: Option<String> = row.get(5).ok();
        let created_at: i64 = row
            .get(6)
            .map_err(|e| Error::Store(format!("failed to read created_at: {e}")))?;
        let updated_at: i64 = row
            .get(7)
            .map_err(|e| Error::Store(format!("failed to read updated_at: {e}")))?;
        Ok(Robot {
            id: parse_uuid(&id)?,
            name,
            base_url,
            description,
            owner,
            client_secret,
            created_at: from_micros(created_at)?,
            updated_at: from_micros(updated_at)?,
        })
    }

    fn row_to_automation(row: &Row) -> Result<RobotAutomation> {
        let id: String = row
            .get(0)
            .map_err(|e| Error::Store(format!("failed to read id: {e}")))?;
        let robot_id: String = row
            .get(1)
            .map_err(|e| Error::Store(format!("failed to read robot_id: {e}")))?;
        let query: String = row
            .get(2)
            .map_err(|e| Error::Store(format!("failed to read query: {e}")))?;
        let created_at: i64 = row
            .get(3)
            .map_err(|e| Error::Store(format!("failed to read created_at: {e}")))?;
        let updated_at: i64 = row
            .get(4)
            .map_err(|e| Error::Store(format!("failed to read updated_at: {e}")))?;
        Ok(RobotAutomation {
            id: parse_uuid(&id)?,
            robot_id: parse_uuid(&robot_id)?,
            query: from_json(&query)?,
            created_at: from_micros(created_at)?,
            updated_at: from_micros(updated_at)?,
        })
    }

    fn row_to_enhancement_request(row: &Row) -> Result<EnhancementRequest> {
        let id: String = row
            .get(0)
            .map_err(|e| Error::Store(format!("failed to read id: {e}")))?;
        let robot_id: String = row
            .get(1)
            .map_err(|e| Error::Store(format!("failed to read robot_id: {e}")))?;
        let reference_ids: String = row
            .get(2)
            .map_err(|e| Error::Store(format!("failed to read reference_ids: {e}")))?;
        let request_status: String = row
            .get(3)
            .map_err(|e| Error::Store(format!("failed to read request_status: {e}")))?;
        let source: Option<String> = row.get(4).ok();
        let created_at: i64 = row
            .get(5)
            .map_err(|e| Error::Store(format!("failed to read created_at: {e}")))?;
        let updated_at: i64 = row
            .get(6)
            .map_err(|e| Error::Store(format!("failed to read updated_at: {e}")))?;
        Ok(EnhancementRequest {
            id: parse_uuid(&id)?,
            robot_id: parse_uuid(&robot_id)?,
            reference_ids: from_json(&reference_ids)?,
            request_status: enum_from_string(&request_status)?,
            source,
            created_at: from_micros(created_at)?,
            updated_at: from_micros(updated_at)?,
        })
    }

    fn row_to_robot_batch(row: &Row) -> Result<RobotEnhancementBatch> {
        let id: String = row
            .get(0)
            .map_err(|e| Error::Store(format!("failed to read id: {e}")))?;
        let robot_id: String = row
            .get(1)
            .map_err(|e| Error::Store(format!("failed to read robot_id: {e}")))?;
        let reference_data_file: Option<String> = row.get(2).ok();
        let result_file: Option<String> = row.get(3).ok();
        let validation_result_file: Option<String> = row.get(4).ok();
        let error: Option<String> = row.get(5).ok();
        let created_at: i64 = row
            .get(6)
            .map_err(|e| Error::Store(format!("failed to read created_at: {e}")))?;
        let updated_at: i64 = row
            .get(7)
            .map_err(|e| Error::Store(format!("failed to read updated_at: {e}")))?;
        Ok(RobotEnhancementBatch {
            id: parse_uuid(&id)?,
            robot_id: parse_uuid(&robot_id)?,
            reference_data_file: reference_data_file
                .map(|raw| from_json(&raw))
                .transpose()?,
            result_file: result_file.map(|raw| from_json(&raw)).transpose()?,
            validation_result_file: validation_result_file
                .map(|raw| from_json(&raw))
                .transpose()?,
            error,
            pending_enhancements: None,
            created_at: from_micros(created_at)?,
            updated_at: from_micros(updated_at)?,
        })
    }
}
