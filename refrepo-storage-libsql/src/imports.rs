//! Import record, batch and result persistence.

use libsql::{params, Row};
use uuid::Uuid;

use refrepo_core::error::{Error, Result};
use refrepo_core::imports::{
    ImportBatch, ImportBatchStatus, ImportRecord, ImportRecordStatus, ImportResult,
};

use crate::scope::{
    enum_from_string, enum_to_string, from_micros, parse_opt_uuid, parse_uuid, to_micros,
    LibsqlScope,
};

impl LibsqlScope {
    // ========== Import records ==========

    pub(crate) async fn insert_import_record(&self, record: &ImportRecord) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO import_records
                 (id, processor_name, processor_version, source_name, search_string,
                  notes, expected_reference_count, status, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    record.id.to_string(),
                    record.processor_name.clone(),
                    record.processor_version.clone(),
                    record.source_name.clone(),
                    record.search_string.clone(),
                    record.notes.clone(),
                    record.expected_reference_count,
                    enum_to_string(&record.status)?,
                    to_micros(record.created_at),
                    to_micros(record.updated_at),
                ],
            )
            .await
            .map_err(|e| Self::map_store_error("ImportRecord", "failed to insert", &e))?;
        Ok(())
    }

    pub(crate) async fn load_import_record(
        &self,
        id: Uuid,
        with_batches: bool,
    ) -> Result<ImportRecord> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, processor_name, processor_version, source_name, search_string,
                        notes, expected_reference_count, status, created_at, updated_at
                 FROM import_records WHERE id = ?",
                params![id.to_string()],
            )
            .await
            .map_err(|e| Self::map_store_error("ImportRecord", "failed to query", &e))?;
        let row = rows
            .next()
            .await
            .map_err(|e| Self::map_store_error("ImportRecord", "failed to fetch row", &e))?
            .ok_or(Error::NotFound {
                entity: "ImportRecord",
                id,
            })?;
        let mut record = Self::row_to_import_record(&row)?;
        if with_batches {
            record.batches = Some(self.load_import_batches_for_record(id).await?);
        }
        Ok(record)
    }

    pub(crate) async fn set_import_record_status(
        &self,
        id: Uuid,
        status: ImportRecordStatus,
    ) -> Result<()> {
        let affected = self
            .conn
            .execute(
                "UPDATE import_records SET status = ?, updated_at = ? WHERE id = ?",
                params![
                    enum_to_string(&status)?,
                    to_micros(chrono::Utc::now()),
                    id.to_string(),
                ],
            )
            .await
            .map_err(|e| Self::map_store_error("ImportRecord", "failed to update status", &e))?;
        if affected == 0 {
            return Err(Error::NotFound {
                entity: "ImportRecord",
                id,
            });
        }
        Ok(())
    }

    // ========== Import batches ==========

    pub(crate) async fn insert_import_batch(&self, batch: &ImportBatch) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO import_batches
                 (id, import_record_id, storage_url, callback_url, status,
                  created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                params![
                    batch.id.to_string(),
                    batch.import_record_id.to_string(),
                    batch.storage_url.clone(),
                    batch.callback_url.clone(),
                    enum_to_string(&batch.status)?,
                    to_micros(batch.created_at),
                    to_micros(batch.updated_at),
                ],
            )
            .await
            .map_err(|e| Self::map_store_error("ImportBatch", "failed to insert", &e))?;
        Ok(())
    }

    pub(crate) async fn load_import_batch(
        &self,
        id: Uuid,
        with_results: bool,
    ) -> Result<ImportBatch> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, import_record_id, storage_url, callback_url, status,
                        created_at, updated_at
                 FROM import_batches WHERE id = ?",
                params![id.to_string()],
            )
            .await
            .map_err(|e| Self::map_store_error("ImportBatch", "failed to query", &e))?;
        let row = rows
            .next()
            .await
            .map_err(|e| Self::map_store_error("ImportBatch", "failed to fetch row", &e))?
            .ok_or(Error::NotFound {
                entity: "ImportBatch",
                id,
            })?;
        let mut batch = Self::row_to_import_batch(&row)?;
        if with_results {
            batch.import_results = Some(self.load_import_results(id).await?);
        }
        Ok(batch)
    }

    pub(crate) async fn set_import_batch_status(
        &self,
        id: Uuid,
        status: ImportBatchStatus,
    ) -> Result<()> {
        let affected = self
            .conn
            .execute(
                "UPDATE import_batches SET status = ?, updated_at = ? WHERE id = ?",
                params![
                    enum_to_string(&status)?,
                    to_micros(chrono::Utc::now()),
                    id.to_string(),
                ],
            )
            .await
            .map_err(|e| Self::map_store_error("ImportBatch", "failed to update status", &e))?;
        if affected == 0 {
            return Err(Error::NotFound {
                entity: "ImportBatch",
                id,
            });
        }
        Ok(())
    }

    pub(crate) async fn load_import_batches_for_record(
        &self,
        import_record_id: Uuid,
    ) -> Result<Vec<ImportBatch>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, import_record_id, storage_url, callback_url, status,
                        created_at, updated_at
                 FROM import_batches WHERE import_record_id = ? ORDER BY created_at, id",
                params![import_record_id.to_string()],
            )
            .await
            .map_err(|e| Self::map_store_error("ImportBatch", "failed to query", &e))?;
        let mut batches = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| Self::map_store_error("ImportBatch", "failed to fetch row", &e))?
        {
            batches.push(Self::row_to_import_batch(&row)?);
        }
        Ok(batches)
    }

    // ========== Import results ==========

    pub(crate) async fn insert_import_result(&self, result: &ImportResult) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO import_results
                 (id, import_batch_id, status, reference_id, failure_details,
                  created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                params![
                    result.id.to_string(),
                    result.import_batch_id.to_string(),
                    enum_to_string(&result.status)?,
                    result.reference_id.map(|id| id.to_string()),
                    result.failure_details.clone(),
                    to_micros(result.created_at),
                    to_micros(result.updated_at),
                ],
            )
            .await
            .map_err(|e| Self::map_store_error("ImportResult", "failed to insert", &e))?;
        Ok(())
    }

    pub(crate) async fn update_import_result_row(&self, result: &ImportResult) -> Result<()> {
        let affected = self
            .conn
            .execute(
                "UPDATE import_results SET
                     status = ?, reference_id = ?, failure_details = ?, updated_at = ?
                 WHERE id = ?",
                params![
                    enum_to_string(&result.status)?,
                    result.reference_id.map(|id| id.to_string()),
                    result.failure_details.clone(),
                    to_micros(chrono::Utc::now()),
                    result.id.to_string(),
                ],
            )
            .await
            .map_err(|e| Self::map_store_error("ImportResult", "failed to update", &e))?;
        if affected == 0 {
            return Err(Error::NotFound {
                entity: "ImportResult",
                id: result.id,
            });
        }
        Ok(())
    }

    pub(crate) async fn load_import_results(
        &self,
        import_batch_id: Uuid,
    ) -> Result<Vec<ImportResult>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, import_batch_id, status, reference_id, failure_details,
                        created_at, updated_at
                 FROM import_results WHERE import_batch_id = ? ORDER BY created_at, id",
                params![import_batch_id.to_string()],
            )
            .await
            .map_err(|e| Self::map_store_error("ImportResult", "failed to query", &e))?;
        let mut results = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| Self::map_store_error("ImportResult", "failed to fetch row", &e))?
        {
            results.push(Self::row_to_import_result(&row)?);
        }
        Ok(results)
    }

    // ========== Row mappers ==========

    fn row_to_import_record(row: &Row) -> Result<ImportRecord> {
        let id: String = row
            .get(0)
            .map_err(|e| Error::Store(format!("failed to read id: {e}")))?;
        let processor_name: String = row
            .get(1)
            .map_err(|e| Error::Store(format!("failed to read processor_name: {e}")))?;
        let processor_version: String = row
            .get(2)
            .map_err(|e| Error::Store(format!("failed to read processor_version: {e}")))?;
        let source_name: String = row
            .get(3)
            .map_err(|e| Error::Store(format!("failed to read source_name: {e}")))?;
        let search_string: Option<String> = row.get(4).ok();
        let notes: Option<String> = row.get(5).ok();
        let expected_reference_count: i64 = row
            .get(6)
            .map_err(|e| Error::Store(format!("failed to read expected count: {e}")))?;
        let status: String = row
            .get(7)
            .map_err(|e| Error::Store(format!("failed to read status: {e}")))?;
        let created_at: i64 = row
            .get(8)
            .map_err(|e| Error::Store(format!("failed to read created_at: {e}")))?;
        let updated_at: i64 = row
            .get(9)
            .map_err(|e| Error::Store(format!("failed to read updated_at: {e}")))?;
        Ok(ImportRecord {
            id: parse_uuid(&id)?,
            processor_name,
            processor_version,
            source_name,
            search_string,
            notes,
            expected_reference_count,
            status: enum_from_string(&status)?,
            batches: None,
            created_at: from_micros(created_at)?,
            updated_at: from_micros(updated_at)?,
        })
    }

    fn row_to_import_batch(row: &Row) -> Result<ImportBatch> {
        let id: String = row
            .get(0)
            .map_err(|e| Error::Store(format!("failed to read id: {e}")))?;
        let import_record_id: String = row
            .get(1)
            .map_err(|e| Error::Store(format!("failed to read import_record_id: {e}")))?;
        let storage_url: String = row
            .get(2)
            .map_err(|e| Error::Store(format!("failed to read storage_url: {e}")))?;
        let callback_url: Option<String> = row.get(3).ok();
        let status: String = row
            .get(4)
            .map_err(|e| Error::Store(format!("failed to read status: {e}")))?;
        let created_at: i64 = row
            .get(5)
            .map_err(|e| Error::Store(format!("failed to read created_at: {e}")))?;
        let updated_at: i64 = row
            .get(6)
            .map_err(|e| Error::Store(format!("failed to read updated_at: {e}")))?;
        Ok(ImportBatch {
            id: parse_uuid(&id)?,
            import_record_id: parse_uuid(&import_record_id)?,
            storage_url,
            callback_url,
            status: enum_from_string(&status)?,
            import_results: None,
            created_at: from_micros(created_at)?,
            updated_at: from_micros(updated_at)?,
        })
    }

    fn row_to_import_result(row: &Row) -> Result<ImportResult> {
        let id: String = row
            .get(0)
            .map_err(|e| Error::Store(format!("failed to read id: {e}")))?;
        let import_batch_id: String = row
            .get(1)
            .map_err(|e| Error::Store(format!("failed to read import_batch_id: {e}")))?;
        let status: String = row
            .get(2)
            .map_err(|e| Error::Store(format!("failed to read status: {e}")))?;
        let reference_id: Option<String> = row.get(3).ok();
        let failure_details: Option<String> = row.get(4).ok();
        let created_at: i64 = row
            .get(5)
            .map_err(|e| Error::Store(format!("failed to read created_at: {e}")))?;
        let updated_at: i64 = row
            .get(6)
            .map_err(|e| Error::Store(format!("failed to read updated_at: {e}")))?;
        Ok(ImportResult {
            id: parse_uuid(&id)?,
            import_batch_id: parse_uuid(&import_batch_id)?,
            status: enum_from_string(&status)?,
            reference_id: parse_opt_uuid(reference_id)?,
            failure_details,
            created_at: from_micros(created_at)?,
            updated_at: from_micros(updated_at)?,
        })
    }
}
