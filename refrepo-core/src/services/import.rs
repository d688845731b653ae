//! Import campaigns: registration, batch processing, summaries, callbacks.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::RepositoryConfig;
use crate::error::{Error, Result};
use crate::imports::{
    ImportBatch, ImportBatchStatus, ImportBatchSummary, ImportRecord, ImportRecordStatus,
    ImportResult, ImportResultStatus,
};
use crate::services::reference::ReferenceService;
use crate::store::{ReferenceScope, ReferenceStore};
use crate::tasks::{Task, TaskQueue};

/// Transport retries for callback dispatch, beyond the first attempt.
const CALLBACK_RETRIES: u32 = 2;
/// Base delay for callback retry backoff.
const CALLBACK_RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
/// How many records to process between cancellation checks.
const CANCELLATION_CHECK_INTERVAL: usize = 50;

/// The service which manages imports and their processing.
pub struct ImportService {
    store: Arc<dyn ReferenceStore>,
    task_queue: Arc<dyn TaskQueue>,
    #[allow(dead_code)]
    config: Arc<RepositoryConfig>,
    http: reqwest::Client,
}

impl ImportService {
    pub fn new(
        store: Arc<dyn ReferenceStore>,
        task_queue: Arc<dyn TaskQueue>,
        config: Arc<RepositoryConfig>,
    ) -> Self {
        Self {
            store,
            task_queue,
            config,
            http: reqwest::Client::new(),
        }
    }

    // ========== Registration ==========

    pub async fn register_import(&self, record: &ImportRecord) -> Result<()> {
        let mut scope = self.store.begin().await?;
        scope.add_import_record(record).await?;
        scope.commit().await
    }

    /// Register a batch under an import record and queue its processing.
    pub async fn register_batch(&self, batch: &ImportBatch) -> Result<()> {
        let mut scope = self.store.begin().await?;
        let record = scope
            .get_import_record(batch.import_record_id, false)
            .await?;
        if matches!(
            record.status,
            ImportRecordStatus::Completed | ImportRecordStatus::Cancelled
        ) {
            return Err(Error::InvalidInput(format!(
                "import record {} is {:?} and does not accept new batches",
                record.id, record.status
            )));
        }
        scope.add_import_batch(batch).await?;
        if record.status == ImportRecordStatus::Created {
            scope
                .update_import_record_status(record.id, ImportRecordStatus::Started)
                .await?;
        }
        // Queue only once the batch row is visible to the worker.
        scope.commit().await?;
        self.task_queue
            .enqueue(Task::ProcessImportBatch {
                import_batch_id: batch.id,
            })
            .await
    }

    // ========== Reads ==========

    pub async fn get_import_record(&self, record_id: Uuid) -> Result<ImportRecord> {
        let mut scope = self.store.begin().await?;
        scope.get_import_record(record_id, true).await
    }

    pub async fn get_import_batch(&self, batch_id: Uuid) -> Result<ImportBatch> {
        let mut scope = self.store.begin().await?;
        scope.get_import_batch(batch_id, false).await
    }

    pub async fn get_import_batch_summary(&self, batch_id: Uuid) -> Result<ImportBatchSummary> {
        let mut scope = self.store.begin().await?;
        let mut batch = scope.get_import_batch(batch_id, true).await?;
        // A batch that ran to completion reports the projection of its
        // results, so partial failures surface in the summary status.
        if batch.status == ImportBatchStatus::Completed {
            let projected = crate::projections::import_batch_status(&batch.result_status_set())?;
            if projected != ImportBatchStatus::Created {
                batch.status = projected;
            }
        }
        Ok(batch.summary())
    }

    // ========== Cancellation ==========

    /// Cancel an import record and its non-terminal batches. In-flight
    /// records finishing concurrently may still commit; no new records
    /// start once the cancellation is observed.
    pub async fn cancel_import_record(&self, record_id: Uuid) -> Result<()> {
        let mut scope = self.store.begin().await?;
        scope
            .update_import_record_status(record_id, ImportRecordStatus::Cancelled)
            .await?;
        for batch in scope.find_import_batches(record_id).await? {
            if !batch.status.is_terminal() {
                scope
                    .update_import_batch_status(batch.id, ImportBatchStatus::Cancelled)
                    .await?;
            }
        }
        scope.commit().await
    }

    pub async fn cancel_import_batch(&self, batch_id: Uuid) -> Result<()> {
        let mut scope = self.store.begin().await?;
        scope
            .update_import_batch_status(batch_id, ImportBatchStatus::Cancelled)
            .await?;
        scope.commit().await
    }

    /// Mark the record completed once every batch is terminal.
    pub async fn finalise_import_record(&self, record_id: Uuid) -> Result<()> {
        let mut scope = self.store.begin().await?;
        let record = scope.get_import_record(record_id, false).await?;
        if record.status == ImportRecordStatus::Cancelled {
            return Ok(());
        }
        let batches = scope.find_import_batches(record_id).await?;
        if !batches.is_empty() && batches.iter().all(|b| b.status.is_terminal()) {
            scope
                .update_import_record_status(record_id, ImportRecordStatus::Completed)
                .await?;
            scope.commit().await?;
        }
        Ok(())
    }

    // ========== Batch processing ==========

    /// Task body: process one import batch end to end.
    ///
    /// Streams the JSONL from the batch's storage URL in file order,
    /// ingests each non-blank line in its own transactional scope (so one
    /// bad record never rolls back its neighbours), indexes the imported
    /// references, and posts the summary callback.
    pub async fn process_batch(
        &self,
        batch_id: Uuid,
        reference_service: &ReferenceService,
    ) -> Result<()> {
        let batch = {
            let mut scope = self.store.begin().await?;
            let batch = scope.get_import_batch(batch_id, false).await?;
            if batch.status == ImportBatchStatus::Cancelled {
                info!(import_batch_id = %batch_id, "batch is cancelled, skipping");
                return Ok(());
            }
            scope
                .update_import_batch_status(batch_id, ImportBatchStatus::Started)
                .await?;
            scope.commit().await?;
            batch
        };

        let stream_outcome = self
            .process_batch_stream(&batch, reference_service)
            .await;

        let mut scope = self.store.begin().await?;
        let post_stream_status = match &stream_outcome {
            Ok(()) => {
                // Cancellation observed mid-stream leaves the batch
                // cancelled; don't overwrite it.
                let current = scope.get_import_batch(batch_id, false).await?;
                if current.status == ImportBatchStatus::Cancelled {
                    ImportBatchStatus::Cancelled
                } else {
                    ImportBatchStatus::Completed
                }
            }
            Err(e) => {
                error!(import_batch_id = %batch_id, error = %e, "import batch stream failed");
                ImportBatchStatus::Failed
            }
        };
        scope
            .update_import_batch_status(batch_id, post_stream_status)
            .await?;
        scope.commit().await?;

        if post_stream_status != ImportBatchStatus::Completed {
            return stream_outcome;
        }

        // Indexing phase.
        let mut scope = self.store.begin().await?;
        scope
            .update_import_batch_status(batch_id, ImportBatchStatus::Indexing)
            .await?;
        let imported: Vec<Uuid> = scope
            .find_import_results(batch_id)
            .await?
            .into_iter()
            .filter(|r| r.status == ImportResultStatus::Completed)
            .filter_map(|r| r.reference_id)
            .collect();
        scope.commit().await?;

        let final_status = match reference_service.index_references(&imported).await {
            Ok(()) => ImportBatchStatus::Completed,
            Err(e) => {
                error!(import_batch_id = %batch_id, error = %e, "error indexing imported references");
                ImportBatchStatus::IndexingFailed
            }
        };
        let mut scope = self.store.begin().await?;
        scope
            .update_import_batch_status(batch_id, final_status)
            .await?;
        scope.commit().await?;

        if let Some(callback_url) = &batch.callback_url {
            let summary = self.get_import_batch_summary(batch_id).await?;
            self.post_callback(callback_url, &summary).await;
        }
        self.finalise_import_record(batch.import_record_id).await?;
        Ok(())
    }

    /// Stream and ingest the batch file, one record scope per line.
    async fn process_batch_stream(
        &self,
        batch: &ImportBatch,
        reference_service: &ReferenceService,
    ) -> Result<()> {
        let mut lines = UrlLineStream::open(&batch.storage_url, &self.http).await?;
        let mut entry_ref: usize = 0;
        let mut since_cancellation_check: usize = 0;

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            entry_ref += 1;
            since_cancellation_check += 1;

            if since_cancellation_check >= CANCELLATION_CHECK_INTERVAL {
                since_cancellation_check = 0;
                let mut scope = self.store.begin().await?;
                let current = scope.get_import_batch(batch.id, false).await?;
                if current.status == ImportBatchStatus::Cancelled {
                    info!(import_batch_id = %batch.id, "cancellation observed, stopping batch");
                    return Ok(());
                }
            }

            self.import_reference(batch.id, &line, entry_ref, reference_service)
                .await?;
        }
        Ok(())
    }

    /// Ingest one record in its own scope and account for the result.
    async fn import_reference(
        &self,
        import_batch_id: Uuid,
        record_str: &str,
        entry_ref: usize,
        reference_service: &ReferenceService,
    ) -> Result<()> {
        let mut scope = self.store.begin().await?;
        let mut result = ImportResult::new(import_batch_id);
        result.status = ImportResultStatus::Started;
        scope.add_import_result(&result).await?;

        match reference_service
            .ingest_reference_in_scope(scope.as_mut(), record_str, entry_ref)
            .await
        {
            Ok(outcome) => {
                result.reference_id = outcome.reference_id;
                result.failure_details = outcome.create_result.error_str();
                result.status = if outcome.reference_id.is_none() {
                    ImportResultStatus::Failed
                } else if outcome.create_result.errors.is_empty() {
                    ImportResultStatus::Completed
                } else {
                    ImportResultStatus::PartiallyFailed
                };
                scope.update_import_result(&result).await?;
                scope.commit().await?;
                // Decision processing runs against committed rows.
                if let Some(task) = outcome.pending_decision_task {
                    self.task_queue.enqueue(task).await?;
                }
            }
            Err(e) => {
                // Store errors within the record roll back its scope; the
                // failure is recorded in a fresh one so the decision stays
                // reprocessable.
                warn!(import_batch_id = %import_batch_id, entry_ref, error = %e, "record ingest failed");
                drop(scope);
                let mut scope = self.store.begin().await?;
                result.status = ImportResultStatus::Failed;
                result.failure_details = Some(format!("Entry {entry_ref}: {e}"));
                scope.add_import_result(&result).await?;
                scope.commit().await?;
            }
        }
        Ok(())
    }

    /// Post the batch summary to the callback URL with transport retries
    /// and exponential backoff. Failures are logged, never fatal.
    async fn post_callback(&self, callback_url: &str, summary: &ImportBatchSummary) {
        let mut delay = CALLBACK_RETRY_BASE_DELAY;
        for attempt in 0..=CALLBACK_RETRIES {
            let response = self.http.post(callback_url).json(summary).send().await;
            match response {
                Ok(response) if response.status().is_success() => return,
                Ok(response) => {
                    warn!(
                        callback_url,
                        status = %response.status(),
                        attempt,
                        "callback returned an error status"
                    );
                }
                Err(e) => {
                    warn!(callback_url, error = %e, attempt, "callback dispatch failed");
                }
            }
            if attempt < CALLBACK_RETRIES {
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
        error!(callback_url, "failed to send callback");
    }
}

/// Pull-based line iterator over a batch storage URL.
///
/// `file://` URLs are read from the local filesystem; anything else is
/// fetched over HTTP and split on newlines as chunks arrive. The underlying
/// handle closes on drop.
enum UrlLineStream {
    File {
        lines: tokio::io::Lines<BufReader<tokio::fs::File>>,
    },
    Http {
        stream: futures::stream::BoxStream<'static, reqwest::Result<bytes::Bytes>>,
        buffer: Vec<u8>,
        done: bool,
    },
}

impl UrlLineStream {
    async fn open(url: &str, http: &reqwest::Client) -> Result<Self> {
        if let Some(path) = url.strip_prefix("file://") {
            // Signed URLs carry query parameters; the path is what matters.
            let path = path.split('?').next().unwrap_or(path);
            let file = tokio::fs::File::open(path)
                .await
                .map_err(|e| Error::BlobStorage(format!("failed to open {url}: {e}")))?;
            return Ok(UrlLineStream::File {
                lines: BufReader::new(file).lines(),
            });
        }
        let response = http
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Http(format!("failed to fetch {url}: {e}")))?
            .error_for_status()
            .map_err(|e| Error::Http(format!("failed to fetch {url}: {e}")))?;
        Ok(UrlLineStream::Http {
            stream: response.bytes_stream().boxed(),
            buffer: Vec::new(),
            done: false,
        })
    }

    async fn next_line(&mut self) -> Result<Option<String>> {
        match self {
            UrlLineStream::File { lines } => lines
                .next_line()
                .await
                .map_err(|e| Error::BlobStorage(format!("failed to read line: {e}"))),
            UrlLineStream::Http {
                stream,
                buffer,
                done,
            } => loop {
                if let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
                    let mut line: Vec<u8> = buffer.drain(..=newline).collect();
                    line.pop();
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
                }
                if *done {
                    if buffer.is_empty() {
                        return Ok(None);
                    }
                    let line = String::from_utf8_lossy(buffer).into_owned();
                    buffer.clear();
                    return Ok(Some(line));
                }
                match stream.next().await {
                    Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                    Some(Err(e)) => {
                        return Err(Error::Http(format!("stream read failed: {e}")));
                    }
                    None => *done = true,
                }
            },
        }
    }
}
