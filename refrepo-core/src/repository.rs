//! The repository context: explicit wiring of stores, services and the
//! task worker, constructed once at process boot.
//!
//! There are no module-level singletons; tests build alternate contexts
//! with their own stores and configuration.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::blob::BlobStore;
use crate::config::RepositoryConfig;
use crate::error::{Error, Result};
use crate::search::SearchStore;
use crate::services::import::ImportService;
use crate::services::reference::ReferenceService;
use crate::store::ReferenceStore;
use crate::tasks::{InProcessTaskQueue, Task, TaskHandler, TaskQueue, TaskReceiver};

/// The assembled reference repository.
pub struct Repository {
    pub config: Arc<RepositoryConfig>,
    pub references: ReferenceService,
    pub imports: ImportService,
    task_queue: Arc<dyn TaskQueue>,
}

impl Repository {
    /// Wire the repository over the given capabilities.
    pub fn new(
        config: RepositoryConfig,
        store: Arc<dyn ReferenceStore>,
        search_store: Arc<dyn SearchStore>,
        blob_store: Arc<dyn BlobStore>,
        task_queue: Arc<dyn TaskQueue>,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let references = ReferenceService::new(
            Arc::clone(&store),
            Arc::clone(&search_store),
            Arc::clone(&blob_store),
            Arc::clone(&task_queue),
            Arc::clone(&config),
        );
        let imports = ImportService::new(
            Arc::clone(&store),
            Arc::clone(&task_queue),
            Arc::clone(&config),
        );
        Arc::new(Self {
            config,
            references,
            imports,
            task_queue,
        })
    }

    /// Wire the repository with the in-process task broker and start its
    /// worker. The common path for tests and single-process deployments.
    pub fn with_in_process_worker(
        config: RepositoryConfig,
        store: Arc<dyn ReferenceStore>,
        search_store: Arc<dyn SearchStore>,
        blob_store: Arc<dyn BlobStore>,
    ) -> Arc<Self> {
        let (queue, receiver) = InProcessTaskQueue::new();
        let repository = Self::new(
            config,
            store,
            search_store,
            blob_store,
            queue.clone() as Arc<dyn TaskQueue>,
        );
        repository.start_worker(&queue, receiver);
        repository
    }

    /// Start the in-process worker draining tasks into this repository.
    pub fn start_worker(self: &Arc<Self>, queue: &Arc<InProcessTaskQueue>, receiver: TaskReceiver) {
        let handler: Arc<dyn TaskHandler> = Arc::clone(self) as Arc<dyn TaskHandler>;
        queue.start_worker(receiver, handler);
        info!("repository task worker started");
    }

    pub fn task_queue(&self) -> Arc<dyn TaskQueue> {
        Arc::clone(&self.task_queue)
    }
}

#[async_trait]
impl TaskHandler for Repository {
    async fn handle(&self, task: Task) -> Result<()> {
        match task {
            Task::ProcessImportBatch { import_batch_id } => self
                .imports
                .process_batch(import_batch_id, &self.references)
                .await
                .map_err(|e| match e {
                    // A vanished subject terminates the task without retry.
                    Error::NotFound { .. } => {
                        Error::Task(format!("import batch {import_batch_id} not found"))
                    }
                    other => other,
                }),
            Task::ProcessDuplicateDecision { decision_id } => self
                .references
                .process_duplicate_decision(decision_id)
                .await
                .map_err(|e| match e {
                    Error::NotFound { .. } => {
                        Error::Task(format!("duplicate decision {decision_id} not found"))
                    }
                    other => other,
                }),
            Task::SweepExpiredLeases => self.references.sweep_expired_leases().await,
        }
    }
}
