//! Background task dispatch.
//!
//! Services enqueue [`Task`]s through the [`TaskQueue`] capability; a broker
//! delivers them at-least-once to a [`TaskHandler`]. Handlers are re-entrant
//! over their effects (merge/upsert semantics), so redelivery is safe.
//!
//! [`InProcessTaskQueue`] is the in-process broker: an unbounded channel
//! drained by worker tasks. It is the default wiring for tests and
//! single-process deployments; a durable broker implements the same trait.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

/// A background job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum Task {
    ProcessImportBatch { import_batch_id: Uuid },
    ProcessDuplicateDecision { decision_id: Uuid },
    SweepExpiredLeases,
}

/// At-least-once durable job dispatch.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task: Task) -> Result<()>;
}

/// Receives tasks from the queue and runs them.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: Task) -> Result<()>;
}

/// In-process task broker over an unbounded channel.
pub struct InProcessTaskQueue {
    tx: mpsc::UnboundedSender<Task>,
}

/// Receiving half of the in-process broker, consumed by `start_worker`.
pub struct TaskReceiver {
    rx: mpsc::UnboundedReceiver<Task>,
}

impl InProcessTaskQueue {
    pub fn new() -> (Arc<Self>, TaskReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), TaskReceiver { rx })
    }

    /// Spawn the worker loop draining the queue into the handler.
    ///
    /// A failed task is logged and, when its error is recoverable, re-queued
    /// once; handlers own any further retry policy.
    pub fn start_worker(
        self: &Arc<Self>,
        receiver: TaskReceiver,
        handler: Arc<dyn TaskHandler>,
    ) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        let rx = Arc::new(Mutex::new(receiver.rx));
        tokio::spawn(async move {
            loop {
                let task = { rx.lock().await.recv().await };
                let Some(task) = task else {
                    info!("task queue closed, worker exiting");
                    break;
                };
                match handler.handle(task.clone()).await {
                    Ok(()) => {}
                    Err(e) if e.is_recoverable() => {
                        warn!(error = %e, ?task, "task failed, re-queueing once");
                        if queue.enqueue_retry(task).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!(error = %e, ?task, "task failed");
                    }
                }
            }
        })
    }

    fn enqueue_retry(&self, task: Task) -> Result<()> {
        self.tx
            .send(task)
            .map_err(|_| Error::Task("task queue closed".to_string()))
    }
}

#[async_trait]
impl TaskQueue for InProcessTaskQueue {
    async fn enqueue(&self, task: Task) -> Result<()> {
        self.tx
            .send(task)
            .map_err(|_| Error::Task("task queue closed".to_string()))
    }
}

/// Periodically enqueue a lease sweep. Each sweep is idempotent, so an
/// overlapping or redelivered sweep is harmless.
pub fn start_lease_sweeper(queue: Arc<dyn TaskQueue>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The immediate first tick would sweep before anything can expire.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if queue.enqueue(Task::SweepExpiredLeases).await.is_err() {
                break;
            }
        }
    })
}
