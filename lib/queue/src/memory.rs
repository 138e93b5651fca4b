//! In-process transport.
//!
//! Used by tests and by single-process deployments that do not run NATS.
//! Jobs live only as long as the process.

use crate::client::JobQueue;
use crate::error::QueueError;
use crate::job::{QueueName, QueuedJob};
use crate::runtime::{DeliveryOutcome, JobRuntime};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, watch};
use tracing::{debug, info};

#[derive(Default)]
struct Lanes {
    ready: HashMap<QueueName, VecDeque<QueuedJob>>,
    history: Vec<QueuedJob>,
}

struct Shared {
    lanes: Mutex<Lanes>,
    signals: HashMap<QueueName, Notify>,
}

impl Shared {
    async fn push(&self, job: QueuedJob) {
        let queue = job.queue;
        {
            let mut lanes = self.lanes.lock().await;
            lanes.history.push(job.clone());
            lanes.ready.entry(queue).or_default().push_back(job);
        }
        if let Some(signal) = self.signals.get(&queue) {
            signal.notify_one();
        }
    }
}

/// FIFO queues held in memory, one per [`QueueName`].
#[derive(Clone)]
pub struct InMemoryJobQueue {
    shared: Arc<Shared>,
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryJobQueue {
    #[must_use]
    pub fn new() -> Self {
        let signals = QueueName::ALL.into_iter().map(|q| (q, Notify::new())).collect();
        Self {
            shared: Arc::new(Shared {
                lanes: Mutex::new(Lanes::default()),
                signals,
            }),
        }
    }

    pub async fn pop(&self, queue: QueueName) -> Option<QueuedJob> {
        self.shared
            .lanes
            .lock()
            .await
            .ready
            .get_mut(&queue)
            .and_then(VecDeque::pop_front)
    }

    /// Jobs waiting on `queue`, oldest first.
    pub async fn pending(&self, queue: QueueName) -> Vec<QueuedJob> {
        self.shared
            .lanes
            .lock()
            .await
            .ready
            .get(&queue)
            .map(|jobs| jobs.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every job ever published, including requeues, in publish order.
    pub async fn published(&self) -> Vec<QueuedJob> {
        self.shared.lanes.lock().await.history.clone()
    }

    /// Handles the next waiting job on the runtime's queue, if any.
    ///
    /// Retries go straight back on the queue without waiting out their
    /// backoff, which keeps step-by-step tests deterministic.
    pub async fn process_next(&self, runtime: &JobRuntime) -> Option<DeliveryOutcome> {
        let job = self.pop(runtime.queue()).await?;
        let outcome = runtime.handle(&job).await;
        if let DeliveryOutcome::Retry { .. } = outcome {
            self.shared.push(next_attempt(job)).await;
        }
        Some(outcome)
    }

    /// Consumes the runtime's queue until `shutdown` flips to `true`.
    pub async fn run(&self, runtime: Arc<JobRuntime>, mut shutdown: watch::Receiver<bool>) {
        let queue = runtime.queue();
        info!(%queue, "in-memory worker started");
        loop {
            let Some(job) = self.pop(queue).await else {
                let Some(signal) = self.shared.signals.get(&queue) else {
                    return;
                };
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    () = signal.notified() => {}
                }
                continue;
            };

            let Some(permit) = runtime.acquire_slot().await else {
                break;
            };
            let runtime = runtime.clone();
            let this = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                if let DeliveryOutcome::Retry { delay } = runtime.handle(&job).await
                    && let Err(e) = this.requeue(next_attempt(job), delay).await
                {
                    debug!(error = %e, "failed to requeue job");
                }
            });
        }
        info!(%queue, "in-memory worker stopped");
    }
}

fn next_attempt(mut job: QueuedJob) -> QueuedJob {
    job.attempts_made += 1;
    job
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: QueuedJob) -> Result<(), QueueError> {
        self.shared.push(job).await;
        Ok(())
    }

    async fn requeue(&self, job: QueuedJob, delay: Duration) -> Result<(), QueueError> {
        if delay.is_zero() {
            self.shared.push(job).await;
        } else {
            let shared = self.shared.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                shared.push(job).await;
            });
        }
        Ok(())
    }
}
