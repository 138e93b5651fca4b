//! Per-delivery job handling shared by every transport.
//!
//! A transport receives a job and hands it to [`JobRuntime::handle`], which
//! keeps the durable record in step with the processor's progress and tells
//! the transport whether to forget the job or deliver it again later.

use crate::client::QueueClient;
use crate::error::RecordStoreError;
use crate::job::{JobStatus, JobStatusUpdate, LogLevel, QueueName, QueuedJob};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, instrument, warn};

/// Why a processor gave up on a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub message: String,
    /// `false` for failures that another attempt cannot fix.
    pub retryable: bool,
}

impl JobFailure {
    #[must_use]
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    /// Whether this failure ends the job for good.
    #[must_use]
    pub fn is_terminal_for(&self, job: &QueuedJob) -> bool {
        !self.retryable || job.is_final_attempt()
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for JobFailure {}

/// Work registered for one queue.
///
/// Deliveries are at-least-once, so implementations must tolerate seeing
/// the same job more than once.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, job: &QueuedJob) -> Result<JsonValue, JobFailure>;
}

/// What the transport should do with a delivery once it has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Completed,
    /// Deliver again with one more attempt counted, after `delay`.
    Retry { delay: Duration },
    /// The job failed for good.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub concurrency: usize,
    pub heartbeat_interval: Duration,
}

impl RuntimeConfig {
    #[must_use]
    pub fn for_queue(queue: QueueName) -> Self {
        Self {
            concurrency: queue.default_concurrency(),
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

pub struct JobRuntime {
    queue: QueueName,
    client: QueueClient,
    processor: Arc<dyn JobProcessor>,
    slots: Arc<Semaphore>,
    heartbeat_interval: Duration,
}

impl JobRuntime {
    #[must_use]
    pub fn new(
        queue: QueueName,
        client: QueueClient,
        processor: Arc<dyn JobProcessor>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            queue,
            client,
            processor,
            slots: Arc::new(Semaphore::new(config.concurrency.max(1))),
            heartbeat_interval: config.heartbeat_interval,
        }
    }

    #[must_use]
    pub fn queue(&self) -> QueueName {
        self.queue
    }

    /// Waits for a free worker slot. Transports take a slot before spawning
    /// a delivery so that at most `concurrency` jobs run at once.
    pub async fn acquire_slot(&self) -> Option<OwnedSemaphorePermit> {
        self.slots.clone().acquire_owned().await.ok()
    }

    /// Runs one delivery of `job` to completion.
    #[instrument(skip_all, fields(job_id = %job.id, queue = %self.queue, attempt = job.attempt()))]
    pub async fn handle(&self, job: &QueuedJob) -> DeliveryOutcome {
        match self.client.find_job(job.id).await {
            Ok(record) if record.moved_to_dlq => {
                debug!("job is dead-lettered, dropping delivery");
                return DeliveryOutcome::Failed;
            }
            Ok(record) if record.status == JobStatus::Completed => {
                debug!("job already completed, dropping duplicate delivery");
                return DeliveryOutcome::Completed;
            }
            Ok(_) => {}
            Err(crate::QueueError::Records(RecordStoreError::NotFound { .. })) => {
                warn!("no record for delivered job, processing anyway");
            }
            Err(e) => warn!(error = %e, "could not load job record"),
        }

        if let Err(e) = self
            .client
            .update_job_status(
                job.id,
                JobStatus::Active,
                JobStatusUpdate::default().attempts(job.attempt()),
            )
            .await
        {
            warn!(error = %e, "failed to mark job active");
        }
        if let Err(e) = self.client.heartbeat(job.id).await {
            warn!(error = %e, "failed to write initial heartbeat");
        }

        let ticker = self.spawn_heartbeat(job);
        let result = self.processor.process(job).await;
        ticker.abort();

        match result {
            Ok(output) => {
                if let Err(e) = self
                    .client
                    .update_job_status(
                        job.id,
                        JobStatus::Completed,
                        JobStatusUpdate::with_result(output),
                    )
                    .await
                {
                    warn!(error = %e, "failed to mark job completed");
                }
                debug!("job completed");
                DeliveryOutcome::Completed
            }
            Err(failure) => self.fail(job, failure).await,
        }
    }

    async fn fail(&self, job: &QueuedJob, failure: JobFailure) -> DeliveryOutcome {
        self.client
            .add_job_log(
                job.id,
                format!("attempt {} failed: {}", job.attempt(), failure.message),
                LogLevel::Error,
            )
            .await;

        if !failure.is_terminal_for(job) {
            let delay = job.options.backoff.delay_for(job.attempt());
            info!(error = %failure, delay_ms = delay.as_millis() as u64, "job failed, will retry");
            if let Err(e) = self
                .client
                .update_job_status(
                    job.id,
                    JobStatus::Pending,
                    JobStatusUpdate::with_error(failure.message.clone()),
                )
                .await
            {
                warn!(error = %e, "failed to record retry");
            }
            return DeliveryOutcome::Retry { delay };
        }

        warn!(error = %failure, retryable = failure.retryable, "job failed");
        if let Err(e) = self
            .client
            .update_job_status(
                job.id,
                JobStatus::Failed,
                JobStatusUpdate::with_error(failure.message.clone()),
            )
            .await
        {
            warn!(error = %e, "failed to mark job failed");
        }

        // Dead-lettering is reserved for jobs that used every attempt.
        if job.is_final_attempt()
            && let Err(e) = self
                .client
                .move_to_dead_letter_queue(job.id, job.queue, failure.message)
                .await
        {
            warn!(error = %e, "failed to dead-letter job");
        }
        DeliveryOutcome::Failed
    }

    fn spawn_heartbeat(&self, job: &QueuedJob) -> tokio::task::JoinHandle<()> {
        let client = self.client.clone();
        let job_id = job.id;
        let period = self.heartbeat_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = client.heartbeat(job_id).await {
                    warn!(%job_id, error = %e, "heartbeat failed");
                }
            }
        })
    }
}
