//! Queue client handle shared by every component that enqueues work.

use crate::error::QueueError;
use crate::job::{JobOptions, JobStatus, JobStatusUpdate, LogLevel, NewJob, QueueJob, QueueName, QueuedJob};
use crate::record::JobRecordStore;
use async_trait::async_trait;
use genweave_core::QueueJobId;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// A transport that moves jobs to workers.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Makes the job available to workers on its queue.
    async fn enqueue(&self, job: QueuedJob) -> Result<(), QueueError>;

    /// Makes the job available again once `delay` has passed.
    async fn requeue(&self, job: QueuedJob, delay: Duration) -> Result<(), QueueError>;
}

/// Publishes jobs and maintains their durable records.
///
/// Every job gets a record before it reaches the transport, so a worker
/// never sees a job the record store does not know about.
#[derive(Clone)]
pub struct QueueClient {
    transport: Arc<dyn JobQueue>,
    records: Arc<dyn JobRecordStore>,
}

impl QueueClient {
    #[must_use]
    pub fn new(transport: Arc<dyn JobQueue>, records: Arc<dyn JobRecordStore>) -> Self {
        Self { transport, records }
    }

    #[must_use]
    pub fn records(&self) -> &Arc<dyn JobRecordStore> {
        &self.records
    }

    /// Records and publishes a new job.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written or the transport
    /// rejects the job. A rejected job's record is left `failed`.
    #[instrument(skip(self, job, options), fields(queue = %queue))]
    pub async fn enqueue(
        &self,
        queue: QueueName,
        name: &str,
        job: NewJob,
        options: JobOptions,
    ) -> Result<QueueJobId, QueueError> {
        let record = QueueJob::new(queue, name, job, options);
        let job_id = record.job_id;
        let queued = record.to_queued();
        self.records.create_job(record).await?;

        if let Err(e) = self.transport.enqueue(queued).await {
            if let Err(record_err) = self
                .records
                .update_job_status(
                    job_id,
                    JobStatus::Failed,
                    JobStatusUpdate::with_error(e.to_string()),
                )
                .await
            {
                warn!(%job_id, error = %record_err, "failed to mark unpublished job");
            }
            return Err(e);
        }

        debug!(%job_id, "job enqueued");
        Ok(job_id)
    }

    /// Hands an existing job back to the transport.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport rejects the job.
    pub async fn requeue(&self, job: QueuedJob, delay: Duration) -> Result<(), QueueError> {
        self.transport.requeue(job, delay).await
    }

    /// # Errors
    ///
    /// Returns an error if the record cannot be updated.
    pub async fn update_job_status(
        &self,
        job_id: QueueJobId,
        status: JobStatus,
        extra: JobStatusUpdate,
    ) -> Result<(), QueueError> {
        Ok(self.records.update_job_status(job_id, status, extra).await?)
    }

    /// Appends to the job's log. Failures are logged and otherwise ignored.
    pub async fn add_job_log(&self, job_id: QueueJobId, message: impl Into<String>, level: LogLevel) {
        if let Err(e) = self.records.add_job_log(job_id, message.into(), level).await {
            warn!(%job_id, error = %e, "failed to append job log");
        }
    }

    /// # Errors
    ///
    /// Returns an error if the record cannot be updated.
    pub async fn move_to_dead_letter_queue(
        &self,
        job_id: QueueJobId,
        queue: QueueName,
        reason: impl Into<String>,
    ) -> Result<(), QueueError> {
        let reason = reason.into();
        warn!(%job_id, %queue, %reason, "moving job to dead-letter queue");
        Ok(self
            .records
            .move_to_dead_letter_queue(job_id, queue, reason)
            .await?)
    }

    /// # Errors
    ///
    /// Returns an error if the record cannot be updated.
    pub async fn heartbeat(&self, job_id: QueueJobId) -> Result<(), QueueError> {
        Ok(self.records.touch_heartbeat(job_id).await?)
    }

    /// # Errors
    ///
    /// Returns an error if the job is unknown.
    pub async fn find_job(&self, job_id: QueueJobId) -> Result<QueueJob, QueueError> {
        Ok(self.records.find_job(job_id).await?)
    }

    /// Takes a dead-lettered job out of the dead-letter queue and runs it
    /// again with a fresh set of attempts.
    ///
    /// # Errors
    ///
    /// Returns an error if the job is unknown, is not dead-lettered, or
    /// cannot be published.
    #[instrument(skip(self))]
    pub async fn retry_dead_letter(&self, job_id: QueueJobId) -> Result<QueuedJob, QueueError> {
        let job = self.records.find_job(job_id).await?;
        if !job.moved_to_dlq {
            return Err(QueueError::InvalidState {
                job_id,
                reason: "job is not in the dead-letter queue".to_string(),
            });
        }
        let reset = self.records.reset_dead_letter(job_id).await?;
        let queued = reset.to_queued();
        self.transport.enqueue(queued.clone()).await?;
        info!(%job_id, queue = %reset.queue_name, "dead-lettered job resubmitted");
        Ok(queued)
    }
}
