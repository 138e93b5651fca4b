//! Durable job-status mirror.
//!
//! Transports forget a job once it is acknowledged. The record store keeps
//! status, attempts, logs and dead-letter state so that operators can audit
//! work and the stall-recovery sweep can find jobs whose worker died.

use crate::error::RecordStoreError;
use crate::job::{JobLogEntry, JobStatus, JobStatusUpdate, LogLevel, QueueJob, QueueName};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use genweave_core::QueueJobId;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// How many terminal records to keep. Dead-lettered jobs are never pruned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    pub keep_completed: usize,
    pub keep_failed: usize,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            keep_completed: 1_000,
            keep_failed: 5_000,
        }
    }
}

#[async_trait]
pub trait JobRecordStore: Send + Sync {
    async fn create_job(&self, job: QueueJob) -> Result<(), RecordStoreError>;

    async fn find_job(&self, job_id: QueueJobId) -> Result<QueueJob, RecordStoreError>;

    async fn update_job_status(
        &self,
        job_id: QueueJobId,
        status: JobStatus,
        extra: JobStatusUpdate,
    ) -> Result<(), RecordStoreError>;

    async fn add_job_log(
        &self,
        job_id: QueueJobId,
        message: String,
        level: LogLevel,
    ) -> Result<(), RecordStoreError>;

    /// Marks the job dead-lettered. The record stays failed until an
    /// operator resets it.
    async fn move_to_dead_letter_queue(
        &self,
        job_id: QueueJobId,
        queue: QueueName,
        reason: String,
    ) -> Result<(), RecordStoreError>;

    async fn touch_heartbeat(&self, job_id: QueueJobId) -> Result<(), RecordStoreError>;

    /// Active jobs whose last heartbeat is older than `heartbeat_before`.
    async fn find_stalled(
        &self,
        heartbeat_before: DateTime<Utc>,
    ) -> Result<Vec<QueueJob>, RecordStoreError>;

    /// Puts a stalled job back to pending and bumps its recovery count.
    /// Returns the new count.
    async fn record_recovery(&self, job_id: QueueJobId) -> Result<u32, RecordStoreError>;

    /// Most recently dead-lettered jobs first.
    async fn list_dead_letter(&self, limit: usize) -> Result<Vec<QueueJob>, RecordStoreError>;

    /// Clears dead-letter state and attempt counts so the job can run again.
    async fn reset_dead_letter(&self, job_id: QueueJobId) -> Result<QueueJob, RecordStoreError>;

    /// Deletes the oldest terminal records beyond the retention counts.
    /// Returns how many were deleted.
    async fn prune_terminal(&self, retention: Retention) -> Result<u64, RecordStoreError>;
}

/// In-process record store for tests and single-node deployments.
#[derive(Default)]
pub struct InMemoryJobRecordStore {
    jobs: Mutex<HashMap<QueueJobId, QueueJob>>,
    dead_letters: Mutex<Vec<(QueueJobId, QueueName, String)>>,
}

impl InMemoryJobRecordStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every dead-letter move in call order.
    pub async fn dead_letter_moves(&self) -> Vec<(QueueJobId, QueueName, String)> {
        self.dead_letters.lock().await.clone()
    }

    pub async fn all(&self) -> Vec<QueueJob> {
        let mut jobs: Vec<_> = self.jobs.lock().await.values().cloned().collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    async fn modify<T>(
        &self,
        job_id: QueueJobId,
        f: impl FnOnce(&mut QueueJob) -> T + Send,
    ) -> Result<T, RecordStoreError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(&job_id)
            .ok_or(RecordStoreError::NotFound { job_id })?;
        let out = f(job);
        job.updated_at = Utc::now();
        Ok(out)
    }
}

#[async_trait]
impl JobRecordStore for InMemoryJobRecordStore {
    async fn create_job(&self, job: QueueJob) -> Result<(), RecordStoreError> {
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&job.job_id) {
            return Err(RecordStoreError::AlreadyExists { job_id: job.job_id });
        }
        jobs.insert(job.job_id, job);
        Ok(())
    }

    async fn find_job(&self, job_id: QueueJobId) -> Result<QueueJob, RecordStoreError> {
        self.jobs
            .lock()
            .await
            .get(&job_id)
            .cloned()
            .ok_or(RecordStoreError::NotFound { job_id })
    }

    async fn update_job_status(
        &self,
        job_id: QueueJobId,
        status: JobStatus,
        extra: JobStatusUpdate,
    ) -> Result<(), RecordStoreError> {
        self.modify(job_id, |job| {
            job.status = status;
            if let Some(result) = extra.result {
                job.result = Some(result);
            }
            if let Some(error) = extra.error {
                job.error = Some(error);
            }
            if let Some(attempts) = extra.attempts_made {
                job.attempts_made = attempts;
            }
        })
        .await
    }

    async fn add_job_log(
        &self,
        job_id: QueueJobId,
        message: String,
        level: LogLevel,
    ) -> Result<(), RecordStoreError> {
        self.modify(job_id, |job| {
            job.logs.push(JobLogEntry {
                timestamp: Utc::now(),
                message,
                level,
            });
        })
        .await
    }

    async fn move_to_dead_letter_queue(
        &self,
        job_id: QueueJobId,
        queue: QueueName,
        reason: String,
    ) -> Result<(), RecordStoreError> {
        let logged = reason.clone();
        self.modify(job_id, |job| {
            job.status = JobStatus::Failed;
            job.moved_to_dlq = true;
            job.dlq_reason = Some(reason);
        })
        .await?;
        self.dead_letters.lock().await.push((job_id, queue, logged));
        Ok(())
    }

    async fn touch_heartbeat(&self, job_id: QueueJobId) -> Result<(), RecordStoreError> {
        self.modify(job_id, |job| job.last_heartbeat = Some(Utc::now()))
            .await
    }

    async fn find_stalled(
        &self,
        heartbeat_before: DateTime<Utc>,
    ) -> Result<Vec<QueueJob>, RecordStoreError> {
        let jobs = self.jobs.lock().await;
        let mut stalled: Vec<_> = jobs
            .values()
            .filter(|j| j.status == JobStatus::Active && !j.moved_to_dlq)
            .filter(|j| j.last_heartbeat.unwrap_or(j.updated_at) < heartbeat_before)
            .cloned()
            .collect();
        stalled.sort_by_key(|j| j.created_at);
        Ok(stalled)
    }

    async fn record_recovery(&self, job_id: QueueJobId) -> Result<u32, RecordStoreError> {
        self.modify(job_id, |job| {
            job.status = JobStatus::Pending;
            job.recovery_count += 1;
            job.recovery_count
        })
        .await
    }

    async fn list_dead_letter(&self, limit: usize) -> Result<Vec<QueueJob>, RecordStoreError> {
        let jobs = self.jobs.lock().await;
        let mut dead: Vec<_> = jobs.values().filter(|j| j.moved_to_dlq).cloned().collect();
        dead.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        dead.truncate(limit);
        Ok(dead)
    }

    async fn reset_dead_letter(&self, job_id: QueueJobId) -> Result<QueueJob, RecordStoreError> {
        self.modify(job_id, |job| {
            job.moved_to_dlq = false;
            job.dlq_reason = None;
            job.status = JobStatus::Pending;
            job.attempts_made = 0;
            job.error = None;
            job.clone()
        })
        .await
    }

    async fn prune_terminal(&self, retention: Retention) -> Result<u64, RecordStoreError> {
        let mut jobs = self.jobs.lock().await;
        let mut doomed = Vec::new();
        for (status, keep) in [
            (JobStatus::Completed, retention.keep_completed),
            (JobStatus::Failed, retention.keep_failed),
        ] {
            let mut matching: Vec<_> = jobs
                .values()
                .filter(|j| j.status == status && !j.moved_to_dlq)
                .map(|j| (j.updated_at, j.job_id))
                .collect();
            matching.sort_by(|a, b| b.0.cmp(&a.0));
            doomed.extend(matching.into_iter().skip(keep).map(|(_, id)| id));
        }
        for id in &doomed {
            jobs.remove(id);
        }
        Ok(doomed.len() as u64)
    }
}
