//! Stalled job recovery.
//!
//! A worker that dies mid-job leaves its record `active` with a heartbeat
//! that stops advancing. The sweep requeues such jobs. A job that keeps
//! stalling is dead-lettered and its node failed, like any other terminal
//! failure. Each sweep also prunes old terminal job records.

use crate::completion::CompletionHandler;
use crate::error::EngineError;
use chrono::Utc;
use genweave_queue::{
    JobStatus, JobStatusUpdate, LogLevel, QueueClient, QueueError, QueueJob, Retention,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Configuration for the stall recovery sweep.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RecoveryConfig {
    /// Seconds between sweeps.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Seconds without a heartbeat before an active job counts as stalled.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    /// Requeues allowed before a stalled job is dead-lettered.
    #[serde(default = "default_max_recoveries")]
    pub max_recoveries: u32,
    #[serde(default = "default_keep_completed")]
    pub keep_completed: usize,
    #[serde(default = "default_keep_failed")]
    pub keep_failed: usize,
}

fn default_interval_secs() -> u64 {
    30
}

fn default_stale_after_secs() -> u64 {
    60
}

fn default_max_recoveries() -> u32 {
    3
}

fn default_keep_completed() -> usize {
    Retention::default().keep_completed
}

fn default_keep_failed() -> usize {
    Retention::default().keep_failed
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            stale_after_secs: default_stale_after_secs(),
            max_recoveries: default_max_recoveries(),
            keep_completed: default_keep_completed(),
            keep_failed: default_keep_failed(),
        }
    }
}

impl RecoveryConfig {
    #[must_use]
    pub fn retention(&self) -> Retention {
        Retention {
            keep_completed: self.keep_completed,
            keep_failed: self.keep_failed,
        }
    }
}

/// Totals from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub requeued: usize,
    pub dead_lettered: usize,
    pub pruned: u64,
}

/// Background stall recovery task.
pub struct StallRecoveryTask {
    queue: QueueClient,
    completion: Arc<CompletionHandler>,
    config: RecoveryConfig,
}

impl StallRecoveryTask {
    #[must_use]
    pub fn new(queue: QueueClient, completion: Arc<CompletionHandler>, config: RecoveryConfig) -> Self {
        Self {
            queue,
            completion,
            config,
        }
    }

    /// Sweeps on an interval until `shutdown` flips to `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval_secs,
            stale_after_secs = self.config.stale_after_secs,
            max_recoveries = self.config.max_recoveries,
            "stall recovery task started"
        );

        let interval = Duration::from_secs(self.config.interval_secs);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("stall recovery task shutting down");
                        break;
                    }
                }
                () = tokio::time::sleep(interval) => {
                    match self.sweep().await {
                        Ok(report) if report != SweepReport::default() => {
                            info!(
                                requeued = report.requeued,
                                dead_lettered = report.dead_lettered,
                                pruned = report.pruned,
                                "stall recovery sweep finished"
                            );
                        }
                        Ok(_) => {}
                        Err(err) => error!(error = %err, "stall recovery sweep failed"),
                    }
                }
            }
        }
    }

    /// Runs one sweep.
    ///
    /// # Errors
    ///
    /// Returns an error if stalled jobs cannot be listed or records cannot be
    /// pruned. Failures on individual jobs are logged and skipped.
    pub async fn sweep(&self) -> Result<SweepReport, QueueError> {
        let stale_after = chrono::Duration::seconds(
            i64::try_from(self.config.stale_after_secs).unwrap_or(i64::MAX),
        );
        let cutoff = Utc::now() - stale_after;
        let stalled = self.queue.records().find_stalled(cutoff).await?;

        let mut report = SweepReport::default();
        for job in stalled {
            let job_id = job.job_id;
            let result = if job.recovery_count >= self.config.max_recoveries {
                self.dead_letter(&job).await.map(|()| report.dead_lettered += 1)
            } else {
                self.requeue(&job).await.map(|()| report.requeued += 1)
            };
            if let Err(e) = result {
                warn!(%job_id, error = %e, "failed to recover stalled job");
            }
        }

        report.pruned = self
            .queue
            .records()
            .prune_terminal(self.config.retention())
            .await?;
        Ok(report)
    }

    async fn requeue(&self, job: &QueueJob) -> Result<(), EngineError> {
        let count = self.queue.records().record_recovery(job.job_id).await.map_err(QueueError::from)?;
        self.queue
            .add_job_log(
                job.job_id,
                format!("recovered after missed heartbeats (recovery {count})"),
                LogLevel::Warn,
            )
            .await;
        self.queue.requeue(job.to_queued(), Duration::ZERO).await?;
        info!(job_id = %job.job_id, queue = %job.queue_name, count, "stalled job requeued");
        Ok(())
    }

    async fn dead_letter(&self, job: &QueueJob) -> Result<(), EngineError> {
        let reason = format!("job stalled {} times", job.recovery_count + 1);
        self.queue
            .update_job_status(
                job.job_id,
                JobStatus::Failed,
                JobStatusUpdate::with_error(reason.clone()),
            )
            .await?;
        self.queue
            .move_to_dead_letter_queue(job.job_id, job.queue_name, reason.clone())
            .await?;
        warn!(job_id = %job.job_id, queue = %job.queue_name, "stalled job dead-lettered");

        match (job.execution_id, &job.node_id) {
            (Some(execution_id), Some(node_id)) => {
                self.completion
                    .node_failed(execution_id, node_id, &reason)
                    .await?;
            }
            (Some(execution_id), None) => {
                self.completion
                    .fail_execution(execution_id, &reason)
                    .await?;
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{NodeDefinition, WorkflowDefinition};
    use crate::execution::{ExecutionStatus, NodeStatus};
    use crate::testing::{Harness, id};
    use genweave_core::ExecutionId;
    use genweave_queue::{QueueName, QueuedJob};
    use serde_json::json;

    fn eager(max_recoveries: u32) -> RecoveryConfig {
        RecoveryConfig {
            stale_after_secs: 0,
            max_recoveries,
            ..RecoveryConfig::default()
        }
    }

    /// Takes the node job off its queue the way a worker would, then lets
    /// its heartbeat go stale.
    async fn stall(h: &Harness, job: &QueuedJob) {
        h.engine
            .queue()
            .update_job_status(job.id, JobStatus::Active, JobStatusUpdate::default())
            .await
            .expect("active");
        h.engine.queue().heartbeat(job.id).await.expect("heartbeat");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    async fn dispatched(h: &Harness) -> (ExecutionId, QueuedJob) {
        let execution_id = h
            .start(WorkflowDefinition::new("single").with_node(NodeDefinition::new(
                "img",
                "imageGen",
                json!({}),
            )))
            .await;
        h.step(QueueName::WorkflowOrchestrator).await;
        let job = h
            .transport
            .pop(QueueName::ImageGeneration)
            .await
            .expect("node job");
        (execution_id, job)
    }

    #[tokio::test]
    async fn stalled_job_is_requeued() {
        let h = Harness::new();
        let (execution_id, job) = dispatched(&h).await;
        stall(&h, &job).await;

        let report = h.engine.recovery_task(eager(3)).sweep().await.expect("sweep");
        assert_eq!(report.requeued, 1);
        assert_eq!(report.dead_lettered, 0);

        let pending = h.transport.pending(QueueName::ImageGeneration).await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, job.id);
        let record = h.engine.queue().find_job(job.id).await.expect("record");
        assert_eq!(record.status, JobStatus::Pending);
        assert_eq!(record.recovery_count, 1);
        assert_eq!(
            h.execution(execution_id).await.status,
            ExecutionStatus::Running
        );
    }

    #[tokio::test]
    async fn healthy_job_is_left_alone() {
        let h = Harness::new();
        let (_, job) = dispatched(&h).await;
        h.engine
            .queue()
            .update_job_status(job.id, JobStatus::Active, JobStatusUpdate::default())
            .await
            .expect("active");
        h.engine.queue().heartbeat(job.id).await.expect("heartbeat");

        let config = RecoveryConfig {
            stale_after_secs: 60,
            ..RecoveryConfig::default()
        };
        let report = h.engine.recovery_task(config).sweep().await.expect("sweep");
        assert_eq!(report.requeued, 0);
        assert!(h.transport.pending(QueueName::ImageGeneration).await.is_empty());
    }

    #[tokio::test]
    async fn repeatedly_stalled_job_is_dead_lettered() {
        let h = Harness::new();
        let (execution_id, job) = dispatched(&h).await;
        let task = h.engine.recovery_task(eager(1));

        stall(&h, &job).await;
        assert_eq!(task.sweep().await.expect("first sweep").requeued, 1);
        stall(&h, &job).await;
        let report = task.sweep().await.expect("second sweep");
        assert_eq!(report.dead_lettered, 1);

        let moves = h.records.dead_letter_moves().await;
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].0, job.id);
        assert_eq!(moves[0].2, "job stalled 2 times");

        let execution = h.execution(execution_id).await;
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.node_status(&id("img")), Some(NodeStatus::Error));
        assert_eq!(
            execution.error.as_deref(),
            Some("Node img failed: job stalled 2 times")
        );
    }

    #[test]
    fn config_defaults_fill_missing_fields() {
        let config: RecoveryConfig =
            serde_json::from_value(json!({"stale_after_secs": 120})).expect("config");
        assert_eq!(config.stale_after_secs, 120);
        assert_eq!(config.interval_secs, 30);
        assert_eq!(config.max_recoveries, 3);
    }
}
