//! Durable queue job records in Postgres.

use super::decode_error;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use genweave_core::{ExecutionId, NodeId, QueueJobId};
use genweave_queue::{
    JobLogEntry, JobOptions, JobRecordStore, JobStatus, JobStatusUpdate, LogLevel, QueueJob,
    QueueName, RecordStoreError, Retention,
};
use serde_json::Value as JsonValue;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use std::str::FromStr;
use tracing::debug;

const JOB_COLUMNS: &str = r#"
    job_id, queue_name, name, execution_id, node_id, status, data, options, result, error,
    attempts_made, logs, moved_to_dlq, dlq_reason, last_heartbeat, recovery_count,
    created_at, updated_at
"#;

fn storage(e: sqlx::Error) -> RecordStoreError {
    RecordStoreError::StorageFailed {
        message: e.to_string(),
    }
}

fn count(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn column(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

/// Row type for job queries.
#[derive(FromRow)]
struct QueueJobRow {
    job_id: String,
    queue_name: String,
    name: String,
    execution_id: Option<String>,
    node_id: Option<String>,
    status: String,
    data: JsonValue,
    options: Json<JobOptions>,
    result: Option<JsonValue>,
    error: Option<String>,
    attempts_made: i32,
    logs: Json<Vec<JobLogEntry>>,
    moved_to_dlq: bool,
    dlq_reason: Option<String>,
    last_heartbeat: Option<DateTime<Utc>>,
    recovery_count: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl QueueJobRow {
    fn try_into_job(self) -> Result<QueueJob, sqlx::Error> {
        let job_id = QueueJobId::from_str(&self.job_id)
            .map_err(|e| decode_error("job id", &self.job_id, e))?;
        let queue_name = QueueName::from_str(&self.queue_name)
            .map_err(|e| decode_error("queue name", &self.queue_name, e))?;
        let status = JobStatus::from_str(&self.status)
            .map_err(|e| decode_error("job status", &self.status, e))?;
        let execution_id = self
            .execution_id
            .map(|id| ExecutionId::from_str(&id).map_err(|e| decode_error("execution id", &id, e)))
            .transpose()?;

        Ok(QueueJob {
            job_id,
            queue_name,
            name: self.name,
            execution_id,
            node_id: self.node_id.map(NodeId::from),
            status,
            data: self.data,
            options: self.options.0,
            result: self.result,
            error: self.error,
            attempts_made: count(self.attempts_made),
            logs: self.logs.0,
            moved_to_dlq: self.moved_to_dlq,
            dlq_reason: self.dlq_reason,
            last_heartbeat: self.last_heartbeat,
            recovery_count: count(self.recovery_count),
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn into_jobs(rows: Vec<QueueJobRow>) -> Result<Vec<QueueJob>, RecordStoreError> {
    rows.into_iter()
        .map(|r| r.try_into_job().map_err(storage))
        .collect()
}

/// [`JobRecordStore`] over a Postgres pool.
#[derive(Clone)]
pub struct PgJobRecordStore {
    pool: PgPool,
}

impl PgJobRecordStore {
    /// Creates a new store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Fails with `NotFound` when an update touched no row.
    fn expect_row(
        result: sqlx::postgres::PgQueryResult,
        job_id: QueueJobId,
    ) -> Result<(), RecordStoreError> {
        if result.rows_affected() == 0 {
            return Err(RecordStoreError::NotFound { job_id });
        }
        Ok(())
    }
}

#[async_trait]
impl JobRecordStore for PgJobRecordStore {
    async fn create_job(&self, job: QueueJob) -> Result<(), RecordStoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO queue_jobs
                (job_id, queue_name, name, execution_id, node_id, status, data, options, result,
                 error, attempts_made, logs, moved_to_dlq, dlq_reason, last_heartbeat,
                 recovery_count, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            ON CONFLICT (job_id) DO NOTHING
            "#,
        )
        .bind(job.job_id.to_string())
        .bind(job.queue_name.as_str())
        .bind(&job.name)
        .bind(job.execution_id.map(|id| id.to_string()))
        .bind(job.node_id.as_ref().map(|n| n.as_str().to_string()))
        .bind(job.status.as_str())
        .bind(&job.data)
        .bind(Json(&job.options))
        .bind(&job.result)
        .bind(&job.error)
        .bind(column(job.attempts_made))
        .bind(Json(&job.logs))
        .bind(job.moved_to_dlq)
        .bind(&job.dlq_reason)
        .bind(job.last_heartbeat)
        .bind(column(job.recovery_count))
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        if result.rows_affected() == 0 {
            return Err(RecordStoreError::AlreadyExists { job_id: job.job_id });
        }
        Ok(())
    }

    async fn find_job(&self, job_id: QueueJobId) -> Result<QueueJob, RecordStoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM queue_jobs WHERE job_id = $1");
        let row: Option<QueueJobRow> = sqlx::query_as(&sql)
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;

        match row {
            Some(r) => r.try_into_job().map_err(storage),
            None => Err(RecordStoreError::NotFound { job_id }),
        }
    }

    async fn update_job_status(
        &self,
        job_id: QueueJobId,
        status: JobStatus,
        extra: JobStatusUpdate,
    ) -> Result<(), RecordStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = $2,
                result = COALESCE($3, result),
                error = COALESCE($4, error),
                attempts_made = COALESCE($5, attempts_made),
                updated_at = NOW()
            WHERE job_id = $1
            "#,
        )
        .bind(job_id.to_string())
        .bind(status.as_str())
        .bind(extra.result)
        .bind(extra.error)
        .bind(extra.attempts_made.map(column))
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Self::expect_row(result, job_id)
    }

    async fn add_job_log(
        &self,
        job_id: QueueJobId,
        message: String,
        level: LogLevel,
    ) -> Result<(), RecordStoreError> {
        let entry = JobLogEntry {
            timestamp: Utc::now(),
            message,
            level,
        };
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET logs = logs || jsonb_build_array($2::jsonb), updated_at = NOW()
            WHERE job_id = $1
            "#,
        )
        .bind(job_id.to_string())
        .bind(Json(&entry))
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Self::expect_row(result, job_id)
    }

    async fn move_to_dead_letter_queue(
        &self,
        job_id: QueueJobId,
        queue: QueueName,
        reason: String,
    ) -> Result<(), RecordStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'failed', moved_to_dlq = TRUE, dlq_reason = $2, updated_at = NOW()
            WHERE job_id = $1
            "#,
        )
        .bind(job_id.to_string())
        .bind(&reason)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Self::expect_row(result, job_id)?;
        debug!(%job_id, %queue, "job record moved to dead-letter queue");
        Ok(())
    }

    async fn touch_heartbeat(&self, job_id: QueueJobId) -> Result<(), RecordStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET last_heartbeat = NOW(), updated_at = NOW()
            WHERE job_id = $1
            "#,
        )
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Self::expect_row(result, job_id)
    }

    async fn find_stalled(
        &self,
        heartbeat_before: DateTime<Utc>,
    ) -> Result<Vec<QueueJob>, RecordStoreError> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM queue_jobs
            WHERE status = 'active'
              AND moved_to_dlq = FALSE
              AND COALESCE(last_heartbeat, updated_at) < $1
            ORDER BY created_at ASC
            "#
        );
        let rows: Vec<QueueJobRow> = sqlx::query_as(&sql)
            .bind(heartbeat_before)
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;

        into_jobs(rows)
    }

    async fn record_recovery(&self, job_id: QueueJobId) -> Result<u32, RecordStoreError> {
        let row: Option<(i32,)> = sqlx::query_as(
            r#"
            UPDATE queue_jobs
            SET status = 'pending', recovery_count = recovery_count + 1, updated_at = NOW()
            WHERE job_id = $1
            RETURNING recovery_count
            "#,
        )
        .bind(job_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        row.map(|(recoveries,)| count(recoveries))
            .ok_or(RecordStoreError::NotFound { job_id })
    }

    async fn list_dead_letter(&self, limit: usize) -> Result<Vec<QueueJob>, RecordStoreError> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM queue_jobs
            WHERE moved_to_dlq = TRUE
            ORDER BY updated_at DESC
            LIMIT $1
            "#
        );
        let rows: Vec<QueueJobRow> = sqlx::query_as(&sql)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;

        into_jobs(rows)
    }

    async fn reset_dead_letter(&self, job_id: QueueJobId) -> Result<QueueJob, RecordStoreError> {
        let sql = format!(
            r#"
            UPDATE queue_jobs
            SET moved_to_dlq = FALSE, dlq_reason = NULL, status = 'pending', attempts_made = 0,
                error = NULL, updated_at = NOW()
            WHERE job_id = $1
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row: Option<QueueJobRow> = sqlx::query_as(&sql)
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;

        match row {
            Some(r) => r.try_into_job().map_err(storage),
            None => Err(RecordStoreError::NotFound { job_id }),
        }
    }

    async fn prune_terminal(&self, retention: Retention) -> Result<u64, RecordStoreError> {
        let mut deleted = 0;
        for (status, keep) in [
            (JobStatus::Completed, retention.keep_completed),
            (JobStatus::Failed, retention.keep_failed),
        ] {
            let result = sqlx::query(
                r#"
                DELETE FROM queue_jobs
                WHERE job_id IN (
                    SELECT job_id
                    FROM queue_jobs
                    WHERE status = $1 AND moved_to_dlq = FALSE
                    ORDER BY updated_at DESC
                    OFFSET $2
                )
                "#,
            )
            .bind(status.as_str())
            .bind(i64::try_from(keep).unwrap_or(i64::MAX))
            .execute(&self.pool)
            .await
            .map_err(storage)?;
            deleted += result.rows_affected();
        }
        Ok(deleted)
    }
}
