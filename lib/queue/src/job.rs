//! Queue categories, retry policy and job records.

use chrono::{DateTime, Utc};
use genweave_core::{ExecutionId, NodeId, QueueJobId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Upper bound for any computed retry delay.
const MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

/// A named queue. Each category of work gets its own queue so a slow
/// provider cannot starve the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueName {
    WorkflowOrchestrator,
    ImageGeneration,
    VideoGeneration,
    LlmGeneration,
    Processing,
    SubWorkflow,
}

impl QueueName {
    pub const ALL: [QueueName; 6] = [
        QueueName::WorkflowOrchestrator,
        QueueName::ImageGeneration,
        QueueName::VideoGeneration,
        QueueName::LlmGeneration,
        QueueName::Processing,
        QueueName::SubWorkflow,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WorkflowOrchestrator => "workflow-orchestrator",
            Self::ImageGeneration => "image-generation",
            Self::VideoGeneration => "video-generation",
            Self::LlmGeneration => "llm-generation",
            Self::Processing => "processing",
            Self::SubWorkflow => "sub-workflow",
        }
    }

    /// Number of jobs a single worker process runs at once on this queue.
    ///
    /// Video generation is the most expensive per job and gets the fewest
    /// slots; orchestration passes are cheap.
    ///
    /// A sub-workflow job holds its slot until the child execution finishes,
    /// and a nested child takes one more slot on the same queue. The limit
    /// must stay above the deepest nesting allowed, or a deep chain waits on
    /// itself until it times out.
    #[must_use]
    pub fn default_concurrency(self) -> usize {
        match self {
            Self::WorkflowOrchestrator => 10,
            Self::ImageGeneration => 5,
            Self::VideoGeneration => 2,
            Self::LlmGeneration => 5,
            Self::Processing => 5,
            Self::SubWorkflow => 32,
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|q| q.as_str() == s)
            .ok_or_else(|| format!("unknown queue: {s}"))
    }
}

/// Delay policy between attempts of a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    /// Retry immediately.
    None,
    /// Same delay before every retry.
    Fixed { delay_ms: u64 },
    /// `base_delay_ms * 2^(attempt - 1)`, capped at one hour.
    Exponential { base_delay_ms: u64 },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            base_delay_ms: 1_000,
        }
    }
}

impl Backoff {
    /// Delay to wait after the given (1-based) failed attempt.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let delay = match *self {
            Self::None => Duration::ZERO,
            Self::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Self::Exponential { base_delay_ms } => {
                let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
                Duration::from_millis(base_delay_ms.saturating_mul(factor))
            }
        };
        delay.min(MAX_BACKOFF)
    }
}

/// Per-job delivery options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobOptions {
    /// Total attempts including the first.
    pub attempts: u32,
    pub backoff: Backoff,
    /// Lower runs sooner. Transports without priority support ignore it.
    pub priority: i32,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Backoff::default(),
            priority: 0,
        }
    }
}

impl JobOptions {
    /// Options for work that must not be retried.
    #[must_use]
    pub fn single_attempt() -> Self {
        Self {
            attempts: 1,
            backoff: Backoff::None,
            priority: 0,
        }
    }
}

/// A job as carried by a transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedJob {
    pub id: QueueJobId,
    pub queue: QueueName,
    pub name: String,
    pub payload: JsonValue,
    pub options: JobOptions,
    /// Attempts that already finished before this delivery.
    pub attempts_made: u32,
}

impl QueuedJob {
    /// The 1-based number of the attempt this delivery represents.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempts_made + 1
    }

    /// Whether a failure of this delivery exhausts the job's attempts.
    #[must_use]
    pub fn is_final_attempt(&self) -> bool {
        self.attempt() >= self.options.attempts.max(1)
    }

    /// Decodes the payload into a typed job body.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload does not match `T`.
    pub fn payload_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Input for [`QueueClient::enqueue`](crate::QueueClient::enqueue).
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub execution_id: Option<ExecutionId>,
    pub node_id: Option<NodeId>,
    pub data: JsonValue,
}

impl NewJob {
    #[must_use]
    pub fn new(data: JsonValue) -> Self {
        Self {
            execution_id: None,
            node_id: None,
            data,
        }
    }

    #[must_use]
    pub fn for_execution(mut self, execution_id: ExecutionId) -> Self {
        self.execution_id = Some(execution_id);
        self
    }

    #[must_use]
    pub fn for_node(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }
}

/// Lifecycle state of a durable job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Active,
    Completed,
    Failed,
}

impl JobStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLogEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub level: LogLevel,
}

/// Optional fields written alongside a status change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobStatusUpdate {
    pub result: Option<JsonValue>,
    pub error: Option<String>,
    pub attempts_made: Option<u32>,
}

impl JobStatusUpdate {
    #[must_use]
    pub fn with_result(result: JsonValue) -> Self {
        Self {
            result: Some(result),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_error(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn attempts(mut self, attempts_made: u32) -> Self {
        self.attempts_made = Some(attempts_made);
        self
    }
}

/// The durable mirror of a job, kept for audit and recovery independently of
/// the transport's own bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueJob {
    pub job_id: QueueJobId,
    pub queue_name: QueueName,
    pub name: String,
    pub execution_id: Option<ExecutionId>,
    pub node_id: Option<NodeId>,
    pub status: JobStatus,
    pub data: JsonValue,
    pub options: JobOptions,
    pub result: Option<JsonValue>,
    pub error: Option<String>,
    pub attempts_made: u32,
    pub logs: Vec<JobLogEntry>,
    pub moved_to_dlq: bool,
    pub dlq_reason: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub recovery_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueJob {
    /// A fresh pending record.
    #[must_use]
    pub fn new(queue: QueueName, name: impl Into<String>, job: NewJob, options: JobOptions) -> Self {
        let now = Utc::now();
        Self {
            job_id: QueueJobId::new(),
            queue_name: queue,
            name: name.into(),
            execution_id: job.execution_id,
            node_id: job.node_id,
            status: JobStatus::Pending,
            data: job.data,
            options,
            result: None,
            error: None,
            attempts_made: 0,
            logs: Vec::new(),
            moved_to_dlq: false,
            dlq_reason: None,
            last_heartbeat: None,
            recovery_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// The transport form of this record.
    ///
    /// A record whose last attempt was still active counts that attempt as
    /// made, so a recovered job does not get an extra try.
    #[must_use]
    pub fn to_queued(&self) -> QueuedJob {
        QueuedJob {
            id: self.job_id,
            queue: self.queue_name,
            name: self.name.clone(),
            payload: self.data.clone(),
            options: self.options,
            attempts_made: self.attempts_made,
        }
    }
}
