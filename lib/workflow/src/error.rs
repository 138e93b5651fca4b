//! Error types for the workflow crate.
//!
//! - `GraphError`: definition validation and graph analysis
//! - `StoreError`: execution state persistence
//! - `SourceError`: loading workflow definitions
//! - `EngineError`: everything the engine can hit while running a node or a
//!   pass, classified as retryable or fatal

use genweave_core::{ExecutionId, NodeId, WorkflowId};
use genweave_provider::ProviderError;
use genweave_queue::{JobFailure, QueueError};
use std::fmt;

/// Errors from graph validation and analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// Two nodes share an ID.
    DuplicateNode { node_id: NodeId },
    /// An edge names a node that does not exist.
    DanglingEdge { source: NodeId, target: NodeId, missing: NodeId },
    /// The handles at either end of an edge carry different kinds of data.
    IncompatibleHandles {
        source: NodeId,
        source_handle: String,
        target: NodeId,
        target_handle: String,
    },
    /// Graph contains cycles.
    CycleDetected,
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateNode { node_id } => write!(f, "duplicate node id: {node_id}"),
            Self::DanglingEdge {
                source,
                target,
                missing,
            } => write!(
                f,
                "edge {source} -> {target} references unknown node {missing}"
            ),
            Self::IncompatibleHandles {
                source,
                source_handle,
                target,
                target_handle,
            } => write!(
                f,
                "incompatible handles: {source}:{source_handle} -> {target}:{target_handle}"
            ),
            Self::CycleDetected => write!(f, "Workflow contains cycles"),
        }
    }
}

impl std::error::Error for GraphError {}

/// Errors from an [`ExecutionStore`](crate::ExecutionStore).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    NotFound { execution_id: ExecutionId },
    /// The status change would move backwards or out of a terminal state.
    InvalidTransition {
        execution_id: ExecutionId,
        from: String,
        to: String,
    },
    /// Node results are frozen once the execution is terminal.
    ExecutionTerminal { execution_id: ExecutionId },
    StorageFailed { message: String },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { execution_id } => write!(f, "execution not found: {execution_id}"),
            Self::InvalidTransition {
                execution_id,
                from,
                to,
            } => write!(
                f,
                "invalid status transition for {execution_id}: {from} -> {to}"
            ),
            Self::ExecutionTerminal { execution_id } => {
                write!(f, "execution {execution_id} is already finished")
            }
            Self::StorageFailed { message } => write!(f, "execution storage failed: {message}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Errors from a [`WorkflowSource`](crate::WorkflowSource).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    NotFound { workflow_id: WorkflowId },
    /// The stored definition could not be decoded.
    Malformed { workflow_id: WorkflowId, reason: String },
    StorageFailed { message: String },
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { workflow_id } => write!(f, "workflow not found: {workflow_id}"),
            Self::Malformed {
                workflow_id,
                reason,
            } => write!(f, "workflow {workflow_id} is malformed: {reason}"),
            Self::StorageFailed { message } => write!(f, "workflow storage failed: {message}"),
        }
    }
}

impl std::error::Error for SourceError {}

/// Errors raised while orchestrating or running nodes.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    Store(StoreError),
    Queue(QueueError),
    Provider(ProviderError),
    Source(SourceError),
    Graph(GraphError),
    /// A queued job payload could not be understood.
    InvalidJob { reason: String },
    /// Node configuration is unusable.
    InvalidNode { node_id: NodeId, reason: String },
    /// Pending nodes remain but none can ever become ready.
    Inconsistent {
        execution_id: ExecutionId,
        pending: Vec<NodeId>,
    },
    DepthExceeded { depth: u32, max: u32 },
    MissingInput { node_id: NodeId, input: String },
    ChildFailed {
        child_execution_id: ExecutionId,
        reason: String,
    },
    PredictionFailed { prediction_id: String, reason: String },
    Timeout { what: String },
}

impl EngineError {
    /// Whether another attempt of the same job may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(StoreError::StorageFailed { .. })
            | Self::Source(SourceError::StorageFailed { .. })
            | Self::Queue(_) => true,
            Self::Provider(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// The queue-level failure for a job that hit this error.
    #[must_use]
    pub fn to_job_failure(&self) -> JobFailure {
        if self.is_retryable() {
            JobFailure::retryable(self.to_string())
        } else {
            JobFailure::fatal(self.to_string())
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store(e) => write!(f, "{e}"),
            Self::Queue(e) => write!(f, "{e}"),
            Self::Provider(e) => write!(f, "{e}"),
            Self::Source(e) => write!(f, "{e}"),
            Self::Graph(e) => write!(f, "{e}"),
            Self::InvalidJob { reason } => write!(f, "invalid job payload: {reason}"),
            Self::InvalidNode { node_id, reason } => write!(f, "node {node_id}: {reason}"),
            Self::Inconsistent {
                execution_id,
                pending,
            } => {
                let ids: Vec<_> = pending.iter().map(NodeId::as_str).collect();
                write!(
                    f,
                    "execution {execution_id} has pending nodes with no way to become ready: {}",
                    ids.join(", ")
                )
            }
            Self::DepthExceeded { depth, max } => write!(
                f,
                "maximum sub-workflow depth exceeded: depth {depth} reached the limit of {max}"
            ),
            Self::MissingInput { node_id, input } => write!(
                f,
                "required sub-workflow input '{input}' has no value (node {node_id})"
            ),
            Self::ChildFailed {
                child_execution_id,
                reason,
            } => write!(f, "sub-workflow {child_execution_id} failed: {reason}"),
            Self::PredictionFailed {
                prediction_id,
                reason,
            } => write!(f, "prediction {prediction_id} failed: {reason}"),
            Self::Timeout { what } => write!(f, "timed out waiting for {what}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<QueueError> for EngineError {
    fn from(e: QueueError) -> Self {
        Self::Queue(e)
    }
}

impl From<ProviderError> for EngineError {
    fn from(e: ProviderError) -> Self {
        Self::Provider(e)
    }
}

impl From<SourceError> for EngineError {
    fn from(e: SourceError) -> Self {
        Self::Source(e)
    }
}

impl From<GraphError> for EngineError {
    fn from(e: GraphError) -> Self {
        Self::Graph(e)
    }
}
