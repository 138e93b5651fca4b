//! Execution state.
//!
//! An execution is one run of a workflow definition. It tracks:
//! - Overall status, moving forward only
//! - One result per node that has started or finished
//! - The worklist of nodes not yet dispatched
//! - Links to parent and child executions for sub-workflows

use crate::error::StoreError;
use chrono::{DateTime, Utc};
use genweave_core::{ExecutionId, NodeId, WorkflowId};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use std::fmt;
use std::str::FromStr;

/// Deepest allowed sub-workflow nesting. Root executions have depth 0.
pub const MAX_DEPTH: u32 = 10;

/// The overall status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Returns true if this is a terminal status.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether an execution in this status may move to `next`.
    ///
    /// Terminal statuses never change and `running` never returns to
    /// `pending`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Pending => next != Self::Pending,
            Self::Running => next.is_terminal(),
            Self::Completed | Self::Failed | Self::Cancelled => false,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// The status of a single node within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Idle,
    Processing,
    Complete,
    Error,
}

impl NodeStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Processing => "processing",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "processing" => Ok(Self::Processing),
            "complete" => Ok(Self::Complete),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown node status: {other}")),
        }
    }
}

/// The recorded state of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeResult {
    pub node_id: NodeId,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prediction_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl NodeResult {
    #[must_use]
    pub fn new(node_id: NodeId, status: NodeStatus) -> Self {
        Self {
            node_id,
            status,
            output: None,
            error: None,
            prediction_id: None,
            updated_at: Utc::now(),
        }
    }

    /// Applies an update in place.
    pub fn apply(&mut self, update: NodeResultUpdate) {
        self.status = update.status;
        if update.output.is_some() {
            self.output = update.output;
        }
        if update.status == NodeStatus::Complete {
            self.error = None;
        } else if update.error.is_some() {
            self.error = update.error;
        }
        self.updated_at = Utc::now();
    }
}

/// A change to a node's result.
///
/// `None` fields leave the stored value untouched. Completing a node clears
/// any error left by an earlier attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeResultUpdate {
    pub status: NodeStatus,
    pub output: Option<JsonValue>,
    pub error: Option<String>,
}

impl NodeResultUpdate {
    #[must_use]
    pub fn idle() -> Self {
        Self {
            status: NodeStatus::Idle,
            output: None,
            error: None,
        }
    }

    #[must_use]
    pub fn processing() -> Self {
        Self {
            status: NodeStatus::Processing,
            output: None,
            error: None,
        }
    }

    /// Still in flight, but the last attempt failed and another will follow.
    #[must_use]
    pub fn retrying(error: impl Into<String>) -> Self {
        Self {
            status: NodeStatus::Processing,
            output: None,
            error: Some(error.into()),
        }
    }

    #[must_use]
    pub fn complete(output: JsonValue) -> Self {
        Self {
            status: NodeStatus::Complete,
            output: Some(output),
            error: None,
        }
    }

    #[must_use]
    pub fn error(error: impl Into<String>) -> Self {
        Self {
            status: NodeStatus::Error,
            output: None,
            error: Some(error.into()),
        }
    }

    #[must_use]
    pub fn with_output(mut self, output: JsonValue) -> Self {
        self.output = Some(output);
        self
    }
}

/// A node waiting to be dispatched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingNode {
    pub node_id: NodeId,
    pub node_type: String,
    #[serde(default)]
    pub node_data: JsonValue,
    #[serde(default)]
    pub depends_on: Vec<NodeId>,
}

/// How many ready nodes a pass may dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// At most one node in flight; used by root executions.
    Sequential,
    /// Every ready node is dispatched; used by child executions.
    AllReady,
}

impl DispatchMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::AllReady => "all_ready",
        }
    }
}

impl FromStr for DispatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sequential" => Ok(Self::Sequential),
            "all_ready" => Ok(Self::AllReady),
            other => Err(format!("unknown dispatch mode: {other}")),
        }
    }
}

/// One run of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub status: ExecutionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub total_cost: f64,
    pub node_results: Vec<NodeResult>,
    pub pending_nodes: Vec<PendingNode>,
    pub parent_execution_id: Option<ExecutionId>,
    pub parent_node_id: Option<NodeId>,
    pub child_execution_ids: Vec<ExecutionId>,
    pub depth: u32,
    pub dispatch_mode: DispatchMode,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Execution {
    /// Creates a pending root execution.
    #[must_use]
    pub fn new(workflow_id: WorkflowId) -> Self {
        let now = Utc::now();
        Self {
            id: ExecutionId::new(),
            workflow_id,
            status: ExecutionStatus::Pending,
            started_at: None,
            completed_at: None,
            error: None,
            total_cost: 0.0,
            node_results: Vec::new(),
            pending_nodes: Vec::new(),
            parent_execution_id: None,
            parent_node_id: None,
            child_execution_ids: Vec::new(),
            depth: 0,
            dispatch_mode: DispatchMode::Sequential,
            created_at: now,
            updated_at: now,
        }
    }

    /// Creates a pending child execution run on behalf of a parent node.
    #[must_use]
    pub fn child(
        workflow_id: WorkflowId,
        parent_execution_id: ExecutionId,
        parent_node_id: NodeId,
        depth: u32,
    ) -> Self {
        Self {
            parent_execution_id: Some(parent_execution_id),
            parent_node_id: Some(parent_node_id),
            depth,
            dispatch_mode: DispatchMode::AllReady,
            ..Self::new(workflow_id)
        }
    }

    #[must_use]
    pub fn node_result(&self, node_id: &NodeId) -> Option<&NodeResult> {
        self.node_results.iter().find(|r| &r.node_id == node_id)
    }

    #[must_use]
    pub fn node_status(&self, node_id: &NodeId) -> Option<NodeStatus> {
        self.node_result(node_id).map(|r| r.status)
    }

    #[must_use]
    pub fn is_node_complete(&self, node_id: &NodeId) -> bool {
        self.node_status(node_id) == Some(NodeStatus::Complete)
    }

    #[must_use]
    pub fn is_pending(&self, node_id: &NodeId) -> bool {
        self.pending_nodes.iter().any(|p| &p.node_id == node_id)
    }

    /// Whether any dispatched node has not finished yet.
    #[must_use]
    pub fn has_in_flight(&self) -> bool {
        self.node_results
            .iter()
            .any(|r| r.status == NodeStatus::Processing)
    }

    /// Pending nodes whose dependencies have all completed, in worklist order.
    ///
    /// A node that already has a final result is never ready again.
    #[must_use]
    pub fn ready_nodes(&self) -> Vec<&PendingNode> {
        self.pending_nodes
            .iter()
            .filter(|p| !self.is_node_finished(&p.node_id))
            .filter(|p| p.depends_on.iter().all(|d| self.is_node_complete(d)))
            .collect()
    }

    fn is_node_finished(&self, node_id: &NodeId) -> bool {
        self.node_status(node_id).is_some_and(NodeStatus::is_terminal)
    }

    /// Pending nodes that can never run because a dependency errored, paired
    /// with the first errored dependency.
    #[must_use]
    pub fn blocked_nodes(&self) -> Vec<(&PendingNode, &NodeId)> {
        self.pending_nodes
            .iter()
            .filter_map(|p| {
                p.depends_on
                    .iter()
                    .find(|d| self.node_status(d) == Some(NodeStatus::Error))
                    .map(|d| (p, d))
            })
            .collect()
    }

    /// Starts a pending execution in one step: completes its boundary nodes,
    /// installs the worklist and moves it to running.
    ///
    /// Returns `Ok(false)` and changes nothing once the execution has left
    /// `pending`, so only one pass ever installs a worklist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidTransition`] if the move to running is
    /// refused.
    pub fn begin(
        &mut self,
        boundary_nodes: &[NodeId],
        worklist: Vec<PendingNode>,
    ) -> Result<bool, StoreError> {
        if self.status != ExecutionStatus::Pending {
            return Ok(false);
        }
        for node_id in boundary_nodes {
            // Pre-populated inputs of a child execution keep their values.
            if !self.is_node_complete(node_id) {
                self.upsert_node_result(node_id, NodeResultUpdate::complete(json!({})))?;
            }
        }
        self.pending_nodes = worklist;
        self.transition(ExecutionStatus::Running, None)
    }

    /// Moves the execution to `next`, stamping start and completion times.
    ///
    /// Returns `Ok(false)` when the execution is already in `next`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidTransition`] for any backwards move or any
    /// move out of a terminal status.
    pub fn transition(
        &mut self,
        next: ExecutionStatus,
        error: Option<String>,
    ) -> Result<bool, StoreError> {
        if self.status == next {
            return Ok(false);
        }
        if !self.status.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                execution_id: self.id,
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }

        let now = Utc::now();
        if next == ExecutionStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        if error.is_some() {
            self.error = error;
        }
        self.status = next;
        self.updated_at = now;
        Ok(true)
    }

    /// Inserts or updates a node's result.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ExecutionTerminal`] once the execution has
    /// finished; results are frozen from then on.
    pub fn upsert_node_result(
        &mut self,
        node_id: &NodeId,
        update: NodeResultUpdate,
    ) -> Result<(), StoreError> {
        if self.status.is_terminal() {
            return Err(StoreError::ExecutionTerminal {
                execution_id: self.id,
            });
        }
        match self.node_results.iter_mut().find(|r| &r.node_id == node_id) {
            Some(existing) => existing.apply(update),
            None => {
                let mut result = NodeResult::new(node_id.clone(), update.status);
                result.apply(update);
                self.node_results.push(result);
            }
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Associates a provider prediction with a node, giving the node a
    /// processing result first if it has none.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ExecutionTerminal`] if a result has to be
    /// created after the execution finished.
    pub fn attach_prediction(
        &mut self,
        node_id: &NodeId,
        prediction_id: &str,
    ) -> Result<(), StoreError> {
        if self.node_result(node_id).is_none() {
            self.upsert_node_result(node_id, NodeResultUpdate::processing())?;
        }
        if let Some(result) = self.node_results.iter_mut().find(|r| &r.node_id == node_id) {
            result.prediction_id = Some(prediction_id.to_string());
            result.updated_at = Utc::now();
        }
        Ok(())
    }

    /// Removes a node from the worklist and marks it processing in one step,
    /// so a node is never both off the worklist and idle.
    ///
    /// Returns `false` if the node was not pending. A worklist entry for a
    /// node that already has a final result is dropped without claiming it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ExecutionTerminal`] once the execution has
    /// finished.
    pub fn claim_pending(&mut self, node_id: &NodeId) -> Result<bool, StoreError> {
        if self.status.is_terminal() {
            return Err(StoreError::ExecutionTerminal {
                execution_id: self.id,
            });
        }
        let Some(position) = self.pending_nodes.iter().position(|p| &p.node_id == node_id) else {
            return Ok(false);
        };
        self.pending_nodes.remove(position);
        if self.is_node_finished(node_id) {
            self.updated_at = Utc::now();
            return Ok(false);
        }
        self.upsert_node_result(node_id, NodeResultUpdate::processing())?;
        Ok(true)
    }

    /// Puts a claimed node back on the worklist and marks it idle.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ExecutionTerminal`] once the execution has
    /// finished.
    pub fn restore_pending(&mut self, node: PendingNode) -> Result<(), StoreError> {
        if self.status.is_terminal() {
            return Err(StoreError::ExecutionTerminal {
                execution_id: self.id,
            });
        }
        let node_id = node.node_id.clone();
        if !self.is_pending(&node_id) {
            self.pending_nodes.push(node);
        }
        self.upsert_node_result(&node_id, NodeResultUpdate::idle())
    }
}
