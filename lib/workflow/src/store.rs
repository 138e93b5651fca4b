//! Execution state persistence.

use crate::error::StoreError;
use crate::execution::{Execution, ExecutionStatus, NodeResultUpdate, PendingNode};
use async_trait::async_trait;
use genweave_core::{ExecutionId, NodeId, WorkflowId};
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Durable storage for executions.
///
/// Every method is atomic with respect to the execution it touches.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Creates a pending root execution.
    async fn create_execution(&self, workflow_id: WorkflowId) -> Result<Execution, StoreError>;

    /// Creates a pending child execution linked to its parent node.
    async fn create_child_execution(
        &self,
        workflow_id: WorkflowId,
        parent_execution_id: ExecutionId,
        parent_node_id: &NodeId,
        depth: u32,
    ) -> Result<Execution, StoreError>;

    async fn find_execution(&self, execution_id: ExecutionId) -> Result<Execution, StoreError>;

    /// Moves an execution to `status`, recording `error` if given.
    ///
    /// Returns `false` when the execution already had `status`.
    async fn update_execution_status(
        &self,
        execution_id: ExecutionId,
        status: ExecutionStatus,
        error: Option<String>,
    ) -> Result<bool, StoreError>;

    /// Inserts or updates one node's result.
    async fn update_node_result(
        &self,
        execution_id: ExecutionId,
        node_id: &NodeId,
        update: NodeResultUpdate,
    ) -> Result<(), StoreError>;

    /// Starts a pending execution: completes `boundary_nodes`, installs the
    /// worklist and moves it to running, all at once.
    ///
    /// Returns `false`, changing nothing, when the execution has already
    /// left `pending`.
    async fn begin_execution(
        &self,
        execution_id: ExecutionId,
        boundary_nodes: Vec<NodeId>,
        nodes: Vec<PendingNode>,
    ) -> Result<bool, StoreError>;

    /// Replaces the worklist.
    async fn set_pending_nodes(
        &self,
        execution_id: ExecutionId,
        nodes: Vec<PendingNode>,
    ) -> Result<(), StoreError>;

    /// Removes a node from the worklist and marks it processing.
    ///
    /// Returns `true` only for the one caller that actually removed it.
    async fn remove_from_pending_nodes(
        &self,
        execution_id: ExecutionId,
        node_id: &NodeId,
    ) -> Result<bool, StoreError>;

    /// Returns a claimed node to the worklist and marks it idle.
    async fn restore_pending_node(
        &self,
        execution_id: ExecutionId,
        node: PendingNode,
    ) -> Result<(), StoreError>;

    async fn add_child_execution(
        &self,
        parent_execution_id: ExecutionId,
        child_execution_id: ExecutionId,
    ) -> Result<(), StoreError>;

    /// Associates a provider prediction with a node.
    async fn record_prediction(
        &self,
        execution_id: ExecutionId,
        node_id: &NodeId,
        prediction_id: &str,
    ) -> Result<(), StoreError>;

    /// Looks up the node a prediction belongs to.
    async fn find_node_by_prediction(
        &self,
        prediction_id: &str,
    ) -> Result<Option<(ExecutionId, NodeId)>, StoreError>;

    /// Adds to an execution's accumulated cost.
    async fn add_cost(&self, execution_id: ExecutionId, amount: f64) -> Result<(), StoreError>;
}

#[derive(Default)]
struct MemoryState {
    executions: HashMap<ExecutionId, Execution>,
    predictions: HashMap<String, (ExecutionId, NodeId)>,
}

/// Process-local [`ExecutionStore`].
#[derive(Default)]
pub struct InMemoryExecutionStore {
    state: Mutex<MemoryState>,
}

impl InMemoryExecutionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All executions, oldest first.
    pub async fn all(&self) -> Vec<Execution> {
        let mut executions: Vec<_> = self.state.lock().await.executions.values().cloned().collect();
        executions.sort_by_key(|e| e.created_at);
        executions
    }

    async fn modify<T>(
        &self,
        execution_id: ExecutionId,
        f: impl FnOnce(&mut Execution) -> Result<T, StoreError> + Send,
    ) -> Result<T, StoreError> {
        let mut state = self.state.lock().await;
        let execution = state
            .executions
            .get_mut(&execution_id)
            .ok_or(StoreError::NotFound { execution_id })?;
        f(execution)
    }

    async fn insert(&self, execution: Execution) -> Execution {
        self.state
            .lock()
            .await
            .executions
            .insert(execution.id, execution.clone());
        execution
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn create_execution(&self, workflow_id: WorkflowId) -> Result<Execution, StoreError> {
        Ok(self.insert(Execution::new(workflow_id)).await)
    }

    async fn create_child_execution(
        &self,
        workflow_id: WorkflowId,
        parent_execution_id: ExecutionId,
        parent_node_id: &NodeId,
        depth: u32,
    ) -> Result<Execution, StoreError> {
        let child = Execution::child(
            workflow_id,
            parent_execution_id,
            parent_node_id.clone(),
            depth,
        );
        Ok(self.insert(child).await)
    }

    async fn find_execution(&self, execution_id: ExecutionId) -> Result<Execution, StoreError> {
        self.state
            .lock()
            .await
            .executions
            .get(&execution_id)
            .cloned()
            .ok_or(StoreError::NotFound { execution_id })
    }

    async fn update_execution_status(
        &self,
        execution_id: ExecutionId,
        status: ExecutionStatus,
        error: Option<String>,
    ) -> Result<bool, StoreError> {
        self.modify(execution_id, |e| e.transition(status, error))
            .await
    }

    async fn update_node_result(
        &self,
        execution_id: ExecutionId,
        node_id: &NodeId,
        update: NodeResultUpdate,
    ) -> Result<(), StoreError> {
        self.modify(execution_id, |e| e.upsert_node_result(node_id, update))
            .await
    }

    async fn begin_execution(
        &self,
        execution_id: ExecutionId,
        boundary_nodes: Vec<NodeId>,
        nodes: Vec<PendingNode>,
    ) -> Result<bool, StoreError> {
        self.modify(execution_id, |e| e.begin(&boundary_nodes, nodes))
            .await
    }

    async fn set_pending_nodes(
        &self,
        execution_id: ExecutionId,
        nodes: Vec<PendingNode>,
    ) -> Result<(), StoreError> {
        self.modify(execution_id, |e| {
            if e.status.is_terminal() {
                return Err(StoreError::ExecutionTerminal { execution_id });
            }
            e.pending_nodes = nodes;
            Ok(())
        })
        .await
    }

    async fn remove_from_pending_nodes(
        &self,
        execution_id: ExecutionId,
        node_id: &NodeId,
    ) -> Result<bool, StoreError> {
        self.modify(execution_id, |e| e.claim_pending(node_id)).await
    }

    async fn restore_pending_node(
        &self,
        execution_id: ExecutionId,
        node: PendingNode,
    ) -> Result<(), StoreError> {
        self.modify(execution_id, |e| e.restore_pending(node)).await
    }

    async fn add_child_execution(
        &self,
        parent_execution_id: ExecutionId,
        child_execution_id: ExecutionId,
    ) -> Result<(), StoreError> {
        self.modify(parent_execution_id, |e| {
            if !e.child_execution_ids.contains(&child_execution_id) {
                e.child_execution_ids.push(child_execution_id);
            }
            Ok(())
        })
        .await
    }

    async fn record_prediction(
        &self,
        execution_id: ExecutionId,
        node_id: &NodeId,
        prediction_id: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state
            .executions
            .get_mut(&execution_id)
            .ok_or(StoreError::NotFound { execution_id })?
            .attach_prediction(node_id, prediction_id)?;
        state
            .predictions
            .insert(prediction_id.to_string(), (execution_id, node_id.clone()));
        Ok(())
    }

    async fn find_node_by_prediction(
        &self,
        prediction_id: &str,
    ) -> Result<Option<(ExecutionId, NodeId)>, StoreError> {
        Ok(self.state.lock().await.predictions.get(prediction_id).cloned())
    }

    async fn add_cost(&self, execution_id: ExecutionId, amount: f64) -> Result<(), StoreError> {
        self.modify(execution_id, |e| {
            e.total_cost += amount;
            Ok(())
        })
        .await
    }
}
