//! Workflow orchestration.
//!
//! One pass of the orchestrator:
//! 1. Loads the execution and skips it if it already finished
//! 2. For a pending execution, validates the graph, rejects cycles, records
//!    boundary nodes as complete and persists the rest as the worklist
//! 3. Marks nodes whose upstream optional node errored as errored too
//! 4. Completes the execution once the worklist is empty and nothing runs
//! 5. Dispatches ready nodes: the first one in topological order for
//!    sequential executions, all of them for all-ready executions
//!
//! A pass re-run against an execution that is already running only redoes
//! the dispatch step, and a node leaves the worklist exactly once.
//! Any fatal error in a pass fails the execution with that error's message.

use crate::definition::WorkflowDefinition;
use crate::error::{EngineError, GraphError, StoreError};
use crate::execution::{
    DispatchMode, Execution, ExecutionStatus, NodeResultUpdate, PendingNode,
};
use crate::graph::{build_dependency_map, detect_cycles, topological_sort};
use crate::node::NodeCategory;
use crate::source::WorkflowSource;
use crate::store::ExecutionStore;
use async_trait::async_trait;
use genweave_core::{ExecutionId, NodeId, WorkflowId};
use genweave_queue::{
    JobFailure, JobOptions, JobProcessor, NewJob, QueueClient, QueueName, QueuedJob,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Job name of orchestration tasks.
pub const ORCHESTRATE_JOB: &str = "orchestrate";

/// Payload of a job on the orchestrator queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationTask {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
}

/// Payload of a job on a node queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeJob {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub node_id: NodeId,
    pub node_type: String,
    #[serde(default)]
    pub node_data: JsonValue,
    pub workflow: WorkflowDefinition,
    pub depth: u32,
}

/// What a pass did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PassOutcome {
    /// The execution had already finished.
    Skipped,
    /// Work is in flight or the execution is not initialized yet.
    Waiting,
    Dispatched { nodes: Vec<NodeId> },
    Completed,
    Failed { reason: String },
}

/// Drives executions through their graphs.
pub struct Orchestrator {
    store: Arc<dyn ExecutionStore>,
    workflows: Arc<dyn WorkflowSource>,
    queue: QueueClient,
    node_job_options: JobOptions,
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        workflows: Arc<dyn WorkflowSource>,
        queue: QueueClient,
        node_job_options: JobOptions,
    ) -> Self {
        Self {
            store,
            workflows,
            queue,
            node_job_options,
        }
    }

    /// Creates an execution and schedules its first pass.
    ///
    /// # Errors
    ///
    /// Returns an error if the execution cannot be created or the first pass
    /// cannot be enqueued. In the latter case the execution is failed.
    #[instrument(skip(self))]
    pub async fn start_execution(&self, workflow_id: WorkflowId) -> Result<Execution, EngineError> {
        let execution = self.store.create_execution(workflow_id).await?;
        let task = OrchestrationTask {
            execution_id: execution.id,
            workflow_id,
        };
        let payload = serde_json::to_value(task).map_err(|e| EngineError::InvalidJob {
            reason: e.to_string(),
        })?;

        let enqueued = self
            .queue
            .enqueue(
                QueueName::WorkflowOrchestrator,
                ORCHESTRATE_JOB,
                NewJob::new(payload).for_execution(execution.id),
                JobOptions::default(),
            )
            .await;
        if let Err(e) = enqueued {
            self.fail_execution(execution.id, &format!("failed to schedule execution: {e}"))
                .await?;
            return Err(e.into());
        }

        info!(execution_id = %execution.id, "execution started");
        Ok(execution)
    }

    /// Runs one full pass, initializing the execution if it is pending.
    ///
    /// # Errors
    ///
    /// Returns retryable errors only. Fatal errors fail the execution and
    /// are reported as [`PassOutcome::Failed`].
    #[instrument(skip(self, task), fields(execution_id = %task.execution_id))]
    pub async fn orchestrate(&self, task: &OrchestrationTask) -> Result<PassOutcome, EngineError> {
        let execution = self.store.find_execution(task.execution_id).await?;
        let outcome = self.run_pass(execution, true).await;
        self.settle(task.execution_id, outcome).await
    }

    /// Re-evaluates a running execution after one of its nodes finished.
    ///
    /// # Errors
    ///
    /// Returns retryable errors only, as [`Orchestrator::orchestrate`].
    #[instrument(skip(self))]
    pub async fn advance(&self, execution_id: ExecutionId) -> Result<PassOutcome, EngineError> {
        let execution = self.store.find_execution(execution_id).await?;
        let outcome = self.run_pass(execution, false).await;
        self.settle(execution_id, outcome).await
    }

    /// Fails an execution. Already finished executions are left alone.
    ///
    /// # Errors
    ///
    /// Returns an error if the status cannot be written.
    pub async fn fail_execution(
        &self,
        execution_id: ExecutionId,
        reason: &str,
    ) -> Result<(), EngineError> {
        match self
            .store
            .update_execution_status(execution_id, ExecutionStatus::Failed, Some(reason.to_string()))
            .await
        {
            Ok(_) => {
                warn!(%execution_id, reason, "execution failed");
                Ok(())
            }
            Err(StoreError::InvalidTransition { .. }) => {
                debug!(%execution_id, "execution already finished");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn settle(
        &self,
        execution_id: ExecutionId,
        outcome: Result<PassOutcome, EngineError>,
    ) -> Result<PassOutcome, EngineError> {
        match outcome {
            Err(e) if !e.is_retryable() => {
                let reason = e.to_string();
                self.fail_execution(execution_id, &reason).await?;
                Ok(PassOutcome::Failed { reason })
            }
            other => other,
        }
    }

    async fn run_pass(
        &self,
        execution: Execution,
        initialize: bool,
    ) -> Result<PassOutcome, EngineError> {
        if execution.status.is_terminal() {
            debug!(status = %execution.status, "execution already finished");
            return Ok(PassOutcome::Skipped);
        }
        if execution.status == ExecutionStatus::Pending {
            if !initialize {
                return Ok(PassOutcome::Waiting);
            }
            let definition = self.workflows.find_one(execution.workflow_id).await?;
            self.initialize(&execution, &definition).await?;
        }
        self.dispatch_ready(execution.id).await
    }

    async fn initialize(
        &self,
        execution: &Execution,
        definition: &WorkflowDefinition,
    ) -> Result<(), EngineError> {
        definition.validate()?;
        if detect_cycles(&definition.nodes, &definition.edges) {
            return Err(GraphError::CycleDetected.into());
        }
        let order = topological_sort(&definition.nodes, &definition.edges)?;
        let dependencies = build_dependency_map(&definition.nodes, &definition.edges);

        let mut boundary = Vec::new();
        let mut worklist = Vec::new();
        for node_id in order {
            let Some(node) = definition.node(&node_id) else {
                continue;
            };
            if node.category().is_boundary() {
                boundary.push(node_id);
                continue;
            }

            let depends_on = dependencies
                .get(&node_id)
                .into_iter()
                .flatten()
                .filter(|dep| {
                    definition
                        .node(dep)
                        .is_some_and(|n| !n.category().is_boundary())
                })
                .cloned()
                .collect();
            worklist.push(PendingNode {
                node_id,
                node_type: node.node_type.clone(),
                node_data: node.data.clone(),
                depends_on,
            });
        }

        let pending = worklist.len();
        if self
            .store
            .begin_execution(execution.id, boundary, worklist)
            .await?
        {
            debug!(pending, "execution initialized");
        } else {
            debug!("execution already initialized by another pass");
        }
        Ok(())
    }

    async fn dispatch_ready(&self, execution_id: ExecutionId) -> Result<PassOutcome, EngineError> {
        let execution = self.fail_blocked_nodes(execution_id).await?;
        if execution.status.is_terminal() {
            return Ok(PassOutcome::Skipped);
        }

        let in_flight = execution.has_in_flight();
        if execution.pending_nodes.is_empty() {
            if in_flight {
                return Ok(PassOutcome::Waiting);
            }
            return self.complete_execution(execution_id).await;
        }

        let ready: Vec<PendingNode> = execution.ready_nodes().into_iter().cloned().collect();
        if ready.is_empty() {
            if in_flight {
                return Ok(PassOutcome::Waiting);
            }
            return Err(EngineError::Inconsistent {
                execution_id,
                pending: execution
                    .pending_nodes
                    .iter()
                    .map(|p| p.node_id.clone())
                    .collect(),
            });
        }

        let batch: Vec<PendingNode> = match execution.dispatch_mode {
            DispatchMode::Sequential if in_flight => return Ok(PassOutcome::Waiting),
            DispatchMode::Sequential => ready.into_iter().take(1).collect(),
            DispatchMode::AllReady => ready,
        };

        let definition = self.workflows.find_one(execution.workflow_id).await?;
        let mut dispatched = Vec::new();
        for node in batch {
            let node_id = node.node_id.clone();
            if self.dispatch(&execution, &definition, node).await? {
                dispatched.push(node_id);
            }
        }

        if dispatched.is_empty() {
            Ok(PassOutcome::Waiting)
        } else {
            Ok(PassOutcome::Dispatched { nodes: dispatched })
        }
    }

    /// Errors every pending node downstream of an errored node, repeating
    /// until no more nodes are blocked. Returns the resulting execution.
    async fn fail_blocked_nodes(&self, execution_id: ExecutionId) -> Result<Execution, EngineError> {
        loop {
            let execution = self.store.find_execution(execution_id).await?;
            if execution.status.is_terminal() {
                return Ok(execution);
            }
            let blocked: Vec<(NodeId, NodeId)> = execution
                .blocked_nodes()
                .into_iter()
                .map(|(node, dep)| (node.node_id.clone(), dep.clone()))
                .collect();
            if blocked.is_empty() {
                return Ok(execution);
            }

            for (node_id, dependency) in blocked {
                if self
                    .store
                    .remove_from_pending_nodes(execution_id, &node_id)
                    .await?
                {
                    info!(%node_id, %dependency, "skipping node after upstream failure");
                    self.store
                        .update_node_result(
                            execution_id,
                            &node_id,
                            NodeResultUpdate::error(format!(
                                "upstream dependency {dependency} failed"
                            )),
                        )
                        .await?;
                }
            }
        }
    }

    async fn complete_execution(&self, execution_id: ExecutionId) -> Result<PassOutcome, EngineError> {
        match self
            .store
            .update_execution_status(execution_id, ExecutionStatus::Completed, None)
            .await
        {
            Ok(true) => {
                info!(%execution_id, "execution completed");
                Ok(PassOutcome::Completed)
            }
            Ok(false) | Err(StoreError::InvalidTransition { .. }) => Ok(PassOutcome::Skipped),
            Err(e) => Err(e.into()),
        }
    }

    /// Claims a node and enqueues it. Returns `false` if another pass claimed
    /// it first.
    async fn dispatch(
        &self,
        execution: &Execution,
        definition: &WorkflowDefinition,
        node: PendingNode,
    ) -> Result<bool, EngineError> {
        let Some(queue) = NodeCategory::from_node_type(&node.node_type).queue() else {
            // Boundary nodes never reach the worklist through initialize.
            if self
                .store
                .remove_from_pending_nodes(execution.id, &node.node_id)
                .await?
            {
                self.store
                    .update_node_result(execution.id, &node.node_id, NodeResultUpdate::complete(json!({})))
                    .await?;
            }
            return Ok(false);
        };

        let job = NodeJob {
            execution_id: execution.id,
            workflow_id: execution.workflow_id,
            node_id: node.node_id.clone(),
            node_type: node.node_type.clone(),
            node_data: node.node_data.clone(),
            workflow: definition.clone(),
            depth: execution.depth,
        };
        let payload = serde_json::to_value(&job).map_err(|e| EngineError::InvalidJob {
            reason: e.to_string(),
        })?;

        if !self
            .store
            .remove_from_pending_nodes(execution.id, &node.node_id)
            .await?
        {
            debug!(node_id = %node.node_id, "node already dispatched");
            return Ok(false);
        }

        let enqueued = self
            .queue
            .enqueue(
                queue,
                &node.node_type,
                NewJob::new(payload)
                    .for_execution(execution.id)
                    .for_node(node.node_id.clone()),
                self.node_job_options,
            )
            .await;
        match enqueued {
            Ok(job_id) => {
                info!(node_id = %node.node_id, %job_id, %queue, "node dispatched");
                Ok(true)
            }
            Err(e) => {
                warn!(node_id = %node.node_id, error = %e, "enqueue failed, restoring node");
                self.store.restore_pending_node(execution.id, node).await?;
                Err(e.into())
            }
        }
    }
}

/// Runs orchestration tasks from the orchestrator queue.
pub struct OrchestrationProcessor {
    orchestrator: Arc<Orchestrator>,
}

impl OrchestrationProcessor {
    #[must_use]
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl JobProcessor for OrchestrationProcessor {
    async fn process(&self, job: &QueuedJob) -> Result<JsonValue, JobFailure> {
        let task: OrchestrationTask = job
            .payload_as()
            .map_err(|e| JobFailure::fatal(format!("invalid orchestration task: {e}")))?;
        let outcome = self
            .orchestrator
            .orchestrate(&task)
            .await
            .map_err(|e| e.to_job_failure())?;
        Ok(serde_json::to_value(outcome).unwrap_or(JsonValue::Null))
    }
}
