//! Running another workflow as a node.
//!
//! A `workflowRef` node starts a child execution of the referenced workflow
//! and holds its worker slot while polling the child until it finishes. The
//! child dispatches every ready node at once. Its `workflowOutput` values
//! become the node's output.

use crate::cancel::Canceller;
use crate::definition::{NodeDefinition, WorkflowDefinition};
use crate::error::EngineError;
use crate::execution::{Execution, ExecutionStatus, MAX_DEPTH, NodeResultUpdate, NodeStatus};
use crate::inputs::{resolve_inputs, upstream_value};
use crate::node::{WORKFLOW_INPUT_TYPE, WORKFLOW_OUTPUT_TYPE};
use crate::orchestrator::{NodeJob, OrchestrationTask, Orchestrator, PassOutcome};
use crate::source::WorkflowSource;
use crate::store::ExecutionStore;
use genweave_core::{ExecutionId, NodeId, WorkflowId};
use serde_json::{Map, Value as JsonValue, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Key of the child execution id in the parent node's output.
pub const CHILD_EXECUTION_KEY: &str = "childExecutionId";

pub struct SubWorkflowCoordinator {
    store: Arc<dyn ExecutionStore>,
    workflows: Arc<dyn WorkflowSource>,
    orchestrator: Arc<Orchestrator>,
    canceller: Arc<Canceller>,
    poll_interval: Duration,
    max_poll_attempts: u32,
}

impl SubWorkflowCoordinator {
    #[must_use]
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        workflows: Arc<dyn WorkflowSource>,
        orchestrator: Arc<Orchestrator>,
        canceller: Arc<Canceller>,
    ) -> Self {
        Self {
            store,
            workflows,
            orchestrator,
            canceller,
            poll_interval: Duration::from_secs(5),
            max_poll_attempts: 360,
        }
    }

    #[must_use]
    pub fn with_polling(mut self, interval: Duration, max_attempts: u32) -> Self {
        self.poll_interval = interval;
        self.max_poll_attempts = max_attempts;
        self
    }

    /// Runs the child workflow for `job` and returns the parent node's output.
    ///
    /// A redelivered job picks up the child it already started and runs
    /// another pass over it first, since the earlier attempt may have stopped
    /// before the child's ready nodes were enqueued.
    ///
    /// # Errors
    ///
    /// Fails fatally when the depth limit is reached, the node has no valid
    /// `workflowId`, a required input has no value, or the child fails or
    /// times out.
    #[instrument(skip(self, job, parent), fields(execution_id = %parent.id, node_id = %job.node_id))]
    pub async fn run(&self, job: &NodeJob, parent: &Execution) -> Result<JsonValue, EngineError> {
        if parent.depth >= MAX_DEPTH {
            return Err(EngineError::DepthExceeded {
                depth: parent.depth,
                max: MAX_DEPTH,
            });
        }

        let child_id = match started_child(parent, &job.node_id) {
            Some(child_id) => {
                info!(%child_id, "resuming sub-workflow");
                let child = self.store.find_execution(child_id).await?;
                self.drive_child(child.id, child.workflow_id).await?;
                child_id
            }
            None => self.launch(job, parent).await?,
        };

        let child = self.wait_for_child(parent.id, child_id).await?;
        let definition = self.workflows.find_one(child.workflow_id).await?;
        let outputs = extract_outputs(&definition, &child);
        Ok(json!({"outputMappings": outputs, CHILD_EXECUTION_KEY: child.id}))
    }

    async fn launch(&self, job: &NodeJob, parent: &Execution) -> Result<ExecutionId, EngineError> {
        let workflow_id = referenced_workflow(job)?;
        let definition = self.workflows.find_one(workflow_id).await?;
        let inputs = child_inputs(job, parent, &definition)?;

        let child = self
            .store
            .create_child_execution(workflow_id, parent.id, &job.node_id, parent.depth + 1)
            .await?;
        self.store.add_child_execution(parent.id, child.id).await?;
        self.store
            .update_node_result(
                parent.id,
                &job.node_id,
                NodeResultUpdate::processing().with_output(json!({CHILD_EXECUTION_KEY: child.id})),
            )
            .await?;

        for (node_id, value) in inputs {
            self.store
                .update_node_result(child.id, &node_id, NodeResultUpdate::complete(json!({"value": value})))
                .await?;
        }

        self.drive_child(child.id, workflow_id).await?;
        info!(child_id = %child.id, depth = child.depth, "sub-workflow started");
        Ok(child.id)
    }

    /// Runs one orchestration pass over the child. Passes are idempotent, so
    /// this is safe on a child that is already running.
    async fn drive_child(
        &self,
        child_id: ExecutionId,
        workflow_id: WorkflowId,
    ) -> Result<(), EngineError> {
        let task = OrchestrationTask {
            execution_id: child_id,
            workflow_id,
        };
        match self.orchestrator.orchestrate(&task).await? {
            PassOutcome::Failed { reason } => Err(EngineError::ChildFailed {
                child_execution_id: child_id,
                reason,
            }),
            _ => Ok(()),
        }
    }

    async fn wait_for_child(
        &self,
        parent_id: ExecutionId,
        child_id: ExecutionId,
    ) -> Result<Execution, EngineError> {
        for attempt in 1..=self.max_poll_attempts {
            let child = self.store.find_execution(child_id).await?;
            match child.status {
                ExecutionStatus::Completed => return Ok(child),
                ExecutionStatus::Failed | ExecutionStatus::Cancelled => {
                    let reason = child
                        .error
                        .clone()
                        .unwrap_or_else(|| format!("sub-workflow {}", child.status));
                    return Err(EngineError::ChildFailed {
                        child_execution_id: child_id,
                        reason,
                    });
                }
                ExecutionStatus::Pending | ExecutionStatus::Running => {}
            }

            let parent = self.store.find_execution(parent_id).await?;
            if parent.status.is_terminal() {
                self.canceller.cancel_execution(child_id).await?;
                return Err(EngineError::ChildFailed {
                    child_execution_id: child_id,
                    reason: format!("parent execution {}", parent.status),
                });
            }

            debug!(attempt, %child_id, "waiting for sub-workflow");
            tokio::time::sleep(self.poll_interval).await;
        }

        warn!(%child_id, "sub-workflow timed out");
        self.orchestrator
            .fail_execution(child_id, "sub-workflow timed out")
            .await?;
        Err(EngineError::Timeout {
            what: format!("sub-workflow {child_id}"),
        })
    }
}

fn started_child(parent: &Execution, node_id: &NodeId) -> Option<ExecutionId> {
    let result = parent.node_result(node_id)?;
    if result.status != NodeStatus::Processing {
        return None;
    }
    result
        .output
        .as_ref()?
        .get(CHILD_EXECUTION_KEY)?
        .as_str()?
        .parse()
        .ok()
}

fn referenced_workflow(job: &NodeJob) -> Result<WorkflowId, EngineError> {
    job.node_data
        .get("workflowId")
        .and_then(JsonValue::as_str)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| EngineError::InvalidNode {
            node_id: job.node_id.clone(),
            reason: "missing or invalid workflowId".to_string(),
        })
}

fn port_name(node: &NodeDefinition, key: &str) -> String {
    node.data_str(key)
        .or_else(|| node.data_str("name"))
        .unwrap_or(node.id.as_str())
        .to_string()
}

/// Values for the child's `workflowInput` nodes.
///
/// Each input takes, in order: the value on the parent edge whose target
/// handle matches the input name, the node's `inputMappings` entry, then the
/// declared default.
fn child_inputs(
    job: &NodeJob,
    parent: &Execution,
    definition: &WorkflowDefinition,
) -> Result<Vec<(NodeId, JsonValue)>, EngineError> {
    let upstream = resolve_inputs(&job.workflow, parent, &job.node_id);
    let mappings = job.node_data.get("inputMappings").and_then(JsonValue::as_object);

    let mut values = Vec::new();
    for node in definition.nodes_of_type(WORKFLOW_INPUT_TYPE) {
        let name = port_name(node, "inputName");
        let declared = definition.interface.input(&name);
        let value = upstream
            .get(&name)
            .cloned()
            .or_else(|| mappings.and_then(|m| m.get(&name)).cloned())
            .or_else(|| declared.and_then(|d| d.default_value.clone()))
            .or_else(|| node.data.get("defaultValue").cloned())
            .filter(|v| !v.is_null());
        let required = declared.map_or_else(
            || {
                node.data
                    .get("required")
                    .and_then(JsonValue::as_bool)
                    .unwrap_or(false)
            },
            |d| d.required,
        );

        match value {
            Some(value) => values.push((node.id.clone(), value)),
            None if required => {
                return Err(EngineError::MissingInput {
                    node_id: job.node_id.clone(),
                    input: name,
                });
            }
            None => {}
        }
    }
    Ok(values)
}

/// Values reaching the child's `workflowOutput` nodes, keyed by output name.
///
/// When the workflow declares outputs, exactly those names are returned.
fn extract_outputs(definition: &WorkflowDefinition, child: &Execution) -> Map<String, JsonValue> {
    let mut outputs = Map::new();
    for node in definition.nodes_of_type(WORKFLOW_OUTPUT_TYPE) {
        let mut values: Vec<JsonValue> = definition
            .incoming(&node.id)
            .filter_map(|edge| upstream_value(definition, child, edge))
            .collect();
        let value = match values.len() {
            0 => JsonValue::Null,
            1 => values.remove(0),
            _ => JsonValue::Array(values),
        };
        outputs.insert(port_name(node, "outputName"), value);
    }

    if definition.interface.outputs.is_empty() {
        return outputs;
    }
    definition
        .interface
        .outputs
        .iter()
        .map(|declared| {
            let value = outputs.remove(&declared.name).unwrap_or(JsonValue::Null);
            (declared.name.clone(), value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{EdgeDefinition, InterfaceInput, InterfaceOutput, WorkflowInterface};
    use crate::testing::{Harness, id};
    use genweave_queue::{DeliveryOutcome, QueueName};

    fn summarizer() -> WorkflowDefinition {
        WorkflowDefinition::new("summarize")
            .with_node(NodeDefinition::new(
                "topic",
                WORKFLOW_INPUT_TYPE,
                json!({"inputName": "topic"}),
            ))
            .with_node(NodeDefinition::new("writer", "llm", json!({})))
            .with_node(NodeDefinition::new(
                "summary",
                WORKFLOW_OUTPUT_TYPE,
                json!({"outputName": "summary"}),
            ))
            .with_edge(EdgeDefinition::new("topic", "writer").with_handles("value", "prompt"))
            .with_edge(EdgeDefinition::new("writer", "summary"))
            .with_interface(WorkflowInterface {
                inputs: vec![InterfaceInput {
                    name: "topic".into(),
                    required: true,
                    default_value: None,
                }],
                outputs: vec![InterfaceOutput {
                    name: "summary".into(),
                }],
            })
    }

    fn parent_of(child: WorkflowId, topic: Option<&str>) -> WorkflowDefinition {
        let reference = NodeDefinition::new("ref", "workflowRef", json!({"workflowId": child.to_string()}));
        match topic {
            Some(topic) => WorkflowDefinition::new("parent")
                .with_node(NodeDefinition::new("t", "textInput", json!({"text": topic})))
                .with_node(reference)
                .with_edge(EdgeDefinition::new("t", "ref").with_handles("text", "topic")),
            None => WorkflowDefinition::new("parent").with_node(reference),
        }
    }

    fn coordinator(h: &Harness) -> SubWorkflowCoordinator {
        SubWorkflowCoordinator::new(
            h.store.clone(),
            h.workflows.clone(),
            h.engine.orchestrator().clone(),
            h.engine.canceller().clone(),
        )
        .with_polling(Duration::from_millis(2), 50)
    }

    fn job_for(parent: &Execution, workflow: WorkflowDefinition, node: &str) -> NodeJob {
        let node_data = workflow
            .node(&id(node))
            .map(|n| n.data.clone())
            .unwrap_or_default();
        NodeJob {
            execution_id: parent.id,
            workflow_id: parent.workflow_id,
            node_id: id(node),
            node_type: "workflowRef".into(),
            node_data,
            workflow,
            depth: parent.depth,
        }
    }

    #[tokio::test]
    async fn child_outputs_become_parent_node_output() {
        let h = Arc::new(Harness::new());
        let child_workflow = h.add_workflow(summarizer()).await;
        let execution_id = h.start(parent_of(child_workflow, Some("cats"))).await;
        h.step(QueueName::WorkflowOrchestrator).await;

        let worker = h.clone();
        let parent_step =
            tokio::spawn(async move { worker.step(QueueName::SubWorkflow).await });
        assert_eq!(
            h.step_when_ready(QueueName::LlmGeneration).await,
            DeliveryOutcome::Completed
        );
        assert_eq!(
            parent_step.await.expect("parent step"),
            Some(DeliveryOutcome::Completed)
        );

        assert_eq!(h.text.requests()[0].prompt, "cats");
        let parent = h.execution(execution_id).await;
        assert_eq!(parent.status, ExecutionStatus::Completed);
        assert_eq!(parent.child_execution_ids.len(), 1);

        let child = h.execution(parent.child_execution_ids[0]).await;
        assert_eq!(child.status, ExecutionStatus::Completed);
        assert_eq!(child.depth, 1);
        assert_eq!(child.parent_execution_id, Some(execution_id));
        assert_eq!(child.parent_node_id, Some(id("ref")));

        let output = parent
            .node_result(&id("ref"))
            .and_then(|r| r.output.clone())
            .expect("output");
        assert_eq!(output["outputMappings"], json!({"summary": "echo: cats"}));
        assert_eq!(output[CHILD_EXECUTION_KEY], json!(child.id));
    }

    #[tokio::test]
    async fn resumed_node_redrives_a_child_left_unscheduled() {
        let h = Harness::new();
        let child_workflow = h.add_workflow(summarizer()).await;
        let execution_id = h.start(parent_of(child_workflow, Some("cats"))).await;
        h.step(QueueName::WorkflowOrchestrator).await;
        let job = h.node_jobs(QueueName::SubWorkflow).await.remove(0);
        let coordinator =
            Arc::new(coordinator(&h).with_polling(Duration::from_millis(2), 2_000));

        h.publishing.fail_next(1);
        let parent = h.execution(execution_id).await;
        let err = coordinator
            .run(&job, &parent)
            .await
            .expect_err("child enqueue fails");
        assert!(err.is_retryable());

        let parent = h.execution(execution_id).await;
        let child_id = parent.child_execution_ids[0];
        let child = h.execution(child_id).await;
        assert_eq!(child.status, ExecutionStatus::Running);
        assert!(child.is_pending(&id("writer")));
        assert!(h.transport.pending(QueueName::LlmGeneration).await.is_empty());

        let resumed = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.run(&job, &parent).await })
        };
        assert_eq!(
            h.step_when_ready(QueueName::LlmGeneration).await,
            DeliveryOutcome::Completed
        );
        let output = resumed.await.expect("join").expect("child finished");
        assert_eq!(output["outputMappings"], json!({"summary": "echo: cats"}));
        assert_eq!(output[CHILD_EXECUTION_KEY], json!(child_id));
        assert_eq!(h.store.all().await.len(), 2);
    }

    #[tokio::test]
    async fn depth_limit_stops_before_creating_a_child() {
        let h = Harness::new();
        let child_workflow = h.add_workflow(summarizer()).await;
        let definition = parent_of(child_workflow, Some("cats"));
        let parent = h
            .store
            .create_child_execution(definition.id, ExecutionId::new(), &id("outer"), MAX_DEPTH)
            .await
            .expect("parent");

        let err = coordinator(&h)
            .run(&job_for(&parent, definition, "ref"), &parent)
            .await
            .expect_err("too deep");

        assert_eq!(
            err,
            EngineError::DepthExceeded {
                depth: MAX_DEPTH,
                max: MAX_DEPTH
            }
        );
        assert!(!err.is_retryable());
        assert_eq!(h.store.all().await.len(), 1);
    }

    #[tokio::test]
    async fn missing_required_input_fails_before_child_starts() {
        let h = Harness::new();
        let child_workflow = h.add_workflow(summarizer()).await;
        let execution_id = h.start(parent_of(child_workflow, None)).await;
        h.step(QueueName::WorkflowOrchestrator).await;

        assert_eq!(
            h.step(QueueName::SubWorkflow).await,
            Some(DeliveryOutcome::Failed)
        );
        let parent = h.execution(execution_id).await;
        assert_eq!(parent.status, ExecutionStatus::Failed);
        assert!(parent.error.expect("error").contains("'topic'"));
        assert!(parent.child_execution_ids.is_empty());
        assert_eq!(h.store.all().await.len(), 1);
        assert!(h.transport.pending(QueueName::LlmGeneration).await.is_empty());
    }

    #[tokio::test]
    async fn cyclic_child_fails_parent() {
        let h = Harness::new();
        let child_workflow = h
            .add_workflow(
                WorkflowDefinition::new("loop")
                    .with_node(NodeDefinition::new("a", "llm", json!({"prompt": "x"})))
                    .with_node(NodeDefinition::new("b", "llm", json!({"prompt": "y"})))
                    .with_edge(EdgeDefinition::new("a", "b"))
                    .with_edge(EdgeDefinition::new("b", "a")),
            )
            .await;
        let execution_id = h.start(parent_of(child_workflow, None)).await;
        h.step(QueueName::WorkflowOrchestrator).await;

        assert_eq!(
            h.step(QueueName::SubWorkflow).await,
            Some(DeliveryOutcome::Failed)
        );
        let parent = h.execution(execution_id).await;
        assert_eq!(parent.status, ExecutionStatus::Failed);
        assert!(
            parent
                .error
                .expect("error")
                .contains("Workflow contains cycles")
        );
        let child = h.execution(parent.child_execution_ids[0]).await;
        assert_eq!(child.status, ExecutionStatus::Failed);
    }

    #[test]
    fn child_inputs_follow_precedence() {
        let parent_definition = WorkflowDefinition::new("parent")
            .with_node(NodeDefinition::new("t", "textInput", json!({"text": "from edge"})))
            .with_node(NodeDefinition::new(
                "ref",
                "workflowRef",
                json!({"inputMappings": {"a": "mapped a", "b": "mapped b"}}),
            ))
            .with_edge(EdgeDefinition::new("t", "ref").with_handles("text", "a"));
        let child = WorkflowDefinition::new("child")
            .with_node(NodeDefinition::new("in-a", WORKFLOW_INPUT_TYPE, json!({"inputName": "a"})))
            .with_node(NodeDefinition::new("in-b", WORKFLOW_INPUT_TYPE, json!({"inputName": "b"})))
            .with_node(NodeDefinition::new(
                "in-c",
                WORKFLOW_INPUT_TYPE,
                json!({"inputName": "c", "defaultValue": "node default"}),
            ))
            .with_node(NodeDefinition::new(
                "in-d",
                WORKFLOW_INPUT_TYPE,
                json!({"inputName": "d", "defaultValue": "node default"}),
            ))
            .with_node(NodeDefinition::new("in-e", WORKFLOW_INPUT_TYPE, json!({"inputName": "e"})))
            .with_interface(WorkflowInterface {
                inputs: vec![InterfaceInput {
                    name: "c".into(),
                    required: true,
                    default_value: Some(json!("declared default")),
                }],
                outputs: vec![],
            });
        let parent = Execution::new(parent_definition.id);
        let job = job_for(&parent, parent_definition, "ref");

        let values = child_inputs(&job, &parent, &child).expect("inputs");
        assert_eq!(
            values,
            vec![
                (id("in-a"), json!("from edge")),
                (id("in-b"), json!("mapped b")),
                (id("in-c"), json!("declared default")),
                (id("in-d"), json!("node default")),
            ]
        );
    }

    #[test]
    fn resumes_only_an_in_flight_child() {
        let child_id = ExecutionId::new();
        let mut parent = Execution::new(WorkflowId::new());
        assert_eq!(started_child(&parent, &id("ref")), None);

        parent
            .upsert_node_result(
                &id("ref"),
                NodeResultUpdate::processing().with_output(json!({CHILD_EXECUTION_KEY: child_id})),
            )
            .expect("processing");
        assert_eq!(started_child(&parent, &id("ref")), Some(child_id));

        parent
            .upsert_node_result(&id("ref"), NodeResultUpdate::complete(json!({})))
            .expect("complete");
        assert_eq!(started_child(&parent, &id("ref")), None);
    }

    #[test]
    fn outputs_are_limited_to_declared_names() {
        let definition = WorkflowDefinition::new("child")
            .with_node(NodeDefinition::new("w", "llm", json!({})))
            .with_node(NodeDefinition::new("o1", WORKFLOW_OUTPUT_TYPE, json!({"outputName": "kept"})))
            .with_node(NodeDefinition::new("o2", WORKFLOW_OUTPUT_TYPE, json!({"outputName": "extra"})))
            .with_edge(EdgeDefinition::new("w", "o1"))
            .with_edge(EdgeDefinition::new("w", "o2"))
            .with_interface(WorkflowInterface {
                inputs: vec![],
                outputs: vec![
                    InterfaceOutput { name: "kept".into() },
                    InterfaceOutput { name: "absent".into() },
                ],
            });
        let mut child = Execution::new(definition.id);
        child
            .upsert_node_result(&id("w"), NodeResultUpdate::complete(json!({"text": "done"})))
            .expect("complete");

        let outputs = extract_outputs(&definition, &child);
        assert_eq!(
            JsonValue::Object(outputs),
            json!({"kept": "done", "absent": null})
        );
    }
}
