//! Node job processing.
//!
//! [`NodeJobProcessor`] runs every node queue. It routes on the node's
//! category:
//! - image, video and other processing nodes submit a provider prediction
//!   and either return (webhook mode) or poll until it finishes
//! - `llm` nodes generate text synchronously
//! - `workflowRef` nodes run a child execution
//!
//! Jobs are delivered at least once. A job for a finished node or execution
//! does nothing, and a job whose prediction was already submitted resumes
//! it instead of submitting again.

use crate::completion::CompletionHandler;
use crate::config::{CompletionMode, EngineConfig};
use crate::error::EngineError;
use crate::execution::{Execution, NodeResultUpdate};
use crate::inputs::{DEFAULT_INPUT_KEY, as_text, merge_with_node_data, resolve_inputs};
use crate::node::NodeCategory;
use crate::orchestrator::NodeJob;
use crate::store::ExecutionStore;
use crate::subworkflow::SubWorkflowCoordinator;
use async_trait::async_trait;
use genweave_provider::{
    Prediction, PredictionProvider, PredictionRequest, PredictionStatus, TextGenerator,
    TextRequest,
};
use genweave_queue::{JobFailure, JobProcessor, LogLevel, QueueClient, QueuedJob};
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Poll attempts between progress entries in the job log.
const PROGRESS_LOG_EVERY: u32 = 12;

/// How a node run ended.
enum NodeRun {
    /// The node finished here; its output still has to be recorded.
    Completed(JsonValue),
    /// The node's result is recorded elsewhere, now or later.
    Deferred(JsonValue),
}

pub struct NodeJobProcessor {
    store: Arc<dyn ExecutionStore>,
    queue: QueueClient,
    predictions: Arc<dyn PredictionProvider>,
    text: Arc<dyn TextGenerator>,
    completion: Arc<CompletionHandler>,
    subworkflows: Arc<SubWorkflowCoordinator>,
    config: EngineConfig,
}

impl NodeJobProcessor {
    #[must_use]
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        queue: QueueClient,
        predictions: Arc<dyn PredictionProvider>,
        text: Arc<dyn TextGenerator>,
        completion: Arc<CompletionHandler>,
        subworkflows: Arc<SubWorkflowCoordinator>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            queue,
            predictions,
            text,
            completion,
            subworkflows,
            config,
        }
    }

    async fn run_node(
        &self,
        job: &QueuedJob,
        node_job: &NodeJob,
        execution: &Execution,
    ) -> Result<NodeRun, EngineError> {
        match NodeCategory::from_node_type(&node_job.node_type) {
            NodeCategory::Boundary => Ok(NodeRun::Completed(json!({}))),
            NodeCategory::Llm => self.run_text(job, node_job, execution).await,
            NodeCategory::WorkflowRef => self
                .subworkflows
                .run(node_job, execution)
                .await
                .map(NodeRun::Completed),
            category => self.run_prediction(job, node_job, execution, category).await,
        }
    }

    async fn run_prediction(
        &self,
        job: &QueuedJob,
        node_job: &NodeJob,
        execution: &Execution,
        category: NodeCategory,
    ) -> Result<NodeRun, EngineError> {
        let Some(kind) = category.prediction_kind() else {
            return Err(EngineError::InvalidNode {
                node_id: node_job.node_id.clone(),
                reason: format!("{category} nodes do not run predictions"),
            });
        };

        let existing = execution
            .node_result(&node_job.node_id)
            .and_then(|r| r.prediction_id.clone());
        let prediction = match existing {
            Some(prediction_id) => {
                info!(%prediction_id, "resuming prediction");
                self.predictions.get_status(&prediction_id).await?
            }
            None => {
                let inputs = resolve_inputs(&node_job.workflow, execution, &node_job.node_id);
                let mut request =
                    PredictionRequest::new(kind, merge_with_node_data(&node_job.node_data, inputs));
                if let Some(model) = node_job.node_data.get("model").and_then(JsonValue::as_str) {
                    request = request.with_model(model);
                }

                self.store
                    .update_node_result(
                        node_job.execution_id,
                        &node_job.node_id,
                        NodeResultUpdate::processing(),
                    )
                    .await?;
                let prediction = self.predictions.submit(&request).await?;
                self.store
                    .record_prediction(node_job.execution_id, &node_job.node_id, &prediction.id)
                    .await?;
                self.queue
                    .add_job_log(
                        job.id,
                        format!("submitted prediction {}", prediction.id),
                        LogLevel::Info,
                    )
                    .await;
                prediction
            }
        };

        if prediction.status.is_terminal() {
            return self.finish_prediction(&prediction).await;
        }
        match self.config.completion_mode {
            CompletionMode::Webhook => Ok(NodeRun::Deferred(json!({
                "predictionId": prediction.id,
                "status": prediction.status,
            }))),
            CompletionMode::Poll => self.poll_prediction(job, node_job, &prediction.id).await,
        }
    }

    async fn poll_prediction(
        &self,
        job: &QueuedJob,
        node_job: &NodeJob,
        prediction_id: &str,
    ) -> Result<NodeRun, EngineError> {
        for attempt in 1..=self.config.max_poll_attempts {
            tokio::time::sleep(self.config.poll_interval()).await;

            let execution = self.store.find_execution(node_job.execution_id).await?;
            if execution.status.is_terminal() {
                debug!(%prediction_id, "execution finished while polling");
                return Ok(NodeRun::Deferred(json!({
                    "predictionId": prediction_id,
                    "skipped": "execution finished",
                })));
            }

            match self.predictions.get_status(prediction_id).await {
                Ok(prediction) if prediction.status.is_terminal() => {
                    return self.finish_prediction(&prediction).await;
                }
                Ok(prediction) => {
                    if attempt % PROGRESS_LOG_EVERY == 0 {
                        self.queue
                            .add_job_log(
                                job.id,
                                format!(
                                    "prediction {prediction_id} still {} after {attempt} polls",
                                    prediction.status
                                ),
                                LogLevel::Info,
                            )
                            .await;
                    }
                }
                Err(e) if e.is_retryable() => {
                    warn!(%prediction_id, attempt, error = %e, "status check failed");
                }
                Err(e) => return Err(e.into()),
            }
        }

        if let Err(e) = self.predictions.cancel(prediction_id).await {
            warn!(%prediction_id, error = %e, "failed to cancel timed out prediction");
        }
        Err(EngineError::Timeout {
            what: format!("prediction {prediction_id}"),
        })
    }

    /// Hands a finished prediction to the completion handler.
    async fn finish_prediction(&self, prediction: &Prediction) -> Result<NodeRun, EngineError> {
        self.completion.handle_prediction_update(prediction).await?;
        if prediction.status == PredictionStatus::Succeeded {
            return Ok(NodeRun::Deferred(json!({
                "predictionId": prediction.id,
                "status": prediction.status,
            })));
        }
        Err(EngineError::PredictionFailed {
            prediction_id: prediction.id.clone(),
            reason: prediction
                .error
                .clone()
                .unwrap_or_else(|| format!("prediction {}", prediction.status)),
        })
    }

    async fn run_text(
        &self,
        job: &QueuedJob,
        node_job: &NodeJob,
        execution: &Execution,
    ) -> Result<NodeRun, EngineError> {
        self.store
            .update_node_result(
                node_job.execution_id,
                &node_job.node_id,
                NodeResultUpdate::processing(),
            )
            .await?;

        let inputs = resolve_inputs(&node_job.workflow, execution, &node_job.node_id);
        let params = merge_with_node_data(&node_job.node_data, inputs);
        let prompt = ["prompt", "text", DEFAULT_INPUT_KEY]
            .iter()
            .find_map(|key| params.get(*key).and_then(as_text))
            .ok_or_else(|| EngineError::InvalidNode {
                node_id: node_job.node_id.clone(),
                reason: "no prompt provided".to_string(),
            })?;

        let mut request = TextRequest::new(prompt);
        if let Some(system) = params.get("systemPrompt").and_then(JsonValue::as_str) {
            request = request.with_system(system);
        }
        if let Some(model) = params.get("model").and_then(JsonValue::as_str) {
            request = request.with_model(model);
        }
        if let Some(temperature) = params.get("temperature").and_then(JsonValue::as_f64) {
            #[allow(clippy::cast_possible_truncation)]
            let temperature = temperature as f32;
            request = request.with_temperature(temperature);
        }
        if let Some(max_tokens) = params
            .get("maxTokens")
            .and_then(JsonValue::as_u64)
            .and_then(|v| u32::try_from(v).ok())
        {
            request = request.with_max_tokens(max_tokens);
        }

        let response = self.text.generate(&request).await?;
        self.queue
            .add_job_log(
                job.id,
                format!("generated {} tokens", response.usage.total()),
                LogLevel::Info,
            )
            .await;
        Ok(NodeRun::Completed(json!({
            "text": response.content,
            "model": response.model,
            "usage": response.usage,
        })))
    }

    /// Records a failed attempt and converts it for the job runtime.
    ///
    /// Terminal failures go to the completion handler. Others leave the node
    /// in flight with the error noted for the next attempt.
    async fn record_failure(
        &self,
        job: &QueuedJob,
        node_job: &NodeJob,
        error: &EngineError,
    ) -> JobFailure {
        let failure = error.to_job_failure();
        if matches!(error, EngineError::PredictionFailed { .. }) {
            return failure;
        }

        let message = error.to_string();
        if failure.is_terminal_for(job) {
            if let Err(e) = self
                .completion
                .node_failed(node_job.execution_id, &node_job.node_id, &message)
                .await
            {
                warn!(error = %e, "failed to record node failure");
            }
        } else {
            if let Err(e) = self
                .store
                .update_node_result(
                    node_job.execution_id,
                    &node_job.node_id,
                    NodeResultUpdate::retrying(message.clone()),
                )
                .await
            {
                debug!(error = %e, "failed to note retryable failure");
            }
            self.queue
                .add_job_log(
                    job.id,
                    format!("attempt {} failed: {message}", job.attempt()),
                    LogLevel::Warn,
                )
                .await;
        }
        failure
    }
}

#[async_trait]
impl JobProcessor for NodeJobProcessor {
    #[instrument(skip(self, job), fields(job_id = %job.id, queue = %job.queue))]
    async fn process(&self, job: &QueuedJob) -> Result<JsonValue, JobFailure> {
        let node_job: NodeJob = job
            .payload_as()
            .map_err(|e| JobFailure::fatal(format!("invalid node job: {e}")))?;
        let execution = self
            .store
            .find_execution(node_job.execution_id)
            .await
            .map_err(|e| EngineError::from(e).to_job_failure())?;

        if execution.status.is_terminal() {
            debug!(execution_id = %execution.id, "execution finished, skipping node");
            return Ok(json!({"skipped": "execution finished"}));
        }
        if execution.is_node_complete(&node_job.node_id) {
            // The earlier delivery may have stopped before the next pass ran.
            self.completion
                .advance(node_job.execution_id)
                .await
                .map_err(|e| e.to_job_failure())?;
            return Ok(json!({"skipped": "node already complete"}));
        }

        match self.run_node(job, &node_job, &execution).await {
            Ok(NodeRun::Completed(output)) => {
                self.completion
                    .node_completed(node_job.execution_id, &node_job.node_id, output.clone())
                    .await
                    .map_err(|e| e.to_job_failure())?;
                Ok(output)
            }
            Ok(NodeRun::Deferred(result)) => Ok(result),
            Err(e) => Err(self.record_failure(job, &node_job, &e).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{EdgeDefinition, NodeDefinition, WorkflowDefinition};
    use crate::execution::{ExecutionStatus, NodeStatus};
    use crate::testing::{
        FakeStorage, Harness, ScriptedPredictions, fast_config, id, prediction, succeeded,
    };
    use genweave_provider::ProviderError;
    use genweave_queue::{DeliveryOutcome, QueueName};

    fn single_image() -> WorkflowDefinition {
        WorkflowDefinition::new("single").with_node(NodeDefinition::new(
            "img",
            "imageGen",
            json!({"prompt": "a lighthouse"}),
        ))
    }

    fn polling(predictions: ScriptedPredictions, interval_ms: u64, attempts: u32) -> Harness {
        Harness::build(
            predictions,
            FakeStorage::default(),
            fast_config()
                .with_completion_mode(CompletionMode::Poll)
                .with_poll(interval_ms, attempts),
        )
    }

    #[tokio::test]
    async fn retryable_failures_exhaust_attempts_then_dead_letter() {
        let h = Harness::with_predictions(ScriptedPredictions::new().failing_submit(
            ProviderError::RequestFailed {
                reason: "connection reset".into(),
            },
        ));
        let execution_id = h.start(single_image()).await;
        h.step(QueueName::WorkflowOrchestrator).await;

        assert!(matches!(
            h.step(QueueName::ImageGeneration).await,
            Some(DeliveryOutcome::Retry { .. })
        ));
        let execution = h.execution(execution_id).await;
        assert_eq!(execution.status, ExecutionStatus::Running);
        let result = execution.node_result(&id("img")).expect("result");
        assert_eq!(result.status, NodeStatus::Processing);
        assert!(result.error.as_deref().is_some_and(|e| e.contains("connection reset")));

        assert!(matches!(
            h.step(QueueName::ImageGeneration).await,
            Some(DeliveryOutcome::Retry { .. })
        ));
        assert_eq!(
            h.step(QueueName::ImageGeneration).await,
            Some(DeliveryOutcome::Failed)
        );
        assert_eq!(h.step(QueueName::ImageGeneration).await, None);

        let moves = h.records.dead_letter_moves().await;
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].1, QueueName::ImageGeneration);

        let execution = h.execution(execution_id).await;
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.node_status(&id("img")), Some(NodeStatus::Error));
        assert!(
            execution
                .error
                .expect("error")
                .starts_with("Node img failed:")
        );
    }

    #[tokio::test]
    async fn fatal_failure_is_not_retried_or_dead_lettered() {
        let h = Harness::with_predictions(ScriptedPredictions::new().failing_submit(
            ProviderError::InvalidRequest {
                reason: "unknown model".into(),
            },
        ));
        let execution_id = h.start(single_image()).await;
        h.step(QueueName::WorkflowOrchestrator).await;

        assert_eq!(
            h.step(QueueName::ImageGeneration).await,
            Some(DeliveryOutcome::Failed)
        );
        assert!(h.records.dead_letter_moves().await.is_empty());
        let execution = h.execution(execution_id).await;
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(execution.error.expect("error").contains("unknown model"));
    }

    #[tokio::test]
    async fn poll_mode_completes_node_inline() {
        let predictions = ScriptedPredictions::new();
        predictions.script_status(
            "pred-1",
            vec![
                prediction("pred-1", PredictionStatus::Processing),
                succeeded("pred-1", &["https://provider/out.png"]),
            ],
        );
        let h = polling(predictions, 1, 50);
        let execution_id = h.start(single_image()).await;
        h.step(QueueName::WorkflowOrchestrator).await;

        assert_eq!(
            h.step(QueueName::ImageGeneration).await,
            Some(DeliveryOutcome::Completed)
        );
        assert_eq!(h.predictions.status_checks(), 2);
        let execution = h.execution(execution_id).await;
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(
            execution.node_status(&id("img")),
            Some(NodeStatus::Complete)
        );
        assert_eq!(
            h.predictions.submitted()[0].input["prompt"],
            json!("a lighthouse")
        );
    }

    #[tokio::test]
    async fn poll_timeout_cancels_prediction_and_fails_node() {
        let h = polling(ScriptedPredictions::new(), 1, 3);
        let execution_id = h.start(single_image()).await;
        h.step(QueueName::WorkflowOrchestrator).await;

        assert_eq!(
            h.step(QueueName::ImageGeneration).await,
            Some(DeliveryOutcome::Failed)
        );
        assert_eq!(h.predictions.status_checks(), 3);
        assert_eq!(h.predictions.cancelled(), vec!["pred-1".to_string()]);
        let execution = h.execution(execution_id).await;
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(execution.error.expect("error").contains("timed out"));
    }

    #[tokio::test]
    async fn llm_node_generates_text_synchronously() {
        let h = Harness::new();
        let definition = WorkflowDefinition::new("caption")
            .with_node(NodeDefinition::new(
                "p",
                "prompt",
                json!({"text": "describe a cat"}),
            ))
            .with_node(NodeDefinition::new(
                "writer",
                "llm",
                json!({"model": "small", "temperature": 0.2, "maxTokens": 64}),
            ))
            .with_edge(EdgeDefinition::new("p", "writer").with_handles("text", "prompt"));
        let execution_id = h.start(definition).await;
        h.step(QueueName::WorkflowOrchestrator).await;

        assert_eq!(
            h.step(QueueName::LlmGeneration).await,
            Some(DeliveryOutcome::Completed)
        );
        let requests = h.text.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].prompt, "describe a cat");
        assert_eq!(requests[0].max_tokens, Some(64));

        let execution = h.execution(execution_id).await;
        assert_eq!(execution.status, ExecutionStatus::Completed);
        let output = execution
            .node_result(&id("writer"))
            .and_then(|r| r.output.clone())
            .expect("output");
        assert_eq!(output["text"], json!("echo: describe a cat"));
        assert_eq!(output["model"], json!("small"));
    }

    #[tokio::test]
    async fn llm_node_without_prompt_fails() {
        let h = Harness::new();
        let execution_id = h
            .start(
                WorkflowDefinition::new("empty prompt")
                    .with_node(NodeDefinition::new("writer", "llm", json!({}))),
            )
            .await;
        h.step(QueueName::WorkflowOrchestrator).await;

        assert_eq!(
            h.step(QueueName::LlmGeneration).await,
            Some(DeliveryOutcome::Failed)
        );
        let execution = h.execution(execution_id).await;
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(execution.error.expect("error").contains("no prompt provided"));
    }

    #[tokio::test]
    async fn redelivery_resumes_submitted_prediction() {
        let h = Harness::new();
        let execution_id = h.start(single_image()).await;
        h.step(QueueName::WorkflowOrchestrator).await;
        h.step(QueueName::ImageGeneration).await;
        h.predictions
            .script_status("pred-1", vec![succeeded("pred-1", &["https://provider/out.png"])]);

        let job = h.published_for("img").await.remove(0);
        let result = h
            .engine
            .processor_for(QueueName::ImageGeneration)
            .process(&job)
            .await
            .expect("redelivery");

        assert_eq!(result["predictionId"], json!("pred-1"));
        assert_eq!(h.predictions.submitted().len(), 1);
        assert_eq!(h.predictions.status_checks(), 1);
        assert_eq!(
            h.execution(execution_id).await.status,
            ExecutionStatus::Completed
        );
    }

    #[tokio::test]
    async fn job_for_finished_execution_is_skipped() {
        let h = Harness::new();
        let execution_id = h.start(single_image()).await;
        h.step(QueueName::WorkflowOrchestrator).await;
        h.engine
            .canceller()
            .cancel_execution(execution_id)
            .await
            .expect("cancel");

        assert_eq!(
            h.step(QueueName::ImageGeneration).await,
            Some(DeliveryOutcome::Completed)
        );
        assert!(h.predictions.submitted().is_empty());
    }
}
