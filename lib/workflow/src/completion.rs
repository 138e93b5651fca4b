//! Continuing an execution after a node finishes.
//!
//! Prediction results arrive by webhook or from a polling node job. Both end
//! up here, where the node's result is recorded and the orchestrator gets
//! another pass. Duplicate and late deliveries are ignored.

use crate::definition::NodeDefinition;
use crate::error::{EngineError, StoreError};
use crate::execution::{NodeResultUpdate, NodeStatus};
use crate::orchestrator::{Orchestrator, PassOutcome};
use crate::source::WorkflowSource;
use crate::store::ExecutionStore;
use genweave_core::{ExecutionId, NodeId, WorkflowId};
use genweave_provider::{OutputStorage, Prediction, PredictionStatus};
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// What handling a completion did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// Unknown prediction, finished execution, finished node or a
    /// non-terminal status.
    Ignored,
    /// The node was recorded and the orchestrator ran a pass.
    Advanced(PassOutcome),
    /// A required node failed and took the execution with it.
    ExecutionFailed,
}

pub struct CompletionHandler {
    store: Arc<dyn ExecutionStore>,
    workflows: Arc<dyn WorkflowSource>,
    orchestrator: Arc<Orchestrator>,
    storage: Arc<dyn OutputStorage>,
}

impl CompletionHandler {
    #[must_use]
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        workflows: Arc<dyn WorkflowSource>,
        orchestrator: Arc<Orchestrator>,
        storage: Arc<dyn OutputStorage>,
    ) -> Self {
        Self {
            store,
            workflows,
            orchestrator,
            storage,
        }
    }

    /// Applies a prediction update from the provider.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be read or written.
    #[instrument(skip(self, update), fields(prediction_id = %update.id, status = %update.status))]
    pub async fn handle_prediction_update(
        &self,
        update: &Prediction,
    ) -> Result<CompletionOutcome, EngineError> {
        let Some((execution_id, node_id)) = self.store.find_node_by_prediction(&update.id).await?
        else {
            debug!("prediction is not tracked");
            return Ok(CompletionOutcome::Ignored);
        };
        if !update.status.is_terminal() {
            return Ok(CompletionOutcome::Ignored);
        }

        let execution = self.store.find_execution(execution_id).await?;
        if execution.status.is_terminal() {
            debug!(%execution_id, "execution already finished");
            return Ok(CompletionOutcome::Ignored);
        }
        if execution
            .node_status(&node_id)
            .is_some_and(NodeStatus::is_terminal)
        {
            debug!(%node_id, "node already finished");
            return Ok(CompletionOutcome::Ignored);
        }

        if let Some(cost) = update.cost() {
            self.store.add_cost(execution_id, cost).await?;
        }

        match update.status {
            PredictionStatus::Succeeded => {
                let output = self
                    .persist_outputs(execution.workflow_id, &node_id, update)
                    .await;
                self.node_completed(execution_id, &node_id, output).await
            }
            _ => {
                let message = update
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("prediction {}", update.status));
                self.node_failed(execution_id, &node_id, &message).await
            }
        }
    }

    /// Runs a pass without recording anything.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be read or written.
    pub async fn advance(&self, execution_id: ExecutionId) -> Result<PassOutcome, EngineError> {
        self.orchestrator.advance(execution_id).await
    }

    /// Fails an execution outright.
    ///
    /// # Errors
    ///
    /// Returns an error if the status cannot be written.
    pub async fn fail_execution(
        &self,
        execution_id: ExecutionId,
        reason: &str,
    ) -> Result<(), EngineError> {
        self.orchestrator.fail_execution(execution_id, reason).await
    }

    /// Records a node's output and runs a pass.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be read or written.
    #[instrument(skip(self, output))]
    pub async fn node_completed(
        &self,
        execution_id: ExecutionId,
        node_id: &NodeId,
        output: JsonValue,
    ) -> Result<CompletionOutcome, EngineError> {
        let recorded = self
            .store
            .update_node_result(execution_id, node_id, NodeResultUpdate::complete(output))
            .await;
        if let Err(StoreError::ExecutionTerminal { .. }) = recorded {
            return Ok(CompletionOutcome::Ignored);
        }
        recorded?;

        info!("node completed");
        let outcome = self.orchestrator.advance(execution_id).await?;
        Ok(CompletionOutcome::Advanced(outcome))
    }

    /// Records a node's terminal failure.
    ///
    /// Required nodes fail the execution. Optional nodes leave it running;
    /// their dependents are errored by the next pass.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be read or written.
    #[instrument(skip(self))]
    pub async fn node_failed(
        &self,
        execution_id: ExecutionId,
        node_id: &NodeId,
        message: &str,
    ) -> Result<CompletionOutcome, EngineError> {
        let recorded = self
            .store
            .update_node_result(execution_id, node_id, NodeResultUpdate::error(message))
            .await;
        if let Err(StoreError::ExecutionTerminal { .. }) = recorded {
            return Ok(CompletionOutcome::Ignored);
        }
        recorded?;

        if self.is_optional(execution_id, node_id).await {
            warn!(error = message, "optional node failed");
            let outcome = self.orchestrator.advance(execution_id).await?;
            return Ok(CompletionOutcome::Advanced(outcome));
        }

        warn!(error = message, "node failed");
        self.orchestrator
            .fail_execution(execution_id, &format!("Node {node_id} failed: {message}"))
            .await?;
        Ok(CompletionOutcome::ExecutionFailed)
    }

    /// Copies outputs into storage, keeping the provider URL for any file
    /// that cannot be copied.
    async fn persist_outputs(
        &self,
        workflow_id: WorkflowId,
        node_id: &NodeId,
        update: &Prediction,
    ) -> JsonValue {
        let urls = update.output_urls();
        if urls.is_empty() {
            return json!({
                "outputs": [],
                "output": update.output.clone().unwrap_or(JsonValue::Null),
                "predictionId": update.id,
            });
        }

        let mut saved = Vec::with_capacity(urls.len());
        for url in urls {
            match self
                .storage
                .download_and_save_output(workflow_id, node_id, &url, &update.id)
                .await
            {
                Ok(output) => saved.push(output.url),
                Err(e) => {
                    warn!(%url, error = %e, "failed to persist output, keeping provider url");
                    saved.push(url);
                }
            }
        }
        json!({"outputs": saved, "predictionId": update.id})
    }

    async fn is_optional(&self, execution_id: ExecutionId, node_id: &NodeId) -> bool {
        let Ok(execution) = self.store.find_execution(execution_id).await else {
            return false;
        };
        match self.workflows.find_one(execution.workflow_id).await {
            Ok(definition) => definition
                .node(node_id)
                .is_some_and(NodeDefinition::is_optional),
            Err(e) => {
                warn!(error = %e, "cannot load definition, treating node as required");
                false
            }
        }
    }
}
