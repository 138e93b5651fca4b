//! Wiring the engine's components together.

use crate::cancel::Canceller;
use crate::completion::CompletionHandler;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::orchestrator::{OrchestrationProcessor, Orchestrator};
use crate::processor::NodeJobProcessor;
use crate::recovery::{RecoveryConfig, StallRecoveryTask};
use crate::source::WorkflowSource;
use crate::store::ExecutionStore;
use crate::subworkflow::SubWorkflowCoordinator;
use genweave_core::QueueJobId;
use genweave_provider::{OutputStorage, PredictionProvider, TextGenerator};
use genweave_queue::{
    JobProcessor, JobRuntime, QueueClient, QueueError, QueueName, QueuedJob, RuntimeConfig,
};
use std::sync::Arc;
use tracing::instrument;

/// External collaborators the engine runs against.
pub struct EngineDeps {
    pub store: Arc<dyn ExecutionStore>,
    pub workflows: Arc<dyn WorkflowSource>,
    pub queue: QueueClient,
    pub predictions: Arc<dyn PredictionProvider>,
    pub text: Arc<dyn TextGenerator>,
    pub storage: Arc<dyn OutputStorage>,
    pub config: EngineConfig,
}

/// A fully wired engine.
pub struct Engine {
    orchestrator: Arc<Orchestrator>,
    completion: Arc<CompletionHandler>,
    canceller: Arc<Canceller>,
    orchestration_processor: Arc<OrchestrationProcessor>,
    node_processor: Arc<NodeJobProcessor>,
    store: Arc<dyn ExecutionStore>,
    queue: QueueClient,
}

impl Engine {
    #[must_use]
    pub fn new(deps: EngineDeps) -> Self {
        let orchestrator = Arc::new(Orchestrator::new(
            deps.store.clone(),
            deps.workflows.clone(),
            deps.queue.clone(),
            deps.config.node_job_options,
        ));
        let completion = Arc::new(CompletionHandler::new(
            deps.store.clone(),
            deps.workflows.clone(),
            orchestrator.clone(),
            deps.storage,
        ));
        let canceller = Arc::new(Canceller::new(deps.store.clone(), deps.predictions.clone()));
        let subworkflows = Arc::new(
            SubWorkflowCoordinator::new(
                deps.store.clone(),
                deps.workflows,
                orchestrator.clone(),
                canceller.clone(),
            )
            .with_polling(
                deps.config.subworkflow_poll_interval(),
                deps.config.subworkflow_max_poll_attempts,
            ),
        );
        let node_processor = Arc::new(NodeJobProcessor::new(
            deps.store.clone(),
            deps.queue.clone(),
            deps.predictions,
            deps.text,
            completion.clone(),
            subworkflows,
            deps.config,
        ));

        Self {
            orchestration_processor: Arc::new(OrchestrationProcessor::new(orchestrator.clone())),
            orchestrator,
            completion,
            canceller,
            node_processor,
            store: deps.store,
            queue: deps.queue,
        }
    }

    #[must_use]
    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    #[must_use]
    pub fn completion(&self) -> &Arc<CompletionHandler> {
        &self.completion
    }

    #[must_use]
    pub fn canceller(&self) -> &Arc<Canceller> {
        &self.canceller
    }

    #[must_use]
    pub fn queue(&self) -> &QueueClient {
        &self.queue
    }

    /// The processor that serves `queue`.
    #[must_use]
    pub fn processor_for(&self, queue: QueueName) -> Arc<dyn JobProcessor> {
        match queue {
            QueueName::WorkflowOrchestrator => self.orchestration_processor.clone(),
            QueueName::ImageGeneration
            | QueueName::VideoGeneration
            | QueueName::LlmGeneration
            | QueueName::Processing
            | QueueName::SubWorkflow => self.node_processor.clone(),
        }
    }

    /// A job runtime for `queue` with its default concurrency.
    #[must_use]
    pub fn runtime(&self, queue: QueueName) -> JobRuntime {
        self.runtime_with(queue, RuntimeConfig::for_queue(queue))
    }

    #[must_use]
    pub fn runtime_with(&self, queue: QueueName, config: RuntimeConfig) -> JobRuntime {
        JobRuntime::new(queue, self.queue.clone(), self.processor_for(queue), config)
    }

    /// Takes a job out of the dead-letter queue and runs it again.
    ///
    /// A job that belongs to a finished execution, or to a node that already
    /// has a final result, would be skipped on delivery and is refused.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidState`] for a refused job, and any error
    /// of [`QueueClient::retry_dead_letter`].
    #[instrument(skip(self))]
    pub async fn retry_dead_letter(&self, job_id: QueueJobId) -> Result<QueuedJob, EngineError> {
        let job = self.queue.find_job(job_id).await?;
        if let Some(execution_id) = job.execution_id {
            let execution = self.store.find_execution(execution_id).await?;
            let refusal = if execution.status.is_terminal() {
                Some(format!("execution {execution_id} is already {}", execution.status))
            } else {
                job.node_id.as_ref().and_then(|node_id| {
                    execution
                        .node_status(node_id)
                        .filter(|status| status.is_terminal())
                        .map(|status| format!("node {node_id} already finished as {status}"))
                })
            };
            if let Some(reason) = refusal {
                return Err(QueueError::InvalidState { job_id, reason }.into());
            }
        }
        Ok(self.queue.retry_dead_letter(job_id).await?)
    }

    #[must_use]
    pub fn recovery_task(&self, config: RecoveryConfig) -> StallRecoveryTask {
        StallRecoveryTask::new(self.queue.clone(), self.completion.clone(), config)
    }
}
