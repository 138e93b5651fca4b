//! Stub providers and an engine wired over in-memory stores.

use async_trait::async_trait;
use genweave_core::{NodeId, WorkflowId};
use genweave_provider::{
    OutputStorage, Prediction, PredictionProvider, PredictionRequest, PredictionStatus,
    ProviderError, SavedOutput, TextGenerator, TextRequest, TextResponse,
};
use genweave_queue::{InMemoryJobQueue, InMemoryJobRecordStore, QueueClient};
use genweave_workflow::{
    Engine, EngineConfig, EngineDeps, InMemoryExecutionStore, InMemoryWorkflowSource,
};
use std::sync::{Arc, Mutex};

/// Hands out `pred-1`, `pred-2`, ... and remembers what it was asked.
#[derive(Default)]
pub struct StubPredictions {
    pub submitted: Mutex<Vec<PredictionRequest>>,
    pub cancelled: Mutex<Vec<String>>,
}

#[async_trait]
impl PredictionProvider for StubPredictions {
    async fn submit(&self, request: &PredictionRequest) -> Result<Prediction, ProviderError> {
        let mut submitted = self.submitted.lock().expect("lock");
        submitted.push(request.clone());
        Ok(Prediction {
            id: format!("pred-{}", submitted.len()),
            status: PredictionStatus::Starting,
            output: None,
            error: None,
            metrics: None,
        })
    }

    async fn get_status(&self, id: &str) -> Result<Prediction, ProviderError> {
        if id == "missing" {
            return Err(ProviderError::NotFound { id: id.to_string() });
        }
        Ok(Prediction {
            id: id.to_string(),
            status: PredictionStatus::Processing,
            output: None,
            error: None,
            metrics: None,
        })
    }

    async fn cancel(&self, id: &str) -> Result<(), ProviderError> {
        self.cancelled.lock().expect("lock").push(id.to_string());
        Ok(())
    }
}

pub struct NoText;

#[async_trait]
impl TextGenerator for NoText {
    async fn generate(&self, _request: &TextRequest) -> Result<TextResponse, ProviderError> {
        Err(ProviderError::InvalidRequest {
            reason: "text generation is not used here".to_string(),
        })
    }
}

/// Pretends to copy outputs under `/outputs/<workflow>/<node>/`.
pub struct PassThroughStorage;

#[async_trait]
impl OutputStorage for PassThroughStorage {
    async fn download_and_save_output(
        &self,
        workflow_id: WorkflowId,
        node_id: &NodeId,
        url: &str,
        reference: &str,
    ) -> Result<SavedOutput, ProviderError> {
        let file = url.rsplit('/').next().unwrap_or("output");
        let path = format!("{workflow_id}/{node_id}/{reference}_{file}");
        Ok(SavedOutput {
            url: format!("/outputs/{path}"),
            path,
        })
    }
}

pub struct TestEngine {
    pub engine: Arc<Engine>,
    pub store: Arc<InMemoryExecutionStore>,
    pub workflows: Arc<InMemoryWorkflowSource>,
    pub transport: InMemoryJobQueue,
    pub records: Arc<InMemoryJobRecordStore>,
    pub predictions: Arc<StubPredictions>,
}

impl TestEngine {
    pub fn new() -> Self {
        let store = Arc::new(InMemoryExecutionStore::new());
        let workflows = Arc::new(InMemoryWorkflowSource::new());
        let transport = InMemoryJobQueue::new();
        let records = Arc::new(InMemoryJobRecordStore::new());
        let predictions = Arc::new(StubPredictions::default());
        let engine = Arc::new(Engine::new(EngineDeps {
            store: store.clone(),
            workflows: workflows.clone(),
            queue: QueueClient::new(Arc::new(transport.clone()), records.clone()),
            predictions: predictions.clone(),
            text: Arc::new(NoText),
            storage: Arc::new(PassThroughStorage),
            config: EngineConfig::default(),
        }));
        Self {
            engine,
            store,
            workflows,
            transport,
            records,
            predictions,
        }
    }
}
