//! Test doubles and an engine wired entirely in memory.

use crate::completion::CompletionOutcome;
use crate::config::EngineConfig;
use crate::definition::WorkflowDefinition;
use crate::engine::{Engine, EngineDeps};
use crate::execution::Execution;
use crate::orchestrator::NodeJob;
use crate::source::InMemoryWorkflowSource;
use crate::store::{ExecutionStore, InMemoryExecutionStore};
use async_trait::async_trait;
use genweave_core::{ExecutionId, NodeId, WorkflowId};
use genweave_provider::{
    OutputStorage, Prediction, PredictionMetrics, PredictionProvider, PredictionRequest,
    PredictionStatus, ProviderError, SavedOutput, TextGenerator, TextRequest, TextResponse,
    TokenUsage,
};
use genweave_queue::{
    DeliveryOutcome, InMemoryJobQueue, InMemoryJobRecordStore, JobQueue, QueueClient, QueueError,
    QueueName, QueuedJob,
};
use serde_json::{Value as JsonValue, json};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn prediction(id: &str, status: PredictionStatus) -> Prediction {
    Prediction {
        id: id.to_string(),
        status,
        output: None,
        error: None,
        metrics: None,
    }
}

pub fn succeeded(id: &str, urls: &[&str]) -> Prediction {
    Prediction {
        output: Some(json!(urls)),
        ..prediction(id, PredictionStatus::Succeeded)
    }
}

pub fn succeeded_with_cost(id: &str, urls: &[&str], cost: f64) -> Prediction {
    Prediction {
        metrics: Some(PredictionMetrics {
            predict_time: Some(1.5),
            cost: Some(cost),
        }),
        ..succeeded(id, urls)
    }
}

pub fn failed(id: &str, error: &str) -> Prediction {
    Prediction {
        error: Some(error.to_string()),
        ..prediction(id, PredictionStatus::Failed)
    }
}

/// Prediction provider with scripted ids, failures and status sequences.
#[derive(Default)]
pub struct ScriptedPredictions {
    ids: Mutex<VecDeque<String>>,
    counter: AtomicUsize,
    submit_error: Mutex<Option<ProviderError>>,
    statuses: Mutex<HashMap<String, VecDeque<Prediction>>>,
    submitted: Mutex<Vec<PredictionRequest>>,
    status_checks: AtomicUsize,
    cancelled: Mutex<Vec<String>>,
}

impl ScriptedPredictions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids handed out by `submit`, in order, before falling back to `pred-N`.
    pub fn with_ids(self, ids: &[&str]) -> Self {
        *self.ids.lock().expect("ids poisoned") = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Every `submit` fails with `error`.
    pub fn failing_submit(self, error: ProviderError) -> Self {
        *self.submit_error.lock().expect("error poisoned") = Some(error);
        self
    }

    /// Responses for `get_status(id)`; the last one repeats.
    pub fn script_status(&self, id: &str, responses: Vec<Prediction>) {
        self.statuses
            .lock()
            .expect("statuses poisoned")
            .insert(id.to_string(), responses.into());
    }

    pub fn submitted(&self) -> Vec<PredictionRequest> {
        self.submitted.lock().expect("submitted poisoned").clone()
    }

    pub fn status_checks(&self) -> usize {
        self.status_checks.load(Ordering::SeqCst)
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().expect("cancelled poisoned").clone()
    }
}

#[async_trait]
impl PredictionProvider for ScriptedPredictions {
    async fn submit(&self, request: &PredictionRequest) -> Result<Prediction, ProviderError> {
        if let Some(error) = self.submit_error.lock().expect("error poisoned").clone() {
            return Err(error);
        }
        self.submitted
            .lock()
            .expect("submitted poisoned")
            .push(request.clone());
        let id = self
            .ids
            .lock()
            .expect("ids poisoned")
            .pop_front()
            .unwrap_or_else(|| format!("pred-{}", self.counter.fetch_add(1, Ordering::SeqCst) + 1));
        Ok(prediction(&id, PredictionStatus::Starting))
    }

    async fn get_status(&self, id: &str) -> Result<Prediction, ProviderError> {
        self.status_checks.fetch_add(1, Ordering::SeqCst);
        let mut statuses = self.statuses.lock().expect("statuses poisoned");
        let Some(responses) = statuses.get_mut(id) else {
            return Ok(prediction(id, PredictionStatus::Processing));
        };
        let next = if responses.len() > 1 {
            responses.pop_front()
        } else {
            responses.front().cloned()
        };
        Ok(next.unwrap_or_else(|| prediction(id, PredictionStatus::Processing)))
    }

    async fn cancel(&self, id: &str) -> Result<(), ProviderError> {
        self.cancelled
            .lock()
            .expect("cancelled poisoned")
            .push(id.to_string());
        Ok(())
    }
}

/// Text generator that echoes its prompt.
#[derive(Default)]
pub struct EchoText {
    requests: Mutex<Vec<TextRequest>>,
}

impl EchoText {
    pub fn requests(&self) -> Vec<TextRequest> {
        self.requests.lock().expect("requests poisoned").clone()
    }
}

#[async_trait]
impl TextGenerator for EchoText {
    async fn generate(&self, request: &TextRequest) -> Result<TextResponse, ProviderError> {
        self.requests
            .lock()
            .expect("requests poisoned")
            .push(request.clone());
        Ok(TextResponse {
            content: format!("echo: {}", request.prompt),
            usage: TokenUsage {
                input_tokens: 4,
                output_tokens: 6,
            },
            model: request.model.clone().unwrap_or_else(|| "test-model".to_string()),
        })
    }
}

/// Storage that pretends to copy files to a CDN.
#[derive(Default)]
pub struct FakeStorage {
    fail: bool,
}

impl FakeStorage {
    pub fn failing() -> Self {
        Self { fail: true }
    }
}

#[async_trait]
impl OutputStorage for FakeStorage {
    async fn download_and_save_output(
        &self,
        workflow_id: WorkflowId,
        node_id: &NodeId,
        url: &str,
        reference: &str,
    ) -> Result<SavedOutput, ProviderError> {
        if self.fail {
            return Err(ProviderError::Storage {
                reason: "disk full".into(),
            });
        }
        let file = url.rsplit('/').next().unwrap_or("output");
        let path = format!("{workflow_id}/{node_id}/{reference}_{file}");
        Ok(SavedOutput {
            url: format!("https://cdn.test/{path}"),
            path,
        })
    }
}

/// In-memory transport that can be told to reject upcoming publishes.
pub struct FlakyQueue {
    inner: InMemoryJobQueue,
    failures: AtomicUsize,
}

impl FlakyQueue {
    pub fn new(inner: InMemoryJobQueue) -> Self {
        Self {
            inner,
            failures: AtomicUsize::new(0),
        }
    }

    /// The next `count` enqueues fail.
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl JobQueue for FlakyQueue {
    async fn enqueue(&self, job: QueuedJob) -> Result<(), QueueError> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(QueueError::PublishFailed {
                message: "broker unavailable".into(),
            });
        }
        self.inner.enqueue(job).await
    }

    async fn requeue(&self, job: QueuedJob, delay: Duration) -> Result<(), QueueError> {
        self.inner.requeue(job, delay).await
    }
}

/// An engine over in-memory stores, queues and scripted providers.
pub struct Harness {
    pub store: Arc<InMemoryExecutionStore>,
    pub workflows: Arc<InMemoryWorkflowSource>,
    pub transport: InMemoryJobQueue,
    /// The engine publishes through this wrapper around `transport`.
    pub publishing: Arc<FlakyQueue>,
    pub records: Arc<InMemoryJobRecordStore>,
    pub predictions: Arc<ScriptedPredictions>,
    pub text: Arc<EchoText>,
    pub engine: Engine,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(ScriptedPredictions::new(), FakeStorage::default(), fast_config())
    }

    pub fn with_predictions(predictions: ScriptedPredictions) -> Self {
        Self::build(predictions, FakeStorage::default(), fast_config())
    }

    pub fn build(
        predictions: ScriptedPredictions,
        storage: FakeStorage,
        config: EngineConfig,
    ) -> Self {
        let store = Arc::new(InMemoryExecutionStore::new());
        let workflows = Arc::new(InMemoryWorkflowSource::new());
        let transport = InMemoryJobQueue::new();
        let publishing = Arc::new(FlakyQueue::new(transport.clone()));
        let records = Arc::new(InMemoryJobRecordStore::new());
        let predictions = Arc::new(predictions);
        let text = Arc::new(EchoText::default());
        let engine = Engine::new(EngineDeps {
            store: store.clone(),
            workflows: workflows.clone(),
            queue: QueueClient::new(publishing.clone(), records.clone()),
            predictions: predictions.clone(),
            text: text.clone(),
            storage: Arc::new(storage),
            config,
        });
        Self {
            store,
            workflows,
            transport,
            publishing,
            records,
            predictions,
            text,
            engine,
        }
    }

    pub async fn add_workflow(&self, definition: WorkflowDefinition) -> WorkflowId {
        let id = definition.id;
        self.workflows.insert(definition).await;
        id
    }

    /// Registers `definition` and starts an execution of it.
    pub async fn start(&self, definition: WorkflowDefinition) -> ExecutionId {
        let workflow_id = self.add_workflow(definition).await;
        self.engine
            .orchestrator()
            .start_execution(workflow_id)
            .await
            .expect("start execution")
            .id
    }

    pub async fn execution(&self, id: ExecutionId) -> Execution {
        self.store.find_execution(id).await.expect("execution")
    }

    /// Handles the next job waiting on `queue`.
    pub async fn step(&self, queue: QueueName) -> Option<DeliveryOutcome> {
        self.transport
            .process_next(&self.engine.runtime(queue))
            .await
    }

    /// Waits for a job to show up on `queue`, then handles it.
    pub async fn step_when_ready(&self, queue: QueueName) -> DeliveryOutcome {
        for _ in 0..500 {
            if !self.transport.pending(queue).await.is_empty() {
                return self.step(queue).await.expect("job");
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("no job arrived on {queue}");
    }

    pub async fn node_jobs(&self, queue: QueueName) -> Vec<NodeJob> {
        self.transport
            .pending(queue)
            .await
            .iter()
            .map(|job| job.payload_as().expect("node job"))
            .collect()
    }

    /// Every node job ever published for `node`.
    pub async fn published_for(&self, node: &str) -> Vec<QueuedJob> {
        self.transport
            .published()
            .await
            .into_iter()
            .filter(|job| job.payload.get("nodeId") == Some(&JsonValue::from(node)))
            .collect()
    }

    pub async fn webhook(&self, update: Prediction) -> CompletionOutcome {
        self.engine
            .completion()
            .handle_prediction_update(&update)
            .await
            .expect("completion")
    }
}

pub fn fast_config() -> EngineConfig {
    EngineConfig::default().with_poll(2, 500)
}

pub fn id(node: &str) -> NodeId {
    NodeId::from(node)
}
