//! HTTP surface.
//!
//! Thin handlers over the engine: start, inspect and cancel executions,
//! talk to the prediction provider directly, receive provider webhooks and
//! manage the dead-letter queue.

use crate::config::StorageConfig;
use crate::error::ApiError;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use genweave_core::{ExecutionId, QueueJobId, WorkflowId};
use genweave_provider::{Prediction, PredictionProvider, PredictionRequest};
use genweave_queue::{JobRecordStore, QueueError, QueueJob};
use genweave_workflow::{
    CancelSummary, CompletionOutcome, Engine, Execution, ExecutionStore, WorkflowSource,
};
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use std::str::FromStr;
use std::sync::Arc;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

const DEFAULT_DEAD_LETTER_LIMIT: usize = 50;

/// Shared state for every handler.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub store: Arc<dyn ExecutionStore>,
    pub workflows: Arc<dyn WorkflowSource>,
    pub predictions: Arc<dyn PredictionProvider>,
}

/// Builds the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/executions", post(start_execution))
        .route("/executions/{id}", get(get_execution))
        .route("/executions/{id}/cancel", post(cancel_execution))
        .route("/predictions", post(create_prediction))
        .route("/predictions/{id}", get(get_prediction))
        .route("/predictions/{id}/cancel", post(cancel_prediction))
        .route("/webhooks/predictions", post(prediction_webhook))
        .route("/jobs/dead-letter", get(list_dead_letter))
        .route("/jobs/{id}", get(get_job))
        .route("/jobs/{id}/retry", post(retry_job))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves saved outputs from disk when their public URLs are local paths.
pub fn with_outputs(router: Router, storage: &StorageConfig) -> Router {
    let path = storage.public_base_url.trim_end_matches('/');
    if path.starts_with('/') && path.len() > 1 {
        router.nest_service(path, ServeDir::new(&storage.output_dir))
    } else {
        router
    }
}

fn parse_id<T: FromStr>(raw: &str) -> Result<T, ApiError>
where
    T::Err: std::fmt::Display,
{
    T::from_str(raw).map_err(|e| ApiError::BadRequest {
        reason: e.to_string(),
    })
}

async fn health() -> Json<JsonValue> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartExecutionRequest {
    workflow_id: String,
}

#[instrument(skip(state))]
async fn start_execution(
    State(state): State<AppState>,
    Json(request): Json<StartExecutionRequest>,
) -> Result<(StatusCode, Json<Execution>), ApiError> {
    let workflow_id: WorkflowId = parse_id(&request.workflow_id)?;
    // Reject unknown workflows before an execution row exists for them.
    state.workflows.find_one(workflow_id).await?;

    let execution = state
        .engine
        .orchestrator()
        .start_execution(workflow_id)
        .await?;
    Ok((StatusCode::CREATED, Json(execution)))
}

async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Execution>, ApiError> {
    let execution_id: ExecutionId = parse_id(&id)?;
    Ok(Json(state.store.find_execution(execution_id).await?))
}

#[instrument(skip(state))]
async fn cancel_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CancelSummary>, ApiError> {
    let execution_id: ExecutionId = parse_id(&id)?;
    let summary = state
        .engine
        .canceller()
        .cancel_execution(execution_id)
        .await?;
    Ok(Json(summary))
}

#[instrument(skip(state, request), fields(kind = ?request.kind))]
async fn create_prediction(
    State(state): State<AppState>,
    Json(request): Json<PredictionRequest>,
) -> Result<Json<JsonValue>, ApiError> {
    let prediction = state.predictions.submit(&request).await?;
    Ok(Json(json!({
        "predictionId": prediction.id,
        "status": prediction.status,
    })))
}

async fn get_prediction(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JsonValue>, ApiError> {
    let prediction = state.predictions.get_status(&id).await?;
    Ok(Json(json!({
        "id": prediction.id,
        "status": prediction.status,
        "output": prediction.output,
        "error": prediction.error,
    })))
}

#[instrument(skip(state))]
async fn cancel_prediction(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JsonValue>, ApiError> {
    state.predictions.cancel(&id).await?;
    Ok(Json(json!({ "cancelled": true })))
}

/// Applies a provider callback inline.
///
/// Completion handling is idempotent, so a retryable failure answers 500 and
/// lets the provider redeliver. Anything else is acknowledged; redelivering it
/// would fail the same way.
#[instrument(skip(state, update), fields(prediction_id = %update.id, status = %update.status))]
async fn prediction_webhook(
    State(state): State<AppState>,
    Json(update): Json<Prediction>,
) -> (StatusCode, Json<JsonValue>) {
    match state
        .engine
        .completion()
        .handle_prediction_update(&update)
        .await
    {
        Ok(CompletionOutcome::Ignored) => {}
        Ok(outcome) => info!(?outcome, "prediction update applied"),
        Err(e) if e.is_retryable() => {
            warn!(error = %e, "prediction update failed, asking for redelivery");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "received": false })),
            );
        }
        Err(e) => warn!(error = %e, "prediction update could not be applied"),
    }
    (StatusCode::OK, Json(json!({ "received": true })))
}

#[derive(Debug, Deserialize)]
struct DeadLetterQuery {
    limit: Option<usize>,
}

async fn list_dead_letter(
    State(state): State<AppState>,
    Query(query): Query<DeadLetterQuery>,
) -> Result<Json<JsonValue>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_DEAD_LETTER_LIMIT);
    let jobs = state
        .engine
        .queue()
        .records()
        .list_dead_letter(limit)
        .await
        .map_err(QueueError::from)?;
    Ok(Json(json!({ "jobs": jobs })))
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<QueueJob>, ApiError> {
    let job_id: QueueJobId = parse_id(&id)?;
    Ok(Json(state.engine.queue().find_job(job_id).await?))
}

#[instrument(skip(state))]
async fn retry_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JsonValue>, ApiError> {
    let job_id: QueueJobId = parse_id(&id)?;
    let job = state.engine.retry_dead_letter(job_id).await?;
    Ok(Json(json!({
        "jobId": job.id,
        "queue": job.queue,
        "retried": true,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestEngine;
    use axum::body::Body;
    use axum::http::Request;
    use genweave_core::NodeId;
    use genweave_queue::{JobOptions, NewJob, QueueName};
    use genweave_workflow::{ExecutionStatus, NodeDefinition, NodeStatus, WorkflowDefinition};
    use tower::ServiceExt;

    struct TestApp {
        router: Router,
        inner: TestEngine,
    }

    impl std::ops::Deref for TestApp {
        type Target = TestEngine;

        fn deref(&self) -> &TestEngine {
            &self.inner
        }
    }

    impl TestApp {
        fn new() -> Self {
            let inner = TestEngine::new();
            let router = router(AppState {
                engine: inner.engine.clone(),
                store: inner.store.clone(),
                workflows: inner.workflows.clone(),
                predictions: inner.predictions.clone(),
            });
            Self { router, inner }
        }

        async fn send(
            &self,
            method: &str,
            uri: &str,
            body: Option<JsonValue>,
        ) -> (StatusCode, JsonValue) {
            let request = Request::builder().method(method).uri(uri);
            let request = match body {
                Some(body) => request
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string())),
                None => request.body(Body::empty()),
            }
            .expect("request");

            let response = self.router.clone().oneshot(request).await.expect("response");
            let status = response.status();
            let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
                .await
                .expect("body");
            let json = if bytes.is_empty() {
                JsonValue::Null
            } else {
                serde_json::from_slice(&bytes).expect("json body")
            };
            (status, json)
        }

        async fn step(&self, queue: QueueName) {
            self.transport
                .process_next(&self.engine.runtime(queue))
                .await
                .expect("job");
        }

        async fn execution(&self, id: ExecutionId) -> Execution {
            let (status, body) = self.send("GET", &format!("/executions/{id}"), None).await;
            assert_eq!(status, StatusCode::OK);
            serde_json::from_value(body).expect("execution")
        }
    }

    fn single_image() -> WorkflowDefinition {
        WorkflowDefinition::new("single").with_node(NodeDefinition::new(
            "img",
            "imageGen",
            json!({"model": "flux", "prompt": "a lighthouse"}),
        ))
    }

    #[tokio::test]
    async fn saved_outputs_are_served_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let node_dir = dir.path().join("wf").join("img");
        std::fs::create_dir_all(&node_dir).expect("mkdir");
        std::fs::write(node_dir.join("pred-1_a.png"), b"png bytes").expect("write");

        let storage = StorageConfig {
            output_dir: dir.path().to_string_lossy().into_owned(),
            public_base_url: "/outputs/".to_string(),
        };
        let app = with_outputs(Router::new(), &storage);
        let request = Request::builder()
            .uri("/outputs/wf/img/pred-1_a.png")
            .body(Body::empty())
            .expect("request");
        let response = app.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        assert_eq!(&bytes[..], b"png bytes");
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = TestApp::new();
        let (status, body) = app.send("GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn execution_runs_from_start_to_webhook() {
        let app = TestApp::new();
        let definition = single_image();
        let workflow_id = definition.id;
        app.workflows.insert(definition).await;

        let (status, body) = app
            .send(
                "POST",
                "/executions",
                Some(json!({"workflowId": workflow_id.to_string()})),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        let started: Execution = serde_json::from_value(body).expect("execution");
        assert_eq!(started.status, ExecutionStatus::Pending);

        app.step(QueueName::WorkflowOrchestrator).await;
        app.step(QueueName::ImageGeneration).await;
        assert_eq!(app.predictions.submitted.lock().expect("lock").len(), 1);

        let (status, body) = app
            .send(
                "POST",
                "/webhooks/predictions",
                Some(json!({
                    "id": "pred-1",
                    "status": "succeeded",
                    "output": ["https://provider.test/files/out.png"],
                    "metrics": {"cost": 0.01}
                })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"received": true}));

        let execution = app.execution(started.id).await;
        assert_eq!(execution.status, ExecutionStatus::Completed);
        let result = execution.node_result(&NodeId::from("img")).expect("result");
        assert_eq!(
            result.output.as_ref().and_then(|o| o.get("outputs")),
            Some(&json!([format!("/outputs/{workflow_id}/img/pred-1_out.png")]))
        );
    }

    #[tokio::test]
    async fn unknown_workflow_is_not_started() {
        let app = TestApp::new();
        let (status, body) = app
            .send(
                "POST",
                "/executions",
                Some(json!({"workflowId": WorkflowId::new().to_string()})),
            )
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({"error": "Workflow not found"}));
        assert!(app.transport.published().await.is_empty());
    }

    #[tokio::test]
    async fn malformed_and_unknown_ids() {
        let app = TestApp::new();
        let (status, _) = app.send("GET", "/executions/not-an-id", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = app
            .send("GET", &format!("/executions/{}", ExecutionId::new()), None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({"error": "Execution not found"}));
    }

    #[tokio::test]
    async fn cancel_reports_what_was_cancelled() {
        let app = TestApp::new();
        let definition = single_image();
        let workflow_id = definition.id;
        app.workflows.insert(definition).await;
        let execution = app
            .engine
            .orchestrator()
            .start_execution(workflow_id)
            .await
            .expect("start");
        app.step(QueueName::WorkflowOrchestrator).await;
        app.step(QueueName::ImageGeneration).await;

        let uri = format!("/executions/{}/cancel", execution.id);
        let (status, body) = app.send("POST", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cancelled"], json!(true));
        assert_eq!(body["predictionsCancelled"], json!(1));
        assert_eq!(
            *app.predictions.cancelled.lock().expect("lock"),
            vec!["pred-1".to_string()]
        );

        let (_, body) = app.send("POST", &uri, None).await;
        assert_eq!(body["cancelled"], json!(false));
        assert_eq!(app.execution(execution.id).await.status, ExecutionStatus::Cancelled);
    }

    #[tokio::test]
    async fn prediction_passthrough() {
        let app = TestApp::new();
        let (status, body) = app
            .send(
                "POST",
                "/predictions",
                Some(json!({"kind": "image", "input": {"prompt": "a fox"}})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"predictionId": "pred-1", "status": "starting"}));

        let (status, body) = app.send("GET", "/predictions/pred-1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], json!("processing"));

        let (status, _) = app.send("GET", "/predictions/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = app.send("POST", "/predictions/pred-1/cancel", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"cancelled": true}));
    }

    #[tokio::test]
    async fn webhook_for_untracked_prediction_is_acknowledged() {
        let app = TestApp::new();
        let (status, body) = app
            .send(
                "POST",
                "/webhooks/predictions",
                Some(json!({"id": "someone-else", "status": "succeeded", "output": "x"})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"received": true}));
    }

    #[tokio::test]
    async fn retrying_a_node_job_of_a_failed_execution_conflicts() {
        let app = TestApp::new();
        let definition = single_image();
        let workflow_id = definition.id;
        app.workflows.insert(definition).await;
        let (_, body) = app
            .send(
                "POST",
                "/executions",
                Some(json!({"workflowId": workflow_id.to_string()})),
            )
            .await;
        let started: Execution = serde_json::from_value(body).expect("execution");
        app.step(QueueName::WorkflowOrchestrator).await;
        app.step(QueueName::ImageGeneration).await;

        let node_job = app
            .transport
            .published()
            .await
            .into_iter()
            .find(|job| job.queue == QueueName::ImageGeneration)
            .expect("node job");
        app.records
            .move_to_dead_letter_queue(node_job.id, QueueName::ImageGeneration, "gave up".to_string())
            .await
            .expect("dead letter");
        let (status, _) = app
            .send(
                "POST",
                "/webhooks/predictions",
                Some(json!({"id": "pred-1", "status": "failed", "error": "model crashed"})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(app.execution(started.id).await.status, ExecutionStatus::Failed);

        let (status, body) = app
            .send("POST", &format!("/jobs/{}/retry", node_job.id), None)
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(
            body["error"]
                .as_str()
                .expect("message")
                .contains("is already failed")
        );
        assert!(app.transport.pending(QueueName::ImageGeneration).await.is_empty());

        let (_, body) = app.send("GET", &format!("/jobs/{}", node_job.id), None).await;
        assert_eq!(body["movedToDlq"], json!(true));
    }

    #[tokio::test]
    async fn retried_orchestration_job_resumes_a_stuck_execution() {
        let app = TestApp::new();
        let definition = single_image();
        let workflow_id = definition.id;
        app.workflows.insert(definition).await;
        let (_, body) = app
            .send(
                "POST",
                "/executions",
                Some(json!({"workflowId": workflow_id.to_string()})),
            )
            .await;
        let started: Execution = serde_json::from_value(body).expect("execution");

        let task = app
            .transport
            .pop(QueueName::WorkflowOrchestrator)
            .await
            .expect("orchestration task");
        app.records
            .move_to_dead_letter_queue(task.id, QueueName::WorkflowOrchestrator, "broker lost it".to_string())
            .await
            .expect("dead letter");

        let (status, body) = app.send("POST", &format!("/jobs/{}/retry", task.id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["queue"], json!("workflow-orchestrator"));

        app.step(QueueName::WorkflowOrchestrator).await;
        let execution = app.execution(started.id).await;
        assert_eq!(execution.status, ExecutionStatus::Running);
        assert_eq!(
            execution.node_status(&NodeId::from("img")),
            Some(NodeStatus::Processing)
        );
        assert_eq!(app.transport.pending(QueueName::ImageGeneration).await.len(), 1);
    }

    #[tokio::test]
    async fn dead_letter_jobs_can_be_listed_and_retried() {
        let app = TestApp::new();
        let job_id = app
            .engine
            .queue()
            .enqueue(
                QueueName::Processing,
                "node",
                NewJob::new(json!({"nodeId": "up"})),
                JobOptions::default(),
            )
            .await
            .expect("enqueue");
        app.transport.pop(QueueName::Processing).await.expect("queued");

        let (status, _) = app.send("POST", &format!("/jobs/{job_id}/retry"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        app.records
            .move_to_dead_letter_queue(job_id, QueueName::Processing, "gave up".to_string())
            .await
            .expect("dead letter");

        let (status, body) = app.send("GET", "/jobs/dead-letter", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["jobs"].as_array().map(Vec::len), Some(1));
        assert_eq!(body["jobs"][0]["dlqReason"], json!("gave up"));

        let (status, body) = app.send("POST", &format!("/jobs/{job_id}/retry"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["retried"], json!(true));
        assert_eq!(app.transport.pending(QueueName::Processing).await.len(), 1);

        let (status, body) = app.send("GET", &format!("/jobs/{job_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["movedToDlq"], json!(false));
        assert_eq!(body["status"], json!("pending"));
    }
}
