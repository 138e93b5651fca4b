//! Domain error types for server operations.
//!
//! - `ServerError`: startup failures, reported through a rootcause `Report`
//! - `ApiError`: request failures, mapped to a status code and a user-safe
//!   message while the details go to the log

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use genweave_provider::ProviderError;
use genweave_queue::{QueueError, RecordStoreError};
use genweave_workflow::{EngineError, SourceError, StoreError};
use serde_json::json;
use std::fmt;

/// Errors that stop the server from starting or keep it from running.
#[derive(Debug)]
pub enum ServerError {
    Config { details: String },
    Database { details: String },
    Migration { details: String },
    Queue { details: String },
    Provider { details: String },
    Bind { address: String, details: String },
    Serve { details: String },
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config { details } => write!(f, "invalid configuration: {}", details),
            Self::Database { details } => write!(f, "database connection failed: {}", details),
            Self::Migration { details } => write!(f, "database migration failed: {}", details),
            Self::Queue { details } => write!(f, "job queue setup failed: {}", details),
            Self::Provider { details } => write!(f, "provider client setup failed: {}", details),
            Self::Bind { address, details } => {
                write!(f, "failed to bind to '{}': {}", address, details)
            }
            Self::Serve { details } => write!(f, "server error: {}", details),
        }
    }
}

impl std::error::Error for ServerError {}

/// Errors returned from HTTP handlers.
#[derive(Debug)]
pub enum ApiError {
    NotFound { what: String },
    BadRequest { reason: String },
    /// The resource is not in a state that allows the operation.
    Conflict { reason: String },
    /// The prediction provider could not be reached or refused the call.
    Upstream { details: String },
    Internal { details: String },
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { what } => write!(f, "{} not found", what),
            Self::BadRequest { reason } => write!(f, "bad request: {}", reason),
            Self::Conflict { reason } => write!(f, "conflict: {}", reason),
            Self::Upstream { details } => write!(f, "provider error: {}", details),
            Self::Internal { details } => write!(f, "internal error: {}", details),
        }
    }
}

impl ApiError {
    /// Status code and the message callers are allowed to see.
    fn public_parts(&self) -> (StatusCode, String) {
        match self {
            Self::NotFound { what } => (StatusCode::NOT_FOUND, format!("{} not found", what)),
            Self::BadRequest { reason } => (StatusCode::BAD_REQUEST, reason.clone()),
            Self::Conflict { reason } => (StatusCode::CONFLICT, reason.clone()),
            Self::Upstream { .. } => (StatusCode::BAD_GATEWAY, "Provider error".to_string()),
            Self::Internal { .. } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self {
            Self::Upstream { .. } | Self::Internal { .. } => {
                tracing::error!(error = %self, "request failed");
            }
            _ => tracing::debug!(error = %self, "request rejected"),
        }
        let (status, message) = self.public_parts();
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { .. } => Self::NotFound {
                what: "Execution".to_string(),
            },
            StoreError::InvalidTransition { .. } | StoreError::ExecutionTerminal { .. } => {
                Self::Conflict {
                    reason: e.to_string(),
                }
            }
            StoreError::StorageFailed { .. } => Self::Internal {
                details: e.to_string(),
            },
        }
    }
}

impl From<SourceError> for ApiError {
    fn from(e: SourceError) -> Self {
        match e {
            SourceError::NotFound { .. } => Self::NotFound {
                what: "Workflow".to_string(),
            },
            SourceError::Malformed { .. } | SourceError::StorageFailed { .. } => Self::Internal {
                details: e.to_string(),
            },
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Records(RecordStoreError::NotFound { .. }) => Self::NotFound {
                what: "Job".to_string(),
            },
            QueueError::InvalidState { reason, .. } => Self::Conflict { reason },
            other => Self::Internal {
                details: other.to_string(),
            },
        }
    }
}

impl From<ProviderError> for ApiError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::NotFound { .. } => Self::NotFound {
                what: "Prediction".to_string(),
            },
            ProviderError::InvalidRequest { reason } => Self::BadRequest { reason },
            other => Self::Upstream {
                details: other.to_string(),
            },
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Store(e) => e.into(),
            EngineError::Source(e) => e.into(),
            EngineError::Queue(e) => e.into(),
            EngineError::Provider(e) => e.into(),
            other => Self::Internal {
                details: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use genweave_core::{ExecutionId, QueueJobId, WorkflowId};

    #[test]
    fn storage_details_stay_out_of_the_response() {
        let err = ApiError::from(StoreError::StorageFailed {
            message: "connection refused to 10.0.0.5".to_string(),
        });
        let (status, message) = err.public_parts();
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!message.contains("10.0.0.5"));
    }

    #[test]
    fn missing_records_are_not_found() {
        let execution = ApiError::from(EngineError::Store(StoreError::NotFound {
            execution_id: ExecutionId::new(),
        }));
        let workflow = ApiError::from(EngineError::Source(SourceError::NotFound {
            workflow_id: WorkflowId::new(),
        }));
        let job = ApiError::from(QueueError::Records(RecordStoreError::NotFound {
            job_id: QueueJobId::new(),
        }));
        assert_eq!(execution.public_parts().1, "Execution not found");
        assert_eq!(workflow.public_parts().1, "Workflow not found");
        assert_eq!(job.public_parts().0, StatusCode::NOT_FOUND);
    }

    #[test]
    fn retrying_a_live_job_is_a_conflict() {
        let err = ApiError::from(QueueError::InvalidState {
            job_id: QueueJobId::new(),
            reason: "job is not in the dead-letter queue".to_string(),
        });
        assert_eq!(
            err.public_parts(),
            (
                StatusCode::CONFLICT,
                "job is not in the dead-letter queue".to_string()
            )
        );
    }

    #[test]
    fn provider_failures_are_bad_gateway() {
        let err = ApiError::from(ProviderError::Http {
            status: 503,
            body: "overloaded".to_string(),
        });
        assert_eq!(err.public_parts().0, StatusCode::BAD_GATEWAY);
    }
}
