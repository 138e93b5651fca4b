//! Error types for provider calls.

use std::fmt;

/// Errors from prediction, text-generation and storage calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The request never got a response (connection, DNS, timeout).
    RequestFailed { reason: String },
    /// The provider answered with a non-success status.
    Http { status: u16, body: String },
    /// Rate limit exceeded.
    RateLimited { retry_after_secs: Option<u64> },
    /// The response did not have the expected shape.
    ResponseParseFailed { reason: String },
    /// The prediction ID is unknown to the provider.
    NotFound { id: String },
    /// The request cannot be built from the given parameters.
    InvalidRequest { reason: String },
    /// Writing an output to storage failed.
    Storage { reason: String },
}

impl ProviderError {
    /// Whether the same call may succeed if tried again later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RequestFailed { .. } | Self::RateLimited { .. } | Self::Storage { .. } => true,
            Self::Http { status, .. } => *status >= 500 || *status == 408,
            Self::ResponseParseFailed { .. } | Self::NotFound { .. } | Self::InvalidRequest { .. } => {
                false
            }
        }
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RequestFailed { reason } => write!(f, "provider request failed: {reason}"),
            Self::Http { status, body } => write!(f, "provider returned {status}: {body}"),
            Self::RateLimited { retry_after_secs } => {
                if let Some(secs) = retry_after_secs {
                    write!(f, "rate limited, retry after {secs}s")
                } else {
                    write!(f, "rate limited")
                }
            }
            Self::ResponseParseFailed { reason } => {
                write!(f, "failed to parse provider response: {reason}")
            }
            Self::NotFound { id } => write!(f, "prediction not found: {id}"),
            Self::InvalidRequest { reason } => write!(f, "invalid provider request: {reason}"),
            Self::Storage { reason } => write!(f, "failed to store output: {reason}"),
        }
    }
}

impl std::error::Error for ProviderError {}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::ResponseParseFailed {
                reason: e.to_string(),
            }
        } else {
            Self::RequestFailed {
                reason: e.to_string(),
            }
        }
    }
}
