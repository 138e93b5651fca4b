//! Asynchronous prediction contract.
//!
//! A prediction is submitted, runs on the provider for seconds to minutes,
//! and ends in exactly one terminal status. Providers report progress with
//! the same [`Prediction`] shape whether it arrives by webhook or by polling.

use crate::error::ProviderError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictionStatus {
    Starting,
    Processing,
    Succeeded,
    Failed,
    Canceled,
}

impl PredictionStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Processing => "processing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for PredictionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PredictionMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predict_time: Option<f64>,
    /// Provider-reported cost in US dollars.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
}

/// Provider view of one prediction. Also the webhook payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub id: String,
    pub status: PredictionStatus,
    #[serde(default)]
    pub output: Option<JsonValue>,
    #[serde(default, deserialize_with = "lenient_error")]
    pub error: Option<String>,
    #[serde(default)]
    pub metrics: Option<PredictionMetrics>,
}

impl Prediction {
    /// Output URLs in provider order. A single string output counts as one
    /// URL; non-string array items are skipped.
    #[must_use]
    pub fn output_urls(&self) -> Vec<String> {
        match &self.output {
            Some(JsonValue::String(url)) => vec![url.clone()],
            Some(JsonValue::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }

    #[must_use]
    pub fn cost(&self) -> Option<f64> {
        self.metrics.as_ref().and_then(|m| m.cost)
    }
}

/// Providers sometimes send structured errors; keep them readable.
fn lenient_error<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(JsonValue::Null) => None,
        Some(JsonValue::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

/// What kind of model a prediction runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictionKind {
    Image,
    Video,
    Processing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRequest {
    pub kind: PredictionKind,
    /// Provider model reference. Falls back to the client's default for
    /// `kind` when absent.
    #[serde(default)]
    pub model: Option<String>,
    pub input: JsonValue,
}

impl PredictionRequest {
    #[must_use]
    pub fn new(kind: PredictionKind, input: JsonValue) -> Self {
        Self {
            kind,
            model: None,
            input,
        }
    }

    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

#[async_trait]
pub trait PredictionProvider: Send + Sync {
    /// Starts a prediction and returns its initial state.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider rejects or never receives the request.
    async fn submit(&self, request: &PredictionRequest) -> Result<Prediction, ProviderError>;

    /// # Errors
    ///
    /// Returns an error if the prediction is unknown or the call fails.
    async fn get_status(&self, id: &str) -> Result<Prediction, ProviderError>;

    /// # Errors
    ///
    /// Returns an error if the cancellation cannot be delivered.
    async fn cancel(&self, id: &str) -> Result<(), ProviderError>;
}
