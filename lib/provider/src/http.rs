//! HTTP implementations of the provider contracts.
//!
//! `HttpPredictionClient` speaks the Replicate-style predictions API
//! (`POST /predictions`, `GET /predictions/{id}`,
//! `POST /predictions/{id}/cancel`). `OpenAiTextGenerator` speaks the
//! OpenAI-compatible chat completions API.

use crate::error::ProviderError;
use crate::prediction::{Prediction, PredictionKind, PredictionProvider, PredictionRequest};
use crate::text::{TextGenerator, TextRequest, TextResponse, TokenUsage};
use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use std::time::Duration;
use tracing::{debug, instrument};

/// Events the provider should call the webhook for.
const WEBHOOK_EVENTS: [&str; 2] = ["start", "completed"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpProviderConfig {
    pub base_url: String,
    pub api_token: Option<String>,
    /// Completion callback. When unset the engine has to poll.
    pub webhook_url: Option<String>,
    pub image_model: Option<String>,
    pub video_model: Option<String>,
    pub processing_model: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

impl HttpProviderConfig {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_token: None,
            webhook_url: None,
            image_model: None,
            video_model: None,
            processing_model: None,
            timeout_secs: default_timeout_secs(),
        }
    }

    fn default_model(&self, kind: PredictionKind) -> Option<&str> {
        match kind {
            PredictionKind::Image => self.image_model.as_deref(),
            PredictionKind::Video => self.video_model.as_deref(),
            PredictionKind::Processing => self.processing_model.as_deref(),
        }
    }
}

pub struct HttpPredictionClient {
    config: HttpProviderConfig,
    http: reqwest::Client,
}

impl HttpPredictionClient {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: HttpProviderConfig) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ProviderError::InvalidRequest {
                reason: format!("HTTP client error: {e}"),
            })?;
        Ok(Self { config, http })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url.trim_end_matches('/'))
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.config.api_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn submit_body(&self, request: &PredictionRequest) -> Result<JsonValue, ProviderError> {
        let model = request
            .model
            .as_deref()
            .or_else(|| self.config.default_model(request.kind))
            .ok_or_else(|| ProviderError::InvalidRequest {
                reason: format!("no model configured for {:?} predictions", request.kind),
            })?;

        let mut body = json!({ "input": request.input });
        // `owner/name:version` pins a version; anything else names a model.
        match model.split_once(':') {
            Some((_, version)) => body["version"] = json!(version),
            None => body["model"] = json!(model),
        }
        if let Some(webhook) = &self.config.webhook_url {
            body["webhook"] = json!(webhook);
            body["webhook_events_filter"] = json!(WEBHOOK_EVENTS);
        }
        Ok(body)
    }
}

async fn check(response: Response, id: Option<&str>) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after_secs = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        return Err(ProviderError::RateLimited { retry_after_secs });
    }
    if status == StatusCode::NOT_FOUND
        && let Some(id) = id
    {
        return Err(ProviderError::NotFound { id: id.to_string() });
    }
    let body = response.text().await.unwrap_or_default();
    Err(ProviderError::Http {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl PredictionProvider for HttpPredictionClient {
    #[instrument(skip_all, fields(kind = ?request.kind))]
    async fn submit(&self, request: &PredictionRequest) -> Result<Prediction, ProviderError> {
        let body = self.submit_body(request)?;
        let response = self
            .authorized(self.http.post(self.url("/predictions")))
            .json(&body)
            .send()
            .await?;
        let prediction: Prediction = check(response, None).await?.json().await?;
        debug!(prediction_id = %prediction.id, status = %prediction.status, "prediction submitted");
        Ok(prediction)
    }

    async fn get_status(&self, id: &str) -> Result<Prediction, ProviderError> {
        let response = self
            .authorized(self.http.get(self.url(&format!("/predictions/{id}"))))
            .send()
            .await?;
        Ok(check(response, Some(id)).await?.json().await?)
    }

    async fn cancel(&self, id: &str) -> Result<(), ProviderError> {
        let response = self
            .authorized(self.http.post(self.url(&format!("/predictions/{id}/cancel"))))
            .send()
            .await?;
        check(response, Some(id)).await?;
        debug!(prediction_id = %id, "prediction cancelled");
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextGeneratorConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    #[serde(default = "default_text_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_text_timeout_secs() -> u64 {
    120
}

#[derive(Deserialize)]
struct ChatCompletion {
    model: Option<String>,
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

pub struct OpenAiTextGenerator {
    config: TextGeneratorConfig,
    http: reqwest::Client,
}

impl OpenAiTextGenerator {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: TextGeneratorConfig) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ProviderError::InvalidRequest {
                reason: format!("HTTP client error: {e}"),
            })?;
        Ok(Self { config, http })
    }

    fn body(&self, request: &TextRequest) -> JsonValue {
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": request.prompt}));

        let mut body = json!({
            "model": request.model.as_deref().unwrap_or(&self.config.model),
            "messages": messages,
        });
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(max) = request.max_tokens {
            body["max_tokens"] = json!(max);
        }
        body
    }
}

#[async_trait]
impl TextGenerator for OpenAiTextGenerator {
    #[instrument(skip_all)]
    async fn generate(&self, request: &TextRequest) -> Result<TextResponse, ProviderError> {
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let mut builder = self.http.post(url).json(&self.body(request));
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }
        let completion: ChatCompletion = check(builder.send().await?, None).await?.json().await?;

        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::ResponseParseFailed {
                reason: "completion has no content".to_string(),
            })?;
        let usage = completion
            .usage
            .map(|u| TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        Ok(TextResponse {
            content,
            usage,
            model: completion
                .model
                .unwrap_or_else(|| self.config.model.clone()),
        })
    }
}
