//! Centralized server configuration.
//!
//! This module provides strongly-typed configuration for the server,
//! loaded via the `config` crate from environment variables. Nested keys use
//! `__` as the separator, e.g. `ENGINE__COMPLETION_MODE=poll` or
//! `QUEUES__VIDEO_CONCURRENCY=1`.

use genweave_provider::{HttpProviderConfig, TextGeneratorConfig};
use genweave_queue::{Backoff, JobOptions, QueueName, RuntimeConfig};
use genweave_queue::nats::NatsQueueConfig;
use genweave_workflow::{EngineConfig, RecoveryConfig};
use serde::Deserialize;
use std::time::Duration;

/// Server configuration composed from library configs.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// PostgreSQL database connection URL.
    pub database_url: String,

    /// JetStream connection. Without it jobs run on in-process queues.
    #[serde(default)]
    pub nats: Option<NatsConfig>,

    #[serde(default)]
    pub http: HttpConfig,

    /// Prediction provider (image, video and processing models).
    pub provider: HttpProviderConfig,

    /// OpenAI-compatible text generation.
    pub text: TextGeneratorConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub queues: QueuesConfig,

    #[serde(default)]
    pub recovery: RecoveryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NatsConfig {
    pub url: String,
    #[serde(default)]
    pub stream_prefix: Option<String>,
    /// Seconds JetStream waits for an ack before redelivering.
    #[serde(default = "default_ack_wait_secs")]
    pub ack_wait_secs: u64,
}

fn default_ack_wait_secs() -> u64 {
    60
}

impl NatsConfig {
    #[must_use]
    pub fn queue_config(&self) -> NatsQueueConfig {
        NatsQueueConfig {
            url: self.url.clone(),
            stream_prefix: self.stream_prefix.clone(),
            ack_wait: Duration::from_secs(self.ack_wait_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

fn default_bind_address() -> String {
    "0.0.0.0:3000".to_string()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

/// Where provider outputs are copied and how they are served back.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    /// Prefix of the URLs handed out for saved files.
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
}

fn default_output_dir() -> String {
    "outputs".to_string()
}

fn default_public_base_url() -> String {
    "/outputs".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            public_base_url: default_public_base_url(),
        }
    }
}

/// Worker concurrency and node job retry policy.
///
/// Unset concurrency values fall back to each queue's default.
#[derive(Debug, Clone, Deserialize)]
pub struct QueuesConfig {
    #[serde(default)]
    pub orchestrator_concurrency: Option<usize>,
    #[serde(default)]
    pub image_concurrency: Option<usize>,
    #[serde(default)]
    pub video_concurrency: Option<usize>,
    #[serde(default)]
    pub llm_concurrency: Option<usize>,
    #[serde(default)]
    pub processing_concurrency: Option<usize>,
    /// Keep above the deepest sub-workflow nesting; each level holds a slot.
    #[serde(default)]
    pub sub_workflow_concurrency: Option<usize>,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Total attempts for each node job, including the first.
    #[serde(default = "default_attempts")]
    pub default_attempts: u32,
    /// Base of the exponential delay between node job attempts.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

fn default_heartbeat_interval_secs() -> u64 {
    10
}

fn default_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

impl Default for QueuesConfig {
    fn default() -> Self {
        Self {
            orchestrator_concurrency: None,
            image_concurrency: None,
            video_concurrency: None,
            llm_concurrency: None,
            processing_concurrency: None,
            sub_workflow_concurrency: None,
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            default_attempts: default_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
        }
    }
}

impl QueuesConfig {
    /// Worker settings for one queue.
    #[must_use]
    pub fn runtime_config(&self, queue: QueueName) -> RuntimeConfig {
        let configured = match queue {
            QueueName::WorkflowOrchestrator => self.orchestrator_concurrency,
            QueueName::ImageGeneration => self.image_concurrency,
            QueueName::VideoGeneration => self.video_concurrency,
            QueueName::LlmGeneration => self.llm_concurrency,
            QueueName::Processing => self.processing_concurrency,
            QueueName::SubWorkflow => self.sub_workflow_concurrency,
        };
        RuntimeConfig {
            concurrency: configured.unwrap_or_else(|| queue.default_concurrency()).max(1),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
        }
    }

    #[must_use]
    pub fn job_options(&self) -> JobOptions {
        JobOptions {
            attempts: self.default_attempts.max(1),
            backoff: Backoff::Exponential {
                base_delay_ms: self.backoff_base_ms,
            },
            priority: 0,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required configuration is missing or invalid.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Engine settings with the node job policy from `queues` applied.
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            node_job_options: self.queues.job_options(),
            ..self.engine.clone()
        }
    }
}
