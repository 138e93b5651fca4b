//! Engine tuning.

use genweave_queue::JobOptions;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How asynchronous predictions report completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionMode {
    /// The provider calls back; the node job returns after submission.
    #[default]
    Webhook,
    /// The node job polls the provider until the prediction finishes.
    Poll,
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub completion_mode: CompletionMode,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_poll_attempts")]
    pub max_poll_attempts: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub subworkflow_poll_interval_ms: u64,
    #[serde(default = "default_max_poll_attempts")]
    pub subworkflow_max_poll_attempts: u32,
    /// Options for every node job the orchestrator enqueues.
    #[serde(default)]
    pub node_job_options: JobOptions,
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_max_poll_attempts() -> u32 {
    360
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            completion_mode: CompletionMode::default(),
            poll_interval_ms: default_poll_interval_ms(),
            max_poll_attempts: default_max_poll_attempts(),
            subworkflow_poll_interval_ms: default_poll_interval_ms(),
            subworkflow_max_poll_attempts: default_max_poll_attempts(),
            node_job_options: JobOptions::default(),
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub fn subworkflow_poll_interval(&self) -> Duration {
        Duration::from_millis(self.subworkflow_poll_interval_ms)
    }

    #[must_use]
    pub fn with_completion_mode(mut self, mode: CompletionMode) -> Self {
        self.completion_mode = mode;
        self
    }

    /// Shortens every poll loop; used where waiting is not the point.
    #[must_use]
    pub fn with_poll(mut self, interval_ms: u64, max_attempts: u32) -> Self {
        self.poll_interval_ms = interval_ms;
        self.max_poll_attempts = max_attempts;
        self.subworkflow_poll_interval_ms = interval_ms;
        self.subworkflow_max_poll_attempts = max_attempts;
        self
    }
}
