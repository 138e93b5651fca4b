//! Provider clients for genweave.
//!
//! Generation work is delegated to external services:
//!
//! - **Predictions**: Long-running image, video and processing jobs that
//!   finish asynchronously and report back by webhook or polling
//! - **Text**: Synchronous LLM completions
//! - **Storage**: Copies provider outputs somewhere durable before the
//!   provider's temporary URLs expire

pub mod error;
pub mod http;
pub mod prediction;
pub mod storage;
pub mod text;

pub use error::ProviderError;
pub use http::{HttpPredictionClient, HttpProviderConfig, OpenAiTextGenerator, TextGeneratorConfig};
pub use prediction::{Prediction, PredictionKind, PredictionMetrics, PredictionProvider, PredictionRequest, PredictionStatus};
pub use storage::{LocalOutputStorage, OutputStorage, SavedOutput};
pub use text::{TextGenerator, TextRequest, TextResponse, TokenUsage};
