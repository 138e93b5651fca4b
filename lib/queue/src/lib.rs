//! Job queue layer for genweave.
//!
//! This crate provides the persistent, retryable task queues that carry
//! workflow work between processes:
//!
//! - **Queues**: One queue per work category with its own concurrency limit
//! - **Jobs**: Retry policy with backoff, attempt accounting, final-attempt detection
//! - **Records**: A durable job-status mirror that outlives the transport's bookkeeping
//! - **Runtime**: At-least-once delivery to registered processors with heartbeats
//! - **Transports**: In-memory (tests, single process) and NATS JetStream

pub mod client;
pub mod envelope;
pub mod error;
pub mod job;
pub mod memory;
pub mod nats;
pub mod record;
pub mod runtime;

pub use client::{JobQueue, QueueClient};
pub use envelope::Envelope;
pub use error::{QueueError, RecordStoreError};
pub use job::{
    Backoff, JobLogEntry, JobOptions, JobStatus, JobStatusUpdate, LogLevel, NewJob, QueueJob,
    QueueName, QueuedJob,
};
pub use memory::InMemoryJobQueue;
pub use record::{InMemoryJobRecordStore, JobRecordStore, Retention};
pub use runtime::{DeliveryOutcome, JobFailure, JobProcessor, JobRuntime, RuntimeConfig};
