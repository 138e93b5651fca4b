//! Error types for the queue crate.
//!
//! - `RecordStoreError`: failures of the durable job-status mirror
//! - `QueueError`: transport and client failures (wraps record errors)

use genweave_core::QueueJobId;
use std::fmt;

/// Errors from a [`JobRecordStore`](crate::JobRecordStore).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordStoreError {
    /// No job record with the given ID.
    NotFound { job_id: QueueJobId },
    /// A record with this ID already exists.
    AlreadyExists { job_id: QueueJobId },
    /// The backing storage failed.
    StorageFailed { message: String },
}

impl fmt::Display for RecordStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { job_id } => write!(f, "job record not found: {job_id}"),
            Self::AlreadyExists { job_id } => write!(f, "job record already exists: {job_id}"),
            Self::StorageFailed { message } => write!(f, "job record storage failed: {message}"),
        }
    }
}

impl std::error::Error for RecordStoreError {}

/// Errors from publishing or consuming jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Could not connect to the transport or set it up.
    ConnectionFailed { message: String },
    /// Publishing a job failed.
    PublishFailed { message: String },
    /// Consuming jobs failed.
    ConsumeFailed { message: String },
    /// A job payload could not be encoded or decoded.
    Serialization { message: String },
    /// The job is not in a state that allows the operation.
    InvalidState { job_id: QueueJobId, reason: String },
    /// The durable job record could not be read or written.
    Records(RecordStoreError),
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionFailed { message } => write!(f, "queue connection failed: {message}"),
            Self::PublishFailed { message } => write!(f, "failed to publish job: {message}"),
            Self::ConsumeFailed { message } => write!(f, "failed to consume jobs: {message}"),
            Self::Serialization { message } => write!(f, "job serialization failed: {message}"),
            Self::InvalidState { job_id, reason } => write!(f, "job {job_id}: {reason}"),
            Self::Records(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for QueueError {}

impl From<RecordStoreError> for QueueError {
    fn from(e: RecordStoreError) -> Self {
        Self::Records(e)
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization {
            message: e.to_string(),
        }
    }
}
