//! Postgres-backed implementations of the engine's storage traits.
//!
//! - Executions and their node results
//! - The durable queue job mirror
//! - Workflow definitions (read-only)

pub mod execution;
pub mod job;
pub mod workflow;

pub use execution::PgExecutionStore;
pub use job::PgJobRecordStore;
pub use workflow::PgWorkflowSource;

use std::fmt;

/// Builds the error sqlx expects from a row whose column could not be
/// turned into a domain value.
pub(crate) fn decode_error(what: &str, value: &str, reason: impl fmt::Display) -> sqlx::Error {
    sqlx::Error::Decode(Box::new(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("invalid {what} '{value}': {reason}"),
    )))
}
