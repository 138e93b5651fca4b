//! Core identifiers and utilities for genweave.
//!
//! This crate provides the strongly-typed identifiers and the error handling
//! foundation shared by the queue, provider and workflow crates.

pub mod error;
pub mod id;

pub use error::Result;
pub use id::{ExecutionId, NodeId, ParseIdError, QueueJobId, WorkflowId};
