//! genweave server.
//!
//! This crate hosts the workflow engine: Postgres-backed state, queue
//! workers, the stall recovery sweep and a small HTTP API for starting runs
//! and receiving provider webhooks.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod startup;
pub mod workers;

#[cfg(test)]
mod testing;
