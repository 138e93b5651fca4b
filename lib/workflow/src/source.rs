//! Access to stored workflow definitions.

use crate::definition::WorkflowDefinition;
use crate::error::SourceError;
use async_trait::async_trait;
use genweave_core::WorkflowId;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Read-only lookup of workflow definitions.
///
/// Definitions are fetched live on every use, so edits to a referenced
/// workflow apply to the next run that loads it.
#[async_trait]
pub trait WorkflowSource: Send + Sync {
    async fn find_one(&self, workflow_id: WorkflowId) -> Result<WorkflowDefinition, SourceError>;
}

/// Process-local [`WorkflowSource`].
#[derive(Default)]
pub struct InMemoryWorkflowSource {
    workflows: RwLock<HashMap<WorkflowId, WorkflowDefinition>>,
}

impl InMemoryWorkflowSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a definition.
    pub async fn insert(&self, definition: WorkflowDefinition) {
        self.workflows
            .write()
            .await
            .insert(definition.id, definition);
    }
}

#[async_trait]
impl WorkflowSource for InMemoryWorkflowSource {
    async fn find_one(&self, workflow_id: WorkflowId) -> Result<WorkflowDefinition, SourceError> {
        self.workflows
            .read()
            .await
            .get(&workflow_id)
            .cloned()
            .ok_or(SourceError::NotFound { workflow_id })
    }
}
