//! Workflow definitions stored by the editor.
//!
//! The engine never writes this table. Each lookup reads the current row so a
//! sub-workflow edit applies to the next run that loads it.

use async_trait::async_trait;
use genweave_core::WorkflowId;
use genweave_workflow::{
    EdgeDefinition, NodeDefinition, SourceError, WorkflowDefinition, WorkflowInterface,
    WorkflowSource,
};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgPool};

/// The graph document kept in `workflows.definition`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphDocument {
    #[serde(default)]
    nodes: Vec<NodeDefinition>,
    #[serde(default)]
    edges: Vec<EdgeDefinition>,
    #[serde(default, alias = "cachedInterface")]
    interface: WorkflowInterface,
}

/// Row type for workflow queries.
#[derive(FromRow)]
struct WorkflowRow {
    name: String,
    definition: JsonValue,
}

impl WorkflowRow {
    fn try_into_definition(self, id: WorkflowId) -> Result<WorkflowDefinition, SourceError> {
        let document: GraphDocument =
            serde_json::from_value(self.definition).map_err(|e| SourceError::Malformed {
                workflow_id: id,
                reason: e.to_string(),
            })?;
        Ok(WorkflowDefinition {
            id,
            name: self.name,
            nodes: document.nodes,
            edges: document.edges,
            interface: document.interface,
        })
    }
}

/// [`WorkflowSource`] over the `workflows` table.
#[derive(Clone)]
pub struct PgWorkflowSource {
    pool: PgPool,
}

impl PgWorkflowSource {
    /// Creates a new source.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkflowSource for PgWorkflowSource {
    async fn find_one(&self, workflow_id: WorkflowId) -> Result<WorkflowDefinition, SourceError> {
        let row: Option<WorkflowRow> = sqlx::query_as(
            r#"
            SELECT name, definition
            FROM workflows
            WHERE id = $1
            "#,
        )
        .bind(workflow_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SourceError::StorageFailed {
            message: e.to_string(),
        })?;

        match row {
            Some(r) => r.try_into_definition(workflow_id),
            None => Err(SourceError::NotFound { workflow_id }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn editor_document_becomes_definition() {
        let id = WorkflowId::new();
        let row = WorkflowRow {
            name: "portraits".to_string(),
            definition: json!({
                "nodes": [
                    {"id": "p", "type": "prompt", "data": {"prompt": "a cat"}},
                    {"id": "img", "type": "imageGen", "data": {}, "position": {"x": 10, "y": 20}}
                ],
                "edges": [
                    {"id": "e1", "source": "p", "target": "img",
                     "sourceHandle": "text", "targetHandle": "prompt"}
                ],
                "cachedInterface": {
                    "inputs": [{"name": "topic"}],
                    "outputs": [{"name": "image"}]
                },
                "viewport": {"zoom": 1.0}
            }),
        };

        let definition = row.try_into_definition(id).expect("definition");
        assert_eq!(definition.id, id);
        assert_eq!(definition.name, "portraits");
        assert_eq!(definition.nodes.len(), 2);
        assert_eq!(definition.edges[0].target_handle.as_deref(), Some("prompt"));
        assert!(definition.interface.input("topic").is_some_and(|i| i.required));
    }

    #[test]
    fn empty_document_is_an_empty_graph() {
        let row = WorkflowRow {
            name: "blank".to_string(),
            definition: json!({}),
        };
        let definition = row.try_into_definition(WorkflowId::new()).expect("definition");
        assert!(definition.nodes.is_empty());
        assert!(definition.edges.is_empty());
    }

    #[test]
    fn malformed_document_is_reported() {
        let id = WorkflowId::new();
        let row = WorkflowRow {
            name: "broken".to_string(),
            definition: json!({"nodes": "not a list"}),
        };
        assert!(matches!(
            row.try_into_definition(id),
            Err(SourceError::Malformed { workflow_id, .. }) if workflow_id == id
        ));
    }
}
