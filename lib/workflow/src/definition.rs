//! Workflow definition types.
//!
//! A workflow definition is the graph an execution runs:
//! - Nodes with a `type` string and free-form `data`
//! - Edges connecting a source handle to a target handle
//! - An optional interface, used when the workflow runs as a sub-workflow

use crate::error::GraphError;
use crate::node::{HandleType, NodeCategory};
use genweave_core::{NodeId, WorkflowId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashSet;

/// A node in a workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub data: JsonValue,
}

impl NodeDefinition {
    #[must_use]
    pub fn new(id: impl Into<NodeId>, node_type: impl Into<String>, data: JsonValue) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            data,
        }
    }

    #[must_use]
    pub fn category(&self) -> NodeCategory {
        NodeCategory::from_node_type(&self.node_type)
    }

    /// Optional nodes may fail without failing the execution.
    #[must_use]
    pub fn is_optional(&self) -> bool {
        self.data
            .get("optional")
            .and_then(JsonValue::as_bool)
            .unwrap_or(false)
    }

    /// Reads a string field from the node's data.
    #[must_use]
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(JsonValue::as_str)
    }
}

/// A directed connection between two node handles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub source: NodeId,
    pub target: NodeId,
    #[serde(default)]
    pub source_handle: Option<String>,
    #[serde(default)]
    pub target_handle: Option<String>,
}

impl EdgeDefinition {
    #[must_use]
    pub fn new(source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        Self {
            id: None,
            source: source.into(),
            target: target.into(),
            source_handle: None,
            target_handle: None,
        }
    }

    #[must_use]
    pub fn with_handles(
        mut self,
        source_handle: impl Into<String>,
        target_handle: impl Into<String>,
    ) -> Self {
        self.source_handle = Some(source_handle.into());
        self.target_handle = Some(target_handle.into());
        self
    }
}

/// An input a workflow accepts when it runs as a sub-workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceInput {
    pub name: String,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<JsonValue>,
}

fn default_required() -> bool {
    true
}

/// An output a workflow produces when it runs as a sub-workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceOutput {
    pub name: String,
}

/// The declared inputs and outputs of a workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInterface {
    #[serde(default)]
    pub inputs: Vec<InterfaceInput>,
    #[serde(default)]
    pub outputs: Vec<InterfaceOutput>,
}

impl WorkflowInterface {
    #[must_use]
    pub fn input(&self, name: &str) -> Option<&InterfaceInput> {
        self.inputs.iter().find(|i| i.name == name)
    }
}

/// A complete workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub id: WorkflowId,
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<NodeDefinition>,
    #[serde(default)]
    pub edges: Vec<EdgeDefinition>,
    #[serde(default, alias = "cachedInterface")]
    pub interface: WorkflowInterface,
}

impl WorkflowDefinition {
    /// Creates an empty definition.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: WorkflowId::new(),
            name: name.into(),
            nodes: Vec::new(),
            edges: Vec::new(),
            interface: WorkflowInterface::default(),
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: WorkflowId) -> Self {
        self.id = id;
        self
    }

    #[must_use]
    pub fn with_node(mut self, node: NodeDefinition) -> Self {
        self.nodes.push(node);
        self
    }

    #[must_use]
    pub fn with_edge(mut self, edge: EdgeDefinition) -> Self {
        self.edges.push(edge);
        self
    }

    #[must_use]
    pub fn with_interface(mut self, interface: WorkflowInterface) -> Self {
        self.interface = interface;
        self
    }

    #[must_use]
    pub fn node(&self, id: &NodeId) -> Option<&NodeDefinition> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    /// Edges whose target is `id`, in definition order.
    pub fn incoming<'a>(&'a self, id: &'a NodeId) -> impl Iterator<Item = &'a EdgeDefinition> {
        self.edges.iter().filter(move |e| &e.target == id)
    }

    /// Nodes of the given `type`, in definition order.
    pub fn nodes_of_type<'a>(
        &'a self,
        node_type: &'a str,
    ) -> impl Iterator<Item = &'a NodeDefinition> {
        self.nodes.iter().filter(move |n| n.node_type == node_type)
    }

    /// Checks the structural invariants of the graph.
    ///
    /// Cycles are not checked here; see [`crate::graph::detect_cycles`].
    ///
    /// # Errors
    ///
    /// Returns the first violation found: a duplicate node id, an edge naming
    /// an unknown node, or an edge joining handles of different types.
    pub fn validate(&self) -> Result<(), GraphError> {
        let mut seen = HashSet::with_capacity(self.nodes.len());
        for node in &self.nodes {
            if !seen.insert(&node.id) {
                return Err(GraphError::DuplicateNode {
                    node_id: node.id.clone(),
                });
            }
        }

        for edge in &self.edges {
            for end in [&edge.source, &edge.target] {
                if !seen.contains(end) {
                    return Err(GraphError::DanglingEdge {
                        source: edge.source.clone(),
                        target: edge.target.clone(),
                        missing: end.clone(),
                    });
                }
            }

            let from = HandleType::from_handle(edge.source_handle.as_deref());
            let to = HandleType::from_handle(edge.target_handle.as_deref());
            if !from.is_compatible_with(to) {
                return Err(GraphError::IncompatibleHandles {
                    source: edge.source.clone(),
                    source_handle: edge.source_handle.clone().unwrap_or_default(),
                    target: edge.target.clone(),
                    target_handle: edge.target_handle.clone().unwrap_or_default(),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chain() -> WorkflowDefinition {
        WorkflowDefinition::new("chain")
            .with_node(NodeDefinition::new("p", "prompt", json!({"text": "a cat"})))
            .with_node(NodeDefinition::new("img", "imageGen", json!({})))
            .with_edge(EdgeDefinition::new("p", "img").with_handles("text", "prompt"))
    }

    #[test]
    fn valid_definition_passes() {
        assert_eq!(chain().validate(), Ok(()));
    }

    #[test]
    fn duplicate_node_ids_are_rejected() {
        let def = chain().with_node(NodeDefinition::new("img", "videoGen", json!({})));
        assert_eq!(
            def.validate(),
            Err(GraphError::DuplicateNode {
                node_id: NodeId::from("img")
            })
        );
    }

    #[test]
    fn edges_to_unknown_nodes_are_rejected() {
        let def = chain().with_edge(EdgeDefinition::new("img", "ghost"));
        assert!(matches!(
            def.validate(),
            Err(GraphError::DanglingEdge { missing, .. }) if missing.as_str() == "ghost"
        ));
    }

    #[test]
    fn incompatible_handles_are_rejected() {
        let def = chain()
            .with_node(NodeDefinition::new("vid", "videoGen", json!({})))
            .with_edge(EdgeDefinition::new("img", "vid").with_handles("image", "video"));
        assert!(matches!(
            def.validate(),
            Err(GraphError::IncompatibleHandles { .. })
        ));
    }

    #[test]
    fn deserializes_frontend_shape() {
        let id = WorkflowId::new();
        let raw = json!({
            "id": id,
            "name": "Portrait",
            "nodes": [
                {"id": "in", "type": "workflowInput", "data": {"inputName": "subject"}},
                {"id": "gen", "type": "imageGen", "data": {"optional": true}}
            ],
            "edges": [
                {"id": "e1", "source": "in", "target": "gen",
                 "sourceHandle": "text", "targetHandle": "prompt"}
            ],
            "cachedInterface": {
                "inputs": [{"name": "subject"}],
                "outputs": [{"name": "portrait"}]
            }
        });

        let def: WorkflowDefinition = serde_json::from_value(raw).expect("deserialize");
        assert_eq!(def.id, id);
        assert_eq!(def.edges[0].target_handle.as_deref(), Some("prompt"));
        assert!(def.interface.input("subject").expect("input").required);
        assert!(def.node(&NodeId::from("gen")).expect("node").is_optional());
        assert_eq!(def.nodes_of_type("workflowInput").count(), 1);
    }
}
