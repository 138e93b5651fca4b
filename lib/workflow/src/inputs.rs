//! Resolving the values that flow into a node along its incoming edges.
//!
//! An upstream node's recorded output wins. A node with no output, such as a
//! boundary node, contributes its own `data` instead.

use crate::definition::{EdgeDefinition, WorkflowDefinition};
use crate::execution::Execution;
use genweave_core::NodeId;
use serde_json::{Map, Value as JsonValue};
use std::collections::HashSet;

/// Key used for edges without a target handle.
pub const DEFAULT_INPUT_KEY: &str = "input";

/// Node data keys that configure the editor, not the work.
const EDITOR_KEYS: &[&str] = &["label", "optional"];

/// Collects upstream values for `node_id`, keyed by target handle.
///
/// Several edges into one handle produce an array in edge order.
#[must_use]
pub fn resolve_inputs(
    definition: &WorkflowDefinition,
    execution: &Execution,
    node_id: &NodeId,
) -> Map<String, JsonValue> {
    let mut inputs = Map::new();
    let mut fanned_in = HashSet::new();
    for edge in definition.incoming(node_id) {
        let Some(value) = upstream_value(definition, execution, edge) else {
            continue;
        };
        let key = edge
            .target_handle
            .clone()
            .unwrap_or_else(|| DEFAULT_INPUT_KEY.to_string());
        match inputs.get_mut(&key) {
            Some(JsonValue::Array(values)) if fanned_in.contains(&key) => values.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = JsonValue::Array(vec![first, value]);
                fanned_in.insert(key);
            }
            None => {
                inputs.insert(key, value);
            }
        }
    }
    inputs
}

/// Overlays resolved inputs on a node's own data.
#[must_use]
pub fn merge_with_node_data(node_data: &JsonValue, inputs: Map<String, JsonValue>) -> JsonValue {
    let mut merged = match node_data {
        JsonValue::Object(map) => map.clone(),
        _ => Map::new(),
    };
    for key in EDITOR_KEYS {
        merged.remove(*key);
    }
    merged.extend(inputs);
    JsonValue::Object(merged)
}

/// Renders a value as prompt text.
#[must_use]
pub fn as_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(as_text).collect();
            (!parts.is_empty()).then(|| parts.join("\n"))
        }
        other => Some(other.to_string()),
    }
}

/// The value one edge carries, if its source has produced anything.
#[must_use]
pub fn upstream_value(
    definition: &WorkflowDefinition,
    execution: &Execution,
    edge: &EdgeDefinition,
) -> Option<JsonValue> {
    let handle = edge.source_handle.as_deref();
    if let Some(output) = execution
        .node_result(&edge.source)
        .and_then(|r| r.output.as_ref())
        && !is_empty(output)
    {
        return Some(select(output, handle));
    }
    definition
        .node(&edge.source)
        .map(|n| &n.data)
        .filter(|data| !is_empty(data))
        .map(|data| select(data, handle))
}

fn is_empty(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::Object(map) => map.is_empty(),
        JsonValue::Array(items) => items.is_empty(),
        JsonValue::String(s) => s.is_empty(),
        _ => false,
    }
}

fn select(value: &JsonValue, handle: Option<&str>) -> JsonValue {
    let JsonValue::Object(map) = value else {
        return value.clone();
    };
    if let Some(v) = handle.and_then(|h| map.get(h)) {
        return v.clone();
    }
    if let Some(v) = map.get("value") {
        return v.clone();
    }
    if let Some(JsonValue::Array(items)) = map.get("outputs") {
        return match items.as_slice() {
            [single] => single.clone(),
            _ => JsonValue::Array(items.clone()),
        };
    }
    for key in ["text", "url", "prompt"] {
        if let Some(v) = map.get(key) {
            return v.clone();
        }
    }
    value.clone()
}
