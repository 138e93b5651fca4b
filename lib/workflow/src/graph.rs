//! Graph analysis over workflow definitions using petgraph.
//!
//! Node indices follow definition order, so ties in the topological order
//! fall back to the order nodes appear in the definition. Edges naming
//! unknown nodes are skipped here; [`WorkflowDefinition::validate`]
//! reports them.
//!
//! [`WorkflowDefinition::validate`]: crate::definition::WorkflowDefinition::validate

use crate::definition::{EdgeDefinition, NodeDefinition};
use crate::error::GraphError;
use genweave_core::NodeId;
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, VecDeque};

/// Directed view of a workflow's nodes and edges.
struct AnalysisGraph<'a> {
    graph: DiGraph<&'a NodeId, ()>,
}

impl<'a> AnalysisGraph<'a> {
    fn build(nodes: &'a [NodeDefinition], edges: &'a [EdgeDefinition]) -> Self {
        let mut graph = DiGraph::with_capacity(nodes.len(), edges.len());
        let mut index: HashMap<&NodeId, NodeIndex> = HashMap::with_capacity(nodes.len());
        for node in nodes {
            // First definition wins for duplicated ids.
            if !index.contains_key(&node.id) {
                index.insert(&node.id, graph.add_node(&node.id));
            }
        }
        for edge in edges {
            if let (Some(&from), Some(&to)) = (index.get(&edge.source), index.get(&edge.target))
                && graph.find_edge(from, to).is_none()
            {
                graph.add_edge(from, to, ());
            }
        }
        Self { graph }
    }
}

/// Returns `true` if the edges form at least one cycle.
#[must_use]
pub fn detect_cycles(nodes: &[NodeDefinition], edges: &[EdgeDefinition]) -> bool {
    petgraph::algo::is_cyclic_directed(&AnalysisGraph::build(nodes, edges).graph)
}

/// Orders nodes so every node follows all of its upstream nodes.
///
/// # Errors
///
/// Returns [`GraphError::CycleDetected`] if no such order exists.
pub fn topological_sort(
    nodes: &[NodeDefinition],
    edges: &[EdgeDefinition],
) -> Result<Vec<NodeId>, GraphError> {
    let analysis = AnalysisGraph::build(nodes, edges);
    let graph = &analysis.graph;

    let mut in_degree: Vec<usize> = graph
        .node_indices()
        .map(|n| graph.neighbors_directed(n, Direction::Incoming).count())
        .collect();
    let mut ready: VecDeque<NodeIndex> = graph
        .node_indices()
        .filter(|n| in_degree[n.index()] == 0)
        .collect();

    let mut order = Vec::with_capacity(graph.node_count());
    while let Some(next) = ready.pop_front() {
        order.push(graph[next].clone());
        let mut downstream: Vec<NodeIndex> = graph
            .neighbors_directed(next, Direction::Outgoing)
            .collect();
        downstream.sort_unstable();
        for target in downstream {
            in_degree[target.index()] -= 1;
            if in_degree[target.index()] == 0 {
                ready.push_back(target);
            }
        }
    }

    if order.len() == graph.node_count() {
        Ok(order)
    } else {
        Err(GraphError::CycleDetected)
    }
}

/// Maps each node to the distinct nodes feeding it. Roots map to an empty list.
#[must_use]
pub fn build_dependency_map(
    nodes: &[NodeDefinition],
    edges: &[EdgeDefinition],
) -> HashMap<NodeId, Vec<NodeId>> {
    let analysis = AnalysisGraph::build(nodes, edges);
    let graph = &analysis.graph;
    graph
        .node_indices()
        .map(|n| {
            let mut upstream: Vec<NodeIndex> =
                graph.neighbors_directed(n, Direction::Incoming).collect();
            upstream.sort_unstable();
            let deps = upstream.into_iter().map(|u| graph[u].clone()).collect();
            (graph[n].clone(), deps)
        })
        .collect()
}
