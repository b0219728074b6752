//! In-process stand-ins for real graph backends.
//!
//! [`InMemoryGraph`] implements [`GraphAccessor`] over plain hash maps. It
//! exists for tests and prototyping; a production host wires its own client
//! behind the same trait.

use std::collections::HashMap;

use crate::error::GraphAccessError;
use crate::graph::{EdgeRecord, GraphAccessor, GraphNode};

/// Simple undirected in-memory graph.
#[derive(Debug, Default, Clone)]
pub struct InMemoryGraph {
    nodes: HashMap<String, GraphNode>,
    /// Keyed by ordered id pair so lookups are direction-agnostic.
    edges: HashMap<(String, String), f32>,
}

impl InMemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a node.
    pub fn insert_node(&mut self, id: impl Into<String>, node: GraphNode) {
        self.nodes.insert(id.into(), node);
    }

    /// Insert a typed node with default remaining fields.
    pub fn insert_typed_node(&mut self, id: impl Into<String>, node_type: impl Into<String>) {
        self.insert_node(
            id,
            GraphNode {
                node_type: Some(node_type.into()),
                ..Default::default()
            },
        );
    }

    /// Insert or replace an undirected edge.
    pub fn insert_edge(&mut self, a: impl Into<String>, b: impl Into<String>, weight: f32) {
        self.edges.insert(edge_key(&a.into(), &b.into()), weight);
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }
}

fn edge_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

impl GraphAccessor for InMemoryGraph {
    fn get_node(&self, node_id: &str) -> Result<GraphNode, GraphAccessError> {
        self.nodes
            .get(node_id)
            .cloned()
            .ok_or_else(|| GraphAccessError::NodeNotFound(node_id.to_string()))
    }

    fn get_neighbors(
        &self,
        node_id: &str,
        limit: usize,
    ) -> Result<Vec<(String, f32)>, GraphAccessError> {
        let mut neighbors: Vec<(String, f32)> = self
            .edges
            .iter()
            .filter_map(|((a, b), weight)| {
                if a == node_id {
                    Some((b.clone(), *weight))
                } else if b == node_id {
                    Some((a.clone(), *weight))
                } else {
                    None
                }
            })
            .collect();
        // Strongest first; id tiebreak keeps output deterministic.
        neighbors.sort_by(|(id_a, w_a), (id_b, w_b)| {
            w_b.partial_cmp(w_a)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| id_a.cmp(id_b))
        });
        neighbors.truncate(limit);
        Ok(neighbors)
    }

    fn get_edge(&self, a: &str, b: &str) -> Result<Option<EdgeRecord>, GraphAccessError> {
        Ok(self
            .edges
            .get(&edge_key(a, b))
            .map(|&weight| EdgeRecord { weight }))
    }
}
