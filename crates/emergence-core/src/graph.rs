//! Graph substrate access seam.
//!
//! The emergence pipeline never talks to a database directly. The host
//! supplies a [`GraphAccessor`] implementation; this crate treats it as an
//! in-process, synchronous, read-only view of the graph. If the real backend
//! is remote, any async wrapping is the host's concern (the core algorithms
//! are oblivious to it).
//!
//! Every method is fallible by design: the assembler and validator skip
//! nodes and edges whose lookups fail rather than aborting assembly.

use serde::{Deserialize, Serialize};

use crate::error::GraphAccessError;

/// Node data returned by [`GraphAccessor::get_node`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphNode {
    /// Primary node type, if the schema assigns one.
    pub node_type: Option<String>,
    /// Additional labels; the first label stands in for `node_type` when
    /// that is absent.
    pub labels: Vec<String>,
    /// Free-form description.
    pub description: String,
    /// Embedding vector, if one has been computed for this node.
    pub embedding: Option<Vec<f32>>,
    /// Current activation energy.
    pub energy: f32,
}

impl GraphNode {
    /// Effective type used for coherence computation: `node_type` if set,
    /// otherwise the first label.
    pub fn effective_type(&self) -> Option<&str> {
        self.node_type
            .as_deref()
            .or_else(|| self.labels.first().map(String::as_str))
    }
}

/// Edge data returned by [`GraphAccessor::get_edge`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EdgeRecord {
    /// Relationship strength in [0, 1].
    pub weight: f32,
}

/// Synchronous, read-only access to the graph substrate.
///
/// Implementations must be side-effect-free aside from read latency.
/// Edges are undirected from this crate's point of view: `get_edge(a, b)`
/// and `get_edge(b, a)` should agree.
pub trait GraphAccessor {
    /// Fetch a node by id.
    fn get_node(&self, node_id: &str) -> Result<GraphNode, GraphAccessError>;

    /// Fetch up to `limit` neighbors of a node as `(neighbor_id, edge_weight)`
    /// pairs, strongest first.
    fn get_neighbors(
        &self,
        node_id: &str,
        limit: usize,
    ) -> Result<Vec<(String, f32)>, GraphAccessError>;

    /// Fetch the edge between two nodes, `None` if they are not connected.
    fn get_edge(&self, a: &str, b: &str) -> Result<Option<EdgeRecord>, GraphAccessError>;
}
