//! Error types for emergence-core.
//!
//! Only one error class is fatal and propagates as a `Result`: gate
//! misconfiguration (a BETWEEN/OUTSIDE gate without an upper quantile level).
//! Everything else in this crate resolves to a typed result value —
//! [`GateStatus::Unknown`](crate::gate::GateStatus), `Option<Coalition>`,
//! or a REJECT decision — never an `Err`.
//!
//! Graph lookups during traversal return [`GraphAccessError`]; callers in
//! this crate match on the error branch and skip the offending node or edge
//! (fail-soft), so partial graph unavailability degrades coalition quality
//! instead of aborting the pipeline.

use thiserror::Error;

/// Top-level error for the emergence pipeline.
#[derive(Debug, Error)]
pub enum EmergenceError {
    /// Gate configuration violates a construction-time contract.
    ///
    /// This is a programming error and should fail loudly at gate
    /// construction, never during evaluation.
    #[error("Gate configuration error: {0}")]
    Config(String),
}

/// Error raised by a [`GraphAccessor`](crate::graph::GraphAccessor) lookup.
///
/// Traversal code treats any variant the same way: log at debug level and
/// skip the node or edge. The distinction exists for host implementations
/// and telemetry, not for control flow inside this crate.
#[derive(Debug, Clone, Error)]
pub enum GraphAccessError {
    /// The requested node does not exist in the graph.
    #[error("node not found: {0}")]
    NodeNotFound(String),

    /// The backing store failed (network, storage, query error).
    #[error("graph backend error: {0}")]
    Backend(String),
}

/// Result alias for fallible emergence-core operations.
pub type EmergenceResult<T> = std::result::Result<T, EmergenceError>;
