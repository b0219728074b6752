//! SubEntity Emergence Core Library
//!
//! Detects when a live retrieval system would benefit from a new memory
//! cluster (a "subentity") and decides, with adaptive statistical gates,
//! whether to create one.
//!
//! # Architecture
//!
//! The pipeline is four synchronous stages, all built on the same
//! [`gate::QuantileGate`] primitive:
//!
//! - [`gap::GapDetector`] — scores each retrieval for semantic, quality,
//!   and structural gaps and emits [`gap::GapSignal`]s
//! - [`coalition::CoalitionAssembler`] — grows a candidate node coalition
//!   around a gap via seed, expand, and prune phases
//! - [`validator::EmergenceValidator`] — recomputes coalition features from
//!   the graph and makes the terminal SPAWN / REDIRECT / REJECT decision
//! - [`membership::MembershipWeightLearner`] — refines spawned clusters
//!   from frame-level co-activation evidence
//!
//! Graph access goes through the [`graph::GraphAccessor`] trait;
//! [`stubs::InMemoryGraph`] is a ready-made test backend.
//!
//! # Example
//!
//! ```
//! use emergence_core::gate::{ComparisonMode, GateConfig, GateStatus, QuantileGate};
//!
//! let mut gate = QuantileGate::new(
//!     GateConfig::new("coverage", 0.30, ComparisonMode::Below).with_min_samples(10),
//! )
//! .unwrap();
//! for i in 0..10 {
//!     gate.record(i as f32 / 10.0);
//! }
//! assert_eq!(gate.evaluate(0.05).status, GateStatus::Pass);
//! ```

pub mod coalition;
pub mod error;
pub mod gap;
pub mod gate;
pub mod graph;
pub mod membership;
pub mod stubs;
pub mod validator;

// Re-exports for convenience
pub use coalition::{Coalition, CoalitionAssembler, CoalitionAssemblyConfig};
pub use error::{EmergenceError, EmergenceResult, GraphAccessError};
pub use gap::{GapDetectionConfig, GapDetector, GapSignal, GapType};
pub use gate::{ComparisonMode, GateCollection, GateConfig, GateStatus, QuantileGate};
pub use graph::{GraphAccessor, GraphNode};
pub use membership::{MembershipAdjustment, MembershipWeightLearner};
pub use validator::{
    EmergenceDecision, EmergenceValidator, EmergenceValidatorConfig, ValidationResult,
};
