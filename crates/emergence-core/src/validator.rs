//! Engine-side emergence validation.
//!
//! The [`EmergenceValidator`] is the sole authority on whether a coalition
//! becomes a new cluster. It recomputes every quality feature directly from
//! the graph — a compromised or stale assembler cannot force a spawn by
//! inflating the numbers stored on the [`Coalition`].
//!
//! Decision order per call:
//!
//! 1. Recompute density, coherence, size, novelty.
//! 2. Hard size bounds (absolute, checked before any adaptive gate).
//! 3. Four adaptive gates: density, coherence, novelty, size-range.
//! 4. Redirect check against the nearest existing cluster.
//! 5. Otherwise SPAWN.
//!
//! Failed attempts still record their features into the gates, so rejected
//! coalitions keep informing future thresholds.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::coalition::{subgraph_density, type_coherence, Coalition};
use crate::error::EmergenceResult;
use crate::gate::{ComparisonMode, GateCollection, GateConfig, GateResult, GateStats};
use crate::graph::GraphAccessor;

/// Terminal decision for an emergence proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmergenceDecision {
    /// Create a new cluster from the coalition.
    Spawn,
    /// Route the coalition into an existing cluster.
    Redirect,
    /// The coalition is not suitable for emergence.
    Reject,
}

/// An existing cluster, as needed for the novelty comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExistingSubEntity {
    pub id: String,
    pub member_ids: Vec<String>,
}

/// Terminal output of the synchronous pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub decision: EmergenceDecision,
    pub coalition: Coalition,
    /// Why this decision was made, naming the violated bound or gates.
    pub reason: String,
    /// Gate evaluations consulted for this decision. Empty when a hard size
    /// bound rejected the coalition before any gate ran.
    pub gate_results: HashMap<String, GateResult>,
    /// Target cluster id when the decision is `Redirect`.
    pub redirect_target: Option<String>,
    /// Identity bundle for the spawn applier when the decision is `Spawn`.
    pub spawn_bundle: Option<HashMap<String, Value>>,
    pub timestamp: DateTime<Utc>,
    pub metadata: HashMap<String, Value>,
}

/// Configuration for emergence validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergenceValidatorConfig {
    /// Hard lower size bound (absolute, not adaptive).
    pub min_coalition_size: usize,
    /// Hard upper size bound (absolute, not adaptive).
    pub max_coalition_size: usize,

    /// Similarity to the nearest existing cluster above which the coalition
    /// is redirected instead of spawned.
    pub redirect_similarity_threshold: f32,

    /// Adaptive gate quantile levels.
    pub density_quantile_level: f32,
    pub coherence_quantile_level: f32,
    pub novelty_quantile_level: f32,
    pub size_quantile_low: f32,
    pub size_quantile_high: f32,

    pub min_samples_for_gates: usize,
    pub history_window: usize,
}

impl Default for EmergenceValidatorConfig {
    fn default() -> Self {
        Self {
            min_coalition_size: 5,
            max_coalition_size: 40,
            redirect_similarity_threshold: 0.75,
            density_quantile_level: 0.60,
            coherence_quantile_level: 0.50,
            novelty_quantile_level: 0.40,
            size_quantile_low: 0.20,
            size_quantile_high: 0.80,
            min_samples_for_gates: 30,
            history_window: 1000,
        }
    }
}

/// Features the validator recomputes from the graph.
#[derive(Debug, Clone)]
struct CoalitionFeatures {
    density: f32,
    coherence: f32,
    size: f32,
    novelty: f32,
    nearest_subentity_id: Option<String>,
}

impl CoalitionFeatures {
    /// Metric map for gate evaluation/recording.
    fn metric_map(&self) -> HashMap<String, f32> {
        HashMap::from([
            ("coalition_density".to_string(), self.density),
            ("coalition_coherence".to_string(), self.coherence),
            ("coalition_size".to_string(), self.size),
            ("novelty_distance".to_string(), self.novelty),
        ])
    }

    fn to_json(&self) -> Value {
        json!({
            "coalition_density": self.density,
            "coalition_coherence": self.coherence,
            "coalition_size": self.size,
            "novelty_distance": self.novelty,
            "nearest_subentity_id": self.nearest_subentity_id,
        })
    }
}

/// Telemetry snapshot for external monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorTelemetry {
    pub spawn_count: u64,
    pub redirect_count: u64,
    pub reject_count: u64,
    pub total_decisions: u64,
    pub spawn_rate: f32,
    pub redirect_rate: f32,
    pub reject_rate: f32,
    pub gates: HashMap<String, GateStats>,
}

/// Engine-side validator for emergence proposals.
#[derive(Debug)]
pub struct EmergenceValidator {
    config: EmergenceValidatorConfig,
    gates: GateCollection,
    spawn_count: u64,
    redirect_count: u64,
    reject_count: u64,
}

impl EmergenceValidator {
    pub fn new(config: EmergenceValidatorConfig) -> EmergenceResult<Self> {
        let mut gates = GateCollection::new();
        gates.create_gate(
            GateConfig::new(
                "coalition_density",
                config.density_quantile_level,
                ComparisonMode::Above,
            )
            .with_min_samples(config.min_samples_for_gates)
            .with_window_size(config.history_window),
        )?;
        gates.create_gate(
            GateConfig::new(
                "coalition_coherence",
                config.coherence_quantile_level,
                ComparisonMode::Above,
            )
            .with_min_samples(config.min_samples_for_gates)
            .with_window_size(config.history_window),
        )?;
        gates.create_gate(
            GateConfig::new(
                "novelty_distance",
                config.novelty_quantile_level,
                ComparisonMode::Above,
            )
            .with_min_samples(config.min_samples_for_gates)
            .with_window_size(config.history_window),
        )?;
        gates.create_gate(
            GateConfig::new(
                "coalition_size",
                config.size_quantile_low,
                ComparisonMode::Between,
            )
            .with_high_level(config.size_quantile_high)
            .with_min_samples(config.min_samples_for_gates)
            .with_window_size(config.history_window),
        )?;

        Ok(Self {
            config,
            gates,
            spawn_count: 0,
            redirect_count: 0,
            reject_count: 0,
        })
    }

    /// Validate an emergence proposal and make the terminal decision.
    ///
    /// `existing_subentities` feeds the novelty comparison; with no existing
    /// clusters the coalition is maximally novel and can never redirect.
    pub fn validate_emergence(
        &mut self,
        coalition: Coalition,
        graph: &dyn GraphAccessor,
        existing_subentities: &[ExistingSubEntity],
    ) -> ValidationResult {
        let features = self.recompute_features(&coalition, graph, existing_subentities);
        let size = coalition.nodes.len();

        // Hard bounds come before any adaptive gate.
        if size < self.config.min_coalition_size {
            self.reject_count += 1;
            return self.terminal(
                EmergenceDecision::Reject,
                coalition,
                format!(
                    "Coalition too small: {size} < {}",
                    self.config.min_coalition_size
                ),
                HashMap::new(),
                None,
                None,
                HashMap::new(),
            );
        }
        if size > self.config.max_coalition_size {
            self.reject_count += 1;
            return self.terminal(
                EmergenceDecision::Reject,
                coalition,
                format!(
                    "Coalition too large: {size} > {}",
                    self.config.max_coalition_size
                ),
                HashMap::new(),
                None,
                None,
                HashMap::new(),
            );
        }

        let metrics = features.metric_map();
        let gate_results = self.gates.evaluate_all(&metrics);
        let failed_gates = self.gates.get_failed_gates(&metrics);

        if !failed_gates.is_empty() {
            // Failed attempts still inform future thresholds.
            self.gates.record_all(&metrics);
            self.reject_count += 1;
            debug!(failed = ?failed_gates, "quality gates failed");
            return self.terminal(
                EmergenceDecision::Reject,
                coalition,
                format!("Failed quality gates: {}", failed_gates.join(", ")),
                gate_results,
                None,
                None,
                HashMap::from([("failed_gates".to_string(), json!(failed_gates))]),
            );
        }

        // Very similar to an existing cluster: redirect instead of spawn.
        if features.novelty < 1.0 - self.config.redirect_similarity_threshold {
            self.gates.record_all(&metrics);
            self.redirect_count += 1;
            let target = features.nearest_subentity_id.clone();
            debug!(novelty = features.novelty, target = ?target, "redirecting");
            return self.terminal(
                EmergenceDecision::Redirect,
                coalition,
                format!(
                    "Too similar to existing cluster (novelty={:.3})",
                    features.novelty
                ),
                gate_results,
                target,
                None,
                HashMap::from([(
                    "novelty_distance".to_string(),
                    json!(features.novelty),
                )]),
            );
        }

        self.gates.record_all(&metrics);
        self.spawn_count += 1;
        info!(
            size,
            density = features.density,
            coherence = features.coherence,
            novelty = features.novelty,
            "spawn approved"
        );
        let spawn_bundle = HashMap::from([
            ("node_ids".to_string(), json!(coalition.node_ids())),
            ("seed_node_ids".to_string(), json!(coalition.seed_node_ids)),
            ("features".to_string(), features.to_json()),
        ]);
        let summary = self.gates.summary(&metrics);
        self.terminal(
            EmergenceDecision::Spawn,
            coalition,
            "All quality gates passed".to_string(),
            gate_results,
            None,
            Some(spawn_bundle),
            HashMap::from([
                ("features".to_string(), features.to_json()),
                ("gate_summary".to_string(), json!(summary)),
            ]),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn terminal(
        &self,
        decision: EmergenceDecision,
        coalition: Coalition,
        reason: String,
        gate_results: HashMap<String, GateResult>,
        redirect_target: Option<String>,
        spawn_bundle: Option<HashMap<String, Value>>,
        metadata: HashMap<String, Value>,
    ) -> ValidationResult {
        ValidationResult {
            decision,
            coalition,
            reason,
            gate_results,
            redirect_target,
            spawn_bundle,
            timestamp: Utc::now(),
            metadata,
        }
    }

    /// Recompute every feature from the graph, ignoring whatever the
    /// coalition object claims about itself.
    fn recompute_features(
        &self,
        coalition: &Coalition,
        graph: &dyn GraphAccessor,
        existing_subentities: &[ExistingSubEntity],
    ) -> CoalitionFeatures {
        let node_ids = coalition.node_ids();
        let density = subgraph_density(&node_ids, graph);
        let coherence = type_coherence(&coalition.nodes);
        let (novelty, nearest_subentity_id) =
            compute_novelty(&node_ids, existing_subentities);

        CoalitionFeatures {
            density,
            coherence,
            size: coalition.nodes.len() as f32,
            novelty,
            nearest_subentity_id,
        }
    }

    /// Telemetry snapshot: decision counts, rates, and gate stats.
    pub fn telemetry(&mut self) -> ValidatorTelemetry {
        let total = self.spawn_count + self.redirect_count + self.reject_count;
        let rate = |count: u64| {
            if total > 0 {
                count as f32 / total as f32
            } else {
                0.0
            }
        };
        ValidatorTelemetry {
            spawn_count: self.spawn_count,
            redirect_count: self.redirect_count,
            reject_count: self.reject_count,
            total_decisions: total,
            spawn_rate: rate(self.spawn_count),
            redirect_rate: rate(self.redirect_count),
            reject_rate: rate(self.reject_count),
            gates: self.gates.all_stats(),
        }
    }
}

/// Novelty = `1 - max Jaccard similarity` against existing cluster member
/// sets. No existing clusters means maximally novel (1.0) with no target.
fn compute_novelty(
    node_ids: &[String],
    existing_subentities: &[ExistingSubEntity],
) -> (f32, Option<String>) {
    if existing_subentities.is_empty() {
        return (1.0, None);
    }

    let coalition_set: std::collections::HashSet<&str> =
        node_ids.iter().map(String::as_str).collect();

    let mut max_similarity = 0.0f32;
    let mut nearest_id = None;

    for subentity in existing_subentities {
        let members: std::collections::HashSet<&str> =
            subentity.member_ids.iter().map(String::as_str).collect();
        if members.is_empty() {
            continue;
        }
        let intersection = coalition_set.intersection(&members).count();
        let union = coalition_set.union(&members).count();
        let similarity = if union > 0 {
            intersection as f32 / union as f32
        } else {
            0.0
        };
        if similarity > max_similarity {
            max_similarity = similarity;
            nearest_id = Some(subentity.id.clone());
        }
    }

    (1.0 - max_similarity, nearest_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coalition::{CandidateSource, NodeCandidate};
    use crate::gap::{GapSignal, GapType};
    use crate::graph::GraphNode;
    use crate::stubs::InMemoryGraph;

    fn coalition_of(ids: &[&str]) -> Coalition {
        let nodes: Vec<NodeCandidate> = ids
            .iter()
            .map(|id| NodeCandidate {
                node_id: id.to_string(),
                score: 1.0,
                source: CandidateSource::Seed,
                properties: GraphNode {
                    node_type: Some("memory".to_string()),
                    ..Default::default()
                },
            })
            .collect();
        Coalition {
            seed_node_ids: ids.iter().map(|s| s.to_string()).collect(),
            nodes,
            density: 0.0,
            coherence: 0.0,
            gap_signal: GapSignal {
                gap_type: GapType::Semantic,
                strength: 1.0,
                stimulus_id: "s1".to_string(),
                retrieved_node_ids: Vec::new(),
                gap_metrics: HashMap::new(),
                context: HashMap::new(),
            },
            formation_timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// Clique over the coalition ids so recomputed density is 1.0.
    fn clique_for(ids: &[&str]) -> InMemoryGraph {
        let mut graph = InMemoryGraph::new();
        for id in ids {
            graph.insert_typed_node(*id, "memory");
        }
        for (i, a) in ids.iter().enumerate() {
            for b in &ids[i + 1..] {
                graph.insert_edge(*a, *b, 0.8);
            }
        }
        graph
    }

    fn validator() -> EmergenceValidator {
        EmergenceValidator::new(EmergenceValidatorConfig::default()).unwrap()
    }

    #[test]
    fn too_small_rejects_before_gates() {
        let mut v = validator();
        let ids = ["a", "b"];
        let result =
            v.validate_emergence(coalition_of(&ids), &clique_for(&ids), &[]);
        assert_eq!(result.decision, EmergenceDecision::Reject);
        assert!(result.reason.contains("too small"));
        // Hard bounds short-circuit: no gate was consulted.
        assert!(result.gate_results.is_empty());
        assert_eq!(v.telemetry().reject_count, 1);
    }

    #[test]
    fn too_large_rejects_before_gates() {
        let mut config = EmergenceValidatorConfig::default();
        config.max_coalition_size = 6;
        let mut v = EmergenceValidator::new(config).unwrap();
        let ids: Vec<String> = (0..8).map(|i| format!("n{i}")).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let result = v.validate_emergence(coalition_of(&id_refs), &clique_for(&id_refs), &[]);
        assert_eq!(result.decision, EmergenceDecision::Reject);
        assert!(result.reason.contains("too large"));
        assert!(result.gate_results.is_empty());
    }

    #[test]
    fn cold_gates_spawn_and_no_existing_clusters_never_redirect() {
        let mut v = validator();
        let ids = ["a", "b", "c", "d", "e"];
        let result = v.validate_emergence(coalition_of(&ids), &clique_for(&ids), &[]);
        // All gates Unknown (cold) -> nothing fails -> novelty 1.0 -> spawn.
        assert_eq!(result.decision, EmergenceDecision::Spawn);
        assert_eq!(result.reason, "All quality gates passed");
        assert!(result.redirect_target.is_none());
        assert!(result.spawn_bundle.is_some());
        assert_eq!(v.telemetry().spawn_count, 1);
    }

    #[test]
    fn validator_ignores_claimed_features() {
        let ids = ["a", "b", "c", "d", "e"];
        let graph = clique_for(&ids);

        let mut honest = validator();
        let honest_result = honest.validate_emergence(coalition_of(&ids), &graph, &[]);

        // Same coalition with deliberately wrong stored features.
        let mut lying = coalition_of(&ids);
        lying.density = 1.0;
        lying.coherence = 1.0;
        let mut v = validator();
        let lying_result = v.validate_emergence(lying, &graph, &[]);

        assert_eq!(honest_result.decision, lying_result.decision);
        assert_eq!(honest_result.reason, lying_result.reason);
    }

    #[test]
    fn high_overlap_redirects_to_nearest_cluster() {
        let mut v = validator();
        let ids = ["a", "b", "c", "d", "e", "f", "g", "h", "i", "j"];
        let existing = vec![
            ExistingSubEntity {
                id: "cluster_far".to_string(),
                member_ids: vec!["x".to_string(), "y".to_string()],
            },
            ExistingSubEntity {
                id: "cluster_near".to_string(),
                // 9 of 10 ids shared -> Jaccard 9/11 ~ 0.82 > 0.75.
                member_ids: ids[..9].iter().map(|s| s.to_string()).collect(),
            },
        ];
        let result = v.validate_emergence(coalition_of(&ids), &clique_for(&ids), &existing);
        assert_eq!(result.decision, EmergenceDecision::Redirect);
        assert_eq!(result.redirect_target.as_deref(), Some("cluster_near"));
        assert!(result.reason.contains("Too similar"));
        assert_eq!(v.telemetry().redirect_count, 1);
    }

    #[test]
    fn disjoint_existing_clusters_do_not_redirect() {
        let mut v = validator();
        let ids = ["a", "b", "c", "d", "e"];
        let existing = vec![ExistingSubEntity {
            id: "other".to_string(),
            member_ids: vec!["x".to_string(), "y".to_string(), "z".to_string()],
        }];
        let result = v.validate_emergence(coalition_of(&ids), &clique_for(&ids), &existing);
        assert_eq!(result.decision, EmergenceDecision::Spawn);
    }

    #[test]
    fn failed_gates_reject_and_still_record() {
        let mut config = EmergenceValidatorConfig::default();
        config.min_samples_for_gates = 5;
        let mut v = EmergenceValidator::new(config).unwrap();
        let ids = ["a", "b", "c", "d", "e"];
        let graph = clique_for(&ids);

        // Warm the gates with five full-density spawns, then present a
        // coalition whose recomputed density is far below Q60.
        for _ in 0..5 {
            v.validate_emergence(coalition_of(&ids), &graph, &[]);
        }
        let sparse_ids = ["p", "q", "r", "s", "t"];
        let mut sparse_graph = InMemoryGraph::new();
        for id in sparse_ids {
            sparse_graph.insert_typed_node(id, "memory");
        }
        let before = v.telemetry().gates["coalition_density"].samples;
        let result = v.validate_emergence(coalition_of(&sparse_ids), &sparse_graph, &[]);
        assert_eq!(result.decision, EmergenceDecision::Reject);
        assert!(result.reason.contains("Failed quality gates"));
        assert!(result.reason.contains("coalition_density"));
        // The rejected attempt's features were recorded for learning.
        let after = v.telemetry().gates["coalition_density"].samples;
        assert_eq!(after, before + 1);
    }

    #[test]
    fn decision_counters_sum_to_total() {
        let mut v = validator();
        let ids = ["a", "b", "c", "d", "e"];
        let graph = clique_for(&ids);
        v.validate_emergence(coalition_of(&ids), &graph, &[]);
        v.validate_emergence(coalition_of(&["a", "b"]), &graph, &[]);
        let t = v.telemetry();
        assert_eq!(t.total_decisions, 2);
        assert_eq!(t.spawn_count + t.redirect_count + t.reject_count, 2);
        assert!((t.spawn_rate - 0.5).abs() < 1e-6);
        assert!((t.reject_rate - 0.5).abs() < 1e-6);
    }

    #[test]
    fn novelty_with_empty_member_lists_is_maximal() {
        let (novelty, nearest) = compute_novelty(
            &["a".to_string()],
            &[ExistingSubEntity {
                id: "hollow".to_string(),
                member_ids: Vec::new(),
            }],
        );
        assert_eq!(novelty, 1.0);
        assert!(nearest.is_none());
    }
}
