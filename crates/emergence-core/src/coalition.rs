//! Coalition assembly around detected gaps.
//!
//! The [`CoalitionAssembler`] grows a candidate node set from a gap signal
//! via seed → expand → prune:
//!
//! 1. **Seed**: the gap's retrieved nodes, score 1.0.
//! 2. **Expand**: breadth-first traversal up to `max_expansion_hops`,
//!    admitting neighbors whose mean edge weight to the current coalition is
//!    positive and whose inbound edge clears `min_edge_weight`.
//! 3. **Prune**: drop members that are both low-scoring and below-average
//!    connected.
//!
//! The finished set is bounded by `[min_coalition_size, max_coalition_size]`
//! and must clear an adaptively-learned density gate. Every graph lookup is
//! fail-soft: a node or edge whose lookup errors is skipped, never fatal.

use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::EmergenceResult;
use crate::gap::GapSignal;
use crate::gate::{ComparisonMode, GateConfig, GateStats, GateStatus, QuantileGate};
use crate::graph::{GraphAccessor, GraphNode};

/// How a candidate entered the coalition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
    /// Came straight from the gap signal's retrieved nodes.
    Seed,
    /// Admitted during expansion at the given hop (1-based).
    Expand { hop: usize },
}

impl fmt::Display for CandidateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CandidateSource::Seed => f.write_str("seed"),
            CandidateSource::Expand { hop } => write!(f, "expand_hop_{hop}"),
        }
    }
}

/// Candidate node inside a coalition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeCandidate {
    pub node_id: String,
    /// Relevance score: 1.0 for seeds, mean edge weight to the coalition for
    /// expanded nodes. Frozen once the coalition is finalized.
    pub score: f32,
    pub source: CandidateSource,
    pub properties: GraphNode,
}

/// A finished node coalition, candidate for becoming a new cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Coalition {
    /// Members, unique by `node_id`, strongest score first.
    pub nodes: Vec<NodeCandidate>,
    pub seed_node_ids: Vec<String>,
    /// Internal connectivity in [0, 1].
    pub density: f32,
    /// Type homogeneity in [0, 1].
    pub coherence: f32,
    /// The gap that triggered formation.
    pub gap_signal: GapSignal,
    pub formation_timestamp: DateTime<Utc>,
    pub metadata: HashMap<String, Value>,
}

impl Coalition {
    /// Member node ids in coalition order.
    pub fn node_ids(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.node_id.clone()).collect()
    }
}

/// Configuration for coalition assembly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoalitionAssemblyConfig {
    /// How far to traverse from the seeds.
    pub max_expansion_hops: usize,
    /// Max neighbors fetched per frontier node.
    pub expansion_branching_factor: usize,
    /// Edges below this weight are not traversed.
    pub min_edge_weight: f32,

    /// Density must exceed this historical quantile.
    pub density_quantile_level: f32,

    pub min_coalition_size: usize,
    pub max_coalition_size: usize,
    /// Expansion stops once this many members are collected.
    pub target_coalition_size: usize,

    pub prune_weak_nodes: bool,
    /// Members scoring below this are pruned unless well-connected.
    pub weak_node_threshold: f32,

    pub min_samples_for_gates: usize,
    pub history_window: usize,
}

impl Default for CoalitionAssemblyConfig {
    fn default() -> Self {
        Self {
            max_expansion_hops: 2,
            expansion_branching_factor: 5,
            min_edge_weight: 0.3,
            density_quantile_level: 0.70,
            min_coalition_size: 3,
            max_coalition_size: 50,
            target_coalition_size: 12,
            prune_weak_nodes: true,
            weak_node_threshold: 0.5,
            min_samples_for_gates: 30,
            history_window: 1000,
        }
    }
}

/// Telemetry snapshot for external monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssemblerTelemetry {
    pub coalitions_formed: u64,
    pub coalitions_rejected: u64,
    pub success_rate: f32,
    pub density_gate: GateStats,
}

/// Assembles coherent node coalitions from gap signals.
#[derive(Debug)]
pub struct CoalitionAssembler {
    config: CoalitionAssemblyConfig,
    density_gate: QuantileGate,
    coalitions_formed: u64,
    coalitions_rejected: u64,
}

impl CoalitionAssembler {
    pub fn new(config: CoalitionAssemblyConfig) -> EmergenceResult<Self> {
        let density_gate = QuantileGate::new(
            GateConfig::new(
                "coalition_density",
                config.density_quantile_level,
                ComparisonMode::Above,
            )
            .with_min_samples(config.min_samples_for_gates)
            .with_window_size(config.history_window),
        )?;
        Ok(Self {
            config,
            density_gate,
            coalitions_formed: 0,
            coalitions_rejected: 0,
        })
    }

    /// Assemble a coalition around a gap signal.
    ///
    /// Returns `None` when no coalition clears the size bounds and the
    /// density gate; every rejection increments the rejection counter.
    pub fn assemble_coalition(
        &mut self,
        gap_signal: &GapSignal,
        graph: &dyn GraphAccessor,
    ) -> Option<Coalition> {
        let seeds = self.initialize_seed(gap_signal, graph);
        if seeds.is_empty() {
            debug!(stimulus_id = %gap_signal.stimulus_id, "no seeds survived, rejecting");
            self.coalitions_rejected += 1;
            return None;
        }
        let seed_node_ids: Vec<String> = seeds.iter().map(|n| n.node_id.clone()).collect();

        let expanded = self.expand_coalition(seeds, graph);
        let expanded_count = expanded.len();

        let mut nodes = if self.config.prune_weak_nodes {
            self.prune_weak_nodes(expanded, graph)
        } else {
            expanded
        };

        if nodes.len() < self.config.min_coalition_size {
            debug!(
                size = nodes.len(),
                min = self.config.min_coalition_size,
                "coalition below minimum size, rejecting"
            );
            self.coalitions_rejected += 1;
            return None;
        }
        sort_by_score(&mut nodes);
        if nodes.len() > self.config.max_coalition_size {
            nodes.truncate(self.config.max_coalition_size);
        }

        let node_ids: Vec<String> = nodes.iter().map(|n| n.node_id.clone()).collect();
        let density = subgraph_density(&node_ids, graph);
        let coherence = type_coherence(&nodes);

        let gate_result = self.density_gate.evaluate(density);
        if gate_result.status == GateStatus::Fail {
            debug!(density, message = %gate_result.message, "density gate failed, rejecting");
            self.coalitions_rejected += 1;
            return None;
        }
        // Accepted densities feed the gate's history.
        self.density_gate.record(density);

        let mut metadata = HashMap::from([
            ("seed_count".to_string(), json!(seed_node_ids.len())),
            ("expanded_count".to_string(), json!(expanded_count)),
            ("final_count".to_string(), json!(nodes.len())),
            (
                "density_gate_result".to_string(),
                json!(gate_result.message),
            ),
        ]);
        if let Some(p) = gate_result.percentile {
            metadata.insert("density_percentile".to_string(), json!(p));
        }

        self.coalitions_formed += 1;
        debug!(
            size = nodes.len(),
            density, coherence, "coalition formed"
        );
        Some(Coalition {
            nodes,
            seed_node_ids,
            density,
            coherence,
            gap_signal: gap_signal.clone(),
            formation_timestamp: Utc::now(),
            metadata,
        })
    }

    /// Load the gap's retrieved nodes as seeds. Nodes that fail to load are
    /// skipped.
    fn initialize_seed(
        &self,
        gap_signal: &GapSignal,
        graph: &dyn GraphAccessor,
    ) -> Vec<NodeCandidate> {
        let mut seeds = Vec::new();
        for node_id in &gap_signal.retrieved_node_ids {
            match graph.get_node(node_id) {
                Ok(properties) => seeds.push(NodeCandidate {
                    node_id: node_id.clone(),
                    score: 1.0,
                    source: CandidateSource::Seed,
                    properties,
                }),
                Err(err) => {
                    debug!(node_id, %err, "seed load failed, skipping");
                }
            }
        }
        seeds
    }

    /// Breadth-first expansion, admitting neighbors by mean edge weight to
    /// the whole current coalition.
    fn expand_coalition(
        &self,
        seeds: Vec<NodeCandidate>,
        graph: &dyn GraphAccessor,
    ) -> Vec<NodeCandidate> {
        let mut coalition: HashMap<String, NodeCandidate> = seeds
            .iter()
            .map(|n| (n.node_id.clone(), n.clone()))
            .collect();
        let mut visited: HashSet<String> = coalition.keys().cloned().collect();
        let mut frontier: Vec<String> = seeds.into_iter().map(|n| n.node_id).collect();

        'hops: for hop in 0..self.config.max_expansion_hops {
            if coalition.len() >= self.config.target_coalition_size {
                break;
            }
            let mut next_frontier = Vec::new();

            for node_id in &frontier {
                let neighbors = match graph
                    .get_neighbors(node_id, self.config.expansion_branching_factor)
                {
                    Ok(neighbors) => neighbors,
                    Err(err) => {
                        debug!(node_id, %err, "neighbor lookup failed, skipping");
                        continue;
                    }
                };

                for (neighbor_id, edge_weight) in neighbors {
                    if visited.contains(&neighbor_id) {
                        continue;
                    }
                    if edge_weight < self.config.min_edge_weight {
                        continue;
                    }

                    let score = self.neighbor_score(&neighbor_id, &coalition, graph);
                    if score <= 0.0 {
                        continue;
                    }

                    let properties = match graph.get_node(&neighbor_id) {
                        Ok(properties) => properties,
                        Err(err) => {
                            debug!(neighbor_id, %err, "neighbor load failed, skipping");
                            continue;
                        }
                    };

                    visited.insert(neighbor_id.clone());
                    next_frontier.push(neighbor_id.clone());
                    coalition.insert(
                        neighbor_id.clone(),
                        NodeCandidate {
                            node_id: neighbor_id,
                            score,
                            source: CandidateSource::Expand { hop: hop + 1 },
                            properties,
                        },
                    );

                    if coalition.len() >= self.config.max_coalition_size {
                        break 'hops;
                    }
                }
            }

            if next_frontier.is_empty() {
                break;
            }
            frontier = next_frontier;
        }

        coalition.into_values().collect()
    }

    /// Mean edge weight from a candidate neighbor to every current member.
    /// Zero (= do not admit) when no edge resolves.
    fn neighbor_score(
        &self,
        neighbor_id: &str,
        coalition: &HashMap<String, NodeCandidate>,
        graph: &dyn GraphAccessor,
    ) -> f32 {
        let mut weights = Vec::new();
        for member_id in coalition.keys() {
            match graph.get_edge(neighbor_id, member_id) {
                Ok(Some(edge)) => weights.push(edge.weight),
                Ok(None) => {}
                Err(err) => {
                    debug!(neighbor_id, member_id, %err, "edge lookup failed, skipping");
                }
            }
        }
        if weights.is_empty() {
            return 0.0;
        }
        weights.iter().sum::<f32>() / weights.len() as f32
    }

    /// Drop members that are both low-scoring and below-average connected.
    ///
    /// Falls back to the top-scoring `min_coalition_size` nodes when pruning
    /// would undershoot the minimum.
    fn prune_weak_nodes(
        &self,
        nodes: Vec<NodeCandidate>,
        graph: &dyn GraphAccessor,
    ) -> Vec<NodeCandidate> {
        if nodes.len() <= self.config.min_coalition_size {
            return nodes;
        }

        let node_ids: Vec<String> = nodes.iter().map(|n| n.node_id.clone()).collect();
        let mut connectivity: HashMap<&str, f32> = HashMap::new();
        let denominator = (nodes.len() - 1) as f32;

        for node in &nodes {
            let mut edges_to_coalition = 0usize;
            for other_id in &node_ids {
                if *other_id == node.node_id {
                    continue;
                }
                match graph.get_edge(&node.node_id, other_id) {
                    Ok(Some(_)) => edges_to_coalition += 1,
                    Ok(None) => {}
                    Err(_) => {}
                }
            }
            connectivity.insert(
                node.node_id.as_str(),
                edges_to_coalition as f32 / denominator,
            );
        }

        let avg_connectivity =
            connectivity.values().sum::<f32>() / connectivity.len() as f32;

        let kept: Vec<NodeCandidate> = nodes
            .iter()
            .filter(|node| {
                let conn = connectivity.get(node.node_id.as_str()).copied().unwrap_or(0.0);
                node.score >= self.config.weak_node_threshold || conn >= avg_connectivity
            })
            .cloned()
            .collect();

        if kept.len() >= self.config.min_coalition_size {
            kept
        } else {
            let mut by_score = nodes;
            sort_by_score(&mut by_score);
            by_score.truncate(self.config.min_coalition_size);
            by_score
        }
    }

    /// Telemetry snapshot: formation counters plus density gate stats.
    pub fn telemetry(&mut self) -> AssemblerTelemetry {
        let total = self.coalitions_formed + self.coalitions_rejected;
        AssemblerTelemetry {
            coalitions_formed: self.coalitions_formed,
            coalitions_rejected: self.coalitions_rejected,
            success_rate: if total > 0 {
                self.coalitions_formed as f32 / total as f32
            } else {
                0.0
            },
            density_gate: self.density_gate.stats(),
        }
    }
}

fn sort_by_score(nodes: &mut [NodeCandidate]) {
    nodes.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.node_id.cmp(&b.node_id))
    });
}

/// Density of the subgraph induced by `node_ids`: resolved edges over all
/// possible pairs. Failed edge lookups count as absent.
pub(crate) fn subgraph_density(node_ids: &[String], graph: &dyn GraphAccessor) -> f32 {
    if node_ids.len() < 2 {
        return 0.0;
    }
    let mut actual_edges = 0usize;
    for (i, a) in node_ids.iter().enumerate() {
        for b in &node_ids[i + 1..] {
            if let Ok(Some(_)) = graph.get_edge(a, b) {
                actual_edges += 1;
            }
        }
    }
    let max_edges = (node_ids.len() * (node_ids.len() - 1)) as f32 / 2.0;
    actual_edges as f32 / max_edges
}

/// Type homogeneity: `1 - distinct_types / node_count`.
///
/// Placeholder heuristic pending embedding-based coherence; kept as-is for
/// behavioral parity with the historical decision stream.
pub(crate) fn type_coherence(nodes: &[NodeCandidate]) -> f32 {
    if nodes.is_empty() {
        return 0.0;
    }
    let distinct_types: HashSet<&str> = nodes
        .iter()
        .filter_map(|n| n.properties.effective_type())
        .collect();
    1.0 - distinct_types.len() as f32 / nodes.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GraphAccessError;
    use crate::gap::GapType;
    use crate::graph::EdgeRecord;
    use crate::stubs::InMemoryGraph;

    fn gap_for(node_ids: &[&str]) -> GapSignal {
        GapSignal {
            gap_type: GapType::Semantic,
            strength: 1.0,
            stimulus_id: "s1".to_string(),
            retrieved_node_ids: node_ids.iter().map(|s| s.to_string()).collect(),
            gap_metrics: HashMap::new(),
            context: HashMap::new(),
        }
    }

    /// Fully connected graph of `n` same-typed nodes with weight 0.8 edges.
    fn clique(n: usize) -> InMemoryGraph {
        let mut graph = InMemoryGraph::new();
        let ids: Vec<String> = (0..n).map(|i| format!("n{i}")).collect();
        for id in &ids {
            graph.insert_typed_node(id.clone(), "memory");
        }
        for (i, a) in ids.iter().enumerate() {
            for b in &ids[i + 1..] {
                graph.insert_edge(a.clone(), b.clone(), 0.8);
            }
        }
        graph
    }

    fn assembler() -> CoalitionAssembler {
        CoalitionAssembler::new(CoalitionAssemblyConfig::default()).unwrap()
    }

    #[test]
    fn zero_seeds_rejects() {
        let mut asm = assembler();
        let graph = InMemoryGraph::new();
        let result = asm.assemble_coalition(&gap_for(&["ghost"]), &graph);
        assert!(result.is_none());
        assert_eq!(asm.telemetry().coalitions_rejected, 1);
    }

    #[test]
    fn isolated_seed_below_min_size_rejects() {
        let mut config = CoalitionAssemblyConfig::default();
        config.min_coalition_size = 5;
        let mut asm = CoalitionAssembler::new(config).unwrap();

        let mut graph = InMemoryGraph::new();
        graph.insert_typed_node("lonely", "memory");

        let result = asm.assemble_coalition(&gap_for(&["lonely"]), &graph);
        assert!(result.is_none());
        assert_eq!(asm.telemetry().coalitions_rejected, 1);
        assert_eq!(asm.telemetry().coalitions_formed, 0);
    }

    #[test]
    fn clique_assembles_with_full_density() {
        let mut asm = assembler();
        let graph = clique(5);
        let coalition = asm
            .assemble_coalition(&gap_for(&["n0", "n1", "n2"]), &graph)
            .expect("coalition");

        assert!(coalition.nodes.len() >= 3);
        assert!(coalition.nodes.len() <= 50);
        assert_eq!(coalition.density, 1.0);
        assert_eq!(coalition.seed_node_ids.len(), 3);
        // All nodes same type -> coherence = 1 - 1/n.
        let n = coalition.nodes.len() as f32;
        assert!((coalition.coherence - (1.0 - 1.0 / n)).abs() < 1e-6);
        assert_eq!(asm.telemetry().coalitions_formed, 1);
    }

    #[test]
    fn expansion_pulls_in_neighbors() {
        let mut asm = assembler();
        let graph = clique(6);
        let coalition = asm
            .assemble_coalition(&gap_for(&["n0", "n1", "n2"]), &graph)
            .expect("coalition");
        // Expansion should have reached beyond the three seeds.
        assert!(coalition.nodes.len() > 3);
        assert!(coalition
            .nodes
            .iter()
            .any(|n| matches!(n.source, CandidateSource::Expand { .. })));
    }

    #[test]
    fn weak_edges_are_not_traversed() {
        let mut asm = assembler();
        let mut graph = clique(3);
        graph.insert_typed_node("far", "memory");
        // Below the 0.3 traversal floor.
        graph.insert_edge("n0", "far", 0.1);

        let coalition = asm
            .assemble_coalition(&gap_for(&["n0", "n1", "n2"]), &graph)
            .expect("coalition");
        assert!(!coalition.node_ids().contains(&"far".to_string()));
    }

    #[test]
    fn oversized_coalition_trimmed_to_max() {
        let mut config = CoalitionAssemblyConfig::default();
        config.max_coalition_size = 4;
        config.target_coalition_size = 4;
        let mut asm = CoalitionAssembler::new(config).unwrap();
        let graph = clique(10);

        let coalition = asm
            .assemble_coalition(&gap_for(&["n0", "n1", "n2", "n3", "n4", "n5"]), &graph)
            .expect("coalition");
        assert!(coalition.nodes.len() <= 4);
    }

    #[test]
    fn size_invariant_holds_for_any_returned_coalition() {
        for seeds in [3usize, 4, 6] {
            let mut asm = assembler();
            let graph = clique(8);
            let ids: Vec<String> = (0..seeds).map(|i| format!("n{i}")).collect();
            let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
            if let Some(coalition) = asm.assemble_coalition(&gap_for(&id_refs), &graph) {
                assert!(coalition.nodes.len() >= 3);
                assert!(coalition.nodes.len() <= 50);
            }
        }
    }

    #[test]
    fn nodes_are_unique_and_sorted_by_score() {
        let mut asm = assembler();
        let graph = clique(6);
        let coalition = asm
            .assemble_coalition(&gap_for(&["n0", "n1", "n2"]), &graph)
            .expect("coalition");

        let mut seen = HashSet::new();
        for node in &coalition.nodes {
            assert!(seen.insert(node.node_id.clone()), "duplicate member");
        }
        for pair in coalition.nodes.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    /// Accessor that fails edge lookups touching one poisoned node.
    struct FlakyGraph {
        inner: InMemoryGraph,
        poisoned: String,
    }

    impl GraphAccessor for FlakyGraph {
        fn get_node(&self, node_id: &str) -> Result<GraphNode, GraphAccessError> {
            self.inner.get_node(node_id)
        }
        fn get_neighbors(
            &self,
            node_id: &str,
            limit: usize,
        ) -> Result<Vec<(String, f32)>, GraphAccessError> {
            self.inner.get_neighbors(node_id, limit)
        }
        fn get_edge(&self, a: &str, b: &str) -> Result<Option<EdgeRecord>, GraphAccessError> {
            if a == self.poisoned || b == self.poisoned {
                return Err(GraphAccessError::Backend("edge store timeout".to_string()));
            }
            self.inner.get_edge(a, b)
        }
    }

    #[test]
    fn edge_lookup_failures_degrade_but_do_not_abort() {
        let mut asm = assembler();
        let graph = FlakyGraph {
            inner: clique(6),
            poisoned: "n5".to_string(),
        };
        // Assembly proceeds despite every n5 edge erroring.
        let coalition = asm.assemble_coalition(&gap_for(&["n0", "n1", "n2"]), &graph);
        assert!(coalition.is_some());
    }

    #[test]
    fn candidate_source_renders_original_tags() {
        assert_eq!(CandidateSource::Seed.to_string(), "seed");
        assert_eq!(
            CandidateSource::Expand { hop: 2 }.to_string(),
            "expand_hop_2"
        );
    }

    #[test]
    fn type_coherence_matches_heuristic() {
        let make = |id: &str, ty: &str| NodeCandidate {
            node_id: id.to_string(),
            score: 1.0,
            source: CandidateSource::Seed,
            properties: GraphNode {
                node_type: Some(ty.to_string()),
                ..Default::default()
            },
        };
        let nodes = vec![
            make("a", "memory"),
            make("b", "memory"),
            make("c", "pattern"),
            make("d", "memory"),
        ];
        // 2 distinct types over 4 nodes -> 1 - 0.5 = 0.5.
        assert!((type_coherence(&nodes) - 0.5).abs() < 1e-6);
        assert_eq!(type_coherence(&[]), 0.0);
    }
}
