//! Gap detection over stimulus retrieval results.
//!
//! A [`GapDetector`] decides, per injected stimulus, whether the graph's
//! retrieval response was inadequate along three independent axes:
//!
//! 1. **Semantic**: retrieved embeddings do not cover the stimulus embedding.
//! 2. **Quality**: retrieved nodes mix abstraction levels (too
//!    general/concrete for the stimulus).
//! 3. **Structural**: retrieved nodes are disconnected or sparse.
//!
//! Each axis owns a private [`QuantileGate`] and fires either on an absolute
//! bound or when the adaptive gate fails. The computed metric is recorded
//! into the gate on every call, whether or not a gap fired — healthy
//! retrievals are exactly what warms the gates up.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::EmergenceResult;
use crate::gate::{ComparisonMode, GateConfig, GateResult, GateStats, GateStatus, QuantileGate};

/// Axis along which retrieval fell short.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapType {
    Semantic,
    Quality,
    Structural,
}

/// A node returned by retrieval, as seen by the detector.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievedNode {
    pub id: String,
    pub embedding: Option<Vec<f32>>,
    pub node_type: Option<String>,
    pub labels: Vec<String>,
}

impl RetrievedNode {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    #[must_use]
    pub fn with_type(mut self, node_type: impl Into<String>) -> Self {
        self.node_type = Some(node_type.into());
        self
    }

    #[must_use]
    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.labels = labels;
        self
    }

    fn effective_type(&self) -> Option<&str> {
        self.node_type
            .as_deref()
            .or_else(|| self.labels.first().map(String::as_str))
    }
}

/// Graph structure context for the structural axis.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphContext {
    /// Edges observed between the retrieved nodes, as id pairs.
    pub edges_between_retrieved: Vec<(String, String)>,
}

/// Evidence that a stimulus was inadequately served by retrieval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GapSignal {
    pub gap_type: GapType,
    /// Signal strength in [0, 1].
    pub strength: f32,
    pub stimulus_id: String,
    pub retrieved_node_ids: Vec<String>,
    /// Metrics that triggered (or cleared) the gap.
    pub gap_metrics: HashMap<String, f32>,
    /// Loose diagnostic context (gate messages, samples).
    pub context: HashMap<String, Value>,
}

/// Configuration for gap detection.
///
/// The absolute bounds are floors/ceilings that fire regardless of gate
/// state; the quantile levels parameterize the per-axis adaptive gates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GapDetectionConfig {
    /// Minimum acceptable cosine similarity to the stimulus.
    pub min_embedding_coverage: f32,
    /// Coverage below this historical quantile fires a semantic gap.
    pub coverage_quantile_level: f32,

    /// Maximum acceptable abstraction-level spread.
    pub max_abstraction_mismatch: f32,
    /// Mismatch above this historical quantile fires a quality gap.
    pub abstraction_quantile_level: f32,

    /// Minimum acceptable inter-node connectivity.
    pub min_connectivity: f32,
    /// Connectivity below this historical quantile fires a structural gap.
    pub connectivity_quantile_level: f32,

    pub min_samples_for_gates: usize,
    pub history_window: usize,

    /// Ordinal abstraction level per node type (1 = most abstract).
    pub abstraction_levels: HashMap<String, f32>,
    /// Level assigned to unmapped node types.
    pub default_abstraction_level: f32,
}

impl Default for GapDetectionConfig {
    fn default() -> Self {
        let abstraction_levels = [
            ("principle", 1.0),
            ("guideline", 1.0),
            ("mechanism", 2.0),
            ("pattern", 2.0),
            ("behavior", 3.0),
            ("decision", 3.0),
            ("process", 3.0),
            ("agent", 3.0),
            ("memory", 4.0),
            ("observation", 4.0),
            ("task", 4.0),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self {
            min_embedding_coverage: 0.6,
            coverage_quantile_level: 0.30,
            max_abstraction_mismatch: 2.0,
            abstraction_quantile_level: 0.70,
            min_connectivity: 0.3,
            connectivity_quantile_level: 0.30,
            min_samples_for_gates: 30,
            history_window: 1000,
            abstraction_levels,
            default_abstraction_level: 3.0,
        }
    }
}

/// Telemetry snapshot for external monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GapDetectorTelemetry {
    pub semantic_gaps: u64,
    pub quality_gaps: u64,
    pub structural_gaps: u64,
    pub total_gaps: u64,
    pub coverage_gate: GateStats,
    pub abstraction_gate: GateStats,
    pub connectivity_gate: GateStats,
}

/// Detects gaps in retrieval that signal emergence opportunities.
#[derive(Debug)]
pub struct GapDetector {
    config: GapDetectionConfig,
    coverage_gate: QuantileGate,
    abstraction_gate: QuantileGate,
    connectivity_gate: QuantileGate,
    semantic_gaps: u64,
    quality_gaps: u64,
    structural_gaps: u64,
}

impl GapDetector {
    /// Create a detector with its three private adaptive gates.
    pub fn new(config: GapDetectionConfig) -> EmergenceResult<Self> {
        let coverage_gate = QuantileGate::new(
            GateConfig::new(
                "embedding_coverage",
                config.coverage_quantile_level,
                ComparisonMode::Below,
            )
            .with_min_samples(config.min_samples_for_gates)
            .with_window_size(config.history_window),
        )?;
        let abstraction_gate = QuantileGate::new(
            GateConfig::new(
                "abstraction_mismatch",
                config.abstraction_quantile_level,
                ComparisonMode::Above,
            )
            .with_min_samples(config.min_samples_for_gates)
            .with_window_size(config.history_window),
        )?;
        let connectivity_gate = QuantileGate::new(
            GateConfig::new(
                "node_connectivity",
                config.connectivity_quantile_level,
                ComparisonMode::Below,
            )
            .with_min_samples(config.min_samples_for_gates)
            .with_window_size(config.history_window),
        )?;

        Ok(Self {
            config,
            coverage_gate,
            abstraction_gate,
            connectivity_gate,
            semantic_gaps: 0,
            quality_gaps: 0,
            structural_gaps: 0,
        })
    }

    /// Detect gaps in a retrieval result.
    ///
    /// Returns zero to three independent signals, in axis order. An empty
    /// retrieval short-circuits to a single maximal semantic gap.
    pub fn detect_gaps(
        &mut self,
        stimulus_id: &str,
        stimulus_embedding: &[f32],
        retrieved_nodes: &[RetrievedNode],
        graph_context: Option<&GraphContext>,
    ) -> Vec<GapSignal> {
        if retrieved_nodes.is_empty() {
            self.semantic_gaps += 1;
            debug!(stimulus_id, "empty retrieval, maximal semantic gap");
            return vec![GapSignal {
                gap_type: GapType::Semantic,
                strength: 1.0,
                stimulus_id: stimulus_id.to_string(),
                retrieved_node_ids: Vec::new(),
                gap_metrics: HashMap::from([("embedding_coverage".to_string(), 0.0)]),
                context: HashMap::from([(
                    "reason".to_string(),
                    json!("no_nodes_retrieved"),
                )]),
            }];
        }

        let mut gaps = Vec::new();

        if let Some(gap) = self.detect_semantic_gap(stimulus_id, stimulus_embedding, retrieved_nodes)
        {
            self.semantic_gaps += 1;
            debug!(stimulus_id, strength = gap.strength, "semantic gap");
            gaps.push(gap);
        }
        if let Some(gap) = self.detect_quality_gap(stimulus_id, retrieved_nodes) {
            self.quality_gaps += 1;
            debug!(stimulus_id, strength = gap.strength, "quality gap");
            gaps.push(gap);
        }
        if let Some(context) = graph_context {
            if let Some(gap) = self.detect_structural_gap(stimulus_id, retrieved_nodes, context) {
                self.structural_gaps += 1;
                debug!(stimulus_id, strength = gap.strength, "structural gap");
                gaps.push(gap);
            }
        }

        gaps
    }

    /// Semantic axis: max cosine similarity between stimulus and retrieved
    /// embeddings. Low maximum = nothing retrieved covers the stimulus.
    fn detect_semantic_gap(
        &mut self,
        stimulus_id: &str,
        stimulus_embedding: &[f32],
        retrieved_nodes: &[RetrievedNode],
    ) -> Option<GapSignal> {
        let node_ids: Vec<String> = retrieved_nodes.iter().map(|n| n.id.clone()).collect();

        let similarities: Vec<f32> = retrieved_nodes
            .iter()
            .filter_map(|n| n.embedding.as_deref())
            .map(|emb| cosine_similarity(stimulus_embedding, emb))
            .collect();

        if similarities.is_empty() {
            // No embeddings available at all: maximal gap, coverage 0.
            self.coverage_gate.record(0.0);
            return Some(GapSignal {
                gap_type: GapType::Semantic,
                strength: 1.0,
                stimulus_id: stimulus_id.to_string(),
                retrieved_node_ids: node_ids,
                gap_metrics: HashMap::from([("embedding_coverage".to_string(), 0.0)]),
                context: HashMap::from([("reason".to_string(), json!("no_embeddings"))]),
            });
        }

        let max_coverage = similarities.iter().copied().fold(f32::MIN, f32::max);
        let mean_coverage = similarities.iter().sum::<f32>() / similarities.len() as f32;

        // Evaluate against the pre-existing history, then record the sample.
        let gate_result = self.coverage_gate.evaluate(max_coverage);
        self.coverage_gate.record(max_coverage);

        let strength = if max_coverage < self.config.min_embedding_coverage {
            1.0 - max_coverage / self.config.min_embedding_coverage
        } else if gate_result.status == GateStatus::Fail {
            // Lower percentile = stronger gap.
            gate_result
                .percentile
                .map_or(0.5, |p| 1.0 - p / 100.0)
        } else {
            return None;
        };

        let mut gap_metrics = HashMap::from([
            ("embedding_coverage".to_string(), max_coverage),
            ("mean_coverage".to_string(), mean_coverage),
        ]);
        if let Some(p) = gate_result.percentile {
            gap_metrics.insert("gate_percentile".to_string(), p);
        }

        Some(GapSignal {
            gap_type: GapType::Semantic,
            strength: strength.min(1.0),
            stimulus_id: stimulus_id.to_string(),
            retrieved_node_ids: node_ids,
            gap_metrics,
            context: gate_context(&gate_result, "similarities", &similarities),
        })
    }

    /// Quality axis: standard deviation of abstraction levels across the
    /// retrieved nodes. A wide spread means the retrieval mixed principles
    /// with raw observations.
    fn detect_quality_gap(
        &mut self,
        stimulus_id: &str,
        retrieved_nodes: &[RetrievedNode],
    ) -> Option<GapSignal> {
        let node_levels: Vec<f32> = retrieved_nodes
            .iter()
            .map(|n| {
                n.effective_type()
                    .and_then(|t| self.config.abstraction_levels.get(t).copied())
                    .unwrap_or(self.config.default_abstraction_level)
            })
            .collect();

        let mean_level = node_levels.iter().sum::<f32>() / node_levels.len() as f32;
        let variance = node_levels
            .iter()
            .map(|l| (l - mean_level).powi(2))
            .sum::<f32>()
            / node_levels.len() as f32;
        let abstraction_mismatch = variance.sqrt();

        let gate_result = self.abstraction_gate.evaluate(abstraction_mismatch);
        self.abstraction_gate.record(abstraction_mismatch);

        let strength = if abstraction_mismatch > self.config.max_abstraction_mismatch {
            (abstraction_mismatch / self.config.max_abstraction_mismatch).min(1.0)
        } else if gate_result.status == GateStatus::Fail {
            // Higher percentile = stronger gap.
            gate_result.percentile.map_or(0.5, |p| p / 100.0)
        } else {
            return None;
        };

        let mut gap_metrics = HashMap::from([
            ("abstraction_mismatch".to_string(), abstraction_mismatch),
            ("mean_node_level".to_string(), mean_level),
            ("std_node_level".to_string(), abstraction_mismatch),
        ]);
        if let Some(p) = gate_result.percentile {
            gap_metrics.insert("gate_percentile".to_string(), p);
        }

        Some(GapSignal {
            gap_type: GapType::Quality,
            strength: strength.min(1.0),
            stimulus_id: stimulus_id.to_string(),
            retrieved_node_ids: retrieved_nodes.iter().map(|n| n.id.clone()).collect(),
            gap_metrics,
            context: gate_context(&gate_result, "node_levels", &node_levels),
        })
    }

    /// Structural axis: density of the subgraph induced by the retrieved
    /// nodes. Needs at least two nodes and edge context to be computable.
    fn detect_structural_gap(
        &mut self,
        stimulus_id: &str,
        retrieved_nodes: &[RetrievedNode],
        graph_context: &GraphContext,
    ) -> Option<GapSignal> {
        if retrieved_nodes.len() < 2 {
            return None;
        }

        let n = retrieved_nodes.len();
        let actual_edges = graph_context.edges_between_retrieved.len();
        let max_edges = (n * (n - 1)) as f32 / 2.0;
        let connectivity = if max_edges > 0.0 {
            actual_edges as f32 / max_edges
        } else {
            0.0
        };

        let gate_result = self.connectivity_gate.evaluate(connectivity);
        self.connectivity_gate.record(connectivity);

        let strength = if connectivity < self.config.min_connectivity {
            1.0 - connectivity / self.config.min_connectivity
        } else if gate_result.status == GateStatus::Fail {
            gate_result
                .percentile
                .map_or(0.5, |p| 1.0 - p / 100.0)
        } else {
            return None;
        };

        let mut gap_metrics = HashMap::from([
            ("node_connectivity".to_string(), connectivity),
            ("actual_edges".to_string(), actual_edges as f32),
            ("max_edges".to_string(), max_edges),
            ("node_count".to_string(), n as f32),
        ]);
        if let Some(p) = gate_result.percentile {
            gap_metrics.insert("gate_percentile".to_string(), p);
        }

        Some(GapSignal {
            gap_type: GapType::Structural,
            strength: strength.min(1.0),
            stimulus_id: stimulus_id.to_string(),
            retrieved_node_ids: retrieved_nodes.iter().map(|n| n.id.clone()).collect(),
            gap_metrics,
            context: HashMap::from([
                ("gate_message".to_string(), json!(gate_result.message)),
                ("gate_status".to_string(), json!(gate_result.status)),
            ]),
        })
    }

    /// Telemetry snapshot: per-type counts plus underlying gate stats.
    pub fn telemetry(&mut self) -> GapDetectorTelemetry {
        GapDetectorTelemetry {
            semantic_gaps: self.semantic_gaps,
            quality_gaps: self.quality_gaps,
            structural_gaps: self.structural_gaps,
            total_gaps: self.semantic_gaps + self.quality_gaps + self.structural_gaps,
            coverage_gate: self.coverage_gate.stats(),
            abstraction_gate: self.abstraction_gate.stats(),
            connectivity_gate: self.connectivity_gate.stats(),
        }
    }
}

/// Shared context builder: gate message/status plus a small sample of the
/// per-node values for diagnostics.
fn gate_context(
    gate_result: &GateResult,
    sample_key: &str,
    values: &[f32],
) -> HashMap<String, Value> {
    let sample: Vec<f32> = values.iter().copied().take(5).collect();
    HashMap::from([
        ("gate_message".to_string(), json!(gate_result.message)),
        ("gate_status".to_string(), json!(gate_result.status)),
        (sample_key.to_string(), json!(sample)),
    ])
}

/// Cosine similarity with zero-norm and length-mismatch guards.
fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}
