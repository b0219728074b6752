//! Continuous membership refinement from frame-level co-activation.
//!
//! Spawning a cluster fixes its member set at one instant. The
//! [`MembershipWeightLearner`] watches subsequent activation frames and
//! proposes corrections: admit outside nodes that keep firing with the
//! cluster, prune members that stopped participating. Proposals carry
//! evidence and confidence; applying them is the host's job.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::EmergenceResult;
use crate::gate::{ComparisonMode, GateConfig, GateStats, GateStatus, QuantileGate};

/// Direction of a proposed membership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentAction {
    /// Remove a current member whose co-activation collapsed.
    Prune,
    /// Add an outside node that consistently co-activates.
    Admit,
}

/// One frame's worth of evidence for a (cluster, node) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipObservation {
    pub subentity_id: String,
    pub node_id: String,
    /// `min(energies)` when both sides are active in the frame, else 0.
    pub co_activation: f32,
    /// `1 - |energy delta|`, a crude phase-agreement measure in [-1, 1].
    pub energy_correlation: f32,
    pub frame: u64,
    pub timestamp: DateTime<Utc>,
}

/// A proposed membership change with its supporting evidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipAdjustment {
    pub subentity_id: String,
    pub node_id: String,
    pub action: AdjustmentAction,
    /// Why this change is proposed, naming the gate that passed.
    pub reason: String,
    pub current_weight: f32,
    pub proposed_weight: f32,
    /// Gate percentile mapped to [0, 1]; 0.5 when the gate cannot rank yet.
    pub confidence: f32,
    pub observation_count: usize,
    pub mean_co_activation: f32,
    pub frame: u64,
    pub timestamp: DateTime<Utc>,
}

/// Activation state of one cluster within a frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubEntityState {
    pub energy: f32,
    pub member_nodes: Vec<String>,
}

/// Activation state of one node within a frame.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NodeState {
    pub energy: f32,
}

/// Everything the learner needs to see about one frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrameState {
    pub subentities: HashMap<String, SubEntityState>,
    pub nodes: HashMap<String, NodeState>,
}

/// Configuration for membership weight learning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipLearnerConfig {
    /// Observations kept per (cluster, node) pair.
    pub observation_window_frames: usize,
    /// Observations required before a pair can generate a proposal.
    pub min_observations: usize,
    /// Frames to wait between proposals for the same pair.
    pub adjustment_cooldown_frames: u64,
    /// A cluster below this energy is dormant and yields no evidence.
    pub activation_energy_threshold: f32,

    pub admit_quantile_level: f32,
    pub prune_quantile_level: f32,
    pub min_samples_for_gates: usize,
    pub history_window: usize,
}

impl Default for MembershipLearnerConfig {
    fn default() -> Self {
        Self {
            observation_window_frames: 1000,
            min_observations: 30,
            adjustment_cooldown_frames: 100,
            activation_energy_threshold: 0.5,
            admit_quantile_level: 0.70,
            prune_quantile_level: 0.30,
            min_samples_for_gates: 50,
            history_window: 2000,
        }
    }
}

/// Aggregate view of one pair's observation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoactivationStats {
    pub subentity_id: String,
    pub node_id: String,
    pub observation_count: usize,
    pub mean_co_activation: f32,
    pub std_co_activation: f32,
    pub mean_energy_correlation: f32,
    /// Most recent co-activation values, newest last.
    pub recent_co_activations: Vec<f32>,
    pub is_member: bool,
}

/// Telemetry snapshot for external monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipTelemetry {
    pub current_frame: u64,
    pub observations_recorded: u64,
    pub admit_proposals: u64,
    pub prune_proposals: u64,
    pub tracked_subentities: usize,
    pub tracked_pairs: usize,
    pub admit_gate: GateStats,
    pub prune_gate: GateStats,
}

/// Frame-driven learner that turns co-activation history into membership
/// adjustment proposals.
#[derive(Debug)]
pub struct MembershipWeightLearner {
    config: MembershipLearnerConfig,
    admit_gate: QuantileGate,
    prune_gate: QuantileGate,
    /// Per (cluster, node) observation history, bounded by the window.
    histories: HashMap<(String, String), VecDeque<MembershipObservation>>,
    /// Frame of the last proposal per pair, for cooldown enforcement.
    last_adjustment_frame: HashMap<(String, String), u64>,
    /// Current member sets as of the latest observed frame.
    member_sets: HashMap<String, Vec<String>>,
    current_frame: u64,
    observations_recorded: u64,
    admit_proposals: u64,
    prune_proposals: u64,
}

impl MembershipWeightLearner {
    pub fn new(config: MembershipLearnerConfig) -> EmergenceResult<Self> {
        let admit_gate = QuantileGate::new(
            GateConfig::new(
                "coactivation_strength",
                config.admit_quantile_level,
                ComparisonMode::Above,
            )
            .with_min_samples(config.min_samples_for_gates)
            .with_window_size(config.history_window),
        )?;
        let prune_gate = QuantileGate::new(
            GateConfig::new(
                "coactivation_strength",
                config.prune_quantile_level,
                ComparisonMode::Below,
            )
            .with_min_samples(config.min_samples_for_gates)
            .with_window_size(config.history_window),
        )?;
        Ok(Self {
            config,
            admit_gate,
            prune_gate,
            histories: HashMap::new(),
            last_adjustment_frame: HashMap::new(),
            member_sets: HashMap::new(),
            current_frame: 0,
            observations_recorded: 0,
            admit_proposals: 0,
            prune_proposals: 0,
        })
    }

    /// Ingest one activation frame and return any adjustment proposals it
    /// triggers.
    ///
    /// Dormant clusters (energy at or below the activation threshold)
    /// contribute no evidence; their histories simply age.
    pub fn observe_frame(&mut self, frame: &FrameState) -> Vec<MembershipAdjustment> {
        self.current_frame += 1;

        for (subentity_id, state) in &frame.subentities {
            self.member_sets
                .insert(subentity_id.clone(), state.member_nodes.clone());

            if state.energy <= self.config.activation_energy_threshold {
                continue;
            }

            for (node_id, node_state) in &frame.nodes {
                let node_active =
                    node_state.energy > self.config.activation_energy_threshold;
                let co_activation = if node_active {
                    state.energy.min(node_state.energy)
                } else {
                    0.0
                };
                let energy_correlation = 1.0 - (state.energy - node_state.energy).abs();

                let observation = MembershipObservation {
                    subentity_id: subentity_id.clone(),
                    node_id: node_id.clone(),
                    co_activation,
                    energy_correlation,
                    frame: self.current_frame,
                    timestamp: Utc::now(),
                };
                let key = (subentity_id.clone(), node_id.clone());
                let history = self.histories.entry(key).or_default();
                history.push_back(observation);
                while history.len() > self.config.observation_window_frames {
                    history.pop_front();
                }
                self.observations_recorded += 1;
            }
        }

        self.propose_adjustments()
    }

    /// Scan pair histories for proposal-ready evidence.
    fn propose_adjustments(&mut self) -> Vec<MembershipAdjustment> {
        let mut adjustments = Vec::new();

        let keys: Vec<(String, String)> = self.histories.keys().cloned().collect();
        for key in keys {
            let history = &self.histories[&key];
            if history.len() < self.config.min_observations {
                continue;
            }
            if let Some(&last) = self.last_adjustment_frame.get(&key) {
                if self.current_frame - last < self.config.adjustment_cooldown_frames {
                    continue;
                }
            }

            let mean: f32 =
                history.iter().map(|o| o.co_activation).sum::<f32>() / history.len() as f32;
            let count = history.len();
            let (subentity_id, node_id) = key.clone();
            let is_member = self.is_member(&subentity_id, &node_id);

            // Both gates learn from every proposal-ready pair, member or
            // not, and the pair's own mean belongs to the distribution it
            // is judged against.
            self.admit_gate.record(mean);
            self.prune_gate.record(mean);
            let admit_result = self.admit_gate.evaluate(mean);
            let prune_result = self.prune_gate.evaluate(mean);

            let proposal = if is_member && prune_result.status == GateStatus::Pass {
                self.prune_proposals += 1;
                let q = (self.config.prune_quantile_level * 100.0).round() as i32;
                let reason = format!("Weak co-activation: {mean:.3} (Q{q} gate passed)");
                Some((AdjustmentAction::Prune, reason, 1.0, &self.prune_gate))
            } else if !is_member && admit_result.status == GateStatus::Pass {
                self.admit_proposals += 1;
                let q = (self.config.admit_quantile_level * 100.0).round() as i32;
                let reason = format!("Strong co-activation: {mean:.3} (Q{q} gate passed)");
                Some((AdjustmentAction::Admit, reason, 0.0, &self.admit_gate))
            } else {
                None
            };

            if let Some((action, reason, current_weight, gate)) = proposal {
                let confidence = gate
                    .get_percentile(mean)
                    .map(|p| p / 100.0)
                    .unwrap_or(0.5);
                debug!(
                    subentity = %subentity_id,
                    node = %node_id,
                    ?action,
                    mean_co_activation = mean,
                    "membership adjustment proposed"
                );
                adjustments.push(MembershipAdjustment {
                    subentity_id,
                    node_id,
                    action,
                    reason,
                    current_weight,
                    proposed_weight: mean,
                    confidence,
                    observation_count: count,
                    mean_co_activation: mean,
                    frame: self.current_frame,
                    timestamp: Utc::now(),
                });
                self.last_adjustment_frame.insert(key, self.current_frame);
            }
        }

        adjustments
    }

    fn is_member(&self, subentity_id: &str, node_id: &str) -> bool {
        self.member_sets
            .get(subentity_id)
            .map(|members| members.iter().any(|m| m == node_id))
            .unwrap_or(false)
    }

    /// Observation history summary for one (cluster, node) pair, if any.
    pub fn coactivation_stats(
        &self,
        subentity_id: &str,
        node_id: &str,
    ) -> Option<CoactivationStats> {
        let key = (subentity_id.to_string(), node_id.to_string());
        let history = self.histories.get(&key)?;
        if history.is_empty() {
            return None;
        }
        let n = history.len() as f32;
        let mean = history.iter().map(|o| o.co_activation).sum::<f32>() / n;
        let variance = history
            .iter()
            .map(|o| (o.co_activation - mean).powi(2))
            .sum::<f32>()
            / n;
        let recent: Vec<f32> = history
            .iter()
            .rev()
            .take(10)
            .map(|o| o.co_activation)
            .rev()
            .collect();
        Some(CoactivationStats {
            subentity_id: subentity_id.to_string(),
            node_id: node_id.to_string(),
            observation_count: history.len(),
            mean_co_activation: mean,
            std_co_activation: variance.sqrt(),
            mean_energy_correlation: history.iter().map(|o| o.energy_correlation).sum::<f32>()
                / n,
            recent_co_activations: recent,
            is_member: self.is_member(subentity_id, node_id),
        })
    }

    pub fn current_frame(&self) -> u64 {
        self.current_frame
    }

    /// Telemetry snapshot: counters plus both gate views.
    pub fn telemetry(&mut self) -> MembershipTelemetry {
        MembershipTelemetry {
            current_frame: self.current_frame,
            observations_recorded: self.observations_recorded,
            admit_proposals: self.admit_proposals,
            prune_proposals: self.prune_proposals,
            tracked_subentities: self.member_sets.len(),
            tracked_pairs: self.histories.len(),
            admit_gate: self.admit_gate.stats(),
            prune_gate: self.prune_gate.stats(),
        }
    }
}
