//! Named collections of quantile gates with batch operations.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::EmergenceResult;
use crate::gate::{GateConfig, GateResult, GateStats, GateStatus, QuantileGate};

/// A named set of [`QuantileGate`]s applied to a named set of metrics.
///
/// Metrics with no matching gate are ignored by every batch operation, so a
/// caller can pass a superset of features without pre-filtering.
#[derive(Debug, Default)]
pub struct GateCollection {
    gates: HashMap<String, QuantileGate>,
}

/// Aggregate view of one batch evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateSummary {
    pub total_gates: usize,
    pub passed: usize,
    pub failed: usize,
    pub unknown: usize,
    pub all_pass: bool,
    /// Per-gate human-readable messages.
    pub results: HashMap<String, String>,
}

impl GateCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an existing gate, keyed by its metric name.
    pub fn add_gate(&mut self, gate: QuantileGate) {
        self.gates.insert(gate.config().metric_name.clone(), gate);
    }

    /// Create a gate from `config` and add it.
    pub fn create_gate(&mut self, config: GateConfig) -> EmergenceResult<()> {
        self.add_gate(QuantileGate::new(config)?);
        Ok(())
    }

    pub fn get(&self, metric_name: &str) -> Option<&QuantileGate> {
        self.gates.get(metric_name)
    }

    pub fn len(&self) -> usize {
        self.gates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }

    /// Record each metric into its matching gate.
    pub fn record_all(&mut self, metrics: &HashMap<String, f32>) {
        for (name, value) in metrics {
            if let Some(gate) = self.gates.get_mut(name) {
                gate.record(*value);
            }
        }
    }

    /// Evaluate each metric against its matching gate.
    pub fn evaluate_all(&mut self, metrics: &HashMap<String, f32>) -> HashMap<String, GateResult> {
        let mut results = HashMap::new();
        for (name, value) in metrics {
            if let Some(gate) = self.gates.get_mut(name) {
                results.insert(name.clone(), gate.evaluate(*value));
            }
        }
        results
    }

    /// True iff no gate reports `Fail`. `Unknown` does not block.
    pub fn all_pass(&mut self, metrics: &HashMap<String, f32>) -> bool {
        self.evaluate_all(metrics)
            .values()
            .all(|r| r.status != GateStatus::Fail)
    }

    /// Names of gates that reported `Fail`, sorted for stable output.
    pub fn get_failed_gates(&mut self, metrics: &HashMap<String, f32>) -> Vec<String> {
        let mut failed: Vec<String> = self
            .evaluate_all(metrics)
            .into_iter()
            .filter(|(_, r)| r.status == GateStatus::Fail)
            .map(|(name, _)| name)
            .collect();
        failed.sort();
        failed
    }

    /// Aggregate summary of one batch evaluation.
    pub fn summary(&mut self, metrics: &HashMap<String, f32>) -> GateSummary {
        let results = self.evaluate_all(metrics);
        let passed = results
            .values()
            .filter(|r| r.status == GateStatus::Pass)
            .count();
        let failed = results
            .values()
            .filter(|r| r.status == GateStatus::Fail)
            .count();
        let unknown = results
            .values()
            .filter(|r| r.status == GateStatus::Unknown)
            .count();
        GateSummary {
            total_gates: results.len(),
            passed,
            failed,
            unknown,
            all_pass: failed == 0,
            results: results
                .into_iter()
                .map(|(name, r)| (name, r.message))
                .collect(),
        }
    }

    /// Telemetry snapshots for every gate in the collection.
    pub fn all_stats(&mut self) -> HashMap<String, GateStats> {
        self.gates
            .iter_mut()
            .map(|(name, gate)| (name.clone(), gate.stats()))
            .collect()
    }
}
