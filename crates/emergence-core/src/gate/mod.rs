//! Adaptive quantile-threshold gates.
//!
//! A [`QuantileGate`] converts a raw metric value into a pass/fail decision
//! using a threshold learned from that metric's own recent history. There are
//! no hardcoded cutoffs anywhere in the emergence pipeline: every gate's
//! threshold is the Nth percentile of a sliding window of observed values.
//!
//! A gate is *cold* until `min_samples` values have been recorded; while
//! cold, every evaluation returns [`GateStatus::Unknown`], which callers must
//! treat as "do not block on this signal" — distinct from `Fail`.
//!
//! # Example
//!
//! ```
//! use emergence_core::gate::{ComparisonMode, GateConfig, GateStatus, QuantileGate};
//!
//! // Density must exceed the 70th percentile of historical densities.
//! let mut gate = QuantileGate::new(
//!     GateConfig::new("coalition_density", 0.70, ComparisonMode::Above)
//!         .with_min_samples(10),
//! )
//! .unwrap();
//!
//! for i in 0..10 {
//!     gate.record(i as f32 / 10.0);
//! }
//! let result = gate.evaluate(0.95);
//! assert_eq!(result.status, GateStatus::Pass);
//! ```

mod collection;

pub use collection::{GateCollection, GateSummary};

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EmergenceError, EmergenceResult};

/// Standard percentile set computed by [`QuantileGate::compute_quantiles`].
pub const STANDARD_QUANTILE_LEVELS: [f32; 10] =
    [0.10, 0.20, 0.30, 0.40, 0.50, 0.60, 0.70, 0.80, 0.90, 0.95];

/// Outcome of evaluating a value against a gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    /// Value passes the gate.
    Pass,
    /// Value fails the gate.
    Fail,
    /// Not enough history to judge.
    Unknown,
}

/// How a value is compared against the learned quantile threshold(s).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonMode {
    /// Pass iff `value > threshold` (quality must exceed Q70, say).
    Above,
    /// Pass iff `value < threshold` (error must stay below Q30, say).
    Below,
    /// Pass iff `low <= value <= high`. Requires `quantile_level_high`.
    Between,
    /// Pass iff `value < low || value > high`. Requires `quantile_level_high`.
    Outside,
}

impl fmt::Display for ComparisonMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ComparisonMode::Above => "above",
            ComparisonMode::Below => "below",
            ComparisonMode::Between => "between",
            ComparisonMode::Outside => "outside",
        };
        f.write_str(s)
    }
}

/// One recorded observation in a gate's sliding window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MetricSample {
    pub value: f32,
    pub timestamp: DateTime<Utc>,
}

/// Configuration for a [`QuantileGate`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Metric this gate watches, e.g. `"coalition_density"`.
    pub metric_name: String,
    /// Quantile level in [0, 1] the threshold is read from, e.g. 0.70.
    pub quantile_level: f32,
    /// Upper quantile level for `Between`/`Outside` modes.
    pub quantile_level_high: Option<f32>,
    /// Comparison applied during evaluation.
    pub comparison_mode: ComparisonMode,
    /// Minimum history before the gate activates.
    pub min_samples: usize,
    /// Maximum samples retained (oldest evicted first).
    pub window_size: usize,
}

impl GateConfig {
    /// Create a config with the default history settings
    /// (`min_samples = 30`, `window_size = 1000`).
    pub fn new(
        metric_name: impl Into<String>,
        quantile_level: f32,
        comparison_mode: ComparisonMode,
    ) -> Self {
        Self {
            metric_name: metric_name.into(),
            quantile_level,
            quantile_level_high: None,
            comparison_mode,
            min_samples: 30,
            window_size: 1000,
        }
    }

    /// Builder: set the upper quantile level (for `Between`/`Outside`).
    #[must_use]
    pub fn with_high_level(mut self, level: f32) -> Self {
        self.quantile_level_high = Some(level);
        self
    }

    /// Builder: set minimum history before activation.
    #[must_use]
    pub fn with_min_samples(mut self, min_samples: usize) -> Self {
        self.min_samples = min_samples;
        self
    }

    /// Builder: set sliding window capacity.
    #[must_use]
    pub fn with_window_size(mut self, window_size: usize) -> Self {
        self.window_size = window_size;
        self
    }

    fn validate(&self) -> EmergenceResult<()> {
        if !(0.0..=1.0).contains(&self.quantile_level) {
            return Err(EmergenceError::Config(format!(
                "{}: quantile_level {} outside [0, 1]",
                self.metric_name, self.quantile_level
            )));
        }
        if self.min_samples == 0 || self.window_size == 0 {
            return Err(EmergenceError::Config(format!(
                "{}: min_samples and window_size must be >= 1",
                self.metric_name
            )));
        }
        if matches!(
            self.comparison_mode,
            ComparisonMode::Between | ComparisonMode::Outside
        ) {
            match self.quantile_level_high {
                None => {
                    return Err(EmergenceError::Config(format!(
                        "{}: {} mode requires quantile_level_high",
                        self.metric_name, self.comparison_mode
                    )));
                }
                Some(high) if high <= self.quantile_level || high > 1.0 => {
                    return Err(EmergenceError::Config(format!(
                        "{}: quantile_level_high {} must be in ({}, 1.0]",
                        self.metric_name, high, self.quantile_level
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// Result of a single gate evaluation. Ephemeral; never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateResult {
    pub status: GateStatus,
    /// The value that was tested.
    pub value: f32,
    /// Computed threshold (lower threshold for two-sided modes).
    pub threshold: Option<f32>,
    /// Percentile rank (0-100) of the value in the current history.
    pub percentile: Option<f32>,
    /// Human-readable explanation of the comparison.
    pub message: String,
}

/// Read-only snapshot of a gate's state, for telemetry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateStats {
    /// Whether the gate has enough history to evaluate.
    pub active: bool,
    pub samples: usize,
    pub min_samples: usize,
    pub min: Option<f32>,
    pub max: Option<f32>,
    pub mean: Option<f32>,
    pub median: Option<f32>,
    /// `(level, value)` pairs for the standard quantile set; empty if cold.
    pub quantiles: Vec<(f32, f32)>,
}

/// Adaptive threshold gate based on historical quantiles.
///
/// Maintains a sliding window of metric values and evaluates new values
/// against quantiles of that window. Owned privately by exactly one
/// component; gates are never shared.
#[derive(Debug, Clone)]
pub struct QuantileGate {
    config: GateConfig,
    history: VecDeque<MetricSample>,
    /// Cached `(level, value)` pairs for the standard set, invalidated on
    /// every `record`.
    cached_quantiles: Option<Vec<(f32, f32)>>,
}

impl QuantileGate {
    /// Create a gate, validating the configuration contract.
    ///
    /// # Errors
    ///
    /// `EmergenceError::Config` when `Between`/`Outside` is requested without
    /// a `quantile_level_high` above `quantile_level`, or when levels fall
    /// outside [0, 1].
    pub fn new(config: GateConfig) -> EmergenceResult<Self> {
        config.validate()?;
        let capacity = config.window_size;
        Ok(Self {
            config,
            history: VecDeque::with_capacity(capacity.min(1024)),
            cached_quantiles: None,
        })
    }

    /// Gate configuration (immutable after construction).
    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Record a metric value at the current time.
    pub fn record(&mut self, value: f32) {
        self.record_at(value, Utc::now());
    }

    /// Record a metric value with an explicit timestamp.
    ///
    /// Accepts any float, including NaN; pre-validation is the caller's
    /// responsibility. Evicts the oldest sample once the window is full.
    pub fn record_at(&mut self, value: f32, timestamp: DateTime<Utc>) {
        if self.history.len() >= self.config.window_size {
            self.history.pop_front();
        }
        self.history.push_back(MetricSample { value, timestamp });
        self.cached_quantiles = None;
    }

    /// Number of samples currently held.
    pub fn sample_count(&self) -> usize {
        self.history.len()
    }

    /// Whether the gate has collected enough history to evaluate.
    pub fn is_active(&self) -> bool {
        self.history.len() >= self.config.min_samples
    }

    /// Compute the standard quantile set over the stored history.
    ///
    /// Returns an empty vec while the gate is cold. Results are cached until
    /// the next `record`.
    pub fn compute_quantiles(&mut self) -> Vec<(f32, f32)> {
        if !self.is_active() {
            return Vec::new();
        }
        if let Some(cached) = &self.cached_quantiles {
            return cached.clone();
        }
        let sorted = self.sorted_values();
        let quantiles: Vec<(f32, f32)> = STANDARD_QUANTILE_LEVELS
            .iter()
            .map(|&level| (level, quantile_of_sorted(&sorted, level)))
            .collect();
        self.cached_quantiles = Some(quantiles.clone());
        quantiles
    }

    /// Current threshold at `config.quantile_level`, `None` while cold.
    pub fn get_threshold(&self) -> Option<f32> {
        self.quantile_at(self.config.quantile_level)
    }

    /// Percentile rank (0-100) of `value` within the current history,
    /// `None` while cold.
    pub fn get_percentile(&self, value: f32) -> Option<f32> {
        if !self.is_active() {
            return None;
        }
        let sorted = self.sorted_values();
        let position = sorted.partition_point(|&v| v < value);
        Some(position as f32 / sorted.len() as f32 * 100.0)
    }

    /// Evaluate whether `value` passes the gate.
    ///
    /// Cold gates return `Unknown` with a "not enough history" message;
    /// active gates return `Pass` or `Fail` with the comparison spelled out.
    pub fn evaluate(&mut self, value: f32) -> GateResult {
        if !self.is_active() {
            return GateResult {
                status: GateStatus::Unknown,
                value,
                threshold: None,
                percentile: None,
                message: format!(
                    "Not enough history ({}/{} samples)",
                    self.history.len(),
                    self.config.min_samples
                ),
            };
        }

        // Warm the cache so two-sided modes don't sort twice.
        self.compute_quantiles();

        let threshold = match self.get_threshold() {
            Some(t) => t,
            None => {
                return GateResult {
                    status: GateStatus::Unknown,
                    value,
                    threshold: None,
                    percentile: None,
                    message: "Failed to compute threshold".to_string(),
                };
            }
        };
        let percentile = self.get_percentile(value);
        let name = &self.config.metric_name;
        let q = (self.config.quantile_level * 100.0).round() as i32;

        let (passed, message) = match self.config.comparison_mode {
            ComparisonMode::Above => {
                let passed = value > threshold;
                let cmp = if passed { ">" } else { "<=" };
                (passed, format!("{name}={value:.3} {cmp} Q{q}={threshold:.3}"))
            }
            ComparisonMode::Below => {
                let passed = value < threshold;
                let cmp = if passed { "<" } else { ">=" };
                (passed, format!("{name}={value:.3} {cmp} Q{q}={threshold:.3}"))
            }
            ComparisonMode::Between | ComparisonMode::Outside => {
                let (high_level, threshold_high) = self.high_threshold();
                let q_high = (high_level * 100.0).round() as i32;
                let inside = threshold <= value && value <= threshold_high;
                let passed = match self.config.comparison_mode {
                    ComparisonMode::Between => inside,
                    _ => !inside,
                };
                let word = if inside { "inside" } else { "outside" };
                (
                    passed,
                    format!(
                        "{name}={value:.3} {word} [Q{q}={threshold:.3}, Q{q_high}={threshold_high:.3}]"
                    ),
                )
            }
        };

        GateResult {
            status: if passed {
                GateStatus::Pass
            } else {
                GateStatus::Fail
            },
            value,
            threshold: Some(threshold),
            percentile,
            message,
        }
    }

    /// Telemetry snapshot of the gate's current state.
    pub fn stats(&mut self) -> GateStats {
        if !self.is_active() {
            return GateStats {
                active: false,
                samples: self.history.len(),
                min_samples: self.config.min_samples,
                min: None,
                max: None,
                mean: None,
                median: None,
                quantiles: Vec::new(),
            };
        }
        let sorted = self.sorted_values();
        let sum: f32 = sorted.iter().sum();
        let n = sorted.len();
        GateStats {
            active: true,
            samples: n,
            min_samples: self.config.min_samples,
            min: sorted.first().copied(),
            max: sorted.last().copied(),
            mean: Some(sum / n as f32),
            median: Some(quantile_of_sorted(&sorted, 0.5)),
            quantiles: self.compute_quantiles(),
        }
    }

    /// Quantile of the stored history at an arbitrary level, `None` if cold.
    fn quantile_at(&self, level: f32) -> Option<f32> {
        if !self.is_active() {
            return None;
        }
        let sorted = self.sorted_values();
        Some(quantile_of_sorted(&sorted, level))
    }

    /// Upper `(level, threshold)` for two-sided modes.
    ///
    /// `quantile_level_high` is validated present at construction, so the
    /// fallback arm is unreachable for any gate this crate can build.
    fn high_threshold(&self) -> (f32, f32) {
        let high_level = match self.config.quantile_level_high {
            Some(h) => h,
            None => unreachable!("two-sided gate validated at construction"),
        };
        let threshold = self
            .quantile_at(high_level)
            .unwrap_or(f32::INFINITY);
        (high_level, threshold)
    }

    fn sorted_values(&self) -> Vec<f32> {
        let mut values: Vec<f32> = self.history.iter().map(|s| s.value).collect();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        values
    }
}

/// Linear-interpolation quantile over a sorted slice (numpy's default).
fn quantile_of_sorted(sorted: &[f32], level: f32) -> f32 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let clamped = level.clamp(0.0, 1.0);
    let pos = clamped * (sorted.len() - 1) as f32;
    let lo = pos.floor() as usize;
    let hi = (lo + 1).min(sorted.len() - 1);
    let frac = pos - lo as f32;
    sorted[lo] + frac * (sorted[hi] - sorted[lo])
}
