//! Counter detection and first-difference conversion.
//!
//! Monotonically increasing counters (bytes sent, requests served) would
//! look like a permanent anomaly to the ensemble. We classify each metric
//! once, either by configuration pin or by a strictly-increasing heuristic,
//! and convert counters to their per-sample rate of change before analysis.

use crate::config::AnalyzerConfig;
use crate::ingest::worker::matches_any;
use crate::types::{DerivativeState, Sample};
use dashmap::DashMap;
use tracing::debug;

/// Strictly positive steps the heuristic demands before calling a metric a
/// counter. A gauge that sits flat and jumps once never has this many.
const MIN_POSITIVE_STEPS: usize = 10;

/// Heuristic for counter-ness: enough samples, all non-negative, never a
/// decrease anywhere in the window, and enough distinct step-ups that the
/// series reads as an incrementing count rather than a level shift.
pub fn is_strictly_increasing(series: &[Sample], min_samples: usize) -> bool {
    if series.len() < min_samples {
        return false;
    }
    if series.iter().any(|s| s.value < 0.0) {
        return false;
    }
    let first = series[0].value;
    if series.iter().all(|s| s.value == first) {
        return false;
    }
    let mut increases = 0usize;
    for pair in series.windows(2) {
        let delta = pair[1].value - pair[0].value;
        if delta < 0.0 {
            return false;
        }
        if delta > 0.0 {
            increases += 1;
        }
    }
    increases >= MIN_POSITIVE_STEPS
}

/// First differences of a counter series, clamping counter resets to zero.
///
/// A reset shows up as a negative difference; emitting the raw negative
/// delta would itself register as an anomaly, so the reset sample
/// contributes a zero rate instead. The output is one sample shorter than
/// the input and keeps each delta's later timestamp.
pub fn non_negative_derivative(series: &[Sample]) -> Vec<Sample> {
    series
        .windows(2)
        .map(|pair| {
            let delta = pair[1].value - pair[0].value;
            Sample::new(pair[1].timestamp, delta.max(0.0))
        })
        .collect()
}

/// Per-metric counter/gauge classification, decided once and cached.
pub struct DerivativeRegistry {
    states: DashMap<String, DerivativeState>,
    pinned_counters: Vec<String>,
    pinned_gauges: Vec<String>,
    min_samples: usize,
}

impl DerivativeRegistry {
    pub fn new(cfg: &AnalyzerConfig) -> Self {
        Self {
            states: DashMap::new(),
            pinned_counters: cfg.derivative_metrics.clone(),
            pinned_gauges: cfg.non_derivative_metrics.clone(),
            min_samples: cfg.derivative_min_samples,
        }
    }

    /// Classify a metric, consulting pins first and then the heuristic.
    ///
    /// Once a metric lands on `Counter` or `Gauge` the decision sticks for
    /// the process lifetime; `Unknown` is retried on every call until the
    /// window grows large enough to decide.
    pub fn classify(&self, metric: &str, series: &[Sample]) -> DerivativeState {
        if let Some(state) = self.states.get(metric) {
            if *state != DerivativeState::Unknown {
                return *state;
            }
        }

        let state = if matches_any(metric, &self.pinned_gauges) {
            DerivativeState::Gauge
        } else if matches_any(metric, &self.pinned_counters) {
            DerivativeState::Counter
        } else if series.len() < self.min_samples {
            DerivativeState::Unknown
        } else if is_strictly_increasing(series, self.min_samples) {
            DerivativeState::Counter
        } else {
            DerivativeState::Gauge
        };

        if state != DerivativeState::Unknown {
            debug!(metric, state = ?state, "derivative classification settled");
        }
        self.states.insert(metric.to_string(), state);
        state
    }

    /// Classify and, for counters, convert the window to rates.
    pub fn prepare(&self, metric: &str, series: &[Sample]) -> Vec<Sample> {
        match self.classify(metric, series) {
            DerivativeState::Counter => non_negative_derivative(series),
            DerivativeState::Gauge | DerivativeState::Unknown => series.to_vec(),
        }
    }

    /// Drop cached state for a metric the roomba removed.
    pub fn forget(&self, metric: &str) {
        self.states.remove(metric);
    }
}
