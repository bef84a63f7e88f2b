//! Shared types for the ingestion pipeline and detection engine.
//!
//! Everything that crosses a module boundary lives here: wire-level samples,
//! window classification results, per-tick verdicts, and the alert payload
//! handed to the external alerting collaborator.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A single timestamped datapoint for one metric.
///
/// Timestamps are integer unix seconds. Within one metric's series the store
/// keeps samples ordered by timestamp even when they arrive out of order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: i64,
    pub value: f64,
}

impl Sample {
    pub const fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// A decoded wire record: metric name plus one sample.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub metric: String,
    pub sample: Sample,
}

/// Identifier for one ensemble algorithm.
///
/// The registry maps these to typed function references and is validated
/// against the configured algorithm list at startup, so an unknown name is
/// a fatal configuration error rather than a runtime lookup failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmId {
    Grubbs,
    FirstHourAverage,
    StddevFromAverage,
    StddevFromMovingAverage,
    MeanSubtractionCumulation,
    LeastSquares,
    HistogramBins,
}

impl AlgorithmId {
    /// All algorithms, in the order the default configuration runs them.
    pub const ALL: [Self; 7] = [
        Self::Grubbs,
        Self::FirstHourAverage,
        Self::StddevFromAverage,
        Self::StddevFromMovingAverage,
        Self::MeanSubtractionCumulation,
        Self::LeastSquares,
        Self::HistogramBins,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Grubbs => "grubbs",
            Self::FirstHourAverage => "first_hour_average",
            Self::StddevFromAverage => "stddev_from_average",
            Self::StddevFromMovingAverage => "stddev_from_moving_average",
            Self::MeanSubtractionCumulation => "mean_subtraction_cumulation",
            Self::LeastSquares => "least_squares",
            Self::HistogramBins => "histogram_bins",
        }
    }
}

impl fmt::Display for AlgorithmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlgorithmId {
    type Err = UnknownAlgorithm;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|id| id.as_str() == s)
            .ok_or_else(|| UnknownAlgorithm(s.to_string()))
    }
}

/// Error for an algorithm name not present in the registry.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown algorithm: {0}")]
pub struct UnknownAlgorithm(pub String);

/// Why a metric window was skipped before the ensemble ran.
///
/// These are expected, frequent, non-anomalous outcomes. They are counted
/// and logged at debug, never alerted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    /// Fewer samples than the configured minimum.
    TooShort,
    /// The newest sample is older than the staleness threshold.
    Stale,
    /// The tail of the window is effectively a flat line.
    Boring,
    /// No finite values remain in the window.
    Empty,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort => write!(f, "TooShort"),
            Self::Stale => write!(f, "Stale"),
            Self::Boring => write!(f, "Boring"),
            Self::Empty => write!(f, "EmptyTimeseries"),
        }
    }
}

/// Pre-check result for a metric window, consumed by the scheduler before
/// the ensemble is invoked. Replaces exception-driven control flow with a
/// tagged variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowClass {
    Ready,
    Skip(SkipReason),
}

/// One ensemble run over one metric window.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub metric: String,
    /// Timestamp of the newest sample in the analyzed window.
    pub timestamp: i64,
    /// Value of the newest sample in the analyzed window.
    pub value: f64,
    /// Mean of the last three datapoints, the shared input to every test.
    pub tail_avg: f64,
    /// Per-algorithm votes. Algorithms that errored abstain and are absent.
    pub votes: Vec<(AlgorithmId, bool)>,
    pub consensus: bool,
}

impl Verdict {
    /// Names of the algorithms that voted anomalous.
    pub fn triggered(&self) -> Vec<String> {
        self.votes
            .iter()
            .filter(|(_, anomalous)| *anomalous)
            .map(|(id, _)| id.to_string())
            .collect()
    }
}

/// Payload emitted to the alerting collaborator for each fired alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub metric: String,
    pub timestamp: i64,
    pub value: f64,
    /// Algorithms that agreed at the stage that fired.
    pub consensus_algorithms: Vec<String>,
    /// Whether this alert was confirmed by the second-stage window.
    pub escalated: bool,
}

/// Whether a metric is a monotonically increasing counter needing
/// first-difference conversion before analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DerivativeState {
    /// Not enough samples yet to decide.
    #[default]
    Unknown,
    /// Counter: convert to non-negative deltas before analysis.
    Counter,
    /// Plain gauge: analyze raw values.
    Gauge,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn algorithm_id_round_trips_through_str() {
        for id in AlgorithmId::ALL {
            assert_eq!(id.as_str().parse::<AlgorithmId>().unwrap(), id);
        }
    }

    #[test]
    fn unknown_algorithm_is_rejected() {
        assert!("ks_test".parse::<AlgorithmId>().is_err());
    }

    #[test]
    fn verdict_triggered_lists_only_positive_votes() {
        let verdict = Verdict {
            metric: "a.b".to_string(),
            timestamp: 0,
            value: 1.0,
            tail_avg: 1.0,
            votes: vec![
                (AlgorithmId::Grubbs, true),
                (AlgorithmId::LeastSquares, false),
                (AlgorithmId::HistogramBins, true),
            ],
            consensus: false,
        };
        assert_eq!(verdict.triggered(), vec!["grubbs", "histogram_bins"]);
    }
}
