//! The statistical test battery and consensus voting.
//!
//! Every algorithm is a pure function over one window: no shared mutable
//! state, independently addable through the registry. Each returns whether
//! it judges the most recent point anomalous; a numerical failure makes the
//! algorithm abstain from the vote rather than counting as a "no".
//!
//! The shared input to most tests is `tail_avg`, the mean of the last three
//! datapoints: it trades a little sensitivity and detection delay for
//! immunity to single-sample noise.

use crate::config::AnalyzerConfig;
use crate::types::{AlgorithmId, Sample, SkipReason, Verdict, WindowClass};
use statrs::distribution::{ContinuousCDF, StudentsT};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

/// EWMA center-of-mass for the moving-average test.
const EWMA_COM: f64 = 50.0;

/// Grubbs significance level.
const GRUBBS_ALPHA: f64 = 0.05;

/// Histogram bin count and the population at or below which a bin is rare.
const HISTOGRAM_BINS: usize = 15;
const HISTOGRAM_RARITY: u64 = 20;

/// Seconds between repeated failure logs for one algorithm+metric pair.
const FAILURE_LOG_INTERVAL: i64 = 300;

#[derive(Debug, Error)]
pub enum AlgoError {
    #[error("window too small for this test")]
    NotEnoughData,

    #[error("degenerate series: {0}")]
    Degenerate(&'static str),
}

pub type AlgorithmFn = fn(&[Sample]) -> Result<bool, AlgoError>;

/// Explicit registry: algorithm identifier to typed function reference.
pub const fn algorithm_fn(id: AlgorithmId) -> AlgorithmFn {
    match id {
        AlgorithmId::Grubbs => grubbs,
        AlgorithmId::FirstHourAverage => first_hour_average,
        AlgorithmId::StddevFromAverage => stddev_from_average,
        AlgorithmId::StddevFromMovingAverage => stddev_from_moving_average,
        AlgorithmId::MeanSubtractionCumulation => mean_subtraction_cumulation,
        AlgorithmId::LeastSquares => least_squares,
        AlgorithmId::HistogramBins => histogram_bins,
    }
}

// ============================================================================
// Window classification
// ============================================================================

/// Pre-check a window before any algorithm runs.
///
/// Order matters: an empty or unreadable window is `Empty` before anything
/// else; a short window is `TooShort` even if it is also old; staleness is
/// judged on the newest sample; and a flat tail is `Boring` so constant
/// series never reach the ensemble at all.
pub fn classify_window(series: &[Sample], now: i64, cfg: &AnalyzerConfig, stale_threshold: i64) -> WindowClass {
    if series.is_empty() || series.iter().all(|s| !s.value.is_finite()) {
        return WindowClass::Skip(SkipReason::Empty);
    }
    if series.len() < cfg.min_tolerable_length {
        return WindowClass::Skip(SkipReason::TooShort);
    }
    // series is non-empty here
    let last_ts = series[series.len() - 1].timestamp;
    if now - last_ts > stale_threshold {
        return WindowClass::Skip(SkipReason::Stale);
    }

    let tail_start = series.len().saturating_sub(cfg.max_tolerable_boredom);
    let mut distinct: Vec<u64> = series[tail_start..]
        .iter()
        .map(|s| s.value.to_bits())
        .collect();
    distinct.sort_unstable();
    distinct.dedup();
    if distinct.len() <= cfg.boredom_set_size {
        return WindowClass::Skip(SkipReason::Boring);
    }

    WindowClass::Ready
}

// ============================================================================
// Shared statistics helpers
// ============================================================================

/// Mean of the last three datapoints, falling back to the last value.
pub fn tail_avg(series: &[Sample]) -> f64 {
    let n = series.len();
    if n >= 3 {
        (series[n - 1].value + series[n - 2].value + series[n - 3].value) / 3.0
    } else {
        series.last().map_or(f64::NAN, |s| s.value)
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation (ddof = 0).
fn stddev_population(values: &[f64]) -> f64 {
    let m = mean(values);
    (values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64).sqrt()
}

/// Sample standard deviation (ddof = 1).
fn stddev_sample(values: &[f64]) -> f64 {
    let m = mean(values);
    (values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64).sqrt()
}

fn values_of(series: &[Sample]) -> Vec<f64> {
    series.iter().map(|s| s.value).collect()
}

// ============================================================================
// Algorithms
// ============================================================================

/// Grubbs' outlier test: anomalous when the tail average's z-score exceeds
/// the Grubbs critical value at the configured significance level.
pub fn grubbs(series: &[Sample]) -> Result<bool, AlgoError> {
    let values = values_of(series);
    let n = values.len();
    if n < 3 {
        return Err(AlgoError::NotEnoughData);
    }
    let std_dev = stddev_population(&values);
    if std_dev == 0.0 {
        return Err(AlgoError::Degenerate("zero variance"));
    }
    let z_score = (tail_avg(series) - mean(&values)) / std_dev;

    let nf = n as f64;
    let t_dist = StudentsT::new(0.0, 1.0, nf - 2.0)
        .map_err(|_| AlgoError::Degenerate("invalid t distribution"))?;
    let threshold = t_dist.inverse_cdf(1.0 - GRUBBS_ALPHA / (2.0 * nf));
    let threshold_sq = threshold * threshold;
    let grubbs_score = ((nf - 1.0) / nf.sqrt()) * (threshold_sq / (nf - 2.0 + threshold_sq)).sqrt();

    Ok(z_score > grubbs_score)
}

/// Compare the tail average against mean ± 3σ of the first hour of the
/// window. The hour anchors at the window's own first timestamp so the test
/// stays deterministic for series that do not yet span full retention.
pub fn first_hour_average(series: &[Sample]) -> Result<bool, AlgoError> {
    let first_ts = series.first().ok_or(AlgoError::NotEnoughData)?.timestamp;
    let boundary = first_ts + 3_600;
    let first_hour: Vec<f64> = series
        .iter()
        .take_while(|s| s.timestamp < boundary)
        .map(|s| s.value)
        .collect();
    if first_hour.len() < 2 {
        return Err(AlgoError::NotEnoughData);
    }
    let m = mean(&first_hour);
    let std_dev = stddev_sample(&first_hour);
    Ok((tail_avg(series) - m).abs() > 3.0 * std_dev)
}

/// Tail average more than 3 standard deviations from the whole-window mean.
/// Unweighted, so it flags anomalies with respect to the entire series.
pub fn stddev_from_average(series: &[Sample]) -> Result<bool, AlgoError> {
    let values = values_of(series);
    if values.len() < 2 {
        return Err(AlgoError::NotEnoughData);
    }
    let m = mean(&values);
    let std_dev = stddev_sample(&values);
    Ok((tail_avg(series) - m).abs() > 3.0 * std_dev)
}

/// Last point more than 3 exponentially-weighted standard deviations from
/// the exponentially-weighted moving average. Tolerates trend better than
/// the whole-window variant.
pub fn stddev_from_moving_average(series: &[Sample]) -> Result<bool, AlgoError> {
    let values = values_of(series);
    if values.len() < 2 {
        return Err(AlgoError::NotEnoughData);
    }
    let alpha = 1.0 / (1.0 + EWMA_COM);
    let mut ew_mean = values[0];
    let mut ew_var = 0.0f64;
    for &x in &values[1..] {
        let prev_mean = ew_mean;
        ew_mean = (1.0 - alpha) * ew_mean + alpha * x;
        ew_var = (1.0 - alpha) * (ew_var + alpha * (x - prev_mean).powi(2));
    }
    let last = values[values.len() - 1];
    Ok((last - ew_mean).abs() > 3.0 * ew_var.sqrt())
}

/// Sustained drift detector: the last mean-subtracted value sits more than
/// 3σ out relative to the mean-subtracted history.
pub fn mean_subtraction_cumulation(series: &[Sample]) -> Result<bool, AlgoError> {
    let values = values_of(series);
    if values.len() < 3 {
        return Err(AlgoError::NotEnoughData);
    }
    let prefix = &values[..values.len() - 1];
    let m = mean(prefix);
    let std_dev = stddev_sample(prefix);
    let last_centered = values[values.len() - 1] - m;
    Ok(last_centered.abs() > 3.0 * std_dev)
}

/// Fit a straight line through the window; anomalous when the average of
/// the last three residuals exceeds 3σ of all residuals.
pub fn least_squares(series: &[Sample]) -> Result<bool, AlgoError> {
    if series.len() < 3 {
        return Ok(false);
    }
    let xs: Vec<f64> = series.iter().map(|s| s.timestamp as f64).collect();
    let ys = values_of(series);
    let x_mean = mean(&xs);
    let y_mean = mean(&ys);
    let denominator: f64 = xs.iter().map(|x| (x - x_mean).powi(2)).sum();
    if denominator == 0.0 {
        return Err(AlgoError::Degenerate("all timestamps equal"));
    }
    let numerator: f64 = xs
        .iter()
        .zip(&ys)
        .map(|(x, y)| (x - x_mean) * (y - y_mean))
        .sum();
    let slope = numerator / denominator;
    let intercept = y_mean - slope * x_mean;

    let errors: Vec<f64> = xs
        .iter()
        .zip(&ys)
        .map(|(x, y)| y - (slope * x + intercept))
        .collect();
    let std_dev = stddev_population(&errors);
    let n = errors.len();
    let t = (errors[n - 1] + errors[n - 2] + errors[n - 3]) / 3.0;

    Ok(t.abs() > std_dev * 3.0 && std_dev.round() != 0.0 && t.round() != 0.0)
}

/// Bin the window's values; anomalous when the tail average lands in a bin
/// with a population at or below the rarity threshold.
pub fn histogram_bins(series: &[Sample]) -> Result<bool, AlgoError> {
    let values = values_of(series);
    if values.len() < 2 {
        return Err(AlgoError::NotEnoughData);
    }
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max <= min {
        return Err(AlgoError::Degenerate("zero value range"));
    }
    let width = (max - min) / HISTOGRAM_BINS as f64;
    let mut counts = [0u64; HISTOGRAM_BINS];
    for &v in &values {
        let mut idx = ((v - min) / width) as usize;
        if idx >= HISTOGRAM_BINS {
            idx = HISTOGRAM_BINS - 1; // the top edge belongs to the last bin
        }
        counts[idx] += 1;
    }

    let t = tail_avg(series);
    for (index, &count) in counts.iter().enumerate() {
        if count <= HISTOGRAM_RARITY {
            let left = min + width * index as f64;
            let right = min + width * (index + 1) as f64;
            if index == 0 && t <= left {
                return Ok(true);
            }
            // The last bin owns its upper edge, mirroring the clamp above.
            let in_bin = if index == HISTOGRAM_BINS - 1 {
                t >= left && t <= right
            } else {
                t >= left && t < right
            };
            if in_bin {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

// ============================================================================
// Ensemble
// ============================================================================

/// A configured battery: ordered algorithms plus a consensus threshold.
///
/// Algorithms that error abstain entirely; consensus is an absolute count of
/// positive votes, not a majority of whatever ran.
pub struct Ensemble {
    algorithms: Vec<AlgorithmId>,
    consensus: usize,
    /// Last failure-log time per algorithm+metric, to rate-limit noise from
    /// a pathological series without suppressing it entirely.
    failure_log: Mutex<HashMap<(AlgorithmId, String), i64>>,
}

impl Ensemble {
    pub fn new(algorithms: Vec<AlgorithmId>, consensus: usize) -> Self {
        Self {
            algorithms,
            consensus,
            failure_log: Mutex::new(HashMap::new()),
        }
    }

    pub fn consensus_threshold(&self) -> usize {
        self.consensus
    }

    /// Drop failure rate-limit state for a removed metric.
    pub fn forget(&self, metric: &str) {
        if let Ok(mut log) = self.failure_log.lock() {
            log.retain(|(_, logged), _| logged.as_str() != metric);
        }
    }

    /// Run the battery over one window and vote.
    ///
    /// The window must be non-empty and classified `Ready` by the caller.
    pub fn run(&self, metric: &str, series: &[Sample], now: i64) -> Verdict {
        let last = series[series.len() - 1];
        let mut votes = Vec::with_capacity(self.algorithms.len());
        for &id in &self.algorithms {
            match algorithm_fn(id)(series) {
                Ok(anomalous) => votes.push((id, anomalous)),
                Err(e) => {
                    self.log_failure(id, metric, now, &e);
                }
            }
        }
        let positive = votes.iter().filter(|(_, v)| *v).count();
        Verdict {
            metric: metric.to_string(),
            timestamp: last.timestamp,
            value: last.value,
            tail_avg: tail_avg(series),
            votes,
            consensus: positive >= self.consensus,
        }
    }

    fn log_failure(&self, id: AlgorithmId, metric: &str, now: i64, error: &AlgoError) {
        let key = (id, metric.to_string());
        let should_log = {
            let Ok(mut log) = self.failure_log.lock() else {
                return;
            };
            match log.get(&key) {
                Some(&last) if now - last < FAILURE_LOG_INTERVAL => false,
                _ => {
                    log.insert(key, now);
                    true
                }
            }
        };
        if should_log {
            warn!(algorithm = %id, metric, error = %error, "algorithm abstained");
        } else {
            debug!(algorithm = %id, metric, error = %error, "algorithm abstained (repeat)");
        }
    }
}
