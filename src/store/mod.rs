//! In-process sharded timeseries store.
//!
//! One entry per metric, sharded by `DashMap` so ingestion workers appending
//! different metrics and detection workers reading different metrics never
//! contend on a global lock. Cross-metric ordering is never required, so
//! per-metric mutual exclusion (the shard entry lock) is the only
//! synchronization.
//!
//! Retention is enforced lazily by the roomba, not on append, so the write
//! path stays O(1) amortized.

use crate::types::Sample;
use dashmap::DashMap;
use std::collections::VecDeque;

/// Per-metric series plus registry metadata.
#[derive(Debug)]
struct MetricSeries {
    /// Samples ordered by non-decreasing timestamp.
    samples: VecDeque<Sample>,
    /// Wall-clock time of the last append (not the sample timestamp).
    last_appended: i64,
    /// Stale metrics are excluded from the scheduler snapshot but keep
    /// their history until the grace period lapses.
    stale: bool,
}

/// Registry view of one metric, consumed by the roomba.
#[derive(Debug, Clone)]
pub struct MetricMeta {
    pub name: String,
    pub last_appended: i64,
    pub stale: bool,
    pub sample_count: usize,
}

/// Scheduler snapshot entry: metric name plus its partitioning cost estimate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricCost {
    pub name: String,
    pub sample_count: usize,
}

/// The per-metric rolling store plus the registry of known metric names.
#[derive(Debug, Default)]
pub struct TimeseriesStore {
    series: DashMap<String, MetricSeries>,
}

impl TimeseriesStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one sample, inserting in timestamp order.
    ///
    /// The common case is append-at-tail; an out-of-order sample walks back
    /// from the tail to its position. Appending to a stale metric
    /// reactivates it. Registry insertion is idempotent.
    pub fn append(&self, metric: &str, sample: Sample, now_wall: i64) {
        let mut entry = self
            .series
            .entry(metric.to_string())
            .or_insert_with(|| MetricSeries {
                samples: VecDeque::new(),
                last_appended: now_wall,
                stale: false,
            });
        entry.last_appended = now_wall;
        entry.stale = false;

        let samples = &mut entry.samples;
        match samples.back() {
            Some(last) if last.timestamp > sample.timestamp => {
                // Walk back to the first position keeping non-decreasing order.
                let mut idx = samples.len();
                while idx > 0 && samples[idx - 1].timestamp > sample.timestamp {
                    idx -= 1;
                }
                samples.insert(idx, sample);
            }
            _ => samples.push_back(sample),
        }
    }

    /// Ordered samples with `from_ts <= timestamp <= until_ts`.
    ///
    /// An unknown metric yields an empty sequence ("no data", not an error).
    pub fn range(&self, metric: &str, from_ts: i64, until_ts: i64) -> Vec<Sample> {
        self.series.get(metric).map_or_else(Vec::new, |entry| {
            entry
                .samples
                .iter()
                .filter(|s| s.timestamp >= from_ts && s.timestamp <= until_ts)
                .copied()
                .collect()
        })
    }

    /// The trailing `duration` seconds of a series, anchored at its newest
    /// sample so a late-running tick sees the same window the data defines.
    pub fn recent(&self, metric: &str, duration: i64) -> Vec<Sample> {
        self.series.get(metric).map_or_else(Vec::new, |entry| {
            let Some(last) = entry.samples.back() else {
                return Vec::new();
            };
            let from_ts = last.timestamp - duration;
            entry
                .samples
                .iter()
                .filter(|s| s.timestamp >= from_ts)
                .copied()
                .collect()
        })
    }

    /// Evict samples strictly older than `older_than_ts`. Returns the count
    /// removed; pruning twice with the same cutoff removes nothing new.
    pub fn prune(&self, metric: &str, older_than_ts: i64) -> usize {
        let Some(mut entry) = self.series.get_mut(metric) else {
            return 0;
        };
        let mut removed = 0;
        while entry
            .samples
            .front()
            .is_some_and(|s| s.timestamp < older_than_ts)
        {
            entry.samples.pop_front();
            removed += 1;
        }
        removed
    }

    /// Demote a metric from the active set. History is kept.
    pub fn mark_stale(&self, metric: &str) -> bool {
        match self.series.get_mut(metric) {
            Some(mut entry) if !entry.stale => {
                entry.stale = true;
                true
            }
            _ => false,
        }
    }

    /// Drop a metric and its history entirely.
    pub fn remove(&self, metric: &str) -> bool {
        self.series.remove(metric).is_some()
    }

    /// Active (non-stale) metrics with their sample counts, for the
    /// scheduler's partitioning pass.
    pub fn active_snapshot(&self) -> Vec<MetricCost> {
        self.series
            .iter()
            .filter(|entry| !entry.stale)
            .map(|entry| MetricCost {
                name: entry.key().clone(),
                sample_count: entry.samples.len(),
            })
            .collect()
    }

    /// Registry metadata for every known metric, for the roomba sweep.
    pub fn registry(&self) -> Vec<MetricMeta> {
        self.series
            .iter()
            .map(|entry| MetricMeta {
                name: entry.key().clone(),
                last_appended: entry.last_appended,
                stale: entry.stale,
                sample_count: entry.samples.len(),
            })
            .collect()
    }

    pub fn metric_count(&self) -> usize {
        self.series.len()
    }

    pub fn sample_count(&self, metric: &str) -> usize {
        self.series.get(metric).map_or(0, |e| e.samples.len())
    }
}
