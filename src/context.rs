//! Application context.
//!
//! One explicit object holding the configuration, the store handle, and the
//! pipeline counters, passed to every component constructor. No component
//! reaches for ambient global state.

use crate::config::Config;
use crate::store::TimeseriesStore;
use crate::types::SkipReason;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Shared handles for every pipeline component.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub store: Arc<TimeseriesStore>,
    pub stats: Arc<PipelineStats>,
}

impl AppContext {
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);
        Self {
            store: Arc::new(TimeseriesStore::new()),
            stats: Arc::new(PipelineStats::default()),
            config,
        }
    }
}

/// Pipeline-wide counters.
///
/// Plain relaxed atomics: these feed log summaries and the canary metric,
/// nothing here needs cross-counter consistency.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub samples_ingested: AtomicU64,
    pub samples_discarded_old: AtomicU64,
    pub samples_skipped_namespace: AtomicU64,
    pub decode_errors: AtomicU64,
    pub ticks_run: AtomicU64,
    pub ticks_skipped: AtomicU64,
    pub partitions_timed_out: AtomicU64,
    pub metrics_analyzed: AtomicU64,
    pub skips_too_short: AtomicU64,
    pub skips_stale: AtomicU64,
    pub skips_boring: AtomicU64,
    pub skips_empty: AtomicU64,
    pub anomalies_primary: AtomicU64,
    pub escalations_rejected: AtomicU64,
    pub alerts_fired: AtomicU64,
    pub alerts_suppressed: AtomicU64,
    pub samples_evicted: AtomicU64,
    pub metrics_marked_stale: AtomicU64,
    pub metrics_removed: AtomicU64,
    /// Gauge: queue size as last calculated by a listener.
    pub last_queue_size: AtomicU64,
}

impl PipelineStats {
    pub fn record_skip(&self, reason: SkipReason) {
        let counter = match reason {
            SkipReason::TooShort => &self.skips_too_short,
            SkipReason::Stale => &self.skips_stale,
            SkipReason::Boring => &self.skips_boring,
            SkipReason::Empty => &self.skips_empty,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
