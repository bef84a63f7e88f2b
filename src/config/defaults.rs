//! Built-in configuration defaults.
//!
//! Every tunable has a compile-time default so the daemon runs with no
//! config file at all. Values follow long-standing operational practice for
//! minutely metric streams: a 24h primary window, a 7d confirmation window,
//! and a 60s detection tick.

/// Primary analysis / retention window (seconds).
pub const FULL_DURATION: i64 = 86_400;

/// Second-stage confirmation window (seconds).
pub const ESCALATION_DURATION: i64 = 604_800;

/// Minimum ensemble votes for an anomalous consensus.
pub const CONSENSUS: usize = 6;

/// Bound on the ingestion queue. Overflow drops the newest item.
pub const MAX_QUEUE_SIZE: usize = 500;

/// Ingestion worker pool size.
pub const WORKER_PROCESSES: usize = 2;

/// Detection worker (partition) count.
pub const DETECTION_WORKERS: usize = 5;

/// Detection tick interval (seconds).
pub const DETECTION_TICK_SECONDS: u64 = 60;

/// Deadline for one detection partition before its results are discarded.
pub const PARTITION_TIMEOUT_SECONDS: u64 = 55;

/// A metric with no sample for this long is classified stale.
pub const STALE_THRESHOLD_SECONDS: i64 = 500;

/// Extra silence beyond the stale threshold before a metric is removed
/// entirely. Prevents flapping metrics from being treated as new.
pub const STALE_GRACE_SECONDS: i64 = 3_600;

/// Repeat alerts for a metric are suppressed inside this window.
pub const ALERT_COOLDOWN_SECONDS: i64 = 1_800;

/// Pruner interval, deliberately independent of the detection tick.
pub const ROOMBA_INTERVAL_SECONDS: u64 = 100;

/// Slack past the retention horizon before samples are evicted. Series do
/// not need to be trimmed to exactly the retention window at all times.
pub const ROOMBA_GRACE_SECONDS: i64 = 600;

/// Maximum records accepted in one batch frame (resource-exhaustion guard).
pub const MAX_BATCH_ITEMS: usize = 1_000;

/// Samples older than this relative to arrival time are discarded as bad data.
pub const MAX_RESOLUTION_SECONDS: i64 = 1_000;

/// Minimum window length before any algorithm runs (one hour of minutely data).
pub const MIN_TOLERABLE_LENGTH: usize = 60;

/// How many trailing values the boredom check inspects.
pub const MAX_TOLERABLE_BOREDOM: usize = 100;

/// A tail with at most this many distinct values is boring.
pub const BOREDOM_SET_SIZE: usize = 1;

/// Samples required before a series can be classified as a counter.
pub const DERIVATIVE_MIN_SAMPLES: usize = 90;

/// Reserved namespace for the canary's self-health metrics.
pub const CANARY_NAMESPACE: &str = "driftwatch.self";

/// Canary injection interval (seconds).
pub const CANARY_INTERVAL_SECONDS: u64 = 10;

/// Default listener addresses.
pub const BIND_TCP: &str = "0.0.0.0:2024";
pub const BIND_UDP: &str = "0.0.0.0:2025";
