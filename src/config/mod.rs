//! Runtime configuration.
//!
//! Loaded from TOML and handed to every component through [`crate::context::AppContext`]
//! rather than ambient globals, so tests can build arbitrary configurations
//! without process-wide state.
//!
//! ## Loading order
//!
//! 1. `DRIFTWATCH_CONFIG` environment variable (path to TOML file)
//! 2. `--config` CLI flag
//! 3. `driftwatch.toml` in the current working directory
//! 4. Built-in defaults
//!
//! Validation runs once at startup and fails fast: an invalid configuration
//! (unknown algorithm name, consensus larger than the algorithm count) exits
//! with code 1 before any socket is bound.

pub mod defaults;
mod validation;

pub use validation::ConfigError;

use crate::types::AlgorithmId;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration, one section per subsystem.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub ingest: IngestConfig,
    pub store: StoreConfig,
    pub analyzer: AnalyzerConfig,
    pub alerting: AlertingConfig,
}

/// Listeners, queue, and ingestion worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Batch (length-prefixed frames over persistent connections) listener.
    pub bind_tcp: String,
    /// Single-record datagram listener.
    pub bind_udp: String,
    pub max_queue_size: usize,
    pub worker_processes: usize,
    pub max_batch_items: usize,
    /// Samples older than this relative to arrival are discarded as bad data.
    pub max_resolution_seconds: i64,
    /// Metric namespaces to drop at ingestion (element-wise match).
    pub skip_list: Vec<String>,
    /// Namespaces exempt from the skip list.
    pub do_not_skip_list: Vec<String>,
    pub canary_namespace: String,
    pub canary_interval_seconds: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            bind_tcp: defaults::BIND_TCP.to_string(),
            bind_udp: defaults::BIND_UDP.to_string(),
            max_queue_size: defaults::MAX_QUEUE_SIZE,
            worker_processes: defaults::WORKER_PROCESSES,
            max_batch_items: defaults::MAX_BATCH_ITEMS,
            max_resolution_seconds: defaults::MAX_RESOLUTION_SECONDS,
            skip_list: Vec::new(),
            do_not_skip_list: Vec::new(),
            canary_namespace: defaults::CANARY_NAMESPACE.to_string(),
            canary_interval_seconds: defaults::CANARY_INTERVAL_SECONDS,
        }
    }
}

/// Timeseries store retention and pruning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Primary analysis window (seconds).
    pub full_duration: i64,
    pub roomba_interval_seconds: u64,
    pub roomba_grace_seconds: i64,
    pub stale_threshold_seconds: i64,
    /// Extra silence beyond stale before full removal.
    pub stale_grace_seconds: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            full_duration: defaults::FULL_DURATION,
            roomba_interval_seconds: defaults::ROOMBA_INTERVAL_SECONDS,
            roomba_grace_seconds: defaults::ROOMBA_GRACE_SECONDS,
            stale_threshold_seconds: defaults::STALE_THRESHOLD_SECONDS,
            stale_grace_seconds: defaults::STALE_GRACE_SECONDS,
        }
    }
}

/// Detection scheduler and ensemble.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Ordered list of algorithm identifiers to run.
    pub algorithms: Vec<String>,
    pub consensus: usize,
    pub detection_workers: usize,
    pub detection_tick_seconds: u64,
    pub partition_timeout_seconds: u64,
    pub min_tolerable_length: usize,
    pub max_tolerable_boredom: usize,
    pub boredom_set_size: usize,
    /// Metrics pinned as counters regardless of the heuristic.
    pub derivative_metrics: Vec<String>,
    /// Metrics pinned as gauges regardless of the heuristic.
    pub non_derivative_metrics: Vec<String>,
    pub derivative_min_samples: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            algorithms: AlgorithmId::ALL.iter().map(|id| id.to_string()).collect(),
            consensus: defaults::CONSENSUS,
            detection_workers: defaults::DETECTION_WORKERS,
            detection_tick_seconds: defaults::DETECTION_TICK_SECONDS,
            partition_timeout_seconds: defaults::PARTITION_TIMEOUT_SECONDS,
            min_tolerable_length: defaults::MIN_TOLERABLE_LENGTH,
            max_tolerable_boredom: defaults::MAX_TOLERABLE_BOREDOM,
            boredom_set_size: defaults::BOREDOM_SET_SIZE,
            derivative_metrics: Vec::new(),
            non_derivative_metrics: Vec::new(),
            derivative_min_samples: defaults::DERIVATIVE_MIN_SAMPLES,
        }
    }
}

/// Escalation and alert gating.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertingConfig {
    /// Second-stage confirmation window (seconds).
    pub escalation_duration: i64,
    /// Second-stage consensus. `None` falls back to `analyzer.consensus`.
    pub escalation_consensus: Option<usize>,
    pub alert_cooldown_seconds: i64,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            escalation_duration: defaults::ESCALATION_DURATION,
            escalation_consensus: None,
            alert_cooldown_seconds: defaults::ALERT_COOLDOWN_SECONDS,
        }
    }
}

impl Config {
    /// Load configuration following the documented precedence.
    ///
    /// A file that exists but fails to parse is an error; a missing default
    /// path silently falls back to built-in defaults.
    pub fn load(cli_path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Ok(env_path) = std::env::var("DRIFTWATCH_CONFIG") {
            return Self::from_file(Path::new(&env_path));
        }
        if let Some(path) = cli_path {
            return Self::from_file(path);
        }
        let cwd_default = Path::new("driftwatch.toml");
        if cwd_default.exists() {
            return Self::from_file(cwd_default);
        }
        tracing::info!("no config file found, using built-in defaults");
        Ok(Self::default())
    }

    /// Parse a TOML config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        tracing::info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Parse the configured algorithm list into typed identifiers.
    pub fn algorithm_ids(&self) -> Result<Vec<AlgorithmId>, ConfigError> {
        self.analyzer
            .algorithms
            .iter()
            .map(|name| {
                name.parse::<AlgorithmId>()
                    .map_err(|e| ConfigError::UnknownAlgorithm(e.0))
            })
            .collect()
    }

    /// Second-stage consensus, defaulting to the primary threshold.
    pub fn escalation_consensus(&self) -> usize {
        self.alerting
            .escalation_consensus
            .unwrap_or(self.analyzer.consensus)
    }

    /// Oldest timestamp the store must retain relative to `now`.
    ///
    /// The escalation pass reads from the same local store, so retention
    /// covers the longer of the two windows plus the roomba's slack.
    pub fn retention_seconds(&self) -> i64 {
        self.store
            .full_duration
            .max(self.alerting.escalation_duration)
            + self.store.roomba_grace_seconds
    }
}
