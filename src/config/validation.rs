//! Startup validation.
//!
//! Collects every problem before failing so an operator fixes a bad config
//! in one pass instead of replaying the daemon against each error in turn.

use super::Config;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },

    #[error("unknown algorithm in algorithms list: {0}")]
    UnknownAlgorithm(String),

    #[error("invalid configuration:\n{}", .0.join("\n"))]
    Invalid(Vec<String>),
}

impl Config {
    /// Validate the full configuration, collecting all problems.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        let algorithm_count = match self.algorithm_ids() {
            Ok(ids) => {
                if ids.is_empty() {
                    problems.push("analyzer.algorithms must not be empty".to_string());
                }
                let mut seen = std::collections::HashSet::new();
                for id in &ids {
                    if !seen.insert(*id) {
                        problems.push(format!("analyzer.algorithms lists {id} more than once"));
                    }
                }
                ids.len()
            }
            Err(ConfigError::UnknownAlgorithm(name)) => {
                problems.push(format!("analyzer.algorithms contains unknown name: {name}"));
                0
            }
            Err(_) => 0,
        };

        if self.analyzer.consensus == 0 {
            problems.push("analyzer.consensus must be at least 1".to_string());
        }
        if algorithm_count > 0 && self.analyzer.consensus > algorithm_count {
            problems.push(format!(
                "analyzer.consensus ({}) exceeds the number of configured algorithms ({})",
                self.analyzer.consensus, algorithm_count
            ));
        }
        if let Some(escalation) = self.alerting.escalation_consensus {
            if escalation == 0 {
                problems.push("alerting.escalation_consensus must be at least 1".to_string());
            }
            if algorithm_count > 0 && escalation > algorithm_count {
                problems.push(format!(
                    "alerting.escalation_consensus ({escalation}) exceeds the number of configured algorithms ({algorithm_count})"
                ));
            }
        }

        if self.ingest.max_queue_size == 0 {
            problems.push("ingest.max_queue_size must be at least 1".to_string());
        }
        if self.ingest.worker_processes == 0 {
            problems.push("ingest.worker_processes must be at least 1".to_string());
        }
        if self.ingest.max_batch_items == 0 {
            problems.push("ingest.max_batch_items must be at least 1".to_string());
        }
        if self.analyzer.detection_workers == 0 {
            problems.push("analyzer.detection_workers must be at least 1".to_string());
        }
        if self.analyzer.detection_tick_seconds == 0 {
            problems.push("analyzer.detection_tick_seconds must be at least 1".to_string());
        }
        if self.analyzer.min_tolerable_length < 4 {
            // tail_avg needs three datapoints plus at least one of history.
            problems.push("analyzer.min_tolerable_length must be at least 4".to_string());
        }

        if self.store.full_duration <= 0 {
            problems.push("store.full_duration must be positive".to_string());
        }
        if self.store.stale_threshold_seconds <= 0 {
            problems.push("store.stale_threshold_seconds must be positive".to_string());
        }
        if self.alerting.escalation_duration < self.store.full_duration {
            problems.push(format!(
                "alerting.escalation_duration ({}) must be at least store.full_duration ({})",
                self.alerting.escalation_duration, self.store.full_duration
            ));
        }
        if self.alerting.alert_cooldown_seconds < 0 {
            problems.push("alerting.alert_cooldown_seconds must not be negative".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }
}
