//! Alert delivery and per-metric cooldown gating.
//!
//! The detection scheduler decides *whether* a metric is anomalous; this
//! module decides whether that verdict becomes a delivered alert. A metric
//! that stays anomalous re-triggers every tick, so each metric carries a
//! cooldown window during which repeat alerts are suppressed (and counted).

use crate::types::{Alert, Verdict};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{info, warn};

/// Delivery seam for fired alerts.
///
/// The engine is delivery-agnostic: anything that can consume an [`Alert`]
/// payload can sit behind this trait. The default sink writes structured
/// log events.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn deliver(&self, alert: &Alert);
}

/// Emits every alert as a structured `warn` event.
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn deliver(&self, alert: &Alert) {
        warn!(
            metric = %alert.metric,
            timestamp = alert.timestamp,
            value = alert.value,
            algorithms = ?alert.consensus_algorithms,
            escalated = alert.escalated,
            "anomaly alert"
        );
    }
}

/// Collects alerts in memory; test double for the scheduler.
#[derive(Default)]
pub struct MemoryAlertSink {
    pub delivered: Mutex<Vec<Alert>>,
}

#[async_trait]
impl AlertSink for MemoryAlertSink {
    async fn deliver(&self, alert: &Alert) {
        if let Ok(mut delivered) = self.delivered.lock() {
            delivered.push(alert.clone());
        }
    }
}

/// Outcome of offering a verdict to the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertDecision {
    Fired,
    /// Within the cooldown window for this metric.
    Suppressed,
}

/// Per-metric cooldown state in front of a sink.
pub struct AlertManager {
    sink: Box<dyn AlertSink>,
    cooldown_seconds: i64,
    /// Wall-clock time each metric last fired.
    last_fired: Mutex<HashMap<String, i64>>,
}

impl AlertManager {
    pub fn new(sink: Box<dyn AlertSink>, cooldown_seconds: i64) -> Self {
        Self {
            sink,
            cooldown_seconds,
            last_fired: Mutex::new(HashMap::new()),
        }
    }

    /// Fire an alert for a confirmed verdict unless the metric is cooling
    /// down. The cooldown anchors on the last *fired* alert; suppressed
    /// repeats do not extend it.
    pub async fn offer(&self, verdict: &Verdict, escalated: bool, now: i64) -> AlertDecision {
        {
            let Ok(mut last_fired) = self.last_fired.lock() else {
                return AlertDecision::Suppressed;
            };
            if let Some(&fired_at) = last_fired.get(&verdict.metric) {
                if now - fired_at < self.cooldown_seconds {
                    info!(
                        metric = %verdict.metric,
                        cooldown_remaining = self.cooldown_seconds - (now - fired_at),
                        "alert suppressed by cooldown"
                    );
                    return AlertDecision::Suppressed;
                }
            }
            last_fired.insert(verdict.metric.clone(), now);
        }

        let alert = Alert {
            metric: verdict.metric.clone(),
            timestamp: verdict.timestamp,
            value: verdict.value,
            consensus_algorithms: verdict.triggered(),
            escalated,
        };
        self.sink.deliver(&alert).await;
        AlertDecision::Fired
    }

    /// Drop cooldown state for a metric the roomba removed.
    pub fn forget(&self, metric: &str) {
        if let Ok(mut last_fired) = self.last_fired.lock() {
            last_fired.remove(metric);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AlgorithmId;
    use std::sync::Arc;

    fn verdict(metric: &str, timestamp: i64) -> Verdict {
        Verdict {
            metric: metric.to_string(),
            timestamp,
            value: 1_000.0,
            tail_avg: 334.0,
            votes: AlgorithmId::ALL.iter().map(|&id| (id, true)).collect(),
            consensus: true,
        }
    }

    struct SharedSink(Arc<MemoryAlertSink>);

    #[async_trait]
    impl AlertSink for SharedSink {
        async fn deliver(&self, alert: &Alert) {
            self.0.deliver(alert).await;
        }
    }

    fn manager_with_memory(cooldown: i64) -> (AlertManager, Arc<MemoryAlertSink>) {
        let sink = Arc::new(MemoryAlertSink::default());
        let manager = AlertManager::new(Box::new(SharedSink(Arc::clone(&sink))), cooldown);
        (manager, sink)
    }

    #[tokio::test]
    async fn repeat_within_cooldown_is_suppressed() {
        let (manager, sink) = manager_with_memory(300);
        assert_eq!(manager.offer(&verdict("m", 0), true, 0).await, AlertDecision::Fired);
        assert_eq!(
            manager.offer(&verdict("m", 120), true, 120).await,
            AlertDecision::Suppressed
        );
        assert_eq!(sink.delivered.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn fires_again_after_cooldown_expires() {
        let (manager, sink) = manager_with_memory(300);
        manager.offer(&verdict("m", 0), true, 0).await;
        assert_eq!(
            manager.offer(&verdict("m", 300), true, 300).await,
            AlertDecision::Fired
        );
        assert_eq!(sink.delivered.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn cooldown_is_per_metric() {
        let (manager, sink) = manager_with_memory(300);
        manager.offer(&verdict("a", 0), true, 0).await;
        assert_eq!(
            manager.offer(&verdict("b", 10), true, 10).await,
            AlertDecision::Fired
        );
        assert_eq!(sink.delivered.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn suppressed_repeats_do_not_extend_the_cooldown() {
        let (manager, _sink) = manager_with_memory(300);
        manager.offer(&verdict("m", 0), true, 0).await;
        manager.offer(&verdict("m", 290), true, 290).await;
        // 310 is past the original fire at 0 even though 290 was refused.
        assert_eq!(
            manager.offer(&verdict("m", 310), true, 310).await,
            AlertDecision::Fired
        );
    }

    #[tokio::test]
    async fn alert_payload_carries_triggering_algorithms() {
        let (manager, sink) = manager_with_memory(300);
        manager.offer(&verdict("m", 5), true, 5).await;
        let delivered = sink.delivered.lock().unwrap();
        assert_eq!(delivered[0].consensus_algorithms.len(), 7);
        assert!(delivered[0].escalated);
        assert_eq!(delivered[0].value, 1_000.0);
    }

    #[tokio::test]
    async fn forget_clears_cooldown_state() {
        let (manager, _sink) = manager_with_memory(300);
        manager.offer(&verdict("m", 0), true, 0).await;
        manager.forget("m");
        assert_eq!(
            manager.offer(&verdict("m", 10), true, 10).await,
            AlertDecision::Fired
        );
    }
}
