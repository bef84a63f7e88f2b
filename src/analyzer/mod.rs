//! The detection engine: periodic scheduler, workload partitioning, the
//! two-stage escalation flow, and alert gating.
//!
//! Every tick the scheduler snapshots the active metric registry, splits it
//! into cost-balanced partitions, and analyzes each partition concurrently
//! under a hard deadline. A partition that blows the deadline is abandoned
//! for that tick; the next tick starts from a fresh snapshot, so nothing is
//! permanently lost.

pub mod algorithms;
pub mod alerts;
pub mod derivative;

use crate::context::{AppContext, PipelineStats};
use crate::store::MetricCost;
use crate::types::{SkipReason, Verdict, WindowClass};
use alerts::{AlertDecision, AlertManager, AlertSink};
use algorithms::{classify_window, Ensemble};
use derivative::DerivativeRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-metric outcome of one analysis pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricOutcome {
    Skipped(SkipReason),
    /// Analyzed, no primary consensus.
    Clear,
    /// Primary consensus but the escalation window disagreed.
    EscalationRejected,
    /// Confirmed anomaly, alert fired.
    Alerted,
    /// Confirmed anomaly inside the cooldown window.
    AlertSuppressed,
}

/// Aggregate counts for one tick, for the end-of-tick log line and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct TickSummary {
    pub metrics_seen: usize,
    pub analyzed: usize,
    pub skipped: usize,
    pub anomalies: usize,
    pub alerts_fired: usize,
    pub partitions_timed_out: usize,
}

/// The detection engine. Built once at startup, shared across partitions.
pub struct Analyzer {
    ctx: AppContext,
    primary: Ensemble,
    escalation: Ensemble,
    derivatives: DerivativeRegistry,
    alerts: AlertManager,
}

impl Analyzer {
    /// Build the engine from validated configuration.
    ///
    /// Both stages run the same algorithm battery; only the window length
    /// and consensus threshold differ.
    pub fn new(ctx: AppContext, sink: Box<dyn AlertSink>) -> Result<Arc<Self>, crate::config::ConfigError> {
        let ids = ctx.config.algorithm_ids()?;
        let primary = Ensemble::new(ids.clone(), ctx.config.analyzer.consensus);
        let escalation = Ensemble::new(ids, ctx.config.escalation_consensus());
        let derivatives = DerivativeRegistry::new(&ctx.config.analyzer);
        let alerts = AlertManager::new(sink, ctx.config.alerting.alert_cooldown_seconds);
        Ok(Arc::new(Self {
            ctx,
            primary,
            escalation,
            derivatives,
            alerts,
        }))
    }

    /// Run the tick loop until cancelled.
    ///
    /// Ticks never overlap: the loop awaits each pass before asking the
    /// interval for another tick, and `Skip` behavior drops the backlog a
    /// slow pass would otherwise create. Dropped ticks are counted.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let tick = Duration::from_secs(self.ctx.config.analyzer.detection_tick_seconds);
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval.tick().await; // first tick is immediate

        info!(tick_seconds = tick.as_secs(), "detection scheduler up");
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("detection scheduler stopping");
                    return;
                }
                _ = interval.tick() => {}
            }
            let started = tokio::time::Instant::now();
            let summary = self.run_tick(unix_now()).await;
            let elapsed = started.elapsed();
            PipelineStats::bump(&self.ctx.stats.ticks_run);
            if elapsed > tick {
                let missed = elapsed.as_secs() / tick.as_secs().max(1);
                self.ctx
                    .stats
                    .ticks_skipped
                    .fetch_add(missed, std::sync::atomic::Ordering::Relaxed);
                warn!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    missed_ticks = missed,
                    "analysis pass overran the tick interval"
                );
            }
            info!(
                metrics = summary.metrics_seen,
                analyzed = summary.analyzed,
                skipped = summary.skipped,
                anomalies = summary.anomalies,
                alerts = summary.alerts_fired,
                timed_out_partitions = summary.partitions_timed_out,
                duration_ms = elapsed.as_millis() as u64,
                "analysis pass complete"
            );
        }
    }

    /// One full analysis pass over the current metric population.
    pub async fn run_tick(self: &Arc<Self>, now: i64) -> TickSummary {
        let snapshot = self.ctx.store.active_snapshot();
        let mut summary = TickSummary {
            metrics_seen: snapshot.len(),
            ..TickSummary::default()
        };
        if snapshot.is_empty() {
            return summary;
        }

        let workers = self.ctx.config.analyzer.detection_workers;
        let deadline = Duration::from_secs(self.ctx.config.analyzer.partition_timeout_seconds);
        let mut tasks: JoinSet<Option<TickSummary>> = JoinSet::new();
        for partition in partition_by_cost(snapshot, workers) {
            let engine = Arc::clone(self);
            tasks.spawn(async move {
                match tokio::time::timeout(deadline, engine.analyze_partition(partition, now)).await
                {
                    Ok(part_summary) => Some(part_summary),
                    Err(_) => None,
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(part)) => {
                    summary.analyzed += part.analyzed;
                    summary.skipped += part.skipped;
                    summary.anomalies += part.anomalies;
                    summary.alerts_fired += part.alerts_fired;
                }
                Ok(None) => {
                    summary.partitions_timed_out += 1;
                    PipelineStats::bump(&self.ctx.stats.partitions_timed_out);
                    warn!("partition exceeded its deadline, results discarded");
                }
                Err(e) => {
                    warn!(error = %e, "partition task failed");
                }
            }
        }
        summary
    }

    async fn analyze_partition(&self, metrics: Vec<String>, now: i64) -> TickSummary {
        let mut summary = TickSummary::default();
        for metric in metrics {
            match self.analyze_metric(&metric, now).await {
                MetricOutcome::Skipped(_) => summary.skipped += 1,
                MetricOutcome::Clear => summary.analyzed += 1,
                MetricOutcome::EscalationRejected => {
                    summary.analyzed += 1;
                    summary.anomalies += 1;
                }
                MetricOutcome::Alerted => {
                    summary.analyzed += 1;
                    summary.anomalies += 1;
                    summary.alerts_fired += 1;
                }
                MetricOutcome::AlertSuppressed => {
                    summary.analyzed += 1;
                    summary.anomalies += 1;
                }
            }
        }
        summary
    }

    /// Analyze one metric: classify, convert, primary ensemble, escalation,
    /// then the alert gate. Each stage short-circuits.
    pub async fn analyze_metric(&self, metric: &str, now: i64) -> MetricOutcome {
        let config = &self.ctx.config;
        let window = self.ctx.store.recent(metric, config.store.full_duration);

        let class = classify_window(
            &window,
            now,
            &config.analyzer,
            config.store.stale_threshold_seconds,
        );
        if let WindowClass::Skip(reason) = class {
            self.ctx.stats.record_skip(reason);
            debug!(metric, reason = %reason, "window skipped");
            return MetricOutcome::Skipped(reason);
        }

        let prepared = self.derivatives.prepare(metric, &window);
        PipelineStats::bump(&self.ctx.stats.metrics_analyzed);
        let verdict = self.primary.run(metric, &prepared, now);
        if !verdict.consensus {
            return MetricOutcome::Clear;
        }
        PipelineStats::bump(&self.ctx.stats.anomalies_primary);
        debug!(
            metric,
            tail_avg = verdict.tail_avg,
            algorithms = ?verdict.triggered(),
            "primary consensus reached"
        );

        let (confirmed, escalated) = self.confirm(metric, verdict, now);
        let Some(confirmed) = confirmed else {
            PipelineStats::bump(&self.ctx.stats.escalations_rejected);
            return MetricOutcome::EscalationRejected;
        };

        match self.alerts.offer(&confirmed, escalated, now).await {
            AlertDecision::Fired => {
                PipelineStats::bump(&self.ctx.stats.alerts_fired);
                MetricOutcome::Alerted
            }
            AlertDecision::Suppressed => {
                PipelineStats::bump(&self.ctx.stats.alerts_suppressed);
                MetricOutcome::AlertSuppressed
            }
        }
    }

    /// Second-stage confirmation over the longer escalation window.
    ///
    /// When the escalation window is no longer than the primary one there is
    /// nothing extra to consult and the primary verdict stands unescalated.
    /// Otherwise both stages must agree before anything fires; the verdict
    /// that fires is the escalation-stage one, since its votes describe the
    /// metric's longer-term shape.
    fn confirm(&self, metric: &str, primary: Verdict, now: i64) -> (Option<Verdict>, bool) {
        let config = &self.ctx.config;
        if config.alerting.escalation_duration <= config.store.full_duration {
            return (Some(primary), false);
        }

        let long_window = self
            .ctx
            .store
            .recent(metric, config.alerting.escalation_duration);
        if long_window.is_empty() {
            return (None, true);
        }
        let prepared = self.derivatives.prepare(metric, &long_window);
        let verdict = self.escalation.run(metric, &prepared, now);
        if verdict.consensus {
            (Some(verdict), true)
        } else {
            debug!(metric, "escalation window did not confirm, anomaly dropped");
            (None, true)
        }
    }

    /// Clear per-metric caches after the roomba removes a dead metric.
    pub fn forget_metric(&self, metric: &str) {
        self.derivatives.forget(metric);
        self.alerts.forget(metric);
        self.primary.forget(metric);
        self.escalation.forget(metric);
    }
}

/// Split metrics into up to `workers` partitions with roughly equal total
/// sample counts. Metrics are assigned in ascending cost order, each to the
/// currently lightest partition, so cheap metrics seed every bin before the
/// heavy tail lands and no single partition starves.
fn partition_by_cost(mut snapshot: Vec<MetricCost>, workers: usize) -> Vec<Vec<String>> {
    let workers = workers.max(1);
    snapshot.sort_by(|a, b| {
        a.sample_count
            .cmp(&b.sample_count)
            .then_with(|| a.name.cmp(&b.name))
    });

    let mut partitions: Vec<Vec<String>> = vec![Vec::new(); workers.min(snapshot.len())];
    let mut loads = vec![0usize; partitions.len()];
    for cost in snapshot {
        // Ties go to the lowest-index partition, keeping assignment stable.
        let lightest = loads
            .iter()
            .enumerate()
            .min_by_key(|(_, &load)| load)
            .map_or(0, |(i, _)| i);
        loads[lightest] += cost.sample_count;
        partitions[lightest].push(cost.name);
    }
    partitions
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::types::Sample;
    use alerts::MemoryAlertSink;

    fn cost(name: &str, sample_count: usize) -> MetricCost {
        MetricCost {
            name: name.to_string(),
            sample_count,
        }
    }

    #[test]
    fn partitions_balance_total_cost() {
        let snapshot = vec![
            cost("a", 100),
            cost("b", 90),
            cost("c", 50),
            cost("d", 40),
            cost("e", 10),
        ];
        let partitions = partition_by_cost(snapshot, 2);
        assert_eq!(partitions.len(), 2);
        let load = |p: &Vec<String>| -> usize {
            p.iter()
                .map(|name| match name.as_str() {
                    "a" => 100,
                    "b" => 90,
                    "c" => 50,
                    "d" => 40,
                    _ => 10,
                })
                .sum()
        };
        let (l0, l1) = (load(&partitions[0]), load(&partitions[1]));
        assert_eq!(l0 + l1, 290);
        assert!(l0.abs_diff(l1) <= 30, "loads {l0} vs {l1}");
    }

    #[test]
    fn metrics_are_assigned_in_ascending_cost_order() {
        let snapshot = vec![cost("heavy", 100), cost("light", 1), cost("middle", 10)];
        let partitions = partition_by_cost(snapshot, 1);
        assert_eq!(partitions[0], vec!["light", "middle", "heavy"]);
    }

    #[test]
    fn no_empty_partitions_for_small_populations() {
        let partitions = partition_by_cost(vec![cost("only", 5)], 8);
        assert_eq!(partitions.len(), 1);
        assert_eq!(partitions[0], vec!["only"]);
    }

    #[test]
    fn every_metric_lands_in_exactly_one_partition() {
        let snapshot: Vec<MetricCost> = (0..37).map(|i| cost(&format!("m{i}"), i)).collect();
        let partitions = partition_by_cost(snapshot, 5);
        let mut all: Vec<String> = partitions.into_iter().flatten().collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 37);
    }

    // ------------------------------------------------------------------
    // End-to-end scheduler behavior over an in-memory store
    // ------------------------------------------------------------------

    fn test_config() -> Config {
        let mut config = Config::default();
        // Escalation window equal to the primary window: single-stage mode.
        config.alerting.escalation_duration = config.store.full_duration;
        config
    }

    fn engine_with(config: Config) -> (Arc<Analyzer>, AppContext, Arc<MemoryAlertSink>) {
        struct Tee(Arc<MemoryAlertSink>);
        #[async_trait::async_trait]
        impl AlertSink for Tee {
            async fn deliver(&self, alert: &crate::types::Alert) {
                self.0.deliver(alert).await;
            }
        }
        let ctx = AppContext::new(config);
        let sink = Arc::new(MemoryAlertSink::default());
        let engine = Analyzer::new(ctx.clone(), Box::new(Tee(Arc::clone(&sink)))).unwrap();
        (engine, ctx, sink)
    }

    fn load_spike(ctx: &AppContext, metric: &str, base: i64) {
        for i in 0..1_441 {
            let value = if i == 1_440 { 1_000.0 } else { 1.0 };
            ctx.store
                .append(metric, Sample::new(base + 60 * i, value), base + 60 * i);
        }
    }

    #[tokio::test]
    async fn spiked_metric_alerts_end_to_end() {
        let (engine, ctx, sink) = engine_with(test_config());
        let base = 1_700_000_000;
        load_spike(&ctx, "web.hits", base);
        let now = base + 60 * 1_440 + 1;

        let outcome = engine.analyze_metric("web.hits", now).await;
        assert_eq!(outcome, MetricOutcome::Alerted);
        let delivered = sink.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].metric, "web.hits");
        assert_eq!(delivered[0].value, 1_000.0);
        assert!(!delivered[0].escalated);
    }

    #[tokio::test]
    async fn repeat_anomaly_is_suppressed_within_cooldown() {
        let (engine, ctx, _sink) = engine_with(test_config());
        let base = 1_700_000_000;
        load_spike(&ctx, "web.hits", base);
        let now = base + 60 * 1_440 + 1;

        assert_eq!(engine.analyze_metric("web.hits", now).await, MetricOutcome::Alerted);
        assert_eq!(
            engine.analyze_metric("web.hits", now + 120).await,
            MetricOutcome::AlertSuppressed
        );
        assert_eq!(PipelineStats::get(&ctx.stats.alerts_suppressed), 1);
    }

    #[tokio::test]
    async fn flat_metric_is_skipped_as_boring() {
        let (engine, ctx, sink) = engine_with(test_config());
        let base = 1_700_000_000;
        for i in 0..200 {
            ctx.store
                .append("idle.gauge", Sample::new(base + 60 * i, 4.0), base + 60 * i);
        }
        let now = base + 60 * 199 + 1;
        assert_eq!(
            engine.analyze_metric("idle.gauge", now).await,
            MetricOutcome::Skipped(SkipReason::Boring)
        );
        assert!(sink.delivered.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn silent_metric_is_skipped_as_stale() {
        let (engine, ctx, _sink) = engine_with(test_config());
        let base = 1_700_000_000;
        load_spike(&ctx, "web.hits", base);
        // Newest sample is far older than the staleness threshold.
        let now = base + 60 * 1_440 + 501;
        assert_eq!(
            engine.analyze_metric("web.hits", now).await,
            MetricOutcome::Skipped(SkipReason::Stale)
        );
    }

    #[tokio::test]
    async fn vanished_metric_is_skipped_as_empty() {
        let (engine, _ctx, _sink) = engine_with(test_config());
        assert_eq!(
            engine.analyze_metric("never.seen", 1_700_000_000).await,
            MetricOutcome::Skipped(SkipReason::Empty)
        );
    }

    #[tokio::test]
    async fn counter_reset_does_not_alert() {
        let (engine, ctx, sink) = engine_with(test_config());
        let base = 1_700_000_000;
        // Steady counter climbing 25/minute.
        let mut value = 0.0;
        for i in 0..1_200 {
            ctx.store
                .append("req.total", Sample::new(base + 60 * i, value), base + 60 * i);
            value += 25.0;
        }
        // Settles the counter classification while the series is monotone.
        assert_eq!(
            engine.analyze_metric("req.total", base + 60 * 1_199 + 1).await,
            MetricOutcome::Clear
        );

        // Process restart: the counter drops back near zero and resumes.
        value = 10.0;
        for i in 1_200..1_206 {
            ctx.store
                .append("req.total", Sample::new(base + 60 * i, value), base + 60 * i);
            value += 25.0;
        }
        let now = base + 60 * 1_205 + 1;
        let outcome = engine.analyze_metric("req.total", now).await;
        assert_ne!(outcome, MetricOutcome::Alerted);
        assert!(sink.delivered.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn escalation_window_must_confirm() {
        // Escalation window four times the primary one. The spike sits at
        // the end of a week of flat history; with the longer window the
        // ensemble still confirms, so this exercises the two-stage path.
        let mut config = Config::default();
        config.store.full_duration = 86_400;
        config.alerting.escalation_duration = 4 * 86_400;
        let (engine, ctx, sink) = engine_with(config);
        let base = 1_700_000_000;
        for i in 0..5_761 {
            let value = if i == 5_760 { 1_000.0 } else { 1.0 };
            ctx.store
                .append("web.hits", Sample::new(base + 60 * i, value), base + 60 * i);
        }
        let now = base + 60 * 5_760 + 1;
        assert_eq!(engine.analyze_metric("web.hits", now).await, MetricOutcome::Alerted);
        assert!(sink.delivered.lock().unwrap()[0].escalated);
    }

    #[tokio::test]
    async fn run_tick_covers_the_whole_population() {
        let (engine, ctx, _sink) = engine_with(test_config());
        let base = 1_700_000_000;
        load_spike(&ctx, "web.hits", base);
        for i in 0..200 {
            ctx.store
                .append("idle.gauge", Sample::new(base + 60 * i, 4.0), base + 60 * i);
        }
        let now = base + 60 * 1_440 + 1;
        let summary = engine.run_tick(now).await;
        assert_eq!(summary.metrics_seen, 2);
        assert_eq!(summary.analyzed, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.alerts_fired, 1);
        assert_eq!(summary.partitions_timed_out, 0);
    }
}
