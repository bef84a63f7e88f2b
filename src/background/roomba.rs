//! The roomba: periodic retention and staleness sweep.
//!
//! Runs on its own interval, independent of the detection tick. Per metric:
//! evict samples past the retention horizon; demote long-silent metrics to
//! stale (out of the scheduler's active set, history kept); remove them
//! entirely once the grace period past stale has also lapsed. The grace
//! period keeps a flapping metric from being treated as brand new on every
//! reappearance.

use crate::analyzer::Analyzer;
use crate::context::AppContext;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Outcome of one sweep, for logging and tests.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub metrics_seen: usize,
    pub samples_evicted: usize,
    pub marked_stale: usize,
    /// Names of metrics removed outright, so the detection engine can drop
    /// its per-metric caches for them too.
    pub removed: Vec<String>,
}

/// One full pass over the registry. Idempotent for a fixed `now`.
pub fn sweep(ctx: &AppContext, now: i64) -> SweepSummary {
    let stale_after = ctx.config.store.stale_threshold_seconds;
    let remove_after = stale_after + ctx.config.store.stale_grace_seconds;
    let retention_cutoff = now - ctx.config.retention_seconds();

    let mut summary = SweepSummary::default();
    for meta in ctx.store.registry() {
        summary.metrics_seen += 1;
        summary.samples_evicted += ctx.store.prune(&meta.name, retention_cutoff);

        let silence = now - meta.last_appended;
        if silence > remove_after {
            if ctx.store.remove(&meta.name) {
                debug!(metric = %meta.name, silence, "removed long-silent metric");
                summary.removed.push(meta.name);
            }
        } else if silence > stale_after && !meta.stale {
            if ctx.store.mark_stale(&meta.name) {
                summary.marked_stale += 1;
                debug!(metric = %meta.name, silence, "metric demoted to stale");
            }
        }
    }

    ctx.stats
        .samples_evicted
        .fetch_add(summary.samples_evicted as u64, Ordering::Relaxed);
    ctx.stats
        .metrics_marked_stale
        .fetch_add(summary.marked_stale as u64, Ordering::Relaxed);
    ctx.stats
        .metrics_removed
        .fetch_add(summary.removed.len() as u64, Ordering::Relaxed);
    summary
}

/// Sweep, then tell the detection engine about removals so a metric that
/// later reappears is classified from scratch instead of inheriting stale
/// derivative and cooldown state.
pub fn sweep_and_forget(ctx: &AppContext, engine: &Analyzer, now: i64) -> SweepSummary {
    let summary = sweep(ctx, now);
    for metric in &summary.removed {
        engine.forget_metric(metric);
    }
    summary
}

/// Interval loop around [`sweep_and_forget`].
pub async fn run_roomba(ctx: AppContext, engine: Arc<Analyzer>, cancel: CancellationToken) {
    let interval = std::time::Duration::from_secs(ctx.config.store.roomba_interval_seconds.max(1));
    info!(interval_secs = interval.as_secs(), "roomba started");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick of a tokio interval fires immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let started = std::time::Instant::now();
                let summary = sweep_and_forget(&ctx, &engine, chrono::Utc::now().timestamp());
                info!(
                    metrics = summary.metrics_seen,
                    evicted = summary.samples_evicted,
                    stale = summary.marked_stale,
                    removed = summary.removed.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "roomba sweep complete"
                );
            }
        }
    }
    info!("roomba stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::types::Sample;

    fn small_ctx() -> AppContext {
        let mut config = Config::default();
        config.store.full_duration = 1_000;
        config.alerting.escalation_duration = 1_000;
        config.store.roomba_grace_seconds = 0;
        config.store.stale_threshold_seconds = 500;
        config.store.stale_grace_seconds = 300;
        AppContext::new(config)
    }

    #[test]
    fn sweep_evicts_past_retention_and_is_idempotent() {
        let ctx = small_ctx();
        let now = 10_000;
        for ts in [8_500, 9_200, 9_900] {
            ctx.store.append("m", Sample::new(ts, 1.0), now);
        }
        let first = sweep(&ctx, now);
        assert_eq!(first.samples_evicted, 1); // 8_500 < 10_000 - 1_000
        let second = sweep(&ctx, now);
        assert_eq!(second.samples_evicted, 0);
        assert_eq!(ctx.store.sample_count("m"), 2);
    }

    #[test]
    fn silent_metric_goes_stale_then_away() {
        let ctx = small_ctx();
        ctx.store.append("m", Sample::new(100, 1.0), 1_000);

        // Inside the stale threshold: untouched.
        let s = sweep(&ctx, 1_400);
        assert_eq!((s.marked_stale, s.removed.len()), (0, 0));

        // Past the stale threshold: demoted, history kept.
        let s = sweep(&ctx, 1_600);
        assert_eq!((s.marked_stale, s.removed.len()), (1, 0));
        assert!(ctx.store.active_snapshot().is_empty());
        assert_eq!(ctx.store.metric_count(), 1);

        // Past the grace period too: gone, and the removal is named.
        let s = sweep(&ctx, 1_900);
        assert_eq!(s.marked_stale, 0);
        assert_eq!(s.removed, vec!["m"]);
        assert_eq!(ctx.store.metric_count(), 0);
    }

    #[tokio::test]
    async fn removed_metric_is_reclassified_on_rebirth() {
        use crate::analyzer::alerts::{AlertSink, MemoryAlertSink};
        use crate::analyzer::{Analyzer, MetricOutcome};
        use crate::types::Alert;

        struct Tee(Arc<MemoryAlertSink>);
        #[async_trait::async_trait]
        impl AlertSink for Tee {
            async fn deliver(&self, alert: &Alert) {
                self.0.deliver(alert).await;
            }
        }

        let mut config = Config::default();
        config.alerting.escalation_duration = config.store.full_duration;
        config.store.stale_threshold_seconds = 500;
        config.store.stale_grace_seconds = 300;
        let ctx = AppContext::new(config);
        let sink = Arc::new(MemoryAlertSink::default());
        let engine = Analyzer::new(ctx.clone(), Box::new(Tee(Arc::clone(&sink)))).unwrap();

        // A counter climbs long enough for the engine to settle on the
        // derivative classification.
        let base = 1_700_000_000;
        for i in 0..1_200 {
            let ts = base + 60 * i;
            ctx.store
                .append("req.total", Sample::new(ts, 25.0 * i as f64), ts);
        }
        let last = base + 60 * 1_199;
        assert_eq!(
            engine.analyze_metric("req.total", last + 1).await,
            MetricOutcome::Clear
        );

        // Long silence: the sweep removes it and tells the engine.
        let summary = sweep_and_forget(&ctx, &engine, last + 802);
        assert_eq!(summary.removed, vec!["req.total"]);

        // Reborn under the same name as a quiet gauge with a terminal
        // spike. A fresh classification sees a gauge, so the alert carries
        // the raw spike value rather than a converted delta.
        let reborn_base = last + 802;
        for i in 0..1_441 {
            let ts = reborn_base + 60 * i;
            let value = if i == 1_440 { 1_000.0 } else { 1.0 };
            ctx.store.append("req.total", Sample::new(ts, value), ts);
        }
        assert_eq!(
            engine
                .analyze_metric("req.total", reborn_base + 60 * 1_440 + 1)
                .await,
            MetricOutcome::Alerted
        );
        assert_eq!(sink.delivered.lock().unwrap()[0].value, 1_000.0);
    }

    #[test]
    fn fresh_metric_survives_sweep_untouched() {
        let ctx = small_ctx();
        let now = 5_000;
        ctx.store.append("fresh", Sample::new(now - 10, 1.0), now);
        let s = sweep(&ctx, now);
        assert_eq!(s, SweepSummary { metrics_seen: 1, ..SweepSummary::default() });
        assert_eq!(ctx.store.active_snapshot().len(), 1);
    }
}
