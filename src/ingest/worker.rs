//! Ingestion worker pool.
//!
//! A fixed pool drains the queue into the timeseries store. Exactly one
//! worker is the canary: besides draining, it periodically injects
//! queue-depth and ingest-rate samples under a reserved namespace, so the
//! detection engine watches the pipeline's own health through the same path
//! as any user metric.

use super::queue::{QueueReceiver, QueueSender};
use crate::context::AppContext;
use crate::types::{MetricSample, Sample};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Queue receiver shared by the pool. One consumer pops at a time; draining
/// is far cheaper than the network reads feeding it, so the lock is not the
/// bottleneck.
pub type SharedReceiver = Arc<Mutex<QueueReceiver>>;

/// Check a metric against the skip list, with the do-not-skip override.
///
/// An entry matches as a plain substring or when every dotted element of
/// the entry appears among the metric's dotted elements.
pub fn in_skip_list(metric: &str, skip_list: &[String], do_not_skip_list: &[String]) -> bool {
    if !matches_any(metric, skip_list) {
        return false;
    }
    !matches_any(metric, do_not_skip_list)
}

pub(crate) fn matches_any(metric: &str, entries: &[String]) -> bool {
    let metric_elements: Vec<&str> = metric.split('.').collect();
    entries.iter().any(|entry| {
        if metric.contains(entry.as_str()) {
            return true;
        }
        entry
            .split('.')
            .all(|element| metric_elements.contains(&element))
    })
}

/// Drain loop for one worker. `canary` carries the producer handle the
/// canary uses to feed its self-health samples back through the queue.
pub async fn run_worker(
    worker_number: usize,
    ctx: AppContext,
    receiver: SharedReceiver,
    canary: Option<QueueSender>,
    cancel: CancellationToken,
) {
    info!(worker_number, canary = canary.is_some(), "ingestion worker started");

    let canary_interval = Duration::from_secs(ctx.config.ingest.canary_interval_seconds.max(1));
    let mut ticker = tokio::time::interval(canary_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut ingested_at_last_tick = 0u64;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            item = pop_shared(&receiver) => {
                match item {
                    Some(item) => handle_sample(&ctx, item),
                    None => break, // every listener is gone
                }
            }
            _ = ticker.tick(), if canary.is_some() => {
                if let Some(sender) = &canary {
                    ingested_at_last_tick =
                        inject_canary(&ctx, sender, ingested_at_last_tick, canary_interval);
                }
            }
        }
    }
    info!(worker_number, "ingestion worker stopped");
}

async fn pop_shared(receiver: &SharedReceiver) -> Option<MetricSample> {
    receiver.lock().await.pop().await
}

fn handle_sample(ctx: &AppContext, item: MetricSample) {
    let cfg = &ctx.config.ingest;
    if in_skip_list(&item.metric, &cfg.skip_list, &cfg.do_not_skip_list) {
        ctx.stats
            .samples_skipped_namespace
            .fetch_add(1, Ordering::Relaxed);
        return;
    }

    let now = unix_now();
    // Bad data guard: a sample far in the past would land behind the
    // retention horizon and churn the pruner for nothing.
    if item.sample.timestamp < now - ctx.config.ingest.max_resolution_seconds {
        ctx.stats
            .samples_discarded_old
            .fetch_add(1, Ordering::Relaxed);
        debug!(metric = %item.metric, timestamp = item.sample.timestamp, "discarded stale-on-arrival sample");
        return;
    }

    ctx.store.append(&item.metric, item.sample, now);
    ctx.stats.samples_ingested.fetch_add(1, Ordering::Relaxed);
}

/// Push the canary's self-health samples. Returns the new ingested-counter
/// baseline for the next rate calculation.
fn inject_canary(
    ctx: &AppContext,
    sender: &QueueSender,
    ingested_at_last_tick: u64,
    interval: Duration,
) -> u64 {
    let now = unix_now();
    let namespace = &ctx.config.ingest.canary_namespace;

    // The depth gauge is the size the listeners last calculated after a
    // push, the same number an operator would see in the overload logs.
    let depth = ctx.stats.last_queue_size.load(Ordering::Relaxed) as f64;
    let ingested_total = ctx.stats.samples_ingested.load(Ordering::Relaxed);
    let rate =
        (ingested_total.saturating_sub(ingested_at_last_tick)) as f64 / interval.as_secs_f64();

    for (suffix, value) in [("queue_depth", depth), ("ingest_rate", rate)] {
        let pushed = sender.try_push(MetricSample {
            metric: format!("{namespace}.{suffix}"),
            sample: Sample::new(now, value),
        });
        if !pushed {
            // The drop counter already recorded it; a full queue is itself
            // the signal the canary exists to surface.
            debug!(suffix, "canary sample dropped by full queue");
        }
    }
    debug!(depth, rate, "canary samples injected");
    ingested_total
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
