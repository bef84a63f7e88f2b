//! driftwatch - streaming metric anomaly detection daemon.
//!
//! # Usage
//!
//! ```bash
//! # Run with built-in defaults
//! cargo run --release
//!
//! # Run with a config file
//! cargo run --release -- --config driftwatch.toml
//!
//! # Point the load generator at it
//! cargo run --release --bin loadgen -- --target 127.0.0.1:2024
//! ```
//!
//! # Environment Variables
//!
//! - `DRIFTWATCH_CONFIG`: Path to the TOML config (overrides `--config`)
//! - `RUST_LOG`: Logging level (default: info)

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use driftwatch::analyzer::alerts::LogAlertSink;
use driftwatch::analyzer::Analyzer;
use driftwatch::background::run_roomba;
use driftwatch::config::Config;
use driftwatch::context::AppContext;
use driftwatch::ingest::worker::{run_worker, SharedReceiver};
use driftwatch::ingest::{bounded, listen, QueueSender};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "driftwatch")]
#[command(about = "Streaming metric anomaly detection")]
#[command(version)]
struct CliArgs {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Override the batch (TCP) listener address
    #[arg(long, value_name = "HOST:PORT")]
    bind_tcp: Option<String>,

    /// Override the datagram (UDP) listener address
    #[arg(long, value_name = "HOST:PORT")]
    bind_udp: Option<String>,
}

// ============================================================================
// Task Names for Supervisor Logging
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum TaskName {
    BatchListener,
    DatagramListener,
    IngestWorker(usize),
    Roomba,
    DetectionScheduler,
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskName::BatchListener => write!(f, "BatchListener"),
            TaskName::DatagramListener => write!(f, "DatagramListener"),
            TaskName::IngestWorker(n) => write!(f, "IngestWorker-{n}"),
            TaskName::Roomba => write!(f, "Roomba"),
            TaskName::DetectionScheduler => write!(f, "DetectionScheduler"),
        }
    }
}

// ============================================================================
// Task Spawning
// ============================================================================

/// Bind both listeners before spawning anything, so an unusable address is
/// a startup failure rather than a half-running daemon.
async fn bind_sockets(config: &Config) -> Result<(tokio::net::TcpListener, tokio::net::UdpSocket)> {
    let tcp = tokio::net::TcpListener::bind(&config.ingest.bind_tcp)
        .await
        .with_context(|| format!("failed to bind batch listener to {}", config.ingest.bind_tcp))?;
    let udp = tokio::net::UdpSocket::bind(&config.ingest.bind_udp)
        .await
        .with_context(|| {
            format!(
                "failed to bind datagram listener to {}",
                config.ingest.bind_udp
            )
        })?;
    Ok((tcp, udp))
}

fn spawn_listeners(
    task_set: &mut JoinSet<Result<TaskName>>,
    ctx: &AppContext,
    queue: &QueueSender,
    tcp: tokio::net::TcpListener,
    udp: tokio::net::UdpSocket,
    cancel: &CancellationToken,
) {
    let (batch_ctx, batch_queue, batch_cancel) = (ctx.clone(), queue.clone(), cancel.clone());
    task_set.spawn(async move {
        listen::run_batch_listener(tcp, batch_ctx, batch_queue, batch_cancel).await;
        Ok(TaskName::BatchListener)
    });

    let (dgram_ctx, dgram_queue, dgram_cancel) = (ctx.clone(), queue.clone(), cancel.clone());
    task_set.spawn(async move {
        listen::run_datagram_listener(udp, dgram_ctx, dgram_queue, dgram_cancel).await;
        Ok(TaskName::DatagramListener)
    });
}

/// Spawn the ingestion worker pool. Worker 0 is the canary: it injects the
/// pipeline's own health metrics through the same queue it drains, so the
/// detection engine watches the watcher.
fn spawn_workers(
    task_set: &mut JoinSet<Result<TaskName>>,
    ctx: &AppContext,
    queue: &QueueSender,
    receiver: SharedReceiver,
    cancel: &CancellationToken,
) {
    for worker_number in 0..ctx.config.ingest.worker_processes {
        let canary = (worker_number == 0).then(|| queue.clone());
        let (worker_ctx, worker_rx, worker_cancel) =
            (ctx.clone(), Arc::clone(&receiver), cancel.clone());
        task_set.spawn(async move {
            run_worker(worker_number, worker_ctx, worker_rx, canary, worker_cancel).await;
            Ok(TaskName::IngestWorker(worker_number))
        });
    }
}

// ============================================================================
// Supervisor
// ============================================================================

/// Monitor tasks until shutdown; any task failure cancels the rest.
async fn run_supervisor(
    task_set: &mut JoinSet<Result<TaskName>>,
    cancel: CancellationToken,
) -> Result<()> {
    info!("supervisor: all tasks spawned, monitoring");

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                info!("supervisor: shutdown signal received");
                break;
            }
            result = task_set.join_next() => {
                match result {
                    Some(Ok(Ok(task_name))) => {
                        info!(task = %task_name, "supervisor: task completed");
                    }
                    Some(Ok(Err(e))) => {
                        error!(error = %e, "supervisor: task failed");
                        cancel.cancel();
                        return Err(e);
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "supervisor: task panicked");
                        cancel.cancel();
                        return Err(anyhow::anyhow!("task panicked: {e}"));
                    }
                    None => {
                        info!("supervisor: all tasks completed");
                        break;
                    }
                }
            }
        }
    }

    // Drain remaining tasks so shutdown is orderly rather than abortive.
    while let Some(result) = task_set.join_next().await {
        match result {
            Ok(Ok(task_name)) => info!(task = %task_name, "task stopped"),
            Ok(Err(e)) => error!(error = %e, "task failed during shutdown"),
            Err(e) => error!(error = %e, "task panicked during shutdown"),
        }
    }

    Ok(())
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(addr) = args.bind_tcp {
        config.ingest.bind_tcp = addr;
    }
    if let Some(addr) = args.bind_udp {
        config.ingest.bind_udp = addr;
    }
    // Invalid configuration exits before any socket is bound.
    config.validate()?;

    info!("driftwatch starting");
    info!(
        tcp = %config.ingest.bind_tcp,
        udp = %config.ingest.bind_udp,
        workers = config.ingest.worker_processes,
        detection_workers = config.analyzer.detection_workers,
        consensus = config.analyzer.consensus,
        full_duration = config.store.full_duration,
        escalation_duration = config.alerting.escalation_duration,
        "configuration"
    );

    let (tcp, udp) = bind_sockets(&config).await?;
    let ctx = AppContext::new(config);
    let (queue_tx, queue_rx) = bounded(ctx.config.ingest.max_queue_size);
    let receiver: SharedReceiver = Arc::new(tokio::sync::Mutex::new(queue_rx));

    let engine = Analyzer::new(ctx.clone(), Box::new(LogAlertSink))?;

    // Graceful shutdown via Ctrl+C
    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received Ctrl+C, initiating shutdown");
        shutdown.cancel();
    });

    let mut task_set: JoinSet<Result<TaskName>> = JoinSet::new();
    spawn_listeners(&mut task_set, &ctx, &queue_tx, tcp, udp, &cancel);
    spawn_workers(&mut task_set, &ctx, &queue_tx, receiver, &cancel);

    let (roomba_ctx, roomba_engine, roomba_cancel) =
        (ctx.clone(), Arc::clone(&engine), cancel.clone());
    task_set.spawn(async move {
        run_roomba(roomba_ctx, roomba_engine, roomba_cancel).await;
        Ok(TaskName::Roomba)
    });

    let scheduler_cancel = cancel.clone();
    task_set.spawn(async move {
        engine.run(scheduler_cancel).await;
        Ok(TaskName::DetectionScheduler)
    });

    let result = run_supervisor(&mut task_set, cancel).await;

    info!(
        ingested = driftwatch::context::PipelineStats::get(&ctx.stats.samples_ingested),
        alerts = driftwatch::context::PipelineStats::get(&ctx.stats.alerts_fired),
        "driftwatch shutdown complete"
    );
    result
}
