//! Ingestion Pipeline Regression Tests
//!
//! End-to-end coverage of the network path: real sockets on loopback,
//! length-prefixed batch frames over TCP and single-record datagrams over
//! UDP, through the bounded queue and worker pool into the store. No binary
//! spawn; everything runs in-process against an [`AppContext`].

use driftwatch::config::Config;
use driftwatch::context::AppContext;
use driftwatch::ingest::codec::{encode_batch, encode_record};
use driftwatch::ingest::worker::{run_worker, SharedReceiver};
use driftwatch::ingest::{bounded, listen};
use driftwatch::types::Sample;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Poll until `cond` holds or the deadline passes.
async fn wait_until<F: Fn() -> bool>(cond: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached within deadline");
}

struct Pipeline {
    ctx: AppContext,
    tcp_addr: std::net::SocketAddr,
    udp_addr: std::net::SocketAddr,
    cancel: CancellationToken,
}

/// Bind loopback sockets and spawn listeners plus the worker pool.
async fn start_pipeline(config: Config) -> Pipeline {
    let ctx = AppContext::new(config);
    let cancel = CancellationToken::new();

    let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let tcp_addr = tcp.local_addr().unwrap();
    let udp_addr = udp.local_addr().unwrap();

    let (queue_tx, queue_rx) = bounded(ctx.config.ingest.max_queue_size);
    let receiver: SharedReceiver = Arc::new(tokio::sync::Mutex::new(queue_rx));

    tokio::spawn(listen::run_batch_listener(
        tcp,
        ctx.clone(),
        queue_tx.clone(),
        cancel.clone(),
    ));
    tokio::spawn(listen::run_datagram_listener(
        udp,
        ctx.clone(),
        queue_tx.clone(),
        cancel.clone(),
    ));
    for worker_number in 0..ctx.config.ingest.worker_processes {
        tokio::spawn(run_worker(
            worker_number,
            ctx.clone(),
            Arc::clone(&receiver),
            None,
            cancel.clone(),
        ));
    }

    Pipeline {
        ctx,
        tcp_addr,
        udp_addr,
        cancel,
    }
}

async fn send_frame(addr: std::net::SocketAddr, body: &[u8]) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(&(body.len() as u32).to_be_bytes())
        .await
        .unwrap();
    stream.write_all(body).await.unwrap();
    stream.flush().await.unwrap();
    // Keep the connection open until the frame is consumed downstream.
    tokio::time::sleep(Duration::from_millis(50)).await;
}

// ============================================================================
// Batch (TCP) path
// ============================================================================

#[tokio::test]
async fn batch_over_tcp_reaches_the_store() {
    let pipeline = start_pipeline(Config::default()).await;
    let now = unix_now();

    let records: Vec<(String, Sample)> = (0..5)
        .map(|i| (format!("web.srv{i}.hits"), Sample::new(now, i as f64)))
        .collect();
    send_frame(pipeline.tcp_addr, &encode_batch(&records)).await;

    let ctx = pipeline.ctx.clone();
    wait_until(|| ctx.store.metric_count() == 5).await;
    assert_eq!(ctx.stats.samples_ingested.load(Ordering::Relaxed), 5);
    assert_eq!(ctx.store.sample_count("web.srv0.hits"), 1);
    pipeline.cancel.cancel();
}

#[tokio::test]
async fn multiple_frames_on_one_connection() {
    let pipeline = start_pipeline(Config::default()).await;
    let now = unix_now();

    let mut stream = TcpStream::connect(pipeline.tcp_addr).await.unwrap();
    for i in 0..3 {
        let body = encode_batch(&[("conn.reuse".to_string(), Sample::new(now + i, 1.0))]);
        stream
            .write_all(&(body.len() as u32).to_be_bytes())
            .await
            .unwrap();
        stream.write_all(&body).await.unwrap();
    }
    stream.flush().await.unwrap();

    let ctx = pipeline.ctx.clone();
    wait_until(|| ctx.store.sample_count("conn.reuse") == 3).await;
    pipeline.cancel.cancel();
}

#[tokio::test]
async fn truncated_record_keeps_earlier_records() {
    let pipeline = start_pipeline(Config::default()).await;
    let now = unix_now();

    let mut body = encode_batch(&[
        ("good.one".to_string(), Sample::new(now, 1.0)),
        ("good.two".to_string(), Sample::new(now, 2.0)),
    ]);
    // Declare a record longer than the remaining bytes.
    body.extend_from_slice(&100u32.to_be_bytes());
    body.extend_from_slice(b"short");
    send_frame(pipeline.tcp_addr, &body).await;

    let ctx = pipeline.ctx.clone();
    wait_until(|| ctx.store.metric_count() == 2).await;
    assert_eq!(ctx.stats.decode_errors.load(Ordering::Relaxed), 1);
    pipeline.cancel.cancel();
}

// ============================================================================
// Datagram (UDP) path
// ============================================================================

#[tokio::test]
async fn datagram_reaches_the_store() {
    let pipeline = start_pipeline(Config::default()).await;
    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    sender
        .send_to(
            &encode_record("udp.metric", Sample::new(unix_now(), 7.0)),
            pipeline.udp_addr,
        )
        .await
        .unwrap();

    let ctx = pipeline.ctx.clone();
    wait_until(|| ctx.store.sample_count("udp.metric") == 1).await;
    pipeline.cancel.cancel();
}

#[tokio::test]
async fn malformed_datagram_is_counted_not_fatal() {
    let pipeline = start_pipeline(Config::default()).await;
    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    sender.send_to(b"{not json", pipeline.udp_addr).await.unwrap();
    sender
        .send_to(
            &encode_record("still.alive", Sample::new(unix_now(), 1.0)),
            pipeline.udp_addr,
        )
        .await
        .unwrap();

    let ctx = pipeline.ctx.clone();
    wait_until(|| ctx.store.sample_count("still.alive") == 1).await;
    assert_eq!(ctx.stats.decode_errors.load(Ordering::Relaxed), 1);
    pipeline.cancel.cancel();
}

// ============================================================================
// Overload and bad data
// ============================================================================

#[tokio::test]
async fn full_queue_drops_newest_without_blocking() {
    // Tiny queue, no workers draining it.
    let ctx = AppContext::new(Config::default());
    let cancel = CancellationToken::new();
    let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = tcp.local_addr().unwrap();
    let (queue_tx, _queue_rx) = bounded(4);
    let counters = queue_tx.clone();
    tokio::spawn(listen::run_batch_listener(tcp, ctx, queue_tx, cancel.clone()));

    let now = unix_now();
    let records: Vec<(String, Sample)> = (0..10)
        .map(|i| (format!("flood.{i}"), Sample::new(now, 1.0)))
        .collect();
    send_frame(addr, &encode_batch(&records)).await;

    wait_until(|| counters.dropped() == 6).await;
    assert_eq!(counters.depth(), 4);
    cancel.cancel();
}

#[tokio::test]
async fn ancient_samples_are_discarded_at_the_worker() {
    let pipeline = start_pipeline(Config::default()).await;
    let now = unix_now();
    let body = encode_batch(&[
        ("fresh.metric".to_string(), Sample::new(now, 1.0)),
        // Way past max_resolution: bad client clock or replayed data.
        ("fresh.metric".to_string(), Sample::new(now - 50_000, 2.0)),
    ]);
    send_frame(pipeline.tcp_addr, &body).await;

    let ctx = pipeline.ctx.clone();
    wait_until(|| ctx.stats.samples_discarded_old.load(Ordering::Relaxed) == 1).await;
    assert_eq!(ctx.store.sample_count("fresh.metric"), 1);
    pipeline.cancel.cancel();
}

#[tokio::test]
async fn skip_listed_namespace_is_dropped_end_to_end() {
    let mut config = Config::default();
    config.ingest.skip_list = vec!["carbon".to_string()];
    let pipeline = start_pipeline(config).await;
    let now = unix_now();
    let body = encode_batch(&[
        ("stats.carbon.cpu".to_string(), Sample::new(now, 1.0)),
        ("web.hits".to_string(), Sample::new(now, 1.0)),
    ]);
    send_frame(pipeline.tcp_addr, &body).await;

    let ctx = pipeline.ctx.clone();
    wait_until(|| ctx.store.sample_count("web.hits") == 1).await;
    assert_eq!(ctx.store.sample_count("stats.carbon.cpu"), 0);
    assert_eq!(ctx.stats.samples_skipped_namespace.load(Ordering::Relaxed), 1);
    pipeline.cancel.cancel();
}

// ============================================================================
// Canary
// ============================================================================

#[tokio::test(start_paused = true)]
async fn canary_metrics_flow_through_the_queue() {
    let ctx = AppContext::new(Config::default());
    let cancel = CancellationToken::new();
    let (queue_tx, queue_rx) = bounded(16);
    let receiver: SharedReceiver = Arc::new(tokio::sync::Mutex::new(queue_rx));
    let worker = tokio::spawn(run_worker(
        0,
        ctx.clone(),
        receiver,
        Some(queue_tx),
        cancel.clone(),
    ));

    // First canary tick fires immediately; poll until the worker drains it.
    let poll_ctx = ctx.clone();
    wait_until(move || {
        poll_ctx.store.sample_count("driftwatch.self.queue_depth") >= 1
            && poll_ctx.store.sample_count("driftwatch.self.ingest_rate") >= 1
    })
    .await;

    cancel.cancel();
    worker.await.unwrap();
}

// ============================================================================
// Roomba interplay with ingestion
// ============================================================================

#[tokio::test]
async fn roomba_prunes_what_ingestion_retained() {
    let ctx = AppContext::new(Config::default());
    let now = unix_now();
    let horizon = ctx.config.retention_seconds();

    ctx.store
        .append("old.series", Sample::new(now - horizon - 100, 1.0), now);
    ctx.store.append("old.series", Sample::new(now, 2.0), now);

    let summary = driftwatch::background::sweep(&ctx, now);
    assert_eq!(summary.samples_evicted, 1);
    assert_eq!(ctx.store.sample_count("old.series"), 1);
}
