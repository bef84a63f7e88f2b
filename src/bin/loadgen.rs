//! Synthetic metric load generator for exercising a running daemon.
//!
//! Emits a population of noisy gauges plus a monotone counter, batched over
//! TCP each tick, with an optional spike injected into one metric after a
//! delay so an end-to-end alert can be provoked on demand.
//!
//! ```bash
//! cargo run --release --bin loadgen -- --target 127.0.0.1:2024 \
//!     --metrics 50 --spike-after 120
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use driftwatch::ingest::codec::{encode_batch, encode_record};
use driftwatch::types::Sample;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "loadgen")]
#[command(about = "Synthetic metric load generator")]
#[command(version)]
struct CliArgs {
    /// Batch (TCP) listener to send to
    #[arg(long, default_value = "127.0.0.1:2024")]
    target: String,

    /// Datagram (UDP) listener; omit to skip datagram traffic
    #[arg(long)]
    udp_target: Option<String>,

    /// Number of synthetic gauge metrics
    #[arg(long, default_value = "25")]
    metrics: usize,

    /// Seconds between batches
    #[arg(long, default_value = "1")]
    interval: u64,

    /// Inject a 100x spike into the first gauge after this many seconds
    /// (0 disables the spike)
    #[arg(long, default_value = "0")]
    spike_after: u64,

    /// RNG seed, for reproducible runs
    #[arg(long, default_value = "42")]
    seed: u64,
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// One tick's worth of samples: noisy sinusoid gauges plus a counter.
fn generate(args: &CliArgs, rng: &mut StdRng, tick: u64, counter: &mut f64) -> Vec<(String, Sample)> {
    let now = unix_now();
    let mut records = Vec::with_capacity(args.metrics + 1);
    for i in 0..args.metrics {
        let phase = (tick as f64 / 60.0 + i as f64).sin();
        let mut value = 100.0 + 10.0 * phase + rng.gen_range(-2.0..2.0);
        if i == 0 && args.spike_after > 0 && tick * args.interval >= args.spike_after {
            value *= 100.0;
        }
        records.push((format!("loadgen.gauge.{i}"), Sample::new(now, value)));
    }
    *counter += rng.gen_range(10.0..30.0);
    records.push(("loadgen.requests.total".to_string(), Sample::new(now, *counter)));
    records
}

async fn send_batch(stream: &mut TcpStream, records: &[(String, Sample)]) -> Result<()> {
    let body = encode_batch(records);
    stream
        .write_all(&(body.len() as u32).to_be_bytes())
        .await
        .context("writing frame header")?;
    stream.write_all(&body).await.context("writing frame body")?;
    Ok(())
}

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
    let mut rng = StdRng::seed_from_u64(args.seed);

    let mut stream = TcpStream::connect(&args.target)
        .await
        .with_context(|| format!("connecting to {}", args.target))?;
    info!(target = %args.target, metrics = args.metrics, "load generator connected");

    let udp = match &args.udp_target {
        Some(addr) => {
            let socket = UdpSocket::bind("0.0.0.0:0").await.context("binding UDP")?;
            socket
                .connect(addr)
                .await
                .with_context(|| format!("connecting UDP to {addr}"))?;
            Some(socket)
        }
        None => None,
    };

    let mut counter = 0.0;
    let mut tick: u64 = 0;
    let mut ticker = tokio::time::interval(Duration::from_secs(args.interval.max(1)));
    loop {
        ticker.tick().await;
        let records = generate(&args, &mut rng, tick, &mut counter);
        send_batch(&mut stream, &records).await?;

        if let Some(socket) = &udp {
            // A single datagram record per tick keeps the UDP path warm.
            let (metric, sample) = &records[0];
            socket
                .send(&encode_record(metric, *sample))
                .await
                .context("sending datagram")?;
        }

        if tick % 60 == 0 {
            info!(tick, sent = records.len(), "batch sent");
        }
        tick += 1;
    }
}
