//! Network listeners.
//!
//! Two independent endpoints share the ingestion queue: a TCP listener for
//! length-prefixed batch frames over persistent connections, and a UDP
//! listener for single-record datagrams. A malformed message is logged and
//! dropped; neither listener ever dies over bad input.

use super::codec;
use super::queue::QueueSender;
use crate::context::AppContext;
use std::sync::atomic::Ordering;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Hard cap on one batch frame. Anything larger is a protocol violation and
/// drops the connection rather than buffering it.
const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Accept loop for the batch (TCP) endpoint.
pub async fn run_batch_listener(
    listener: TcpListener,
    ctx: AppContext,
    queue: QueueSender,
    cancel: CancellationToken,
) {
    info!(addr = %local_addr_str(&listener), "batch listener up");
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "batch connection accepted");
                    let conn_ctx = ctx.clone();
                    let conn_queue = queue.clone();
                    let conn_cancel = cancel.clone();
                    tokio::spawn(async move {
                        serve_batch_connection(stream, conn_ctx, conn_queue, conn_cancel).await;
                        debug!(%peer, "batch connection closed");
                    });
                }
                Err(e) => {
                    warn!(error = %e, "batch accept failed, continuing");
                }
            },
        }
    }
    info!("batch listener stopped");
}

/// Read frames off one connection until EOF, protocol violation, or shutdown.
async fn serve_batch_connection(
    mut stream: TcpStream,
    ctx: AppContext,
    queue: QueueSender,
    cancel: CancellationToken,
) {
    let max_items = ctx.config.ingest.max_batch_items;
    let mut body = Vec::new();
    loop {
        let mut len_bytes = [0u8; 4];
        tokio::select! {
            () = cancel.cancelled() => return,
            read = stream.read_exact(&mut len_bytes) => {
                if read.is_err() {
                    return; // EOF or reset; peers reconnect at will
                }
            }
        }
        let frame_len = u32::from_be_bytes(len_bytes) as usize;
        if frame_len > MAX_FRAME_BYTES {
            warn!(frame_len, "batch frame exceeds cap, dropping connection");
            return;
        }
        body.resize(frame_len, 0);
        if stream.read_exact(&mut body).await.is_err() {
            warn!("connection dropped mid-frame");
            return;
        }

        let decoded = codec::decode_batch(&body, max_items);
        if let Some(fault) = decoded.fault {
            ctx.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
            warn!(
                offset = fault.offset,
                error = %fault.error,
                kept = decoded.records.len(),
                "partial batch decode"
            );
        }
        for record in decoded.records {
            queue.try_push(record);
        }
        ctx.stats
            .last_queue_size
            .store(queue.depth() as u64, Ordering::Relaxed);
    }
}

/// Receive loop for the datagram (UDP) endpoint.
pub async fn run_datagram_listener(
    socket: UdpSocket,
    ctx: AppContext,
    queue: QueueSender,
    cancel: CancellationToken,
) {
    info!(
        addr = %socket.local_addr().map_or_else(|_| "?".to_string(), |a| a.to_string()),
        "datagram listener up"
    );
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => {
                let (n, peer) = match received {
                    Ok(ok) => ok,
                    Err(e) => {
                        warn!(error = %e, "datagram recv failed, continuing");
                        continue;
                    }
                };
                match codec::decode_record(&buf[..n]) {
                    Ok(record) => {
                        queue.try_push(record);
                    }
                    Err(e) => {
                        ctx.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                        debug!(%peer, error = %e, "dropped malformed datagram");
                    }
                }
                ctx.stats
                    .last_queue_size
                    .store(queue.depth() as u64, Ordering::Relaxed);
            }
        }
    }
    info!("datagram listener stopped");
}

fn local_addr_str(listener: &TcpListener) -> String {
    listener
        .local_addr()
        .map_or_else(|_| "?".to_string(), |a| a.to_string())
}
