//! Client transfer engine and round loop.
//!
//! A round is one discovery-to-report cycle: wait for the first valid
//! offer, fan out the requested number of parallel TCP and UDP transfer
//! workers against it, join them all, then drain the statistics queue
//! through the reporter. Reporting never starts before every worker has
//! terminated, and a failed worker aborts only itself.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, TransferConfig};
use crate::discovery::{self, DiscoveredServer};
use crate::protocol::Message;
use crate::stats::{Reporter, StatsCollector, StatsSink, TransferKind, TransferStats};

/// Receive buffer large enough for any UDP datagram a server might send.
const RECV_BUF_LEN: usize = 65536;

// ---------------------------------------------------------------------------
// Errors and parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ClientError {
    /// Round parameters that can never produce a meaningful measurement.
    /// Rejected before anything is spawned; the process never crashes on
    /// bad input.
    #[error("invalid round parameters: {0}")]
    InvalidParams(String),

    /// A UDP worker's inactivity window closed without a single valid
    /// payload header, so the segment count is unknown. No stats are
    /// emitted for such a transfer.
    #[error("no valid payload header arrived before the inactivity window closed")]
    IncompleteTransfer,
}

/// Parameters for one client round.
#[derive(Debug, Clone, Copy)]
pub struct RoundParams {
    pub file_size: u64,
    pub tcp_conns: u32,
    pub udp_conns: u32,
}

impl RoundParams {
    /// Validate the invariants: a positive file size and at least one
    /// connection overall.
    pub fn new(file_size: u64, tcp_conns: u32, udp_conns: u32) -> Result<Self, ClientError> {
        if file_size == 0 {
            return Err(ClientError::InvalidParams(
                "file size must be positive".to_string(),
            ));
        }
        if tcp_conns == 0 && udp_conns == 0 {
            return Err(ClientError::InvalidParams(
                "at least one TCP or UDP connection is required".to_string(),
            ));
        }
        Ok(Self {
            file_size,
            tcp_conns,
            udp_conns,
        })
    }
}

// ---------------------------------------------------------------------------
// SpeedTestClient
// ---------------------------------------------------------------------------

/// The speed-test client: repeats discovery/transfer/report rounds with a
/// fixed parameter set until cancelled.
pub struct SpeedTestClient {
    config: Config,
    params: RoundParams,
    sink: StatsSink,
    collector: StatsCollector,
}

impl SpeedTestClient {
    pub fn new(config: Config, params: RoundParams) -> Self {
        let (sink, collector) = StatsCollector::channel();
        Self {
            config,
            params,
            sink,
            collector,
        }
    }

    /// Round loop: listen for an offer, transfer, report, listen again.
    /// Returns once `cancel` fires.
    pub async fn run(&mut self, reporter: &dyn Reporter, cancel: CancellationToken) -> Result<()> {
        info!("client started, listening for offers");
        loop {
            let Some(server) = discovery::wait_for_offer(&self.config.discovery, &cancel).await?
            else {
                info!("client stopped");
                return Ok(());
            };

            self.run_round(server, reporter).await;
            info!("all transfers complete, listening for offers");

            if cancel.is_cancelled() {
                info!("client stopped");
                return Ok(());
            }
        }
    }

    /// Run one round against an accepted offer and report it.
    ///
    /// Returns the number of stats records drained. All workers are joined
    /// before the drain, so every record enqueued this round is reported
    /// exactly once and the queue is empty for the next round.
    pub async fn run_round(&mut self, server: DiscoveredServer, reporter: &dyn Reporter) -> usize {
        let tcp_addr = SocketAddr::new(server.address, server.tcp_port);
        let udp_addr = SocketAddr::new(server.address, server.udp_port);

        let mut workers = Vec::with_capacity((self.params.tcp_conns + self.params.udp_conns) as usize);

        for i in 0..self.params.tcp_conns {
            workers.push(tokio::spawn(tcp_transfer(
                tcp_addr,
                self.params.file_size,
                i + 1,
                self.config.transfer.clone(),
                self.sink.clone(),
            )));
        }
        for i in 0..self.params.udp_conns {
            workers.push(tokio::spawn(udp_transfer(
                udp_addr,
                self.params.file_size,
                i + 1,
                self.config.transfer.clone(),
                self.sink.clone(),
            )));
        }

        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "transfer worker panicked");
            }
        }

        self.collector.drain(reporter)
    }
}

// ---------------------------------------------------------------------------
// TCP worker
// ---------------------------------------------------------------------------

async fn tcp_transfer(
    server: SocketAddr,
    file_size: u64,
    transfer_num: u32,
    config: TransferConfig,
    sink: StatsSink,
) {
    match run_tcp_transfer(server, file_size, &config).await {
        Ok((elapsed, received)) => {
            debug!(transfer_num, received, elapsed, "TCP transfer finished");
            sink.record(TransferStats {
                kind: TransferKind::Tcp,
                transfer_num,
                elapsed_secs: elapsed,
                bits_per_second: (file_size * 8) as f64 / elapsed,
                packets_received_percent: None,
            });
        }
        Err(e) => warn!(transfer_num, error = %e, "TCP transfer failed"),
    }
}

/// Connect, send the size line, read until `file_size` bytes arrived or the
/// peer closed early. Early close just ends the transfer with whatever
/// arrived; the speed is still computed against the nominal size.
///
/// The read loop deliberately has no idle bound: a server that stalls
/// mid-stream holds the worker (and the round's join barrier) until the
/// peer closes. Only the pre-transfer size-line wait is bounded.
async fn run_tcp_transfer(
    server: SocketAddr,
    file_size: u64,
    config: &TransferConfig,
) -> Result<(f64, u64)> {
    let start = Instant::now();

    let connect_timeout = Duration::from_secs(config.connect_timeout_secs);
    let mut stream = tokio::time::timeout(connect_timeout, TcpStream::connect(server))
        .await
        .map_err(|_| anyhow::anyhow!("connect to {server} timed out"))?
        .with_context(|| format!("failed to connect to {server}"))?;

    stream
        .write_all(format!("{file_size}\n").as_bytes())
        .await
        .context("failed to send size request")?;

    let mut received: u64 = 0;
    let mut buf = vec![0u8; config.chunk_size];
    while received < file_size {
        let n = stream.read(&mut buf).await.context("receive failed")?;
        if n == 0 {
            debug!(received, file_size, "peer closed early");
            break;
        }
        received += n as u64;
    }

    Ok((start.elapsed().as_secs_f64(), received))
}

// ---------------------------------------------------------------------------
// UDP worker
// ---------------------------------------------------------------------------

async fn udp_transfer(
    server: SocketAddr,
    file_size: u64,
    transfer_num: u32,
    config: TransferConfig,
    sink: StatsSink,
) {
    match run_udp_transfer(server, file_size, &config).await {
        Ok((elapsed, percent)) => {
            debug!(transfer_num, elapsed, percent, "UDP transfer finished");
            sink.record(TransferStats {
                kind: TransferKind::Udp,
                transfer_num,
                elapsed_secs: elapsed,
                bits_per_second: (file_size * 8) as f64 / elapsed,
                packets_received_percent: Some(percent),
            });
        }
        Err(e) => warn!(transfer_num, error = %e, "UDP transfer failed"),
    }
}

/// Send the request, then receive until a full inactivity window passes
/// with no new packet. That silence is the only end-of-transfer signal the
/// wire provides; there is no explicit completion message.
async fn run_udp_transfer(
    server: SocketAddr,
    file_size: u64,
    config: &TransferConfig,
) -> Result<(f64, f64)> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .context("failed to bind UDP transfer socket")?;

    let start = Instant::now();
    socket
        .send_to(&Message::Request { file_size }.encode(), server)
        .await
        .context("failed to send transfer request")?;

    let inactivity = Duration::from_millis(config.inactivity_timeout_ms);
    let mut buf = vec![0u8; RECV_BUF_LEN];
    let mut seen: HashSet<u64> = HashSet::new();
    let mut total_segments: Option<u64> = None;

    loop {
        let (len, from) = match tokio::time::timeout(inactivity, socket.recv_from(&mut buf)).await {
            // A full window with no arrival: the transfer is over.
            Err(_) => break,
            Ok(received) => received.context("receive failed")?,
        };

        match Message::decode(&buf[..len]) {
            Ok(Message::Payload {
                total_segments: total,
                segment_index,
                ..
            }) => {
                total_segments = Some(total);
                // Duplicate indices overwrite; the distinct count is unchanged.
                seen.insert(segment_index);
            }
            Ok(other) => {
                warn!(from = %from, message = ?other, "unexpected message during transfer, ignoring");
            }
            Err(e) => {
                warn!(from = %from, error = %e, "corrupted payload packet, ignoring");
            }
        }
    }

    let elapsed = start.elapsed().as_secs_f64();
    let total = total_segments.ok_or(ClientError::IncompleteTransfer)?;
    let percent = if total == 0 {
        100.0
    } else {
        seen.len() as f64 / total as f64 * 100.0
    };

    Ok((elapsed, percent))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
