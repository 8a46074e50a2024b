//! Server transfer engine.
//!
//! `SpeedTestServer` binds one TCP listener and one UDP socket on
//! OS-assigned ephemeral ports at startup and keeps them for the process
//! lifetime. It then runs three loops concurrently until cancelled: the
//! offer broadcaster, a TCP accept loop, and a UDP request loop. Every
//! accepted connection or valid request is handed to its own task; a
//! failing worker terminates only itself. The server carries no per-round
//! state and no cap on simultaneous workers.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, TransferConfig};
use crate::discovery::OfferBroadcaster;
use crate::protocol::{total_segments, Message};

/// The TCP size line must fit inside this many bytes, newline included.
/// A u64 in ASCII is at most 20 digits, so any legitimate request fits.
const SIZE_LINE_LIMIT: usize = 1024;

/// UDP requests are 13 bytes; anything near this bound is garbage anyway.
const REQUEST_BUF_LEN: usize = 1024;

// ---------------------------------------------------------------------------
// SpeedTestServer
// ---------------------------------------------------------------------------

/// The speed-test server: discovery broadcaster plus TCP and UDP transfer
/// engines sharing a pair of fixed ports.
pub struct SpeedTestServer {
    config: Config,
    tcp_listener: TcpListener,
    udp_socket: UdpSocket,
    tcp_port: u16,
    udp_port: u16,
}

impl SpeedTestServer {
    /// Bind the transfer ports. Both are OS-assigned ephemerals, chosen
    /// once and advertised in every offer.
    pub async fn bind(config: Config) -> Result<Self> {
        let tcp_listener = TcpListener::bind("0.0.0.0:0")
            .await
            .context("failed to bind TCP transfer listener")?;
        let udp_socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("failed to bind UDP transfer socket")?;

        let tcp_port = tcp_listener
            .local_addr()
            .context("failed to read TCP listener address")?
            .port();
        let udp_port = udp_socket
            .local_addr()
            .context("failed to read UDP socket address")?
            .port();

        info!(tcp_port, udp_port, "server transfer ports bound");

        Ok(Self {
            config,
            tcp_listener,
            udp_socket,
            tcp_port,
            udp_port,
        })
    }

    /// TCP transfer port advertised in offers.
    pub fn tcp_port(&self) -> u16 {
        self.tcp_port
    }

    /// UDP transfer port advertised in offers.
    pub fn udp_port(&self) -> u16 {
        self.udp_port
    }

    /// Run the broadcaster and both transfer loops until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let broadcaster =
            OfferBroadcaster::new(&self.config.discovery, self.udp_port, self.tcp_port)
                .await
                .context("failed to start offer broadcaster")?;

        let broadcast_task = tokio::spawn(broadcaster.run(cancel.clone()));
        let tcp_task = tokio::spawn(serve_tcp(
            self.tcp_listener,
            self.config.transfer.clone(),
            cancel.clone(),
        ));
        let udp_task = tokio::spawn(serve_udp(
            self.udp_socket,
            self.config.transfer.clone(),
            cancel.clone(),
        ));

        let (b, t, u) = tokio::join!(broadcast_task, tcp_task, udp_task);
        b.context("broadcast task panicked")?;
        t.context("TCP serve task panicked")?;
        u.context("UDP serve task panicked")?;

        info!("server stopped");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// TCP path
// ---------------------------------------------------------------------------

/// Accept loop: one task per connection, no admission control.
async fn serve_tcp(listener: TcpListener, config: TransferConfig, cancel: CancellationToken) {
    info!("TCP transfer engine listening");
    loop {
        let (stream, peer) = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("TCP accept loop cancelled");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    error!(error = %e, "failed to accept TCP connection");
                    continue;
                }
            },
        };

        let config = config.clone();
        tokio::spawn(async move {
            match tcp_worker(stream, &config).await {
                Ok(bytes) => info!(peer = %peer, bytes, "completed TCP transfer"),
                Err(e) => warn!(peer = %peer, error = %e, "TCP worker aborted"),
            }
        });
    }
}

/// One TCP session: read the size line, stream exactly that many filler
/// bytes, close.
async fn tcp_worker(mut stream: TcpStream, config: &TransferConfig) -> Result<u64> {
    let timeout = Duration::from_secs(config.size_line_timeout_secs);
    let file_size = read_size_line(&mut stream, timeout).await?;

    let mut rng = SmallRng::from_entropy();
    let mut chunk = vec![0u8; config.chunk_size];
    let mut sent: u64 = 0;
    while sent < file_size {
        let remaining = (file_size - sent) as usize;
        let current = remaining.min(chunk.len());
        rng.fill_bytes(&mut chunk[..current]);
        stream
            .write_all(&chunk[..current])
            .await
            .context("failed to stream payload")?;
        sent += current as u64;
    }

    stream.flush().await.context("failed to flush stream")?;
    Ok(sent)
}

/// Read the ASCII decimal size line.
///
/// The newline must appear within the first [`SIZE_LINE_LIMIT`] bytes and
/// within the idle timeout; otherwise the session is rejected rather than
/// mis-parsed.
async fn read_size_line(stream: &mut TcpStream, idle_timeout: Duration) -> Result<u64> {
    let mut buf = [0u8; SIZE_LINE_LIMIT];
    let mut filled = 0usize;

    let line_end = tokio::time::timeout(idle_timeout, async {
        loop {
            if let Some(pos) = buf[..filled].iter().position(|&b| b == b'\n') {
                return Ok(pos);
            }
            if filled == buf.len() {
                bail!("no newline within the first {SIZE_LINE_LIMIT} bytes");
            }
            let n = stream
                .read(&mut buf[filled..])
                .await
                .context("failed to read size line")?;
            if n == 0 {
                bail!("peer closed before sending a size line");
            }
            filled += n;
        }
    })
    .await
    .map_err(|_| anyhow::anyhow!("timed out waiting for size line"))??;

    let line = std::str::from_utf8(&buf[..line_end]).context("size line is not valid UTF-8")?;
    line.trim()
        .parse::<u64>()
        .with_context(|| format!("invalid size line: {:?}", line.trim()))
}

// ---------------------------------------------------------------------------
// UDP path
// ---------------------------------------------------------------------------

/// Request loop: decode each datagram, drop the malformed ones, spawn a
/// worker per valid request.
async fn serve_udp(socket: UdpSocket, config: TransferConfig, cancel: CancellationToken) {
    info!("UDP transfer engine listening");
    let mut buf = [0u8; REQUEST_BUF_LEN];
    loop {
        let (len, peer) = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("UDP request loop cancelled");
                return;
            }
            received = socket.recv_from(&mut buf) => match received {
                Ok(r) => r,
                Err(e) => {
                    error!(error = %e, "failed to receive UDP request");
                    continue;
                }
            },
        };

        match Message::decode(&buf[..len]) {
            Ok(Message::Request { file_size }) => {
                debug!(peer = %peer, file_size, "UDP transfer requested");
                let config = config.clone();
                tokio::spawn(async move {
                    match udp_worker(peer, file_size, &config).await {
                        Ok(segments) => {
                            info!(peer = %peer, file_size, segments, "completed UDP transfer")
                        }
                        Err(e) => warn!(peer = %peer, error = %e, "UDP worker aborted"),
                    }
                });
            }
            Ok(other) => {
                warn!(peer = %peer, message = ?other, "unexpected message on request port, ignoring");
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "corrupted UDP request, ignoring");
            }
        }
    }
}

/// One UDP session: unicast every segment in increasing index order from a
/// fresh socket. Fire-and-forget; the network is free to drop any of them.
async fn udp_worker(peer: SocketAddr, file_size: u64, config: &TransferConfig) -> Result<u64> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .context("failed to bind UDP send socket")?;

    let segments = total_segments(file_size, config.segment_size);
    let delay = Duration::from_micros(config.inter_packet_delay_us);
    let mut rng = SmallRng::from_entropy();
    let mut filler = vec![0u8; config.segment_size as usize];

    for index in 0..segments {
        let remaining = file_size - index * config.segment_size;
        let current = remaining.min(config.segment_size) as usize;
        rng.fill_bytes(&mut filler[..current]);

        let packet = Message::Payload {
            total_segments: segments,
            segment_index: index,
            payload: Bytes::copy_from_slice(&filler[..current]),
        }
        .encode();

        socket
            .send_to(&packet, peer)
            .await
            .context("failed to send payload segment")?;

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    Ok(segments)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = TcpStream::connect(addr).await.expect("connect");
        let (server, _) = listener.accept().await.expect("accept");
        (client, server)
    }

    #[tokio::test]
    async fn test_read_size_line_plain() {
        let (mut client, mut server) = socket_pair().await;
        client.write_all(b"1048576\n").await.expect("write");

        let size = read_size_line(&mut server, Duration::from_secs(2))
            .await
            .expect("size line should parse");
        assert_eq!(size, 1_048_576);
    }

    #[tokio::test]
    async fn test_read_size_line_split_across_writes() {
        let (mut client, mut server) = socket_pair().await;

        let reader = tokio::spawn(async move {
            read_size_line(&mut server, Duration::from_secs(2)).await
        });

        client.write_all(b"40").await.expect("write");
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.write_all(b"96\n").await.expect("write");

        let size = reader.await.expect("no panic").expect("should parse");
        assert_eq!(size, 4096);
    }

    #[tokio::test]
    async fn test_read_size_line_rejects_garbage() {
        let (mut client, mut server) = socket_pair().await;
        client.write_all(b"not a number\n").await.expect("write");

        let result = read_size_line(&mut server, Duration::from_secs(2)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_read_size_line_rejects_missing_newline() {
        let (mut client, mut server) = socket_pair().await;
        // Fill the whole window without ever sending a newline.
        client
            .write_all(&[b'9'; SIZE_LINE_LIMIT])
            .await
            .expect("write");

        let result = read_size_line(&mut server, Duration::from_secs(2)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_read_size_line_times_out() {
        let (_client, mut server) = socket_pair().await;

        let start = tokio::time::Instant::now();
        let result = read_size_line(&mut server, Duration::from_millis(100)).await;
        assert!(result.is_err());
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_tcp_worker_streams_exact_size() {
        let (mut client, server) = socket_pair().await;
        let config = TransferConfig::default();

        let worker = tokio::spawn(async move { tcp_worker(server, &config).await });

        client.write_all(b"30000\n").await.expect("write");

        let mut received = 0usize;
        let mut buf = [0u8; 8192];
        loop {
            let n = client.read(&mut buf).await.expect("read");
            if n == 0 {
                break;
            }
            received += n;
        }
        assert_eq!(received, 30_000);
        assert_eq!(worker.await.expect("no panic").expect("worker ok"), 30_000);
    }

    #[tokio::test]
    async fn test_udp_worker_sends_every_segment_in_order() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        let peer = receiver.local_addr().expect("addr");

        let config = TransferConfig {
            segment_size: 512,
            inter_packet_delay_us: 0,
            ..TransferConfig::default()
        };

        // 2100 bytes in 512-byte segments: 4 full + 1 short tail.
        let worker = tokio::spawn(async move { udp_worker(peer, 2100, &config).await });

        let mut buf = [0u8; 2048];
        for expected in 0..5u64 {
            let (len, _) = tokio::time::timeout(Duration::from_secs(2), receiver.recv_from(&mut buf))
                .await
                .expect("segment should arrive")
                .expect("recv");
            match Message::decode(&buf[..len]).expect("segment should decode") {
                Message::Payload {
                    total_segments,
                    segment_index,
                    payload,
                } => {
                    assert_eq!(total_segments, 5);
                    assert_eq!(segment_index, expected);
                    let want = if expected == 4 { 2100 - 4 * 512 } else { 512 };
                    assert_eq!(payload.len() as u64, want);
                }
                other => panic!("expected payload, got {other:?}"),
            }
        }

        assert_eq!(worker.await.expect("no panic").expect("worker ok"), 5);
    }

    #[tokio::test]
    async fn test_udp_worker_zero_size_sends_nothing() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        let peer = receiver.local_addr().expect("addr");

        let config = TransferConfig::default();
        let segments = udp_worker(peer, 0, &config).await.expect("worker ok");
        assert_eq!(segments, 0);

        let mut buf = [0u8; 64];
        let got = tokio::time::timeout(Duration::from_millis(200), receiver.recv_from(&mut buf)).await;
        assert!(got.is_err(), "no packet should have been sent");
    }
}
