//! UDP service discovery: the server-side offer broadcaster and the
//! client-side listener.
//!
//! The server broadcasts an Offer carrying its transfer ports once per
//! interval on the well-known discovery port. Clients bind that port with
//! address and port reuse (several clients can share one host) and take the
//! first offer that decodes cleanly.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DiscoveryConfig;
use crate::protocol::Message;

/// A server captured from its Offer broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveredServer {
    pub address: IpAddr,
    pub tcp_port: u16,
    pub udp_port: u16,
}

// ---------------------------------------------------------------------------
// Broadcaster (server)
// ---------------------------------------------------------------------------

/// Periodically broadcasts the server's Offer message.
pub struct OfferBroadcaster {
    socket: UdpSocket,
    target: SocketAddr,
    offer: Bytes,
    interval: Duration,
}

impl OfferBroadcaster {
    /// Bind a broadcast-capable socket and pre-encode the Offer for the
    /// given transfer ports.
    pub async fn new(config: &DiscoveryConfig, udp_port: u16, tcp_port: u16) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("failed to bind broadcast socket")?;
        socket
            .set_broadcast(true)
            .context("failed to enable SO_BROADCAST")?;

        let addr: IpAddr = config
            .broadcast_address
            .parse()
            .with_context(|| format!("invalid broadcast address: {}", config.broadcast_address))?;

        Ok(Self {
            socket,
            target: SocketAddr::new(addr, config.port),
            offer: Message::Offer { udp_port, tcp_port }.encode(),
            interval: Duration::from_secs(config.offer_interval_secs),
        })
    }

    /// Send one Offer per interval until cancelled.
    ///
    /// A failed send logs and continues; only cancellation stops the loop.
    pub async fn run(self, cancel: CancellationToken) {
        info!(target = %self.target, "offer broadcaster started");
        loop {
            if let Err(e) = self.socket.send_to(&self.offer, self.target).await {
                warn!(error = %e, "failed to broadcast offer");
            }
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("offer broadcaster cancelled");
                    return;
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Listener (client)
// ---------------------------------------------------------------------------

/// Bind a UDP socket on the discovery port with SO_REUSEADDR (and
/// SO_REUSEPORT on unix) so co-located listeners can share it.
pub fn bind_discovery_socket(port: u16) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .context("failed to create discovery socket")?;
    socket
        .set_reuse_address(true)
        .context("failed to set SO_REUSEADDR")?;
    #[cfg(unix)]
    socket
        .set_reuse_port(true)
        .context("failed to set SO_REUSEPORT")?;

    let addr: SocketAddr = SocketAddr::from(([0, 0, 0, 0], port));
    socket
        .bind(&addr.into())
        .with_context(|| format!("failed to bind discovery socket on {addr}"))?;
    socket
        .set_nonblocking(true)
        .context("failed to set discovery socket non-blocking")?;

    UdpSocket::from_std(socket.into()).context("failed to register discovery socket with tokio")
}

/// Block until the first valid Offer arrives on the discovery port.
///
/// Malformed datagrams and non-Offer messages are logged and skipped; the
/// first Offer that decodes wins, with no deduplication or best-of-N
/// selection. Returns `None` if cancelled before an offer arrives.
pub async fn wait_for_offer(
    config: &DiscoveryConfig,
    cancel: &CancellationToken,
) -> Result<Option<DiscoveredServer>> {
    let socket = bind_discovery_socket(config.port)?;
    Ok(recv_offer(&socket, cancel).await)
}

/// Receive loop behind [`wait_for_offer`]. Receive failures log and keep
/// the loop alive; only cancellation stops it.
async fn recv_offer(socket: &UdpSocket, cancel: &CancellationToken) -> Option<DiscoveredServer> {
    let mut buf = [0u8; 1024];

    loop {
        let (len, from) = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("discovery listener cancelled");
                return None;
            }
            result = socket.recv_from(&mut buf) => match result {
                Ok(received) => received,
                Err(e) => {
                    warn!(error = %e, "discovery receive failed, still listening");
                    continue;
                }
            },
        };

        match Message::decode(&buf[..len]) {
            Ok(Message::Offer { udp_port, tcp_port }) => {
                info!(server = %from.ip(), tcp_port, udp_port, "received offer");
                return Some(DiscoveredServer {
                    address: from.ip(),
                    tcp_port,
                    udp_port,
                });
            }
            Ok(other) => {
                warn!(from = %from, message = ?other, "unexpected message on discovery port, ignoring");
            }
            Err(e) => {
                warn!(from = %from, error = %e, "corrupted offer packet, ignoring");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MAGIC_COOKIE;

    /// Grab a free UDP port from the OS.
    fn free_udp_port() -> u16 {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").expect("bind");
        socket.local_addr().expect("local_addr").port()
    }

    fn test_config(port: u16) -> DiscoveryConfig {
        DiscoveryConfig {
            port,
            broadcast_address: "127.0.0.1".to_string(),
            offer_interval_secs: 1,
        }
    }

    #[tokio::test]
    async fn test_listener_takes_first_valid_offer() {
        let port = free_udp_port();
        let config = test_config(port);
        let cancel = CancellationToken::new();

        let sender = UdpSocket::bind("127.0.0.1:0").await.expect("bind sender");
        let target = format!("127.0.0.1:{port}");

        let listen = tokio::spawn({
            let config = config.clone();
            let cancel = cancel.clone();
            async move { wait_for_offer(&config, &cancel).await }
        });

        // Corrupted cookie first; the listener must skip it and stay alive.
        let mut bogus = Message::Offer {
            udp_port: 1,
            tcp_port: 2,
        }
        .encode()
        .to_vec();
        bogus[0] ^= 0xff;
        assert_ne!(
            u32::from_be_bytes([bogus[0], bogus[1], bogus[2], bogus[3]]),
            MAGIC_COOKIE
        );

        // Give the listener time to bind before sending.
        tokio::time::sleep(Duration::from_millis(50)).await;
        sender.send_to(&bogus, &target).await.expect("send bogus");
        sender
            .send_to(
                &Message::Offer {
                    udp_port: 31001,
                    tcp_port: 31002,
                }
                .encode(),
                &target,
            )
            .await
            .expect("send offer");

        let discovered = tokio::time::timeout(Duration::from_secs(2), listen)
            .await
            .expect("listener should finish")
            .expect("task should not panic")
            .expect("listen should succeed")
            .expect("an offer should have been accepted");

        assert_eq!(discovered.udp_port, 31001);
        assert_eq!(discovered.tcp_port, 31002);
    }

    #[tokio::test]
    async fn test_listener_returns_none_on_cancel() {
        let config = test_config(free_udp_port());
        let cancel = CancellationToken::new();

        let listen = tokio::spawn({
            let config = config.clone();
            let cancel = cancel.clone();
            async move { wait_for_offer(&config, &cancel).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), listen)
            .await
            .expect("listener should exit promptly after cancel")
            .expect("task should not panic")
            .expect("listen should succeed");
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_listener_survives_receive_error() {
        // Connect the listening socket to a peer port, then close that
        // port and send into it: the ICMP port-unreachable comes back as
        // an ECONNREFUSED on the next receive. The loop must shrug it off
        // and still accept a later offer.
        let peer = UdpSocket::bind("127.0.0.1:0").await.expect("peer bind");
        let peer_addr = peer.local_addr().expect("peer addr");

        let listener = UdpSocket::bind("127.0.0.1:0").await.expect("listener bind");
        let listener_addr = listener.local_addr().expect("listener addr");
        listener.connect(peer_addr).await.expect("connect");
        drop(peer);

        listener.send(b"ping").await.expect("send");
        tokio::time::sleep(Duration::from_millis(50)).await;

        let cancel = CancellationToken::new();
        let listen = tokio::spawn({
            let cancel = cancel.clone();
            async move { recv_offer(&listener, &cancel).await }
        });

        // Reclaim the peer port and deliver a valid offer.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let revived = UdpSocket::bind(peer_addr).await.expect("rebind peer port");
        revived
            .send_to(
                &Message::Offer {
                    udp_port: 50001,
                    tcp_port: 50002,
                }
                .encode(),
                listener_addr,
            )
            .await
            .expect("send offer");

        let discovered = tokio::time::timeout(Duration::from_secs(2), listen)
            .await
            .expect("listener should still be alive after the receive error")
            .expect("task should not panic")
            .expect("an offer should have been accepted");
        assert_eq!(discovered.udp_port, 50001);
        assert_eq!(discovered.tcp_port, 50002);
    }

    #[tokio::test]
    async fn test_broadcaster_emits_decodable_offers() {
        let port = free_udp_port();
        let config = test_config(port);

        // Listener first so the broadcast has somewhere to land.
        let receiver = bind_discovery_socket(port).expect("bind receiver");

        let broadcaster = OfferBroadcaster::new(&config, 40001, 40002)
            .await
            .expect("broadcaster should bind");
        let cancel = CancellationToken::new();
        let task = tokio::spawn(broadcaster.run(cancel.clone()));

        let mut buf = [0u8; 64];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), receiver.recv_from(&mut buf))
            .await
            .expect("an offer should arrive within the interval")
            .expect("recv");

        match Message::decode(&buf[..len]) {
            Ok(Message::Offer { udp_port, tcp_port }) => {
                assert_eq!(udp_port, 40001);
                assert_eq!(tcp_port, 40002);
            }
            other => panic!("expected offer, got {other:?}"),
        }

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("broadcaster should stop promptly after cancel")
            .expect("task should not panic");
    }

    #[tokio::test]
    async fn test_two_listeners_share_the_discovery_port() {
        let port = free_udp_port();
        let first = bind_discovery_socket(port).expect("first bind");
        let second = bind_discovery_socket(port).expect("second bind must succeed via port reuse");
        drop(first);
        drop(second);
    }
}
