//! UDP transport (`udp:<host>:<port>`).
//!
//! # Design Decisions
//! - Listening binds one socket and demultiplexes datagrams by peer address;
//!   the first datagram from a new peer produces a new inbound connection
//! - A peer whose connection was dropped starts a fresh one with its next datagram
//! - Entries for dropped connections are pruned whenever a new peer arrives, so
//!   peers that went silent do not accumulate
//! - Datagrams for a peer whose queue is full are dropped, as the network would

pub mod session;

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::address::hostport::bindable_address;
use crate::address::{host_port_string, parse_address_host_port, Address, AddressParser};
use crate::config::Configuration;
use crate::error::{Result, TransportError};
use crate::lifecycle::ShutdownSignal;
use crate::net::binding::{resolve_local_binding, with_timeout};
use crate::net::listener::{AcceptFn, Closer, ListenerHandle};
use crate::net::{Connection, ConnectionDetail, Identity, StreamConnection};

pub use session::UdpSession;

pub const TYPE: &str = "udp";

/// Datagrams queued per peer before new ones are dropped.
const SESSION_QUEUE: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpAddress {
    hostname: String,
    port: u16,
}

impl UdpAddress {
    async fn resolve(&self) -> Result<SocketAddr> {
        let target = bindable_address(&self.hostname, self.port);
        let found = tokio::net::lookup_host(target.as_str()).await?.next();
        found.ok_or_else(|| TransportError::parse(TYPE, &self.to_string(), "host did not resolve"))
    }

    async fn dial_from(&self, name: &str, local_binding: &str, timeout: Duration) -> Result<Box<dyn Connection>> {
        let local = resolve_local_binding(local_binding)?;
        with_timeout("udp dial", timeout, async {
            let destination = self.resolve().await?;
            let local = SocketAddr::new(local.unwrap_or_else(|| unspecified_like(destination)), 0);

            let socket = UdpSocket::bind(local).await?;
            socket.connect(destination).await?;

            tracing::debug!(name, destination = %destination, "udp socket connected");
            let detail = ConnectionDetail::new(format!("{TYPE}:{destination}"), false, name);
            Ok::<_, TransportError>(StreamConnection::new(UdpSession::connected(socket, destination), detail).boxed())
        })
        .await
    }
}

fn unspecified_like(addr: SocketAddr) -> IpAddr {
    match addr {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

impl fmt::Display for UdpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{TYPE}:{}", host_port_string(&self.hostname, self.port))
    }
}

#[async_trait]
impl Address for UdpAddress {
    async fn dial(
        &self,
        name: &str,
        _identity: Option<&Identity>,
        timeout: Duration,
        _config: &Configuration,
    ) -> Result<Box<dyn Connection>> {
        self.dial_from(name, "", timeout).await
    }

    async fn dial_with_local_binding(
        &self,
        name: &str,
        local_binding: &str,
        _identity: Option<&Identity>,
        timeout: Duration,
        _config: &Configuration,
    ) -> Result<Box<dyn Connection>> {
        self.dial_from(name, local_binding, timeout).await
    }

    async fn listen(
        &self,
        name: &str,
        _identity: Option<&Identity>,
        accept: AcceptFn,
        _config: &Configuration,
    ) -> Result<Box<dyn Closer>> {
        let bind_address = self.resolve().await?;
        let socket = UdpSocket::bind(bind_address)
            .await
            .map_err(|source| TransportError::Bind {
                address: bind_address.to_string(),
                source,
            })?;

        let handle = ListenerHandle::new(TYPE, socket.local_addr()?);
        tracing::info!(name, bind_address = %bind_address, "udp listener started");
        tokio::spawn(demux_loop(name.to_string(), Arc::new(socket), accept, handle.signal()));
        Ok(Box::new(handle))
    }

    fn protocol_type(&self) -> &'static str {
        TYPE
    }

    fn hostname(&self) -> &str {
        &self.hostname
    }

    fn port(&self) -> u16 {
        self.port
    }
}

async fn demux_loop(name: String, socket: Arc<UdpSocket>, accept: AcceptFn, mut shutdown: ShutdownSignal) {
    let mut sessions = SessionTable::default();
    let mut buf = vec![0u8; session::MAX_DATAGRAM];

    loop {
        let received = tokio::select! {
            _ = shutdown.recv() => break,
            received = socket.recv_from(&mut buf) => received,
        };

        let (n, peer) = match received {
            Ok(received) => received,
            Err(e) if matches!(e.kind(), std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionRefused) => {
                tracing::debug!(name = %name, error = %e, "ignoring icmp error");
                continue;
            }
            Err(e) => {
                tracing::error!(name = %name, error = %e, "receive failed, failure not recoverable, exiting listen loop");
                return;
            }
        };
        let datagram = Bytes::copy_from_slice(&buf[..n]);

        match sessions.deliver(peer, datagram) {
            Delivery::Queued => {}
            Delivery::Dropped => {
                tracing::trace!(name = %name, peer_addr = %peer, "session queue full, dropping datagram");
            }
            Delivery::NewPeer(datagram) => {
                let rx = sessions.open(peer, datagram);
                open_session(&name, &socket, &accept, peer, rx);
            }
        }
    }
    tracing::debug!(name = %name, "udp demux loop exited");
}

enum Delivery {
    Queued,
    Dropped,
    /// No live session for the peer; the datagram is handed back.
    NewPeer(Bytes),
}

/// Per-peer queues of one listening socket.
#[derive(Default)]
struct SessionTable {
    peers: HashMap<SocketAddr, mpsc::Sender<Bytes>>,
}

impl SessionTable {
    fn deliver(&mut self, peer: SocketAddr, datagram: Bytes) -> Delivery {
        let Some(tx) = self.peers.get(&peer) else {
            return Delivery::NewPeer(datagram);
        };
        match tx.try_send(datagram) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => Delivery::Dropped,
            Err(TrySendError::Closed(datagram)) => {
                self.peers.remove(&peer);
                Delivery::NewPeer(datagram)
            }
        }
    }

    /// Start a queue for `peer` seeded with `first`, pruning dropped sessions.
    fn open(&mut self, peer: SocketAddr, first: Bytes) -> mpsc::Receiver<Bytes> {
        self.peers.retain(|_, tx| !tx.is_closed());

        let (tx, rx) = mpsc::channel(SESSION_QUEUE);
        // Fresh channel with capacity, cannot fail.
        let _ = tx.try_send(first);
        self.peers.insert(peer, tx);
        rx
    }

    fn len(&self) -> usize {
        self.peers.len()
    }
}

fn open_session(name: &str, socket: &Arc<UdpSocket>, accept: &AcceptFn, peer: SocketAddr, rx: mpsc::Receiver<Bytes>) {
    let detail = ConnectionDetail::new(format!("{TYPE}:{peer}"), true, name);
    let session = UdpSession::demuxed(socket.clone(), peer, rx);
    tracing::info!(name, peer_addr = %peer, "new udp connection accepted");
    accept(StreamConnection::new(session, detail).boxed());
}

/// Parser for `udp:` addresses.
#[derive(Debug, Default, Clone, Copy)]
pub struct UdpAddressParser;

impl AddressParser for UdpAddressParser {
    fn protocol_type(&self) -> &'static str {
        TYPE
    }

    fn parse(&self, input: &str) -> Result<Box<dyn Address>> {
        let (hostname, port) = parse_address_host_port(input, TYPE)?;
        Ok(Box::new(UdpAddress { hostname, port }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trip() {
        let address = UdpAddressParser.parse("udp:[::1]:5000").unwrap();
        assert_eq!(address.to_string(), "udp:[::1]:5000");
        assert_eq!(address.hostname(), "::1");
        assert!(UdpAddressParser.parse("udp:host:70000").is_err());
    }

    #[tokio::test]
    async fn hostnames_resolve_on_use() {
        let address = UdpAddress {
            hostname: "localhost".to_string(),
            port: 5353,
        };
        let resolved = address.resolve().await.unwrap();
        assert!(resolved.ip().is_loopback());
        assert_eq!(resolved.port(), 5353);

        let missing = UdpAddress {
            hostname: "no-such-host.invalid".to_string(),
            port: 5353,
        };
        assert!(missing.resolve().await.is_err());
    }

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn dropped_sessions_are_reclaimed() {
        let mut table = SessionTable::default();
        let first = table.open(peer(1), Bytes::from_static(b"a"));
        let second = table.open(peer(2), Bytes::from_static(b"b"));
        assert_eq!(table.len(), 2);

        // Peer 1 goes silent after its session is dropped.
        drop(first);
        let _third = table.open(peer(3), Bytes::from_static(b"c"));
        assert_eq!(table.len(), 2);
        assert!(matches!(table.deliver(peer(1), Bytes::from_static(b"x")), Delivery::NewPeer(_)));
        assert!(matches!(table.deliver(peer(2), Bytes::from_static(b"y")), Delivery::Queued));
        drop(second);
    }

    #[test]
    fn full_queue_drops_datagrams() {
        let mut table = SessionTable::default();
        let _rx = table.open(peer(1), Bytes::from_static(b"0"));
        for _ in 1..SESSION_QUEUE {
            assert!(matches!(table.deliver(peer(1), Bytes::from_static(b"x")), Delivery::Queued));
        }
        assert!(matches!(table.deliver(peer(1), Bytes::from_static(b"x")), Delivery::Dropped));
    }
}
