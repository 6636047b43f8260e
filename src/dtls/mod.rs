//! DTLS transport (`dtls:<host>:<port>`) over a pluggable engine.
//!
//! # Data Flow
//! ```text
//! parse: "dtls:host:port" checked against the shared host/port grammar
//! dial:  host resolved → local binding → UDP socket (buffer sizes from [dtls]) → provider handshake
//!        → peer certificates checked → optional rate shaper (maxBytesPerSecond)
//! listen: UDP socket → provider acceptor → accept loop → AcceptFn
//! ```
//!
//! # Design Decisions
//! - Hosts are resolved on use, not at parse time; resolution failures are
//!   reported by dial/listen as parse errors
//! - Without a provider every operation fails with `Unsupported`

pub mod provider;

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use socket2::SockRef;
use tokio::net::UdpSocket;

use crate::address::hostport::bindable_address;
use crate::address::{host_port_string, parse_address_host_port, Address, AddressParser};
use crate::config::{ConfigError, Configuration, DtlsOptions};
use crate::error::{Result, TransportError};
use crate::lifecycle::ShutdownSignal;
use crate::net::binding::{resolve_local_binding, with_timeout};
use crate::net::identity::parse_peer_certificates;
use crate::net::listener::{is_transient_accept_error, AcceptFn, Closer, ListenerHandle};
use crate::net::{limit_writer, Connection, ConnectionDetail, Identity, StreamConnection};

pub use provider::{DtlsAcceptor, DtlsProvider, DtlsSession};

pub const TYPE: &str = "dtls";

/// Window used when `dtls.maxBytesPerSecond` is set.
const SHAPER_WINDOW: Duration = Duration::from_secs(1);

pub struct DtlsAddress {
    hostname: String,
    port: u16,
    provider: Option<Arc<dyn DtlsProvider>>,
}

impl DtlsAddress {
    async fn target(&self) -> Result<SocketAddr> {
        let target = bindable_address(&self.hostname, self.port);
        let found = tokio::net::lookup_host(target.as_str())
            .await
            .map_err(|e| TransportError::parse(TYPE, &self.to_string(), format!("unable to resolve host {}: {e}", self.hostname)))?
            .next();
        found.ok_or_else(|| TransportError::parse(TYPE, &self.to_string(), format!("no IPs found when resolving host {}", self.hostname)))
    }

    fn provider(&self) -> Result<&Arc<dyn DtlsProvider>> {
        self.provider
            .as_ref()
            .ok_or_else(|| TransportError::Unsupported(format!("{TYPE} requires a DTLS provider")))
    }

    async fn dial_from(
        &self,
        name: &str,
        local_binding: &str,
        identity: Option<&Identity>,
        timeout: Duration,
        config: &Configuration,
    ) -> Result<Box<dyn Connection>> {
        tracing::debug!(address = %self, "dialing");
        let provider = self.provider()?;
        let target = self.target().await?;
        let identity = identity.ok_or_else(|| ConfigError::Missing("identity for dtls dial".to_string()))?;
        let options = DtlsOptions::load(config)?;

        let local = resolve_local_binding(local_binding)?;
        let socket = UdpSocket::bind(SocketAddr::new(local.unwrap_or_else(|| unspecified_like(target)), 0)).await?;
        apply_buffer_sizes(&socket, &options)?;

        let session = with_timeout("dtls handshake", timeout, provider.connect(socket, target, identity))
            .await
            .map_err(|e| match e {
                TransportError::Timeout { .. } => e,
                other => TransportError::Handshake(format!("dtls handshake error: {other}")),
            })?;
        let certs = parse_peer_certificates(Some(&session.peer_certificates))?;
        tracing::debug!(address = %self, certificates = certs.len(), "server provided certificates");

        let detail = ConnectionDetail::new(self.to_string(), false, name);
        match options.max_bytes_per_second {
            Some(bps) => {
                tracing::info!(address = %self, bytes_per_second = bps, "limiting DTLS writes");
                let shaped = limit_writer(session.stream, SHAPER_WINDOW, bps);
                Ok(StreamConnection::new(shaped, detail).with_peer_certificates(certs).boxed())
            }
            None => Ok(StreamConnection::new(session.stream, detail)
                .with_peer_certificates(certs)
                .boxed()),
        }
    }
}

fn unspecified_like(addr: SocketAddr) -> IpAddr {
    match addr {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

fn apply_buffer_sizes(socket: &UdpSocket, options: &DtlsOptions) -> Result<()> {
    let sock = SockRef::from(socket);
    let context = |what: &str, size: u64, e: io::Error| {
        TransportError::Io(io::Error::new(
            e.kind(),
            format!("unable to set udp {what} buffer size to {size} ({e})"),
        ))
    };
    sock.set_send_buffer_size(options.write_buffer_size as usize)
        .map_err(|e| context("write", options.write_buffer_size, e))?;
    sock.set_recv_buffer_size(options.read_buffer_size as usize)
        .map_err(|e| context("read", options.read_buffer_size, e))?;
    Ok(())
}

impl fmt::Display for DtlsAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{TYPE}:{}", host_port_string(&self.hostname, self.port))
    }
}

impl fmt::Debug for DtlsAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DtlsAddress")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("provider", &self.provider.is_some())
            .finish()
    }
}

#[async_trait]
impl Address for DtlsAddress {
    async fn dial(
        &self,
        name: &str,
        identity: Option<&Identity>,
        timeout: Duration,
        config: &Configuration,
    ) -> Result<Box<dyn Connection>> {
        self.dial_from(name, "", identity, timeout, config).await
    }

    async fn dial_with_local_binding(
        &self,
        name: &str,
        local_binding: &str,
        identity: Option<&Identity>,
        timeout: Duration,
        config: &Configuration,
    ) -> Result<Box<dyn Connection>> {
        self.dial_from(name, local_binding, identity, timeout, config).await
    }

    async fn listen(
        &self,
        name: &str,
        identity: Option<&Identity>,
        accept: AcceptFn,
        config: &Configuration,
    ) -> Result<Box<dyn Closer>> {
        let provider = self.provider()?;
        let target = self.target().await?;
        let identity = identity.ok_or_else(|| ConfigError::Missing("identity for dtls listen".to_string()))?;
        let options = DtlsOptions::load(config)?;

        let socket = UdpSocket::bind(target).await.map_err(|source| TransportError::Bind {
            address: target.to_string(),
            source,
        })?;
        let handle = ListenerHandle::new(TYPE, socket.local_addr()?);
        let acceptor = provider.listen(socket, identity, options.handshake_timeout()).await?;

        tracing::info!(name, address = %self, "dtls listener started");
        tokio::spawn(accept_loop(name.to_string(), acceptor, accept, handle.signal()));
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

async fn accept_loop(name: String, mut acceptor: Box<dyn DtlsAcceptor>, accept: AcceptFn, mut shutdown: ShutdownSignal) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!(name = %name, "listener closed, exiting");
                break;
            }
            accepted = acceptor.accept() => accepted,
        };

        let session = match accepted {
            Ok(session) => session,
            Err(e) if is_transient_accept_error(&e) => {
                tracing::warn!(name = %name, error = %e, "accept failed");
                continue;
            }
            Err(e) => {
                tracing::error!(name = %name, error = %e, "accept failed, failure not recoverable, exiting listen loop");
                return;
            }
        };

        let certs = match parse_peer_certificates(Some(&session.peer_certificates)) {
            Ok(certs) => certs,
            Err(e) => {
                tracing::error!(name = %name, error = %e, "unable to parse peer certificates");
                continue;
            }
        };

        let peer = match session.stream.peer_addr() {
            Ok(peer) => peer.to_string(),
            Err(_) => "unknown".to_string(),
        };
        let detail = ConnectionDetail::new(format!("{TYPE}:{peer}"), true, name.as_str());
        accept(StreamConnection::new(session.stream, detail).with_peer_certificates(certs).boxed());
    }
}

/// Parser for `dtls:` addresses.
#[derive(Clone, Default)]
pub struct DtlsAddressParser {
    provider: Option<Arc<dyn DtlsProvider>>,
}

impl DtlsAddressParser {
    pub fn new(provider: Option<Arc<dyn DtlsProvider>>) -> Self {
        Self { provider }
    }
}

impl fmt::Debug for DtlsAddressParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DtlsAddressParser")
            .field("provider", &self.provider.is_some())
            .finish()
    }
}

impl AddressParser for DtlsAddressParser {
    fn protocol_type(&self) -> &'static str {
        TYPE
    }

    fn parse(&self, input: &str) -> Result<Box<dyn Address>> {
        let (hostname, port) = parse_address_host_port(input, TYPE)?;
        Ok(Box::new(DtlsAddress {
            hostname,
            port,
            provider: self.provider.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::listener::accept_fn;
    use crate::udp::UdpSession;
    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;

    /// Pass-through engine: no crypto, one peer per listener.
    struct PlaintextProvider;

    struct SinglePeerAcceptor {
        socket: Option<Arc<UdpSocket>>,
    }

    #[async_trait]
    impl DtlsAcceptor for SinglePeerAcceptor {
        async fn accept(&mut self) -> io::Result<DtlsSession> {
            let Some(socket) = self.socket.take() else {
                return std::future::pending().await;
            };
            let mut buf = vec![0u8; 2048];
            let (n, peer) = socket.recv_from(&mut buf).await?;
            let (tx, rx) = mpsc::channel(16);
            tx.send(Bytes::copy_from_slice(&buf[..n])).await.ok();

            let forward = socket.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 2048];
                while let Ok((n, _)) = forward.recv_from(&mut buf).await {
                    if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                        break;
                    }
                }
            });
            Ok(DtlsSession::new(Box::new(UdpSession::demuxed(socket, peer, rx)), Vec::new()))
        }
    }

    #[async_trait]
    impl DtlsProvider for PlaintextProvider {
        async fn connect(&self, socket: UdpSocket, peer: SocketAddr, _identity: &Identity) -> Result<DtlsSession> {
            socket.connect(peer).await?;
            Ok(DtlsSession::new(Box::new(UdpSession::connected(socket, peer)), Vec::new()))
        }

        async fn listen(&self, socket: UdpSocket, _identity: &Identity, _timeout: Duration) -> Result<Box<dyn DtlsAcceptor>> {
            Ok(Box::new(SinglePeerAcceptor {
                socket: Some(Arc::new(socket)),
            }))
        }
    }

    fn parser() -> DtlsAddressParser {
        DtlsAddressParser::new(Some(Arc::new(PlaintextProvider)))
    }

    #[test]
    fn parse_uses_shared_grammar() {
        let address = parser().parse("dtls:127.0.0.1:4433").unwrap();
        assert_eq!(address.to_string(), "dtls:127.0.0.1:4433");
        assert_eq!(address.hostname(), "127.0.0.1");
        assert_eq!(address.port(), 4433);

        let address = parser().parse("dtls:[::1]:4433").unwrap();
        assert_eq!(address.to_string(), "dtls:[::1]:4433");

        for input in ["udp:127.0.0.1:4433", "dtls:localhost:99999", "dtls:host", "dtls:host:port"] {
            let err = parser().parse(input).unwrap_err();
            assert!(matches!(err, TransportError::Parse { .. }), "{input:?} gave {err}");
        }
    }

    #[test]
    fn parse_does_not_resolve() {
        let address = parser().parse("dtls:no-such-host.invalid:4433").unwrap();
        assert_eq!(address.hostname(), "no-such-host.invalid");
    }

    #[tokio::test]
    async fn resolution_errors_surface_on_use() {
        let address = parser().parse("dtls:no-such-host.invalid:4433").unwrap();
        let err = address
            .dial("d", Some(&Identity::default()), Duration::ZERO, &Configuration::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Parse { .. }));
    }

    #[tokio::test]
    async fn missing_provider_is_unsupported() {
        let address = DtlsAddressParser::default().parse("dtls:127.0.0.1:1").unwrap();
        let err = address
            .dial("d", Some(&Identity::default()), Duration::ZERO, &Configuration::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Unsupported(_)));
    }

    #[tokio::test]
    async fn dial_and_listen_through_provider() {
        let identity = Identity::default();
        let mut config = Configuration::new();
        config.set("dtls", "maxBytesPerSecond", 1_000_000_i64);
        config.set("dtls", "writeBufferSize", 65536_i64);
        config.set("dtls", "readBufferSize", 65536_i64);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = parser()
            .parse("dtls:127.0.0.1:0")
            .unwrap()
            .listen("server", Some(&identity), accept_fn(move |conn| {
                let _ = tx.send(conn);
            }), &config)
            .await
            .unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut client = parser()
            .parse(&format!("dtls:127.0.0.1:{port}"))
            .unwrap()
            .dial("client", Some(&identity), Duration::from_secs(5), &config)
            .await
            .unwrap();
        client.write_all(b"hello").await.unwrap();

        let mut server = rx.recv().await.unwrap();
        assert!(server.detail().is_inbound());
        assert_eq!(server.detail().name(), "server");
        assert!(server.detail().address().starts_with("dtls:127.0.0.1:"));

        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        server.write_all(b"world").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");
        assert_eq!(client.detail().address(), format!("dtls:127.0.0.1:{port}"));
        listener.close().unwrap();
    }
}
