//! Custom UDP transport (`transwarp:<host>:<port>`, `transwarptls:<host>:<port>`).
//!
//! # Responsibilities
//! - Address parsing and display for both variants
//! - Socket binding (with local binding on dial) and the accept loop
//! - Handing the `westworld3` profile to the engine, which does the framing
//!
//! # Design Decisions
//! - The engine is a [`TranswarpProvider`]; without one every operation fails
//!   with `Unsupported`
//! - `transwarptls` requires an identity on both dial and listen; plain
//!   `transwarp` ignores it

pub mod provider;

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;

use crate::address::hostport::bindable_address;
use crate::address::{host_port_string, parse_address_host_port, Address, AddressParser};
use crate::config::{ConfigError, Configuration};
use crate::error::{Result, TransportError};
use crate::lifecycle::ShutdownSignal;
use crate::net::binding::{resolve_local_binding, with_timeout};
use crate::net::identity::parse_peer_certificates;
use crate::net::listener::{AcceptFn, Closer, ListenerHandle};
use crate::net::{Connection, ConnectionDetail, Identity, StreamConnection};

pub use provider::{TranswarpAcceptor, TranswarpProvider, TranswarpSession};

/// Configuration namespace holding the engine's profile.
pub const PROFILE_NAMESPACE: &str = "westworld3";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    Plain,
    Tls,
}

impl Variant {
    pub fn protocol_type(self) -> &'static str {
        match self {
            Variant::Plain => "transwarp",
            Variant::Tls => "transwarptls",
        }
    }
}

fn profile(config: &Configuration) -> Result<toml::Table> {
    Ok(config
        .namespace(PROFILE_NAMESPACE)?
        .map(|ns| ns.to_table())
        .unwrap_or_default())
}

fn unspecified_like(addr: SocketAddr) -> IpAddr {
    match addr {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

pub struct TranswarpAddress {
    variant: Variant,
    hostname: String,
    port: u16,
    provider: Option<Arc<dyn TranswarpProvider>>,
}

impl TranswarpAddress {
    fn provider(&self) -> Result<&Arc<dyn TranswarpProvider>> {
        self.provider.as_ref().ok_or_else(|| {
            TransportError::Unsupported(format!("{} requires a transport provider", self.variant.protocol_type()))
        })
    }

    /// The identity to hand the engine: required for the TLS variant, dropped otherwise.
    fn identity<'a>(&self, identity: Option<&'a Identity>, operation: &str) -> Result<Option<&'a Identity>> {
        match self.variant {
            Variant::Plain => Ok(None),
            Variant::Tls => identity.map(Some).ok_or_else(|| {
                ConfigError::Missing(format!("identity for {} {operation}", self.variant.protocol_type())).into()
            }),
        }
    }

    async fn resolve(&self) -> Result<SocketAddr> {
        let target = bindable_address(&self.hostname, self.port);
        let found = tokio::net::lookup_host(target.as_str()).await?.next();
        found.ok_or_else(|| TransportError::parse(self.variant.protocol_type(), &self.to_string(), "host did not resolve"))
    }

    async fn dial_from(
        &self,
        name: &str,
        local_binding: &str,
        identity: Option<&Identity>,
        timeout: Duration,
        config: &Configuration,
    ) -> Result<Box<dyn Connection>> {
        let provider = self.provider()?;
        let identity = self.identity(identity, "dial")?;
        let profile = profile(config)?;
        let local = resolve_local_binding(local_binding)?;

        with_timeout("transwarp dial", timeout, async {
            let endpoint = self.resolve().await?;
            let socket = UdpSocket::bind(SocketAddr::new(local.unwrap_or_else(|| unspecified_like(endpoint)), 0)).await?;
            let session = provider.connect(socket, endpoint, identity, &profile).await?;
            let certs = parse_peer_certificates(Some(&session.peer_certificates))?;

            tracing::debug!(name, address = %self, "transwarp session established");
            let detail = ConnectionDetail::new(self.to_string(), false, name);
            Ok(StreamConnection::new(session.stream, detail)
                .with_peer_certificates(certs)
                .boxed())
        })
        .await
    }
}

impl fmt::Display for TranswarpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.variant.protocol_type(), host_port_string(&self.hostname, self.port))
    }
}

impl fmt::Debug for TranswarpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TranswarpAddress")
            .field("variant", &self.variant)
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("provider", &self.provider.is_some())
            .finish()
    }
}

#[async_trait]
impl Address for TranswarpAddress {
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
        let identity = self.identity(identity, "listen")?;
        let profile = profile(config)?;

        let bind_address = self.resolve().await?;
        let socket = UdpSocket::bind(bind_address).await.map_err(|source| TransportError::Bind {
            address: bind_address.to_string(),
            source,
        })?;
        let handle = ListenerHandle::new(self.variant.protocol_type(), socket.local_addr()?);
        let acceptor = provider.listen(socket, identity, &profile).await?;

        tracing::info!(name, address = %self, profile_keys = profile.len(), "transwarp listener started");
        tokio::spawn(accept_loop(name.to_string(), self.variant, acceptor, accept, handle.signal()));
        Ok(Box::new(handle))
    }

    fn protocol_type(&self) -> &'static str {
        self.variant.protocol_type()
    }

    fn hostname(&self) -> &str {
        &self.hostname
    }

    fn port(&self) -> u16 {
        self.port
    }
}

async fn accept_loop(
    name: String,
    variant: Variant,
    mut acceptor: Box<dyn TranswarpAcceptor>,
    accept: AcceptFn,
    mut shutdown: ShutdownSignal,
) {
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

        let peer = session
            .stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        tracing::info!(name = %name, peer_addr = %peer, "accepted connection");
        let detail = ConnectionDetail::new(format!("{}:{peer}", variant.protocol_type()), true, name.as_str());
        accept(StreamConnection::new(session.stream, detail).with_peer_certificates(certs).boxed());
    }
}

/// Parser for one variant of the custom transport.
#[derive(Clone)]
pub struct TranswarpAddressParser {
    variant: Variant,
    provider: Option<Arc<dyn TranswarpProvider>>,
}

impl TranswarpAddressParser {
    pub fn new(variant: Variant, provider: Option<Arc<dyn TranswarpProvider>>) -> Self {
        Self { variant, provider }
    }
}

impl fmt::Debug for TranswarpAddressParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TranswarpAddressParser")
            .field("variant", &self.variant)
            .field("provider", &self.provider.is_some())
            .finish()
    }
}

impl AddressParser for TranswarpAddressParser {
    fn protocol_type(&self) -> &'static str {
        self.variant.protocol_type()
    }

    fn parse(&self, input: &str) -> Result<Box<dyn Address>> {
        let (hostname, port) = parse_address_host_port(input, self.variant.protocol_type())?;
        Ok(Box::new(TranswarpAddress {
            variant: self.variant,
            hostname,
            port,
            provider: self.provider.clone(),
        }))
    }
}
