//! Boundary to the custom UDP transport engine.
//!
//! The engine owns framing, retransmission and (for `transwarptls`) the TLS
//! layer. It reads its tuning profile from the `westworld3` namespace, handed
//! over untouched.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use rustls::pki_types::CertificateDer;
use tokio::net::UdpSocket;

use crate::error::Result;
use crate::net::{Identity, Socket};

/// An established session over the custom transport.
pub struct TranswarpSession {
    pub stream: Box<dyn Socket>,
    /// Peer chain for `transwarptls`; empty for plain `transwarp`.
    pub peer_certificates: Vec<CertificateDer<'static>>,
}

impl TranswarpSession {
    pub fn new(stream: Box<dyn Socket>) -> Self {
        Self {
            stream,
            peer_certificates: Vec::new(),
        }
    }

    pub fn with_peer_certificates(mut self, certs: Vec<CertificateDer<'static>>) -> Self {
        self.peer_certificates = certs;
        self
    }
}

#[async_trait]
pub trait TranswarpAcceptor: Send {
    /// Wait for the next session. Any error ends the accept loop.
    async fn accept(&mut self) -> io::Result<TranswarpSession>;
}

#[async_trait]
pub trait TranswarpProvider: Send + Sync {
    /// Open a session towards `peer` over an unconnected socket.
    ///
    /// `identity` is present only for `transwarptls`.
    async fn connect(
        &self,
        socket: UdpSocket,
        peer: SocketAddr,
        identity: Option<&Identity>,
        profile: &toml::Table,
    ) -> Result<TranswarpSession>;

    /// Start accepting sessions on `socket`.
    async fn listen(
        &self,
        socket: UdpSocket,
        identity: Option<&Identity>,
        profile: &toml::Table,
    ) -> Result<Box<dyn TranswarpAcceptor>>;
}
