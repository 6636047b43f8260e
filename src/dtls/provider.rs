//! Boundary to the DTLS engine.
//!
//! The transport owns sockets, configuration and connection bookkeeping; a
//! [`DtlsProvider`] only runs handshakes and record protection on the sockets
//! it is given.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use rustls::pki_types::CertificateDer;
use tokio::net::UdpSocket;

use crate::error::Result;
use crate::net::{Identity, Socket};

/// An established DTLS association.
pub struct DtlsSession {
    pub stream: Box<dyn Socket>,
    /// Raw certificates presented by the peer, leaf first.
    pub peer_certificates: Vec<CertificateDer<'static>>,
}

impl DtlsSession {
    pub fn new(stream: Box<dyn Socket>, peer_certificates: Vec<CertificateDer<'static>>) -> Self {
        Self {
            stream,
            peer_certificates,
        }
    }
}

/// Server side of a provider, bound to one socket.
#[async_trait]
pub trait DtlsAcceptor: Send {
    /// Wait for the next completed handshake.
    ///
    /// Errors of kind `ConnectionAborted`/`ConnectionReset`/`Interrupted` are
    /// treated as per-peer and the accept loop keeps going.
    async fn accept(&mut self) -> io::Result<DtlsSession>;
}

#[async_trait]
pub trait DtlsProvider: Send + Sync {
    /// Run a client handshake towards `peer` over an unconnected socket.
    async fn connect(&self, socket: UdpSocket, peer: SocketAddr, identity: &Identity) -> Result<DtlsSession>;

    /// Start accepting associations on `socket`, requiring client certificates.
    ///
    /// Each server handshake must finish within `handshake_timeout`.
    async fn listen(
        &self,
        socket: UdpSocket,
        identity: &Identity,
        handshake_timeout: Duration,
    ) -> Result<Box<dyn DtlsAcceptor>>;
}
