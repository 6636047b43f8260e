//! Pull-style accept on top of a shared-listener registration.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::server::ServerConfig;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::{Result, TransportError};
use crate::net::listener::{accept_fn, Closer};
use crate::net::Connection;
use crate::tls::shared::{HandlerRegistration, SharedListenerRegistry};

/// Connections buffered for the caller; further ones are dropped until it catches up.
const INCOMING_CAPACITY: usize = 16;

/// Register on the shared listener at `bind_address` with the ALPN list of
/// `config`, returning a stream of accepted connections.
///
/// Useful for components that want to drive their own accept loop, e.g. an
/// HTTP server sharing the port with other protocols.
pub fn listen_tls(
    shared: &SharedListenerRegistry,
    bind_address: &str,
    name: &str,
    config: Arc<ServerConfig>,
    handshake_timeout: Duration,
) -> Result<TlsIncoming> {
    let protocols: Vec<String> = config
        .alpn_protocols
        .iter()
        .map(|p| String::from_utf8_lossy(p).into_owned())
        .collect();

    let (tx, rx) = mpsc::channel::<Box<dyn Connection>>(INCOMING_CAPACITY);
    let accept = accept_fn(move |conn| match tx.try_send(conn) {
        Ok(()) => {}
        Err(TrySendError::Full(conn)) => {
            tracing::warn!(
                peer = %conn.detail().address(),
                capacity = INCOMING_CAPACITY,
                "incoming tls queue full, dropping connection"
            );
        }
        Err(TrySendError::Closed(_)) => {
            tracing::debug!("incoming tls listener closed, dropping connection");
        }
    });

    let registration = shared.listen(bind_address, name, &protocols, config, accept, handshake_timeout)?;
    Ok(TlsIncoming { rx, registration })
}

/// Accepted connections for one registration.
///
/// Unlike a bare [`Closer`], dropping it unregisters: nothing could receive
/// the connections anymore.
#[derive(Debug)]
pub struct TlsIncoming {
    rx: mpsc::Receiver<Box<dyn Connection>>,
    registration: HandlerRegistration,
}

impl TlsIncoming {
    /// Wait for the next connection; fails once the listener is closed and drained.
    pub async fn accept(&mut self) -> Result<Box<dyn Connection>> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| TransportError::Io(io::Error::new(io::ErrorKind::NotConnected, "listener closed")))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.registration.handler().local_addr()
    }

    /// Unregister and stop delivering new connections.
    pub fn close(&mut self) -> Result<()> {
        self.registration.close()?;
        self.rx.close();
        Ok(())
    }
}

impl Drop for TlsIncoming {
    fn drop(&mut self) {
        let _ = self.registration.close();
    }
}
