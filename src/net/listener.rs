//! Listener handles and accept callbacks.
//!
//! # Responsibilities
//! - The accept callback type every protocol delivers connections to
//! - The `Closer` handle returned from `listen`
//! - A shutdown-backed handle for dedicated-socket listeners (TCP, UDP, DTLS)
//!
//! # Design Decisions
//! - Closing a listener only stops accepting; connections already delivered live on
//! - `close` is idempotent

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::Result;
use crate::lifecycle::{Shutdown, ShutdownSignal};
use crate::net::connection::Connection;

/// Receives each inbound connection. Must not block; spawn work instead.
pub type AcceptFn = Arc<dyn Fn(Box<dyn Connection>) + Send + Sync>;

/// Wrap a closure as an [`AcceptFn`].
pub fn accept_fn<F>(f: F) -> AcceptFn
where
    F: Fn(Box<dyn Connection>) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Stops a listener created by `listen`.
///
/// Only an explicit `close` stops it; a dropped handle leaves the listener running.
pub trait Closer: Send + Sync {
    /// Stop accepting. Calling this more than once is a no-op.
    fn close(&self) -> Result<()>;

    /// Address the listener is bound to, when it owns a socket.
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

impl fmt::Debug for dyn Closer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Closer")
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

/// Accept errors caused by one peer rather than the listening socket.
pub fn is_transient_accept_error(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::Interrupted
    )
}

/// Handle for a listener whose accept loop owns its own socket.
#[derive(Debug)]
pub struct ListenerHandle {
    protocol: &'static str,
    local_addr: SocketAddr,
    shutdown: Shutdown,
}

impl ListenerHandle {
    pub fn new(protocol: &'static str, local_addr: SocketAddr) -> Self {
        Self {
            protocol,
            local_addr,
            shutdown: Shutdown::new(),
        }
    }

    /// Signal for the accept loop; resolves once `close` is called.
    pub fn signal(&self) -> ShutdownSignal {
        self.shutdown.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_triggered()
    }
}

impl Closer for ListenerHandle {
    fn close(&self) -> Result<()> {
        if self.shutdown.trigger() {
            tracing::info!(protocol = self.protocol, local_addr = %self.local_addr, "listener closed");
        }
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local_addr)
    }
}
