//! Shared TLS listener: several logical listeners on one socket.
//!
//! # Data Flow
//! ```text
//! SharedListenerRegistry::listen(bind_address, protocols, ...)
//!     → find or bind the SharedListener for bind_address
//!     → register a ProtocolHandler under each protocol identifier
//!
//! accept loop (one per SharedListener)
//!     → LazyConfigAcceptor reads the ClientHello
//!     → routing::select_handler under the read lock, result kept in a HandshakeSlot
//!     → handshake finished with the handler's narrowed ServerConfig
//!     → peer certificates checked, Connection handed to the handler's AcceptFn
//! ```
//!
//! # Design Decisions
//! - The handler table and the registry entry are torn down together under
//!   the table's write lock; a `listen` that raced with the teardown sees the
//!   `stopped` flag and binds a fresh listener
//! - Lock order is always table → registry shard → socket, never the reverse
//! - The socket lives in the `SharedListener`, not in the accept task, so the
//!   last `close` releases the port before it returns

use std::collections::HashMap;
use std::fmt;
use std::future::poll_fn;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rustls::server::{Acceptor, ServerConfig};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::LazyConfigAcceptor;

use crate::error::{Result, TransportError};
use crate::lifecycle::{Shutdown, ShutdownSignal};
use crate::net::binding::tune_tcp_stream;
use crate::net::identity::parse_peer_certificates;
use crate::net::listener::{is_transient_accept_error, AcceptFn, Closer};
use crate::net::{ConnectionDetail, StreamConnection};
use crate::tls::routing::{config_for_protocol, select_handler, HandshakeSlot, NO_PROTOCOL};
use crate::tls::TYPE;

type ListenerMap = DashMap<String, Arc<SharedListener>>;

/// All shared listeners of one `TransportContext`, keyed by bind address.
#[derive(Default)]
pub struct SharedListenerRegistry {
    listeners: Arc<ListenerMap>,
}

impl SharedListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a logical listener on `bind_address`.
    ///
    /// The socket is bound by the first registration for an address. An empty
    /// `protocols` list registers the no-ALPN identifier. Fails without side
    /// effects if any identifier is already claimed on that address.
    pub fn listen(
        &self,
        bind_address: &str,
        name: &str,
        protocols: &[String],
        config: Arc<ServerConfig>,
        accept: AcceptFn,
        handshake_timeout: Duration,
    ) -> Result<HandlerRegistration> {
        let protocols = normalize_protocols(protocols);
        let configs: HashMap<String, Arc<ServerConfig>> = protocols
            .iter()
            .map(|p| (p.clone(), config_for_protocol(&config, p)))
            .collect();

        loop {
            let listener = self.get_or_bind(bind_address, handshake_timeout)?;
            let mut table = listener.table.write();
            if table.stopped {
                // Torn down after we looked it up; its entry is gone now.
                continue;
            }

            if let Some(taken) = protocols.iter().find(|p| table.handlers.contains_key(*p)) {
                tracing::warn!(bind_address, name, protocol = %taken, "protocol already claimed on shared listener");
                return Err(TransportError::Conflict {
                    bind_address: bind_address.to_string(),
                    protocol: taken.clone(),
                });
            }

            let handler = Arc::new(ProtocolHandler {
                name: name.to_string(),
                protocols: protocols.clone(),
                configs: configs.clone(),
                accept: accept.clone(),
                closed: AtomicBool::new(false),
                listener: listener.clone(),
            });
            for proto in &protocols {
                table.handlers.insert(proto.clone(), handler.clone());
            }
            drop(table);

            tracing::info!(bind_address, name, protocols = ?protocols, "handler registered on shared listener");
            return Ok(HandlerRegistration { handler });
        }
    }

    /// Whether a shared listener currently exists for `bind_address`.
    pub fn contains(&self, bind_address: &str) -> bool {
        self.listeners.contains_key(bind_address)
    }

    /// Protocol identifiers registered on `bind_address`, sorted.
    pub fn protocols(&self, bind_address: &str) -> Vec<String> {
        let Some(listener) = self.listeners.get(bind_address).map(|l| l.clone()) else {
            return Vec::new();
        };
        let mut protocols: Vec<String> = listener.table.read().handlers.keys().cloned().collect();
        protocols.sort();
        protocols
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    fn get_or_bind(&self, bind_address: &str, handshake_timeout: Duration) -> Result<Arc<SharedListener>> {
        match self.listeners.entry(bind_address.to_string()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let socket = bind(bind_address)?;
                let local_addr = socket.local_addr()?;
                let listener = Arc::new(SharedListener {
                    bind_address: bind_address.to_string(),
                    local_addr,
                    table: RwLock::new(HandlerTable::default()),
                    socket: Mutex::new(Some(socket)),
                    shutdown: Shutdown::new(),
                    registry: Arc::downgrade(&self.listeners),
                    handshake_timeout,
                });
                entry.insert(listener.clone());

                tracing::info!(bind_address, local_addr = %local_addr, "shared tls listener started");
                tokio::spawn(listener.clone().run_accept(listener.shutdown.subscribe()));
                Ok(listener)
            }
        }
    }
}

impl fmt::Debug for SharedListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let addresses: Vec<String> = self.listeners.iter().map(|e| e.key().clone()).collect();
        f.debug_struct("SharedListenerRegistry")
            .field("listeners", &addresses)
            .finish()
    }
}

fn normalize_protocols(protocols: &[String]) -> Vec<String> {
    if protocols.is_empty() {
        vec![NO_PROTOCOL.to_string()]
    } else {
        protocols.to_vec()
    }
}

/// Bind synchronously so the registry entry is only created for a live socket.
fn bind(bind_address: &str) -> Result<TcpListener> {
    let bind_err = |source| TransportError::Bind {
        address: bind_address.to_string(),
        source,
    };
    let std_listener = std::net::TcpListener::bind(bind_address).map_err(bind_err)?;
    std_listener.set_nonblocking(true).map_err(bind_err)?;
    TcpListener::from_std(std_listener).map_err(bind_err)
}

#[derive(Default)]
struct HandlerTable {
    handlers: HashMap<String, Arc<ProtocolHandler>>,
    stopped: bool,
}

/// One bound socket and the handlers sharing it.
struct SharedListener {
    bind_address: String,
    local_addr: SocketAddr,
    table: RwLock<HandlerTable>,
    socket: Mutex<Option<TcpListener>>,
    shutdown: Shutdown,
    registry: Weak<ListenerMap>,
    handshake_timeout: Duration,
}

impl SharedListener {
    fn remove(&self, handler: &ProtocolHandler) {
        let mut table = self.table.write();
        for proto in &handler.protocols {
            let owned = table
                .handlers
                .get(proto)
                .is_some_and(|h| std::ptr::eq(Arc::as_ptr(h), handler));
            if owned {
                table.handlers.remove(proto);
            }
        }
        tracing::debug!(bind_address = %self.bind_address, name = %handler.name, "handler removed");

        if table.handlers.is_empty() {
            tracing::debug!(bind_address = %self.bind_address, "no handlers left, stopping");
            self.stop(&mut table);
        }
    }

    /// Caller holds the table's write lock.
    fn stop(&self, table: &mut HandlerTable) {
        if table.stopped {
            return;
        }
        table.stopped = true;
        if let Some(registry) = self.registry.upgrade() {
            registry.remove_if(&self.bind_address, |_, current| std::ptr::eq(current.as_ref(), self));
        }
        if self.socket.lock().take().is_some() {
            tracing::debug!(bind_address = %self.bind_address, local_addr = %self.local_addr, "shared socket closed");
        }
        self.shutdown.trigger();
    }

    /// `None` once the socket has been released by `stop`.
    fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<Option<io::Result<(TcpStream, SocketAddr)>>> {
        match self.socket.lock().as_ref() {
            Some(socket) => socket.poll_accept(cx).map(Some),
            None => Poll::Ready(None),
        }
    }

    async fn run_accept(self: Arc<Self>, mut shutdown: ShutdownSignal) {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.recv() => None,
                accepted = poll_fn(|cx| self.poll_accept(cx)) => accepted,
            };
            let Some(accepted) = accepted else {
                tracing::info!(bind_address = %self.bind_address, "listener closed, exiting");
                break;
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    if let Err(e) = tune_tcp_stream(&stream) {
                        tracing::debug!(peer_addr = %peer_addr, error = %e, "unable to tune accepted socket");
                    }
                    tokio::spawn(self.clone().process(stream, peer_addr));
                }
                Err(e) if is_transient_accept_error(&e) => {
                    tracing::debug!(bind_address = %self.bind_address, error = %e, "transient accept error");
                }
                Err(e) => {
                    tracing::error!(bind_address = %self.bind_address, error = %e, "accept failed, exiting");
                    self.stop(&mut self.table.write());
                    break;
                }
            }
        }
    }

    async fn process(self: Arc<Self>, stream: TcpStream, peer_addr: SocketAddr) {
        let handshake = tokio::time::timeout(self.handshake_timeout, self.handshake(stream, peer_addr)).await;

        let (tls, protocol, handler) = match handshake {
            Ok(Ok(done)) => done,
            Ok(Err(e)) => {
                tracing::warn!(bind_address = %self.bind_address, peer_addr = %peer_addr, error = %e, "handshake failed");
                return;
            }
            Err(_) => {
                tracing::warn!(bind_address = %self.bind_address, peer_addr = %peer_addr, timeout = ?self.handshake_timeout, "handshake timed out");
                return;
            }
        };

        let certs = match parse_peer_certificates(tls.get_ref().1.peer_certificates()) {
            Ok(certs) => certs,
            Err(e) => {
                tracing::warn!(peer_addr = %peer_addr, name = %handler.name, error = %e, "closing connection");
                return;
            }
        };

        if handler.is_closed() {
            tracing::debug!(peer_addr = %peer_addr, name = %handler.name, "handler closed during handshake, dropping connection");
            return;
        }

        tracing::debug!(peer_addr = %peer_addr, name = %handler.name, protocol = %protocol, "selected protocol");
        let detail = ConnectionDetail::new(format!("{TYPE}:{peer_addr}"), true, handler.name.as_str());
        let connection = StreamConnection::new(tls, detail).with_peer_certificates(certs);
        (handler.accept)(connection.boxed());
    }

    async fn handshake(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(tokio_rustls::server::TlsStream<TcpStream>, String, Arc<ProtocolHandler>)> {
        let start = LazyConfigAcceptor::new(Acceptor::default(), stream).await?;

        let mut slot = HandshakeSlot::new();
        let config = {
            let hello = start.client_hello();
            let offered: Option<Vec<&[u8]>> = hello.alpn().map(|protocols| protocols.collect());
            tracing::debug!(peer_addr = %peer_addr, offered = ?offered.as_ref().map(|o| printable(o)), "client requesting protocols");
            self.route(offered.as_deref(), &mut slot)?
        };

        let tls = start.into_stream(config).await?;
        let (protocol, handler) = slot
            .take()
            .ok_or_else(|| TransportError::Handshake("handshake completed without a selected handler".to_string()))?;
        Ok((tls, protocol, handler))
    }

    /// Runs under the read lock only.
    fn route(&self, offered: Option<&[&[u8]]>, slot: &mut HandshakeSlot<Arc<ProtocolHandler>>) -> Result<Arc<ServerConfig>> {
        let table = self.table.read();
        let (protocol, handler) = select_handler(&table.handlers, offered).ok_or_else(|| {
            TransportError::Handshake(format!(
                "no handler for requested protocols {:?}",
                offered.map(printable).unwrap_or_default()
            ))
        })?;

        let config = handler
            .configs
            .get(protocol)
            .cloned()
            .ok_or_else(|| TransportError::Handshake(format!("no server config for protocol '{protocol}'")))?;
        slot.fill(protocol, handler.clone());
        Ok(config)
    }
}

fn printable(protocols: &[&[u8]]) -> Vec<String> {
    protocols
        .iter()
        .map(|p| String::from_utf8_lossy(p).into_owned())
        .collect()
}

/// Registration record for one logical listener on a shared socket.
pub struct ProtocolHandler {
    name: String,
    protocols: Vec<String>,
    configs: HashMap<String, Arc<ServerConfig>>,
    accept: AcceptFn,
    closed: AtomicBool,
    listener: Arc<SharedListener>,
}

impl ProtocolHandler {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn protocols(&self) -> &[String] {
        &self.protocols
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr
    }

    /// Remove this handler; the socket closes with the last one. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.listener.remove(self);
    }
}

impl fmt::Debug for ProtocolHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolHandler")
            .field("name", &self.name)
            .field("protocols", &self.protocols)
            .field("bind_address", &self.listener.bind_address)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// [`Closer`] returned for shared-listener registrations.
#[derive(Debug)]
pub struct HandlerRegistration {
    handler: Arc<ProtocolHandler>,
}

impl HandlerRegistration {
    pub fn handler(&self) -> &ProtocolHandler {
        &self.handler
    }
}

impl Closer for HandlerRegistration {
    fn close(&self) -> Result<()> {
        self.handler.close();
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.handler.local_addr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::listener::accept_fn;

    fn server_config() -> Arc<ServerConfig> {
        let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let key = rustls::pki_types::PrivateKeyDer::Pkcs8(generated.key_pair.serialize_der().into());
        let config = ServerConfig::builder_with_provider(crate::net::identity::crypto_provider())
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![generated.cert.der().clone()], key)
            .unwrap();
        Arc::new(config)
    }

    fn protocols(list: &[&str]) -> Vec<String> {
        list.iter().map(|p| p.to_string()).collect()
    }

    #[tokio::test]
    async fn conflict_leaves_first_registration() {
        let registry = SharedListenerRegistry::new();
        let config = server_config();
        let timeout = Duration::from_secs(5);

        let first = registry
            .listen("127.0.0.1:0", "first", &protocols(&["foo", "bar"]), config.clone(), accept_fn(|_| {}), timeout)
            .unwrap();
        let err = registry
            .listen("127.0.0.1:0", "second", &protocols(&["baz", "bar"]), config, accept_fn(|_| {}), timeout)
            .unwrap_err();

        assert!(matches!(err, TransportError::Conflict { ref protocol, .. } if protocol == "bar"));
        assert_eq!(registry.protocols("127.0.0.1:0"), protocols(&["bar", "foo"]));
        assert_eq!(first.handler().name(), "first");
    }

    #[tokio::test]
    async fn last_close_removes_listener() {
        let registry = SharedListenerRegistry::new();
        let config = server_config();
        let timeout = Duration::from_secs(5);

        let a = registry
            .listen("127.0.0.1:0", "a", &protocols(&["foo"]), config.clone(), accept_fn(|_| {}), timeout)
            .unwrap();
        let b = registry
            .listen("127.0.0.1:0", "b", &[], config, accept_fn(|_| {}), timeout)
            .unwrap();
        assert_eq!(a.local_addr(), b.local_addr());
        assert_eq!(b.handler().protocols(), &[String::new()]);

        a.close().unwrap();
        a.close().unwrap();
        assert!(registry.contains("127.0.0.1:0"));
        assert_eq!(registry.protocols("127.0.0.1:0"), vec![String::new()]);

        b.close().unwrap();
        assert!(!registry.contains("127.0.0.1:0"));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn last_close_releases_the_port() {
        let registry = SharedListenerRegistry::new();
        let config = server_config();
        let timeout = Duration::from_secs(5);

        let port = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let bind_address = format!("127.0.0.1:{port}");

        let first = registry
            .listen(&bind_address, "first", &protocols(&["foo"]), config.clone(), accept_fn(|_| {}), timeout)
            .unwrap();
        first.close().unwrap();
        assert!(first.handler().listener.socket.lock().is_none());

        // Immediately, without yielding to the old accept task.
        let again = registry
            .listen(&bind_address, "again", &protocols(&["foo"]), config, accept_fn(|_| {}), timeout)
            .unwrap();
        assert_eq!(again.local_addr().map(|a| a.port()), Some(port));
        again.close().unwrap();
    }

    #[tokio::test]
    async fn dropped_registration_stays_registered() {
        let registry = SharedListenerRegistry::new();
        let local_addr = {
            let registration = registry
                .listen("127.0.0.1:0", "kept", &[], server_config(), accept_fn(|_| {}), Duration::from_secs(5))
                .unwrap();
            registration.local_addr()
        };

        assert!(registry.contains("127.0.0.1:0"));
        assert_eq!(registry.protocols("127.0.0.1:0"), vec![String::new()]);
        assert!(std::net::TcpStream::connect(local_addr.unwrap()).is_ok());
    }

    #[tokio::test]
    async fn failed_bind_leaves_no_entry() {
        let registry = SharedListenerRegistry::new();
        let err = registry
            .listen("203.0.113.1:1", "x", &[], server_config(), accept_fn(|_| {}), Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, TransportError::Bind { .. }));
        assert!(registry.is_empty());
    }
}
