//! `wss:<host>:<port>` listeners on the shared TLS listener.
//!
//! # Data Flow
//! ```text
//! shared TLS listener (ALPN "http/1.1")
//!     → upgrade task: HTTP upgrade on the configured path, bounded by wss.handshakeTimeout,
//!       request read within readTimeout and response written within writeTimeout
//!     → WsStream (buffer sizes, pings, pong and write timeouts from [wss])
//!     → wrapped as a Connection → caller's AcceptFn
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

use crate::address::hostport::bindable_address;
use crate::address::{host_port_string, parse_address_host_port, Address, AddressParser};
use crate::config::{ConfigError, Configuration, TlsOptions, WsOptions};
use crate::error::{Result, TransportError};
use crate::net::listener::{accept_fn, AcceptFn, Closer};
use crate::net::{Connection, ConnectionDetail, Identity, StreamConnection};
use crate::tls::shared::SharedListenerRegistry;
use crate::ws::stream::{WsStream, WsTimeouts};

pub const TYPE: &str = "wss";

pub struct WssAddress {
    hostname: String,
    port: u16,
    shared: Arc<SharedListenerRegistry>,
}

impl fmt::Display for WssAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{TYPE}:{}", host_port_string(&self.hostname, self.port))
    }
}

impl fmt::Debug for WssAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WssAddress")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .finish()
    }
}

fn dial_unsupported() -> TransportError {
    TransportError::Unsupported(format!("dial is not supported for {TYPE} addresses"))
}

#[async_trait]
impl Address for WssAddress {
    async fn dial(
        &self,
        _name: &str,
        _identity: Option<&Identity>,
        _timeout: Duration,
        _config: &Configuration,
    ) -> Result<Box<dyn Connection>> {
        Err(dial_unsupported())
    }

    async fn dial_with_local_binding(
        &self,
        _name: &str,
        _local_binding: &str,
        _identity: Option<&Identity>,
        _timeout: Duration,
        _config: &Configuration,
    ) -> Result<Box<dyn Connection>> {
        Err(dial_unsupported())
    }

    async fn listen(
        &self,
        name: &str,
        identity: Option<&Identity>,
        accept: AcceptFn,
        config: &Configuration,
    ) -> Result<Box<dyn Closer>> {
        let ws = WsOptions::load(config, TYPE)?;
        let tls = TlsOptions::load(config)?;
        let server = identity
            .ok_or_else(|| ConfigError::Missing("identity for wss listen".to_string()))?
            .server_config()?;

        let bind_address = bindable_address(&self.hostname, self.port);
        tracing::info!(name, bind_address = %bind_address, path = %ws.path, protocols = ?ws.protocols, "wss listener starting");

        let upgrade = upgrade_fn(name.to_string(), Arc::new(UpgradeSettings::from(&ws)), accept);
        let registration = self.shared.listen(
            &bind_address,
            name,
            &ws.protocols,
            server,
            upgrade,
            tls.handshake_timeout(),
        )?;
        Ok(Box::new(registration))
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

/// Per-listener upgrade parameters taken from the `wss` namespace.
#[derive(Debug, Clone)]
struct UpgradeSettings {
    path: String,
    handshake_timeout: Duration,
    read_timeout: Duration,
    write_timeout: Duration,
    websocket: WebSocketConfig,
    stream: WsTimeouts,
}

impl From<&WsOptions> for UpgradeSettings {
    fn from(ws: &WsOptions) -> Self {
        Self {
            path: ws.path.clone(),
            handshake_timeout: ws.handshake_timeout(),
            read_timeout: ws.read_timeout(),
            write_timeout: ws.write_timeout(),
            websocket: WebSocketConfig::default()
                .read_buffer_size(ws.read_buffer_size)
                .write_buffer_size(ws.write_buffer_size),
            stream: WsTimeouts {
                write_timeout: ws.write_timeout(),
                ping_interval: ws.ping_interval(),
                pong_timeout: ws.pong_timeout(),
            },
        }
    }
}

fn deadline_after(limit: Duration) -> Option<Instant> {
    (!limit.is_zero()).then(|| Instant::now() + limit)
}

/// Accept callback that upgrades each TLS connection before handing it on.
fn upgrade_fn(name: String, settings: Arc<UpgradeSettings>, accept: AcceptFn) -> AcceptFn {
    accept_fn(move |conn| {
        let name = name.clone();
        let settings = settings.clone();
        let accept = accept.clone();
        tokio::spawn(async move {
            let peer = conn.detail().address().to_string();
            let timeout = settings.handshake_timeout;
            match tokio::time::timeout(timeout, upgrade(conn, &name, &settings)).await {
                Ok(Ok(upgraded)) => accept(upgraded),
                Ok(Err(e)) => tracing::warn!(name = %name, peer = %peer, error = %e, "websocket upgrade failed"),
                Err(_) => tracing::warn!(name = %name, peer = %peer, timeout = ?timeout, "websocket upgrade timed out"),
            }
        });
    })
}

async fn upgrade(mut conn: Box<dyn Connection>, name: &str, settings: &UpgradeSettings) -> Result<Box<dyn Connection>> {
    let certs = conn.peer_certificates().to_vec();
    let local_addr = conn.local_addr()?;
    let peer_addr = conn.peer_addr()?;
    conn.set_read_deadline(deadline_after(settings.read_timeout));
    conn.set_write_deadline(deadline_after(settings.write_timeout));

    let expected = settings.path.clone();
    let check_path = move |request: &Request, response: Response| -> std::result::Result<Response, ErrorResponse> {
        if request.uri().path() == expected {
            return Ok(response);
        }
        let mut rejection = ErrorResponse::new(Some(format!("no websocket endpoint at {}", request.uri().path())));
        *rejection.status_mut() = StatusCode::NOT_FOUND;
        Err(rejection)
    };

    let mut socket = tokio_tungstenite::accept_hdr_async_with_config(conn, check_path, Some(settings.websocket))
        .await
        .map_err(|e| TransportError::Handshake(format!("websocket upgrade: {e}")))?;
    // Upgrade limits do not carry over to the websocket.
    socket.get_mut().set_deadline(None);

    tracing::debug!(name, peer_addr = %peer_addr, "websocket upgraded");
    let detail = ConnectionDetail::new(format!("{TYPE}:{peer_addr}"), true, name);
    let stream = WsStream::new(socket, local_addr, peer_addr).with_timeouts(settings.stream);
    Ok(StreamConnection::new(stream, detail)
        .with_peer_certificates(certs)
        .boxed())
}

/// Parser for `wss:` addresses; listeners share sockets through `shared`.
#[derive(Debug, Clone)]
pub struct WssAddressParser {
    shared: Arc<SharedListenerRegistry>,
}

impl WssAddressParser {
    pub fn new(shared: Arc<SharedListenerRegistry>) -> Self {
        Self { shared }
    }
}

impl AddressParser for WssAddressParser {
    fn protocol_type(&self) -> &'static str {
        TYPE
    }

    fn parse(&self, input: &str) -> Result<Box<dyn Address>> {
        let (hostname, port) = parse_address_host_port(input, TYPE)?;
        Ok(Box::new(WssAddress {
            hostname,
            port,
            shared: self.shared.clone(),
        }))
    }
}
