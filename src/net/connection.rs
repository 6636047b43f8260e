//! Uniform connection handle shared by all protocols.
//!
//! # Responsibilities
//! - Immutable per-connection metadata (`ConnectionDetail`)
//! - Read/write deadlines layered over any async byte stream
//! - Peer certificates captured at handshake time
//! - Unique connection IDs for tracing

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use rustls::pki_types::CertificateDer;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::{Instant, Sleep};

/// Global atomic counter for connection IDs.
/// Relaxed ordering is enough since we only need uniqueness.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Metadata fixed when a connection is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDetail {
    address: String,
    inbound: bool,
    name: String,
}

impl ConnectionDetail {
    pub fn new(address: impl Into<String>, inbound: bool, name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            inbound,
            name: name.into(),
        }
    }

    /// `<type>:<remote host-port>` for inbound, the dialed address for outbound.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_inbound(&self) -> bool {
        self.inbound
    }

    /// Logical name of the listener or dialer that produced the connection.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ConnectionDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let direction = if self.inbound { "inbound" } else { "outbound" };
        write!(f, "{}[{}] {}", self.name, direction, self.address)
    }
}

/// A native stream that knows its endpoints.
pub trait Socket: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    fn local_addr(&self) -> io::Result<SocketAddr>;

    fn peer_addr(&self) -> io::Result<SocketAddr>;
}

impl Socket for TcpStream {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::local_addr(self)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }
}

impl<IO: Socket> Socket for tokio_rustls::client::TlsStream<IO> {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.get_ref().0.local_addr()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.get_ref().0.peer_addr()
    }
}

impl<IO: Socket> Socket for tokio_rustls::server::TlsStream<IO> {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.get_ref().0.local_addr()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.get_ref().0.peer_addr()
    }
}

impl<S: Socket + ?Sized> Socket for Box<S> {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        (**self).local_addr()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        (**self).peer_addr()
    }
}

/// Duplex byte stream handed to callers by every protocol.
///
/// Use `tokio::io::split` to read and write from different tasks.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {
    fn id(&self) -> ConnectionId;

    fn detail(&self) -> &ConnectionDetail;

    /// Peer certificate chain from the handshake; empty for plaintext protocols.
    fn peer_certificates(&self) -> &[CertificateDer<'static>];

    fn local_addr(&self) -> io::Result<SocketAddr>;

    fn peer_addr(&self) -> io::Result<SocketAddr>;

    /// Reads pending at `deadline` fail with `TimedOut`. `None` clears it.
    fn set_read_deadline(&mut self, deadline: Option<Instant>);

    /// Writes pending at `deadline` fail with `TimedOut`. `None` clears it.
    fn set_write_deadline(&mut self, deadline: Option<Instant>);

    fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }
}

impl fmt::Debug for dyn Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("detail", self.detail())
            .finish()
    }
}

#[derive(Default)]
struct Deadline {
    sleep: Option<Pin<Box<Sleep>>>,
}

impl Deadline {
    fn set(&mut self, at: Option<Instant>) {
        match (at, self.sleep.as_mut()) {
            (Some(at), Some(sleep)) => sleep.as_mut().reset(at),
            (Some(at), None) => self.sleep = Some(Box::pin(tokio::time::sleep_until(at))),
            (None, _) => self.sleep = None,
        }
    }

    /// Registers the waker with the timer, so a pending operation is re-polled
    /// when the deadline passes.
    fn poll_expired(&mut self, cx: &mut Context<'_>) -> bool {
        match self.sleep.as_mut() {
            Some(sleep) => sleep.as_mut().poll(cx).is_ready(),
            None => false,
        }
    }
}

fn timed_out(operation: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("{operation} deadline exceeded"))
}

/// [`Connection`] over any [`Socket`].
pub struct StreamConnection<S> {
    id: ConnectionId,
    detail: ConnectionDetail,
    stream: S,
    certs: Vec<CertificateDer<'static>>,
    read_deadline: Deadline,
    write_deadline: Deadline,
}

impl<S: Socket> StreamConnection<S> {
    pub fn new(stream: S, detail: ConnectionDetail) -> Self {
        Self {
            id: ConnectionId::new(),
            detail,
            stream,
            certs: Vec::new(),
            read_deadline: Deadline::default(),
            write_deadline: Deadline::default(),
        }
    }

    pub fn with_peer_certificates(mut self, certs: Vec<CertificateDer<'static>>) -> Self {
        self.certs = certs;
        self
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    pub fn boxed(self) -> Box<dyn Connection> {
        Box::new(self)
    }
}

impl<S: Socket> AsyncRead for StreamConnection<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.read_deadline.poll_expired(cx) {
            return Poll::Ready(Err(timed_out("read")));
        }
        Pin::new(&mut this.stream).poll_read(cx, buf)
    }
}

impl<S: Socket> AsyncWrite for StreamConnection<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.write_deadline.poll_expired(cx) {
            return Poll::Ready(Err(timed_out("write")));
        }
        Pin::new(&mut this.stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.write_deadline.poll_expired(cx) {
            return Poll::Ready(Err(timed_out("flush")));
        }
        Pin::new(&mut this.stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

impl<S: Socket> Connection for StreamConnection<S> {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn detail(&self) -> &ConnectionDetail {
        &self.detail
    }

    fn peer_certificates(&self) -> &[CertificateDer<'static>] {
        &self.certs
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.read_deadline.set(deadline);
    }

    fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.write_deadline.set(deadline);
    }
}

impl<S> fmt::Debug for StreamConnection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamConnection")
            .field("id", &self.id)
            .field("detail", &self.detail)
            .field("peer_certificates", &self.certs.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), server.unwrap().0)
    }

    #[test]
    fn connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn detail_display() {
        let detail = ConnectionDetail::new("tcp:127.0.0.1:80", true, "edge");
        assert_eq!(detail.to_string(), "edge[inbound] tcp:127.0.0.1:80");
        assert!(detail.is_inbound());
    }

    #[tokio::test]
    async fn read_deadline_fires() {
        let (client, _server) = pair().await;
        let mut conn = StreamConnection::new(client, ConnectionDetail::new("tcp:x:1", false, "t"));
        conn.set_read_deadline(Some(Instant::now() + Duration::from_millis(20)));

        let mut buf = [0u8; 4];
        let err = conn.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        // Clearing the deadline makes reads usable again.
        conn.set_read_deadline(None);
        let (mut r, _w) = tokio::io::split(conn);
        assert!(tokio::time::timeout(Duration::from_millis(20), r.read(&mut buf)).await.is_err());
    }

    #[tokio::test]
    async fn passes_bytes_through() {
        let (client, mut server) = pair().await;
        let mut conn = StreamConnection::new(client, ConnectionDetail::new("tcp:x:1", false, "t"));
        conn.write_all(b"ping").await.unwrap();

        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert!(conn.peer_certificates().is_empty());
        assert_eq!(conn.peer_addr().unwrap(), server.local_addr().unwrap());
    }
}
