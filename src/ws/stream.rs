//! Byte-stream view of a WebSocket.
//!
//! Binary and text messages are read as data; each write becomes one binary
//! message. A close frame reads as end of stream.
//!
//! # Keepalive
//! Pings are sent every `ping_interval` while the stream is being read, and a
//! peer that sends no frame at all for `pong_timeout` fails the read with
//! `TimedOut`. A write or flush that makes no progress for `write_timeout`
//! fails the same way. A zero duration disables the respective check.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use bytes::{Buf, Bytes};
use futures_util::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Sleep};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

use crate::net::connection::Socket;

/// Keepalive and write limits for an upgraded connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WsTimeouts {
    pub write_timeout: Duration,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
}

fn timer(after: Duration) -> Option<Pin<Box<Sleep>>> {
    (!after.is_zero()).then(|| Box::pin(tokio::time::sleep(after)))
}

pub struct WsStream<S> {
    inner: WebSocketStream<S>,
    pending: Bytes,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    eof: bool,
    timeouts: WsTimeouts,
    ping: Option<Pin<Box<Sleep>>>,
    ping_due: bool,
    ping_unflushed: bool,
    silence: Option<Pin<Box<Sleep>>>,
    write_stall: Option<Pin<Box<Sleep>>>,
}

impl<S> WsStream<S> {
    pub fn new(inner: WebSocketStream<S>, local_addr: SocketAddr, peer_addr: SocketAddr) -> Self {
        Self {
            inner,
            pending: Bytes::new(),
            local_addr,
            peer_addr,
            eof: false,
            timeouts: WsTimeouts::default(),
            ping: None,
            ping_due: false,
            ping_unflushed: false,
            silence: None,
            write_stall: None,
        }
    }

    /// Arm keepalive and write limits. Must be called within a tokio runtime.
    pub fn with_timeouts(mut self, timeouts: WsTimeouts) -> Self {
        self.timeouts = timeouts;
        self.ping = timer(timeouts.ping_interval);
        self.silence = timer(timeouts.pong_timeout);
        self
    }

    fn heard_from_peer(&mut self) {
        if let Some(silence) = self.silence.as_mut() {
            silence.as_mut().reset(Instant::now() + self.timeouts.pong_timeout);
        }
    }

    /// A write made no progress; fails once it has been stalled for `write_timeout`.
    fn write_stalled<T>(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<T>> {
        let limit = self.timeouts.write_timeout;
        if limit.is_zero() {
            return Poll::Pending;
        }
        let stall = self.write_stall.get_or_insert_with(|| Box::pin(tokio::time::sleep(limit)));
        ready!(stall.as_mut().poll(cx));
        self.write_stall = None;
        Poll::Ready(Err(io::Error::new(io::ErrorKind::TimedOut, "websocket write timed out")))
    }
}

fn to_io(err: WsError) -> io::Error {
    match err {
        WsError::Io(e) => e,
        other => io::Error::other(other),
    }
}

impl<S> WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Driven from the read side: sends due pings and enforces the pong timeout.
    fn poll_keepalive(&mut self, cx: &mut Context<'_>) -> io::Result<()> {
        if let Some(silence) = self.silence.as_mut() {
            if silence.as_mut().poll(cx).is_ready() {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no frame from websocket peer within {:?}", self.timeouts.pong_timeout),
                ));
            }
        }

        if let Some(ping) = self.ping.as_mut() {
            if ping.as_mut().poll(cx).is_ready() {
                ping.as_mut().reset(Instant::now() + self.timeouts.ping_interval);
                // Registers the waker for the next tick.
                let _ = ping.as_mut().poll(cx);
                self.ping_due = true;
            }
        }

        if self.ping_due {
            if let Poll::Ready(ready) = Pin::new(&mut self.inner).poll_ready(cx) {
                ready.map_err(to_io)?;
                Pin::new(&mut self.inner)
                    .start_send(Message::Ping(Bytes::new()))
                    .map_err(to_io)?;
                tracing::trace!(peer_addr = %self.peer_addr, "sent websocket ping");
                self.ping_due = false;
                self.ping_unflushed = true;
            }
        }

        if self.ping_unflushed {
            if let Poll::Ready(flushed) = Pin::new(&mut self.inner).poll_flush(cx) {
                flushed.map_err(to_io)?;
                self.ping_unflushed = false;
            }
        }
        Ok(())
    }
}

impl<S> AsyncRead for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        while this.pending.is_empty() {
            if this.eof {
                return Poll::Ready(Ok(()));
            }
            this.poll_keepalive(cx)?;

            let next = ready!(Pin::new(&mut this.inner).poll_next(cx));
            if matches!(next, Some(Ok(_))) {
                this.heard_from_peer();
            }
            match next {
                Some(Ok(Message::Binary(data))) => this.pending = data,
                Some(Ok(message @ Message::Text(_))) => this.pending = message.into_data(),
                Some(Ok(Message::Close(_))) | None => this.eof = true,
                // Control frames are answered by tungstenite itself.
                Some(Ok(_)) => {}
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => this.eof = true,
                Some(Err(e)) => return Poll::Ready(Err(to_io(e))),
            }
        }

        let n = this.pending.len().min(buf.remaining());
        buf.put_slice(&this.pending[..n]);
        this.pending.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl<S> AsyncWrite for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_ready(cx) {
            Poll::Pending => return this.write_stalled(cx),
            Poll::Ready(ready) => ready.map_err(to_io)?,
        }
        this.write_stall = None;
        Pin::new(&mut this.inner)
            .start_send(Message::binary(Bytes::copy_from_slice(buf)))
            .map_err(to_io)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_flush(cx) {
            Poll::Pending => this.write_stalled(cx),
            Poll::Ready(flushed) => {
                this.write_stall = None;
                Poll::Ready(flushed.map_err(to_io))
            }
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match ready!(Pin::new(&mut self.get_mut().inner).poll_close(cx)) {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Poll::Ready(Ok(())),
            Err(e) => Poll::Ready(Err(to_io(e))),
        }
    }
}

impl<S> Socket for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.peer_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio_tungstenite::tungstenite::protocol::{Role, WebSocketConfig};

    async fn pair_with(capacity: usize) -> (WsStream<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (a, b) = tokio::io::duplex(capacity);
        let eager = WebSocketConfig::default().write_buffer_size(0);
        let server = WebSocketStream::from_raw_socket(a, Role::Server, Some(eager)).await;
        let client = WebSocketStream::from_raw_socket(b, Role::Client, None).await;
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        (WsStream::new(server, addr, addr), client)
    }

    async fn pair() -> (WsStream<DuplexStream>, WebSocketStream<DuplexStream>) {
        pair_with(64 * 1024).await
    }

    #[tokio::test]
    async fn messages_become_bytes() {
        let (mut stream, mut peer) = pair().await;

        peer.send(Message::binary(Bytes::from_static(b"bin"))).await.unwrap();
        peer.send(Message::text("txt")).await.unwrap();
        let mut buf = [0u8; 6];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"bintxt");

        stream.write_all(b"reply").await.unwrap();
        stream.flush().await.unwrap();
        let message = peer.next().await.unwrap().unwrap();
        assert_eq!(message, Message::binary(Bytes::from_static(b"reply")));
    }

    #[tokio::test]
    async fn close_reads_as_eof() {
        let (mut stream, mut peer) = pair().await;
        peer.close(None).await.unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn pings_on_interval_while_reading() {
        let (stream, mut peer) = pair().await;
        let mut stream = stream.with_timeouts(WsTimeouts {
            ping_interval: Duration::from_secs(1),
            ..WsTimeouts::default()
        });
        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.map(|_| buf)
        });

        for _ in 0..2 {
            let message = peer.next().await.unwrap().unwrap();
            assert!(message.is_ping());
        }
        peer.send(Message::binary(Bytes::from_static(b"data"))).await.unwrap();
        assert_eq!(&reader.await.unwrap().unwrap(), b"data");
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out() {
        let (stream, _peer) = pair().await;
        let mut stream = stream.with_timeouts(WsTimeouts {
            pong_timeout: Duration::from_secs(2),
            ..WsTimeouts::default()
        });

        let started = Instant::now();
        let mut buf = [0u8; 1];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn frames_keep_the_peer_alive() {
        let (stream, mut peer) = pair().await;
        let mut stream = stream.with_timeouts(WsTimeouts {
            pong_timeout: Duration::from_secs(2),
            ..WsTimeouts::default()
        });

        let mut buf = [0u8; 1];
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            peer.send(Message::binary(Bytes::from_static(b"x"))).await.unwrap();
            stream.read_exact(&mut buf).await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_write_times_out() {
        let (stream, _peer) = pair_with(64).await;
        let mut stream = stream.with_timeouts(WsTimeouts {
            write_timeout: Duration::from_secs(1),
            ..WsTimeouts::default()
        });

        let payload = vec![7u8; 4096];
        let result = async {
            for _ in 0..8 {
                stream.write_all(&payload).await?;
            }
            stream.flush().await
        }
        .await;
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::TimedOut);
    }
}
