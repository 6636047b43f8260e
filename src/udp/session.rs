//! Byte-stream view of a UDP peer.
//!
//! Each write is sent as one datagram. Reads drain one datagram at a time; a
//! datagram larger than the caller's buffer is handed out over several reads.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::net::connection::Socket;

/// Largest datagram a session reads.
pub const MAX_DATAGRAM: usize = u16::MAX as usize;

enum Source {
    /// Connected socket owned by this session.
    Connected { scratch: Vec<u8> },
    /// Datagrams routed to this peer by a listener's demux loop.
    Demuxed(mpsc::Receiver<Bytes>),
}

pub struct UdpSession {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    source: Source,
    pending: Bytes,
}

impl UdpSession {
    /// Session over a socket already `connect`ed to `peer`.
    pub fn connected(socket: UdpSocket, peer: SocketAddr) -> Self {
        Self {
            socket: Arc::new(socket),
            peer,
            source: Source::Connected { scratch: Vec::new() },
            pending: Bytes::new(),
        }
    }

    /// Session fed by a listener; replies go out through the shared socket.
    pub(crate) fn demuxed(socket: Arc<UdpSocket>, peer: SocketAddr, datagrams: mpsc::Receiver<Bytes>) -> Self {
        Self {
            socket,
            peer,
            source: Source::Demuxed(datagrams),
            pending: Bytes::new(),
        }
    }
}

impl AsyncRead for UdpSession {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        while this.pending.is_empty() {
            match &mut this.source {
                Source::Connected { scratch } => {
                    if scratch.is_empty() {
                        scratch.resize(MAX_DATAGRAM, 0);
                    }
                    let mut datagram = ReadBuf::new(scratch);
                    ready!(this.socket.poll_recv(cx, &mut datagram))?;
                    this.pending = Bytes::copy_from_slice(datagram.filled());
                }
                Source::Demuxed(datagrams) => match ready!(datagrams.poll_recv(cx)) {
                    Some(datagram) => this.pending = datagram,
                    // Listener gone: end of stream.
                    None => return Poll::Ready(Ok(())),
                },
            }
        }

        let n = this.pending.len().min(buf.remaining());
        buf.put_slice(&this.pending[..n]);
        this.pending.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for UdpSession {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match this.source {
            Source::Connected { .. } => this.socket.poll_send(cx, buf),
            Source::Demuxed(_) => this.socket.poll_send_to(cx, buf, this.peer),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl Socket for UdpSession {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn large_datagram_spans_reads() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let (tx, rx) = mpsc::channel(4);
        let mut session = UdpSession::demuxed(socket, "127.0.0.1:9".parse().unwrap(), rx);

        tx.send(Bytes::from_static(b"hello world")).await.unwrap();
        let mut first = [0u8; 5];
        session.read_exact(&mut first).await.unwrap();
        assert_eq!(&first, b"hello");

        let mut rest = [0u8; 16];
        let n = session.read(&mut rest).await.unwrap();
        assert_eq!(&rest[..n], b" world");

        drop(tx);
        assert_eq!(session.read(&mut rest).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn connected_round_trip() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        client.connect(server_addr).await.unwrap();
        let mut session = UdpSession::connected(client, server_addr);

        session.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");

        server.send_to(b"pong", from).await.unwrap();
        let n = session.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");
        assert_eq!(session.peer_addr().unwrap(), server_addr);
    }
}
