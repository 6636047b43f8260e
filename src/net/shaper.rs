//! Windowed write throttle.
//!
//! Time is cut into fixed windows of wall-clock time (`now` truncated to the
//! span). Once a window's byte quota is spent, the next write is held on a
//! tokio timer until the following window starts. A write is never split, so
//! one write may overshoot the quota; the overshoot is charged to the window
//! the write finished in.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Sleep};

use crate::net::connection::Socket;

/// Wrap `inner` so that at most `max_bytes` are started per `window_span`.
pub fn limit_writer<W>(inner: W, window_span: Duration, max_bytes: u64) -> LimitWriter<W>
where
    W: AsyncWrite + Unpin,
{
    LimitWriter::new(inner, window_span, max_bytes)
}

/// Maps the tokio clock onto wall-clock windows.
///
/// Wall time is sampled once and advanced with the tokio clock afterwards so
/// that paused-time tests see consistent windows.
#[derive(Debug, Clone, Copy)]
struct WindowClock {
    wall_anchor: Duration,
    instant_anchor: Instant,
    span_nanos: u128,
}

impl WindowClock {
    fn new(span: Duration) -> Self {
        Self {
            wall_anchor: SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default(),
            instant_anchor: Instant::now(),
            span_nanos: span.as_nanos().max(1),
        }
    }

    fn window_at(&self, at: Instant) -> u128 {
        let wall = self.wall_anchor + at.saturating_duration_since(self.instant_anchor);
        wall.as_nanos() / self.span_nanos
    }

    fn current(&self) -> u128 {
        self.window_at(Instant::now())
    }

    fn start_of(&self, window: u128) -> Instant {
        let wall_start = window * self.span_nanos;
        let offset = wall_start.saturating_sub(self.wall_anchor.as_nanos());
        self.instant_anchor + Duration::from_nanos(u64::try_from(offset).unwrap_or(u64::MAX))
    }
}

/// Write decorator returned by [`limit_writer`].
pub struct LimitWriter<W> {
    inner: W,
    clock: WindowClock,
    limit: u64,
    window: u128,
    written: u64,
    wait: Option<Pin<Box<Sleep>>>,
}

impl<W> LimitWriter<W> {
    fn new(inner: W, window_span: Duration, limit: u64) -> Self {
        let clock = WindowClock::new(window_span);
        Self {
            inner,
            window: clock.current(),
            clock,
            limit,
            written: 0,
            wait: None,
        }
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    /// Bytes charged to the current window.
    pub fn written_in_window(&self) -> u64 {
        self.written
    }

    fn roll(&mut self) {
        let now = self.clock.current();
        if now != self.window {
            self.window = now;
            self.written = 0;
        }
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for LimitWriter<W> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        loop {
            if let Some(wait) = this.wait.as_mut() {
                ready!(wait.as_mut().poll(cx));
                this.wait = None;
            }
            this.roll();
            if this.written < this.limit {
                break;
            }
            let next = this.clock.start_of(this.window + 1);
            this.wait = Some(Box::pin(tokio::time::sleep_until(next)));
        }

        let n = ready!(Pin::new(&mut this.inner).poll_write(cx, buf))?;

        let finished_in = this.clock.current();
        if finished_in != this.window {
            this.window = finished_in;
            this.written = n as u64;
        } else {
            this.written += n as u64;
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl<W: AsyncRead + Unpin> AsyncRead for LimitWriter<W> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<W: Socket> Socket for LimitWriter<W> {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test(start_paused = true)]
    async fn under_quota_is_not_delayed() {
        let mut writer = limit_writer(Vec::new(), Duration::from_secs(1), 100);
        let start = Instant::now();
        for _ in 0..5 {
            writer.write_all(&[0u8; 10]).await.unwrap();
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(writer.get_ref().len(), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn spent_quota_waits_for_next_window() {
        let mut writer = limit_writer(Vec::new(), Duration::from_secs(1), 10);
        let start = Instant::now();

        writer.write_all(&[1u8; 10]).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);

        writer.write_all(&[2u8; 10]).await.unwrap();
        let second = start.elapsed();
        assert!(second > Duration::ZERO && second <= Duration::from_millis(1001), "{second:?}");

        writer.write_all(&[3u8; 10]).await.unwrap();
        let third = start.elapsed() - second;
        assert!(third >= Duration::from_millis(999), "{third:?}");
        assert!(third <= Duration::from_millis(1001), "{third:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_write_is_not_fragmented() {
        let mut writer = limit_writer(Vec::new(), Duration::from_secs(1), 4);
        let n = writer.write(&[7u8; 64]).await.unwrap();
        assert_eq!(n, 64);
        assert_eq!(writer.written_in_window(), 64);
    }

    #[test]
    fn boundary_instant_belongs_to_new_window() {
        let clock = WindowClock::new(Duration::from_millis(250));
        let window = clock.window_at(clock.instant_anchor);
        let boundary = clock.start_of(window + 1);
        assert_eq!(clock.window_at(boundary), window + 1);
    }
}
