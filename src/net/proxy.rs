//! HTTP CONNECT tunnelling for outbound TLS.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, TransportError};
use crate::net::binding::with_timeout;

/// Upper bound on the proxy's response head.
const MAX_RESPONSE_HEAD: usize = 8 * 1024;
const MAX_RESPONSE_HEADERS: usize = 64;

/// Opens a tunnel through an HTTP proxy on an already-connected stream.
#[derive(Debug, Clone)]
pub struct HttpConnectProxyDialer {
    proxy: String,
    auth: Option<(String, String)>,
    timeout: Duration,
}

impl HttpConnectProxyDialer {
    /// `timeout` bounds the CONNECT exchange; zero disables it.
    pub fn new(proxy: impl Into<String>, auth: Option<(String, String)>, timeout: Duration) -> Self {
        Self {
            proxy: proxy.into(),
            auth,
            timeout,
        }
    }

    /// Send `CONNECT destination` and wait for a 2xx reply.
    ///
    /// On success the stream carries raw bytes to `destination`.
    pub async fn connect<S>(&self, stream: &mut S, destination: &str) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        with_timeout("http connect", self.timeout, self.exchange(stream, destination)).await
    }

    async fn exchange<S>(&self, stream: &mut S, destination: &str) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        stream.write_all(self.request(destination).as_bytes()).await?;
        stream.flush().await?;

        let head = read_response_head(stream).await.map_err(|reason| self.failure(reason))?;
        let status = parse_status(&head).map_err(|reason| self.failure(reason))?;
        if !(200..300).contains(&status) {
            return Err(self.failure(format!("CONNECT {destination} answered with status {status}")));
        }

        tracing::debug!(proxy = %self.proxy, destination, status, "http connect tunnel established");
        Ok(())
    }

    fn request(&self, destination: &str) -> String {
        let mut request = format!("CONNECT {destination} HTTP/1.1\r\nHost: {destination}\r\n");
        if let Some((user, password)) = &self.auth {
            let token = STANDARD.encode(format!("{user}:{password}"));
            request.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
        }
        request.push_str("\r\n");
        request
    }

    fn failure(&self, reason: impl Into<String>) -> TransportError {
        TransportError::Proxy {
            proxy: self.proxy.clone(),
            reason: reason.into(),
        }
    }
}

/// Read byte-by-byte up to the blank line so no tunnelled data is consumed.
async fn read_response_head<S>(stream: &mut S) -> std::result::Result<Vec<u8>, String>
where
    S: AsyncRead + Unpin,
{
    let mut head = Vec::with_capacity(128);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err("response head too large".to_string());
        }
        let n = stream.read(&mut byte).await.map_err(|e| e.to_string())?;
        if n == 0 {
            return Err("proxy closed the connection".to_string());
        }
        head.push(byte[0]);
    }
    Ok(head)
}

fn parse_status(head: &[u8]) -> std::result::Result<u16, String> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_RESPONSE_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(head) {
        Ok(httparse::Status::Complete(_)) => response
            .code
            .ok_or_else(|| "response has no status code".to_string()),
        Ok(httparse::Status::Partial) => Err("incomplete response head".to_string()),
        Err(e) => Err(format!("malformed response head: {e}")),
    }
}
