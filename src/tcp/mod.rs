//! Plain TCP transport (`tcp:<host>:<port>`).

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;

use crate::address::hostport::bindable_address;
use crate::address::{host_port_string, parse_address_host_port, Address, AddressParser};
use crate::config::Configuration;
use crate::error::{Result, TransportError};
use crate::lifecycle::ShutdownSignal;
use crate::net::binding::{connect_tcp, resolve_local_binding, with_timeout};
use crate::net::listener::{is_transient_accept_error, AcceptFn, Closer, ListenerHandle};
use crate::net::{Connection, ConnectionDetail, Identity, StreamConnection};

pub const TYPE: &str = "tcp";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpAddress {
    hostname: String,
    port: u16,
}

impl TcpAddress {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
        }
    }

    fn bindable(&self) -> String {
        bindable_address(&self.hostname, self.port)
    }

    async fn dial_from(&self, name: &str, local_binding: &str, timeout: Duration) -> Result<Box<dyn Connection>> {
        let local = resolve_local_binding(local_binding)?;
        let destination = self.bindable();
        let stream = with_timeout("tcp dial", timeout, connect_tcp(&destination, local)).await?;

        tracing::debug!(name, destination = %destination, "tcp connection dialed");
        let detail = ConnectionDetail::new(format!("{TYPE}:{destination}"), false, name);
        Ok(StreamConnection::new(stream, detail).boxed())
    }
}

impl fmt::Display for TcpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{TYPE}:{}", host_port_string(&self.hostname, self.port))
    }
}

#[async_trait]
impl Address for TcpAddress {
    async fn dial(
        &self,
        name: &str,
        _identity: Option<&Identity>,
        timeout: Duration,
        _config: &Configuration,
    ) -> Result<Box<dyn Connection>> {
        self.dial_from(name, "", timeout).await
    }

    async fn dial_with_local_binding(
        &self,
        name: &str,
        local_binding: &str,
        _identity: Option<&Identity>,
        timeout: Duration,
        _config: &Configuration,
    ) -> Result<Box<dyn Connection>> {
        self.dial_from(name, local_binding, timeout).await
    }

    async fn listen(
        &self,
        name: &str,
        _identity: Option<&Identity>,
        accept: AcceptFn,
        _config: &Configuration,
    ) -> Result<Box<dyn Closer>> {
        let bind_address = self.bindable();
        let listener = TcpListener::bind(&bind_address)
            .await
            .map_err(|source| TransportError::Bind {
                address: bind_address.clone(),
                source,
            })?;

        let handle = ListenerHandle::new(TYPE, listener.local_addr()?);
        tracing::info!(name, bind_address = %bind_address, "tcp listener started");
        tokio::spawn(accept_loop(name.to_string(), listener, accept, handle.signal()));

        Ok(Box::new(handle))
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

async fn accept_loop(name: String, listener: TcpListener, accept: AcceptFn, mut shutdown: ShutdownSignal) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.recv() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer_addr)) => {
                let detail = ConnectionDetail::new(format!("{TYPE}:{peer_addr}"), true, name.as_str());
                accept(StreamConnection::new(stream, detail).boxed());
                tracing::info!(name = %name, peer_addr = %peer_addr, "accepted connection");
            }
            Err(e) if is_transient_accept_error(&e) => {
                tracing::debug!(name = %name, error = %e, "transient accept error");
            }
            Err(e) => {
                tracing::error!(name = %name, error = %e, "accept failed, failure not recoverable, exiting listen loop");
                return;
            }
        }
    }
    tracing::debug!(name = %name, "tcp accept loop exited");
}

/// Parser for `tcp:` addresses.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpAddressParser;

impl AddressParser for TcpAddressParser {
    fn protocol_type(&self) -> &'static str {
        TYPE
    }

    fn parse(&self, input: &str) -> Result<Box<dyn Address>> {
        let (hostname, port) = parse_address_host_port(input, TYPE)?;
        Ok(Box::new(TcpAddress { hostname, port }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_round_trips() {
        for input in ["tcp:localhost:80", "tcp:[::1]:8443", "tcp:10.0.0.1:0"] {
            let address = TcpAddressParser.parse(input).unwrap();
            assert_eq!(address.to_string(), input);
            assert_eq!(address.protocol_type(), "tcp");
        }
    }

    #[test]
    fn rejects_other_protocols() {
        assert!(TcpAddressParser.parse("tls:localhost:80").is_err());
    }
}
