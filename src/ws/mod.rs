//! WebSocket transports.
//!
//! # Design Decisions
//! - `wss` listeners ride on the shared TLS listener under the `http/1.1`
//!   identifier (configurable via `wss.protocols`), so they can share a port
//!   with plain TLS listeners
//! - Plaintext `ws` addresses parse but refuse to dial or listen
//! - `wss` is listen-only; outbound WebSocket is not provided

pub mod stream;
pub mod wss;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::address::{host_port_string, parse_address_host_port, Address, AddressParser};
use crate::config::Configuration;
use crate::error::{Result, TransportError};
use crate::net::listener::{AcceptFn, Closer};
use crate::net::{Connection, Identity};

pub use stream::WsStream;
pub use wss::{WssAddress, WssAddressParser};

pub const TYPE: &str = "ws";

fn unsupported(operation: &str) -> TransportError {
    TransportError::Unsupported(format!("{operation} is not supported for {TYPE} addresses, use wss"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsAddress {
    hostname: String,
    port: u16,
}

impl fmt::Display for WsAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{TYPE}:{}", host_port_string(&self.hostname, self.port))
    }
}

#[async_trait]
impl Address for WsAddress {
    async fn dial(
        &self,
        _name: &str,
        _identity: Option<&Identity>,
        _timeout: Duration,
        _config: &Configuration,
    ) -> Result<Box<dyn Connection>> {
        Err(unsupported("dial"))
    }

    async fn dial_with_local_binding(
        &self,
        _name: &str,
        _local_binding: &str,
        _identity: Option<&Identity>,
        _timeout: Duration,
        _config: &Configuration,
    ) -> Result<Box<dyn Connection>> {
        Err(unsupported("dial"))
    }

    async fn listen(
        &self,
        _name: &str,
        _identity: Option<&Identity>,
        _accept: AcceptFn,
        _config: &Configuration,
    ) -> Result<Box<dyn Closer>> {
        Err(unsupported("listen"))
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

/// Parser for `ws:` addresses.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsAddressParser;

impl AddressParser for WsAddressParser {
    fn protocol_type(&self) -> &'static str {
        TYPE
    }

    fn parse(&self, input: &str) -> Result<Box<dyn Address>> {
        let (hostname, port) = parse_address_host_port(input, TYPE)?;
        Ok(Box::new(WsAddress { hostname, port }))
    }
}
