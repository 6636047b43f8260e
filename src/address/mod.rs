//! Addresses and the parser registry.
//!
//! # Data Flow
//! ```text
//! "tls:[::1]:443"
//!     → AddressRegistry::parse (parsers tried in registration order)
//!     → Box<dyn Address> for the first parser that accepts it
//!     → dial / listen through the protocol's own implementation
//! ```
//!
//! # Design Decisions
//! - A parser signals "not mine" with a parse error; only the registry decides
//!   that nothing matched
//! - The registry is owned by a `TransportContext`, not a process-wide global

pub mod hostport;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::config::Configuration;
use crate::error::{Result, TransportError};
use crate::net::connection::Connection;
use crate::net::identity::Identity;
use crate::net::listener::{AcceptFn, Closer};

pub use hostport::{host_port_string, parse_address_host_port};

/// A parsed, protocol-tagged endpoint.
///
/// `Display` yields a string the same protocol's parser accepts again.
#[async_trait]
pub trait Address: fmt::Display + fmt::Debug + Send + Sync {
    /// Open an outbound connection. A zero `timeout` means no timeout.
    async fn dial(
        &self,
        name: &str,
        identity: Option<&Identity>,
        timeout: Duration,
        config: &Configuration,
    ) -> Result<Box<dyn Connection>>;

    /// Like [`Address::dial`], originating traffic from `local_binding`
    /// (an interface name or literal IP; empty or "default" means no preference).
    async fn dial_with_local_binding(
        &self,
        name: &str,
        local_binding: &str,
        identity: Option<&Identity>,
        timeout: Duration,
        config: &Configuration,
    ) -> Result<Box<dyn Connection>>;

    /// Start accepting inbound connections, delivering each to `accept`.
    async fn listen(
        &self,
        name: &str,
        identity: Option<&Identity>,
        accept: AcceptFn,
        config: &Configuration,
    ) -> Result<Box<dyn Closer>>;

    /// [`Address::listen`] for setup code that cannot continue without the listener.
    ///
    /// # Panics
    /// Panics if the listener cannot be created.
    async fn must_listen(
        &self,
        name: &str,
        identity: Option<&Identity>,
        accept: AcceptFn,
        config: &Configuration,
    ) -> Box<dyn Closer> {
        match self.listen(name, identity, accept, config).await {
            Ok(closer) => closer,
            Err(err) => panic!("failed to listen on {self}: {err}"),
        }
    }

    fn protocol_type(&self) -> &'static str;

    fn hostname(&self) -> &str;

    fn port(&self) -> u16;
}

/// Turns address strings into [`Address`] values for one protocol.
pub trait AddressParser: Send + Sync {
    fn protocol_type(&self) -> &'static str;

    /// Parse `input`, returning a parse error if it belongs to another protocol.
    fn parse(&self, input: &str) -> Result<Box<dyn Address>>;
}

/// Ordered, append-only set of address parsers.
#[derive(Default)]
pub struct AddressRegistry {
    parsers: RwLock<Vec<Arc<dyn AddressParser>>>,
}

impl AddressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a parser. Returns false if the same parser, or one for the same
    /// protocol type, is already registered.
    pub fn register(&self, parser: Arc<dyn AddressParser>) -> bool {
        let mut parsers = self.parsers.write();
        let duplicate = parsers
            .iter()
            .any(|p| Arc::ptr_eq(p, &parser) || p.protocol_type() == parser.protocol_type());
        if duplicate {
            return false;
        }
        tracing::debug!(protocol = parser.protocol_type(), "address parser registered");
        parsers.push(parser);
        true
    }

    /// Parse with the first registered parser that accepts `input`.
    pub fn parse(&self, input: &str) -> Result<Box<dyn Address>> {
        let parsers = self.parsers.read().clone();
        if parsers.is_empty() {
            return Err(TransportError::NoParsersConfigured);
        }

        for parser in &parsers {
            match parser.parse(input) {
                Ok(address) => return Ok(address),
                Err(err) => {
                    tracing::trace!(protocol = parser.protocol_type(), error = %err, "parser rejected address");
                }
            }
        }

        Err(TransportError::AddressNotParsed(input.to_string()))
    }

    pub fn protocol_types(&self) -> Vec<&'static str> {
        self.parsers.read().iter().map(|p| p.protocol_type()).collect()
    }

    pub fn len(&self) -> usize {
        self.parsers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.parsers.read().is_empty()
    }
}

impl fmt::Debug for AddressRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressRegistry")
            .field("parsers", &self.protocol_types())
            .finish()
    }
}
