//! `tls:<host>:<port>` addresses.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::address::hostport::bindable_address;
use crate::address::{host_port_string, parse_address_host_port, Address, AddressParser};
use crate::config::{ConfigError, Configuration, TlsOptions};
use crate::error::Result;
use crate::net::listener::{AcceptFn, Closer};
use crate::net::{Connection, Identity};
use crate::tls::dialer::TlsDial;
use crate::tls::shared::SharedListenerRegistry;
use crate::tls::TYPE;

pub struct TlsAddress {
    hostname: String,
    port: u16,
    shared: Arc<SharedListenerRegistry>,
}

impl TlsAddress {
    fn bindable(&self) -> String {
        bindable_address(&self.hostname, self.port)
    }

    async fn dial_from(
        &self,
        name: &str,
        local_binding: &str,
        identity: Option<&Identity>,
        timeout: Duration,
        config: &Configuration,
    ) -> Result<Box<dyn Connection>> {
        let options = TlsOptions::load(config)?;
        let destination = self.bindable();
        TlsDial {
            name,
            hostname: &self.hostname,
            destination: &destination,
            local_binding,
            identity,
            timeout,
            options: &options,
        }
        .connect()
        .await
    }
}

impl fmt::Display for TlsAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{TYPE}:{}", host_port_string(&self.hostname, self.port))
    }
}

impl fmt::Debug for TlsAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsAddress")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .finish()
    }
}

#[async_trait]
impl Address for TlsAddress {
    async fn dial(
        &self,
        name: &str,
        identity: Option<&Identity>,
        timeout: Duration,
        config: &Configuration,
    ) -> Result<Box<dyn Connection>> {
        self.dial_from(name, "", identity, timeout, config).await
    }

    async fn dial_with_local_binding(
        &self,
        name: &str,
        local_binding: &str,
        identity: Option<&Identity>,
        timeout: Duration,
        config: &Configuration,
    ) -> Result<Box<dyn Connection>> {
        self.dial_from(name, local_binding, identity, timeout, config).await
    }

    /// Registers on the shared listener for this address under `tls.protocols`,
    /// or under the identity's own ALPN list when none are configured.
    async fn listen(
        &self,
        name: &str,
        identity: Option<&Identity>,
        accept: AcceptFn,
        config: &Configuration,
    ) -> Result<Box<dyn Closer>> {
        let options = TlsOptions::load(config)?;
        let server = identity
            .ok_or_else(|| ConfigError::Missing("identity for tls listen".to_string()))?
            .server_config()?;

        let protocols = if options.protocols.is_empty() {
            server
                .alpn_protocols
                .iter()
                .map(|p| String::from_utf8_lossy(p).into_owned())
                .collect()
        } else {
            options.protocols.clone()
        };

        let registration = self.shared.listen(
            &self.bindable(),
            name,
            &protocols,
            server,
            accept,
            options.handshake_timeout(),
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

/// Parser for `tls:` addresses; listeners it produces share sockets through
/// `shared`.
#[derive(Debug, Clone)]
pub struct TlsAddressParser {
    shared: Arc<SharedListenerRegistry>,
}

impl TlsAddressParser {
    pub fn new(shared: Arc<SharedListenerRegistry>) -> Self {
        Self { shared }
    }
}

impl AddressParser for TlsAddressParser {
    fn protocol_type(&self) -> &'static str {
        TYPE
    }

    fn parse(&self, input: &str) -> Result<Box<dyn Address>> {
        let (hostname, port) = parse_address_host_port(input, TYPE)?;
        Ok(Box::new(TlsAddress {
            hostname,
            port,
            shared: self.shared.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_displays() {
        let parser = TlsAddressParser::new(Arc::new(SharedListenerRegistry::new()));
        let address = parser.parse("tls:[fe80::1]:443").unwrap();
        assert_eq!(address.hostname(), "fe80::1");
        assert_eq!(address.port(), 443);
        assert_eq!(address.to_string(), "tls:[fe80::1]:443");
        assert!(parser.parse("tcp:localhost:443").is_err());
        assert!(parser.parse("tls:localhost").is_err());
    }
}
