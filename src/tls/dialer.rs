//! Outbound TLS connections, optionally through an HTTP CONNECT proxy.

use std::sync::Arc;
use std::time::Duration;

use rustls::client::ClientConfig;
use rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

use crate::config::{ConfigError, ProxyType, TlsOptions};
use crate::error::{Result, TransportError};
use crate::net::binding::{connect_tcp, resolve_local_binding, tune_tcp_stream, with_timeout};
use crate::net::identity::parse_peer_certificates;
use crate::net::proxy::HttpConnectProxyDialer;
use crate::net::{Connection, ConnectionDetail, Identity, StreamConnection};
use crate::tls::TYPE;

/// Everything needed to dial one TLS destination.
pub(crate) struct TlsDial<'a> {
    pub name: &'a str,
    pub hostname: &'a str,
    pub destination: &'a str,
    pub local_binding: &'a str,
    pub identity: Option<&'a Identity>,
    pub timeout: Duration,
    pub options: &'a TlsOptions,
}

impl TlsDial<'_> {
    pub(crate) async fn connect(&self) -> Result<Box<dyn Connection>> {
        with_timeout("tls dial", self.timeout, self.connect_inner()).await
    }

    async fn connect_inner(&self) -> Result<Box<dyn Connection>> {
        let identity = self
            .identity
            .ok_or_else(|| ConfigError::Missing("identity for tls dial".to_string()))?;
        let config = client_config_with_alpn(identity.client_config()?, &self.options.protocols);
        let local = resolve_local_binding(self.local_binding)?;

        let stream = match self.options.proxy.as_ref() {
            Some(proxy) if proxy.proxy_type()? == ProxyType::HttpConnect => {
                tracing::info!(destination = %self.destination, proxy = %proxy.address, "using http connect proxy");
                let mut stream = connect_tcp(&proxy.address, local).await?;
                let auth = proxy.auth().map(|(u, p)| (u.to_string(), p.to_string()));
                HttpConnectProxyDialer::new(proxy.address.as_str(), auth, self.timeout)
                    .connect(&mut stream, self.destination)
                    .await?;
                stream
            }
            _ => connect_tcp(self.destination, local).await?,
        };
        if let Err(e) = tune_tcp_stream(&stream) {
            tracing::debug!(destination = %self.destination, error = %e, "unable to tune dialed socket");
        }

        let server_name = ServerName::try_from(self.hostname.to_string())
            .map_err(|e| TransportError::Handshake(format!("invalid server name '{}': {e}", self.hostname)))?;
        let tls = TlsConnector::from(config)
            .connect(server_name, stream)
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;

        let certs = parse_peer_certificates(tls.get_ref().1.peer_certificates())?;
        tracing::debug!(destination = %self.destination, certificates = certs.len(), "server provided certificates");

        let detail = ConnectionDetail::new(format!("{TYPE}:{}", self.destination), false, self.name);
        Ok(StreamConnection::new(tls, detail).with_peer_certificates(certs).boxed())
    }
}

/// Append `protocols` to the client's ALPN list, cloning only when needed.
fn client_config_with_alpn(config: Arc<ClientConfig>, protocols: &[String]) -> Arc<ClientConfig> {
    if protocols.is_empty() {
        return config;
    }
    let mut config = (*config).clone();
    config
        .alpn_protocols
        .extend(protocols.iter().map(|p| p.as_bytes().to_vec()));
    Arc::new(config)
}
