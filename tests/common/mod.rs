//! Shared fixtures for integration tests: certificates, rustls configs, raw
//! TLS clients and accept-callback collectors.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use overlay_transport::net::identity::crypto_provider;
use overlay_transport::{accept_fn, AcceptFn, Connection, Identity};

pub const WAIT: Duration = Duration::from_secs(5);

struct Pki {
    cert: CertificateDer<'static>,
    key: Vec<u8>,
}

/// One self-signed `localhost` certificate for the whole test binary.
fn pki() -> &'static Pki {
    static PKI: OnceLock<Pki> = OnceLock::new();
    PKI.get_or_init(|| {
        let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        Pki {
            cert: generated.cert.der().clone(),
            key: generated.key_pair.serialize_der(),
        }
    })
}

fn alpn(protocols: &[&str]) -> Vec<Vec<u8>> {
    protocols.iter().map(|p| p.as_bytes().to_vec()).collect()
}

pub fn server_config(protocols: &[&str]) -> Arc<ServerConfig> {
    let pki = pki();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(pki.key.clone()));
    let mut config = ServerConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![pki.cert.clone()], key)
        .unwrap();
    config.alpn_protocols = alpn(protocols);
    Arc::new(config)
}

pub fn client_config(protocols: &[&str]) -> Arc<ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots.add(pki().cert.clone()).unwrap();
    let mut config = ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = alpn(protocols);
    Arc::new(config)
}

/// Server and client configs for the shared test certificate, without ALPN.
pub fn identity() -> Identity {
    Identity::new(server_config(&[]), client_config(&[]))
}

/// Raw TLS client offering `protocols` (none when empty).
pub async fn tls_connect(addr: SocketAddr, protocols: &[&str]) -> std::io::Result<TlsStream<TcpStream>> {
    let tcp = TcpStream::connect(addr).await?;
    let name = ServerName::try_from("localhost").unwrap();
    TlsConnector::from(client_config(protocols)).connect(name, tcp).await
}

/// Negotiated ALPN identifier of a client stream, if any.
pub fn negotiated(stream: &TlsStream<TcpStream>) -> Option<String> {
    stream
        .get_ref()
        .1
        .alpn_protocol()
        .map(|p| String::from_utf8_lossy(p).into_owned())
}

/// Accept callback that forwards every connection into a channel.
pub fn collector() -> (AcceptFn, mpsc::UnboundedReceiver<Box<dyn Connection>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let accept = accept_fn(move |conn| {
        let _ = tx.send(conn);
    });
    (accept, rx)
}

pub async fn next(rx: &mut mpsc::UnboundedReceiver<Box<dyn Connection>>) -> Box<dyn Connection> {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a connection")
        .expect("accept channel closed")
}

/// Give in-flight handshakes a moment, then assert nothing was delivered.
pub async fn assert_nothing_delivered(rx: &mut mpsc::UnboundedReceiver<Box<dyn Connection>>) {
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err(), "unexpected connection delivered");
}
