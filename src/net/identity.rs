//! TLS identity and certificate handling.
//!
//! An [`Identity`] is the boundary to whatever manages certificates: it only
//! hands out ready-made rustls configurations. Loading from PEM files is a
//! convenience for binaries and tests.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::client::ClientConfig;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ParsedCertificate, ServerConfig, WebPkiClientVerifier};
use rustls::RootCertStore;

use crate::config::ConfigError;
use crate::error::{Result, TransportError};

/// Crypto provider used for every config this crate builds.
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Server and client TLS configuration for one node.
#[derive(Debug, Clone, Default)]
pub struct Identity {
    server: Option<Arc<ServerConfig>>,
    client: Option<Arc<ClientConfig>>,
}

impl Identity {
    pub fn new(server: Arc<ServerConfig>, client: Arc<ClientConfig>) -> Self {
        Self {
            server: Some(server),
            client: Some(client),
        }
    }

    pub fn server_only(server: Arc<ServerConfig>) -> Self {
        Self {
            server: Some(server),
            client: None,
        }
    }

    pub fn client_only(client: Arc<ClientConfig>) -> Self {
        Self {
            server: None,
            client: Some(client),
        }
    }

    /// Config used when accepting; required by TLS-family listeners.
    pub fn server_config(&self) -> Result<Arc<ServerConfig>> {
        self.server
            .clone()
            .ok_or_else(|| ConfigError::Missing("server TLS configuration in identity".to_string()).into())
    }

    /// Config used when dialing; required by TLS-family dialers.
    pub fn client_config(&self) -> Result<Arc<ClientConfig>> {
        self.client
            .clone()
            .ok_or_else(|| ConfigError::Missing("client TLS configuration in identity".to_string()).into())
    }

    /// Build an identity from PEM files.
    ///
    /// With a CA bundle the server requires client certificates signed by it
    /// and a client config (trusting the CA, presenting the same certificate)
    /// is produced. Without one only the server side is available.
    pub fn from_pem_files(cert_path: &Path, key_path: &Path, ca_path: Option<&Path>) -> Result<Self> {
        let certs = load_certs(cert_path)?;
        let key = load_private_key(key_path)?;

        let Some(ca_path) = ca_path else {
            let server = ServerConfig::builder_with_provider(crypto_provider())
                .with_safe_default_protocol_versions()?
                .with_no_client_auth()
                .with_single_cert(certs, key)
                .map_err(certificate_error)?;
            return Ok(Self::server_only(Arc::new(server)));
        };

        let mut roots = RootCertStore::empty();
        for ca in load_certs(ca_path)? {
            roots.add(ca).map_err(certificate_error)?;
        }
        let roots = Arc::new(roots);

        let verifier = WebPkiClientVerifier::builder_with_provider(roots.clone(), crypto_provider())
            .build()
            .map_err(|e| TransportError::Certificate(e.to_string()))?;

        let server = ServerConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()?
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs.clone(), key.clone_key())
            .map_err(certificate_error)?;

        let client = ClientConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)
            .map_err(certificate_error)?;

        Ok(Self::new(Arc::new(server), Arc::new(client)))
    }
}

fn certificate_error(err: rustls::Error) -> TransportError {
    TransportError::Certificate(err.to_string())
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<std::io::Result<Vec<_>>>()?;
    if certs.is_empty() {
        return Err(TransportError::Certificate(format!("no certificates in {}", path.display())));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| TransportError::Certificate(format!("no private key in {}", path.display())))
}

/// Check every certificate the peer presented and take ownership of the chain.
///
/// A certificate that does not parse fails the whole connection.
pub fn parse_peer_certificates(certs: Option<&[CertificateDer<'_>]>) -> Result<Vec<CertificateDer<'static>>> {
    let Some(certs) = certs else {
        return Ok(Vec::new());
    };

    certs
        .iter()
        .map(|cert| {
            ParsedCertificate::try_from(cert).map_err(|e| TransportError::Certificate(e.to_string()))?;
            Ok(cert.clone().into_owned())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn write_pem_pair(tag: &str) -> (PathBuf, PathBuf) {
        rustls::crypto::ring::default_provider().install_default().ok();
        let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let dir = std::env::temp_dir().join(format!("overlay-identity-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let cert = dir.join("cert.pem");
        let key = dir.join("key.pem");
        std::fs::write(&cert, generated.cert.pem()).unwrap();
        std::fs::write(&key, generated.key_pair.serialize_pem()).unwrap();
        (cert, key)
    }

    #[test]
    fn loads_server_only_identity() {
        let (cert, key) = write_pem_pair("server");
        let identity = Identity::from_pem_files(&cert, &key, None).unwrap();
        assert!(identity.server_config().is_ok());
        assert!(matches!(identity.client_config(), Err(TransportError::Config(_))));
    }

    #[test]
    fn ca_enables_client_side() {
        let (cert, key) = write_pem_pair("mutual");
        let identity = Identity::from_pem_files(&cert, &key, Some(&cert)).unwrap();
        assert!(identity.server_config().is_ok());
        assert!(identity.client_config().is_ok());
    }

    #[test]
    fn missing_key_file_is_io_error() {
        let (cert, _) = write_pem_pair("missing");
        let result = Identity::from_pem_files(&cert, Path::new("/no/such/key.pem"), None);
        assert!(matches!(result, Err(TransportError::Io(_))));
    }

    #[test]
    fn garbage_certificate_is_rejected() {
        let bogus = CertificateDer::from(vec![0x30, 0x03, 0x01, 0x02, 0x03]);
        let result = parse_peer_certificates(Some(&[bogus]));
        assert!(matches!(result, Err(TransportError::Certificate(_))));
        assert!(parse_peer_certificates(None).unwrap().is_empty());
    }

    #[test]
    fn valid_chain_is_kept() {
        let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let der = generated.cert.der().clone();
        let chain = parse_peer_certificates(Some(std::slice::from_ref(&der))).unwrap();
        assert_eq!(chain.len(), 1);
    }
}
