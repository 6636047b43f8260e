//! Error types shared by every transport.
//!
//! # Design Decisions
//! - One error enum for the whole crate so protocol adapters compose with `?`
//! - Per-connection failures (handshake, certificates) are distinct variants so
//!   accept loops can log and continue instead of tearing down the listener

use std::io;
use std::time::Duration;

use crate::config::ConfigError;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors produced by address parsing, dialing and listening.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Address text did not match the expected grammar.
    #[error("invalid {protocol} address '{input}': {reason}")]
    Parse {
        protocol: &'static str,
        input: String,
        reason: String,
    },

    /// No parsers have been registered with the address registry.
    #[error("no configured address parsers")]
    NoParsersConfigured,

    /// Every registered parser rejected the address.
    #[error("address ({0}) not parsed")]
    AddressNotParsed(String),

    /// A protocol identifier is already claimed on a shared bind address.
    #[error("handler for protocol[{protocol}] already exists on {bind_address}")]
    Conflict {
        bind_address: String,
        protocol: String,
    },

    /// TLS handshake or protocol negotiation failed for one connection.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// A peer certificate could not be parsed.
    #[error("unable to parse peer certificate: {0}")]
    Certificate(String),

    /// Binding a listening socket failed.
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    /// Local binding could not be resolved to a source address.
    #[error("unable to resolve local binding '{binding}': {reason}")]
    Binding { binding: String, reason: String },

    /// HTTP CONNECT proxy refused or broke the tunnel.
    #[error("proxy {proxy} failed: {reason}")]
    Proxy { proxy: String, reason: String },

    /// Operation exceeded its deadline.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// Operation not supported by this protocol.
    #[error("{0}")]
    Unsupported(String),

    /// Invalid or missing configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Build a [`TransportError::Parse`]; custom parsers use this to reject input.
    pub fn parse(protocol: &'static str, input: &str, reason: impl Into<String>) -> Self {
        Self::Parse {
            protocol,
            input: input.to_string(),
            reason: reason.into(),
        }
    }

    /// Returns true when the error only concerns a single connection.
    pub fn is_per_connection(&self) -> bool {
        matches!(
            self,
            TransportError::Handshake(_) | TransportError::Certificate(_)
        )
    }
}

impl From<rustls::Error> for TransportError {
    fn from(err: rustls::Error) -> Self {
        TransportError::Handshake(err.to_string())
    }
}
