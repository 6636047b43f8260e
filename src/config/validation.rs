//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (buffer sizes > 0, timeouts > 0)
//! - Reject unsupported proxy types and duplicate protocol identifiers
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Each namespace validates independently: Options → Result<(), Vec<ValidationError>>

use std::collections::HashSet;
use std::fmt;

use crate::config::schema::{DtlsOptions, ProxyType, TlsOptions, WsOptions};

/// A single semantic problem in one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn finish(errors: Vec<ValidationError>) -> Result<(), Vec<ValidationError>> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_protocols(field: &str, protocols: &[String], errors: &mut Vec<ValidationError>) {
    let mut seen = HashSet::new();
    for proto in protocols {
        if proto.len() > 255 {
            errors.push(ValidationError::new(field, format!("'{proto}' exceeds 255 bytes")));
        }
        if !seen.insert(proto.as_str()) {
            errors.push(ValidationError::new(field, format!("'{proto}' listed twice")));
        }
    }
}

pub fn validate_tls(options: &TlsOptions) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if options.handshake_timeout_secs == 0 {
        errors.push(ValidationError::new("tls.handshakeTimeout", "must be greater than 0"));
    }
    check_protocols("tls.protocols", &options.protocols, &mut errors);

    if let Some(proxy) = &options.proxy {
        match proxy.proxy_type() {
            Ok(ProxyType::HttpConnect) if proxy.address.is_empty() => {
                errors.push(ValidationError::new("tls.proxy.address", "required for http proxies"));
            }
            Ok(_) => {}
            Err(e) => errors.push(ValidationError::new("tls.proxy.type", e.to_string())),
        }
    }

    finish(errors)
}

pub fn validate_dtls(options: &DtlsOptions) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if options.write_buffer_size == 0 {
        errors.push(ValidationError::new("dtls.writeBufferSize", "must be greater than 0"));
    }
    if options.read_buffer_size == 0 {
        errors.push(ValidationError::new("dtls.readBufferSize", "must be greater than 0"));
    }
    if options.max_bytes_per_second == Some(0) {
        errors.push(ValidationError::new("dtls.maxBytesPerSecond", "must be greater than 0"));
    }
    if options.handshake_timeout_secs == 0 {
        errors.push(ValidationError::new("dtls.handshakeTimeout", "must be greater than 0"));
    }

    finish(errors)
}

pub fn validate_ws(options: &WsOptions) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if options.handshake_timeout == 0 {
        errors.push(ValidationError::new("ws.handshakeTimeout", "must be greater than 0"));
    }
    if !options.path.starts_with('/') {
        errors.push(ValidationError::new("ws.path", "must start with '/'"));
    }
    if options.read_buffer_size == 0 || options.write_buffer_size == 0 {
        errors.push(ValidationError::new("ws.bufferSize", "must be greater than 0"));
    }
    check_protocols("ws.protocols", &options.protocols, &mut errors);

    finish(errors)
}
