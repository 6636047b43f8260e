//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse into an untyped Configuration)
//!     → schema.rs (per-protocol namespace lookup, typed option views)
//!     → validation.rs (semantic checks per namespace)
//!     → protocol adapters read only their own namespace
//! ```
//!
//! # Design Decisions
//! - No central schema: every protocol validates its own subtree and fails alone
//! - Unknown keys are ignored so several protocol configs can share one document
//! - All typed views have defaults to allow minimal configs

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::load_config;
pub use schema::{Configuration, DtlsOptions, Namespace, ProxyConfig, ProxyType, TlsOptions, WsOptions};
pub use validation::ValidationError;

/// Error type for configuration handling.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid '{key}' value in [{namespace}]: {reason}")]
    InvalidValue {
        namespace: String,
        key: String,
        reason: String,
    },

    #[error("unsupported proxy type '{0}'")]
    UnsupportedProxyType(String),

    #[error("missing {0}")]
    Missing(String),

    #[error("validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
