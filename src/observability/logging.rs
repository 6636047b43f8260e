//! Structured logging.
//!
//! # Responsibilities
//! - Initialize logging subsystem
//! - Configure log level from the environment with a configured fallback
//!
//! # Design Decisions
//! - Uses tracing crate for structured logging
//! - `RUST_LOG` wins over the configured level so operators can raise verbosity
//!   without editing config files

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global tracing subscriber.
///
/// `default_level` is used when `RUST_LOG` is unset or invalid. Calling this
/// twice is harmless: the second installation attempt is ignored.
pub fn init_logging(default_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("overlay_transport={default_level},proxylink={default_level}").into());

    let result = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();

    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

/// Map the CLI verbosity flag onto a level name.
pub fn level_for(verbose: bool) -> &'static str {
    if verbose {
        "debug"
    } else {
        "info"
    }
}
