//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All transports produce:
//!     → tracing events with structured fields
//!       (bind_address, peer_addr, protocol, name)
//!     → logging.rs installs the subscriber in binaries
//! ```
//!
//! # Design Decisions
//! - The library only emits events; installing a subscriber is the binary's job
//! - Lifecycle at info, routing decisions at debug, failures at warn/error

pub mod logging;
