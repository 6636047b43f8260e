//! TLS transport with ALPN-multiplexed listening.
//!
//! # Data Flow
//! ```text
//! Dial:   address.rs → dialer.rs (local binding, optional HTTP CONNECT) → TLS client handshake
//! Listen: address.rs → shared.rs (one socket per bind address)
//!                    → routing.rs (ClientHello ALPN → handler)
//!                    → handler's AcceptFn
//! ```
//!
//! # Design Decisions
//! - Listeners sharing a port are told apart only by ALPN; `""` is the
//!   identifier for clients that send none
//! - Handlers come and go independently; the socket lives as long as at least
//!   one handler is registered

pub mod address;
mod dialer;
pub mod incoming;
pub mod routing;
pub mod shared;

pub use address::{TlsAddress, TlsAddressParser};
pub use incoming::{listen_tls, TlsIncoming};
pub use shared::{HandlerRegistration, ProtocolHandler, SharedListenerRegistry};

pub const TYPE: &str = "tls";
