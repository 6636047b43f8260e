//! Protocol-agnostic transport layer for an overlay network.
//!
//! Callers parse strings such as `tls:host:443` into an [`Address`] and then
//! dial or listen through one interface; each protocol supplies its own
//! sockets, handshakes and framing underneath.
//!
//! ```text
//!  "tls:0.0.0.0:443" ──▶ TransportContext::parse_address ──▶ Box<dyn Address>
//!                                                              │
//!                          ┌───────────────────────────────────┴──────────┐
//!                          ▼                                              ▼
//!                        dial                                          listen
//!      local binding ─▶ proxy (tls) ─▶ handshake        tcp/udp/dtls/transwarp: own socket
//!      ─▶ rate shaper (dtls) ─▶ Box<dyn Connection>          tls/wss: shared listener,
//!                                                            routed by ALPN ─▶ AcceptFn
//! ```

// Addressing and connections
pub mod address;
pub mod context;
pub mod net;

// Protocols
pub mod dtls;
pub mod tcp;
pub mod tls;
pub mod transwarp;
pub mod udp;
pub mod ws;

// Cross-cutting concerns
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod observability;

pub use address::{Address, AddressParser, AddressRegistry};
pub use config::Configuration;
pub use context::TransportContext;
pub use error::{Result, TransportError};
pub use net::{accept_fn, AcceptFn, Closer, Connection, ConnectionDetail, Identity};
