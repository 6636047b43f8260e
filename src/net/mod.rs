//! Network building blocks shared by the protocol adapters.
//!
//! # Data Flow
//! ```text
//! Outbound:
//!     binding.rs (local interface → source IP, dial timeout)
//!     → proxy.rs (optional HTTP CONNECT tunnel, TLS only)
//!     → protocol handshake
//!     → connection.rs (StreamConnection: detail, deadlines, peer certs)
//!
//! Inbound:
//!     protocol accept loop (stopped through listener.rs handles)
//!     → identity.rs (server config, peer certificate checks)
//!     → connection.rs
//!     → caller's AcceptFn
//! ```
//!
//! # Design Decisions
//! - Every protocol hands out the same `Connection` trait object
//! - Rate shaping is a decorator (shaper.rs), not a property of the socket

pub mod binding;
pub mod connection;
pub mod identity;
pub mod listener;
pub mod proxy;
pub mod shaper;

pub use connection::{Connection, ConnectionDetail, ConnectionId, Socket, StreamConnection};
pub use identity::Identity;
pub use listener::{accept_fn, AcceptFn, Closer, ListenerHandle};
pub use shaper::{limit_writer, LimitWriter};
