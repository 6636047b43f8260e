//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Listener accept loops (shutdown.rs):
//!     close() → Shutdown::trigger → loop observes signal → socket dropped
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → binaries close their listeners and exit
//! ```
//!
//! # Design Decisions
//! - Shutdown is level-triggered: a loop that subscribes late still observes it
//! - Closing a listener never tears down connections already handed out

pub mod shutdown;
pub mod signals;

pub use shutdown::{Shutdown, ShutdownSignal};
