//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Shutdown::trigger
//!
//! Shutdown (shutdown.rs):
//!     Broadcast → server stops accepting → in-flight requests drain
//!     → forced close after the grace period
//! ```
//!
//! # Design Decisions
//! - Fail fast at startup: config, cache and listener errors are fatal
//! - Shutdown has a deadline (`timeouts.shutdown_grace_secs`)

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::wait_for_signal;
