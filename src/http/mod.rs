//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection
//!     → server.rs (Axum router, global layers, serve loop)
//!     → request.rs (request context: client IP, authenticated user)
//!     → body.rs (bounded buffering for logging and replay capture)
//!     → pipeline stages → forwarder or health handler
//!     → Send to client
//! ```

pub mod body;
pub mod request;
pub mod server;

pub use request::{RequestContext, X_IDEMPOTENCY_HIT, X_IDEMPOTENCY_KEY, X_REQUEST_ID, X_USER_ID};
pub use server::GatewayServer;
