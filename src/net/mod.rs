//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → plain: tokio TcpListener served by axum
//!     → TLS:   tls.rs (rustls via axum-server)
//!     → Hand off to the HTTP layer
//! ```

pub mod tls;

pub use tls::load_tls_config;
