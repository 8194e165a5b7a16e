//! API gateway library: authentication, rate limiting, idempotent replay and
//! reverse proxying in front of a fixed set of named backend services.

pub mod cache;
pub mod config;
pub mod error;
pub mod health;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod pipeline;
pub mod proxy;

pub use cache::Cache;
pub use config::GatewayConfig;
pub use error::GatewayError;
pub use http::GatewayServer;
pub use lifecycle::Shutdown;
