//! Reverse proxy subsystem.
//!
//! # Data Flow
//! ```text
//! /{service}/{rest}
//!     → registry.rs  (service name → upstream base URL)
//!     → forwarder.rs (URI rewrite, forwarding headers, single attempt)
//!     → client.rs    (pooled hyper-util client)
//!     → upstream response relayed to the caller
//! ```
//!
//! # Design Decisions
//! - One static upstream per service; no balancing, retries or discovery
//! - Upstreams are plain HTTP; TLS terminates at the gateway

pub mod client;
pub mod forwarder;
pub mod registry;

pub use client::{build_upstream_client, UpstreamClient};
pub use forwarder::{is_hop_by_hop, proxy_handler, Forwarder};
pub use registry::{parse_upstream_url, ServiceRegistry};
