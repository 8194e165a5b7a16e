//! Health reporting subsystem.
//!
//! # Data Flow
//! ```text
//! GET /health
//!     → aggregator.rs
//!         → cache ping (2s)
//!         → every service's /health, concurrently (5s each)
//!     → HealthDocument (always HTTP 200)
//! ```
//!
//! # Design Decisions
//! - Recomputed per request; nothing is persisted between checks
//! - Each probe owns its result slot; results are merged after all complete

pub mod aggregator;

pub use aggregator::{health_handler, HealthAggregator, HealthDocument, HealthStatus, ServiceHealth};
