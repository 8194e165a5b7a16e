//! Request pipeline stages.
//!
//! # Data Flow
//! ```text
//! Inbound request
//!     → access_log.rs   (request context, one event per request)
//!     → auth.rs         (bearer JWT, service routes only)
//!     → rate_limit.rs   (fixed window per user or client IP)
//!     → idempotency.rs  (replay / lock / capture, service routes only)
//!     → handler (forwarder or health)
//! ```
//!
//! # Design Decisions
//! - Each stage is an `axum::middleware::from_fn_with_state` function with its
//!   own state, so stages can be unit tested on a bare router
//! - A stage that rejects returns a `GatewayError` response and never calls `next`

pub mod access_log;
pub mod auth;
pub mod idempotency;
pub mod rate_limit;

pub use access_log::access_log_middleware;
pub use auth::{auth_middleware, issue_token, AuthGuard, Claims};
pub use idempotency::{idempotency_middleware, CachedResponse, IdempotencyCoordinator};
pub use rate_limit::{rate_limit_middleware, RateLimitDecision, RateLimiter};
