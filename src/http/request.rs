//! Request-scoped state shared by the pipeline stages.
//!
//! # Responsibilities
//! - Resolve the caller's address from the connection
//! - Carry the authenticated identity from the auth guard to later stages
//!
//! # Design Decisions
//! - The context lives in the request's extensions; no thread-locals
//! - Stages that run without the access-log stage (unit tests, partial
//!   chains) still get a context built on demand

use std::net::SocketAddr;
use std::time::Instant;

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{HeaderName, HeaderValue, Request},
};
use tower_http::request_id::{MakeRequestId, RequestId};
use uuid::Uuid;

pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
pub const X_USER_ID: HeaderName = HeaderName::from_static("x-user-id");
pub const X_IDEMPOTENCY_KEY: HeaderName = HeaderName::from_static("x-idempotency-key");
pub const X_IDEMPOTENCY_HIT: HeaderName = HeaderName::from_static("x-idempotency-hit");

/// Time-ordered request ids for requests that arrive without one.
#[derive(Debug, Clone, Copy, Default)]
pub struct MakeRequestUuidV7;

impl MakeRequestId for MakeRequestUuidV7 {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        HeaderValue::from_str(&Uuid::now_v7().to_string())
            .ok()
            .map(RequestId::new)
    }
}

/// Per-request state, owned by the in-flight request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Caller IP, or `"unknown"` when the connection address is unavailable.
    pub client_ip: String,
    /// Set by the auth guard once a bearer token validates.
    pub user_id: Option<String>,
    pub started_at: Instant,
}

impl RequestContext {
    pub fn from_request(req: &Request<Body>) -> Self {
        Self {
            client_ip: client_ip(req),
            user_id: None,
            started_at: Instant::now(),
        }
    }

    /// Rate-limit identity: the user when authenticated, otherwise the caller address.
    pub fn identifier(&self) -> &str {
        self.user_id.as_deref().unwrap_or(&self.client_ip)
    }
}

fn client_ip(req: &Request<Body>) -> String {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Return the request's context, attaching a fresh one if none exists yet.
pub fn ensure_context(req: &mut Request<Body>) -> RequestContext {
    if let Some(ctx) = req.extensions().get::<RequestContext>() {
        return ctx.clone();
    }
    let ctx = RequestContext::from_request(req);
    req.extensions_mut().insert(ctx.clone());
    ctx
}

/// Read-only access for handlers; falls back to connection data.
pub fn request_context(req: &Request<Body>) -> RequestContext {
    req.extensions()
        .get::<RequestContext>()
        .cloned()
        .unwrap_or_else(|| RequestContext::from_request(req))
}
