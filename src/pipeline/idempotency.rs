//! Idempotent replay for mutating requests.
//!
//! # Data Flow
//! ```text
//! POST/PUT/PATCH/DELETE
//!     → key: X-Idempotency-Key, or SHA-256(method:path, user_id, body)
//!     → cached response? replay it with X-Idempotency-Hit: true
//!     → acquire short lock (set-if-absent), held → 409
//!     → run the handler, buffer the response
//!     → status < 500: store for 24h
//!     → release lock
//! ```
//!
//! # Design Decisions
//! - Cache failures never block a request; the request just runs undeduplicated
//! - The lock is released through a drop guard as well, so a cancelled request
//!   cannot hold it for the full lock TTL

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{to_bytes, Body},
    extract::State,
    http::{header::CONTENT_LENGTH, response::Parts, HeaderName, HeaderValue, Method, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::cache::Cache;
use crate::error::GatewayError;
use crate::http::body::{buffer_up_to, Buffered};
use crate::http::request::{request_context, X_IDEMPOTENCY_HIT, X_IDEMPOTENCY_KEY};
use crate::observability::metrics;
use crate::proxy::is_hop_by_hop;

pub const LOCK_TTL: Duration = Duration::from_secs(10);
pub const ENTRY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// A response as stored for replay.
///
/// Headers map one name to one value, so only the first of a repeated header
/// (several `Set-Cookie` lines, for instance) survives a replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    #[serde(with = "base64_body")]
    pub body: Vec<u8>,
}

impl CachedResponse {
    /// Keeps the first value of each end-to-end header.
    fn capture(parts: &Parts, body: &[u8]) -> Self {
        let mut headers = BTreeMap::new();
        for (name, value) in parts.headers.iter() {
            if is_hop_by_hop(name) {
                continue;
            }
            if let Ok(value) = value.to_str() {
                headers.entry(name.as_str().to_string()).or_insert_with(|| value.to_string());
            }
        }

        Self {
            status_code: parts.status.as_u16(),
            headers,
            body: body.to_vec(),
        }
    }

    fn replay(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::OK);

        let headers = response.headers_mut();
        for (name, value) in self.headers {
            if let (Ok(name), Ok(value)) = (HeaderName::try_from(name), HeaderValue::try_from(value)) {
                headers.insert(name, value);
            }
        }
        headers.insert(X_IDEMPOTENCY_HIT, HeaderValue::from_static("true"));
        response
    }
}

mod base64_body {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

pub fn applies_to(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH | Method::DELETE)
}

/// Hex SHA-256 over `"{method}:{path}"`, `"user_id:{id}"` when known, then the body.
pub fn derive_key(method: &Method, path: &str, user_id: Option<&str>, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{method}:{path}"));
    if let Some(user_id) = user_id {
        hasher.update(format!("user_id:{user_id}"));
    }
    hasher.update(body);
    hex::encode(hasher.finalize())
}

/// Deletes the lock when dropped without an explicit release.
struct LockGuard {
    cache: Cache,
    key: String,
    armed: bool,
}

impl LockGuard {
    fn new(cache: Cache, key: String) -> Self {
        Self { cache, key, armed: true }
    }

    async fn release(mut self) {
        self.armed = false;
        if let Err(e) = self.cache.delete(&self.key).await {
            tracing::warn!(key = %self.key, error = %e, "Failed to release idempotency lock");
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let cache = self.cache.clone();
            let key = std::mem::take(&mut self.key);
            handle.spawn(async move {
                if let Err(e) = cache.delete(&key).await {
                    tracing::warn!(key = %key, error = %e, "Failed to release abandoned idempotency lock");
                }
            });
        }
    }
}

#[derive(Debug, Clone)]
pub struct IdempotencyCoordinator {
    cache: Cache,
    max_body_bytes: usize,
}

impl IdempotencyCoordinator {
    pub fn new(cache: Cache, max_body_bytes: usize) -> Self {
        Self { cache, max_body_bytes }
    }

    /// Returns the request (body re-attached when it was read) and its key.
    async fn resolve_key(&self, req: Request<Body>) -> Result<(Request<Body>, String), GatewayError> {
        let header_key = req
            .headers()
            .get(X_IDEMPOTENCY_KEY)
            .and_then(|v| v.to_str().ok())
            .filter(|key| !key.is_empty())
            .map(str::to_string);
        if let Some(key) = header_key {
            return Ok((req, key));
        }

        let user_id = request_context(&req).user_id;
        let (parts, body) = req.into_parts();
        let bytes = to_bytes(body, self.max_body_bytes).await.map_err(|e| {
            tracing::debug!(error = %e, limit = self.max_body_bytes, "Request body rejected");
            GatewayError::PayloadTooLarge
        })?;

        let key = derive_key(&parts.method, parts.uri.path(), user_id.as_deref(), &bytes);
        Ok((Request::from_parts(parts, Body::from(bytes)), key))
    }

    /// Buffer a fresh response and store it unless it is a server error.
    /// Bodies over the limit, or that fail mid-stream, are relayed uncached.
    async fn record(&self, cache_key: &str, response: Response) -> Response {
        let status = response.status();
        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), key = %cache_key, "Not caching failed response");
            metrics::record_idempotency("skipped");
            return response;
        }

        let declared_len = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok());
        if declared_len.is_some_and(|len| len > self.max_body_bytes) {
            tracing::warn!(key = %cache_key, "Response too large to cache");
            metrics::record_idempotency("skipped");
            return response;
        }

        let (parts, body) = response.into_parts();
        let bytes = match buffer_up_to(body, self.max_body_bytes).await {
            Buffered::Complete(bytes) => bytes,
            Buffered::Partial { prefix, body } => {
                tracing::warn!(key = %cache_key, read = prefix.len(), "Response not cached, relaying as streamed");
                metrics::record_idempotency("skipped");
                return Response::from_parts(parts, body);
            }
        };

        let entry = CachedResponse::capture(&parts, &bytes);
        match self.cache.set_if_absent(cache_key, &entry, ENTRY_TTL).await {
            Ok(_) => {
                tracing::info!(key = %cache_key, status = status.as_u16(), "Cached response");
                metrics::record_idempotency("stored");
            }
            Err(e) => tracing::error!(key = %cache_key, error = %e, "Failed to cache response"),
        }

        Response::from_parts(parts, Body::from(bytes))
    }
}

pub async fn idempotency_middleware(
    State(coordinator): State<Arc<IdempotencyCoordinator>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if !applies_to(req.method()) {
        return next.run(req).await;
    }

    let method = req.method().clone();
    let (req, key) = match coordinator.resolve_key(req).await {
        Ok(resolved) => resolved,
        Err(err) => return err.into_response(),
    };

    let cache_key = format!("idempotency:{method}:{key}");
    match coordinator.cache.get::<CachedResponse>(&cache_key).await {
        Ok(Some(cached)) => {
            tracing::info!(key = %key, "Idempotency cache hit");
            metrics::record_idempotency("hit");
            return cached.replay();
        }
        Ok(None) => {}
        Err(e) => tracing::warn!(key = %key, error = %e, "Idempotency lookup failed"),
    }

    let lock_key = format!("idempotency_lock:{method}:{key}");
    let guard = match coordinator.cache.set_if_absent(&lock_key, &true, LOCK_TTL).await {
        Ok(true) => Some(LockGuard::new(coordinator.cache.clone(), lock_key)),
        Ok(false) => {
            tracing::warn!(key = %key, "Concurrent request with the same idempotency key");
            metrics::record_idempotency("conflict");
            return GatewayError::IdempotencyConflict.into_response();
        }
        Err(e) => {
            tracing::warn!(key = %key, error = %e, "Failed to acquire idempotency lock");
            None
        }
    };

    let response = next.run(req).await;
    let response = coordinator.record(&cache_key, response).await;

    if let Some(guard) = guard {
        guard.release().await;
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::{middleware::from_fn_with_state, routing::post, Router};
    use tower::ServiceExt;

    const LIMIT: usize = 64;

    fn app(cache: Cache, hits: Arc<AtomicUsize>, status: StatusCode) -> Router {
        Router::new()
            .route(
                "/orders",
                post(move |body: String| {
                    let hits = hits.clone();
                    async move {
                        let n = hits.fetch_add(1, Ordering::SeqCst) + 1;
                        (status, [("x-handler-call", n.to_string())], format!("created {body} #{n}"))
                    }
                })
                .put(|| async { std::future::pending::<&'static str>().await })
                .get(|| async { "list" }),
            )
            .layer(from_fn_with_state(
                Arc::new(IdempotencyCoordinator::new(cache, LIMIT)),
                idempotency_middleware,
            ))
    }

    fn post_req(body: &str) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri("/orders")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_string(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn derived_keys_depend_on_every_input() {
        let base = derive_key(&Method::POST, "/orders", None, b"{}");
        assert_eq!(base, derive_key(&Method::POST, "/orders", None, b"{}"));
        assert_eq!(base.len(), 64);

        assert_ne!(base, derive_key(&Method::PUT, "/orders", None, b"{}"));
        assert_ne!(base, derive_key(&Method::POST, "/orders/1", None, b"{}"));
        assert_ne!(base, derive_key(&Method::POST, "/orders", Some("user-1"), b"{}"));
        assert_ne!(base, derive_key(&Method::POST, "/orders", None, b"{\"a\":1}"));
    }

    #[test]
    fn only_mutating_methods_apply() {
        assert!(applies_to(&Method::POST));
        assert!(applies_to(&Method::DELETE));
        assert!(!applies_to(&Method::GET));
        assert!(!applies_to(&Method::HEAD));
    }

    #[test]
    fn cached_body_is_base64_in_json() {
        let entry = CachedResponse {
            status_code: 201,
            headers: BTreeMap::new(),
            body: b"hello".to_vec(),
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["body"], "aGVsbG8=");
        assert_eq!(serde_json::from_value::<CachedResponse>(json).unwrap(), entry);
    }

    #[tokio::test]
    async fn duplicate_request_is_replayed() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = app(Cache::memory(), hits.clone(), StatusCode::CREATED);

        let first = app.clone().oneshot(post_req("a")).await.unwrap();
        assert_eq!(first.status(), StatusCode::CREATED);
        assert!(!first.headers().contains_key(X_IDEMPOTENCY_HIT));
        assert_eq!(body_string(first).await, "created a #1");

        let second = app.oneshot(post_req("a")).await.unwrap();
        assert_eq!(second.status(), StatusCode::CREATED);
        assert_eq!(second.headers()[X_IDEMPOTENCY_HIT], "true");
        assert_eq!(second.headers()["x-handler-call"], "1");
        assert_eq!(body_string(second).await, "created a #1");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_bodies_are_distinct_requests() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = app(Cache::memory(), hits.clone(), StatusCode::CREATED);

        app.clone().oneshot(post_req("a")).await.unwrap();
        app.oneshot(post_req("b")).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn explicit_key_overrides_body_hash() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = app(Cache::memory(), hits.clone(), StatusCode::CREATED);

        for body in ["a", "b"] {
            let mut req = post_req(body);
            req.headers_mut().insert(X_IDEMPOTENCY_KEY, HeaderValue::from_static("order-42"));
            app.clone().oneshot(req).await.unwrap();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn server_errors_are_not_cached() {
        let hits = Arc::new(AtomicUsize::new(0));
        let cache = Cache::memory();
        let app = app(cache, hits.clone(), StatusCode::INTERNAL_SERVER_ERROR);

        for _ in 0..2 {
            let response = app.clone().oneshot(post_req("a")).await.unwrap();
            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
            assert!(!response.headers().contains_key(X_IDEMPOTENCY_HIT));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn held_lock_is_a_conflict() {
        let cache = Cache::memory();
        let key = derive_key(&Method::POST, "/orders", None, b"a");
        cache
            .set_if_absent(&format!("idempotency_lock:POST:{key}"), &true, LOCK_TTL)
            .await
            .unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let response = app(cache, hits.clone(), StatusCode::CREATED)
            .oneshot(post_req("a"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn lock_is_released_after_the_request() {
        let cache = Cache::memory();
        let hits = Arc::new(AtomicUsize::new(0));
        app(cache.clone(), hits, StatusCode::CREATED)
            .oneshot(post_req("a"))
            .await
            .unwrap();

        let key = derive_key(&Method::POST, "/orders", None, b"a");
        assert_eq!(cache.get::<bool>(&format!("idempotency_lock:POST:{key}")).await.unwrap(), None);
        assert!(cache
            .get::<CachedResponse>(&format!("idempotency:POST:{key}"))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn cancelled_request_releases_lock() {
        let cache = Cache::memory();
        let app = app(cache.clone(), Arc::new(AtomicUsize::new(0)), StatusCode::CREATED);
        let key = derive_key(&Method::PUT, "/orders", None, b"");
        let lock_key = format!("idempotency_lock:PUT:{key}");

        let req = Request::builder().method(Method::PUT).uri("/orders").body(Body::empty()).unwrap();
        let task = tokio::spawn(app.oneshot(req));

        for _ in 0..100 {
            if cache.get::<bool>(&lock_key).await.unwrap().is_some() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(cache.get::<bool>(&lock_key).await.unwrap(), Some(true));

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        for _ in 0..100 {
            if cache.get::<bool>(&lock_key).await.unwrap().is_none() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(cache.get::<bool>(&lock_key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let hits = Arc::new(AtomicUsize::new(0));
        let response = app(Cache::memory(), hits.clone(), StatusCode::CREATED)
            .oneshot(post_req(&"x".repeat(LIMIT + 1)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn large_streamed_response_is_relayed_uncached() {
        let cache = Cache::memory();
        let app = Router::new()
            .route(
                "/exports",
                post(|| async {
                    let chunks: Vec<Result<&'static str, std::io::Error>> = (0..LIMIT * 2).map(|_| Ok("x")).collect();
                    (StatusCode::CREATED, Body::from_stream(futures_util::stream::iter(chunks)))
                }),
            )
            .layer(from_fn_with_state(
                Arc::new(IdempotencyCoordinator::new(cache.clone(), LIMIT)),
                idempotency_middleware,
            ));

        let mut req = Request::builder()
            .method(Method::POST)
            .uri("/exports")
            .body(Body::empty())
            .unwrap();
        req.headers_mut().insert(X_IDEMPOTENCY_KEY, HeaderValue::from_static("export-1"));
        let response = app.oneshot(req).await.unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(response.headers().get(CONTENT_LENGTH).is_none());
        assert_eq!(body_string(response).await, "x".repeat(LIMIT * 2));
        assert!(cache
            .get::<CachedResponse>("idempotency:POST:export-1")
            .await
            .unwrap()
            .is_none());
        assert_eq!(cache.get::<bool>("idempotency_lock:POST:export-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn reads_are_not_deduplicated() {
        let app = app(Cache::memory(), Arc::new(AtomicUsize::new(0)), StatusCode::CREATED);
        for _ in 0..2 {
            let req = Request::builder().uri("/orders").body(Body::empty()).unwrap();
            let response = app.clone().oneshot(req).await.unwrap();
            assert!(!response.headers().contains_key(X_IDEMPOTENCY_HIT));
        }
    }
}
