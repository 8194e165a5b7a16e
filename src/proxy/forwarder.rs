//! Reverse proxy handler for service routes.
//!
//! `/{service}/{rest}` is sent to `{upstream}{base_path}/{rest}` with the query
//! string preserved. Exactly one attempt is made per request.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::{header::HOST, HeaderMap, HeaderName, HeaderValue, Request, StatusCode, Uri, Version},
    response::{IntoResponse, Response},
};
use url::{Position, Url};
use uuid::Uuid;

use super::client::UpstreamClient;
use super::registry::ServiceRegistry;
use crate::error::GatewayError;
use crate::http::body::{buffer_up_to, Buffered};
use crate::http::request::{request_context, RequestContext, X_REQUEST_ID, X_USER_ID};
use crate::observability::metrics;

pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Headers that describe a single connection and must not be forwarded.
pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Split `/orders/123` into `("orders", "/123")`.
pub fn split_service_path(path: &str) -> (&str, &str) {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    match trimmed.find('/') {
        Some(idx) => (&trimmed[..idx], &trimmed[idx..]),
        None => (trimmed, ""),
    }
}

/// Join the remainder onto the upstream's base path and carry the query over.
pub fn build_upstream_uri(base: &Url, remainder: &str, query: Option<&str>) -> Result<Uri, GatewayError> {
    let authority = &base[Position::BeforeHost..Position::AfterPort];
    let remainder = if remainder.is_empty() { "/" } else { remainder };
    let base_path = base.path().trim_end_matches('/');

    let mut target = format!("http://{authority}{base_path}{remainder}");
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        target.push('?');
        target.push_str(query);
    }

    target.parse::<Uri>().map_err(|e| {
        tracing::error!(target = %target, error = %e, "Could not build upstream URI");
        GatewayError::InternalConfigError
    })
}

fn connection_listed(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(axum::http::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect()
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in connection_listed(headers) {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Outbound headers: inbound end-to-end headers plus forwarding metadata.
pub fn upstream_headers(inbound: &HeaderMap, ctx: &RequestContext, proto: &'static str) -> HeaderMap {
    let mut headers = inbound.clone();
    strip_hop_by_hop(&mut headers);
    headers.remove(HOST);

    if let Ok(client_ip) = HeaderValue::from_str(&ctx.client_ip) {
        headers.insert(X_FORWARDED_FOR, client_ip);
    }
    if let Some(host) = inbound.get(HOST) {
        headers.insert(X_FORWARDED_HOST, host.clone());
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));

    let request_id = inbound
        .get(X_REQUEST_ID)
        .filter(|v| !v.is_empty())
        .cloned()
        .or_else(|| HeaderValue::try_from(Uuid::now_v7().to_string()).ok());
    if let Some(request_id) = request_id {
        headers.insert(X_REQUEST_ID, request_id);
    }

    match ctx.user_id.as_deref().map(HeaderValue::from_str) {
        Some(Ok(user_id)) => {
            headers.insert(X_USER_ID, user_id);
        }
        _ => {
            headers.remove(X_USER_ID);
        }
    }

    headers
}

/// Forwards requests to the service named by the first path segment.
#[derive(Clone)]
pub struct Forwarder {
    registry: Arc<ServiceRegistry>,
    client: UpstreamClient,
    timeout: Duration,
    proto: &'static str,
    max_logged_body: usize,
}

impl Forwarder {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        client: UpstreamClient,
        timeout: Duration,
        tls: bool,
        max_logged_body: usize,
    ) -> Self {
        Self {
            registry,
            client,
            timeout,
            proto: if tls { "https" } else { "http" },
            max_logged_body,
        }
    }

    pub async fn forward(&self, req: Request<Body>) -> Result<Response, GatewayError> {
        let ctx = request_context(&req);
        let (mut parts, body) = req.into_parts();

        let (service, remainder) = split_service_path(parts.uri.path());
        let service = service.to_string();
        let base = self.registry.resolve(&service)?;
        let uri = build_upstream_uri(&base, remainder, parts.uri.query())?;

        tracing::debug!(service = %service, upstream = %uri, "Proxying request");

        parts.headers = upstream_headers(&parts.headers, &ctx, self.proto);
        parts.uri = uri;
        parts.version = Version::HTTP_11;
        let outbound = Request::from_parts(parts, body);

        let response = match tokio::time::timeout(self.timeout, self.client.request(outbound)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                tracing::error!(service = %service, error = %e, "Proxy error");
                metrics::record_upstream(&service, "error");
                return Err(GatewayError::BadGateway);
            }
            Err(_) => {
                tracing::error!(service = %service, timeout = ?self.timeout, "Upstream timed out");
                metrics::record_upstream(&service, "timeout");
                return Err(GatewayError::BadGateway);
            }
        };

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        metrics::record_upstream(&service, "ok");
        tracing::info!(service = %service, status = parts.status.as_u16(), "Proxied response");

        if parts.status.as_u16() >= 400 {
            let body = match buffer_up_to(Body::new(body), self.max_logged_body).await {
                Buffered::Complete(bytes) => {
                    log_error_body(&service, parts.status, &bytes, false);
                    Body::from(bytes)
                }
                Buffered::Partial { prefix, body } => {
                    let shown = prefix.len().min(self.max_logged_body);
                    log_error_body(&service, parts.status, &prefix[..shown], true);
                    body
                }
            };
            return Ok(Response::from_parts(parts, body));
        }

        Ok(Response::from_parts(parts, Body::new(body)))
    }
}

fn log_error_body(service: &str, status: StatusCode, body: &[u8], truncated: bool) {
    tracing::warn!(
        service = %service,
        status = status.as_u16(),
        body = %String::from_utf8_lossy(body),
        truncated,
        "Error response from upstream"
    );
}

pub async fn proxy_handler(State(forwarder): State<Arc<Forwarder>>, req: Request<Body>) -> Response {
    match forwarder.forward(req).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn ctx(user_id: Option<&str>) -> RequestContext {
        RequestContext {
            client_ip: "10.0.0.9".to_string(),
            user_id: user_id.map(str::to_string),
            started_at: Instant::now(),
        }
    }

    #[test]
    fn splits_service_from_remainder() {
        assert_eq!(split_service_path("/orders/123"), ("orders", "/123"));
        assert_eq!(split_service_path("/orders"), ("orders", ""));
        assert_eq!(split_service_path("/orders/"), ("orders", "/"));
        assert_eq!(split_service_path("/orders/a/b"), ("orders", "/a/b"));
    }

    #[test]
    fn rewrites_onto_upstream() {
        let base = Url::parse("http://upstream:9000").unwrap();
        assert_eq!(build_upstream_uri(&base, "/123", None).unwrap(), "http://upstream:9000/123");
        assert_eq!(build_upstream_uri(&base, "", None).unwrap(), "http://upstream:9000/");
        assert_eq!(
            build_upstream_uri(&base, "/search", Some("q=a&page=2")).unwrap(),
            "http://upstream:9000/search?q=a&page=2"
        );
    }

    #[test]
    fn keeps_upstream_base_path() {
        let base = Url::parse("http://users:8080/api/v1/").unwrap();
        assert_eq!(build_upstream_uri(&base, "/me", None).unwrap(), "http://users:8080/api/v1/me");
        assert_eq!(build_upstream_uri(&base, "", None).unwrap(), "http://users:8080/api/v1/");
    }

    #[test]
    fn forwarding_headers_are_set() {
        let mut inbound = HeaderMap::new();
        inbound.insert(HOST, HeaderValue::from_static("gateway.local"));
        inbound.insert(X_FORWARDED_FOR, HeaderValue::from_static("6.6.6.6"));
        inbound.insert("connection", HeaderValue::from_static("keep-alive, x-private"));
        inbound.insert("x-private", HeaderValue::from_static("secret"));
        inbound.insert("accept", HeaderValue::from_static("application/json"));

        let headers = upstream_headers(&inbound, &ctx(Some("user-1")), "http");

        assert!(headers.get(HOST).is_none());
        assert!(headers.get("connection").is_none());
        assert!(headers.get("x-private").is_none());
        assert_eq!(headers[X_FORWARDED_FOR], "10.0.0.9");
        assert_eq!(headers[X_FORWARDED_HOST], "gateway.local");
        assert_eq!(headers[X_FORWARDED_PROTO], "http");
        assert_eq!(headers[X_USER_ID], "user-1");
        assert_eq!(headers["accept"], "application/json");
        assert_eq!(headers[X_REQUEST_ID].len(), 36);
    }

    #[test]
    fn inbound_request_id_is_kept() {
        let mut inbound = HeaderMap::new();
        inbound.insert(X_REQUEST_ID, HeaderValue::from_static("req-42"));
        inbound.insert(X_USER_ID, HeaderValue::from_static("spoofed"));

        let headers = upstream_headers(&inbound, &ctx(None), "https");
        assert_eq!(headers[X_REQUEST_ID], "req-42");
        assert_eq!(headers[X_FORWARDED_PROTO], "https");
        assert!(headers.get(X_USER_ID).is_none());
    }

    #[test]
    fn hop_by_hop_names() {
        assert!(is_hop_by_hop(&HeaderName::from_static("transfer-encoding")));
        assert!(!is_hop_by_hop(&HeaderName::from_static("content-type")));
    }
}
