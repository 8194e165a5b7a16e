//! One structured event per request.

use axum::{body::Body, http::Request, middleware::Next, response::Response};

use crate::http::request::{ensure_context, X_REQUEST_ID};
use crate::observability::metrics;

pub async fn access_log_middleware(mut req: Request<Body>, next: Next) -> Response {
    let ctx = ensure_context(&mut req);
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();

    let response = next.run(req).await;

    let status = response.status().as_u16();
    let latency = ctx.started_at.elapsed();
    metrics::record_request(method.as_str(), status, latency);

    tracing::info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status,
        latency_ms = latency.as_millis() as u64,
        client = %ctx.client_ip,
        "Request completed"
    );

    response
}
