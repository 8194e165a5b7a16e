//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use api_gateway::{Cache, GatewayConfig, GatewayServer, Shutdown};
use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub const JWT_SECRET: &str = "integration-test-secret";
pub const LARGE_BODY_LEN: usize = 100;

#[derive(Clone)]
struct UpstreamState {
    hits: Arc<AtomicUsize>,
    health_status: StatusCode,
}

/// A mock backend that echoes what it received as JSON.
///
/// - `/health` answers with the configured status
/// - `/fail...` answers 500
/// - `/slow...` waits 300ms before echoing
/// - `/large...` streams a chunked body of `LARGE_BODY_LEN` bytes
/// - `/missing...` answers 404 with a `LARGE_BODY_LEN` byte body
/// - anything else echoes; POST answers 201
pub struct MockUpstream {
    pub addr: SocketAddr,
    pub hits: Arc<AtomicUsize>,
}

impl MockUpstream {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Requests received, excluding health probes.
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

pub async fn start_upstream(health_status: StatusCode) -> MockUpstream {
    let hits = Arc::new(AtomicUsize::new(0));
    let state = UpstreamState {
        hits: hits.clone(),
        health_status,
    };

    let app = Router::new().fallback(echo).with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    MockUpstream { addr, hits }
}

async fn echo(
    State(state): State<UpstreamState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path().to_string();
    if path == "/health" {
        return (state.health_status, "health").into_response();
    }

    let call = state.hits.fetch_add(1, Ordering::SeqCst) + 1;

    if path.starts_with("/fail") {
        return (StatusCode::INTERNAL_SERVER_ERROR, "upstream exploded").into_response();
    }
    if path.starts_with("/missing") {
        return (StatusCode::NOT_FOUND, "n".repeat(LARGE_BODY_LEN)).into_response();
    }
    if path.starts_with("/large") {
        let status = if method == Method::POST { StatusCode::CREATED } else { StatusCode::OK };
        let chunks: Vec<Result<Bytes, std::io::Error>> = (0..LARGE_BODY_LEN / 10)
            .map(|_| Ok(Bytes::from_static(b"0123456789")))
            .collect();
        return (status, Body::from_stream(futures_util::stream::iter(chunks))).into_response();
    }
    if path.starts_with("/slow") {
        tokio::time::sleep(Duration::from_millis(300)).await;
    }

    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string);
    let status = if method == Method::POST { StatusCode::CREATED } else { StatusCode::OK };

    (
        status,
        Json(json!({
            "call": call,
            "method": method.as_str(),
            "path": path,
            "query": uri.query(),
            "body": String::from_utf8_lossy(&body),
            "host": header("host"),
            "forwarded_for": header("x-forwarded-for"),
            "forwarded_host": header("x-forwarded-host"),
            "forwarded_proto": header("x-forwarded-proto"),
            "request_id": header("x-request-id"),
            "user_id": header("x-user-id"),
        })),
    )
        .into_response()
}

/// Gateway config with an in-memory cache, auth off and generous limits.
pub fn gateway_config(services: &[(&str, String)]) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.server.host = "127.0.0.1".into();
    config.server.port = 0;
    config.auth.enabled = false;
    config.auth.jwt_secret = JWT_SECRET.into();
    config.rate_limit.limit = 1000;
    for (name, url) in services {
        config.services.insert(name.to_string(), url.clone());
    }
    config
}

pub struct RunningGateway {
    pub url: String,
    pub cache: Cache,
    shutdown: Shutdown,
    task: JoinHandle<Result<(), std::io::Error>>,
}

impl RunningGateway {
    pub async fn stop(self) {
        self.shutdown.trigger();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.task).await;
    }
}

/// Serve a gateway on an ephemeral port.
pub async fn start_gateway(config: GatewayConfig) -> RunningGateway {
    let cache = Cache::memory();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());

    let shutdown = Shutdown::new();
    let server = GatewayServer::new(config, cache.clone());
    let task = tokio::spawn(server.run(listener, shutdown.subscribe()));

    RunningGateway {
        url,
        cache,
        shutdown,
        task,
    }
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}
