//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Build the Axum router: `/health` plus `/{service}` and `/{service}/{*path}`
//! - Wire the pipeline stages onto each route group
//! - Serve plain TCP or TLS with graceful, deadline-bounded shutdown

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    http::StatusCode,
    middleware::{from_fn, from_fn_with_state},
    response::{IntoResponse, Response},
    routing::{any, get},
    Router,
};
use axum_server::{tls_rustls::RustlsConfig, Handle};
use tokio::{net::TcpListener, sync::broadcast, sync::Notify};
use tower_http::{
    request_id::{PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::cache::Cache;
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::health::{health_handler, HealthAggregator};
use crate::http::request::{MakeRequestUuidV7, X_REQUEST_ID};
use crate::pipeline::{
    access_log_middleware, auth_middleware, idempotency_middleware, rate_limit_middleware, AuthGuard,
    IdempotencyCoordinator, RateLimiter,
};
use crate::proxy::{build_upstream_client, proxy_handler, Forwarder, ServiceRegistry};

/// The gateway's HTTP front end.
pub struct GatewayServer {
    router: Router,
    config: GatewayConfig,
}

impl GatewayServer {
    /// Build every component from the configuration and the shared cache.
    pub fn new(config: GatewayConfig, cache: Cache) -> Self {
        let router = Self::build_router(&config, cache);
        Self { router, config }
    }

    fn build_router(config: &GatewayConfig, cache: Cache) -> Router {
        let registry = Arc::new(ServiceRegistry::new(config.services.clone()));
        let client = build_upstream_client();

        let guard = Arc::new(AuthGuard::new(&config.auth.jwt_secret, config.auth.enabled));
        let limiter = Arc::new(RateLimiter::new(cache.clone(), &config.rate_limit));
        let idempotency = Arc::new(IdempotencyCoordinator::new(cache.clone(), config.limits.max_body_bytes));
        let forwarder = Arc::new(Forwarder::new(
            registry.clone(),
            client.clone(),
            Duration::from_secs(config.timeouts.proxy_secs),
            config.server.tls.enabled,
            config.limits.max_body_bytes,
        ));
        let aggregator = Arc::new(HealthAggregator::new(cache, registry, client));

        // Layers run outermost-last: auth → rate limit → idempotency → handler.
        let services = Router::new()
            .route("/{service}", any(proxy_handler))
            .route("/{service}/{*path}", any(proxy_handler))
            .with_state(forwarder)
            .layer(from_fn_with_state(idempotency, idempotency_middleware))
            .layer(from_fn_with_state(limiter.clone(), rate_limit_middleware))
            .layer(from_fn_with_state(guard, auth_middleware));

        let health = Router::new()
            .route("/health", get(health_handler))
            .with_state(aggregator)
            .layer(from_fn_with_state(limiter, rate_limit_middleware));

        for (name, url) in &config.services {
            tracing::info!(service = %name, upstream = %url, "Registered routes for service");
        }

        Router::new()
            .merge(health)
            .merge(services)
            .fallback(route_not_found)
            .layer(TimeoutLayer::with_status_code(
                StatusCode::REQUEST_TIMEOUT,
                Duration::from_secs(config.timeouts.request_secs),
            ))
            .layer(from_fn(access_log_middleware))
            .layer(TraceLayer::new_for_http())
            .layer(PropagateRequestIdLayer::new(X_REQUEST_ID))
            .layer(SetRequestIdLayer::new(X_REQUEST_ID, MakeRequestUuidV7))
    }

    /// The fully layered router, for in-process use.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    fn grace_period(&self) -> Duration {
        Duration::from_secs(self.config.timeouts.shutdown_grace_secs)
    }

    /// Serve plain HTTP until `shutdown` fires, then drain for at most the grace period.
    pub async fn run(self, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        let grace = self.grace_period();
        tracing::info!(address = %addr, "HTTP server starting");

        let draining = Arc::new(Notify::new());
        let signal = draining.clone();

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        let server = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                signal.notify_one();
            })
            .into_future();
        tokio::pin!(server);

        tokio::select! {
            result = &mut server => result?,
            _ = draining.notified() => {
                tracing::info!(grace = ?grace, "Draining in-flight requests");
                match tokio::time::timeout(grace, &mut server).await {
                    Ok(result) => result?,
                    Err(_) => tracing::warn!("Grace period elapsed, closing remaining connections"),
                }
            }
        }

        tracing::info!("HTTP server stopped");
        Ok(())
    }

    /// Serve HTTPS on `addr` with the given rustls configuration.
    pub async fn run_tls(
        self,
        addr: SocketAddr,
        tls: RustlsConfig,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let grace = self.grace_period();
        let handle = Handle::new();

        let watcher = handle.clone();
        tokio::spawn(async move {
            let _ = shutdown.recv().await;
            tracing::info!(grace = ?grace, "Draining in-flight requests");
            watcher.graceful_shutdown(Some(grace));
        });

        tracing::info!(address = %addr, "HTTPS server starting");
        axum_server::bind_rustls(addr, tls)
            .handle(handle)
            .serve(self.router.into_make_service_with_connect_info::<SocketAddr>())
            .await?;

        tracing::info!("HTTPS server stopped");
        Ok(())
    }
}

async fn route_not_found() -> Response {
    GatewayError::RouteNotFound.into_response()
}
