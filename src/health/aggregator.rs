//! On-demand dependency health.
//!
//! # Responsibilities
//! - Ping the cache (2s budget)
//! - Probe `{upstream}/health` for every configured service concurrently (5s budget each)
//! - Fold the results into one document

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    Json,
};
use chrono::{SecondsFormat, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use tokio::time;

use crate::cache::Cache;
use crate::observability::metrics;
use crate::proxy::{parse_upstream_url, ServiceRegistry, UpstreamClient};

pub const CACHE_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
pub const SERVICE_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Up,
    Degraded,
    Down,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthDocument {
    pub status: HealthStatus,
    pub timestamp: String,
    pub version: &'static str,
    pub dependencies: Dependencies,
}

#[derive(Debug, Clone, Serialize)]
pub struct Dependencies {
    pub redis: CacheHealth,
    pub services: BTreeMap<String, ServiceHealth>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheHealth {
    pub status: HealthStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealth {
    pub status: HealthStatus,
    /// Upstream status code; absent when no response arrived.
    pub status_code: Option<u16>,
    /// Milliseconds spent waiting for the probe.
    pub response_time: u64,
    pub error: Option<String>,
    pub last_checked_at: String,
}

/// Overall status: `up` only when the cache is up and no service is down.
///
/// Never `down`, even when every dependency is.
pub fn overall_status<'a>(cache: HealthStatus, services: impl IntoIterator<Item = &'a ServiceHealth>) -> HealthStatus {
    if cache != HealthStatus::Up {
        return HealthStatus::Degraded;
    }
    if services.into_iter().any(|s| s.status == HealthStatus::Down) {
        return HealthStatus::Degraded;
    }
    HealthStatus::Up
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub struct HealthAggregator {
    cache: Cache,
    registry: Arc<ServiceRegistry>,
    client: UpstreamClient,
}

impl HealthAggregator {
    pub fn new(cache: Cache, registry: Arc<ServiceRegistry>, client: UpstreamClient) -> Self {
        Self { cache, registry, client }
    }

    pub async fn check(&self) -> HealthDocument {
        let probes = self
            .registry
            .iter()
            .map(|(name, url)| async move { (name.to_string(), self.probe_service(name, url).await) });

        let (redis, services) = tokio::join!(self.probe_cache(), join_all(probes));
        let services: BTreeMap<String, ServiceHealth> = services.into_iter().collect();

        HealthDocument {
            status: overall_status(redis.status, services.values()),
            timestamp: now_rfc3339(),
            version: env!("CARGO_PKG_VERSION"),
            dependencies: Dependencies { redis, services },
        }
    }

    async fn probe_cache(&self) -> CacheHealth {
        let error = match time::timeout(CACHE_PROBE_TIMEOUT, self.cache.ping()).await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some("cache ping timed out".to_string()),
        };

        if let Some(error) = &error {
            tracing::error!(error = %error, "Cache health check failed");
        }
        metrics::record_dependency("redis", error.is_none());

        CacheHealth {
            status: if error.is_none() { HealthStatus::Up } else { HealthStatus::Down },
            error,
        }
    }

    async fn probe_service(&self, name: &str, base: &str) -> ServiceHealth {
        let started = Instant::now();
        let (status, status_code, error) = match self.build_probe(base) {
            Err(e) => {
                tracing::error!(service = %name, error = %e, "Error creating health request");
                (HealthStatus::Down, None, Some(e))
            }
            Ok(request) => match time::timeout(SERVICE_PROBE_TIMEOUT, self.client.request(request)).await {
                Ok(Ok(response)) if response.status() == StatusCode::OK => (HealthStatus::Up, Some(200), None),
                Ok(Ok(response)) => {
                    let code = response.status().as_u16();
                    tracing::warn!(service = %name, status = code, "Health check returned non-200 status");
                    (HealthStatus::Degraded, Some(code), Some("Non-200 status code".to_string()))
                }
                Ok(Err(e)) => {
                    tracing::error!(service = %name, error = %e, "Error checking service health");
                    (HealthStatus::Down, None, Some(e.to_string()))
                }
                Err(_) => {
                    tracing::error!(service = %name, "Health check timed out");
                    (HealthStatus::Down, None, Some("health check timed out".to_string()))
                }
            },
        };

        metrics::record_dependency(name, status != HealthStatus::Down);

        ServiceHealth {
            status,
            status_code,
            response_time: started.elapsed().as_millis() as u64,
            error,
            last_checked_at: now_rfc3339(),
        }
    }

    fn build_probe(&self, base: &str) -> Result<Request<Body>, String> {
        let base = parse_upstream_url(base)?;
        let target = format!("{}/health", base.as_str().trim_end_matches('/'));

        Request::get(target)
            .header("user-agent", "api-gateway-health-check")
            .body(Body::empty())
            .map_err(|e| e.to_string())
    }
}

pub async fn health_handler(State(aggregator): State<Arc<HealthAggregator>>) -> Json<HealthDocument> {
    Json(aggregator.check().await)
}
