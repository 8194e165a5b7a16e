//! Fixed-window rate limiting backed by the shared cache.
//!
//! One counter per caller (`ratelimit:{identifier}`) lives for one window. The
//! read and the increment are separate cache calls, so concurrent requests can
//! over- or under-count by a small amount; the window itself is always bounded
//! by the counter's TTL.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::cache::{Cache, CacheError};
use crate::config::RateLimitConfig;
use crate::error::{GatewayError, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET};
use crate::http::request::ensure_context;
use crate::observability::metrics;

/// Outcome of a rate limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed { limit: u32, remaining: u32, reset_at: u64 },
    Rejected { limit: u32, retry_after: Duration, reset_at: u64 },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed { .. })
    }
}

#[derive(Debug, Clone)]
pub struct RateLimiter {
    cache: Cache,
    enabled: bool,
    limit: u32,
    period: Duration,
}

impl RateLimiter {
    pub fn new(cache: Cache, config: &RateLimitConfig) -> Self {
        Self {
            cache,
            enabled: config.enabled,
            limit: config.limit,
            period: Duration::from_secs(config.period_secs),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub async fn check(&self, identifier: &str) -> Result<RateLimitDecision, CacheError> {
        let key = format!("ratelimit:{identifier}");
        let limit = i64::from(self.limit);

        let count = match self.cache.get::<i64>(&key).await? {
            Some(count) => count,
            None => {
                if self.cache.set_if_absent(&key, &1i64, self.period).await? {
                    return Ok(RateLimitDecision::Allowed {
                        limit: self.limit,
                        remaining: self.limit.saturating_sub(1),
                        reset_at: unix_after(self.period),
                    });
                }
                // Another request created the window first.
                1
            }
        };

        if count >= limit {
            let ttl = self.cache.ttl(&key).await?.unwrap_or(self.period);
            let retry_after = Duration::from_secs(ceil_secs(ttl));
            return Ok(RateLimitDecision::Rejected {
                limit: self.limit,
                retry_after,
                reset_at: unix_after(retry_after),
            });
        }

        self.cache.incr(&key).await?;
        let ttl = match self.cache.ttl(&key).await? {
            Some(ttl) => ttl,
            None => {
                // The window expired between the read and the increment and the
                // counter was recreated without a TTL.
                self.cache.expire(&key, self.period).await?;
                self.period
            }
        };

        Ok(RateLimitDecision::Allowed {
            limit: self.limit,
            remaining: u32::try_from(limit - count - 1).unwrap_or(0),
            reset_at: unix_after(ttl),
        })
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}

fn unix_after(duration: Duration) -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    ceil_secs(now + duration)
}

fn apply_headers(headers: &mut HeaderMap, limit: u32, remaining: u32, reset_at: u64) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(reset_at));
}

pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    if !limiter.is_enabled() {
        return next.run(req).await;
    }

    let ctx = ensure_context(&mut req);
    let identifier = ctx.identifier();

    match limiter.check(identifier).await {
        Ok(RateLimitDecision::Allowed { limit, remaining, reset_at }) => {
            let mut response = next.run(req).await;
            apply_headers(response.headers_mut(), limit, remaining, reset_at);
            response
        }
        Ok(RateLimitDecision::Rejected { limit, retry_after, reset_at }) => {
            tracing::warn!(client = %identifier, limit, "Rate limit exceeded");
            metrics::record_rate_limited();
            GatewayError::RateLimitExceeded { limit, retry_after, reset_at }.into_response()
        }
        Err(e) => {
            tracing::warn!(client = %identifier, error = %e, "Rate limiter unavailable, allowing request");
            next.run(req).await
        }
    }
}
