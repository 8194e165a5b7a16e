//! Caller-facing errors and the JSON error envelope.
//!
//! Every rejection the gateway produces itself (as opposed to relaying an
//! upstream response) goes through [`GatewayError`], which renders as
//! `{"status_code": .., "error": .., "data": ..}` with the matching status.

use std::time::Duration;

use axum::{
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Standard error body returned for every gateway-originated failure.
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub status_code: u16,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Authorization header is required")]
    AuthMissing,

    #[error("invalid authorization header format")]
    AuthMalformed,

    #[error("unexpected token signing algorithm")]
    AuthInvalidAlgorithm,

    #[error("invalid or expired token")]
    AuthInvalidOrExpired,

    #[error("Rate limit exceeded")]
    RateLimitExceeded {
        limit: u32,
        retry_after: Duration,
        /// Unix timestamp (seconds) at which the window resets.
        reset_at: u64,
    },

    #[error("A request with the same idempotency key is already being processed")]
    IdempotencyConflict,

    #[error("Service '{0}' not found")]
    ServiceNotFound(String),

    #[error("Route not found")]
    RouteNotFound,

    #[error("Request body too large")]
    PayloadTooLarge,

    #[error("Internal server error")]
    InternalConfigError,

    #[error("Bad gateway")]
    BadGateway,
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::AuthMissing
            | GatewayError::AuthMalformed
            | GatewayError::AuthInvalidAlgorithm
            | GatewayError::AuthInvalidOrExpired => StatusCode::UNAUTHORIZED,
            GatewayError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::IdempotencyConflict => StatusCode::CONFLICT,
            GatewayError::ServiceNotFound(_) | GatewayError::RouteNotFound => StatusCode::NOT_FOUND,
            GatewayError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::InternalConfigError => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::BadGateway => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let data = match &self {
            GatewayError::RateLimitExceeded { retry_after, .. } => Some(serde_json::json!({
                "retry_after": retry_after.as_secs(),
            })),
            _ => None,
        };

        let envelope = ErrorEnvelope {
            status_code: status.as_u16(),
            error: self.to_string(),
            data,
        };

        let mut response = (status, Json(envelope)).into_response();

        if let GatewayError::RateLimitExceeded { limit, retry_after, reset_at } = self {
            let headers = response.headers_mut();
            headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(limit));
            headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(0u32));
            headers.insert(X_RATELIMIT_RESET, HeaderValue::from(reset_at));
            headers.insert(
                axum::http::header::RETRY_AFTER,
                HeaderValue::from(retry_after.as_secs()),
            );
        }

        response
    }
}
