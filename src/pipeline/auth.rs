//! Bearer token authentication.
//!
//! Tokens are HMAC-signed JWTs sharing one secret with the issuing service.
//! The caller's identity is read from the `user_id` claim, falling back to
//! `sub`, and recorded on the [`RequestContext`] for later stages.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::{
    body::Body,
    extract::State,
    http::{header::AUTHORIZATION, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use jsonwebtoken::{decode, decode_header, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::http::request::ensure_context;

const BEARER_SCHEME: &str = "Bearer";

/// JWT claims accepted by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    /// Expiration time (Unix timestamp).
    pub exp: u64,
    /// Issued at time (Unix timestamp).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<u64>,
}

impl Claims {
    /// The authenticated subject, if the token names one.
    pub fn subject(&self) -> Option<&str> {
        self.user_id
            .as_deref()
            .or(self.sub.as_deref())
            .filter(|id| !id.is_empty())
    }
}

/// Validates bearer tokens with a shared secret.
pub struct AuthGuard {
    enabled: bool,
    key: DecodingKey,
}

impl std::fmt::Debug for AuthGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthGuard").field("enabled", &self.enabled).finish_non_exhaustive()
    }
}

impl AuthGuard {
    pub fn new(secret: &str, enabled: bool) -> Self {
        Self {
            enabled,
            key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Authenticate a raw `Authorization` header value and return the subject.
    pub fn authenticate(&self, authorization: Option<&str>) -> Result<String, GatewayError> {
        let header = authorization.ok_or(GatewayError::AuthMissing)?;
        let token = extract_bearer_token(header)?;
        let claims = self.validate_token(token)?;

        claims
            .subject()
            .map(str::to_string)
            .ok_or(GatewayError::AuthInvalidOrExpired)
    }

    pub fn validate_token(&self, token: &str) -> Result<Claims, GatewayError> {
        let header = decode_header(token).map_err(|e| {
            tracing::debug!(error = %e, "Undecodable token header");
            GatewayError::AuthInvalidOrExpired
        })?;

        if !matches!(header.alg, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512) {
            tracing::warn!(alg = ?header.alg, "Rejected token with non-HMAC algorithm");
            return Err(GatewayError::AuthInvalidAlgorithm);
        }

        decode::<Claims>(token, &self.key, &Validation::new(header.alg))
            .map(|data| data.claims)
            .map_err(|e| {
                tracing::error!(error = %e, "Error parsing JWT token");
                GatewayError::AuthInvalidOrExpired
            })
    }
}

/// Split `Bearer <token>`; anything else is malformed.
fn extract_bearer_token(header: &str) -> Result<&str, GatewayError> {
    let parts: Vec<&str> = header.split(' ').collect();
    match parts.as_slice() {
        [BEARER_SCHEME, token] if !token.is_empty() => Ok(token),
        _ => Err(GatewayError::AuthMalformed),
    }
}

/// Mint an HS256 token for `user_id` valid for `ttl`.
pub fn issue_token(secret: &str, user_id: &str, ttl: Duration) -> Result<String, jsonwebtoken::errors::Error> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let claims = Claims {
        user_id: Some(user_id.to_string()),
        sub: Some(user_id.to_string()),
        exp: now + ttl.as_secs(),
        iat: Some(now),
    };

    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes()))
}

pub async fn auth_middleware(
    State(guard): State<Arc<AuthGuard>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    if !guard.is_enabled() {
        return next.run(req).await;
    }

    let authorization = req.headers().get(AUTHORIZATION).map(|v| v.to_str().unwrap_or_default());

    match guard.authenticate(authorization) {
        Ok(user_id) => {
            let mut ctx = ensure_context(&mut req);
            ctx.user_id = Some(user_id);
            req.extensions_mut().insert(ctx);
            next.run(req).await
        }
        Err(err) => {
            tracing::debug!(error = %err, path = %req.uri().path(), "Authentication failed");
            err.into_response()
        }
    }
}
