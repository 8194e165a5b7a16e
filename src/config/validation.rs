//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, ports valid)
//! - Check every service maps to a usable upstream URL
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatewayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use crate::config::schema::GatewayConfig;
use crate::proxy::registry::parse_upstream_url;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.server.host.trim().is_empty() {
        errors.push(ValidationError::new("server.host", "must not be empty"));
    }
    if config.server.port == 0 {
        errors.push(ValidationError::new("server.port", "must be greater than 0"));
    }

    let tls = &config.server.tls;
    if tls.enabled {
        if tls.cert_path.is_empty() {
            errors.push(ValidationError::new("server.tls.cert_path", "required when TLS is enabled"));
        }
        if tls.key_path.is_empty() {
            errors.push(ValidationError::new("server.tls.key_path", "required when TLS is enabled"));
        }
    }

    if config.auth.enabled && config.auth.jwt_secret.is_empty() {
        errors.push(ValidationError::new("auth.jwt_secret", "required when auth is enabled"));
    }

    if config.rate_limit.enabled {
        if config.rate_limit.limit == 0 {
            errors.push(ValidationError::new("rate_limit.limit", "must be greater than 0"));
        }
        if config.rate_limit.period_secs == 0 {
            errors.push(ValidationError::new("rate_limit.period_secs", "must be greater than 0"));
        }
    }

    for (name, url) in &config.services {
        if name.is_empty() || name.contains('/') {
            errors.push(ValidationError::new(
                format!("services.{name}"),
                "service name must be a single non-empty path segment",
            ));
        }
        if let Err(reason) = parse_upstream_url(url) {
            errors.push(ValidationError::new(format!("services.{name}"), reason));
        }
    }

    let timeouts = &config.timeouts;
    for (field, value) in [
        ("timeouts.request_secs", timeouts.request_secs),
        ("timeouts.proxy_secs", timeouts.proxy_secs),
    ] {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be greater than 0"));
        }
    }

    if config.limits.max_body_bytes == 0 {
        errors.push(ValidationError::new("limits.max_body_bytes", "must be greater than 0"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
