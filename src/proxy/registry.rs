//! Static mapping from service name to upstream base URL.

use std::collections::BTreeMap;

use url::Url;

use crate::error::GatewayError;

/// Parse an upstream base URL. Only plain `http` upstreams with a host are supported.
pub fn parse_upstream_url(raw: &str) -> Result<Url, String> {
    if raw.is_empty() {
        return Err("upstream URL is empty".to_string());
    }
    let url = Url::parse(raw).map_err(|e| format!("invalid upstream URL: {e}"))?;
    if url.scheme() != "http" {
        return Err(format!("unsupported upstream scheme '{}'", url.scheme()));
    }
    if url.host_str().unwrap_or_default().is_empty() {
        return Err("upstream URL has no host".to_string());
    }
    Ok(url)
}

#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    services: BTreeMap<String, String>,
}

impl ServiceRegistry {
    pub fn new(services: BTreeMap<String, String>) -> Self {
        Self { services }
    }

    /// Upstream base URL for `name`.
    ///
    /// A missing or empty entry is `ServiceNotFound`; an entry that does not
    /// parse is a configuration fault and surfaces as `InternalConfigError`.
    pub fn resolve(&self, name: &str) -> Result<Url, GatewayError> {
        let raw = self
            .services
            .get(name)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| GatewayError::ServiceNotFound(name.to_string()))?;

        parse_upstream_url(raw).map_err(|reason| {
            tracing::error!(service = %name, url = %raw, reason = %reason, "Error parsing service URL");
            GatewayError::InternalConfigError
        })
    }

    /// Configured entries in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.services.iter().map(|(name, url)| (name.as_str(), url.as_str()))
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
