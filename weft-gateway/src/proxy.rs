//! Per-backend service proxies: a discovery-aware client plus exposure
//! policy and an optional circuit breaker.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::HeaderMap;

use weft_core::breaker::{BreakerConfig, CircuitBreaker};
use weft_core::client::{CallOptions, Client, RetryPolicy};
use weft_core::error::{Error, Result};
use weft_core::message::Headers;

#[derive(Clone)]
pub struct ProxyConfig {
    /// When set, only these backend methods may be called.
    pub exposed_methods: Option<Vec<String>>,
    /// When set, these backend methods are blocked.
    pub blocked_methods: Option<Vec<String>>,
    pub retry: RetryPolicy,
    pub timeout: Duration,
    pub breaker: Option<BreakerConfig>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            exposed_methods: None,
            blocked_methods: None,
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(10),
            breaker: None,
        }
    }
}

/// Forwarded end-to-end from the HTTP request to the backend call.
const FORWARDED_HEADERS: &[&str] = &["Authorization", "X-Request-Id"];

pub struct ServiceProxy {
    service: String,
    client: Arc<Client>,
    config: ProxyConfig,
    breaker: Option<CircuitBreaker>,
}

impl ServiceProxy {
    pub fn new(service: impl Into<String>, client: Arc<Client>, config: ProxyConfig) -> Self {
        let service = service.into();
        let breaker = config
            .breaker
            .clone()
            .map(|cfg| CircuitBreaker::new(service.clone(), cfg));
        Self {
            service,
            client,
            config,
            breaker,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    fn check_exposure(&self, method: &str) -> Result<()> {
        if let Some(exposed) = &self.config.exposed_methods {
            if !exposed.iter().any(|m| m == method) {
                return Err(Error::MethodNotAllowed(format!(
                    "method {method} is not exposed on {}",
                    self.service
                )));
            }
        }
        if let Some(blocked) = &self.config.blocked_methods {
            if blocked.iter().any(|m| m == method) {
                return Err(Error::MethodNotAllowed(format!(
                    "method {method} is blocked on {}",
                    self.service
                )));
            }
        }
        Ok(())
    }

    /// Call a backend method with a JSON parameter object, forwarding the
    /// identity headers from the incoming HTTP request.
    pub async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
        incoming: &HeaderMap,
    ) -> Result<serde_json::Value> {
        self.check_exposure(method)?;

        let mut headers = Headers::new();
        for name in FORWARDED_HEADERS {
            if let Some(value) = incoming.get(*name).and_then(|v| v.to_str().ok()) {
                headers.set(name.to_string(), value.to_string());
            }
        }
        let opts = CallOptions {
            timeout: self.config.timeout,
            headers,
            retry: Some(self.config.retry.clone()),
            ..Default::default()
        };

        let body = Bytes::from(params.to_string().into_bytes());
        let work = self.client.call_raw(&self.service, method, body, opts);
        let response = match &self.breaker {
            Some(breaker) => breaker.call(work).await?,
            None => work.await?,
        };

        if response.status >= 400 {
            let message = serde_json::from_slice::<serde_json::Value>(&response.body)
                .ok()
                .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
                .unwrap_or_else(|| format!("upstream returned status {}", response.status));
            return Err(Error::from_status(response.status, message));
        }
        if response.body.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_slice(&response.body)
            .map_err(|e| Error::BadGateway(format!("invalid upstream response: {e}")))
    }

    pub fn breaker(&self) -> Option<&CircuitBreaker> {
        self.breaker.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy_with(config: ProxyConfig) -> ServiceProxy {
        let transport = Arc::new(weft_core::transport::LoopbackTransport::new());
        let registry = Arc::new(weft_core::registry::MemoryRegistry::new());
        ServiceProxy::new("catalog", Arc::new(Client::new(transport, registry)), config)
    }

    #[tokio::test]
    async fn exposure_list_blocks_unlisted() {
        let proxy = proxy_with(ProxyConfig {
            exposed_methods: Some(vec!["/index".into()]),
            ..Default::default()
        });
        let err = proxy
            .call("/secret", serde_json::json!({}), &HeaderMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 405);
    }

    #[tokio::test]
    async fn block_list_blocks_listed() {
        let proxy = proxy_with(ProxyConfig {
            blocked_methods: Some(vec!["/admin".into()]),
            ..Default::default()
        });
        let err = proxy
            .call("/admin", serde_json::json!({}), &HeaderMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 405);
    }

    #[tokio::test]
    async fn unresolvable_service_maps_to_unavailable() {
        let proxy = proxy_with(ProxyConfig {
            retry: RetryPolicy::none(),
            ..Default::default()
        });
        let err = proxy
            .call("/index", serde_json::json!({}), &HeaderMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 503);
    }
}
