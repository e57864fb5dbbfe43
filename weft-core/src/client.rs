//! Discovery-aware RPC client.
//!
//! A call resolves the target through the registry, picks a node with the
//! selector, leases a pooled connection, and exchanges one request/response
//! pair with a deadline. Retries wrap the whole sequence with exponential
//! backoff and only fire on transport-level failures and 5xx responses;
//! client errors never retry. A per-service circuit breaker can wrap the
//! retry loop.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::codec::{self, lookup_codec};
use crate::error::{Error, Result};
use crate::message::{header, Headers, Message, MessageKind};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::registry::{Node, Registry, RoundRobinSelector, Selector};
use crate::transport::Transport;

/// Exponential backoff policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay before the given retry (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = self.multiplier.powi(retry.saturating_sub(1) as i32);
        let delay = self.initial_delay.mul_f64(factor);
        delay.min(self.max_delay)
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }
}

/// Per-call options.
#[derive(Debug, Clone)]
pub struct CallOptions {
    pub timeout: Duration,
    /// Exact version constraint on the target service.
    pub version: Option<String>,
    pub content_type: Option<String>,
    /// Headers forwarded to the callee (Authorization, X-Request-ID, ...).
    pub headers: Headers,
    pub retry: Option<RetryPolicy>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            version: None,
            content_type: None,
            headers: Headers::new(),
            retry: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub pool: PoolConfig,
    pub retry: RetryPolicy,
    pub breaker: Option<BreakerConfig>,
    pub default_content_type: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            retry: RetryPolicy::default(),
            breaker: None,
            default_content_type: codec::JSON.to_string(),
        }
    }
}

/// A raw response as received from the peer.
#[derive(Debug, Clone)]
pub struct ClientResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Bytes,
}

impl ClientResponse {
    fn error_message(&self) -> String {
        serde_json::from_slice::<serde_json::Value>(&self.body)
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
            .unwrap_or_else(|| format!("upstream returned status {}", self.status))
    }
}

pub struct Client {
    transport: Arc<dyn Transport>,
    registry: Arc<dyn Registry>,
    selector: Arc<dyn Selector>,
    config: ClientConfig,
    pools: DashMap<String, Arc<ConnectionPool>>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    cancel: CancellationToken,
}

impl Client {
    pub fn new(transport: Arc<dyn Transport>, registry: Arc<dyn Registry>) -> Self {
        Self::with_config(transport, registry, ClientConfig::default())
    }

    pub fn with_config(
        transport: Arc<dyn Transport>,
        registry: Arc<dyn Registry>,
        config: ClientConfig,
    ) -> Self {
        Self {
            transport,
            registry,
            selector: Arc::new(RoundRobinSelector::new()),
            config,
            pools: DashMap::new(),
            breakers: DashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn selector(mut self, selector: Arc<dyn Selector>) -> Self {
        self.selector = selector;
        self
    }

    /// Call with typed request and response bodies and default options.
    pub async fn call<Req, Res>(&self, service: &str, endpoint: &str, body: &Req) -> Result<Res>
    where
        Req: Serialize,
        Res: DeserializeOwned,
    {
        self.call_with(service, endpoint, body, CallOptions::default())
            .await
    }

    /// Call with typed bodies and explicit options.
    pub async fn call_with<Req, Res>(
        &self,
        service: &str,
        endpoint: &str,
        body: &Req,
        opts: CallOptions,
    ) -> Result<Res>
    where
        Req: Serialize,
        Res: DeserializeOwned,
    {
        let content_type = opts
            .content_type
            .clone()
            .unwrap_or_else(|| self.config.default_content_type.clone());
        let request_codec = lookup_codec(&content_type)
            .ok_or_else(|| Error::UnsupportedMedia(format!("no codec for {content_type}")))?;
        let payload = codec::marshal(request_codec.as_ref(), body)?;

        let response = self.call_raw(service, endpoint, payload, opts).await?;
        if response.status >= 400 {
            return Err(Error::from_status(response.status, response.error_message()));
        }
        if response.body.is_empty() {
            return serde_json::from_value(serde_json::Value::Null)
                .map_err(|e| Error::Codec(format!("empty response: {e}")));
        }
        let response_ct = response
            .headers
            .get(header::CONTENT_TYPE)
            .unwrap_or(&content_type);
        let response_codec = lookup_codec(response_ct)
            .ok_or_else(|| Error::Codec(format!("no codec for response type {response_ct}")))?;
        codec::unmarshal(response_codec.as_ref(), &response.body)
    }

    /// The untyped call path: resolve, select, lease, exchange. Responses
    /// below 500 are returned as-is; 5xx and transport failures surface as
    /// errors so retry and breaker policy can act on them.
    pub async fn call_raw(
        &self,
        service: &str,
        endpoint: &str,
        body: Bytes,
        opts: CallOptions,
    ) -> Result<ClientResponse> {
        let retry = opts.retry.clone().unwrap_or_else(|| self.config.retry.clone());

        let attempt_loop = self.call_with_retry(service, endpoint, body, &opts, &retry);
        match self.breaker_for(service) {
            Some(breaker) => breaker.call(attempt_loop).await,
            None => attempt_loop.await,
        }
    }

    fn breaker_for(&self, service: &str) -> Option<Arc<CircuitBreaker>> {
        let config = self.config.breaker.clone()?;
        Some(
            self.breakers
                .entry(service.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(service, config)))
                .clone(),
        )
    }

    async fn call_with_retry(
        &self,
        service: &str,
        endpoint: &str,
        body: Bytes,
        opts: &CallOptions,
        retry: &RetryPolicy,
    ) -> Result<ClientResponse> {
        let mut attempt = 1u32;
        loop {
            match self.attempt(service, endpoint, body.clone(), opts).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt < retry.max_attempts => {
                    let delay = retry.delay(attempt);
                    debug!(
                        target: "weft::client",
                        %service,
                        %endpoint,
                        attempt,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "retrying call"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn attempt(
        &self,
        service: &str,
        endpoint: &str,
        body: Bytes,
        opts: &CallOptions,
    ) -> Result<ClientResponse> {
        let node = self.resolve(service, opts.version.as_deref()).await?;
        let pool = self.pool_for(&node);
        let conn = pool.acquire(opts.timeout).await?;

        let mut msg = Message::request(service, endpoint, body);
        let content_type = opts
            .content_type
            .clone()
            .unwrap_or_else(|| self.config.default_content_type.clone());
        msg.headers.set(header::CONTENT_TYPE, content_type);
        for (name, value) in opts.headers.iter() {
            msg.headers.append(name, value);
        }

        let request_id = msg.id.clone();
        if let Err(e) = conn.socket().send(msg).await {
            self.selector.mark(service, &node.id, false);
            pool.release(conn, false).await;
            return Err(e);
        }

        // Replies are correlated by id; anything else on the socket is
        // stale and discarded.
        let deadline = tokio::time::Instant::now() + opts.timeout;
        let reply = loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break None;
            }
            match conn.socket().recv_timeout(remaining).await {
                Ok(Some(reply))
                    if reply.kind == MessageKind::Response
                        && reply.reply_to.as_deref() == Some(request_id.as_str()) =>
                {
                    break Some(reply)
                }
                Ok(Some(_)) => continue,
                Ok(None) => break None,
                Err(e) => {
                    self.selector.mark(service, &node.id, false);
                    pool.release(conn, false).await;
                    return Err(e);
                }
            }
        };

        let Some(reply) = reply else {
            self.selector.mark(service, &node.id, false);
            // A late reply could still arrive on this socket; do not reuse it.
            pool.release(conn, false).await;
            return Err(Error::Timeout(format!(
                "no response from {service}{endpoint} within {:?}",
                opts.timeout
            )));
        };

        pool.release(conn, true).await;
        let status = reply.status().unwrap_or(200);
        self.selector.mark(service, &node.id, status < 500);

        let response = ClientResponse {
            status,
            headers: reply.headers,
            body: reply.body,
        };
        if status >= 500 {
            return Err(Error::from_status(status, response.error_message()));
        }
        Ok(response)
    }

    async fn resolve(&self, service: &str, version: Option<&str>) -> Result<Node> {
        let records = match self.registry.get_service(service).await {
            Ok(records) => records,
            Err(Error::NotFound(_)) => {
                return Err(Error::ServiceUnavailable(format!(
                    "no nodes available for {service}"
                )))
            }
            Err(e) => return Err(e),
        };
        let nodes: Vec<Node> = records
            .into_iter()
            .filter(|r| version.map(|v| r.version == v).unwrap_or(true))
            .flat_map(|r| r.nodes)
            .collect();
        self.selector.select(service, &nodes)
    }

    fn pool_for(&self, node: &Node) -> Arc<ConnectionPool> {
        let addr = if node.port == 0 {
            node.address.clone()
        } else {
            node.addr()
        };
        self.pools
            .entry(addr.clone())
            .or_insert_with(|| {
                let pool = Arc::new(ConnectionPool::new(
                    self.transport.clone(),
                    addr,
                    self.config.pool.clone(),
                ));
                pool.clone().spawn_cleanup(self.cancel.clone());
                pool
            })
            .clone()
    }

    /// Close all pools and stop background tasks.
    pub async fn close(&self) {
        self.cancel.cancel();
        let pools: Vec<Arc<ConnectionPool>> =
            self.pools.iter().map(|entry| entry.value().clone()).collect();
        for pool in pools {
            pool.close().await;
        }
        self.pools.clear();
    }
}
