//! weft-gateway — an HTTP front for weft services.
//!
//! The gateway owns a route table (exact paths plus `:param` patterns), a
//! discovery-aware client shared by per-service proxies, a TTL+LRU response
//! cache, Prometheus metrics, and a periodic health probe. It is hosted on
//! axum: [`Gateway::router`] yields the assembled `axum::Router`.
//!
//! ```ignore
//! let gateway = GatewayBuilder::new(transport, registry)
//!     .route(Route::new("GET", "/products/:id", "catalog", "/show"))
//!     .rest("/orders", "orders")
//!     .build();
//! gateway.start_background();
//! axum::serve(listener, gateway.router()).await?;
//! ```

mod aggregate;
mod cache;
mod docs;
mod handler;
mod health;
mod metrics;
mod proxy;
mod route;
mod router;
mod transform;

pub use cache::{CachedResponse, ResponseCache};
pub use metrics::GatewayMetrics;
pub use proxy::{ProxyConfig, ServiceProxy};
pub use route::{
    rest_routes, AggregateSpec, AggregateTask, CacheConfig, PartialFailurePolicy, Route,
};
pub use router::RouteTable;
pub use transform::ResponseTransform;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Json;
use http::HeaderMap;
use tokio_util::sync::CancellationToken;

use weft_core::client::Client;
use weft_core::middleware::rate_limit::{RateLimitConfig, RateLimitKey, RateLimiter};
use weft_core::registry::Registry;
use weft_core::transport::Transport;
use weft_security::{JwtConfig, JwtValidator, Principal, TokenValidator};

/// Turns incoming HTTP headers into a principal, or not.
pub trait GatewayAuthenticator: Send + Sync {
    fn authenticate(&self, headers: &HeaderMap) -> Option<Principal>;
}

/// Bearer-JWT authentication for gateway routes.
pub struct JwtAuthenticator {
    validator: JwtValidator,
}

impl JwtAuthenticator {
    pub fn new(config: JwtConfig) -> Self {
        Self {
            validator: JwtValidator::new(config),
        }
    }
}

impl GatewayAuthenticator for JwtAuthenticator {
    fn authenticate(&self, headers: &HeaderMap) -> Option<Principal> {
        let token = headers
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|h| h.strip_prefix("Bearer "))?;
        self.validator.validate(token.trim()).ok()
    }
}

#[derive(Clone)]
pub struct GatewayConfig {
    pub title: String,
    pub version: String,
    pub docs_path: String,
    pub health_path: String,
    pub metrics_path: String,
    pub enable_docs: bool,
    pub enable_health: bool,
    pub enable_metrics: bool,
    pub body_limit: usize,
    pub cache_capacity: usize,
    pub cache_sweep_interval: Duration,
    pub health_probe_interval: Duration,
    pub rate_limit: Option<RateLimitConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            title: "weft gateway".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            docs_path: "/api/docs".to_string(),
            health_path: "/health".to_string(),
            metrics_path: "/metrics".to_string(),
            enable_docs: true,
            enable_health: true,
            enable_metrics: true,
            body_limit: 2 * 1024 * 1024,
            cache_capacity: 1024,
            cache_sweep_interval: Duration::from_secs(60),
            health_probe_interval: Duration::from_secs(10),
            rate_limit: None,
        }
    }
}

pub(crate) struct GatewayInner {
    pub(crate) config: GatewayConfig,
    pub(crate) routes: RouteTable,
    pub(crate) proxies: HashMap<String, Arc<ServiceProxy>>,
    pub(crate) cache: Arc<ResponseCache>,
    pub(crate) metrics: GatewayMetrics,
    pub(crate) health: Arc<health::HealthState>,
    pub(crate) registry: Arc<dyn Registry>,
    pub(crate) authenticator: Option<Arc<dyn GatewayAuthenticator>>,
    pub(crate) limiter: Option<(RateLimiter, RateLimitKey, u64)>,
}

/// Assembles a [`Gateway`].
pub struct GatewayBuilder {
    transport: Arc<dyn Transport>,
    registry: Arc<dyn Registry>,
    config: GatewayConfig,
    routes: Vec<Route>,
    proxy_configs: HashMap<String, ProxyConfig>,
    default_proxy: ProxyConfig,
    authenticator: Option<Arc<dyn GatewayAuthenticator>>,
}

impl GatewayBuilder {
    pub fn new(transport: Arc<dyn Transport>, registry: Arc<dyn Registry>) -> Self {
        Self {
            transport,
            registry,
            config: GatewayConfig::default(),
            routes: Vec::new(),
            proxy_configs: HashMap::new(),
            default_proxy: ProxyConfig::default(),
            authenticator: None,
        }
    }

    pub fn config(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    pub fn route(mut self, route: Route) -> Self {
        self.routes.push(route);
        self
    }

    pub fn routes<I: IntoIterator<Item = Route>>(mut self, routes: I) -> Self {
        self.routes.extend(routes);
        self
    }

    /// Register the REST shorthand for a backend service.
    pub fn rest(self, base: &str, service: &str) -> Self {
        self.routes(rest_routes(base, service))
    }

    /// Per-service proxy policy; unlisted services get the default.
    pub fn proxy_config(mut self, service: impl Into<String>, config: ProxyConfig) -> Self {
        self.proxy_configs.insert(service.into(), config);
        self
    }

    pub fn default_proxy_config(mut self, config: ProxyConfig) -> Self {
        self.default_proxy = config;
        self
    }

    pub fn authenticator(mut self, authenticator: Arc<dyn GatewayAuthenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn build(self) -> Gateway {
        let client = Arc::new(Client::new(self.transport.clone(), self.registry.clone()));

        let mut table = RouteTable::new();
        let mut services: Vec<String> = Vec::new();
        for route in self.routes {
            match &route.aggregate {
                Some(spec) => {
                    for task in &spec.tasks {
                        if !services.contains(&task.service) {
                            services.push(task.service.clone());
                        }
                    }
                }
                None => {
                    if !route.service.is_empty() && !services.contains(&route.service) {
                        services.push(route.service.clone());
                    }
                }
            }
            table.add(route);
        }

        let mut proxies = HashMap::new();
        for service in &services {
            let config = self
                .proxy_configs
                .get(service)
                .cloned()
                .unwrap_or_else(|| self.default_proxy.clone());
            proxies.insert(
                service.clone(),
                Arc::new(ServiceProxy::new(service.clone(), client.clone(), config)),
            );
        }

        let limiter = self.config.rate_limit.clone().map(|cfg| {
            let key = cfg.key;
            let max = cfg.max_requests;
            (RateLimiter::new(cfg), key, max)
        });

        let inner = Arc::new(GatewayInner {
            cache: Arc::new(ResponseCache::new(self.config.cache_capacity)),
            metrics: GatewayMetrics::new(),
            health: Arc::new(health::HealthState::new(services)),
            registry: self.registry,
            authenticator: self.authenticator,
            limiter,
            routes: table,
            proxies,
            config: self.config,
        });
        Gateway {
            inner,
            cancel: CancellationToken::new(),
        }
    }
}

/// The assembled gateway.
pub struct Gateway {
    inner: Arc<GatewayInner>,
    cancel: CancellationToken,
}

impl Gateway {
    /// Build the axum router: built-in endpoints plus the proxy fallback.
    pub fn router(&self) -> axum::Router {
        let config = &self.inner.config;
        let mut router = axum::Router::new();
        if config.enable_docs {
            router = router.route(&config.docs_path, get(docs_endpoint));
        }
        if config.enable_health {
            router = router.route(&config.health_path, get(health_endpoint));
        }
        if config.enable_metrics {
            router = router.route(&config.metrics_path, get(metrics_endpoint));
        }
        router
            .fallback(handler::dispatch)
            .with_state(self.inner.clone())
    }

    /// Start the health probe and cache sweep tasks.
    pub fn start_background(&self) {
        self.inner.health.clone().spawn_probe(
            self.inner.registry.clone(),
            self.inner.config.health_probe_interval,
            self.cancel.clone(),
        );
        self.inner
            .cache
            .clone()
            .spawn_sweep(self.inner.config.cache_sweep_interval, self.cancel.clone());
    }

    /// Run one health probe immediately.
    pub async fn probe_now(&self) {
        self.inner.health.probe(&self.inner.registry).await;
    }

    pub fn metrics(&self) -> &GatewayMetrics {
        &self.inner.metrics
    }

    /// Stop background tasks.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

async fn docs_endpoint(State(inner): State<Arc<GatewayInner>>) -> impl IntoResponse {
    Json(docs::openapi_document(
        inner.routes.routes(),
        &inner.config.title,
        &inner.config.version,
    ))
}

async fn health_endpoint(State(inner): State<Arc<GatewayInner>>) -> impl IntoResponse {
    Json(inner.health.snapshot())
}

async fn metrics_endpoint(State(inner): State<Arc<GatewayInner>>) -> impl IntoResponse {
    (
        [(
            http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        inner.metrics.encode(),
    )
}

pub mod prelude {
    pub use crate::{
        Gateway, GatewayBuilder, GatewayConfig, PartialFailurePolicy, ProxyConfig,
        ResponseTransform, Route,
    };
}
