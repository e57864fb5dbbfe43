//! Gateway route definitions.

use std::time::Duration;

use crate::transform::ResponseTransform;

/// Response caching settings for a route.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub ttl: Duration,
    /// Request headers whose values take part in the cache key.
    pub vary_headers: Vec<String>,
}

impl CacheConfig {
    pub fn ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            vary_headers: Vec::new(),
        }
    }
}

/// What an aggregate route does when one branch fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartialFailurePolicy {
    /// Record the failure under the task's key and keep the rest.
    Tolerate,
    /// Fail the whole request.
    Fail,
}

/// One branch of an aggregate route.
#[derive(Debug, Clone)]
pub struct AggregateTask {
    pub name: String,
    pub service: String,
    pub method: String,
}

impl AggregateTask {
    pub fn new(
        name: impl Into<String>,
        service: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            service: service.into(),
            method: method.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AggregateSpec {
    pub tasks: Vec<AggregateTask>,
    pub on_partial_failure: PartialFailurePolicy,
}

/// A gateway entry mapping an HTTP (method, path pattern) to a service
/// method. Patterns use `:name` segments; `ANY` matches every verb.
#[derive(Clone)]
pub struct Route {
    pub http_method: String,
    pub path: String,
    pub service: String,
    pub service_method: String,
    pub cache: Option<CacheConfig>,
    pub transformations: Vec<ResponseTransform>,
    pub required_roles: Vec<String>,
    pub public: bool,
    pub aggregate: Option<AggregateSpec>,
}

impl Route {
    pub fn new(
        http_method: impl Into<String>,
        path: impl Into<String>,
        service: impl Into<String>,
        service_method: impl Into<String>,
    ) -> Self {
        Self {
            http_method: http_method.into().to_ascii_uppercase(),
            path: path.into(),
            service: service.into(),
            service_method: service_method.into(),
            cache: None,
            transformations: Vec::new(),
            required_roles: Vec::new(),
            public: true,
            aggregate: None,
        }
    }

    /// An aggregate route: fans out to several services in parallel and
    /// assembles one object keyed by task name.
    pub fn aggregate(
        http_method: impl Into<String>,
        path: impl Into<String>,
        tasks: Vec<AggregateTask>,
    ) -> Self {
        let mut route = Self::new(http_method, path, "", "");
        route.aggregate = Some(AggregateSpec {
            tasks,
            on_partial_failure: PartialFailurePolicy::Tolerate,
        });
        route
    }

    pub fn cached(mut self, cache: CacheConfig) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn transform(mut self, transform: ResponseTransform) -> Self {
        self.transformations.push(transform);
        self
    }

    pub fn require_roles<I: IntoIterator<Item = S>, S: Into<String>>(mut self, roles: I) -> Self {
        self.required_roles = roles.into_iter().map(Into::into).collect();
        self.public = false;
        self
    }

    /// Require authentication without specific roles.
    pub fn authenticated(mut self) -> Self {
        self.public = false;
        self
    }

    pub fn on_partial_failure(mut self, policy: PartialFailurePolicy) -> Self {
        if let Some(aggregate) = &mut self.aggregate {
            aggregate.on_partial_failure = policy;
        }
        self
    }
}

/// REST shorthand: index/show/create/update/destroy mapped onto a base
/// path, each proxied to a conventionally-named service method.
pub fn rest_routes(base: &str, service: &str) -> Vec<Route> {
    let base = base.trim_end_matches('/');
    let item = format!("{base}/:id");
    vec![
        Route::new("GET", base, service, "/index"),
        Route::new("GET", item.clone(), service, "/show"),
        Route::new("POST", base, service, "/create"),
        Route::new("PUT", item.clone(), service, "/update"),
        Route::new("DELETE", item, service, "/destroy"),
    ]
}
