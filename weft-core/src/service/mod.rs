//! Service definition: the declarative registration API.
//!
//! A [`Service`] is assembled with a consuming builder: endpoints with
//! typed handlers, event subscriptions, middleware, and the collaborators
//! (transport, registry, broker) it runs against. The tables are built once
//! and frozen when the service starts.

mod dispatch;
mod server;

pub use dispatch::PreparedService;
pub use server::{serve, RunningService};

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::broker::{Broker, Event, EventHandler, SubscribeOptions, SubscriptionEntry};
use crate::codec::{self, Codec};
use crate::error::{Error, Result};
use crate::message::Context;
use crate::middleware::{Chain, Entry};
use crate::registry::Registry;
use crate::transport::Transport;

/// Per-endpoint settings.
#[derive(Debug, Clone)]
pub struct EndpointOptions {
    /// Hint for HTTP-fronting layers; RPC dispatch ignores it.
    pub http_method: String,
    /// Per-request budget enforced by the timeout middleware.
    pub timeout: Option<Duration>,
    /// When false, authorization guards are suppressed for this endpoint.
    pub auth_required: bool,
    pub deprecated: bool,
    pub description: Option<String>,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            http_method: "POST".to_string(),
            timeout: None,
            auth_required: true,
            deprecated: false,
            description: None,
        }
    }
}

pub(crate) type TypedHandler =
    Arc<dyn Fn(Arc<dyn Codec>, Bytes) -> BoxFuture<'static, Result<serde_json::Value>> + Send + Sync>;

pub(crate) type RawHandler = Arc<dyn Fn(Context) -> BoxFuture<'static, Context> + Send + Sync>;

#[derive(Clone)]
pub(crate) enum EndpointHandler {
    Typed(TypedHandler),
    Raw(RawHandler),
}

/// A dispatchable operation on a service.
#[derive(Clone)]
pub struct Endpoint {
    pub path: String,
    pub options: EndpointOptions,
    pub param_names: Vec<String>,
    pub(crate) handler: EndpointHandler,
    pub(crate) middleware: Chain,
}

/// Pull a single argument out of the request body: direct unmarshal first,
/// then a named field of a JSON object, converted to the declared type.
fn extract_single<T: DeserializeOwned>(
    codec: &dyn Codec,
    body: &[u8],
    param: &str,
) -> Result<T> {
    if let Ok(value) = codec::unmarshal::<T>(codec, body) {
        return Ok(value);
    }
    let value = codec
        .decode_value(body)
        .map_err(|e| Error::InvalidArgument(format!("unreadable request body: {e}")))?;
    let object = value
        .as_object()
        .ok_or_else(|| Error::InvalidArgument(format!("missing parameter: {param}")))?;
    let field = object
        .get(param)
        .cloned()
        .ok_or_else(|| Error::InvalidArgument(format!("missing parameter: {param}")))?;
    serde_json::from_value(field)
        .map_err(|_| Error::InvalidArgument(format!("invalid value for parameter: {param}")))
}

/// Pull a named field out of an already-decoded object.
fn extract_field<T: DeserializeOwned>(
    object: &serde_json::Map<String, serde_json::Value>,
    param: &str,
) -> Result<T> {
    let field = object
        .get(param)
        .cloned()
        .ok_or_else(|| Error::InvalidArgument(format!("missing parameter: {param}")))?;
    serde_json::from_value(field)
        .map_err(|_| Error::InvalidArgument(format!("invalid value for parameter: {param}")))
}

fn to_result_value<T: Serialize>(value: T) -> Result<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| Error::Internal(format!("marshal failed: {e}")))
}

/// Service identity and addressing.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub name: String,
    pub version: String,
    /// The address the server listens on.
    pub bind_addr: String,
    /// The address registered in the registry; defaults to the bound one.
    pub advertise_addr: Option<String>,
    pub default_content_type: String,
    pub metadata: HashMap<String, String>,
}

impl ServiceOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: "1.0.0".to_string(),
            bind_addr: "127.0.0.1:0".to_string(),
            advertise_addr: None,
            default_content_type: codec::JSON.to_string(),
            metadata: HashMap::new(),
        }
    }
}

pub(crate) type Hook = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// A declared service, ready to be started with [`serve`] or
/// [`crate::runtime::run`].
pub struct Service {
    pub(crate) options: ServiceOptions,
    pub(crate) endpoints: Vec<Endpoint>,
    pub(crate) service_chain: Chain,
    pub(crate) subscriptions: Vec<SubscriptionEntry>,
    pub(crate) transport: Option<Arc<dyn Transport>>,
    pub(crate) registry: Option<Arc<dyn Registry>>,
    pub(crate) broker: Option<Arc<dyn Broker>>,
    pub(crate) startup_hooks: Vec<Hook>,
    pub(crate) shutdown_hooks: Vec<Hook>,
    /// When false, the default middleware set is not installed.
    pub(crate) default_middleware: bool,
}

impl Service {
    /// Start building a service with the given name.
    pub fn build(name: impl Into<String>) -> Self {
        Self {
            options: ServiceOptions::new(name),
            endpoints: Vec::new(),
            service_chain: Chain::new(),
            subscriptions: Vec::new(),
            transport: None,
            registry: None,
            broker: None,
            startup_hooks: Vec::new(),
            shutdown_hooks: Vec::new(),
            default_middleware: true,
        }
    }

    pub fn from_options(options: ServiceOptions) -> Self {
        let mut service = Self::build(options.name.clone());
        service.options = options;
        service
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn options(&self) -> &ServiceOptions {
        &self.options
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.options.version = version.into();
        self
    }

    pub fn bind(mut self, addr: impl Into<String>) -> Self {
        self.options.bind_addr = addr.into();
        self
    }

    pub fn advertise(mut self, addr: impl Into<String>) -> Self {
        self.options.advertise_addr = Some(addr.into());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.metadata.insert(key.into(), value.into());
        self
    }

    pub fn default_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.options.default_content_type = content_type.into();
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn registry(mut self, registry: Arc<dyn Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Disable the built-in recovery/error/request-id/logging/timing set.
    pub fn without_default_middleware(mut self) -> Self {
        self.default_middleware = false;
        self
    }

    /// Add a service-level middleware entry.
    pub fn middleware(mut self, entry: Entry) -> Self {
        self.service_chain.use_entry(entry);
        self
    }

    /// Mark a service-level middleware as bypassed.
    pub fn skip_middleware(mut self, name: impl Into<String>) -> Self {
        self.service_chain.skip(name);
        self
    }

    /// Require a middleware by name; starting the service fails without it.
    pub fn require_middleware(mut self, name: impl Into<String>) -> Self {
        self.service_chain.require(name);
        self
    }

    /// Register a zero-parameter endpoint.
    pub fn handle<Res, F, Fut>(self, path: &str, handler: F) -> Self
    where
        Res: Serialize + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Res>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let typed: TypedHandler = Arc::new(move |_codec, _body| {
            let handler = handler.clone();
            Box::pin(async move { to_result_value(handler().await?) })
        });
        self.push_endpoint(path, Vec::new(), EndpointHandler::Typed(typed))
    }

    /// Register a one-parameter endpoint. The body is unmarshaled into the
    /// parameter type directly; failing that, the named field of a JSON
    /// object body is extracted and converted.
    pub fn endpoint<Req, Res, F, Fut>(self, path: &str, param: &str, handler: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Res: Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Res>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let param_name = param.to_string();
        let params = vec![param_name.clone()];
        let typed: TypedHandler = Arc::new(move |codec, body| {
            let handler = handler.clone();
            let param_name = param_name.clone();
            Box::pin(async move {
                let arg: Req = extract_single(codec.as_ref(), &body, &param_name)?;
                to_result_value(handler(arg).await?)
            })
        });
        self.push_endpoint(path, params, EndpointHandler::Typed(typed))
    }

    /// Register a two-parameter endpoint. The body must be a JSON object
    /// carrying both named fields.
    pub fn endpoint2<A, B, Res, F, Fut>(
        self,
        path: &str,
        params: (&str, &str),
        handler: F,
    ) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        B: DeserializeOwned + Send + 'static,
        Res: Serialize + Send + 'static,
        F: Fn(A, B) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Res>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let first = params.0.to_string();
        let second = params.1.to_string();
        let names = vec![first.clone(), second.clone()];
        let typed: TypedHandler = Arc::new(move |codec, body| {
            let handler = handler.clone();
            let first = first.clone();
            let second = second.clone();
            Box::pin(async move {
                let value = codec
                    .decode_value(&body)
                    .map_err(|e| Error::InvalidArgument(format!("unreadable request body: {e}")))?;
                let object = value.as_object().ok_or_else(|| {
                    Error::InvalidArgument("request body must be a JSON object".into())
                })?;
                let a: A = extract_field(object, &first)?;
                let b: B = extract_field(object, &second)?;
                to_result_value(handler(a, b).await?)
            })
        });
        self.push_endpoint(path, names, EndpointHandler::Typed(typed))
    }

    /// Register a raw endpoint with full context access. The handler owns
    /// the context and hands it back; record failures with
    /// [`Context::fail`].
    pub fn endpoint_raw<F>(self, path: &str, handler: F) -> Self
    where
        F: Fn(Context) -> BoxFuture<'static, Context> + Send + Sync + 'static,
    {
        self.push_endpoint(path, Vec::new(), EndpointHandler::Raw(Arc::new(handler)))
    }

    fn push_endpoint(
        mut self,
        path: &str,
        param_names: Vec<String>,
        handler: EndpointHandler,
    ) -> Self {
        self.endpoints.push(Endpoint {
            path: path.to_string(),
            options: EndpointOptions::default(),
            param_names,
            handler,
            middleware: Chain::new(),
        });
        self
    }

    /// Adjust options of an already-registered endpoint.
    pub fn endpoint_options(mut self, path: &str, options: EndpointOptions) -> Self {
        if let Some(endpoint) = self.endpoints.iter_mut().find(|e| e.path == path) {
            endpoint.options = options;
        }
        self
    }

    /// Add a method-level middleware entry to an endpoint.
    pub fn endpoint_middleware(mut self, path: &str, entry: Entry) -> Self {
        if let Some(endpoint) = self.endpoints.iter_mut().find(|e| e.path == path) {
            endpoint.middleware.use_entry(entry);
        }
        self
    }

    /// Subscribe a typed handler to a topic; every subscriber receives
    /// every event.
    pub fn subscribe<T, F, Fut>(self, topic: &str, handler: F) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.subscribe_with::<T, F, Fut>(topic, None, SubscribeOptions::default(), handler)
    }

    /// Subscribe within a queue group: each event lands on exactly one
    /// member of the group.
    pub fn subscribe_queue<T, F, Fut>(self, topic: &str, queue: &str, handler: F) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.subscribe_with::<T, F, Fut>(
            topic,
            Some(queue.to_string()),
            SubscribeOptions::default(),
            handler,
        )
    }

    pub fn subscribe_with<T, F, Fut>(
        mut self,
        topic: &str,
        queue_group: Option<String>,
        options: SubscribeOptions,
        handler: F,
    ) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let default_ct = self.options.default_content_type.clone();
        let wrapped: EventHandler = Arc::new(move |event: Event| {
            let handler = handler.clone();
            let default_ct = default_ct.clone();
            Box::pin(async move {
                let payload: T = event.decode(&default_ct)?;
                handler(payload).await
            })
        });
        self.subscriptions.push(SubscriptionEntry {
            topic: topic.to_string(),
            queue_group,
            options,
            handler: wrapped,
        });
        self
    }

    pub fn on_startup<F, Fut>(mut self, hook: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.startup_hooks
            .push(Box::new(move || Box::pin(hook())));
        self
    }

    pub fn on_shutdown<F, Fut>(mut self, hook: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.shutdown_hooks
            .push(Box::new(move || Box::pin(hook())));
        self
    }

    /// A service must not register the same (topic, queue group) twice.
    pub(crate) fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for sub in &self.subscriptions {
            let key = (sub.topic.clone(), sub.queue_group.clone());
            if !seen.insert(key) {
                return Err(Error::Conflict(format!(
                    "duplicate subscription for topic {} (queue group {:?})",
                    sub.topic, sub.queue_group
                )));
            }
        }
        let mut paths = std::collections::HashSet::new();
        for endpoint in &self.endpoints {
            if !endpoint.path.starts_with('/') {
                return Err(Error::Config(format!(
                    "endpoint path must start with '/': {}",
                    endpoint.path
                )));
            }
            if !paths.insert(endpoint.path.clone()) {
                return Err(Error::Conflict(format!(
                    "duplicate endpoint path: {}",
                    endpoint.path
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;

    #[test]
    fn extract_single_direct_unmarshal() {
        #[derive(serde::Deserialize, PartialEq, Debug)]
        struct Input {
            name: String,
        }
        let body = br#"{"name":"World"}"#;
        let input: Input = extract_single(&JsonCodec, body, "input").unwrap();
        assert_eq!(input.name, "World");
    }

    #[test]
    fn extract_single_falls_back_to_named_field() {
        let body = br#"{"name":"World"}"#;
        let name: String = extract_single(&JsonCodec, body, "name").unwrap();
        assert_eq!(name, "World");
    }

    #[test]
    fn extract_single_missing_field_is_400() {
        let body = br#"{"other":1}"#;
        let err = extract_single::<String>(&JsonCodec, body, "name").unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert!(err.message().contains("name"));
    }

    #[test]
    fn extract_single_mistyped_field_is_400() {
        let body = br#"{"count":"not a number"}"#;
        let err = extract_single::<u32>(&JsonCodec, body, "count").unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn duplicate_subscription_rejected() {
        let service = Service::build("svc")
            .subscribe_queue("work", "group", |_: serde_json::Value| async { Ok(()) })
            .subscribe_queue("work", "group", |_: serde_json::Value| async { Ok(()) });
        let err = service.validate().unwrap_err();
        assert_eq!(err.kind(), "Conflict");
    }

    #[test]
    fn same_topic_different_group_allowed() {
        let service = Service::build("svc")
            .subscribe("work", |_: serde_json::Value| async { Ok(()) })
            .subscribe_queue("work", "group", |_: serde_json::Value| async { Ok(()) });
        service.validate().unwrap();
    }

    #[test]
    fn duplicate_endpoint_rejected() {
        let service = Service::build("svc")
            .handle("/a", || async { Ok("one") })
            .handle("/a", || async { Ok("two") });
        let err = service.validate().unwrap_err();
        assert_eq!(err.kind(), "Conflict");
    }

    #[test]
    fn endpoint_path_must_be_rooted() {
        let service = Service::build("svc").handle("nope", || async { Ok(()) });
        let err = service.validate().unwrap_err();
        assert_eq!(err.kind(), "Config");
    }
}
