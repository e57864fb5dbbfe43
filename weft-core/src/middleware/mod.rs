//! Middleware chains: ordered, priority-sorted request interceptors.
//!
//! An [`Entry`] pairs a name with a priority and a handler of shape
//! `(ctx, next)`. Execution order is a stable sort by descending priority,
//! ties by insertion order. Service-level and method-level chains compose:
//! method entries run in their own band and override same-named service
//! entries. Authorization guards (entries named `guard:*`) carry fixed
//! priorities so they always run nearest the handler, method guards
//! innermost; `allow_anonymous` suppresses all of them.
//!
//! Handlers own the context and hand it back: call `next.run(ctx)` at most
//! once, record failures with [`Context::fail`], and short-circuit by
//! returning the context without calling `next`. The error-handler
//! middleware drains the error slot into the response.

pub mod compression;
pub mod cors;
pub mod error_handler;
pub mod logging;
pub mod rate_limit;
pub mod recovery;
pub mod request_id;
pub mod request_size;
pub mod timeout;
pub mod timing;

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::error::{Error, Result};
use crate::message::Context;

/// Entries named with this prefix are authorization guards.
pub const GUARD_PREFIX: &str = "guard:";

/// Priority band offset applied to method-level entries on composition.
pub const METHOD_OFFSET: i32 = 1000;

/// Fixed priority of service-level guards.
pub const SERVICE_GUARD_PRIORITY: i32 = -500;

/// Fixed priority of method-level guards; lower, so they run innermost.
pub const METHOD_GUARD_PRIORITY: i32 = -1500;

// Default priorities of the built-in catalog, outermost first.
pub const PRIORITY_RECOVERY: i32 = 10_000;
pub const PRIORITY_ERROR_HANDLER: i32 = 9_000;
pub const PRIORITY_REQUEST_ID: i32 = 8_000;
pub const PRIORITY_LOGGING: i32 = 7_000;
pub const PRIORITY_TIMING: i32 = 6_500;
pub const PRIORITY_CORS: i32 = 6_000;
pub const PRIORITY_COMPRESSION: i32 = 5_500;
pub const PRIORITY_REQUEST_SIZE: i32 = 5_000;
pub const PRIORITY_RATE_LIMIT: i32 = 4_500;
pub const PRIORITY_TIMEOUT: i32 = 4_000;
pub const PRIORITY_AUTH: i32 = 3_000;

/// A middleware handler. Receives the context and the continuation; may
/// call `next.run(ctx)` zero or one time and returns the context.
pub type Handler = Arc<dyn Fn(Context, Next) -> BoxFuture<'static, Context> + Send + Sync>;

/// The innermost step of a chain.
pub type Terminal = Arc<dyn Fn(Context) -> BoxFuture<'static, Context> + Send + Sync>;

/// A named, prioritized middleware registration.
#[derive(Clone)]
pub struct Entry {
    pub name: String,
    pub priority: i32,
    pub handler: Handler,
}

impl Entry {
    pub fn new(
        name: impl Into<String>,
        priority: i32,
        handler: impl Fn(Context, Next) -> BoxFuture<'static, Context> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            priority,
            handler: Arc::new(handler),
        }
    }

    pub fn is_guard(&self) -> bool {
        self.name.starts_with(GUARD_PREFIX)
    }
}

/// The continuation handed to each handler.
#[derive(Clone)]
pub struct Next {
    steps: Arc<Vec<(String, Handler)>>,
    index: usize,
    terminal: Terminal,
}

impl Next {
    /// Run the rest of the chain.
    pub fn run(mut self, ctx: Context) -> BoxFuture<'static, Context> {
        if self.index < self.steps.len() {
            let handler = self.steps[self.index].1.clone();
            self.index += 1;
            handler(ctx, self)
        } else {
            (self.terminal)(ctx)
        }
    }
}

/// A mutable chain under construction.
#[derive(Clone, Default)]
pub struct Chain {
    entries: Vec<Entry>,
    skipped: HashSet<String>,
    required: Vec<String>,
    allow_anonymous: bool,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn use_entry(&mut self, entry: Entry) -> &mut Self {
        self.entries.push(entry);
        self
    }

    pub fn use_named(
        &mut self,
        name: impl Into<String>,
        priority: i32,
        handler: impl Fn(Context, Next) -> BoxFuture<'static, Context> + Send + Sync + 'static,
    ) -> &mut Self {
        self.use_entry(Entry::new(name, priority, handler))
    }

    /// Mark an entry as bypassed without removing the registration.
    pub fn skip(&mut self, name: impl Into<String>) -> &mut Self {
        self.skipped.insert(name.into());
        self
    }

    /// Require an entry by name; preparing the chain fails if it is absent.
    pub fn require(&mut self, name: impl Into<String>) -> &mut Self {
        self.required.push(name.into());
        self
    }

    /// Suppress all authorization guards in this chain.
    pub fn allow_anonymous(&mut self, allow: bool) -> &mut Self {
        self.allow_anonymous = allow;
        self
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Compose a service-level chain with a method-level chain. Method
    /// entries are lifted into their own priority band and replace
    /// same-named service entries; guards keep their fixed priorities.
    pub fn compose(service: &Chain, method: &Chain) -> Chain {
        let mut out = Chain {
            entries: service.entries.clone(),
            skipped: service.skipped.union(&method.skipped).cloned().collect(),
            required: service
                .required
                .iter()
                .chain(method.required.iter())
                .cloned()
                .collect(),
            allow_anonymous: service.allow_anonymous || method.allow_anonymous,
        };
        for entry in &method.entries {
            let mut lifted = entry.clone();
            if !lifted.is_guard() {
                lifted.priority += METHOD_OFFSET;
            }
            match out.entries.iter_mut().find(|e| e.name == lifted.name) {
                Some(slot) => *slot = lifted,
                None => out.entries.push(lifted),
            }
        }
        out
    }

    /// Sort, filter, and freeze the chain for execution.
    pub fn prepare(&self) -> Result<PreparedChain> {
        for name in &self.required {
            let present = self
                .entries
                .iter()
                .any(|e| e.name == *name && !self.skipped.contains(name));
            if !present {
                return Err(Error::Internal(format!(
                    "required middleware missing: {name}"
                )));
            }
        }

        let mut active: Vec<Entry> = self
            .entries
            .iter()
            .filter(|e| !self.skipped.contains(&e.name))
            .filter(|e| !(self.allow_anonymous && e.is_guard()))
            .cloned()
            .collect();
        // Stable sort: ties keep insertion order.
        active.sort_by(|a, b| b.priority.cmp(&a.priority));

        Ok(PreparedChain {
            steps: Arc::new(
                active
                    .into_iter()
                    .map(|e| (e.name, e.handler))
                    .collect::<Vec<_>>(),
            ),
        })
    }
}

/// An immutable, execution-ready chain.
#[derive(Clone)]
pub struct PreparedChain {
    steps: Arc<Vec<(String, Handler)>>,
}

impl std::fmt::Debug for PreparedChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedChain")
            .field("steps", &self.steps.iter().map(|(name, _)| name).collect::<Vec<_>>())
            .finish()
    }
}

impl PreparedChain {
    pub async fn execute(&self, ctx: Context, terminal: Terminal) -> Context {
        let next = Next {
            steps: self.steps.clone(),
            index: 0,
            terminal,
        };
        next.run(ctx).await
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|(name, _)| name.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Headers, Request};
    use bytes::Bytes;

    fn ctx() -> Context {
        Context::new(Request {
            service: "svc".into(),
            endpoint: "/e".into(),
            content_type: "application/json".into(),
            headers: Headers::new(),
            body: Bytes::new(),
        })
    }

    fn tracer(name: &'static str) -> Entry {
        Entry::new(name, 0, move |mut ctx, next| {
            Box::pin(async move {
                let mut seen: Vec<String> = ctx
                    .attr("trace")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .unwrap_or_default();
                seen.push(name.to_string());
                ctx.set_attr("trace", serde_json::json!(seen));
                next.run(ctx).await
            })
        })
    }

    fn tracer_at(name: &'static str, priority: i32) -> Entry {
        let mut entry = tracer(name);
        entry.priority = priority;
        entry
    }

    fn noop_terminal() -> Terminal {
        Arc::new(|ctx| Box::pin(async move { ctx }))
    }

    async fn trace_of(chain: &Chain) -> Vec<String> {
        let prepared = chain.prepare().unwrap();
        let context = prepared.execute(ctx(), noop_terminal()).await;
        context
            .attr("trace")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn executes_by_descending_priority() {
        let mut chain = Chain::new();
        chain.use_entry(tracer_at("low", 1));
        chain.use_entry(tracer_at("high", 100));
        chain.use_entry(tracer_at("mid", 50));
        assert_eq!(trace_of(&chain).await, vec!["high", "mid", "low"]);
    }

    #[tokio::test]
    async fn ties_keep_insertion_order() {
        let mut chain = Chain::new();
        chain.use_entry(tracer_at("first", 5));
        chain.use_entry(tracer_at("second", 5));
        chain.use_entry(tracer_at("third", 5));
        assert_eq!(trace_of(&chain).await, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn skip_removes_exactly_that_entry() {
        let mut chain = Chain::new();
        chain.use_entry(tracer_at("a", 3));
        chain.use_entry(tracer_at("b", 2));
        chain.use_entry(tracer_at("c", 1));
        chain.skip("b");
        assert_eq!(trace_of(&chain).await, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn require_missing_fails_at_prepare() {
        let mut chain = Chain::new();
        chain.require("auth");
        let err = chain.prepare().unwrap_err();
        assert!(err.message().contains("auth"));
    }

    #[tokio::test]
    async fn require_present_is_noop() {
        let mut chain = Chain::new();
        chain.use_entry(tracer_at("auth", 1));
        chain.require("auth");
        assert_eq!(trace_of(&chain).await, vec!["auth"]);
    }

    #[tokio::test]
    async fn require_skipped_counts_as_missing() {
        let mut chain = Chain::new();
        chain.use_entry(tracer_at("auth", 1));
        chain.require("auth");
        chain.skip("auth");
        assert!(chain.prepare().is_err());
    }

    #[tokio::test]
    async fn short_circuit_without_next() {
        let mut chain = Chain::new();
        chain.use_named("stop", 10, |mut ctx, _next| {
            Box::pin(async move {
                ctx.response_mut().status = 403;
                ctx
            })
        });
        chain.use_entry(tracer_at("after", 1));

        let prepared = chain.prepare().unwrap();
        let context = prepared.execute(ctx(), noop_terminal()).await;
        assert_eq!(context.response().status, 403);
        assert!(context.attr("trace").is_none());
    }

    #[tokio::test]
    async fn compose_lifts_method_entries() {
        let mut service = Chain::new();
        service.use_entry(tracer_at("svc", 100));
        let mut method = Chain::new();
        method.use_entry(tracer_at("method", 100));

        let composed = Chain::compose(&service, &method);
        // Method band runs first: 100 + METHOD_OFFSET > 100.
        assert_eq!(trace_of(&composed).await, vec!["method", "svc"]);
    }

    #[tokio::test]
    async fn compose_method_overrides_same_name() {
        let mut service = Chain::new();
        service.use_entry(tracer_at("svc", 10));
        service.use_named("shared", 5, |mut ctx, next| {
            Box::pin(async move {
                ctx.set_attr("which", serde_json::json!("service"));
                next.run(ctx).await
            })
        });
        let mut method = Chain::new();
        method.use_named("shared", 5, |mut ctx, next| {
            Box::pin(async move {
                ctx.set_attr("which", serde_json::json!("method"));
                next.run(ctx).await
            })
        });

        let composed = Chain::compose(&service, &method);
        let prepared = composed.prepare().unwrap();
        let context = prepared.execute(ctx(), noop_terminal()).await;
        assert_eq!(context.attr_str("which"), Some("method"));
        // Only one "shared" entry survives.
        assert_eq!(
            prepared.step_names().iter().filter(|n| **n == "shared").count(),
            1
        );
    }

    fn guard_tracer(name: &'static str, priority: i32) -> Entry {
        let mut entry = tracer(name);
        entry.priority = priority;
        entry
    }

    #[tokio::test]
    async fn guards_run_nearest_the_handler() {
        let mut service = Chain::new();
        service.use_entry(tracer_at("plain", 0));
        service.use_entry(guard_tracer("guard:service", SERVICE_GUARD_PRIORITY));
        let mut method = Chain::new();
        method.use_entry(guard_tracer("guard:method", METHOD_GUARD_PRIORITY));

        let composed = Chain::compose(&service, &method);
        assert_eq!(
            trace_of(&composed).await,
            vec!["plain", "guard:service", "guard:method"]
        );
    }

    #[tokio::test]
    async fn allow_anonymous_suppresses_guards() {
        let mut chain = Chain::new();
        chain.use_entry(tracer_at("plain", 0));
        chain.use_entry(guard_tracer("guard:roles", SERVICE_GUARD_PRIORITY));
        chain.allow_anonymous(true);
        assert_eq!(trace_of(&chain).await, vec!["plain"]);
    }

    #[tokio::test]
    async fn error_slot_flows_to_caller() {
        let mut chain = Chain::new();
        chain.use_entry(tracer_at("outer", 1));
        let prepared = chain.prepare().unwrap();
        let terminal: Terminal = Arc::new(|mut ctx| {
            Box::pin(async move {
                ctx.fail(Error::NotFound("nothing here".into()));
                ctx
            })
        });
        let context = prepared.execute(ctx(), terminal).await;
        assert_eq!(context.error().map(|e| e.kind()), Some("NotFound"));
    }

    #[tokio::test]
    async fn terminal_runs_last() {
        let mut chain = Chain::new();
        chain.use_entry(tracer_at("outer", 1));
        let prepared = chain.prepare().unwrap();
        let terminal: Terminal = Arc::new(|mut ctx| {
            Box::pin(async move {
                ctx.response_mut().status = 204;
                ctx
            })
        });
        let context = prepared.execute(ctx(), terminal).await;
        assert_eq!(context.response().status, 204);
    }
}
