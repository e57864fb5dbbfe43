//! Aggregate routes: fan out to several backends in parallel and assemble
//! one JSON object keyed by task name.

use std::collections::HashMap;
use std::sync::Arc;

use http::HeaderMap;
use tracing::debug;

use weft_core::error::{Error, Result};

use crate::proxy::ServiceProxy;
use crate::route::{AggregateSpec, PartialFailurePolicy};

/// Run every task concurrently. Under the Tolerate policy a failed branch
/// is recorded as `{"error": ...}` under its key; under Fail the first
/// branch error fails the whole aggregate.
pub async fn execute(
    spec: &AggregateSpec,
    proxies: &HashMap<String, Arc<ServiceProxy>>,
    params: serde_json::Value,
    headers: &HeaderMap,
) -> Result<serde_json::Value> {
    let mut branches = Vec::with_capacity(spec.tasks.len());
    for task in &spec.tasks {
        let proxy = proxies.get(&task.service).cloned();
        let params = params.clone();
        let headers = headers.clone();
        let service = task.service.clone();
        let method = task.method.clone();
        let handle = tokio::spawn(async move {
            match proxy {
                Some(proxy) => proxy.call(&method, params, &headers).await,
                None => Err(Error::ServiceUnavailable(format!(
                    "no proxy configured for {service}"
                ))),
            }
        });
        branches.push((task.name.clone(), handle));
    }

    let mut assembled = serde_json::Map::new();
    let mut first_error = None;
    for (name, handle) in branches {
        match handle.await {
            Ok(Ok(value)) => {
                assembled.insert(name, value);
            }
            Ok(Err(e)) => {
                debug!(target: "weft::gateway", task = %name, error = %e, "aggregate branch failed");
                assembled.insert(name, serde_json::json!({ "error": e.message() }));
                first_error.get_or_insert(e);
            }
            Err(join) => {
                assembled.insert(
                    name,
                    serde_json::json!({ "error": "aggregate branch panicked" }),
                );
                first_error.get_or_insert(Error::Internal(join.to_string()));
            }
        }
    }

    match (spec.on_partial_failure, first_error) {
        (PartialFailurePolicy::Fail, Some(e)) => Err(e),
        _ => Ok(serde_json::Value::Object(assembled)),
    }
}
