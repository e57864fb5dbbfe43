//! Minimal OpenAPI 3 document generated from the route table.

use std::sync::Arc;

use crate::route::Route;

fn openapi_path(path: &str) -> String {
    path.split('/')
        .map(|segment| match segment.strip_prefix(':') {
            Some(name) => format!("{{{name}}}"),
            None => segment.to_string(),
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn path_parameters(path: &str) -> Vec<serde_json::Value> {
    path.split('/')
        .filter_map(|segment| segment.strip_prefix(':'))
        .map(|name| {
            serde_json::json!({
                "name": name,
                "in": "path",
                "required": true,
                "schema": { "type": "string" },
            })
        })
        .collect()
}

/// Render the document for the registered routes.
pub fn openapi_document(routes: &[Arc<Route>], title: &str, version: &str) -> serde_json::Value {
    let mut paths = serde_json::Map::new();
    for route in routes {
        let summary = match &route.aggregate {
            Some(aggregate) => format!("Aggregate of {} services", aggregate.tasks.len()),
            None => format!("Proxy to {}{}", route.service, route.service_method),
        };
        let method = if route.http_method == "ANY" {
            "get".to_string()
        } else {
            route.http_method.to_ascii_lowercase()
        };
        let operation = serde_json::json!({
            "summary": summary,
            "parameters": path_parameters(&route.path),
            "responses": {
                "200": { "description": "Successful response" },
            },
        });

        let key = openapi_path(&route.path);
        paths
            .entry(key)
            .or_insert_with(|| serde_json::json!({}))
            .as_object_mut()
            .expect("path item is an object")
            .insert(method, operation);
    }

    serde_json::json!({
        "openapi": "3.0.0",
        "info": { "title": title, "version": version },
        "paths": paths,
    })
}
