//! The HTTP↔RPC bridge: every request not claimed by a built-in endpoint
//! lands here, gets routed, authenticated, cached, proxied, transformed,
//! and written back as JSON.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::Response;
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::HeaderMap;
use tracing::debug;

use weft_core::error::Error;
use weft_core::middleware::rate_limit::RateLimitKey;

use crate::aggregate;
use crate::cache::{CachedResponse, ResponseCache};
use crate::transform::apply_all;
use crate::GatewayInner;

/// Re-classify an upstream or internal error into the gateway's HTTP
/// status. Happens exactly once, here.
fn gateway_status(err: &Error) -> u16 {
    match err.kind() {
        "Timeout" | "GatewayTimeout" => 504,
        "ServiceUnavailable" | "ConnectionRefused" | "ConnectionReset" | "NetworkUnreachable" => {
            503
        }
        "Unauthorized" => 401,
        "Forbidden" => 403,
        "NotFound" => 404,
        "MethodNotAllowed" => 405,
        "RateLimited" => 429,
        "InvalidArgument" | "Validation" => err.status_code(),
        _ => 500,
    }
}

fn request_id_of(headers: &HeaderMap) -> Option<String> {
    headers
        .get("X-Request-Id")
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

fn json_response(status: u16, body: Bytes) -> Response {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .expect("static response construction")
}

fn error_response(err: &Error, headers: &HeaderMap) -> Response {
    let status = gateway_status(err);
    let mut body = serde_json::json!({
        "error": err.message(),
        "type": err.kind(),
    });
    if let Some(id) = request_id_of(headers) {
        body["request_id"] = serde_json::json!(id);
    }
    json_response(status, Bytes::from(body.to_string().into_bytes()))
}

fn rate_limit_key(kind: RateLimitKey, headers: &HeaderMap, path: &str) -> String {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
    };
    match kind {
        RateLimitKey::Ip => header_value("X-Forwarded-For")
            .map(|v| v.split(',').next().unwrap_or(&v).trim().to_string())
            .unwrap_or_else(|| "unknown".to_string()),
        RateLimitKey::User => header_value("Authorization").unwrap_or_else(|| "anonymous".into()),
        RateLimitKey::ApiKey => header_value("X-API-Key").unwrap_or_else(|| "missing".into()),
        RateLimitKey::Path => path.to_string(),
    }
}

pub(crate) async fn dispatch(
    State(inner): State<Arc<GatewayInner>>,
    req: Request,
) -> Response {
    let start = Instant::now();
    inner.metrics.requests_total.inc();

    let method = req.method().as_str().to_string();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();
    let headers = req.headers().clone();

    let response = handle(&inner, req, &method, &path, &query, &headers).await;
    inner
        .metrics
        .response_time_seconds
        .set(start.elapsed().as_secs_f64());
    response
}

async fn handle(
    inner: &Arc<GatewayInner>,
    req: Request,
    method: &str,
    path: &str,
    query: &str,
    headers: &HeaderMap,
) -> Response {
    // Admission control first; rejected requests never reach a backend.
    if let Some((limiter, key_kind, max)) = &inner.limiter {
        let key = rate_limit_key(*key_kind, headers, path);
        let decision = limiter.check(&key);
        if !decision.allowed {
            let retry_after = decision.reset_after.as_secs().max(1);
            let err = Error::RateLimited {
                message: "rate limit exceeded".into(),
                retry_after_secs: retry_after,
            };
            let mut response = error_response(&err, headers);
            let response_headers = response.headers_mut();
            response_headers.insert("Retry-After", retry_after.into());
            response_headers.insert("X-RateLimit-Limit", (*max).into());
            response_headers.insert("X-RateLimit-Remaining", 0u64.into());
            response_headers.insert(
                "X-RateLimit-Reset",
                decision.reset_after.as_secs().into(),
            );
            return response;
        }
    }

    let Some((route, params)) = inner.routes.find(method, path) else {
        let err = Error::NotFound(format!("no route for {method} {path}"));
        return error_response(&err, headers);
    };

    if !route.public {
        let principal = inner
            .authenticator
            .as_ref()
            .and_then(|auth| auth.authenticate(headers));
        let Some(principal) = principal else {
            return error_response(
                &Error::Unauthorized("authentication required".into()),
                headers,
            );
        };
        if !route.required_roles.is_empty()
            && !route.required_roles.iter().any(|r| principal.has_role(r))
        {
            return error_response(&Error::Forbidden("insufficient roles".into()), headers);
        }
    }

    let cache_key = route.cache.as_ref().map(|cfg| {
        let vary: Vec<String> = cfg
            .vary_headers
            .iter()
            .map(|name| {
                headers
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string()
            })
            .collect();
        ResponseCache::key(&route.service, &route.service_method, path, query, &vary)
    });
    if let Some(key) = &cache_key {
        if let Some(cached) = inner.cache.get(key) {
            inner.metrics.cache_hits_total.inc();
            debug!(target: "weft::gateway", %path, "cache hit");
            return json_response(cached.status, cached.body);
        }
        inner.metrics.cache_misses_total.inc();
    }

    let body = match axum::body::to_bytes(req.into_body(), inner.config.body_limit).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return error_response(
                &Error::InvalidArgument("request body too large or unreadable".into()),
                headers,
            )
        }
    };
    let params_value = match merge_params(&body, &params) {
        Ok(value) => value,
        Err(e) => return error_response(&e, headers),
    };

    let result = match &route.aggregate {
        Some(spec) => aggregate::execute(spec, &inner.proxies, params_value, headers).await,
        None => match inner.proxies.get(&route.service) {
            Some(proxy) => proxy.call(&route.service_method, params_value, headers).await,
            None => Err(Error::ServiceUnavailable(format!(
                "no proxy configured for {}",
                route.service
            ))),
        },
    };

    match result {
        Ok(value) => {
            let transformed = apply_all(&route.transformations, value);
            let bytes = Bytes::from(transformed.to_string().into_bytes());
            if let (Some(cfg), Some(key)) = (&route.cache, cache_key) {
                inner.cache.insert(
                    key,
                    CachedResponse {
                        status: 200,
                        content_type: "application/json".into(),
                        body: bytes.clone(),
                    },
                    cfg.ttl,
                );
            }
            json_response(200, bytes)
        }
        Err(e) => error_response(&e, headers),
    }
}

/// Interpret the request body as a JSON object and merge the extracted
/// path parameters into it. Path parameters win on key collision.
fn merge_params(
    body: &Bytes,
    params: &[(String, String)],
) -> Result<serde_json::Value, Error> {
    let parsed = if body.is_empty() {
        serde_json::Value::Object(serde_json::Map::new())
    } else {
        serde_json::from_slice(body)
            .map_err(|e| Error::InvalidArgument(format!("invalid JSON body: {e}")))?
    };
    if params.is_empty() {
        return Ok(parsed);
    }
    let mut object = match parsed {
        serde_json::Value::Object(object) => object,
        serde_json::Value::Null => serde_json::Map::new(),
        _ => {
            return Err(Error::InvalidArgument(
                "request body must be a JSON object".into(),
            ))
        }
    };
    for (name, value) in params {
        object.insert(name.clone(), serde_json::Value::String(value.clone()));
    }
    Ok(serde_json::Value::Object(object))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_reclassification() {
        assert_eq!(gateway_status(&Error::Timeout("t".into())), 504);
        assert_eq!(gateway_status(&Error::GatewayTimeout("t".into())), 504);
        assert_eq!(gateway_status(&Error::ServiceUnavailable("s".into())), 503);
        assert_eq!(gateway_status(&Error::ConnectionRefused("c".into())), 503);
        assert_eq!(gateway_status(&Error::Unauthorized("u".into())), 401);
        assert_eq!(gateway_status(&Error::MethodNotAllowed("m".into())), 405);
        assert_eq!(gateway_status(&Error::Conflict("x".into())), 500);
        assert_eq!(gateway_status(&Error::Internal("x".into())), 500);
    }

    #[test]
    fn merge_params_into_object() {
        let body = Bytes::from_static(br#"{"name":"x"}"#);
        let params = vec![("id".to_string(), "42".to_string())];
        let merged = merge_params(&body, &params).unwrap();
        assert_eq!(merged, serde_json::json!({"name": "x", "id": "42"}));
    }

    #[test]
    fn merge_params_empty_body() {
        let merged = merge_params(&Bytes::new(), &[("id".to_string(), "1".to_string())]).unwrap();
        assert_eq!(merged, serde_json::json!({"id": "1"}));
    }

    #[test]
    fn merge_params_rejects_non_object_with_params() {
        let body = Bytes::from_static(b"[1,2]");
        let err = merge_params(&body, &[("id".to_string(), "1".to_string())]).unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn merge_params_passthrough_without_params() {
        let body = Bytes::from_static(b"[1,2]");
        let merged = merge_params(&body, &[]).unwrap();
        assert_eq!(merged, serde_json::json!([1, 2]));
    }
}
