//! Gateway end-to-end: backend services over the loopback transport,
//! fronted by the axum router and driven in-process with `oneshot`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use http::{HeaderMap, Request, StatusCode};
use http_body_util::BodyExt;
use tower::util::ServiceExt;

use weft_core::error::Error;
use weft_core::prelude::*;
use weft_core::transport::loopback::reset_bus;
use weft_gateway::{
    AggregateTask, CacheConfig, GatewayAuthenticator, GatewayBuilder, PartialFailurePolicy,
    ProxyConfig, ResponseTransform, Route,
};
use weft_security::Principal;

struct Backends {
    transport: Arc<LoopbackTransport>,
    registry: Arc<MemoryRegistry>,
    running: Vec<RunningService>,
    show_calls: Arc<AtomicUsize>,
}

async fn start_backends() -> Backends {
    reset_bus();
    weft_core::codec::reset_codecs();
    let transport = Arc::new(LoopbackTransport::new());
    let registry = Arc::new(MemoryRegistry::new());
    let show_calls = Arc::new(AtomicUsize::new(0));

    let calls = show_calls.clone();
    let catalog = Service::build("catalog")
        .bind("catalog.gw")
        .transport(transport.clone())
        .registry(registry.clone())
        .endpoint("/show", "id", move |id: String| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(serde_json::json!({"id": format!("p-{id}"), "price": 9.99, "internal_cost": 4.2}))
            }
        })
        .endpoint("/fetch", "id", |_id: serde_json::Value| async move {
            Ok(serde_json::json!({"id": "p-1", "price": 9.99}))
        });

    let orders = Service::build("orders")
        .bind("orders.gw")
        .transport(transport.clone())
        .registry(registry.clone())
        .endpoint("/fetch", "id", |_id: serde_json::Value| async move {
            Err::<serde_json::Value, _>(Error::Internal("orders exploded".into()))
        });

    let running = vec![
        serve(catalog).await.unwrap(),
        serve(orders).await.unwrap(),
    ];
    Backends {
        transport,
        registry,
        running,
        show_calls,
    }
}

async fn send(
    router: &axum::Router,
    method: &str,
    path: &str,
    body: Option<serde_json::Value>,
    bearer: Option<&str>,
) -> (StatusCode, serde_json::Value) {
    let mut builder = Request::builder().method(method).uri(path);
    if let Some(token) = bearer {
        builder = builder.header("Authorization", format!("Bearer {token}"));
    }
    let request = match body {
        Some(value) => builder
            .header("Content-Type", "application/json")
            .body(Body::from(value.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn teardown(backends: Backends) {
    for running in backends.running {
        running.shutdown().await.unwrap();
    }
}

fn no_retry() -> ProxyConfig {
    ProxyConfig {
        retry: weft_core::client::RetryPolicy::none(),
        ..Default::default()
    }
}

#[tokio::test]
#[serial_test::serial]
async fn path_params_reach_the_backend() {
    let backends = start_backends().await;
    let gateway = GatewayBuilder::new(backends.transport.clone(), backends.registry.clone())
        .route(Route::new("GET", "/products/:id", "catalog", "/show"))
        .build();
    let router = gateway.router();

    let (status, body) = send(&router, "GET", "/products/42", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], "p-42");

    teardown(backends).await;
}

#[tokio::test]
#[serial_test::serial]
async fn unknown_route_is_404() {
    let backends = start_backends().await;
    let gateway = GatewayBuilder::new(backends.transport.clone(), backends.registry.clone())
        .route(Route::new("GET", "/products/:id", "catalog", "/show"))
        .build();
    let router = gateway.router();

    let (status, body) = send(&router, "GET", "/nothing", None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["type"], "NotFound");

    teardown(backends).await;
}

#[tokio::test]
#[serial_test::serial]
async fn transformations_apply_in_order() {
    let backends = start_backends().await;
    let gateway = GatewayBuilder::new(backends.transport.clone(), backends.registry.clone())
        .route(
            Route::new("GET", "/products/:id", "catalog", "/show")
                .transform(ResponseTransform::remove_fields(["internal_cost"]))
                .transform(ResponseTransform::add_field(
                    "source",
                    serde_json::json!("gateway"),
                )),
        )
        .build();
    let router = gateway.router();

    let (status, body) = send(&router, "GET", "/products/7", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.get("internal_cost").is_none());
    assert_eq!(body["source"], "gateway");
    assert_eq!(body["id"], "p-7");

    teardown(backends).await;
}

#[tokio::test]
#[serial_test::serial]
async fn aggregate_tolerates_partial_failure() {
    let backends = start_backends().await;
    let gateway = GatewayBuilder::new(backends.transport.clone(), backends.registry.clone())
        .route(Route::aggregate(
            "POST",
            "/summary",
            vec![
                AggregateTask::new("catalog", "catalog", "/fetch"),
                AggregateTask::new("orders", "orders", "/fetch"),
            ],
        ))
        .default_proxy_config(no_retry())
        .build();
    let router = gateway.router();

    let (status, body) = send(
        &router,
        "POST",
        "/summary",
        Some(serde_json::json!({"id": "p-1"})),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["catalog"], serde_json::json!({"id": "p-1", "price": 9.99}));
    assert!(body["orders"]["error"].is_string());

    teardown(backends).await;
}

#[tokio::test]
#[serial_test::serial]
async fn aggregate_fail_policy_aborts() {
    let backends = start_backends().await;
    let gateway = GatewayBuilder::new(backends.transport.clone(), backends.registry.clone())
        .route(
            Route::aggregate(
                "POST",
                "/summary",
                vec![
                    AggregateTask::new("catalog", "catalog", "/fetch"),
                    AggregateTask::new("orders", "orders", "/fetch"),
                ],
            )
            .on_partial_failure(PartialFailurePolicy::Fail),
        )
        .default_proxy_config(no_retry())
        .build();
    let router = gateway.router();

    let (status, body) = send(
        &router,
        "POST",
        "/summary",
        Some(serde_json::json!({"id": "p-1"})),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].is_string());

    teardown(backends).await;
}

#[tokio::test]
#[serial_test::serial]
async fn cached_route_hits_then_expires() {
    let backends = start_backends().await;
    let gateway = GatewayBuilder::new(backends.transport.clone(), backends.registry.clone())
        .route(
            Route::new("GET", "/products/:id", "catalog", "/show")
                .cached(CacheConfig::ttl(Duration::from_millis(150))),
        )
        .build();
    let router = gateway.router();

    let (status, first) = send(&router, "GET", "/products/9", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(backends.show_calls.load(Ordering::SeqCst), 1);

    let (_, second) = send(&router, "GET", "/products/9", None, None).await;
    assert_eq!(second, first);
    assert_eq!(backends.show_calls.load(Ordering::SeqCst), 1);

    let metrics = gateway.metrics().encode();
    assert!(metrics.contains("gateway_cache_hits_total 1"));
    assert!(metrics.contains("gateway_cache_misses_total 1"));

    // A different id is a different key.
    send(&router, "GET", "/products/10", None, None).await;
    assert_eq!(backends.show_calls.load(Ordering::SeqCst), 2);

    tokio::time::sleep(Duration::from_millis(200)).await;
    send(&router, "GET", "/products/9", None, None).await;
    assert_eq!(backends.show_calls.load(Ordering::SeqCst), 3);

    teardown(backends).await;
}

struct StaticAuth;
impl GatewayAuthenticator for StaticAuth {
    fn authenticate(&self, headers: &HeaderMap) -> Option<Principal> {
        let token = headers
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|h| h.strip_prefix("Bearer "))?;
        match token {
            "admin-token" => Some(Principal::new("admin").with_role("admin")),
            "user-token" => Some(Principal::new("user").with_role("user")),
            _ => None,
        }
    }
}

#[tokio::test]
#[serial_test::serial]
async fn role_protected_route() {
    let backends = start_backends().await;
    let gateway = GatewayBuilder::new(backends.transport.clone(), backends.registry.clone())
        .route(Route::new("GET", "/products/:id", "catalog", "/show").require_roles(["admin"]))
        .authenticator(Arc::new(StaticAuth))
        .build();
    let router = gateway.router();

    let (status, body) = send(&router, "GET", "/products/1", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["type"], "Unauthorized");

    let (status, _) = send(&router, "GET", "/products/1", None, Some("user-token")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(&router, "GET", "/products/1", None, Some("admin-token")).await;
    assert_eq!(status, StatusCode::OK);

    teardown(backends).await;
}

#[tokio::test]
#[serial_test::serial]
async fn down_service_maps_to_503() {
    let backends = start_backends().await;
    let gateway = GatewayBuilder::new(backends.transport.clone(), backends.registry.clone())
        .route(Route::new("GET", "/ghosts", "ghost-service", "/list"))
        .default_proxy_config(no_retry())
        .build();
    let router = gateway.router();

    let (status, body) = send(&router, "GET", "/ghosts", None, None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["type"], "ServiceUnavailable");

    teardown(backends).await;
}

#[tokio::test]
#[serial_test::serial]
async fn built_in_endpoints() {
    let backends = start_backends().await;
    let gateway = GatewayBuilder::new(backends.transport.clone(), backends.registry.clone())
        .route(Route::new("GET", "/products/:id", "catalog", "/show"))
        .build();
    gateway.probe_now().await;
    let router = gateway.router();

    let (status, docs) = send(&router, "GET", "/api/docs", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(docs["openapi"], "3.0.0");
    assert!(docs["paths"]["/products/{id}"]["get"].is_object());

    let (status, health) = send(&router, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "ok");
    assert_eq!(health["services"]["catalog"], true);

    let request = Request::builder()
        .method("GET")
        .uri("/metrics")
        .body(Body::empty())
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let text = String::from_utf8(
        response
            .into_body()
            .collect()
            .await
            .unwrap()
            .to_bytes()
            .to_vec(),
    )
    .unwrap();
    assert!(text.contains("gateway_requests_total"));

    teardown(backends).await;
}
