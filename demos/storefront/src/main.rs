//! Catalog and orders services behind the gateway, all in one process.
//!
//! ```text
//! cargo run -p demo-storefront
//! curl http://127.0.0.1:8080/products/1
//! curl -X POST http://127.0.0.1:8080/summary -d '{"id":"1"}'
//! curl http://127.0.0.1:8080/health
//! ```

use std::sync::Arc;
use std::time::Duration;

use weft::prelude::*;
use weft::weft_gateway::{AggregateTask, CacheConfig, GatewayBuilder, Route};

async fn start_backends(
    transport: Arc<LoopbackTransport>,
    registry: Arc<MemoryRegistry>,
) -> weft::Result<Vec<RunningService>> {
    let catalog = Service::build("catalog")
        .version("1.0.0")
        .bind("catalog.local")
        .transport(transport.clone())
        .registry(registry.clone())
        .endpoint("/show", "id", |id: String| async move {
            Ok(serde_json::json!({
                "id": id,
                "name": "left-handed hammer",
                "price": 9.99,
                "warehouse_row": 14,
            }))
        });

    let orders = Service::build("orders")
        .version("1.0.0")
        .bind("orders.local")
        .transport(transport.clone())
        .registry(registry.clone())
        .endpoint("/recent", "id", |id: String| async move {
            Ok(serde_json::json!({ "product": id, "open_orders": 3 }))
        });

    Ok(vec![serve(catalog).await?, serve(orders).await?])
}

#[tokio::main]
async fn main() -> weft::Result<()> {
    weft::runtime::init_tracing();

    let transport = Arc::new(LoopbackTransport::new());
    let registry = Arc::new(MemoryRegistry::new());
    let backends = start_backends(transport.clone(), registry.clone()).await?;

    let gateway = GatewayBuilder::new(transport, registry)
        .route(
            Route::new("GET", "/products/:id", "catalog", "/show")
                .cached(CacheConfig::ttl(Duration::from_secs(5)))
                .transform(ResponseTransform::remove_fields(["warehouse_row"])),
        )
        .route(Route::aggregate(
            "POST",
            "/summary",
            vec![
                AggregateTask::new("catalog", "catalog", "/show"),
                AggregateTask::new("orders", "orders", "/recent"),
            ],
        ))
        .build();
    gateway.start_background();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
    tracing::info!("gateway listening on http://127.0.0.1:8080");
    axum::serve(listener, gateway.router())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .map_err(|e| weft::Error::Io(e.to_string()))?;

    gateway.shutdown();
    for backend in backends {
        backend.shutdown().await?;
    }
    Ok(())
}
