use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use weft_test::Cluster;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Greeted {
    name: String,
}

#[tokio::test]
#[serial_test::serial]
async fn rpc_and_events_through_one_cluster() {
    let mut cluster = Cluster::new().await;

    let greetings = Arc::new(AtomicUsize::new(0));
    let seen = greetings.clone();
    let pubsub = cluster.pubsub();
    let announce = pubsub.clone();

    let greeter = cluster
        .service("greeter")
        .endpoint("/hello", "name", move |name: String| {
            let announce = announce.clone();
            async move {
                announce.publish("greetings", &Greeted { name: name.clone() }).await?;
                Ok(format!("Hello {name}!"))
            }
        })
        .subscribe("greetings", move |_greeted: Greeted| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
    cluster.start(greeter).await.unwrap();

    let reply: String = cluster
        .client()
        .call("greeter", "/hello", &serde_json::json!({"name": "World"}))
        .await
        .unwrap();
    assert_eq!(reply, "Hello World!");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(greetings.load(Ordering::SeqCst), 1);

    cluster.shutdown().await.unwrap();
}

#[tokio::test]
#[serial_test::serial]
async fn two_services_call_each_other() {
    let mut cluster = Cluster::new().await;

    let product = cluster
        .service("product")
        .endpoint("/price", "id", |_id: String| async move { Ok(9.99f64) });
    cluster.start(product).await.unwrap();

    let client = Arc::new(cluster.client());
    let pricing = client.clone();
    let order = cluster
        .service("order")
        .endpoint("/total", "quantity", move |quantity: u32| {
            let pricing = pricing.clone();
            async move {
                let price: f64 = pricing
                    .call("product", "/price", &serde_json::json!({"id": "p-1"}))
                    .await?;
                Ok(price * quantity as f64)
            }
        });
    cluster.start(order).await.unwrap();

    let total: f64 = cluster
        .client()
        .call("order", "/total", &serde_json::json!({"quantity": 3}))
        .await
        .unwrap();
    assert!((total - 29.97).abs() < 1e-9);

    cluster.shutdown().await.unwrap();
}
