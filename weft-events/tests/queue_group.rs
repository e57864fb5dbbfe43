//! Queue-group balancing across two running services sharing a broker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use weft_core::prelude::*;
use weft_core::transport::loopback::reset_bus;
use weft_events::{MemoryBroker, PubSub};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Job {
    id: u32,
}

fn worker(
    name: &str,
    addr: &str,
    transport: Arc<LoopbackTransport>,
    registry: Arc<MemoryRegistry>,
    broker: Arc<MemoryBroker>,
    counter: Arc<AtomicUsize>,
) -> Service {
    Service::build(name)
        .bind(addr)
        .transport(transport)
        .registry(registry)
        .broker(broker)
        .subscribe_queue("work.queue", "workers", move |_job: Job| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
}

#[tokio::test]
#[serial_test::serial]
async fn queue_group_splits_the_stream() {
    reset_bus();
    weft_core::codec::reset_codecs();
    let transport = Arc::new(LoopbackTransport::new());
    let registry = Arc::new(MemoryRegistry::new());
    let broker = Arc::new(MemoryBroker::new());
    broker.connect().await.unwrap();

    let c1 = Arc::new(AtomicUsize::new(0));
    let c2 = Arc::new(AtomicUsize::new(0));

    let s1 = weft_core::service::serve(worker(
        "worker-1",
        "worker-1.local",
        transport.clone(),
        registry.clone(),
        broker.clone(),
        c1.clone(),
    ))
    .await
    .unwrap();
    let s2 = weft_core::service::serve(worker(
        "worker-2",
        "worker-2.local",
        transport.clone(),
        registry.clone(),
        broker.clone(),
        c2.clone(),
    ))
    .await
    .unwrap();

    assert!(s1.subscriptions()[0].is_active());
    assert!(s2.subscriptions()[0].is_active());

    let pubsub = PubSub::new(broker.clone());
    for id in 0..10 {
        pubsub.publish("work.queue", &Job { id }).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let n1 = c1.load(Ordering::SeqCst);
    let n2 = c2.load(Ordering::SeqCst);
    assert_eq!(n1 + n2, 10);
    assert!(n1 > 0, "worker-1 received nothing");
    assert!(n2 > 0, "worker-2 received nothing");

    s1.shutdown().await.unwrap();
    // The first shutdown disconnected the shared broker; the second
    // service's subscription is already inactive.
    assert!(!s2.subscriptions()[0].is_active());
    s2.shutdown().await.unwrap();
}
