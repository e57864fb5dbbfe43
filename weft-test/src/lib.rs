//! weft-test — an in-process cluster for integration tests.
//!
//! A [`Cluster`] wires a loopback transport, an in-memory registry, and an
//! in-memory broker, so whole service topologies run inside one test
//! without binding ports.
//!
//! ```ignore
//! let mut cluster = Cluster::new().await;
//! let greeter = cluster.service("greeter").endpoint("/hello", "name", |name: String| async move {
//!     Ok(format!("Hello {name}!"))
//! });
//! cluster.start(greeter).await.unwrap();
//! let reply: String = cluster
//!     .client()
//!     .call("greeter", "/hello", &serde_json::json!({"name": "World"}))
//!     .await
//!     .unwrap();
//! ```
//!
//! The loopback address bus and the codec registry are process-wide, so
//! tests that build clusters should run serially.

use std::sync::Arc;

use weft_core::broker::Broker;
use weft_core::client::Client;
use weft_core::error::Result;
use weft_core::registry::MemoryRegistry;
use weft_core::service::{serve, RunningService, Service};
use weft_core::transport::loopback::reset_bus;
use weft_core::transport::LoopbackTransport;
use weft_events::{MemoryBroker, PubSub};

pub struct Cluster {
    transport: Arc<LoopbackTransport>,
    registry: Arc<MemoryRegistry>,
    broker: Arc<MemoryBroker>,
    running: Vec<RunningService>,
}

impl Cluster {
    /// A fresh cluster. Clears the process-wide loopback bus and codec
    /// registry, so only one cluster should live at a time.
    pub async fn new() -> Self {
        reset_bus();
        weft_core::codec::reset_codecs();
        let broker = Arc::new(MemoryBroker::new());
        broker.connect().await.expect("memory broker connect");
        Self {
            transport: Arc::new(LoopbackTransport::new()),
            registry: Arc::new(MemoryRegistry::new()),
            broker,
            running: Vec::new(),
        }
    }

    pub fn transport(&self) -> Arc<LoopbackTransport> {
        self.transport.clone()
    }

    pub fn registry(&self) -> Arc<MemoryRegistry> {
        self.registry.clone()
    }

    pub fn broker(&self) -> Arc<MemoryBroker> {
        self.broker.clone()
    }

    /// A service builder pre-wired to the cluster's transport, registry,
    /// and broker, bound at `<name>.cluster`.
    pub fn service(&self, name: &str) -> Service {
        Service::build(name)
            .bind(format!("{name}.cluster"))
            .transport(self.transport.clone())
            .registry(self.registry.clone())
            .broker(self.broker.clone())
    }

    /// Start a service and keep it alive until [`Cluster::shutdown`].
    pub async fn start(&mut self, service: Service) -> Result<&RunningService> {
        let running = serve(service).await?;
        self.running.push(running);
        Ok(self.running.last().expect("just pushed"))
    }

    /// A discovery-aware client wired to the cluster.
    pub fn client(&self) -> Client {
        Client::new(self.transport.clone(), self.registry.clone())
    }

    /// A typed pub/sub facade over the cluster broker.
    pub fn pubsub(&self) -> PubSub {
        PubSub::new(self.broker.clone())
    }

    /// Shut every started service down, most recent first.
    pub async fn shutdown(mut self) -> Result<()> {
        let mut first_err = None;
        while let Some(running) = self.running.pop() {
            if let Err(e) = running.shutdown().await {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
