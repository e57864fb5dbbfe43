//! Service registry: where services advertise themselves and clients
//! discover peers.
//!
//! The [`Registry`] trait is the driver boundary; the in-memory driver in
//! [`memory`] is the reference implementation and keeps entries until they
//! are explicitly deregistered. Whether `watch()` replays a snapshot of
//! existing services is driver-specific — the memory driver emits only
//! future changes.

pub mod memory;
pub mod selector;

pub use memory::MemoryRegistry;
pub use selector::{RandomSelector, RoundRobinSelector, Selector};

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::{Error, Result};

/// One running instance of a service.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    /// Unique per process instance.
    pub id: String,
    pub address: String,
    pub port: u16,
    pub metadata: HashMap<String, String>,
}

impl Node {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            address: address.into(),
            port,
            metadata: HashMap::new(),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// A service as seen by the registry: one record per (name, version).
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceRecord {
    pub name: String,
    pub version: String,
    pub metadata: HashMap<String, String>,
    pub nodes: Vec<Node>,
}

impl ServiceRecord {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            metadata: HashMap::new(),
            nodes: Vec::new(),
        }
    }

    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }
}

/// What happened to a service record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryAction {
    Create,
    Update,
    Delete,
}

/// A change notification from [`Registry::watch`].
#[derive(Debug, Clone)]
pub struct RegistryEvent {
    pub action: RegistryAction,
    pub service: ServiceRecord,
}

/// A live watch on registry changes.
///
/// A watcher that falls too far behind loses the oldest events; that is
/// surfaced as an error item and the stream continues.
pub struct Watcher {
    rx: broadcast::Receiver<RegistryEvent>,
}

impl Watcher {
    pub fn new(rx: broadcast::Receiver<RegistryEvent>) -> Self {
        Self { rx }
    }

    /// Next event, `None` once the registry is gone.
    pub async fn next(&mut self) -> Option<Result<RegistryEvent>> {
        match self.rx.recv().await {
            Ok(event) => Some(Ok(event)),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                Some(Err(Error::Internal(format!("watcher lagged by {n} events"))))
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}

/// Registry driver boundary.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Register (or merge) a service record. Concurrent register/deregister
    /// for the same (name, version) are serialized by the driver.
    async fn register(&self, service: &ServiceRecord) -> Result<()>;

    /// Remove the record's nodes, keyed by node id alone; the addresses in
    /// the passed record may be placeholders.
    async fn deregister(&self, service: &ServiceRecord) -> Result<()>;

    /// All versions of a named service, one record each.
    async fn get_service(&self, name: &str) -> Result<Vec<ServiceRecord>>;

    async fn list_services(&self) -> Result<Vec<ServiceRecord>>;

    async fn watch(&self) -> Result<Watcher>;
}

struct DefaultRegistrySlot {
    registry: Option<Arc<dyn Registry>>,
    read: bool,
}

fn default_slot() -> &'static Mutex<DefaultRegistrySlot> {
    static SLOT: OnceLock<Mutex<DefaultRegistrySlot>> = OnceLock::new();
    SLOT.get_or_init(|| {
        Mutex::new(DefaultRegistrySlot {
            registry: None,
            read: false,
        })
    })
}

/// The process-wide default registry. Lazily an in-memory driver.
pub fn default_registry() -> Arc<dyn Registry> {
    let mut slot = default_slot().lock().expect("default registry poisoned");
    slot.read = true;
    slot.registry
        .get_or_insert_with(|| Arc::new(MemoryRegistry::new()))
        .clone()
}

/// Replace the process-wide default registry. Only allowed before the first
/// read; services that already resolved the default keep using it.
pub fn set_default_registry(registry: Arc<dyn Registry>) -> Result<()> {
    let mut slot = default_slot().lock().expect("default registry poisoned");
    if slot.read {
        return Err(Error::Config(
            "default registry already in use; set it before starting services".into(),
        ));
    }
    slot.registry = Some(registry);
    Ok(())
}

/// Clear the default registry. Test hook.
pub fn reset_default_registry() {
    let mut slot = default_slot().lock().expect("default registry poisoned");
    slot.registry = None;
    slot.read = false;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[serial_test::serial]
    fn default_registry_is_lazy_and_sticky() {
        reset_default_registry();
        let a = default_registry();
        let b = default_registry();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    #[serial_test::serial]
    fn set_default_before_first_read() {
        reset_default_registry();
        let custom: Arc<dyn Registry> = Arc::new(MemoryRegistry::new());
        set_default_registry(custom.clone()).unwrap();
        let resolved = default_registry();
        assert!(Arc::ptr_eq(&custom, &resolved));
    }

    #[test]
    #[serial_test::serial]
    fn set_default_after_read_fails() {
        reset_default_registry();
        let _ = default_registry();
        let err = set_default_registry(Arc::new(MemoryRegistry::new())).unwrap_err();
        assert_eq!(err.kind(), "Config");
    }

    #[test]
    fn node_addr_formatting() {
        let node = Node::new("10.0.0.1", 8080);
        assert_eq!(node.addr(), "10.0.0.1:8080");
        assert!(!node.id.is_empty());
    }
}
