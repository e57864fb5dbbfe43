//! Reference in-memory registry driver.
//!
//! Entries are process-scoped and permanent until explicit deregister.
//! All mutation goes through one mutex, which serializes concurrent
//! register/deregister per (name, version) as the contract requires.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::{Error, Result};

use super::{Registry, RegistryAction, RegistryEvent, ServiceRecord, Watcher};

const WATCH_BUFFER: usize = 256;

type VersionMap = BTreeMap<String, ServiceRecord>;

pub struct MemoryRegistry {
    services: Mutex<BTreeMap<String, VersionMap>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_BUFFER);
        Self {
            services: Mutex::new(BTreeMap::new()),
            events,
        }
    }

    fn emit(&self, action: RegistryAction, service: ServiceRecord) {
        // No watchers is fine; send only fails when there are none.
        let _ = self.events.send(RegistryEvent { action, service });
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn register(&self, service: &ServiceRecord) -> Result<()> {
        if service.name.is_empty() {
            return Err(Error::InvalidArgument("service name must not be empty".into()));
        }
        let mut services = self.services.lock().expect("registry poisoned");
        let versions = services.entry(service.name.clone()).or_default();
        let (action, merged) = match versions.get_mut(&service.version) {
            Some(existing) => {
                existing.metadata = service.metadata.clone();
                for node in &service.nodes {
                    match existing.nodes.iter_mut().find(|n| n.id == node.id) {
                        Some(slot) => *slot = node.clone(),
                        None => existing.nodes.push(node.clone()),
                    }
                }
                (RegistryAction::Update, existing.clone())
            }
            None => {
                versions.insert(service.version.clone(), service.clone());
                (RegistryAction::Create, service.clone())
            }
        };
        drop(services);
        self.emit(action, merged);
        Ok(())
    }

    async fn deregister(&self, service: &ServiceRecord) -> Result<()> {
        let ids: Vec<&str> = service.nodes.iter().map(|n| n.id.as_str()).collect();
        let mut services = self.services.lock().expect("registry poisoned");
        let Some(versions) = services.get_mut(&service.name) else {
            return Ok(());
        };
        let mut event = None;
        if let Some(record) = versions.get_mut(&service.version) {
            record.nodes.retain(|n| !ids.contains(&n.id.as_str()));
            if record.nodes.is_empty() {
                let removed = versions.remove(&service.version).expect("record vanished");
                event = Some((RegistryAction::Delete, removed));
            } else {
                event = Some((RegistryAction::Update, record.clone()));
            }
        }
        if versions.is_empty() {
            services.remove(&service.name);
        }
        drop(services);
        if let Some((action, record)) = event {
            self.emit(action, record);
        }
        Ok(())
    }

    async fn get_service(&self, name: &str) -> Result<Vec<ServiceRecord>> {
        let services = self.services.lock().expect("registry poisoned");
        let records: Vec<ServiceRecord> = services
            .get(name)
            .map(|versions| versions.values().cloned().collect())
            .unwrap_or_default();
        if records.is_empty() {
            return Err(Error::NotFound(format!("service not found: {name}")));
        }
        Ok(records)
    }

    async fn list_services(&self) -> Result<Vec<ServiceRecord>> {
        let services = self.services.lock().expect("registry poisoned");
        Ok(services
            .values()
            .flat_map(|versions| versions.values().cloned())
            .collect())
    }

    async fn watch(&self) -> Result<Watcher> {
        Ok(Watcher::new(self.events.subscribe()))
    }
}
