//! Gateway health: a periodic probe of every proxied service through the
//! registry, served as `{status, services, uptime_seconds}`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use weft_core::registry::Registry;

pub struct HealthState {
    services: DashMap<String, bool>,
    started_at: Instant,
}

impl HealthState {
    pub fn new<I: IntoIterator<Item = String>>(service_names: I) -> Self {
        let services = DashMap::new();
        for name in service_names {
            services.insert(name, false);
        }
        Self {
            services,
            started_at: Instant::now(),
        }
    }

    /// One probe pass: a service is healthy while the registry knows at
    /// least one node for it.
    pub async fn probe(&self, registry: &Arc<dyn Registry>) {
        let names: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();
        for name in names {
            let up = registry
                .get_service(&name)
                .await
                .map(|records| records.iter().any(|r| !r.nodes.is_empty()))
                .unwrap_or(false);
            self.services.insert(name, up);
        }
    }

    pub fn snapshot(&self) -> serde_json::Value {
        let mut services = serde_json::Map::new();
        let mut all_up = true;
        for entry in self.services.iter() {
            all_up &= *entry.value();
            services.insert(entry.key().clone(), serde_json::json!(*entry.value()));
        }
        serde_json::json!({
            "status": if all_up { "ok" } else { "degraded" },
            "services": services,
            "uptime_seconds": self.started_at.elapsed().as_secs(),
        })
    }

    pub fn spawn_probe(
        self: Arc<Self>,
        registry: Arc<dyn Registry>,
        interval: Duration,
        token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let state = self;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick.tick() => state.probe(&registry).await,
                }
            }
        })
    }
}
