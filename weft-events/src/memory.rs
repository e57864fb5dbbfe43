//! In-memory broker: the reference driver.
//!
//! Topics fan out to their plain subscribers; queue groups rotate a cursor
//! so each published event reaches exactly one member. Every subscription
//! gets its own bounded delivery queue and task, which keeps delivery
//! ordered per subscription from this (single) broker endpoint.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use weft_core::broker::{
    Broker, BrokerError, BrokerResult, Event, EventHandler, SubscriptionHandle,
};

const DELIVERY_QUEUE_DEPTH: usize = 256;

struct Subscriber {
    handle: SubscriptionHandle,
    tx: mpsc::Sender<Event>,
}

#[derive(Default)]
struct GroupState {
    members: Vec<Subscriber>,
    cursor: usize,
}

#[derive(Default)]
struct TopicState {
    plain: Vec<Subscriber>,
    groups: HashMap<String, GroupState>,
}

pub struct MemoryBroker {
    connected: AtomicBool,
    topics: Mutex<HashMap<String, TopicState>>,
}

impl MemoryBroker {
    /// A broker that still needs [`Broker::connect`] to be called.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            topics: Mutex::new(HashMap::new()),
        }
    }

    fn ensure_connected(&self) -> BrokerResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::NotConnected)
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> BrokerResult<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> BrokerResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        let mut topics = self.topics.lock().expect("broker poisoned");
        for state in topics.values() {
            for sub in &state.plain {
                sub.handle.deactivate();
            }
            for group in state.groups.values() {
                for sub in &group.members {
                    sub.handle.deactivate();
                }
            }
        }
        // Dropping the senders ends every delivery loop once drained.
        topics.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn publish(&self, topic: &str, event: Event) -> BrokerResult<()> {
        self.ensure_connected()?;

        let targets: Vec<mpsc::Sender<Event>> = {
            let mut topics = self.topics.lock().expect("broker poisoned");
            let Some(state) = topics.get_mut(topic) else {
                return Ok(());
            };
            state.plain.retain(|s| s.handle.is_active());
            for group in state.groups.values_mut() {
                group.members.retain(|s| s.handle.is_active());
            }

            let mut targets: Vec<mpsc::Sender<Event>> =
                state.plain.iter().map(|s| s.tx.clone()).collect();
            for group in state.groups.values_mut() {
                if group.members.is_empty() {
                    continue;
                }
                let index = group.cursor % group.members.len();
                group.cursor = group.cursor.wrapping_add(1);
                targets.push(group.members[index].tx.clone());
            }
            targets
        };

        for tx in targets {
            if tx.send(event.clone()).await.is_err() {
                debug!(target: "weft::events", %topic, "subscriber queue gone, dropping delivery");
            }
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        queue_group: Option<&str>,
        handler: EventHandler,
    ) -> BrokerResult<SubscriptionHandle> {
        self.ensure_connected()?;

        let handle = SubscriptionHandle::new(topic, queue_group.map(String::from));
        let (tx, mut rx) = mpsc::channel::<Event>(DELIVERY_QUEUE_DEPTH);

        // Per-subscription delivery loop; handler outcomes (including retry
        // exhaustion) are the wrapper's business, the loop just keeps order.
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let _ = handler(event).await;
            }
        });

        let subscriber = Subscriber {
            handle: handle.clone(),
            tx,
        };
        let mut topics = self.topics.lock().expect("broker poisoned");
        let state = topics.entry(topic.to_string()).or_default();
        match queue_group {
            Some(group) => state
                .groups
                .entry(group.to_string())
                .or_default()
                .members
                .push(subscriber),
            None => state.plain.push(subscriber),
        }
        Ok(handle)
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> BrokerResult<()> {
        handle.deactivate();
        let mut topics = self.topics.lock().expect("broker poisoned");
        if let Some(state) = topics.get_mut(&handle.topic) {
            state.plain.retain(|s| s.handle.id != handle.id);
            for group in state.groups.values_mut() {
                group.members.retain(|s| s.handle.id != handle.id);
            }
        }
        Ok(())
    }
}
