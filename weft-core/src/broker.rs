//! Broker boundary for pub/sub.
//!
//! The [`Broker`] trait is what concrete drivers implement; the toolkit
//! ships an in-memory reference driver in the events crate. Delivery is
//! at-least-once: handler failures are retried a bounded number of times
//! with a fixed backoff, decode failures are not retried, and idempotency
//! is left to the application.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::codec::{self, Codec};
use crate::error::{Error, Result};
use crate::message::Headers;

/// Errors from broker operations.
#[derive(Debug)]
pub enum BrokerError {
    /// The broker connection is not established.
    NotConnected,
    /// The broker rejected or failed a publish.
    Publish(String),
    /// The broker rejected or failed a subscribe.
    Subscribe(String),
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerError::NotConnected => write!(f, "broker not connected"),
            BrokerError::Publish(msg) => write!(f, "publish failed: {msg}"),
            BrokerError::Subscribe(msg) => write!(f, "subscribe failed: {msg}"),
        }
    }
}

impl std::error::Error for BrokerError {}

impl From<BrokerError> for Error {
    fn from(err: BrokerError) -> Self {
        Error::ServiceUnavailable(err.to_string())
    }
}

pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

/// A published unit: opaque payload bytes plus headers and a timestamp.
#[derive(Debug, Clone)]
pub struct Event {
    pub id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub data: Bytes,
    pub headers: Headers,
}

impl Event {
    pub fn new(data: Bytes) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now(),
            data,
            headers: Headers::new(),
        }
    }

    /// Marshal a typed payload and stamp the codec's content type.
    pub fn from_payload<T: Serialize>(payload: &T, codec: &dyn Codec) -> Result<Self> {
        let data = codec::marshal(codec, payload)?;
        let mut event = Self::new(data);
        event
            .headers
            .set("Content-Type", codec.content_type().to_string());
        Ok(event)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("Content-Type")
    }

    /// Decode the payload. Lazy: nothing is parsed until this is called.
    pub fn to<T: DeserializeOwned>(&self, codec: &dyn Codec) -> Result<T> {
        codec::unmarshal(codec, &self.data)
    }

    /// Decode using the codec named by the event's own content type,
    /// falling back to the given default.
    pub fn decode<T: DeserializeOwned>(&self, default_content_type: &str) -> Result<T> {
        let ct = self.content_type().unwrap_or(default_content_type);
        let codec = codec::lookup_codec(ct)
            .ok_or_else(|| Error::Codec(format!("no codec for event content type {ct}")))?;
        self.to(codec.as_ref())
    }
}

/// A live subscription as seen by the application. `active` flips off when
/// the broker drops the subscription or disconnects; reconnecting does not
/// resurrect it.
#[derive(Clone, Debug)]
pub struct SubscriptionHandle {
    pub id: String,
    pub topic: String,
    pub queue_group: Option<String>,
    active: Arc<AtomicBool>,
}

impl SubscriptionHandle {
    pub fn new(topic: impl Into<String>, queue_group: Option<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            topic: topic.into(),
            queue_group,
            active: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

/// Handler invoked for each delivered event.
pub type EventHandler =
    Arc<dyn Fn(Event) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Broker driver boundary.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self) -> BrokerResult<()>;

    /// Disconnect and deactivate every subscription.
    async fn disconnect(&self) -> BrokerResult<()>;

    fn is_connected(&self) -> bool;

    async fn publish(&self, topic: &str, event: Event) -> BrokerResult<()>;

    async fn subscribe(
        &self,
        topic: &str,
        queue_group: Option<&str>,
        handler: EventHandler,
    ) -> BrokerResult<SubscriptionHandle>;

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> BrokerResult<()>;
}

/// Per-subscription delivery behavior.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub auto_ack: bool,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff: Duration::from_secs(1),
            auto_ack: true,
        }
    }
}

/// A declarative subscription registration owned by a service.
#[derive(Clone)]
pub struct SubscriptionEntry {
    pub topic: String,
    pub queue_group: Option<String>,
    pub options: SubscribeOptions,
    pub handler: EventHandler,
}

/// Wrap a handler with the retry policy: handler failures are retried up to
/// `max_retries` with a fixed backoff, codec failures abandon the event
/// immediately.
pub fn with_retry(entry: &SubscriptionEntry) -> EventHandler {
    let handler = entry.handler.clone();
    let topic = entry.topic.clone();
    let options = entry.options.clone();
    Arc::new(move |event: Event| {
        let handler = handler.clone();
        let topic = topic.clone();
        let options = options.clone();
        Box::pin(async move {
            let mut attempt = 0u32;
            loop {
                match handler(event.clone()).await {
                    Ok(()) => return Ok(()),
                    Err(Error::Codec(msg)) => {
                        warn!(target: "weft::events", %topic, event_id = %event.id, error = %msg, "event decode failed, dropping");
                        return Err(Error::Codec(msg));
                    }
                    Err(e) if attempt < options.max_retries => {
                        attempt += 1;
                        warn!(
                            target: "weft::events",
                            %topic,
                            event_id = %event.id,
                            attempt,
                            error = %e,
                            "event handler failed, retrying"
                        );
                        tokio::time::sleep(options.retry_backoff).await;
                    }
                    Err(e) => {
                        warn!(
                            target: "weft::events",
                            %topic,
                            event_id = %event.id,
                            error = %e,
                            "event abandoned after retries"
                        );
                        return Err(e);
                    }
                }
            }
        })
    })
}
