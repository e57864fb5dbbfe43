//! The PubSub facade: a broker plus a default codec.

use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use weft_core::broker::{
    with_retry, Broker, Event, EventHandler, SubscribeOptions, SubscriptionEntry,
    SubscriptionHandle,
};
use weft_core::codec::{Codec, JsonCodec};
use weft_core::error::Result;

/// A live subscription bound to the facade's broker.
pub struct Subscription {
    handle: SubscriptionHandle,
    broker: Arc<dyn Broker>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.handle.topic
    }

    pub fn queue_group(&self) -> Option<&str> {
        self.handle.queue_group.as_deref()
    }

    /// Whether the broker still holds this subscription.
    pub fn is_active(&self) -> bool {
        self.handle.is_active()
    }

    pub async fn unsubscribe(self) -> Result<()> {
        self.broker.unsubscribe(&self.handle).await?;
        Ok(())
    }
}

/// Typed publish/subscribe over any [`Broker`].
#[derive(Clone)]
pub struct PubSub {
    broker: Arc<dyn Broker>,
    codec: Arc<dyn Codec>,
}

impl PubSub {
    /// A facade with the JSON codec.
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self::with_codec(broker, Arc::new(JsonCodec))
    }

    pub fn with_codec(broker: Arc<dyn Broker>, codec: Arc<dyn Codec>) -> Self {
        Self { broker, codec }
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Marshal a payload with the default codec and publish it.
    pub async fn publish<T: Serialize>(&self, topic: &str, payload: &T) -> Result<()> {
        let event = Event::from_payload(payload, self.codec.as_ref())?;
        self.broker.publish(topic, event).await?;
        Ok(())
    }

    /// Publish an already-built event.
    pub async fn publish_event(&self, topic: &str, event: Event) -> Result<()> {
        self.broker.publish(topic, event).await?;
        Ok(())
    }

    /// Subscribe a typed handler; every subscriber sees every event.
    pub async fn subscribe<T, F, Fut>(&self, topic: &str, handler: F) -> Result<Subscription>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.subscribe_with::<T, F, Fut>(topic, None, SubscribeOptions::default(), handler)
            .await
    }

    /// Subscribe within a queue group: each event reaches exactly one
    /// member of the group.
    pub async fn subscribe_queue<T, F, Fut>(
        &self,
        topic: &str,
        queue_group: &str,
        handler: F,
    ) -> Result<Subscription>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.subscribe_with::<T, F, Fut>(
            topic,
            Some(queue_group.to_string()),
            SubscribeOptions::default(),
            handler,
        )
        .await
    }

    /// Subscribe with explicit delivery options.
    pub async fn subscribe_with<T, F, Fut>(
        &self,
        topic: &str,
        queue_group: Option<String>,
        options: SubscribeOptions,
        handler: F,
    ) -> Result<Subscription>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let default_ct = self.codec.content_type().to_string();
        let typed: EventHandler = Arc::new(move |event: Event| {
            let handler = handler.clone();
            let default_ct = default_ct.clone();
            Box::pin(async move {
                let payload: T = event.decode(&default_ct)?;
                handler(payload).await
            })
        });

        let entry = SubscriptionEntry {
            topic: topic.to_string(),
            queue_group: queue_group.clone(),
            options,
            handler: typed,
        };
        let handle = self
            .broker
            .subscribe(topic, queue_group.as_deref(), with_retry(&entry))
            .await?;
        Ok(Subscription {
            handle,
            broker: self.broker.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryBroker;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Ping {
        seq: u32,
    }

    async fn facade() -> PubSub {
        let broker = Arc::new(MemoryBroker::new());
        broker.connect().await.unwrap();
        PubSub::new(broker)
    }

    #[tokio::test]
    async fn typed_round_trip() {
        let pubsub = facade().await;
        let seen = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sub = pubsub
            .subscribe("pings", move |ping: Ping| {
                let sink = sink.clone();
                async move {
                    sink.lock().await.push(ping);
                    Ok(())
                }
            })
            .await
            .unwrap();
        assert!(sub.is_active());

        pubsub.publish("pings", &Ping { seq: 7 }).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(*seen.lock().await, vec![Ping { seq: 7 }]);
    }

    #[tokio::test]
    async fn decode_failures_do_not_retry() {
        let pubsub = facade().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        pubsub
            .subscribe("bad", move |_: Ping| {
                seen.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await
            .unwrap();

        // A string payload does not decode into Ping.
        pubsub.publish("bad", &"not a ping").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn handler_failures_are_retried() {
        let pubsub = facade().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        pubsub
            .subscribe_with(
                "flaky",
                None,
                SubscribeOptions {
                    max_retries: 2,
                    retry_backoff: Duration::from_millis(5),
                    auto_ack: true,
                },
                move |_: Ping| {
                    let seen = seen.clone();
                    async move {
                        seen.fetch_add(1, Ordering::SeqCst);
                        Err(weft_core::Error::Internal("nope".into()))
                    }
                },
            )
            .await
            .unwrap();

        pubsub.publish("flaky", &Ping { seq: 1 }).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        // Initial attempt + 2 retries.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unsubscribe_marks_inactive() {
        let pubsub = facade().await;
        let sub = pubsub
            .subscribe("t", |_: Ping| async { Ok(()) })
            .await
            .unwrap();
        assert!(sub.is_active());
        sub.unsubscribe().await.unwrap();
    }

    #[tokio::test]
    async fn publish_disconnected_is_error() {
        let broker = Arc::new(MemoryBroker::new());
        let pubsub = PubSub::new(broker);
        let err = pubsub.publish("t", &Ping { seq: 0 }).await.unwrap_err();
        assert_eq!(err.status_code(), 503);
    }
}
