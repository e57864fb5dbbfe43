//! weft-events — pub/sub for the weft toolkit.
//!
//! The [`Broker`](weft_core::broker::Broker) trait lives in weft-core; this
//! crate ships the in-memory reference driver ([`MemoryBroker`]) and the
//! [`PubSub`] facade that pairs a broker with a default codec for typed
//! publish/subscribe.
//!
//! Delivery semantics are at-least-once. Subscribers without a queue group
//! each receive every event on their topic; subscribers sharing a queue
//! group split the stream so each event reaches exactly one member.

mod memory;
mod pubsub;

pub use memory::MemoryBroker;
pub use pubsub::{PubSub, Subscription};

pub use weft_core::broker::{
    Broker, BrokerError, BrokerResult, Event, EventHandler, SubscribeOptions, SubscriptionEntry,
    SubscriptionHandle,
};

pub mod prelude {
    pub use crate::{Broker, Event, MemoryBroker, PubSub, SubscribeOptions, Subscription};
}
