//! weft-core — the runtime fabric of the weft microservice toolkit.
//!
//! Declare a service as a typed object with registered endpoints and event
//! subscriptions, and get back a process that listens on a transport,
//! advertises itself in a registry, dispatches RPCs through a middleware
//! chain with codec negotiation, and calls peers with pooling, retries, and
//! circuit breaking.
//!
//! ```ignore
//! use weft_core::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> weft_core::Result<()> {
//!     let service = Service::build("greeter")
//!         .version("1.0.0")
//!         .endpoint("/hello", "name", |name: String| async move {
//!             Ok(format!("Hello {name}!"))
//!         });
//!     weft_core::runtime::run(service).await
//! }
//! ```

pub mod breaker;
pub mod broker;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod message;
pub mod middleware;
pub mod pool;
pub mod registry;
pub mod runtime;
pub mod service;
pub mod transport;

pub use error::{Error, Result};

pub mod prelude {
    //! The most commonly used toolkit types.
    pub use crate::breaker::{BreakerConfig, BreakerState, CircuitBreaker};
    pub use crate::broker::{Broker, Event, SubscribeOptions};
    pub use crate::client::{CallOptions, Client, ClientConfig, RetryPolicy};
    pub use crate::codec::{Codec, CodecSelector, JsonCodec};
    pub use crate::error::{Error, Result};
    pub use crate::message::{Context, Headers, Message, MessageKind};
    pub use crate::middleware::{Chain, Entry, Next};
    pub use crate::pool::{ConnectionPool, PoolConfig};
    pub use crate::registry::{
        MemoryRegistry, Node, Registry, RoundRobinSelector, Selector, ServiceRecord,
    };
    pub use crate::runtime::run;
    pub use crate::service::{serve, EndpointOptions, RunningService, Service, ServiceOptions};
    pub use crate::transport::{LoopbackTransport, TcpTransport, Transport};
}
