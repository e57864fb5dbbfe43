//! weft — a batteries-included microservice toolkit.
//!
//! Declare a service as a typed object with registered endpoints and event
//! subscribers; get back a process that listens on a transport, advertises
//! itself in a registry, dispatches RPCs through a middleware chain with
//! codec negotiation, calls peers with retries, circuit breaking and
//! connection pooling, speaks pub/sub over a broker, and can be fronted by
//! an HTTP gateway.
//!
//! This facade crate re-exports the sub-crates behind feature flags:
//!
//! | Feature    | Default | Crate           |
//! |------------|---------|-----------------|
//! | `events`   | **yes** | `weft-events`   |
//! | `security` | **yes** | `weft-security` |
//! | `gateway`  | no      | `weft-gateway`  |
//! | `full`     | no      | All of the above |
//!
//! ```ignore
//! use weft::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> weft::Result<()> {
//!     let service = Service::build("greeter")
//!         .version("1.0.0")
//!         .endpoint("/hello", "name", |name: String| async move {
//!             Ok(format!("Hello {name}!"))
//!         });
//!     weft::run(service).await
//! }
//! ```

pub extern crate weft_core;

// Re-export everything from weft-core at the top level for convenience.
pub use weft_core::*;

#[cfg(feature = "events")]
pub use weft_events;

#[cfg(feature = "security")]
pub use weft_security;

#[cfg(feature = "gateway")]
pub use weft_gateway;

pub use weft_core::runtime::run;

pub mod prelude {
    pub use weft_core::prelude::*;

    #[cfg(feature = "events")]
    pub use weft_events::prelude::*;

    #[cfg(feature = "security")]
    pub use weft_security::prelude::*;

    #[cfg(feature = "gateway")]
    pub use weft_gateway::prelude::*;
}
