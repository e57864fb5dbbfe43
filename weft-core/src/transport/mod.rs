//! Transports: bidirectional message channels.
//!
//! A [`Transport`] can listen for inbound connections and dial outbound
//! ones. Sockets and listeners are scoped resources: `close` is idempotent
//! and dropping a socket releases it.
//!
//! Two wire variants ship with the toolkit: [`loopback`] (process-local
//! queues, for tests and single-process clusters) and [`tcp`]
//! (length-delimited frames carrying the envelope headers). [`stream`]
//! layers multiplexed logical streams over any socket.

pub mod loopback;
pub mod stream;
pub mod tcp;
mod wire;

pub use loopback::LoopbackTransport;
pub use stream::{StreamMux, StreamSocket};
pub use tcp::TcpTransport;
pub use wire::{decode_frame, encode_frame};

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::message::Message;

/// Options for an outbound connection.
#[derive(Debug, Clone)]
pub struct DialOptions {
    pub timeout: Duration,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
        }
    }
}

/// One end of an established connection.
#[async_trait]
pub trait Socket: Send + Sync + std::fmt::Debug {
    async fn send(&self, msg: Message) -> Result<()>;

    /// Receive the next message. Fails with ConnectionReset once the peer
    /// is gone and the queue is drained.
    async fn recv(&self) -> Result<Message>;

    /// Receive with a deadline. `Ok(None)` means the deadline passed.
    async fn recv_timeout(&self, timeout: Duration) -> Result<Option<Message>>;

    /// Close the socket. Idempotent.
    async fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;

    fn local_addr(&self) -> String;

    fn peer_addr(&self) -> String;
}

/// Accepts inbound connections.
#[async_trait]
pub trait Listener: Send + Sync + std::fmt::Debug {
    async fn accept(&self) -> Result<Box<dyn Socket>>;

    /// Accept with a deadline. `Ok(None)` means the deadline passed.
    async fn accept_timeout(&self, timeout: Duration) -> Result<Option<Box<dyn Socket>>> {
        match tokio::time::timeout(timeout, self.accept()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    fn local_addr(&self) -> String;

    async fn close(&self) -> Result<()>;
}

/// A transport binds listeners and dials peers.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>>;

    async fn dial(&self, addr: &str, opts: DialOptions) -> Result<Box<dyn Socket>>;
}
