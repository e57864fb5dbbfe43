//! Process-local transport backed by bounded channel pairs.
//!
//! Listeners register on a process-wide address bus; dialing an address
//! hands the listener one end of a fresh socket pair. No bytes are copied,
//! messages move through the queues as-is. The bus is a test seam:
//! [`reset_bus`] clears all registrations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::error::{Error, Result};
use crate::message::Message;

use super::{DialOptions, Listener, Socket, Transport};

const QUEUE_DEPTH: usize = 64;

type AcceptTx = mpsc::Sender<LoopbackSocket>;

fn bus() -> &'static StdMutex<HashMap<String, AcceptTx>> {
    static BUS: OnceLock<StdMutex<HashMap<String, AcceptTx>>> = OnceLock::new();
    BUS.get_or_init(|| StdMutex::new(HashMap::new()))
}

/// Remove every registered listener address. Test hook.
pub fn reset_bus() {
    bus().lock().expect("loopback bus poisoned").clear();
}

static CONN_SEQ: AtomicU64 = AtomicU64::new(0);

/// The in-process transport.
#[derive(Clone, Default)]
pub struct LoopbackTransport;

impl LoopbackTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>> {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        {
            let mut map = bus().lock().expect("loopback bus poisoned");
            if map.contains_key(addr) {
                return Err(Error::Conflict(format!("address already bound: {addr}")));
            }
            map.insert(addr.to_string(), tx);
        }
        Ok(Box::new(LoopbackListener {
            addr: addr.to_string(),
            accept_rx: Mutex::new(rx),
            closed: AtomicBool::new(false),
        }))
    }

    async fn dial(&self, addr: &str, _opts: DialOptions) -> Result<Box<dyn Socket>> {
        let accept_tx = {
            let map = bus().lock().expect("loopback bus poisoned");
            map.get(addr).cloned()
        }
        .ok_or_else(|| Error::ConnectionRefused(format!("no listener at {addr}")))?;

        let conn = CONN_SEQ.fetch_add(1, Ordering::Relaxed);
        let client_addr = format!("loopback:{conn}");
        let (client, server) = socket_pair(client_addr, addr.to_string());
        accept_tx
            .send(server)
            .await
            .map_err(|_| Error::ConnectionRefused(format!("listener at {addr} is gone")))?;
        Ok(Box::new(client))
    }
}

fn socket_pair(client_addr: String, server_addr: String) -> (LoopbackSocket, LoopbackSocket) {
    let (a_tx, a_rx) = mpsc::channel(QUEUE_DEPTH);
    let (b_tx, b_rx) = mpsc::channel(QUEUE_DEPTH);
    let client = LoopbackSocket {
        tx: StdMutex::new(Some(a_tx)),
        rx: Mutex::new(b_rx),
        closed: Arc::new(AtomicBool::new(false)),
        local: client_addr.clone(),
        peer: server_addr.clone(),
    };
    let server = LoopbackSocket {
        tx: StdMutex::new(Some(b_tx)),
        rx: Mutex::new(a_rx),
        closed: Arc::new(AtomicBool::new(false)),
        local: server_addr,
        peer: client_addr,
    };
    (client, server)
}

struct LoopbackListener {
    addr: String,
    accept_rx: Mutex<mpsc::Receiver<LoopbackSocket>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for LoopbackListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackListener")
            .field("addr", &self.addr)
            .field("closed", &self.closed)
            .finish()
    }
}

#[async_trait]
impl Listener for LoopbackListener {
    async fn accept(&self) -> Result<Box<dyn Socket>> {
        let mut rx = self.accept_rx.lock().await;
        match rx.recv().await {
            Some(socket) => Ok(Box::new(socket)),
            None => Err(Error::ConnectionReset("listener closed".into())),
        }
    }

    fn local_addr(&self) -> String {
        self.addr.clone()
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            bus()
                .lock()
                .expect("loopback bus poisoned")
                .remove(&self.addr);
            self.accept_rx.lock().await.close();
        }
        Ok(())
    }
}

impl Drop for LoopbackListener {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            bus()
                .lock()
                .expect("loopback bus poisoned")
                .remove(&self.addr);
        }
    }
}

pub struct LoopbackSocket {
    tx: StdMutex<Option<mpsc::Sender<Message>>>,
    rx: Mutex<mpsc::Receiver<Message>>,
    closed: Arc<AtomicBool>,
    local: String,
    peer: String,
}

impl std::fmt::Debug for LoopbackSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackSocket")
            .field("local", &self.local)
            .field("peer", &self.peer)
            .field("closed", &self.closed)
            .finish()
    }
}

#[async_trait]
impl Socket for LoopbackSocket {
    async fn send(&self, msg: Message) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionReset("socket closed".into()));
        }
        let tx = {
            let guard = self.tx.lock().expect("loopback socket poisoned");
            guard.clone()
        }
        .ok_or_else(|| Error::ConnectionReset("socket closed".into()))?;
        tx.send(msg)
            .await
            .map_err(|_| Error::ConnectionReset("peer closed".into()))
    }

    async fn recv(&self) -> Result<Message> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(msg) => Ok(msg),
            None => Err(Error::ConnectionReset("peer closed".into())),
        }
    }

    async fn recv_timeout(&self, timeout: Duration) -> Result<Option<Message>> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.tx.lock().expect("loopback socket poisoned").take();
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn local_addr(&self) -> String {
        self.local.clone()
    }

    fn peer_addr(&self) -> String {
        self.peer.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    #[serial_test::serial]
    async fn dial_and_exchange() {
        reset_bus();
        let transport = LoopbackTransport::new();
        let listener = transport.listen("echo.local").await.unwrap();

        let client = transport
            .dial("echo.local", DialOptions::default())
            .await
            .unwrap();
        let server = listener.accept().await.unwrap();

        client
            .send(Message::request("echo", "/ping", Bytes::from_static(b"hi")))
            .await
            .unwrap();
        let received = server.recv().await.unwrap();
        assert_eq!(&received.body[..], b"hi");

        server
            .send(Message::response(received.id.clone(), 200, Bytes::new()))
            .await
            .unwrap();
        let reply = client.recv().await.unwrap();
        assert_eq!(reply.status(), Some(200));
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn dial_unknown_address_refused() {
        reset_bus();
        let transport = LoopbackTransport::new();
        let err = transport
            .dial("nowhere.local", DialOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ConnectionRefused");
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn double_bind_conflicts() {
        reset_bus();
        let transport = LoopbackTransport::new();
        let _listener = transport.listen("twice.local").await.unwrap();
        let err = transport.listen("twice.local").await.unwrap_err();
        assert_eq!(err.kind(), "Conflict");
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn close_is_idempotent_and_resets_peer() {
        reset_bus();
        let transport = LoopbackTransport::new();
        let listener = transport.listen("close.local").await.unwrap();
        let client = transport
            .dial("close.local", DialOptions::default())
            .await
            .unwrap();
        let server = listener.accept().await.unwrap();

        client.close().await.unwrap();
        client.close().await.unwrap();
        assert!(client.is_closed());

        let err = server.recv().await.unwrap_err();
        assert_eq!(err.kind(), "ConnectionReset");
        let err = client
            .send(Message::request("x", "/y", Bytes::new()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ConnectionReset");
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn recv_timeout_returns_none() {
        reset_bus();
        let transport = LoopbackTransport::new();
        let listener = transport.listen("slow.local").await.unwrap();
        let client = transport
            .dial("slow.local", DialOptions::default())
            .await
            .unwrap();
        let _server = listener.accept().await.unwrap();

        let got = client
            .recv_timeout(Duration::from_millis(20))
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn dropped_listener_frees_address() {
        reset_bus();
        let transport = LoopbackTransport::new();
        {
            let _listener = transport.listen("temp.local").await.unwrap();
        }
        // Address can be bound again after the listener is dropped.
        let _listener = transport.listen("temp.local").await.unwrap();
    }
}
