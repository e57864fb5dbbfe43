//! Stream multiplexing over a single socket.
//!
//! Logical streams are keyed by the `stream-id` header; a demux task routes
//! inbound messages to per-stream queues. Control frames use
//! `stream-control` with values `close`, `close-send` and `error`:
//! `close` tears the stream down on both sides, `close-send` half-closes
//! (the sender promises no further messages), `error` delivers a failure
//! with the text from `stream-error`. Sends after close or close-send fail
//! with ConnectionReset.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};

use crate::error::{Error, Result};
use crate::message::{header, Message};

use super::Socket;

const STREAM_QUEUE_DEPTH: usize = 64;

struct MuxInner {
    socket: Arc<dyn Socket>,
    streams: DashMap<String, mpsc::Sender<Message>>,
    closed: AtomicBool,
}

impl MuxInner {
    async fn send_control(&self, stream_id: &str, control: &str, error: Option<&str>) {
        let mut msg = Message::new(crate::message::MessageKind::Request);
        msg.headers.set(header::STREAM_ID, stream_id);
        msg.headers.set(header::STREAM_CONTROL, control);
        if let Some(text) = error {
            msg.headers.set(header::STREAM_ERROR, text);
        }
        let _ = self.socket.send(msg).await;
    }
}

/// Multiplexes independent logical streams over one socket.
pub struct StreamMux {
    inner: Arc<MuxInner>,
    incoming: Mutex<mpsc::Receiver<StreamSocket>>,
    demux: tokio::task::JoinHandle<()>,
}

impl StreamMux {
    /// Take ownership of a socket and start the demux task.
    pub fn new(socket: Box<dyn Socket>) -> Self {
        let inner = Arc::new(MuxInner {
            socket: Arc::from(socket),
            streams: DashMap::new(),
            closed: AtomicBool::new(false),
        });
        let (incoming_tx, incoming_rx) = mpsc::channel(STREAM_QUEUE_DEPTH);
        let demux = tokio::spawn(demux_loop(inner.clone(), incoming_tx));
        Self {
            inner,
            incoming: Mutex::new(incoming_rx),
            demux,
        }
    }

    /// Open a new outbound stream.
    pub fn open(&self) -> Result<StreamSocket> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionReset("mux closed".into()));
        }
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(STREAM_QUEUE_DEPTH);
        self.inner.streams.insert(id.clone(), tx);
        Ok(StreamSocket::new(id, self.inner.clone(), rx))
    }

    /// Wait for the peer to open a stream.
    pub async fn accept(&self) -> Result<StreamSocket> {
        let mut incoming = self.incoming.lock().await;
        incoming
            .recv()
            .await
            .ok_or_else(|| Error::ConnectionReset("mux closed".into()))
    }

    /// Close the mux and the underlying socket.
    pub async fn close(&self) -> Result<()> {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            self.inner.streams.clear();
            self.inner.socket.close().await?;
            self.demux.abort();
        }
        Ok(())
    }
}

async fn demux_loop(inner: Arc<MuxInner>, incoming_tx: mpsc::Sender<StreamSocket>) {
    loop {
        let msg = match inner.socket.recv().await {
            Ok(msg) => msg,
            Err(_) => break,
        };
        let stream_id = match msg.headers.get(header::STREAM_ID) {
            Some(id) => id.to_string(),
            // Not a stream frame; nothing to route it to.
            None => continue,
        };
        match msg.headers.get(header::STREAM_CONTROL) {
            Some("close") | Some("close-send") => {
                // Dropping the sender ends the stream's receive side after
                // the queue drains.
                inner.streams.remove(&stream_id);
            }
            Some("error") => {
                if let Some((_, tx)) = inner.streams.remove(&stream_id) {
                    let _ = tx.send(msg).await;
                }
            }
            _ => {
                let existing = inner.streams.get(&stream_id).map(|e| e.value().clone());
                match existing {
                    Some(tx) => {
                        let _ = tx.send(msg).await;
                    }
                    None => {
                        let (tx, rx) = mpsc::channel(STREAM_QUEUE_DEPTH);
                        let _ = tx.send(msg).await;
                        inner.streams.insert(stream_id.clone(), tx);
                        let stream = StreamSocket::new(stream_id, inner.clone(), rx);
                        if incoming_tx.send(stream).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
    inner.closed.store(true, Ordering::SeqCst);
    inner.streams.clear();
}

/// One logical stream within a [`StreamMux`].
pub struct StreamSocket {
    id: String,
    mux: Arc<MuxInner>,
    rx: Mutex<mpsc::Receiver<Message>>,
    send_closed: AtomicBool,
    closed: AtomicBool,
}

impl StreamSocket {
    fn new(id: String, mux: Arc<MuxInner>, rx: mpsc::Receiver<Message>) -> Self {
        Self {
            id,
            mux,
            rx: Mutex::new(rx),
            send_closed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn send(&self, mut msg: Message) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) || self.send_closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionReset("stream send side closed".into()));
        }
        msg.headers.set(header::STREAM_ID, self.id.clone());
        self.mux.socket.send(msg).await
    }

    /// Receive the next message. `Ok(None)` means the peer closed the
    /// stream cleanly (close or close-send).
    pub async fn recv(&self) -> Result<Option<Message>> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(msg) => {
                if msg.headers.get(header::STREAM_CONTROL) == Some("error") {
                    let text = msg
                        .headers
                        .get(header::STREAM_ERROR)
                        .unwrap_or("stream error")
                        .to_string();
                    self.closed.store(true, Ordering::SeqCst);
                    return Err(Error::Internal(text));
                }
                Ok(Some(msg))
            }
            None => Ok(None),
        }
    }

    pub async fn recv_timeout(&self, timeout: Duration) -> Result<Option<Message>> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout("stream receive timed out".into())),
        }
    }

    /// Half-close: no further sends from this side.
    pub async fn close_send(&self) -> Result<()> {
        if !self.send_closed.swap(true, Ordering::SeqCst) {
            self.mux.send_control(&self.id, "close-send", None).await;
        }
        Ok(())
    }

    /// Close the stream in both directions and tear down local queues.
    pub async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.send_closed.store(true, Ordering::SeqCst);
            self.mux.send_control(&self.id, "close", None).await;
            self.mux.streams.remove(&self.id);
        }
        Ok(())
    }

    /// Abort the stream with an error message delivered to the peer.
    pub async fn abort(&self, reason: &str) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.send_closed.store(true, Ordering::SeqCst);
            self.mux.send_control(&self.id, "error", Some(reason)).await;
            self.mux.streams.remove(&self.id);
        }
        Ok(())
    }
}
