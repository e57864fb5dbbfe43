//! TCP transport: one length-delimited frame per message.
//!
//! Frames carry the key-value envelope from [`super::wire`]. Each message is
//! a complete round-trip unit; request/response correlation happens at the
//! service layer via message ids.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::error::{Error, Result};
use crate::message::Message;

use super::{wire, DialOptions, Listener, Socket, Transport};

const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

/// Transport over plain TCP.
#[derive(Clone, Default)]
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Box::new(TcpMessageListener { inner: listener }))
    }

    async fn dial(&self, addr: &str, opts: DialOptions) -> Result<Box<dyn Socket>> {
        let stream = tokio::time::timeout(opts.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout(format!("dial {addr} timed out")))??;
        Ok(Box::new(TcpMessageSocket::new(stream)))
    }
}

#[derive(Debug)]
struct TcpMessageListener {
    inner: TcpListener,
}

#[async_trait]
impl Listener for TcpMessageListener {
    async fn accept(&self) -> Result<Box<dyn Socket>> {
        let (stream, _) = self.inner.accept().await?;
        Ok(Box::new(TcpMessageSocket::new(stream)))
    }

    fn local_addr(&self) -> String {
        self.inner
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default()
    }

    async fn close(&self) -> Result<()> {
        // The OS socket closes when the listener is dropped; accept loops
        // exit through their cancellation token.
        Ok(())
    }
}

pub struct TcpMessageSocket {
    reader: Mutex<FramedRead<OwnedReadHalf, LengthDelimitedCodec>>,
    writer: Mutex<FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>>,
    closed: AtomicBool,
    local: String,
    peer: String,
}

impl std::fmt::Debug for TcpMessageSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpMessageSocket")
            .field("local", &self.local)
            .field("peer", &self.peer)
            .field("closed", &self.closed)
            .finish()
    }
}

impl TcpMessageSocket {
    fn new(stream: TcpStream) -> Self {
        let local = stream
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: Mutex::new(FramedRead::new(read_half, frame_codec())),
            writer: Mutex::new(FramedWrite::new(write_half, frame_codec())),
            closed: AtomicBool::new(false),
            local,
            peer,
        }
    }
}

#[async_trait]
impl Socket for TcpMessageSocket {
    async fn send(&self, msg: Message) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionReset("socket closed".into()));
        }
        let frame = wire::encode_frame(&msg);
        let mut writer = self.writer.lock().await;
        writer.send(frame).await.map_err(Error::from)
    }

    async fn recv(&self) -> Result<Message> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionReset("socket closed".into()));
        }
        let mut reader = self.reader.lock().await;
        match reader.next().await {
            Some(Ok(frame)) => wire::decode_frame(frame.freeze()),
            Some(Err(e)) => Err(Error::from(e)),
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
            let mut writer = self.writer.lock().await;
            let _ = writer.close().await;
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
    async fn tcp_round_trip() {
        let transport = TcpTransport::new();
        let listener = transport.listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr();

        let server = tokio::spawn(async move {
            let socket = listener.accept().await.unwrap();
            let msg = socket.recv().await.unwrap();
            assert_eq!(msg.endpoint.as_deref(), Some("/ping"));
            socket
                .send(Message::response(msg.id.clone(), 200, Bytes::from_static(b"pong")))
                .await
                .unwrap();
        });

        let client = transport.dial(&addr, DialOptions::default()).await.unwrap();
        client
            .send(Message::request("echo", "/ping", Bytes::new()))
            .await
            .unwrap();
        let reply = client.recv().await.unwrap();
        assert_eq!(reply.status(), Some(200));
        assert_eq!(&reply.body[..], b"pong");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn dial_refused() {
        let transport = TcpTransport::new();
        // Port 1 is essentially never listening.
        let err = transport
            .dial("127.0.0.1:1", DialOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 503);
    }

    #[tokio::test]
    async fn peer_close_surfaces_reset() {
        let transport = TcpTransport::new();
        let listener = transport.listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr();

        let client = transport.dial(&addr, DialOptions::default()).await.unwrap();
        let server = listener.accept().await.unwrap();
        server.close().await.unwrap();

        let err = client.recv().await.unwrap_err();
        assert_eq!(err.kind(), "ConnectionReset");
    }
}
