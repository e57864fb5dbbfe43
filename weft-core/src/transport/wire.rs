//! Frame encoding for framed transports.
//!
//! A frame is a key-value header block followed by the body: `u16` header
//! count, then each header as `u16`-length-prefixed key and value, then the
//! remaining bytes as the body. Envelope fields travel as the reserved
//! `X-Message-*` headers so the same layout works over HTTP-shaped
//! transports.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::message::{header, Headers, Message, MessageKind};

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn get_str(buf: &mut Bytes) -> Result<String> {
    if buf.remaining() < 2 {
        return Err(Error::Codec("truncated frame: missing length".into()));
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(Error::Codec("truncated frame: short string".into()));
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|e| Error::Codec(format!("invalid frame UTF-8: {e}")))
}

/// Serialize a message into a single frame payload.
pub fn encode_frame(msg: &Message) -> Bytes {
    let mut envelope: Vec<(&str, &str)> = vec![
        (header::MESSAGE_ID, msg.id.as_str()),
        (header::MESSAGE_TYPE, msg.kind.as_str()),
    ];
    if let Some(target) = &msg.target {
        envelope.push((header::TARGET_SERVICE, target));
    }
    if let Some(endpoint) = &msg.endpoint {
        envelope.push((header::TARGET_ENDPOINT, endpoint));
    }
    if let Some(reply_to) = &msg.reply_to {
        envelope.push((header::REPLY_TO, reply_to));
    }

    let count = envelope.len() + msg.headers.len();
    let mut buf = BytesMut::with_capacity(64 + msg.body.len());
    buf.put_u16(count as u16);
    for (k, v) in envelope {
        put_str(&mut buf, k);
        put_str(&mut buf, v);
    }
    for (k, v) in msg.headers.iter() {
        put_str(&mut buf, k);
        put_str(&mut buf, v);
    }
    buf.put_slice(&msg.body);
    buf.freeze()
}

/// Parse a frame payload back into a message. Envelope headers are lifted
/// into the message fields; application headers stay in the header map.
pub fn decode_frame(mut frame: Bytes) -> Result<Message> {
    if frame.remaining() < 2 {
        return Err(Error::Codec("truncated frame: missing header count".into()));
    }
    let count = frame.get_u16() as usize;

    let mut id = None;
    let mut kind = None;
    let mut target = None;
    let mut endpoint = None;
    let mut reply_to = None;
    let mut headers = Headers::new();

    for _ in 0..count {
        let key = get_str(&mut frame)?;
        let value = get_str(&mut frame)?;
        if key.eq_ignore_ascii_case(header::MESSAGE_ID) {
            id = Some(value);
        } else if key.eq_ignore_ascii_case(header::MESSAGE_TYPE) {
            kind = MessageKind::parse(&value);
        } else if key.eq_ignore_ascii_case(header::TARGET_SERVICE) {
            target = Some(value);
        } else if key.eq_ignore_ascii_case(header::TARGET_ENDPOINT) {
            endpoint = Some(value);
        } else if key.eq_ignore_ascii_case(header::REPLY_TO) {
            reply_to = Some(value);
        } else {
            headers.append(key, value);
        }
    }

    Ok(Message {
        id: id.ok_or_else(|| Error::Codec("frame missing message id".into()))?,
        kind: kind.ok_or_else(|| Error::Codec("frame missing message type".into()))?,
        target,
        endpoint,
        reply_to,
        headers,
        body: frame,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_request() {
        let mut msg = Message::request("greeter", "/hello", Bytes::from_static(b"{\"a\":1}"));
        msg.headers.set("Content-Type", "application/json");
        msg.headers.append("X-Custom", "one");
        msg.headers.append("X-Custom", "two");

        let decoded = decode_frame(encode_frame(&msg)).unwrap();
        assert_eq!(decoded.id, msg.id);
        assert_eq!(decoded.kind, MessageKind::Request);
        assert_eq!(decoded.target.as_deref(), Some("greeter"));
        assert_eq!(decoded.endpoint.as_deref(), Some("/hello"));
        assert_eq!(decoded.content_type(), Some("application/json"));
        let custom: Vec<_> = decoded.headers.get_all("X-Custom").collect();
        assert_eq!(custom, vec!["one", "two"]);
        assert_eq!(&decoded.body[..], b"{\"a\":1}");
    }

    #[test]
    fn round_trip_response() {
        let msg = Message::response("req-1", 404, Bytes::from_static(b"{}"));
        let decoded = decode_frame(encode_frame(&msg)).unwrap();
        assert_eq!(decoded.kind, MessageKind::Response);
        assert_eq!(decoded.reply_to.as_deref(), Some("req-1"));
        assert_eq!(decoded.status(), Some(404));
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let msg = Message::request("s", "/e", Bytes::new());
        let frame = encode_frame(&msg);
        let err = decode_frame(frame.slice(0..5)).unwrap_err();
        assert_eq!(err.kind(), "Codec");
    }

    #[test]
    fn empty_body_round_trip() {
        let msg = Message::request("s", "/e", Bytes::new());
        let decoded = decode_frame(encode_frame(&msg)).unwrap();
        assert!(decoded.body.is_empty());
    }
}
