use bytes::Bytes;
use std::collections::HashMap;

use crate::error::Error;

/// Reserved envelope header names. On HTTP-like transports these travel as
/// real headers, on framed transports as key-value pairs in the frame.
pub mod header {
    pub const MESSAGE_ID: &str = "X-Message-Id";
    pub const MESSAGE_TYPE: &str = "X-Message-Type";
    pub const TARGET_SERVICE: &str = "X-Target-Service";
    pub const TARGET_ENDPOINT: &str = "X-Target-Endpoint";
    pub const REPLY_TO: &str = "X-Reply-To";
    pub const STATUS_CODE: &str = "X-Status-Code";
    pub const CONTENT_TYPE: &str = "Content-Type";
    pub const REQUEST_ID: &str = "X-Request-ID";
    pub const RESPONSE_TIME: &str = "X-Response-Time";
    pub const AUTHORIZATION: &str = "Authorization";
    pub const STREAM_ID: &str = "stream-id";
    pub const STREAM_CONTROL: &str = "stream-control";
    pub const STREAM_ERROR: &str = "stream-error";
}

/// The kind of a transport [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
    Event,
    Error,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Request => "Request",
            MessageKind::Response => "Response",
            MessageKind::Event => "Event",
            MessageKind::Error => "Error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Request" => Some(MessageKind::Request),
            "Response" => Some(MessageKind::Response),
            "Event" => Some(MessageKind::Event),
            "Error" => Some(MessageKind::Error),
            _ => None,
        }
    }
}

/// An order-preserving string multimap with case-insensitive lookup.
///
/// `get` returns the first value for a key, `get_all` every value in
/// insertion order. `set` replaces all existing values, `append` adds one.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replace all values for `name` with a single value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(&name));
        self.entries.push((name, value.into()));
    }

    /// Add a value without removing existing ones.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn extend(&mut self, other: &Headers) {
        for (k, v) in other.iter() {
            self.entries.push((k.to_string(), v.to_string()));
        }
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// The transport unit. Immutable after send: transports take messages by
/// value and never hand them back.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub kind: MessageKind,
    pub target: Option<String>,
    pub endpoint: Option<String>,
    pub reply_to: Option<String>,
    pub headers: Headers,
    pub body: Bytes,
}

impl Message {
    pub fn new(kind: MessageKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            target: None,
            endpoint: None,
            reply_to: None,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    pub fn request(service: impl Into<String>, endpoint: impl Into<String>, body: Bytes) -> Self {
        let mut msg = Self::new(MessageKind::Request);
        msg.target = Some(service.into());
        msg.endpoint = Some(endpoint.into());
        msg.body = body;
        msg
    }

    pub fn response(reply_to: impl Into<String>, status: u16, body: Bytes) -> Self {
        let mut msg = Self::new(MessageKind::Response);
        msg.reply_to = Some(reply_to.into());
        msg.headers.set(header::STATUS_CODE, status.to_string());
        msg.body = body;
        msg
    }

    pub fn event(topic: impl Into<String>, body: Bytes) -> Self {
        let mut msg = Self::new(MessageKind::Event);
        msg.target = Some(topic.into());
        msg.body = body;
        msg
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(header::CONTENT_TYPE)
    }

    /// The status code of a response message, if present and well-formed.
    pub fn status(&self) -> Option<u16> {
        self.headers
            .get(header::STATUS_CODE)
            .and_then(|v| v.parse().ok())
    }
}

/// Service-layer request: the decoded view of an inbound request message.
#[derive(Debug, Clone)]
pub struct Request {
    pub service: String,
    pub endpoint: String,
    pub content_type: String,
    pub headers: Headers,
    pub body: Bytes,
}

/// Response body: raw bytes pass through unchanged, values are marshaled by
/// the response codec on send.
#[derive(Debug, Clone)]
pub enum Body {
    Empty,
    Bytes(Bytes),
    Value(serde_json::Value),
}

impl Body {
    pub fn is_empty(&self) -> bool {
        matches!(self, Body::Empty)
    }
}

/// Service-layer response, filled in by middleware and the handler.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub headers: Headers,
    pub body: Body,
}

impl Response {
    pub fn new() -> Self {
        Self {
            status: 200,
            headers: Headers::new(),
            body: Body::Empty,
        }
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-RPC context. Owns exactly one request and one response plus an
/// attribute bag and an error slot; lives for the duration of one dispatch
/// and never escapes it.
pub struct Context {
    request: Request,
    response: Response,
    attributes: HashMap<String, serde_json::Value>,
    error: Option<Error>,
}

impl Context {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            response: Response::new(),
            attributes: HashMap::new(),
            error: None,
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut Request {
        &mut self.request
    }

    pub fn response(&self) -> &Response {
        &self.response
    }

    pub fn response_mut(&mut self) -> &mut Response {
        &mut self.response
    }

    pub fn set_attr(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.attributes.insert(key.into(), value);
    }

    pub fn attr(&self, key: &str) -> Option<&serde_json::Value> {
        self.attributes.get(key)
    }

    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(|v| v.as_str())
    }

    pub fn set_error(&mut self, error: Error) {
        self.error = Some(error);
    }

    /// Record a failure on the context. Middleware downstream of the error
    /// handler uses this instead of returning early.
    pub fn fail(&mut self, error: Error) {
        self.error = Some(error);
    }

    /// Snapshot the request and attributes so a response can still be
    /// produced if the in-flight context is lost to a panic or timeout.
    pub fn checkpoint(&self) -> ContextCheckpoint {
        ContextCheckpoint {
            request: self.request.clone(),
            attributes: self.attributes.clone(),
        }
    }

    pub fn take_error(&mut self) -> Option<Error> {
        self.error.take()
    }

    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// The request id placed by the RequestID middleware, if it has run.
    pub fn request_id(&self) -> Option<&str> {
        self.attr_str("request_id")
    }
}

/// A saved request + attribute snapshot; see [`Context::checkpoint`].
pub struct ContextCheckpoint {
    request: Request,
    attributes: HashMap<String, serde_json::Value>,
}

impl ContextCheckpoint {
    /// Rebuild a fresh context (empty response, no error) from the snapshot.
    pub fn restore(self) -> Context {
        Context {
            request: self.request,
            response: Response::new(),
            attributes: self.attributes,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_are_case_insensitive() {
        let mut h = Headers::new();
        h.set("Content-Type", "application/json");
        assert_eq!(h.get("content-type"), Some("application/json"));
        assert_eq!(h.get("CONTENT-TYPE"), Some("application/json"));
        assert!(h.get("accept").is_none());
    }

    #[test]
    fn headers_multi_value() {
        let mut h = Headers::new();
        h.append("Accept", "application/json");
        h.append("Accept", "text/plain");
        assert_eq!(h.get("accept"), Some("application/json"));
        let all: Vec<_> = h.get_all("Accept").collect();
        assert_eq!(all, vec!["application/json", "text/plain"]);
    }

    #[test]
    fn set_replaces_all_values() {
        let mut h = Headers::new();
        h.append("X-Tag", "a");
        h.append("X-Tag", "b");
        h.set("x-tag", "c");
        let all: Vec<_> = h.get_all("X-Tag").collect();
        assert_eq!(all, vec!["c"]);
    }

    #[test]
    fn message_kind_round_trip() {
        for kind in [
            MessageKind::Request,
            MessageKind::Response,
            MessageKind::Event,
            MessageKind::Error,
        ] {
            assert_eq!(MessageKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(MessageKind::parse("Bogus"), None);
    }

    #[test]
    fn request_message_carries_target() {
        let msg = Message::request("greeter", "/hello", Bytes::from_static(b"{}"));
        assert_eq!(msg.kind, MessageKind::Request);
        assert_eq!(msg.target.as_deref(), Some("greeter"));
        assert_eq!(msg.endpoint.as_deref(), Some("/hello"));
        assert!(!msg.id.is_empty());
    }

    #[test]
    fn response_message_status() {
        let msg = Message::response("abc", 204, Bytes::new());
        assert_eq!(msg.status(), Some(204));
        assert_eq!(msg.reply_to.as_deref(), Some("abc"));
    }

    #[test]
    fn context_attributes() {
        let req = Request {
            service: "s".into(),
            endpoint: "/e".into(),
            content_type: "application/json".into(),
            headers: Headers::new(),
            body: Bytes::new(),
        };
        let mut ctx = Context::new(req);
        ctx.set_attr("request_id", serde_json::json!("r-1"));
        assert_eq!(ctx.request_id(), Some("r-1"));
        assert!(ctx.error().is_none());
        ctx.set_error(Error::NotFound("x".into()));
        assert!(ctx.error().is_some());
        assert!(ctx.take_error().is_some());
        assert!(ctx.error().is_none());
    }
}
