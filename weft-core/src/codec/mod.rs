//! Codecs: reversible mappings between in-memory values and byte sequences
//! tagged by content-type.
//!
//! The trait is object-safe by working at the [`serde_json::Value`] level;
//! the free functions [`marshal`] and [`unmarshal`] add the typed layer on
//! top. A process-wide registry holds the known codecs and is populated with
//! JSON and plain-text defaults; register custom codecs before starting a
//! service.

mod selector;

pub use selector::CodecSelector;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use crate::error::{Error, Result};

pub const JSON: &str = "application/json";
pub const TEXT: &str = "text/plain";

/// A codec converts between byte bodies and values for one content type.
pub trait Codec: Send + Sync + std::fmt::Debug {
    fn content_type(&self) -> &'static str;

    fn encode_value(&self, value: &serde_json::Value) -> Result<Bytes>;

    fn decode_value(&self, bytes: &[u8]) -> Result<serde_json::Value>;
}

/// Marshal a typed value with the given codec.
pub fn marshal<T: Serialize>(codec: &dyn Codec, value: &T) -> Result<Bytes> {
    let value = serde_json::to_value(value)
        .map_err(|e| Error::Internal(format!("marshal failed: {e}")))?;
    codec.encode_value(&value)
}

/// Unmarshal a typed value with the given codec.
pub fn unmarshal<T: DeserializeOwned>(codec: &dyn Codec, bytes: &[u8]) -> Result<T> {
    let value = codec.decode_value(bytes)?;
    serde_json::from_value(value).map_err(|e| Error::Codec(format!("unmarshal failed: {e}")))
}

/// JSON codec, the default for every service.
#[derive(Debug)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn content_type(&self) -> &'static str {
        JSON
    }

    fn encode_value(&self, value: &serde_json::Value) -> Result<Bytes> {
        let buf = serde_json::to_vec(value).map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Bytes::from(buf))
    }

    fn decode_value(&self, bytes: &[u8]) -> Result<serde_json::Value> {
        if bytes.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_slice(bytes).map_err(|e| Error::Codec(format!("invalid JSON: {e}")))
    }
}

/// Plain-text codec. Values must be strings on encode; decode yields the
/// body as a string value.
#[derive(Debug)]
pub struct TextCodec;

impl Codec for TextCodec {
    fn content_type(&self) -> &'static str {
        TEXT
    }

    fn encode_value(&self, value: &serde_json::Value) -> Result<Bytes> {
        match value {
            serde_json::Value::String(s) => Ok(Bytes::from(s.clone().into_bytes())),
            serde_json::Value::Null => Ok(Bytes::new()),
            other => Ok(Bytes::from(other.to_string().into_bytes())),
        }
    }

    fn decode_value(&self, bytes: &[u8]) -> Result<serde_json::Value> {
        let s = std::str::from_utf8(bytes)
            .map_err(|e| Error::Codec(format!("invalid UTF-8: {e}")))?;
        Ok(serde_json::Value::String(s.to_string()))
    }
}

/// Strip parameters (`; charset=...`) and normalize case.
pub fn normalize_content_type(ct: &str) -> String {
    ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase()
}

type CodecMap = HashMap<String, Arc<dyn Codec>>;

fn registry() -> &'static RwLock<CodecMap> {
    static REGISTRY: OnceLock<RwLock<CodecMap>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(default_codecs()))
}

fn default_codecs() -> CodecMap {
    let mut map: CodecMap = HashMap::new();
    map.insert(JSON.to_string(), Arc::new(JsonCodec));
    map.insert(TEXT.to_string(), Arc::new(TextCodec));
    map
}

/// Register a codec in the process-wide registry. Call before starting
/// services; the registry is read-only during dispatch.
pub fn register_codec(codec: Arc<dyn Codec>) {
    let mut map = registry().write().expect("codec registry poisoned");
    map.insert(codec.content_type().to_string(), codec);
}

/// Look up a codec by content type (parameters are ignored).
pub fn lookup_codec(content_type: &str) -> Option<Arc<dyn Codec>> {
    let map = registry().read().expect("codec registry poisoned");
    map.get(&normalize_content_type(content_type)).cloned()
}

/// Reset the registry to the built-in defaults. Test hook.
pub fn reset_codecs() {
    let mut map = registry().write().expect("codec registry poisoned");
    *map = default_codecs();
}
