use std::io::Write;

use bytes::Bytes;
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;

use crate::message::Body;
use crate::middleware::{Entry, PRIORITY_COMPRESSION};

const COMPRESSIBLE_PREFIXES: &[&str] = &["text/"];
const COMPRESSIBLE_TYPES: &[&str] = &[
    "application/json",
    "application/javascript",
    "application/xml",
    "application/xhtml+xml",
];

#[derive(Debug, Clone)]
pub struct CompressionConfig {
    pub min_size: usize,
    pub level: u32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            min_size: 1024,
            level: 6,
        }
    }
}

fn is_compressible(content_type: &str) -> bool {
    let normalized = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    COMPRESSIBLE_PREFIXES
        .iter()
        .any(|p| normalized.starts_with(p))
        || COMPRESSIBLE_TYPES.contains(&normalized.as_str())
}

fn pick_encoding(accept_encoding: &str) -> Option<&'static str> {
    let mut gzip = false;
    let mut deflate = false;
    for token in accept_encoding.split(',') {
        let name = token.split(';').next().unwrap_or("").trim();
        if name.eq_ignore_ascii_case("gzip") {
            gzip = true;
        } else if name.eq_ignore_ascii_case("deflate") {
            deflate = true;
        }
    }
    if gzip {
        Some("gzip")
    } else if deflate {
        Some("deflate")
    } else {
        None
    }
}

fn compress(bytes: &[u8], encoding: &str, level: u32) -> std::io::Result<Vec<u8>> {
    let compression = Compression::new(level);
    if encoding == "gzip" {
        let mut encoder = GzEncoder::new(Vec::new(), compression);
        encoder.write_all(bytes)?;
        encoder.finish()
    } else {
        let mut encoder = ZlibEncoder::new(Vec::new(), compression);
        encoder.write_all(bytes)?;
        encoder.finish()
    }
}

/// Compresses response bodies when the client accepts gzip or deflate, the
/// content type is text-ish, the body is at least `min_size` bytes, and no
/// Content-Encoding is already set.
pub fn compression(config: CompressionConfig) -> Entry {
    Entry::new("compression", PRIORITY_COMPRESSION, move |ctx, next| {
        let config = config.clone();
        Box::pin(async move {
            let encoding = ctx
                .request()
                .headers
                .get("Accept-Encoding")
                .and_then(pick_encoding);

            let mut ctx = next.run(ctx).await;

            let Some(encoding) = encoding else {
                return ctx;
            };
            let response = ctx.response_mut();
            if response.headers.contains("Content-Encoding") {
                return ctx;
            }
            let compressible = response
                .headers
                .get("Content-Type")
                .map(is_compressible)
                .unwrap_or(false);
            if !compressible {
                return ctx;
            }
            let Body::Bytes(bytes) = &response.body else {
                return ctx;
            };
            if bytes.len() < config.min_size {
                return ctx;
            }

            if let Ok(compressed) = compress(bytes, encoding, config.level) {
                response.body = Body::Bytes(Bytes::from(compressed));
                response.headers.set("Content-Encoding", encoding);
                response.headers.append("Vary", "Accept-Encoding");
                response.headers.remove("Content-Length");
            }
            ctx
        })
    })
}
