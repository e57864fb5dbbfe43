use std::sync::Arc;

use crate::error::{Error, Result};

use super::{lookup_codec, normalize_content_type, Codec, JSON};

/// Picks codecs for a request/response pair.
///
/// Requests: declared Content-Type first, then a sniff of the body bytes
/// (leading `{` or `[` means JSON), then the service default. A declared but
/// unknown content type is rejected with UnsupportedMedia.
///
/// Responses: the Accept header, honoring quality factors (highest supported
/// q > 0 wins), then the service default.
#[derive(Clone)]
pub struct CodecSelector {
    default_content_type: String,
}

impl CodecSelector {
    pub fn new(default_content_type: impl Into<String>) -> Self {
        Self {
            default_content_type: default_content_type.into(),
        }
    }

    pub fn default_content_type(&self) -> &str {
        &self.default_content_type
    }

    fn default_codec(&self) -> Result<Arc<dyn Codec>> {
        lookup_codec(&self.default_content_type).ok_or_else(|| {
            Error::Internal(format!(
                "default codec not registered: {}",
                self.default_content_type
            ))
        })
    }

    /// Select the codec for an incoming request.
    pub fn for_request(&self, content_type: Option<&str>, body: &[u8]) -> Result<Arc<dyn Codec>> {
        if let Some(ct) = content_type.filter(|ct| !ct.trim().is_empty()) {
            return lookup_codec(ct).ok_or_else(|| {
                Error::UnsupportedMedia(format!(
                    "unsupported content type: {}",
                    normalize_content_type(ct)
                ))
            });
        }
        let sniffed = body
            .iter()
            .find(|b| !b.is_ascii_whitespace())
            .copied()
            .filter(|b| *b == b'{' || *b == b'[')
            .and_then(|_| lookup_codec(JSON));
        match sniffed {
            Some(codec) => Ok(codec),
            None => self.default_codec(),
        }
    }

    /// Select the codec for a response given the request's Accept header.
    pub fn for_response(&self, accept: Option<&str>) -> Result<Arc<dyn Codec>> {
        if let Some(accept) = accept {
            for (media, q) in parse_accept(accept) {
                if q <= 0.0 {
                    continue;
                }
                if media == "*/*" {
                    return self.default_codec();
                }
                if let Some(codec) = lookup_codec(&media) {
                    return Ok(codec);
                }
            }
        }
        self.default_codec()
    }
}

/// Parse an Accept header into (media-type, q) pairs sorted by descending q,
/// ties in header order.
fn parse_accept(accept: &str) -> Vec<(String, f32)> {
    let mut entries: Vec<(String, f32)> = accept
        .split(',')
        .filter_map(|part| {
            let mut pieces = part.split(';');
            let media = normalize_content_type(pieces.next()?.trim());
            if media.is_empty() {
                return None;
            }
            let mut q = 1.0f32;
            for param in pieces {
                let param = param.trim();
                if let Some(value) = param.strip_prefix("q=") {
                    q = value.parse().unwrap_or(0.0);
                }
            }
            Some((media, q))
        })
        .collect();
    entries.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selector() -> CodecSelector {
        CodecSelector::new(JSON)
    }

    #[test]
    #[serial_test::serial]
    fn request_uses_declared_content_type() {
        crate::codec::reset_codecs();
        let codec = selector()
            .for_request(Some("text/plain"), b"hello")
            .unwrap();
        assert_eq!(codec.content_type(), "text/plain");
    }

    #[test]
    #[serial_test::serial]
    fn request_unknown_content_type_is_415() {
        crate::codec::reset_codecs();
        let err = selector()
            .for_request(Some("application/x-msgpack"), b"")
            .unwrap_err();
        assert_eq!(err.status_code(), 415);
    }

    #[test]
    #[serial_test::serial]
    fn request_sniffs_json_body() {
        crate::codec::reset_codecs();
        let codec = selector().for_request(None, b"  {\"a\":1}").unwrap();
        assert_eq!(codec.content_type(), JSON);
        let codec = selector().for_request(None, b"[1,2]").unwrap();
        assert_eq!(codec.content_type(), JSON);
    }

    #[test]
    #[serial_test::serial]
    fn request_falls_back_to_default() {
        crate::codec::reset_codecs();
        let codec = selector().for_request(None, b"plain words").unwrap();
        assert_eq!(codec.content_type(), JSON);
    }

    #[test]
    #[serial_test::serial]
    fn response_honors_accept_quality() {
        crate::codec::reset_codecs();
        let codec = selector()
            .for_response(Some("application/json;q=0.2, text/plain;q=0.9"))
            .unwrap();
        assert_eq!(codec.content_type(), "text/plain");
    }

    #[test]
    #[serial_test::serial]
    fn response_skips_zero_quality() {
        crate::codec::reset_codecs();
        let codec = selector()
            .for_response(Some("text/plain;q=0, application/json;q=0.5"))
            .unwrap();
        assert_eq!(codec.content_type(), JSON);
    }

    #[test]
    #[serial_test::serial]
    fn response_wildcard_uses_default() {
        crate::codec::reset_codecs();
        let codec = selector().for_response(Some("*/*")).unwrap();
        assert_eq!(codec.content_type(), JSON);
    }

    #[test]
    #[serial_test::serial]
    fn response_unknown_accept_uses_default() {
        crate::codec::reset_codecs();
        let codec = selector().for_response(Some("application/xml")).unwrap();
        assert_eq!(codec.content_type(), JSON);
    }

    #[test]
    fn accept_parsing_orders_by_quality() {
        let parsed = parse_accept("a/b;q=0.5, c/d, e/f;q=0.8");
        assert_eq!(parsed[0].0, "c/d");
        assert_eq!(parsed[1].0, "e/f");
        assert_eq!(parsed[2].0, "a/b");
    }
}
