use std::collections::HashMap;

use bytes::Bytes;

use crate::message::Body;
use crate::middleware::{Entry, PRIORITY_REQUEST_SIZE};

#[derive(Debug, Clone)]
pub struct RequestSizeConfig {
    /// Default body limit in bytes.
    pub limit: usize,
    /// Per-endpoint overrides, keyed by path.
    pub per_path: HashMap<String, usize>,
}

impl Default for RequestSizeConfig {
    fn default() -> Self {
        Self {
            limit: 1024 * 1024,
            per_path: HashMap::new(),
        }
    }
}

fn write_rejection(ctx: &mut crate::message::Context, status: u16, error: &str, kind: &str) {
    let body = serde_json::json!({ "error": error, "type": kind });
    let response = ctx.response_mut();
    response.status = status;
    response.headers.set("Content-Type", "application/json");
    response.body = Body::Bytes(Bytes::from(body.to_string().into_bytes()));
}

/// Enforces Content-Length against the configured limit: 413 on exceed,
/// 400 on a malformed header. Bodies without a declared length are checked
/// against their actual size.
pub fn request_size(config: RequestSizeConfig) -> Entry {
    Entry::new("request_size", PRIORITY_REQUEST_SIZE, move |mut ctx, next| {
        let config = config.clone();
        Box::pin(async move {
            let limit = config
                .per_path
                .get(&ctx.request().endpoint)
                .copied()
                .unwrap_or(config.limit);

            let declared = match ctx.request().headers.get("Content-Length") {
                Some(raw) => match raw.trim().parse::<usize>() {
                    Ok(len) => Some(len),
                    Err(_) => {
                        write_rejection(
                            &mut ctx,
                            400,
                            "malformed Content-Length header",
                            "InvalidArgument",
                        );
                        return ctx;
                    }
                },
                None => None,
            };

            let size = declared.unwrap_or(ctx.request().body.len());
            if size > limit {
                write_rejection(
                    &mut ctx,
                    413,
                    &format!("request body exceeds limit of {limit} bytes"),
                    "PayloadTooLarge",
                );
                return ctx;
            }

            next.run(ctx).await
        })
    })
}
