use std::panic::AssertUnwindSafe;

use bytes::Bytes;
use futures_util::FutureExt;
use tracing::error;

use crate::message::Body;
use crate::middleware::{Entry, PRIORITY_RECOVERY};

/// Catches panics from everything downstream and turns them into a generic
/// 500 response so the server process stays alive. The in-flight context is
/// lost with the unwinding task, so the response is rebuilt from a
/// checkpoint taken before running the rest of the chain. The panic is
/// logged; it is never re-raised.
pub fn recovery() -> Entry {
    Entry::new("recovery", PRIORITY_RECOVERY, |ctx, next| {
        Box::pin(async move {
            let checkpoint = ctx.checkpoint();
            match AssertUnwindSafe(next.run(ctx)).catch_unwind().await {
                Ok(ctx) => ctx,
                Err(panic) => {
                    let detail = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());

                    let mut ctx = checkpoint.restore();
                    let request_id = ctx.request_id().map(|s| s.to_string());
                    error!(
                        target: "weft::request",
                        endpoint = %ctx.request().endpoint,
                        request_id = request_id.as_deref().unwrap_or("-"),
                        panic = %detail,
                        "handler panicked"
                    );

                    let mut body = serde_json::json!({ "error": "Internal server error" });
                    if let Some(id) = request_id {
                        body["request_id"] = serde_json::json!(id);
                    }
                    let response = ctx.response_mut();
                    response.status = 500;
                    response.headers.set("Content-Type", "application/json");
                    response.body = Body::Bytes(Bytes::from(body.to_string().into_bytes()));
                    ctx
                }
            }
        })
    })
}
