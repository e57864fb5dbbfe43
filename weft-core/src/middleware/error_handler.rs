use bytes::Bytes;
use tracing::{debug, error};

use crate::message::Body;
use crate::middleware::{Entry, PRIORITY_ERROR_HANDLER};

/// Converts downstream failures into the standard JSON error response:
/// `{error, type, request_id?, ...}` with the taxonomy's status code.
/// Server errors are logged with detail, client errors are not.
pub fn error_handler() -> Entry {
    error_handler_with_details(false)
}

/// Like [`error_handler`], optionally including the detailed message under
/// a `message` key for non-production setups.
pub fn error_handler_with_details(show_details: bool) -> Entry {
    Entry::new("error_handler", PRIORITY_ERROR_HANDLER, move |ctx, next| {
        Box::pin(async move {
            let mut ctx = next.run(ctx).await;
            let Some(err) = ctx.take_error() else {
                return ctx;
            };

            let status = err.status_code();
            let request_id = ctx.request_id().map(|s| s.to_string());
            if status >= 500 {
                error!(
                    target: "weft::request",
                    endpoint = %ctx.request().endpoint,
                    request_id = request_id.as_deref().unwrap_or("-"),
                    status,
                    error = %err,
                    "request failed"
                );
            } else {
                debug!(
                    target: "weft::request",
                    endpoint = %ctx.request().endpoint,
                    status,
                    error = %err,
                    "request rejected"
                );
            }

            let mut body = err.to_body(request_id.as_deref());
            if show_details {
                body["message"] = serde_json::json!(err.message());
            }
            if let crate::error::Error::RateLimited {
                retry_after_secs, ..
            } = &err
            {
                ctx.response_mut()
                    .headers
                    .set("Retry-After", retry_after_secs.to_string());
            }

            let response = ctx.response_mut();
            response.status = status;
            response.headers.set("Content-Type", "application/json");
            response.body = Body::Bytes(Bytes::from(body.to_string().into_bytes()));
            ctx
        })
    })
}
