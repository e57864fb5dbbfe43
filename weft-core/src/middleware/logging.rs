use std::time::Instant;

use tracing::{debug, info};

use crate::middleware::{Entry, PRIORITY_LOGGING};

/// Structured request logging: a start line and a completion line with
/// duration and status, correlated by request id when the RequestID
/// middleware has run.
pub fn logging() -> Entry {
    Entry::new("logging", PRIORITY_LOGGING, |ctx, next| {
        Box::pin(async move {
            let service = ctx.request().service.clone();
            let endpoint = ctx.request().endpoint.clone();
            let request_id = ctx.request_id().unwrap_or("-").to_string();
            debug!(
                target: "weft::request",
                %service,
                %endpoint,
                %request_id,
                "request started"
            );

            let start = Instant::now();
            let ctx = next.run(ctx).await;
            let duration_ms = start.elapsed().as_millis() as u64;
            let status = match ctx.error() {
                Some(err) => err.status_code(),
                None => ctx.response().status,
            };
            info!(
                target: "weft::request",
                %service,
                %endpoint,
                %request_id,
                status,
                duration_ms,
                "request completed"
            );
            ctx
        })
    })
}
