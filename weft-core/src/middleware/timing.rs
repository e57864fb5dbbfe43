use std::time::Instant;

use crate::message::header;
use crate::middleware::{Entry, PRIORITY_TIMING};

/// Records the monotonic duration of everything downstream and exposes it
/// as the `X-Response-Time` header (milliseconds) and the
/// `response_time_ms` context attribute.
pub fn timing() -> Entry {
    Entry::new("timing", PRIORITY_TIMING, |ctx, next| {
        Box::pin(async move {
            let start = Instant::now();
            let mut ctx = next.run(ctx).await;
            let millis = start.elapsed().as_millis() as u64;
            ctx.set_attr("response_time_ms", serde_json::json!(millis));
            ctx.response_mut()
                .headers
                .set(header::RESPONSE_TIME, format!("{millis}ms"));
            ctx
        })
    })
}
