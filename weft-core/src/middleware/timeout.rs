use std::time::Duration;

use bytes::Bytes;

use crate::message::Body;
use crate::middleware::{Entry, PRIORITY_TIMEOUT};

/// Enforces a per-request budget on everything downstream. On expiry the
/// downstream work is cancelled, a fresh context is restored from a
/// checkpoint, and the response becomes a 504 with
/// `{error, timeout_seconds}`.
pub fn timeout(budget: Duration) -> Entry {
    Entry::new("timeout", PRIORITY_TIMEOUT, move |ctx, next| {
        Box::pin(async move {
            let checkpoint = ctx.checkpoint();
            match tokio::time::timeout(budget, next.run(ctx)).await {
                Ok(ctx) => ctx,
                Err(_) => {
                    let mut ctx = checkpoint.restore();
                    let body = serde_json::json!({
                        "error": "request timed out",
                        "timeout_seconds": budget.as_secs_f64(),
                    });
                    let response = ctx.response_mut();
                    response.status = 504;
                    response.headers.set("Content-Type", "application/json");
                    response.body = Body::Bytes(Bytes::from(body.to_string().into_bytes()));
                    ctx
                }
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Context, Headers, Request};
    use crate::middleware::{Chain, Terminal};
    use std::sync::Arc;

    fn ctx() -> Context {
        Context::new(Request {
            service: "svc".into(),
            endpoint: "/slow".into(),
            content_type: "application/json".into(),
            headers: Headers::new(),
            body: Bytes::new(),
        })
    }

    #[tokio::test]
    async fn expiry_writes_504() {
        let mut chain = Chain::new();
        chain.use_entry(timeout(Duration::from_millis(10)));
        let prepared = chain.prepare().unwrap();

        let terminal: Terminal = Arc::new(|ctx| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                ctx
            })
        });
        let context = prepared.execute(ctx(), terminal).await;

        assert_eq!(context.response().status, 504);
        let Body::Bytes(bytes) = &context.response().body else {
            panic!("expected bytes body");
        };
        let body: serde_json::Value = serde_json::from_slice(bytes).unwrap();
        assert_eq!(body["error"], "request timed out");
        assert!(body["timeout_seconds"].as_f64().unwrap() > 0.0);
    }

    #[tokio::test]
    async fn fast_requests_unaffected() {
        let mut chain = Chain::new();
        chain.use_entry(timeout(Duration::from_secs(5)));
        let prepared = chain.prepare().unwrap();

        let terminal: Terminal = Arc::new(|mut ctx| {
            Box::pin(async move {
                ctx.response_mut().status = 200;
                ctx
            })
        });
        let context = prepared.execute(ctx(), terminal).await;
        assert_eq!(context.response().status, 200);
    }
}
