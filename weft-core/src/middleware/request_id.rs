//! Request ID middleware: propagates or generates a unique identifier per
//! request.
//!
//! Reads the incoming header (default `X-Request-ID`); if absent, generates
//! a UUID v4. The id lands in the context attribute bag under `request_id`
//! and is copied into the response header.

use crate::message::header;
use crate::middleware::{Entry, PRIORITY_REQUEST_ID};

/// Build the middleware with the default header name.
pub fn request_id() -> Entry {
    request_id_with_header(header::REQUEST_ID)
}

/// Build the middleware with a custom header name.
pub fn request_id_with_header(header_name: &'static str) -> Entry {
    Entry::new("request_id", PRIORITY_REQUEST_ID, move |mut ctx, next| {
        Box::pin(async move {
            let id = ctx
                .request()
                .headers
                .get(header_name)
                .map(|s| s.to_string())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

            ctx.set_attr("request_id", serde_json::json!(id));
            ctx.response_mut().headers.set(header_name, id);
            next.run(ctx).await
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Context, Headers, Request};
    use crate::middleware::{Chain, Terminal};
    use bytes::Bytes;
    use std::sync::Arc;

    fn ctx_with_headers(headers: Headers) -> Context {
        Context::new(Request {
            service: "svc".into(),
            endpoint: "/e".into(),
            content_type: "application/json".into(),
            headers,
            body: Bytes::new(),
        })
    }

    fn noop() -> Terminal {
        Arc::new(|ctx| Box::pin(async move { ctx }))
    }

    #[tokio::test]
    async fn generates_uuid_when_absent() {
        let mut chain = Chain::new();
        chain.use_entry(request_id());
        let prepared = chain.prepare().unwrap();

        let ctx = prepared
            .execute(ctx_with_headers(Headers::new()), noop())
            .await;

        let id = ctx.request_id().unwrap().to_string();
        assert!(uuid::Uuid::parse_str(&id).is_ok());
        assert_eq!(ctx.response().headers.get("X-Request-ID"), Some(id.as_str()));
    }

    #[tokio::test]
    async fn propagates_existing_header() {
        let mut headers = Headers::new();
        headers.set("X-Request-ID", "caller-chosen");
        let mut chain = Chain::new();
        chain.use_entry(request_id());
        let prepared = chain.prepare().unwrap();

        let ctx = prepared.execute(ctx_with_headers(headers), noop()).await;

        assert_eq!(ctx.request_id(), Some("caller-chosen"));
        assert_eq!(
            ctx.response().headers.get("X-Request-ID"),
            Some("caller-chosen")
        );
    }
}
