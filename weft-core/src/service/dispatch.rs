//! Inbound dispatch: message → context → middleware chain → handler →
//! response message.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::codec::CodecSelector;
use crate::error::{Error, Result};
use crate::message::{header, Body, Context, Message, Request};
use crate::middleware::{timeout, Chain, PreparedChain, Terminal};

use super::{EndpointHandler, EndpointOptions, Service};

struct PreparedEndpoint {
    chain: PreparedChain,
    terminal: Terminal,
    #[allow(dead_code)]
    options: EndpointOptions,
}

/// A service with frozen, execution-ready dispatch tables.
pub struct PreparedService {
    name: String,
    selector: CodecSelector,
    endpoints: HashMap<String, PreparedEndpoint>,
    base_chain: PreparedChain,
}

impl PreparedService {
    /// Freeze the service's chains and endpoint table. Called once at
    /// startup; the result is read-only afterwards.
    pub(crate) fn prepare(service: &Service) -> Result<Self> {
        let selector = CodecSelector::new(service.options.default_content_type.clone());

        let mut service_chain = service.service_chain.clone();
        if service.default_middleware {
            let defaults = [
                crate::middleware::recovery::recovery(),
                crate::middleware::error_handler::error_handler(),
                crate::middleware::request_id::request_id(),
                crate::middleware::logging::logging(),
                crate::middleware::timing::timing(),
            ];
            for entry in defaults {
                if !service_chain.entries().iter().any(|e| e.name == entry.name) {
                    service_chain.use_entry(entry);
                }
            }
        }

        let mut endpoints = HashMap::new();
        for endpoint in &service.endpoints {
            let mut method_chain = endpoint.middleware.clone();
            if let Some(budget) = endpoint.options.timeout {
                method_chain.use_entry(timeout::timeout(budget));
            }
            if !endpoint.options.auth_required {
                method_chain.allow_anonymous(true);
            }
            let composed = Chain::compose(&service_chain, &method_chain);
            endpoints.insert(
                endpoint.path.clone(),
                PreparedEndpoint {
                    chain: composed.prepare()?,
                    terminal: terminal_for(endpoint.handler.clone(), selector.clone()),
                    options: endpoint.options.clone(),
                },
            );
        }

        Ok(Self {
            name: service.options.name.clone(),
            selector,
            endpoints,
            base_chain: service_chain.prepare()?,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_endpoint(&self, path: &str) -> bool {
        self.endpoints.contains_key(path)
    }

    /// Handle one inbound request message, always producing a response
    /// message addressed back to it.
    pub async fn dispatch(&self, msg: &Message) -> Message {
        let path = msg.endpoint.clone().unwrap_or_default();
        let request = Request {
            service: msg.target.clone().unwrap_or_else(|| self.name.clone()),
            endpoint: path.clone(),
            content_type: msg.content_type().unwrap_or_default().to_string(),
            headers: msg.headers.clone(),
            body: msg.body.clone(),
        };
        let ctx = Context::new(request);

        let mut ctx = match self.endpoints.get(&path) {
            Some(endpoint) => {
                endpoint
                    .chain
                    .execute(ctx, endpoint.terminal.clone())
                    .await
            }
            None => {
                let terminal: Terminal = Arc::new(move |mut ctx| {
                    Box::pin(async move {
                        let path = ctx.request().endpoint.clone();
                        ctx.fail(Error::NotFound(format!("Method not found: {path}")));
                        ctx
                    })
                });
                self.base_chain.execute(ctx, terminal).await
            }
        };

        // Errors normally drain inside the error-handler middleware; one
        // that escaped still becomes a well-formed error response.
        if let Some(err) = ctx.take_error() {
            let response = ctx.response_mut();
            response.status = err.status_code();
            response.headers.set("Content-Type", "application/json");
            response.body = Body::Bytes(Bytes::from(
                err.to_body(None).to_string().into_bytes(),
            ));
        }

        self.finalize(msg, ctx)
    }

    fn finalize(&self, msg: &Message, mut ctx: Context) -> Message {
        let accept = ctx.request().headers.get("Accept").map(|s| s.to_string());
        let response = ctx.response_mut();
        let body = match std::mem::replace(&mut response.body, Body::Empty) {
            Body::Empty => Bytes::new(),
            Body::Bytes(bytes) => bytes,
            Body::Value(value) => {
                let encoded = self
                    .selector
                    .for_response(accept.as_deref())
                    .and_then(|codec| {
                        response
                            .headers
                            .set("Content-Type", codec.content_type());
                        codec.encode_value(&value)
                    });
                match encoded {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        response.status = err.status_code();
                        response.headers.set("Content-Type", "application/json");
                        Bytes::from(err.to_body(None).to_string().into_bytes())
                    }
                }
            }
        };

        let mut reply = Message::response(msg.id.clone(), response.status, body);
        reply.target = msg.reply_to.clone();
        for (name, value) in response.headers.iter() {
            reply.headers.append(name, value);
        }
        reply
            .headers
            .set(header::STATUS_CODE, response.status.to_string());
        reply
    }
}

fn terminal_for(handler: EndpointHandler, selector: CodecSelector) -> Terminal {
    match handler {
        EndpointHandler::Raw(raw) => raw,
        EndpointHandler::Typed(typed) => Arc::new(move |mut ctx| {
            let typed = typed.clone();
            let selector = selector.clone();
            Box::pin(async move {
                if let Err(err) = run_typed(&typed, &selector, &mut ctx).await {
                    ctx.fail(err);
                }
                ctx
            })
        }),
    }
}

async fn run_typed(
    typed: &super::TypedHandler,
    selector: &CodecSelector,
    ctx: &mut Context,
) -> Result<()> {
    let content_type = ctx.request().content_type.clone();
    let declared = (!content_type.is_empty()).then_some(content_type.as_str());
    let body = ctx.request().body.clone();
    let request_codec = selector.for_request(declared, &body)?;
    let accept = ctx.request().headers.get("Accept").map(|s| s.to_string());

    let value = typed(request_codec, body).await?;

    let response = ctx.response_mut();
    if value.is_null() {
        // Void handlers produce an empty 204.
        response.status = 204;
        response.body = Body::Empty;
    } else {
        let response_codec = selector.for_response(accept.as_deref())?;
        let bytes = response_codec.encode_value(&value)?;
        response
            .headers
            .set("Content-Type", response_codec.content_type());
        response.body = Body::Bytes(bytes);
    }
    Ok(())
}
