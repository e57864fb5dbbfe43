//! The server side of a service: accept loop, per-connection tasks, and the
//! ordered shutdown path.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{with_retry, Broker, SubscriptionHandle};
use crate::error::{Error, Result};
use crate::message::MessageKind;
use crate::registry::{default_registry, Node, Registry, ServiceRecord};
use crate::transport::{Socket, TcpTransport, Transport};

use super::dispatch::PreparedService;
use super::Service;

fn split_host_port(addr: &str) -> (String, u16) {
    match addr.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (addr.to_string(), 0),
        },
        None => (addr.to_string(), 0),
    }
}

/// A started service. Dropping it does not stop the server; call
/// [`RunningService::shutdown`] for the ordered teardown.
pub struct RunningService {
    name: String,
    addr: String,
    record: ServiceRecord,
    registry: Arc<dyn Registry>,
    broker: Option<Arc<dyn Broker>>,
    subscription_handles: Vec<SubscriptionHandle>,
    cancel: CancellationToken,
    accept_task: tokio::task::JoinHandle<()>,
    shutdown_hooks: Vec<super::Hook>,
}

impl RunningService {
    /// The address the server actually bound.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node_id(&self) -> &str {
        &self.record.nodes[0].id
    }

    pub fn subscriptions(&self) -> &[SubscriptionHandle] {
        &self.subscription_handles
    }

    /// Ordered teardown: shutdown hooks, deregister, unsubscribe, broker
    /// disconnect, then stop the server (refusing new connections and
    /// draining existing ones). Returns the first hook error, if any.
    pub async fn shutdown(mut self) -> Result<()> {
        info!(target: "weft::server", service = %self.name, "shutting down");
        let mut hook_error = None;
        for hook in self.shutdown_hooks.drain(..) {
            if let Err(e) = hook().await {
                warn!(target: "weft::server", service = %self.name, error = %e, "shutdown hook failed");
                hook_error.get_or_insert(e);
            }
        }

        if let Err(e) = self.registry.deregister(&self.record).await {
            warn!(target: "weft::server", service = %self.name, error = %e, "deregister failed");
        }

        if let Some(broker) = &self.broker {
            for handle in &self.subscription_handles {
                let _ = broker.unsubscribe(handle).await;
            }
            let _ = broker.disconnect().await;
        }

        self.cancel.cancel();
        let _ = self.accept_task.await;

        match hook_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Start a service: bind, register, subscribe, and spawn the accept loop.
pub async fn serve(mut service: Service) -> Result<RunningService> {
    service.validate()?;

    // Every service answers /health unless it already declared one.
    if !service.endpoints.iter().any(|e| e.path == "/health") {
        let name = service.options.name.clone();
        let version = service.options.version.clone();
        service = service
            .handle("/health", move || {
                let name = name.clone();
                let version = version.clone();
                async move {
                    Ok(serde_json::json!({
                        "status": "ok",
                        "service": name,
                        "version": version,
                    }))
                }
            })
            .endpoint_options(
                "/health",
                super::EndpointOptions {
                    http_method: "GET".to_string(),
                    auth_required: false,
                    ..Default::default()
                },
            );
    }

    let transport: Arc<dyn Transport> = service
        .transport
        .clone()
        .unwrap_or_else(|| Arc::new(TcpTransport::new()));
    let registry: Arc<dyn Registry> = service
        .registry
        .clone()
        .unwrap_or_else(default_registry);
    let broker = service.broker.clone();

    let prepared = Arc::new(PreparedService::prepare(&service)?);

    let listener = transport.listen(&service.options.bind_addr).await?;
    let bound_addr = listener.local_addr();

    for hook in service.startup_hooks.drain(..) {
        hook().await?;
    }

    let advertise = service
        .options
        .advertise_addr
        .clone()
        .unwrap_or_else(|| bound_addr.clone());
    let (host, port) = split_host_port(&advertise);
    let mut node = Node::new(host, port);
    node.metadata = service.options.metadata.clone();

    let record = ServiceRecord {
        name: service.options.name.clone(),
        version: service.options.version.clone(),
        metadata: service.options.metadata.clone(),
        nodes: vec![node],
    };
    registry.register(&record).await?;

    let mut subscription_handles = Vec::new();
    if !service.subscriptions.is_empty() {
        let broker = broker.as_ref().ok_or_else(|| {
            Error::Config("service declares subscriptions but has no broker".into())
        })?;
        for entry in &service.subscriptions {
            let handle = broker
                .subscribe(&entry.topic, entry.queue_group.as_deref(), with_retry(entry))
                .await
                .map_err(Error::from)?;
            subscription_handles.push(handle);
        }
    }

    let cancel = CancellationToken::new();
    let accept_task = {
        let prepared = prepared.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut connections = Vec::new();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok(socket) => {
                            let prepared = prepared.clone();
                            let cancel = cancel.clone();
                            connections.push(tokio::spawn(handle_connection(
                                socket, prepared, cancel,
                            )));
                        }
                        Err(e) => {
                            debug!(target: "weft::server", error = %e, "accept failed");
                            break;
                        }
                    },
                }
            }
            let _ = listener.close().await;
            for connection in connections {
                let _ = connection.await;
            }
        })
    };

    info!(
        target: "weft::server",
        service = %service.options.name,
        version = %service.options.version,
        addr = %bound_addr,
        "service started"
    );

    Ok(RunningService {
        name: service.options.name.clone(),
        addr: bound_addr,
        record,
        registry,
        broker,
        subscription_handles,
        cancel,
        accept_task,
        shutdown_hooks: service.shutdown_hooks,
    })
}

async fn handle_connection(
    socket: Box<dyn Socket>,
    prepared: Arc<PreparedService>,
    cancel: CancellationToken,
) {
    let socket: Arc<dyn Socket> = Arc::from(socket);
    let mut in_flight = Vec::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv() => match received {
                Ok(msg) if msg.kind == MessageKind::Request => {
                    let prepared = prepared.clone();
                    let socket = socket.clone();
                    in_flight.push(tokio::spawn(async move {
                        let reply = prepared.dispatch(&msg).await;
                        if let Err(e) = socket.send(reply).await {
                            debug!(target: "weft::server", error = %e, "reply send failed");
                        }
                    }));
                }
                Ok(msg) => {
                    debug!(
                        target: "weft::server",
                        kind = msg.kind.as_str(),
                        "ignoring non-request message"
                    );
                }
                Err(_) => break,
            },
        }
    }
    // Let in-flight dispatches finish before the socket goes away.
    for task in in_flight {
        let _ = task.await;
    }
    let _ = socket.close().await;
}
