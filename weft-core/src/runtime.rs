//! The library entrypoint: start a service and block until signaled.

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config;
use crate::error::Result;
use crate::service::{serve, RunningService, Service};

/// Initialize the global tracing subscriber from the environment. Safe to
/// call more than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_new(config::log_filter())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init();
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Start the service, block until SIGINT or SIGTERM, then run the ordered
/// shutdown sequence. Returns the first shutdown-hook error, which callers
/// should turn into a non-zero exit code.
pub async fn run(service: Service) -> Result<()> {
    init_tracing();

    let mut service = service;
    config::apply_env(&mut service.options);

    let running: RunningService = serve(service).await?;
    info!(
        target: "weft::runtime",
        service = %running.name(),
        addr = %running.addr(),
        "running until SIGINT/SIGTERM"
    );

    wait_for_signal().await;
    running.shutdown().await
}
