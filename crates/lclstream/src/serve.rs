//! The `serve` command: control plane plus transfer registry.

use crate::runner::PipelineRunner;
use crate::transfer::TransferManager;
use crate::web::{router, WebState};
use anyhow::{Context, Result};
use lclconf::StreamConfig;
use std::sync::Arc;
use tracing::info;

pub async fn run(config: StreamConfig) -> Result<()> {
    let addr = config.bind.http_addr();
    info!("lclstream control plane starting");
    info!(
        "   execution: idx={} smd={}, codec={}, batch_size={}, workers={}",
        config.execution.indexed.as_str(),
        config.execution.sequential.as_str(),
        config.pipeline.codec.as_str(),
        config.pipeline.batch_size,
        config.workers.max_workers
    );

    let manager = Arc::new(TransferManager::new(Arc::new(PipelineRunner::new(config))));
    let app = router(WebState::new(Arc::clone(&manager)));

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("   Transfers: POST http://{}/transfers/new", addr);
    info!("   Health: GET http://{}/health", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    manager.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}

pub async fn shutdown_signal() {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down...");
        }
        _ = terminate() => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::warn!("Failed to install SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
