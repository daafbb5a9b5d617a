//! blocksync Compactor Binary
//!
//! Background service that synchronizes block metadata, plans compaction
//! jobs, and serves the block upload API.

use blocksync::api;
use blocksync::config::ComponentFactory;
use blocksync::telemetry::Telemetry;
use blocksync::upload::BlockUploadService;

use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

/// blocksync compaction coordinator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// HTTP listen address for the upload API
    #[arg(long, env = "BLOCKSYNC_HTTP_ADDR", default_value = "0.0.0.0:8080")]
    http_addr: String,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let _telemetry = Telemetry::init_for_component("blocksync-compactor", &args.log_level)?;

    info!("Starting blocksync compactor");

    let object_store = ComponentFactory::create_object_store().await?;
    let compactor = Arc::new(ComponentFactory::create_compactor(object_store.clone()).await?);
    let shutdown = compactor.shutdown_token();

    // Upload API shares the same store; commits become visible to the next
    // sync cycle.
    let uploads = Arc::new(BlockUploadService::new(object_store));
    let router = api::build_http_router(uploads);

    let listener = tokio::net::TcpListener::bind(&args.http_addr).await?;
    info!(addr = %args.http_addr, tenant = compactor.tenant_id(), "Compactor ready");

    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await;
        if let Err(e) = result {
            error!("Upload API server failed: {}", e);
        }
    });

    tokio::select! {
        _ = compactor.run() => {},
        _ = shutdown_signal() => {
            shutdown.cancel();
        }
    }

    let _ = server.await;
    info!("Compactor shutting down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
