#![doc = include_str!("../README.md")]

mod server;

use clap::Parser;
use server::config::{CliArgs, ServerConfig};
use server::service::{AppState, router};
use server::telemetry::init_telemetry;
use std::sync::Arc;
use storm_relay_core::{TaskRunner, TemplateGenerator};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::oneshot;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let providers = init_telemetry(config.log_format)?;

    let generator = Arc::new(TemplateGenerator::new(config.stage_delay));
    let runner = TaskRunner::new(config.runner_config(), generator)?;
    let app = router(AppState::new(runner.clone()));

    let listener = TcpListener::bind(&config.server_addr).await?;
    log_startup_info(&config);

    // The pool starts draining as soon as the signal arrives, so open streams
    // end within the shutdown timeout instead of holding the server open.
    let (pool_tx, pool_rx) = oneshot::channel();
    let drain = {
        let runner = runner.clone();
        async move {
            shutdown_signal().await;
            let _ = pool_tx.send(tokio::spawn(async move { runner.shutdown().await }));
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(drain)
        .await?;

    tracing::info!("HTTP server stopped, waiting for the worker pool...");
    let pool_shutdown = match pool_rx.await {
        Ok(handle) => handle.await.map_err(anyhow::Error::from),
        Err(_) => Ok(runner.shutdown().await),
    };
    match pool_shutdown {
        Ok(Ok(())) => tracing::info!("Service shut down successfully"),
        Ok(Err(e)) => tracing::error!("Error during runner shutdown: {e:?}"),
        Err(e) => tracing::error!("Runner shutdown task failed: {e:?}"),
    }

    providers.shutdown();
    Ok(())
}

fn log_startup_info(config: &ServerConfig) {
    if cfg!(debug_assertions) {
        tracing::info!(
            "Starting STORM relay on {} with full config: {:#?}",
            config.server_addr,
            config
        );
    } else {
        tracing::info!(
            "Starting STORM relay on {} with {} workers",
            config.server_addr,
            config.num_workers
        );
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }

    tracing::info!("Shutdown signal received, terminating gracefully...");
}
