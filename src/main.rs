use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{error, info};

use sidegate::logger::init_tracing;
use sidegate::{Config, ProxyListener};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;
    init_tracing(config.log_format)?;

    info!(
        version = sidegate::VERSION,
        address = %config.bind_address(),
        "Starting forward proxy"
    );
    let grace = config.watchdog_grace();
    let listener = Arc::new(ProxyListener::bind(config).await?);
    let mut accept = listener.spawn();

    tokio::select! {
        result = &mut accept => {
            // The accept loop only ends on its own when it fails
            return result.context("Accept loop panicked")?;
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
        }
    }

    listener.stop();
    accept.await.context("Accept loop panicked")??;
    let aborted = listener.drain(grace).await;
    info!(aborted, "Shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        },
        _ = terminate => {
            info!("Received SIGTERM");
        },
    }
}
