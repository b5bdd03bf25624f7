//! Signal handling for graceful shutdown.

use std::future::pending;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;

/// Creates a future that completes when a shutdown signal is received.
///
/// Listens for SIGTERM and SIGINT (Ctrl+C). A handler that cannot be
/// installed is logged and never fires.
pub async fn shutdown_signal() {
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                pending::<()>().await;
            }
        }
    };

    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install SIGINT handler");
            pending::<()>().await;
        }
    };

    tokio::select! {
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        }
        _ = interrupt => {
            tracing::info!("Received SIGINT, initiating graceful shutdown");
        }
    }
}

/// Resolve once `shutdown_tx` has broadcast `true`.
///
/// Lets the HTTP server stop together with the background tasks, whichever
/// side triggered the shutdown.
pub async fn wait_for_shutdown(mut shutdown_rx: watch::Receiver<bool>) {
    // An error means the sender is gone, which is a shutdown too.
    let _ = shutdown_rx.wait_for(|stop| *stop).await;
}

/// Broadcast shutdown to every background task when a signal arrives.
pub fn spawn_signal_handler(shutdown_tx: Arc<watch::Sender<bool>>) {
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_tx.send_replace(true);
    });
}
