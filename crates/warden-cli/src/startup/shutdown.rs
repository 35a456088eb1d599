//! Shutdown handling for the Warden CLI
//!
//! Ctrl+C or SIGTERM cancels the in-flight command; the caller then tears
//! the lock coordinator down. Locks still held at that point expire at their
//! TTL.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};

/// Shutdown flag that late subscribers still observe
#[derive(Clone)]
pub struct ShutdownSignal {
    sender: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }

    /// Trigger shutdown
    pub fn shutdown(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.sender.borrow()
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Install Ctrl+C / SIGTERM handlers that trigger the returned signal
pub fn wait_for_shutdown_signal() -> ShutdownSignal {
    let shutdown = ShutdownSignal::new();
    let trigger = shutdown.clone();

    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
            _ = terminate => info!("Received SIGTERM, shutting down"),
        }

        trigger.shutdown();
    });

    shutdown
}

/// Run `future` unless shutdown is triggered first
pub async fn run_with_shutdown<F, T>(future: F, mut shutdown_rx: watch::Receiver<bool>) -> Option<T>
where
    F: Future<Output = T>,
{
    tokio::select! {
        result = future => Some(result),
        // A dropped sender disables this branch rather than cancelling
        Ok(_) = shutdown_rx.wait_for(|triggered| *triggered) => {
            warn!("Shutdown signal received, cancelling operation");
            None
        }
    }
}
