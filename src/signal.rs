//! Operator-initiated shutdown.

use tracing::{info, warn};

/// Resolves on the first SIGINT (Ctrl-C) or SIGTERM.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = ctrl_c() => {}
                    _ = terminate.recv() => info!("Received SIGTERM, stopping all processes"),
                }
            }
            Err(err) => {
                warn!(error = %err, "Could not install SIGTERM handler; only Ctrl-C will stop");
                ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c().await;
    }
}

async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl-C, stopping all processes"),
        Err(err) => {
            // Without a listener there is nothing to wait for; SIGTERM may still arrive.
            warn!(error = %err, "Ctrl-C listener failed");
            futures::future::pending::<()>().await;
        }
    }
}
