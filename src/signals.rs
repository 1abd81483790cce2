use tokio::sync::broadcast;
use tracing::{error, info};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Shutdown signal types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// Graceful shutdown (drain connections, close log backends)
    Graceful,
}

/// Spawn the signal listener.
///
/// SIGTERM and SIGINT (Ctrl-C elsewhere) broadcast [`ShutdownSignal::Graceful`]
/// once, then the task exits.
pub fn setup_signal_handlers() -> (broadcast::Sender<ShutdownSignal>, tokio::task::JoinHandle<()>) {
    let (shutdown_tx, _) = broadcast::channel(16);
    let tx = shutdown_tx.clone();

    let handle = tokio::spawn(async move {
        let received = wait_for_signal().await;
        info!(signal = received, "Shutdown signal received, initiating graceful shutdown");
        let _ = tx.send(ShutdownSignal::Graceful);
    });

    (shutdown_tx, handle)
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(term), Ok(int)) => (term, int),
        (term, int) => {
            for e in [term.err(), int.err()].into_iter().flatten() {
                error!(error = %e, "Failed to install unix signal handler, falling back to Ctrl-C");
            }
            return ctrl_c().await;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    ctrl_c().await
}

async fn ctrl_c() -> &'static str {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C, shutdown must come from the process manager");
        std::future::pending::<()>().await;
    }
    "ctrl-c"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_manual_broadcast_reaches_subscribers() {
        let (tx, handle) = setup_signal_handlers();
        let mut rx = tx.subscribe();

        tx.send(ShutdownSignal::Graceful).unwrap();
        assert_eq!(rx.recv().await.unwrap(), ShutdownSignal::Graceful);
        handle.abort();
    }
}
