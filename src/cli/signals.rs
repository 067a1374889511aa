//! Signal handling: an interrupted `run` or `resume` cancels its execution

use crate::workflow::WorkflowEngine;
use tokio::task::JoinHandle;

/// Resolves with the signal name on SIGINT (Ctrl-C) or, on unix, SIGTERM
///
/// A handler that cannot be installed is logged and never fires.
pub async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}

/// Cancel `execution_id` when a shutdown signal arrives
///
/// Abort the returned handle once the execution has finished on its own.
pub fn cancel_on_signal(engine: WorkflowEngine, execution_id: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        let signal = shutdown_signal().await;
        eprintln!("\nReceived {}, cancelling {}...", signal, execution_id);
        tracing::warn!(execution_id = %execution_id, signal, "Cancelling execution on signal");

        if let Err(e) = engine.cancel(&execution_id).await {
            tracing::warn!(execution_id = %execution_id, error = %e, "Cancel on signal failed");
        }
    })
}
