use tokio_util::sync::CancellationToken;
use tracing::info;

/// Install a shutdown handler listening for Ctrl+C (and SIGTERM on unix).
///
/// Returns a `CancellationToken` that is cancelled when a signal arrives.
/// Embedders pass the result to their own drain logic or simply await it
/// before calling [`crate::TaskQueue::shutdown`].
pub fn shutdown_signal() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    tracing::error!(error = %e, "failed to install SIGTERM handler");
                    return;
                }
            };

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("received Ctrl+C, initiating graceful shutdown");
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM, initiating graceful shutdown");
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("received Ctrl+C, initiating graceful shutdown");
        }

        token_clone.cancel();
    });

    token
}
