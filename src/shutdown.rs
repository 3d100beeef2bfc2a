use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Install the signal watcher.
///
/// SIGINT and SIGTERM cancel the returned token; the run loop then walks the
/// graceful sequence (directory sleep, SHUT broadcast, grace period).
/// SIGQUIT exits immediately with status 1.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        let mut sigquit = signal(SignalKind::quit()).expect("failed to install SIGQUIT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::warn!("Received SIGTERM, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                tracing::warn!("Received SIGINT, initiating graceful shutdown");
            }
            _ = sigquit.recv() => {
                tracing::error!("Received SIGQUIT, exiting immediately");
                std::process::exit(1);
            }
        }

        token_clone.cancel();
    });

    token
}
