use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Returns a token cancelled on SIGINT or SIGTERM, plus the listener task's
/// handle so callers can abort it once the run is over.
pub fn listen() -> (CancellationToken, JoinHandle<()>) {
    let token = CancellationToken::new();
    let shutdown_token = token.clone();
    let handle = tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_token.cancel();
    });
    (token, handle)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        info!("received Ctrl+C signal");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
        info!("received terminate signal");
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
