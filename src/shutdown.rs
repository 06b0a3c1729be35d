use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Install a shutdown handler that listens for SIGTERM and SIGINT.
///
/// Both signals are registered before this returns, so a signal delivered
/// afterwards always cancels the returned token. A signal whose handler
/// cannot be installed is logged and the other one is still watched.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let sigterm = listen(SignalKind::terminate(), "SIGTERM");
    let sigint = listen(SignalKind::interrupt(), "SIGINT");
    if sigterm.is_none() && sigint.is_none() {
        tracing::error!("No shutdown signal can be watched, interrupts are ignored");
        return token;
    }

    let interrupted = token.clone();
    tokio::spawn(async move {
        let name = tokio::select! {
            _ = recv(sigterm) => "SIGTERM",
            _ = recv(sigint) => "SIGINT",
        };
        tracing::info!(signal = name, "Received shutdown signal, canceling outstanding work");
        interrupted.cancel();
    });

    token
}

fn listen(kind: SignalKind, name: &'static str) -> Option<Signal> {
    match signal(kind) {
        Ok(stream) => Some(stream),
        Err(e) => {
            tracing::error!(signal = name, error = %e, "Failed to install signal handler");
            None
        }
    }
}

async fn recv(stream: Option<Signal>) {
    match stream {
        Some(mut stream) => {
            stream.recv().await;
        }
        None => std::future::pending().await,
    }
}
