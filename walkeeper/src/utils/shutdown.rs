//! SIGTERM / SIGINT handling for long-running commands.
//!
//! A signal cancels the root token. Transfers observe it, stop taking new
//! work and the command fails without writing a completion marker.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Cancels a token when the process is asked to stop.
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// Token that is cancelled once a signal arrives.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Spawn a task that waits for SIGINT or SIGTERM and cancels the token.
    pub fn listen(&self) -> tokio::task::JoinHandle<()> {
        let token = self.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                signal = wait_for_signal() => {
                    info!("Received {}, cancelling in-flight transfers", signal);
                    token.cancel();
                }
                _ = token.cancelled() => {}
            }
        })
    }

    /// Cancel directly, as if a signal had arrived.
    pub fn trigger(&self) {
        self.token.cancel();
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}

async fn wait_for_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trigger_cancels_token_and_stops_listener() {
        let coordinator = ShutdownCoordinator::default();
        let token = coordinator.token();
        let listener = coordinator.listen();

        coordinator.trigger();

        token.cancelled().await;
        listener.await.unwrap();
    }
}
