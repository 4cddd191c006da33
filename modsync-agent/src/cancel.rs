//! Cooperative cancellation for sync passes.
//!
//! A [`CancelHandle`] is held by the orchestrator and by whoever may want to
//! stop it (the CLI signal bridge, a front-end). Each pass runs under a fresh
//! [`CancellationToken`]; cancelling the handle trips the current one, and
//! every worker observes it at its next chunk or retry boundary.

use std::sync::{Arc, Mutex};
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    current: Arc<Mutex<CancellationToken>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of the pass in flight, if any.
    pub fn cancel(&self) {
        self.token().cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token().is_cancelled()
    }

    /// Token of the current pass.
    pub fn token(&self) -> CancellationToken {
        match self.current.lock() {
            Ok(token) => token.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Install and return a fresh token for a new pass.
    pub fn reset(&self) -> CancellationToken {
        let token = CancellationToken::new();
        match self.current.lock() {
            Ok(mut current) => *current = token.clone(),
            Err(poisoned) => *poisoned.into_inner() = token.clone(),
        }
        token
    }
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM.
pub async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
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
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), cancelling sync...");
        }
        _ = terminate => {
            info!("Received SIGTERM, cancelling sync...");
        }
    }
}

/// Cancel `handle` whenever a termination signal arrives.
pub fn cancel_on_signal(handle: CancelHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            wait_for_signal().await;
            handle.cancel();
        }
    })
}
