//! Graceful shutdown coordination.
//!
//! This module provides a [`ShutdownSignal`]: one cancellation signal shared
//! by the ingestion loop, every lane enqueue point and the dead-letter replay
//! loop. It also carries the bound on how long shutdown may wait for lanes
//! to drain.
//!
//! # Example
//!
//! ```rust,ignore
//! use inventory_sync::shutdown::ShutdownSignal;
//!
//! #[tokio::main]
//! async fn main() {
//!     let shutdown = ShutdownSignal::new();
//!
//!     let running = consumer.start(shutdown.token());
//!
//!     // Wait for SIGINT/SIGTERM, then drain
//!     shutdown.wait().await;
//!     running.shutdown(shutdown.timeout()).await;
//! }
//! ```

use std::time::Duration;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{error, info};

/// Default shutdown timeout in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT: u64 = 30;

/// A signal for coordinating graceful shutdown across components.
///
/// Clones share the same underlying token: triggering one triggers all.
#[derive(Clone)]
pub struct ShutdownSignal {
    token: CancellationToken,
    /// How long to wait for buffered work before forcing a stop
    timeout: Duration,
}

impl ShutdownSignal {
    /// Create a new shutdown signal with default timeout (30 seconds).
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT))
    }

    /// Create a new shutdown signal with custom timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            timeout,
        }
    }

    /// Get the shutdown timeout duration.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Token to hand to a loop.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wait for SIGINT or SIGTERM (or a programmatic trigger), then cancel.
    pub async fn wait(&self) {
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
            _ = ctrl_c => {
                info!("Received Ctrl+C, initiating graceful shutdown...");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating graceful shutdown...");
            }
            _ = self.token.cancelled() => {
                return;
            }
        }

        self.token.cancel();
    }

    /// Resolves once shutdown has been triggered.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    /// Check if shutdown has been triggered.
    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Trigger shutdown manually (for testing or programmatic shutdown).
    pub fn trigger(&self) {
        info!("Shutdown triggered programmatically");
        self.token.cancel();
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
