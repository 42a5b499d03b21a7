//! Graceful shutdown coordination.
//!
//! [`ShutdownSignal`] is a cloneable flag backed by a `watch` channel. The
//! engine checks [`ShutdownSignal::is_triggered`] at the top of each message
//! and races [`ShutdownSignal::cancelled`] against its blocking reads and
//! idle sleeps.
//!
//! # Example
//!
//! ```rust,ignore
//! use crm_sync::shutdown::ShutdownSignal;
//!
//! let shutdown = ShutdownSignal::new();
//! let listener = shutdown.clone();
//! tokio::spawn(async move { listener.wait().await });
//!
//! loop {
//!     tokio::select! {
//!         _ = shutdown.cancelled() => break,
//!         // ... process events
//!     }
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

/// Default grace period for the in-flight batch.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    sender: Arc<watch::Sender<bool>>,
    timeout: Duration,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_SHUTDOWN_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            timeout,
        }
    }

    /// Grace period granted to in-flight work.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait for SIGINT or SIGTERM, then trigger.
    pub async fn wait(&self) {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl+C");
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
                    warn!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown"),
            _ = terminate => info!("Received SIGTERM, initiating graceful shutdown"),
            _ = self.cancelled() => return,
        }

        self.sender.send_replace(true);
    }

    /// Trigger shutdown programmatically. Idempotent.
    pub fn trigger(&self) {
        if !self.sender.send_replace(true) {
            info!("Shutdown triggered");
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolves once shutdown has been triggered (immediately if it already was).
    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = receiver.wait_for(|triggered| *triggered).await;
    }

    /// Wait for shutdown, giving up after `timeout`.
    ///
    /// Returns `true` if shutdown was triggered within the timeout.
    pub async fn wait_with_timeout(&self, timeout: Duration) -> bool {
        tokio::select! {
            _ = self.cancelled() => true,
            _ = tokio::time::sleep(timeout) => {
                warn!(timeout_secs = timeout.as_secs(), "Shutdown wait timed out");
                false
            }
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_signal_creation() {
        let signal = ShutdownSignal::new();
        assert_eq!(signal.timeout(), Duration::from_secs(30));
        assert!(!signal.is_triggered());
    }

    #[tokio::test]
    async fn test_manual_trigger() {
        let signal = ShutdownSignal::new();

        let trigger_signal = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger_signal.trigger();
        });

        let result = tokio::time::timeout(Duration::from_millis(500), signal.cancelled()).await;
        assert!(result.is_ok());
        assert!(signal.is_triggered());
    }

    #[tokio::test]
    async fn test_clones_observe_trigger() {
        let signal = ShutdownSignal::new();
        let other = signal.clone();

        signal.trigger();
        signal.trigger();

        assert!(other.is_triggered());
        other.cancelled().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_with_timeout() {
        let signal = ShutdownSignal::with_timeout(Duration::from_secs(1));
        assert!(!signal.wait_with_timeout(Duration::from_secs(1)).await);
        signal.trigger();
        assert!(signal.wait_with_timeout(Duration::from_secs(1)).await);
    }
}
