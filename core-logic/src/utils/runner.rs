use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Two-stage stop signal.
///
/// `graceful` lets the current cycle finish: in-flight confirmations and
/// recovery attempts complete before exit. `forced` stops waiting on them;
/// the recovery journal already covers every funded wallet, and the run
/// summary is still written.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    graceful: CancellationToken,
    forced: CancellationToken,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wires Ctrl+C: the first press requests a graceful stop, the second
    /// forces it.
    pub fn install_ctrl_c() -> Self {
        let shutdown = Self::new();
        let listener = shutdown.clone();

        tokio::spawn(async move {
            match signal::ctrl_c().await {
                Ok(()) => {
                    info!("🛑 Received Ctrl+C. Finishing current cycle (press again to force)...");
                    listener.request_stop();
                }
                Err(err) => {
                    error!("Unable to listen for shutdown signal: {}", err);
                    return;
                }
            }
            if signal::ctrl_c().await.is_ok() {
                warn!("🛑 Second Ctrl+C. Abandoning in-flight confirmations; unresolved wallets stay in the recovery ledger.");
                listener.force_stop();
            }
        });

        shutdown
    }

    pub fn request_stop(&self) {
        self.graceful.cancel();
    }

    pub fn force_stop(&self) {
        self.graceful.cancel();
        self.forced.cancel();
    }

    pub fn is_stopping(&self) -> bool {
        self.graceful.is_cancelled()
    }

    pub fn is_forced(&self) -> bool {
        self.forced.is_cancelled()
    }

    pub fn forced_token(&self) -> CancellationToken {
        self.forced.clone()
    }

    /// Sleeps unless a graceful stop arrives first. Returns false when
    /// interrupted.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.graceful.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

/// Final tally line, shared by every run mode.
pub fn log_run_totals(elapsed: Duration, success: u64, failed: u64) {
    let total = success + failed;
    let rate = if total > 0 {
        (success as f64 / total as f64) * 100.0
    } else {
        0.0
    };

    info!("🛑 Shutdown Complete.");
    info!(
        "Total Time: {:.1}s | Total Success: {} | Total Fail: {} | Success Rate: {:.2}%",
        elapsed.as_secs_f64(),
        success,
        failed,
        rate
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_sleep_interrupted_by_stop() {
        let shutdown = ShutdownSignal::new();
        let stopper = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            stopper.request_stop();
        });
        assert!(!shutdown.sleep(Duration::from_secs(60)).await);
        assert!(shutdown.is_stopping());
        assert!(!shutdown.is_forced());
    }

    #[tokio::test]
    async fn test_force_implies_graceful() {
        let shutdown = ShutdownSignal::new();
        shutdown.force_stop();
        assert!(shutdown.is_stopping());
        assert!(shutdown.is_forced());
    }
}
