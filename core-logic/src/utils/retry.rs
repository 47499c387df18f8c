use crate::error::FailureReason;
use anyhow::{Context, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub exponential_base: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30000,
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32, base_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay_ms,
            max_delay_ms: base_delay_ms * 30,
            ..Default::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let delay_ms = self.base_delay_ms as f64 * self.exponential_base.powi(attempt as i32);
        let delay_ms = delay_ms.min(self.max_delay_ms as f64);

        let delay_ms = if self.jitter {
            let rng_factor = rand::thread_rng().gen_range(0.5..=1.5);
            delay_ms * rng_factor
        } else {
            delay_ms
        };

        Duration::from_millis(delay_ms as u64)
    }
}

pub async fn with_retry<T, F, Fut>(
    config: RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!("{} succeeded on attempt {}", operation_name, attempt + 1);
                }
                return Ok(result);
            }
            Err(e) => {
                if attempt >= config.max_retries {
                    debug!(
                        "{} failed after {} retries",
                        operation_name, config.max_retries
                    );
                    let error_msg = format!("{}", e);
                    return Err(e).context(format!(
                        "{} failed after {} attempts. Last error: {}",
                        operation_name,
                        config.max_retries + 1,
                        error_msg
                    ));
                }

                let delay = config.calculate_delay(attempt);
                debug!(
                    "{} failed (attempt {}/{}). Retrying in {:?}: {}",
                    operation_name,
                    attempt + 1,
                    config.max_retries + 1,
                    delay,
                    e
                );

                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Maps raw RPC or simulation error text onto a [`FailureReason`].
///
/// Order matters: a simulation failure caused by the compute budget must be
/// reported as the budget problem so the fee bump is the larger one.
pub fn classify_failure(message: &str) -> FailureReason {
    let msg = message.to_lowercase();

    let table: [(&[&str], FailureReason); 8] = [
        (
            &[
                "compute budget exceeded",
                "computational budget exceeded",
                "exceeded cus meter",
                "insufficient funds for compute",
                "transaction underpriced",
                "less than block base fee",
            ],
            FailureReason::ComputeBudgetExceeded,
        ),
        (
            &[
                "block height exceeded",
                "blockhash not found",
                "failed to get recent blockhash",
                "blockhash expired",
            ],
            FailureReason::BlockhashExpired,
        ),
        (
            &["insufficient funds", "insufficient lamports", "attempt to debit"],
            FailureReason::InsufficientFunds,
        ),
        (
            &["confirmation timeout", "not finalized"],
            FailureReason::ConfirmationTimeout,
        ),
        (
            &["rate limited", "too many requests", "429"],
            FailureReason::RateLimited,
        ),
        (
            &[
                "timeout",
                "timed out",
                "connection refused",
                "connection reset",
                "network error",
                "temporary failure",
                "service unavailable",
                "error sending request",
                "503",
                "502",
            ],
            FailureReason::EndpointUnavailable,
        ),
        (
            &[
                "transaction simulation failed",
                "simulation failed",
                "execution reverted",
            ],
            FailureReason::SimulationFailed,
        ),
        (
            &["instructionerror", "custom program error", "transaction failed"],
            FailureReason::OnChainFailure,
        ),
    ];

    table
        .iter()
        .find(|(patterns, _)| patterns.iter().any(|p| msg.contains(p)))
        .map(|(_, reason)| *reason)
        .unwrap_or(FailureReason::Other)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_is_capped() {
        let config = RetryConfig::new(10, 100).with_max_delay(1000).without_jitter();
        assert_eq!(config.calculate_delay(0), Duration::from_millis(100));
        assert_eq!(config.calculate_delay(2), Duration::from_millis(400));
        assert_eq!(config.calculate_delay(8), Duration::from_millis(1000));
    }

    #[test]
    fn test_compute_budget_wins_over_simulation() {
        assert_eq!(
            classify_failure("Transaction simulation failed: Computational budget exceeded"),
            FailureReason::ComputeBudgetExceeded
        );
        assert_eq!(
            classify_failure("Transaction simulation failed: Error processing Instruction 2"),
            FailureReason::SimulationFailed
        );
    }

    #[test]
    fn test_evm_node_errors() {
        assert_eq!(
            classify_failure("execution reverted: UniswapV2Router: INSUFFICIENT_OUTPUT_AMOUNT"),
            FailureReason::SimulationFailed
        );
        assert_eq!(
            classify_failure("replacement transaction underpriced"),
            FailureReason::ComputeBudgetExceeded
        );
        assert_eq!(
            classify_failure("max fee per gas less than block base fee"),
            FailureReason::ComputeBudgetExceeded
        );
        assert_eq!(
            classify_failure("insufficient funds for gas * price + value"),
            FailureReason::InsufficientFunds
        );
    }
}
