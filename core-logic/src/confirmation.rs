//! # Confirmation Tracker
//!
//! Polls submitted signatures until they are finalized, fail, or run out of
//! retries. Registering returns a handle immediately; each request is driven
//! by its own task so new submissions never wait on old confirmations.
//!
//! Requests are ephemeral. Durability belongs to the recovery ledger.

use crate::config::ConfirmationConfig;
use crate::error::FailureReason;
use crate::metrics::{ConfirmationKind, MetricsCollector};
use crate::traits::{ChainClient, TxStatus};
use crate::utils::fee_manager::{FeeEstimator, TransactionShape};
use crate::utils::retry::classify_failure;
use crate::utils::rpc_manager::{EndpointPool, EndpointRole};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn, Instrument};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationStatus {
    Pending,
    Confirmed,
    /// Explicit on-chain failure. Waiting longer would not change it.
    Failed(String),
    TimedOut,
}

impl ConfirmationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ConfirmationStatus::Pending)
    }
}

/// Per-signature polling state, owned by its poll task.
#[derive(Debug, Clone)]
pub struct ConfirmationRequest {
    pub signature: String,
    pub wallet_index: u64,
    pub submitted_at: Instant,
    pub attempt_count: u32,
    pub max_retries: u32,
    pub next_retry_at: Instant,
    pub status: ConfirmationStatus,
}

#[derive(Debug, Clone)]
pub struct ConfirmationOutcome {
    pub signature: String,
    pub wallet_index: u64,
    pub status: ConfirmationStatus,
    pub attempts: u32,
    pub elapsed: Duration,
}

impl ConfirmationOutcome {
    pub fn is_confirmed(&self) -> bool {
        self.status == ConfirmationStatus::Confirmed
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        match &self.status {
            ConfirmationStatus::Confirmed | ConfirmationStatus::Pending => None,
            ConfirmationStatus::Failed(msg) => Some(match classify_failure(msg) {
                FailureReason::Other => FailureReason::OnChainFailure,
                reason => reason,
            }),
            ConfirmationStatus::TimedOut => Some(FailureReason::ConfirmationTimeout),
        }
    }
}

/// Resolves once the request reaches a terminal state.
#[derive(Debug)]
pub struct ConfirmationHandle {
    signature: String,
    wallet_index: u64,
    rx: oneshot::Receiver<ConfirmationOutcome>,
}

impl ConfirmationHandle {
    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub async fn wait(self) -> ConfirmationOutcome {
        match self.rx.await {
            Ok(outcome) => outcome,
            // Poll task vanished (runtime shutdown); nothing was confirmed.
            Err(_) => ConfirmationOutcome {
                signature: self.signature,
                wallet_index: self.wallet_index,
                status: ConfirmationStatus::TimedOut,
                attempts: 0,
                elapsed: Duration::ZERO,
            },
        }
    }
}

pub struct ConfirmationTracker<C: ChainClient> {
    chain: Arc<C>,
    pool: Arc<EndpointPool>,
    fees: Arc<FeeEstimator>,
    metrics: Arc<MetricsCollector>,
    config: ConfirmationConfig,
    permits: Arc<Semaphore>,
    pending: Arc<watch::Sender<usize>>,
}

impl<C: ChainClient> Clone for ConfirmationTracker<C> {
    fn clone(&self) -> Self {
        Self {
            chain: Arc::clone(&self.chain),
            pool: Arc::clone(&self.pool),
            fees: Arc::clone(&self.fees),
            metrics: Arc::clone(&self.metrics),
            config: self.config.clone(),
            permits: Arc::clone(&self.permits),
            pending: Arc::clone(&self.pending),
        }
    }
}

impl<C: ChainClient> ConfirmationTracker<C> {
    pub fn new(
        chain: Arc<C>,
        pool: Arc<EndpointPool>,
        fees: Arc<FeeEstimator>,
        metrics: Arc<MetricsCollector>,
        config: ConfirmationConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_polls.max(1)));
        let (pending, _) = watch::channel(0usize);
        Self {
            chain,
            pool,
            fees,
            metrics,
            config,
            permits,
            pending: Arc::new(pending),
        }
    }

    /// Delay before poll number `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        let ms = self
            .config
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.config.max_delay_ms.max(self.config.base_delay_ms));
        Duration::from_millis(ms)
    }

    pub fn pending(&self) -> usize {
        *self.pending.borrow()
    }

    /// Waits until every registered request has reached a terminal state.
    pub async fn drain(&self) {
        let mut rx = self.pending.subscribe();
        let _ = rx.wait_for(|count| *count == 0).await;
    }

    /// Starts tracking `signature` and returns without waiting.
    pub fn register(&self, signature: String, wallet_index: u64) -> ConfirmationHandle {
        let now = Instant::now();
        let request = ConfirmationRequest {
            signature: signature.clone(),
            wallet_index,
            submitted_at: now,
            attempt_count: 0,
            max_retries: self.config.max_retries,
            next_retry_at: now + self.delay_for(0),
            status: ConfirmationStatus::Pending,
        };

        let (tx, rx) = oneshot::channel();
        self.pending.send_modify(|count| *count += 1);

        let tracker = self.clone();
        let span = tracing::debug_span!("confirm", wallet = wallet_index);
        tokio::spawn(
            async move {
                let outcome = tracker.poll_until_terminal(request).await;
                tracker.report(&outcome);
                tracker.pending.send_modify(|count| *count = count.saturating_sub(1));
                // Receiver may be gone; the outcome was already reported.
                let _ = tx.send(outcome);
            }
            .instrument(span),
        );

        ConfirmationHandle {
            signature,
            wallet_index,
            rx,
        }
    }

    async fn poll_until_terminal(&self, mut request: ConfirmationRequest) -> ConfirmationOutcome {
        while request.attempt_count < request.max_retries {
            tokio::time::sleep_until(request.next_retry_at).await;
            request.attempt_count += 1;

            let endpoint = self.pool.next_endpoint(EndpointRole::Alternative);
            let result = {
                let _permit = self.permits.acquire().await;
                let started = Instant::now();
                let result = self.chain.query_status(&request.signature, &endpoint).await;
                self.pool.record_latency(&endpoint, started.elapsed());
                result
            };

            match result {
                Ok(status) => {
                    self.pool.report_outcome(&endpoint, true);
                    match status {
                        TxStatus::Confirmed => {
                            request.status = ConfirmationStatus::Confirmed;
                            break;
                        }
                        TxStatus::Failed(reason) => {
                            request.status = ConfirmationStatus::Failed(reason);
                            break;
                        }
                        TxStatus::Pending => {}
                    }
                }
                Err(e) => {
                    self.pool.report_outcome(&endpoint, false);
                    debug!(
                        "Status query for {} via {} failed: {}",
                        request.signature, endpoint.url, e
                    );
                }
            }

            request.next_retry_at = Instant::now() + self.delay_for(request.attempt_count);
        }

        if !request.status.is_terminal() {
            request.status = ConfirmationStatus::TimedOut;
        }

        ConfirmationOutcome {
            signature: request.signature,
            wallet_index: request.wallet_index,
            status: request.status,
            attempts: request.attempt_count,
            elapsed: request.submitted_at.elapsed(),
        }
    }

    fn report(&self, outcome: &ConfirmationOutcome) {
        match &outcome.status {
            ConfirmationStatus::Confirmed => {
                self.fees.handle_success();
                self.metrics
                    .record_confirmation(ConfirmationKind::Confirmed, outcome.elapsed);
            }
            ConfirmationStatus::Failed(reason) => {
                warn!("Transaction {} failed on-chain: {}", outcome.signature, reason);
                let reason = outcome.failure_reason().unwrap_or(FailureReason::OnChainFailure);
                self.fees.handle_failure(reason, TransactionShape::default());
                self.metrics
                    .record_confirmation(ConfirmationKind::Failed, outcome.elapsed);
            }
            ConfirmationStatus::TimedOut | ConfirmationStatus::Pending => {
                warn!(
                    "Transaction {} not finalized after {} polls ({:.1}s)",
                    outcome.signature,
                    outcome.attempts,
                    outcome.elapsed.as_secs_f64()
                );
                self.fees
                    .handle_failure(FailureReason::ConfirmationTimeout, TransactionShape::default());
                self.metrics
                    .record_confirmation(ConfirmationKind::TimedOut, outcome.elapsed);
            }
        }
    }
}
