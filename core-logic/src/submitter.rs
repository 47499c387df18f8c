//! Submission with fee escalation and endpoint failover, shared by the
//! orchestrator and the recovery worker.

use crate::confirmation::{ConfirmationOutcome, ConfirmationTracker};
use crate::error::{CoreError, FailureReason};
use crate::metrics::MetricsCollector;
use crate::traits::{ChainClient, OperationRequest, TxSigner, WalletHandle};
use crate::utils::fee_manager::{FeeEstimator, PriorityLevel, TransactionShape};
use crate::utils::rpc_manager::{Endpoint, EndpointPool, EndpointRole};
use std::sync::Arc;
use tracing::{debug, warn};

/// What to build on each attempt. Rebuilt per attempt so the escalated fee
/// and a fresh blockhash are used.
#[derive(Debug, Clone, Copy)]
pub enum TxPlan<'a> {
    Funding {
        recipients: &'a [WalletHandle],
        amounts: &'a [u64],
    },
    Operation {
        wallet: &'a WalletHandle,
        request: &'a OperationRequest,
    },
    Sell {
        wallet: &'a WalletHandle,
        token: &'a str,
        amount: u64,
    },
    Sweep {
        wallet: &'a WalletHandle,
    },
}

impl<'a> TxPlan<'a> {
    pub fn label(&self) -> &'static str {
        match self {
            TxPlan::Funding { .. } => "funding",
            TxPlan::Operation { .. } => "operation",
            TxPlan::Sell { .. } => "sell",
            TxPlan::Sweep { .. } => "sweep",
        }
    }

    fn signers(&self) -> Vec<TxSigner<'a>> {
        match *self {
            TxPlan::Funding { .. } => vec![TxSigner::Main],
            TxPlan::Operation { wallet, request } if request.use_multisig => {
                vec![TxSigner::Wallet(wallet), TxSigner::Main]
            }
            TxPlan::Operation { wallet, .. }
            | TxPlan::Sell { wallet, .. }
            | TxPlan::Sweep { wallet } => vec![TxSigner::Wallet(wallet)],
        }
    }

    async fn build<C: ChainClient>(
        &self,
        chain: &C,
        fee: u64,
        endpoint: &Endpoint,
    ) -> Result<Option<C::Transaction>, CoreError> {
        match *self {
            TxPlan::Funding {
                recipients,
                amounts,
            } => chain
                .build_funding_transaction(recipients, amounts, fee, endpoint)
                .await
                .map(Some),
            TxPlan::Operation { wallet, request } => chain
                .build_operation_transaction(wallet, request, fee, endpoint)
                .await
                .map(Some),
            TxPlan::Sell {
                wallet,
                token,
                amount,
            } => chain
                .build_sell_transaction(wallet, token, amount, fee, endpoint)
                .await
                .map(Some),
            TxPlan::Sweep { wallet } => chain.build_sweep_transaction(wallet, fee, endpoint).await,
        }
    }
}

/// Result of [`Submitter::submit_traced`].
#[derive(Debug)]
pub struct Submission {
    pub outcome: Result<Option<String>, CoreError>,
    /// Some attempt was sent and the endpoint failed before answering, so it
    /// may have landed regardless of `outcome`.
    pub ambiguous: bool,
}

pub struct Submitter<C: ChainClient> {
    chain: Arc<C>,
    pool: Arc<EndpointPool>,
    fees: Arc<FeeEstimator>,
    confirmations: ConfirmationTracker<C>,
    metrics: Arc<MetricsCollector>,
    max_attempts: u32,
}

impl<C: ChainClient> Clone for Submitter<C> {
    fn clone(&self) -> Self {
        Self {
            chain: Arc::clone(&self.chain),
            pool: Arc::clone(&self.pool),
            fees: Arc::clone(&self.fees),
            confirmations: self.confirmations.clone(),
            metrics: Arc::clone(&self.metrics),
            max_attempts: self.max_attempts,
        }
    }
}

impl<C: ChainClient> Submitter<C> {
    pub fn new(
        chain: Arc<C>,
        pool: Arc<EndpointPool>,
        fees: Arc<FeeEstimator>,
        confirmations: ConfirmationTracker<C>,
        metrics: Arc<MetricsCollector>,
        max_attempts: u32,
    ) -> Self {
        Self {
            chain,
            pool,
            fees,
            confirmations,
            metrics,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn chain(&self) -> &Arc<C> {
        &self.chain
    }

    pub fn pool(&self) -> &Arc<EndpointPool> {
        &self.pool
    }

    pub fn fees(&self) -> &Arc<FeeEstimator> {
        &self.fees
    }

    pub fn confirmations(&self) -> &ConfirmationTracker<C> {
        &self.confirmations
    }

    /// Builds, signs and submits `plan`, escalating the fee and failing over
    /// endpoints between attempts. `Ok(None)` when there was nothing to send.
    pub async fn submit(
        &self,
        plan: TxPlan<'_>,
        level: Option<PriorityLevel>,
        shape: TransactionShape,
    ) -> Result<Option<String>, CoreError> {
        self.submit_traced(plan, level, shape).await.outcome
    }

    /// Like [`Submitter::submit`], but also reports whether an earlier send
    /// may have reached the network without an answer.
    pub async fn submit_traced(
        &self,
        plan: TxPlan<'_>,
        level: Option<PriorityLevel>,
        shape: TransactionShape,
    ) -> Submission {
        let signers = plan.signers();
        let mut fee = self.fees.estimate(level, shape);
        let mut last_error = None;
        let mut ambiguous = false;

        for attempt in 1..=self.max_attempts {
            let endpoint = self.pool.next_endpoint(EndpointRole::Primary);

            let (result, sent) = match plan.build(self.chain.as_ref(), fee, &endpoint).await {
                Ok(None) => {
                    return Submission {
                        outcome: Ok(None),
                        ambiguous,
                    }
                }
                Ok(Some(tx)) => (
                    self.chain.sign_and_submit(tx, &signers, &endpoint).await,
                    true,
                ),
                Err(e) => (Err(e), false),
            };

            match result {
                Ok(signature) => {
                    self.pool.report_outcome(&endpoint, true);
                    self.metrics.record_submission(true);
                    debug!(
                        "{} submitted via {} (fee {}, attempt {}): {}",
                        plan.label(),
                        endpoint.url,
                        fee,
                        attempt,
                        signature
                    );
                    return Submission {
                        outcome: Ok(Some(signature)),
                        ambiguous,
                    };
                }
                Err(e) => {
                    let reason = e.failure_reason();
                    self.pool.report_outcome(&endpoint, !reason.is_endpoint_fault());
                    self.metrics.record_submission(false);

                    // The request left us; the reply did not come back.
                    if sent && reason.is_endpoint_fault() {
                        ambiguous = true;
                    }
                    if e.is_fatal() || reason == FailureReason::InsufficientFunds {
                        return Submission {
                            outcome: Err(e),
                            ambiguous,
                        };
                    }
                    // Endpoint trouble says nothing about the fee.
                    if !reason.is_endpoint_fault() {
                        fee = self.fees.handle_failure(reason, shape);
                    }
                    warn!(
                        "{} attempt {}/{} via {} FAILED ({}): {}",
                        plan.label(),
                        attempt,
                        self.max_attempts,
                        endpoint.url,
                        reason,
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        Submission {
            outcome: Err(last_error.unwrap_or_else(|| CoreError::chain("no submission attempt made"))),
            ambiguous,
        }
    }

    /// Submits and waits for a terminal confirmation.
    pub async fn submit_and_confirm(
        &self,
        plan: TxPlan<'_>,
        wallet_index: u64,
        level: Option<PriorityLevel>,
        shape: TransactionShape,
    ) -> Result<Option<ConfirmationOutcome>, CoreError> {
        match self.submit(plan, level, shape).await? {
            Some(signature) => Ok(Some(
                self.confirmations.register(signature, wallet_index).wait().await,
            )),
            None => Ok(None),
        }
    }

    /// Returns a wallet's value to the main wallet: sells any token balance,
    /// then sweeps the native balance.
    pub async fn settle_wallet(
        &self,
        wallet: &WalletHandle,
        token: Option<&str>,
    ) -> Result<(), CoreError> {
        if let Some(token) = token {
            let endpoint = self.pool.next_endpoint(EndpointRole::Primary);
            let balance = self
                .chain
                .token_balance(&wallet.public_key, token, &endpoint)
                .await
                .inspect_err(|_| self.pool.report_outcome(&endpoint, false))?;

            if balance > 0 {
                let plan = TxPlan::Sell {
                    wallet,
                    token,
                    amount: balance,
                };
                confirmed_or_err(
                    self.submit_and_confirm(plan, wallet.index, None, TransactionShape::SWAP)
                        .await?,
                )?;
            }
        }

        let plan = TxPlan::Sweep { wallet };
        match self
            .submit_and_confirm(plan, wallet.index, None, TransactionShape::TRANSFER)
            .await?
        {
            Some(outcome) => confirmed_or_err(Some(outcome)),
            None => {
                debug!("Wallet {} has nothing left to sweep", wallet.index);
                Ok(())
            }
        }
    }
}

fn confirmed_or_err(outcome: Option<ConfirmationOutcome>) -> Result<(), CoreError> {
    match outcome {
        Some(outcome) if !outcome.is_confirmed() => Err(match outcome.failure_reason() {
            Some(FailureReason::ConfirmationTimeout) | None => CoreError::ConfirmationTimeout {
                signature: outcome.signature,
                attempts: outcome.attempts,
            },
            Some(reason) => CoreError::SubmissionRejected {
                reason,
                message: format!("{} failed on-chain", outcome.signature),
            },
        }),
        _ => Ok(()),
    }
}
