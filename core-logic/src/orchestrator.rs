//! # Cycle Orchestrator
//!
//! Wires the endpoint pool, fee estimator, confirmation tracker and recovery
//! ledger together and drives batches of wallets through them:
//!
//! 1. check the main wallet can pay for the batch
//! 2. generate wallets and journal them in the recovery ledger
//! 3. fund every wallet with one multi-recipient transaction
//! 4. run each wallet's operation on a bounded worker pool
//! 5. drain successful wallets back to the main wallet; hand everything
//!    else to the recovery ledger
//!
//! Batch, cyclic and infinite runs share one loop and differ only in their
//! [`TerminationPolicy`]. A run summary is written on every exit path.

use crate::confirmation::{ConfirmationStatus, ConfirmationTracker};
use crate::config::EngineConfig;
use crate::database::{CycleRow, OutcomeTotals, StatsDatabase, WalletOutcomeRow};
use crate::error::{ConfigError, CoreError, FailureReason};
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::recovery::{RecoveryLedger, RecoveryPassReport, RecoveryRecord};
use crate::security::KeySealer;
use crate::submitter::{Submission, Submitter, TxPlan};
use crate::traits::{ChainClient, OperationRequest, WalletHandle};
use crate::utils::fee_manager::{FeeEstimator, PriorityLevel, TransactionShape};
use crate::utils::logger::TX_RESULT_TARGET;
use crate::utils::persist::write_json_atomic;
use crate::utils::rpc_manager::{EndpointHealth, EndpointPool, EndpointRole};
use crate::utils::runner::ShutdownSignal;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument};

/// How often the stop check runs during an inter-cycle pause.
const STOP_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub wallet_count: usize,
    /// Lamports (or the chain's base unit) sent to each wallet.
    pub amount_per_wallet: u64,
    pub operation: OperationRequest,
    /// `None` follows the estimator's current tier.
    pub priority_level: Option<PriorityLevel>,
}

#[derive(Debug, Clone)]
pub struct InfiniteRequest {
    /// Per-cycle batch; `wallet_count` is the wallets per cycle.
    pub batch: BatchRequest,
    pub pause: Duration,
    pub max_runtime: Option<Duration>,
    pub target_successes: Option<u64>,
}

/// Composable stop conditions. A run ends when any of them is met.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminationPolicy {
    pub max_wallets: Option<u64>,
    pub max_cycles: Option<u64>,
    pub max_runtime: Option<Duration>,
    pub target_successes: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Batch,
    Cyclic,
    Infinite,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Batch => "batch",
            RunMode::Cyclic => "cyclic",
            RunMode::Infinite => "infinite",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StopReason {
    Completed,
    StopSignal,
    StopFile,
    TimeBudget,
    TargetReached,
    Forced,
    Aborted { error: String },
}

/// Statistics of one closed cycle.
#[derive(Debug, Clone, Serialize)]
pub struct BatchCycle {
    pub cycle_index: u64,
    pub wallets_used: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub successes: u64,
    pub failures: u64,
    /// Failed wallets that may still hold funds.
    pub queued_for_recovery: u64,
    pub funding_signature: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub stop_reason: StopReason,
    pub total_cycles: u64,
    pub total_wallets: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub success_rate: f64,
    pub runtime_hours: f64,
    pub tx_per_hour: f64,
    pub recovered_wallets: u64,
    pub unresolved_wallets: usize,
    pub cycles: Vec<BatchCycle>,
    pub metrics: MetricsSnapshot,
}

impl RunSummary {
    fn new(mode: RunMode, started_at: DateTime<Utc>, metrics: MetricsSnapshot) -> Self {
        Self {
            mode,
            started_at,
            ended_at: started_at,
            stop_reason: StopReason::Completed,
            total_cycles: 0,
            total_wallets: 0,
            total_successes: 0,
            total_failures: 0,
            success_rate: 0.0,
            runtime_hours: 0.0,
            tx_per_hour: 0.0,
            recovered_wallets: 0,
            unresolved_wallets: 0,
            cycles: Vec::new(),
            metrics,
        }
    }

    fn push(&mut self, cycle: BatchCycle) {
        self.total_cycles += 1;
        self.total_wallets += cycle.wallets_used;
        self.total_successes += cycle.successes;
        self.total_failures += cycle.failures;
        self.cycles.push(cycle);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub pending_confirmations: usize,
    pub success_rate: f64,
    pub endpoint_health: Vec<EndpointHealth>,
    pub fee_level: PriorityLevel,
    pub recovery_mode: bool,
    pub unresolved_recoveries: usize,
}

/// Lifetime totals read back from the statistics database.
#[derive(Debug, Clone, Serialize)]
pub struct RunHistory {
    pub wallets: OutcomeTotals,
    pub cycles: u64,
}

/// Terminal state of one wallet within a cycle.
#[derive(Debug)]
enum WalletOutcome {
    /// Operation confirmed and funds drained back.
    Succeeded { signature: String },
    /// Operation confirmed but the drain failed; the wallet is queued.
    SucceededQueued { signature: String },
    Queued { reason: FailureReason },
    /// Forced shutdown; the journal entry stays in flight.
    Abandoned,
}

impl WalletOutcome {
    fn operation_succeeded(&self) -> bool {
        matches!(
            self,
            WalletOutcome::Succeeded { .. } | WalletOutcome::SucceededQueued { .. }
        )
    }

    fn queued(&self) -> bool {
        matches!(
            self,
            WalletOutcome::SucceededQueued { .. } | WalletOutcome::Queued { .. }
        )
    }
}

/// Everything a per-wallet task needs, cloned into each task.
struct WalletWorker<C: ChainClient> {
    submitter: Submitter<C>,
    ledger: RecoveryLedger,
    metrics: Arc<MetricsCollector>,
    stats: Option<Arc<StatsDatabase>>,
    request: Arc<BatchRequest>,
    verify_balance: bool,
    forced: CancellationToken,
    cycle_index: u64,
}

impl<C: ChainClient> Clone for WalletWorker<C> {
    fn clone(&self) -> Self {
        Self {
            submitter: self.submitter.clone(),
            ledger: self.ledger.clone(),
            metrics: Arc::clone(&self.metrics),
            stats: self.stats.clone(),
            request: Arc::clone(&self.request),
            verify_balance: self.verify_balance,
            forced: self.forced.clone(),
            cycle_index: self.cycle_index,
        }
    }
}

impl<C: ChainClient> WalletWorker<C> {
    async fn run(
        self,
        wallet: WalletHandle,
        record: RecoveryRecord,
    ) -> Result<WalletOutcome, CoreError> {
        let started = Instant::now();
        let forced = self.forced.clone();

        let outcome = tokio::select! {
            _ = forced.cancelled() => Ok(WalletOutcome::Abandoned),
            outcome = self.process(&wallet, record) => outcome,
        };

        if let Ok(outcome) = &outcome {
            self.report(&wallet, outcome, started.elapsed());
        }
        outcome
    }

    async fn process(
        &self,
        wallet: &WalletHandle,
        record: RecoveryRecord,
    ) -> Result<WalletOutcome, CoreError> {
        let request = &self.request;

        if self.verify_balance {
            if let Some(reason) = self.verify_funding(wallet).await {
                return self.queue(record, reason, "funding not visible").await;
            }
        }

        let shape = self
            .submitter
            .chain()
            .operation_shape(&request.operation);
        let plan = TxPlan::Operation {
            wallet,
            request: &request.operation,
        };

        let outcome = match self
            .submitter
            .submit_and_confirm(plan, wallet.index, request.priority_level, shape)
            .await
        {
            Ok(Some(outcome)) => outcome,
            Ok(None) => return self.queue(record, FailureReason::Other, "nothing submitted").await,
            Err(e) => {
                let reason = e.failure_reason();
                return self.queue(record, reason, e.to_string()).await;
            }
        };

        if !outcome.is_confirmed() {
            let reason = outcome
                .failure_reason()
                .unwrap_or(FailureReason::ConfirmationTimeout);
            let detail = match &outcome.status {
                ConfirmationStatus::Failed(msg) => msg.clone(),
                _ => format!("{} not finalized", outcome.signature),
            };
            return self.queue(record, reason, detail).await;
        }

        let signature = outcome.signature;
        match self
            .submitter
            .settle_wallet(wallet, request.operation.token.as_deref())
            .await
        {
            Ok(()) => {
                self.ledger.complete(wallet.index).await?;
                Ok(WalletOutcome::Succeeded { signature })
            }
            Err(e) => {
                warn!("Wallet {} operation confirmed but drain FAILED: {}", wallet.index, e);
                let held = self.token_balance(wallet).await;
                self.ledger
                    .enqueue(
                        record
                            .failed(e.failure_reason(), e.to_string())
                            .with_token_balance(held),
                    )
                    .await?;
                Ok(WalletOutcome::SucceededQueued { signature })
            }
        }
    }

    /// Best-effort token balance for the recovery record.
    async fn token_balance(&self, wallet: &WalletHandle) -> u64 {
        let Some(token) = self.request.operation.token.as_deref() else {
            return 0;
        };
        let endpoint = self.submitter.pool().next_endpoint(EndpointRole::Alternative);
        self.submitter
            .chain()
            .token_balance(&wallet.public_key, token, &endpoint)
            .await
            .unwrap_or_default()
    }

    /// Returns a failure reason when the wallet's funding is not visible.
    async fn verify_funding(&self, wallet: &WalletHandle) -> Option<FailureReason> {
        let pool = self.submitter.pool();
        let endpoint = pool.next_endpoint(EndpointRole::Primary);
        match self
            .submitter
            .chain()
            .native_balance(&wallet.public_key, &endpoint)
            .await
        {
            Ok(balance) => {
                pool.report_outcome(&endpoint, true);
                (balance < self.request.amount_per_wallet).then(|| {
                    warn!(
                        "Wallet {} holds {} of {} expected; skipping",
                        wallet.index, balance, self.request.amount_per_wallet
                    );
                    FailureReason::InsufficientFunds
                })
            }
            Err(e) => {
                pool.report_outcome(&endpoint, false);
                warn!("Balance check for wallet {} failed, proceeding: {}", wallet.index, e);
                None
            }
        }
    }

    async fn queue(
        &self,
        record: RecoveryRecord,
        reason: FailureReason,
        detail: impl Into<String>,
    ) -> Result<WalletOutcome, CoreError> {
        self.ledger.enqueue(record.failed(reason, detail)).await?;
        Ok(WalletOutcome::Queued { reason })
    }

    fn report(&self, wallet: &WalletHandle, outcome: &WalletOutcome, elapsed: Duration) {
        let success = outcome.operation_succeeded();
        let (signature, failure_reason) = match outcome {
            WalletOutcome::Succeeded { signature } => {
                info!(
                    target: TX_RESULT_TARGET,
                    "[Cycle {}] Wallet {} SUCCESS ({:.1}s): {}",
                    self.cycle_index,
                    wallet.index,
                    elapsed.as_secs_f64(),
                    signature
                );
                (Some(signature.clone()), None)
            }
            WalletOutcome::SucceededQueued { signature } => {
                info!(
                    target: TX_RESULT_TARGET,
                    "[Cycle {}] Wallet {} SUCCESS, drain queued for RECOVERY: {}",
                    self.cycle_index,
                    wallet.index,
                    signature
                );
                (Some(signature.clone()), None)
            }
            WalletOutcome::Queued { reason } => {
                warn!(
                    target: TX_RESULT_TARGET,
                    "[Cycle {}] Wallet {} FAILED ({}), queued for RECOVERY",
                    self.cycle_index,
                    wallet.index,
                    reason
                );
                (None, Some(reason.as_str().to_string()))
            }
            WalletOutcome::Abandoned => {
                warn!(
                    target: TX_RESULT_TARGET,
                    "[Cycle {}] Wallet {} abandoned by forced shutdown",
                    self.cycle_index,
                    wallet.index
                );
                (None, Some(FailureReason::Interrupted.as_str().to_string()))
            }
        };

        self.metrics.record_wallet(success);
        if let Some(stats) = &self.stats {
            let row = WalletOutcomeRow {
                cycle_index: self.cycle_index,
                wallet_index: wallet.index,
                public_key: wallet.public_key.clone(),
                success,
                failure_reason,
                signature,
                duration_ms: elapsed.as_millis() as u64,
                timestamp: Utc::now().timestamp(),
            };
            if let Err(e) = stats.queue_outcome(row) {
                warn!("Statistics unavailable: {}", e);
            }
        }
    }
}

/// Result of funding a batch.
enum Funding {
    Confirmed(String),
    /// Funds never left the main wallet.
    NotSent(FailureReason),
    /// Funds may have arrived; every wallet goes to recovery.
    Unknown(FailureReason),
}

/// Funding stopped on an error the cycle cannot absorb.
struct FundingAbort {
    error: CoreError,
    funds_may_have_moved: bool,
}

pub struct Orchestrator<C: ChainClient> {
    config: EngineConfig,
    chain: Arc<C>,
    pool: Arc<EndpointPool>,
    fees: Arc<FeeEstimator>,
    confirmations: ConfirmationTracker<C>,
    submitter: Submitter<C>,
    ledger: RecoveryLedger,
    ledger_task: JoinHandle<()>,
    metrics: Arc<MetricsCollector>,
    stats: Option<Arc<StatsDatabase>>,
    shutdown: ShutdownSignal,
    refresh_cancel: CancellationToken,
    refresh_task: JoinHandle<()>,
    next_wallet_index: AtomicU64,
    next_cycle_index: AtomicU64,
}

impl<C: ChainClient> Orchestrator<C> {
    /// Validates the configuration, opens the recovery ledger and starts the
    /// background tasks (fee refresh, recovery worker).
    pub async fn start(
        config: EngineConfig,
        chain: Arc<C>,
        sealer: Option<KeySealer>,
        shutdown: ShutdownSignal,
    ) -> Result<Self, CoreError> {
        config.validate()?;

        let pool = Arc::new(EndpointPool::new(&config.endpoints)?);
        let metrics = Arc::new(MetricsCollector::default());
        let fees = Arc::new(FeeEstimator::new(config.fees.clone()));
        let confirmations = ConfirmationTracker::new(
            Arc::clone(&chain),
            Arc::clone(&pool),
            Arc::clone(&fees),
            Arc::clone(&metrics),
            config.confirmation.clone(),
        );
        let submitter = Submitter::new(
            Arc::clone(&chain),
            Arc::clone(&pool),
            Arc::clone(&fees),
            confirmations.clone(),
            Arc::clone(&metrics),
            config.orchestrator.max_submit_attempts,
        );

        let (ledger, ledger_task) = RecoveryLedger::open(
            config.recovery.clone(),
            Arc::new(submitter.clone()),
            Arc::clone(&metrics),
            sealer.map(Arc::new),
        )
        .await?;

        let stats = match &config.storage.stats_db {
            Some(path) => match StatsDatabase::open(path, &config.storage).await {
                Ok(db) => Some(Arc::new(db)),
                Err(e) => {
                    warn!("Statistics database disabled: {:#}", e);
                    None
                }
            },
            None => None,
        };

        let refresh_cancel = CancellationToken::new();
        let refresh_task = Arc::clone(&fees).spawn_refresh_loop(
            Arc::clone(&chain),
            Arc::clone(&pool),
            refresh_cancel.clone(),
        );

        let next_wallet_index = AtomicU64::new(ledger.next_wallet_index());

        info!(
            "Engine started for main wallet {}: {} healthy endpoint(s), {} unresolved recovery record(s)",
            chain.main_public_key(),
            pool.healthy_count(),
            ledger.unresolved_count()
        );

        Ok(Self {
            config,
            chain,
            pool,
            fees,
            confirmations,
            submitter,
            ledger,
            ledger_task,
            metrics,
            stats,
            shutdown,
            refresh_cancel,
            refresh_task,
            next_wallet_index,
            next_cycle_index: AtomicU64::new(0),
        })
    }

    pub fn ledger(&self) -> &RecoveryLedger {
        &self.ledger
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn fees(&self) -> &Arc<FeeEstimator> {
        &self.fees
    }

    pub fn pool(&self) -> &Arc<EndpointPool> {
        &self.pool
    }

    pub fn get_status(&self) -> StatusReport {
        let fee_state = self.fees.snapshot();
        StatusReport {
            pending_confirmations: self.confirmations.pending(),
            success_rate: self.metrics.success_rate(),
            endpoint_health: self.pool.health_snapshot(),
            fee_level: fee_state.current_level,
            recovery_mode: fee_state.recovery_mode,
            unresolved_recoveries: self.ledger.unresolved_count(),
        }
    }

    /// Totals across every run recorded in the statistics database. `None`
    /// when statistics are disabled or unreadable.
    pub async fn history(&self) -> Option<RunHistory> {
        let stats = self.stats.as_ref()?;
        let totals = stats.outcome_totals().await;
        let cycles = stats.cycle_count().await;
        match (totals, cycles) {
            (Ok(wallets), Ok(cycles)) => Some(RunHistory { wallets, cycles }),
            (Err(e), _) | (_, Err(e)) => {
                warn!("Statistics unavailable: {:#}", e);
                None
            }
        }
    }

    /// One batch.
    pub async fn run_batch(&self, request: BatchRequest) -> Result<BatchCycle, CoreError> {
        let policy = TerminationPolicy {
            max_cycles: Some(1),
            ..TerminationPolicy::default()
        };
        let started_at = Utc::now();
        let summary = self
            .run_loop(RunMode::Batch, &request, Duration::ZERO, policy, &|| false)
            .await?;

        Ok(summary.cycles.into_iter().next().unwrap_or(BatchCycle {
            cycle_index: 0,
            wallets_used: 0,
            started_at,
            ended_at: Utc::now(),
            successes: 0,
            failures: 0,
            queued_for_recovery: 0,
            funding_signature: None,
        }))
    }

    /// Batches of `request.wallet_count` until `total_wallets` have been used.
    pub async fn run_cycles(
        &self,
        request: BatchRequest,
        total_wallets: u64,
        pause: Duration,
    ) -> Result<RunSummary, CoreError> {
        let policy = TerminationPolicy {
            max_wallets: Some(total_wallets),
            ..TerminationPolicy::default()
        };
        self.run_loop(RunMode::Cyclic, &request, pause, policy, &|| false)
            .await
    }

    /// Cycles until a stop signal, `stop_check`, the time budget or the
    /// success target ends the run.
    pub async fn run_infinite(
        &self,
        request: InfiniteRequest,
        stop_check: impl Fn() -> bool + Send + Sync,
    ) -> Result<RunSummary, CoreError> {
        let policy = TerminationPolicy {
            max_runtime: request.max_runtime,
            target_successes: request.target_successes,
            ..TerminationPolicy::default()
        };
        self.run_loop(
            RunMode::Infinite,
            &request.batch,
            request.pause,
            policy,
            &stop_check,
        )
        .await
    }

    fn stop_reason(
        &self,
        policy: &TerminationPolicy,
        summary: &RunSummary,
        started: Instant,
        stop_check: &(dyn Fn() -> bool + Send + Sync),
    ) -> Option<StopReason> {
        if self.shutdown.is_forced() {
            return Some(StopReason::Forced);
        }
        if self.shutdown.is_stopping() {
            return Some(StopReason::StopSignal);
        }
        if stop_check() {
            return Some(StopReason::StopFile);
        }
        if policy.max_runtime.is_some_and(|budget| started.elapsed() >= budget) {
            return Some(StopReason::TimeBudget);
        }
        if policy
            .target_successes
            .is_some_and(|target| summary.total_successes >= target)
        {
            return Some(StopReason::TargetReached);
        }
        if policy.max_cycles.is_some_and(|max| summary.total_cycles >= max)
            || policy.max_wallets.is_some_and(|max| summary.total_wallets >= max)
        {
            return Some(StopReason::Completed);
        }
        None
    }

    async fn run_loop(
        &self,
        mode: RunMode,
        request: &BatchRequest,
        pause: Duration,
        policy: TerminationPolicy,
        stop_check: &(dyn Fn() -> bool + Send + Sync),
    ) -> Result<RunSummary, CoreError> {
        if request.wallet_count == 0 {
            return Err(ConfigError::InvalidValue {
                field: "wallet_count".to_string(),
                reason: "must be at least 1".to_string(),
            }
            .into());
        }

        let started = Instant::now();
        let mut summary = RunSummary::new(mode, Utc::now(), self.metrics.snapshot());
        let mut failure = None;

        info!(
            "Starting {} run: {} wallet(s) per cycle, {} per wallet",
            mode.as_str(),
            request.wallet_count,
            request.amount_per_wallet
        );

        let reason = loop {
            if let Some(reason) = self.stop_reason(&policy, &summary, started, stop_check) {
                break reason;
            }

            let remaining = policy
                .max_wallets
                .map(|max| max.saturating_sub(summary.total_wallets))
                .unwrap_or(u64::MAX);
            let count = (request.wallet_count as u64).min(remaining) as usize;
            let cycle_index = self.next_cycle_index.fetch_add(1, Ordering::SeqCst);

            let cycle = self
                .run_cycle(cycle_index, count, request)
                .instrument(tracing::info_span!("cycle", index = cycle_index))
                .await;

            match cycle {
                Ok(cycle) => {
                    info!(
                        "Cycle {} done: {} success, {} failed, {} queued for recovery",
                        cycle.cycle_index, cycle.successes, cycle.failures, cycle.queued_for_recovery
                    );
                    summary.push(cycle);
                }
                Err(e) => {
                    error!("Run aborted in cycle {}: {}", cycle_index, e);
                    let reason = StopReason::Aborted {
                        error: e.to_string(),
                    };
                    failure = Some(e);
                    break reason;
                }
            }

            if self.stop_reason(&policy, &summary, started, stop_check).is_none() && !pause.is_zero() {
                info!("Pausing {:?} before next cycle", pause);
                self.pause(pause, stop_check).await;
            }
        };

        let elapsed = started.elapsed();
        summary.ended_at = Utc::now();
        summary.stop_reason = reason;
        summary.runtime_hours = elapsed.as_secs_f64() / 3600.0;
        summary.tx_per_hour = if summary.runtime_hours > 0.0 {
            summary.total_successes as f64 / summary.runtime_hours
        } else {
            0.0
        };
        summary.success_rate = if summary.total_wallets > 0 {
            summary.total_successes as f64 / summary.total_wallets as f64 * 100.0
        } else {
            0.0
        };
        summary.recovered_wallets = self.metrics.recovered();
        summary.unresolved_wallets = self.ledger.unresolved_count();
        summary.metrics = self.metrics.snapshot();

        self.write_summary(&summary).await;
        info!(
            "Run finished ({:?}): {} cycle(s), {} success, {} failed",
            summary.stop_reason, summary.total_cycles, summary.total_successes, summary.total_failures
        );

        match failure {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    async fn pause(&self, duration: Duration, stop_check: &(dyn Fn() -> bool + Send + Sync)) {
        let deadline = Instant::now() + duration;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() || stop_check() {
                return;
            }
            if !self.shutdown.sleep(left.min(STOP_POLL)).await {
                return;
            }
        }
    }

    fn summary_path(&self, mode: RunMode, started_at: DateTime<Utc>) -> PathBuf {
        match &self.config.orchestrator.summary_file {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(&self.config.orchestrator.summary_dir).join(format!(
                "{}_mode_results_{}.json",
                mode.as_str(),
                started_at.format("%Y%m%d_%H%M%S")
            )),
        }
    }

    async fn write_summary(&self, summary: &RunSummary) {
        let path = self.summary_path(summary.mode, summary.started_at);
        match write_json_atomic(&path, summary).await {
            Ok(()) => info!("Run summary written to {}", path.display()),
            Err(e) => error!("Failed to write run summary {}: {:#}", path.display(), e),
        }
    }

    async fn check_main_balance(&self, required: u64) -> Result<u64, CoreError> {
        let mut last_error = None;
        for _ in 0..self.config.orchestrator.max_submit_attempts {
            let endpoint = self.pool.next_endpoint(EndpointRole::Primary);
            match self.chain.main_balance(&endpoint).await {
                Ok(balance) => {
                    self.pool.report_outcome(&endpoint, true);
                    if balance < required {
                        return Err(ConfigError::MainWalletUnderfunded { balance, required }.into());
                    }
                    return Ok(balance);
                }
                Err(e) => {
                    self.pool.report_outcome(&endpoint, false);
                    warn!("Main balance query via {} failed: {}", endpoint.url, e);
                    last_error = Some(e);
                }
            }
        }
        Err(ConfigError::NoUsableEndpoint {
            reason: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no endpoint answered".to_string()),
        }
        .into())
    }

    async fn fund(&self, wallets: &[WalletHandle], request: &BatchRequest) -> Result<Funding, FundingAbort> {
        let amounts = vec![request.amount_per_wallet; wallets.len()];
        let plan = TxPlan::Funding {
            recipients: wallets,
            amounts: &amounts,
        };
        let first_index = wallets.first().map(|w| w.index).unwrap_or_default();

        let Submission { outcome, ambiguous } = self
            .submitter
            .submit_traced(
                plan,
                request.priority_level,
                TransactionShape::funding(wallets.len()),
            )
            .await;
        // After an unanswered send, no later answer proves the funds stayed put.
        let not_sent = |reason: FailureReason| {
            if ambiguous {
                Funding::Unknown(reason)
            } else {
                Funding::NotSent(reason)
            }
        };

        match outcome {
            Ok(Some(signature)) => {
                let outcome = self.confirmations.register(signature, first_index).wait().await;
                match &outcome.status {
                    ConfirmationStatus::Confirmed => Ok(Funding::Confirmed(outcome.signature)),
                    ConfirmationStatus::Failed(msg) => {
                        warn!("Funding transaction {} failed on-chain: {}", outcome.signature, msg);
                        Ok(not_sent(
                            outcome.failure_reason().unwrap_or(FailureReason::OnChainFailure),
                        ))
                    }
                    ConfirmationStatus::TimedOut | ConfirmationStatus::Pending => {
                        warn!("Funding transaction {} not finalized", outcome.signature);
                        Ok(Funding::Unknown(FailureReason::ConfirmationTimeout))
                    }
                }
            }
            Ok(None) => Ok(not_sent(FailureReason::Other)),
            Err(error) if error.is_fatal() => Err(FundingAbort {
                error,
                funds_may_have_moved: ambiguous,
            }),
            Err(error) => {
                let reason = error.failure_reason();
                warn!("Funding submission FAILED ({}): {}", reason, error);
                match reason {
                    _ if ambiguous => Ok(Funding::Unknown(reason)),
                    // Main wallet cannot pay: configuration-level.
                    FailureReason::InsufficientFunds => Err(FundingAbort {
                        error,
                        funds_may_have_moved: false,
                    }),
                    // The last send may have landed without an answer.
                    reason if reason.is_endpoint_fault() => Ok(Funding::Unknown(reason)),
                    reason => Ok(Funding::NotSent(reason)),
                }
            }
        }
    }

    async fn run_cycle(
        &self,
        cycle_index: u64,
        count: usize,
        request: &BatchRequest,
    ) -> Result<BatchCycle, CoreError> {
        let started_at = Utc::now();
        let timer = Instant::now();

        let required = request
            .amount_per_wallet
            .saturating_mul(count as u64)
            .saturating_add(self.config.orchestrator.main_wallet_reserve);
        let balance = self.check_main_balance(required).await?;
        info!(
            "Cycle {}: funding {} wallet(s), main balance {}",
            cycle_index, count, balance
        );

        let mut wallets = Vec::with_capacity(count);
        for _ in 0..count {
            let index = self.next_wallet_index.fetch_add(1, Ordering::SeqCst);
            wallets.push(self.chain.generate_wallet(index)?);
        }

        // Journal before any funds move.
        let records = self
            .ledger
            .records_for(&wallets, cycle_index, request.operation.token.clone())
            .await?;
        self.ledger.track(records.clone()).await?;

        let funding = match self.fund(&wallets, request).await {
            Ok(funding) => funding,
            Err(abort) => {
                // Entries stay in flight and are recovered on the next start.
                if !abort.funds_may_have_moved {
                    self.release(&wallets).await?;
                }
                return Err(abort.error);
            }
        };

        let mut cycle = BatchCycle {
            cycle_index,
            wallets_used: count as u64,
            started_at,
            ended_at: started_at,
            successes: 0,
            failures: 0,
            queued_for_recovery: 0,
            funding_signature: None,
        };

        match funding {
            Funding::Confirmed(signature) => {
                info!(target: TX_RESULT_TARGET, "[Cycle {}] Funding SUCCESS: {}", cycle_index, signature);
                cycle.funding_signature = Some(signature);
                self.run_wallets(&mut cycle, wallets, records, request).await?;
            }
            Funding::NotSent(reason) => {
                warn!(target: TX_RESULT_TARGET, "[Cycle {}] Funding FAILED ({}), no funds moved", cycle_index, reason);
                self.release(&wallets).await?;
                cycle.failures = count as u64;
                for _ in 0..count {
                    self.metrics.record_wallet(false);
                }
            }
            Funding::Unknown(reason) => {
                warn!(
                    target: TX_RESULT_TARGET,
                    "[Cycle {}] Funding outcome unknown ({}), {} wallet(s) queued for RECOVERY",
                    cycle_index, reason, count
                );
                for record in records {
                    self.ledger
                        .enqueue(record.failed(reason, "funding outcome unknown"))
                        .await?;
                    self.metrics.record_wallet(false);
                }
                cycle.failures = count as u64;
                cycle.queued_for_recovery = count as u64;
            }
        }

        cycle.ended_at = Utc::now();
        if let Some(stats) = &self.stats {
            let row = CycleRow {
                cycle_index,
                wallets: cycle.wallets_used,
                succeeded: cycle.successes,
                queued_for_recovery: cycle.queued_for_recovery,
                funding_signature: cycle.funding_signature.clone(),
                duration_ms: timer.elapsed().as_millis() as u64,
                timestamp: cycle.ended_at.timestamp(),
            };
            if let Err(e) = stats.record_cycle(&row).await {
                warn!("Cycle statistics not recorded: {:#}", e);
            }
        }
        Ok(cycle)
    }

    /// Drops journal entries of wallets that never received funds.
    async fn release(&self, wallets: &[WalletHandle]) -> Result<(), CoreError> {
        for wallet in wallets {
            self.ledger.complete(wallet.index).await?;
        }
        Ok(())
    }

    async fn run_wallets(
        &self,
        cycle: &mut BatchCycle,
        wallets: Vec<WalletHandle>,
        records: Vec<RecoveryRecord>,
        request: &BatchRequest,
    ) -> Result<(), CoreError> {
        let worker = WalletWorker {
            submitter: self.submitter.clone(),
            ledger: self.ledger.clone(),
            metrics: Arc::clone(&self.metrics),
            stats: self.stats.clone(),
            request: Arc::new(request.clone()),
            verify_balance: !self.config.orchestrator.trust_funding_confirmation,
            forced: self.shutdown.forced_token(),
            cycle_index: cycle.cycle_index,
        };
        let semaphore = Arc::new(Semaphore::new(self.config.orchestrator.max_parallel_wallets));
        let mut set = JoinSet::new();

        for (wallet, record) in wallets.into_iter().zip(records) {
            let worker = worker.clone();
            let semaphore = Arc::clone(&semaphore);
            let span = tracing::info_span!("wallet", index = wallet.index);
            set.spawn(
                async move {
                    let _permit = semaphore.acquire_owned().await;
                    worker.run(wallet, record).await
                }
                .instrument(span),
            );
        }

        let mut persistence_error = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(outcome)) => {
                    if outcome.operation_succeeded() {
                        cycle.successes += 1;
                    } else {
                        cycle.failures += 1;
                    }
                    if outcome.queued() {
                        cycle.queued_for_recovery += 1;
                    }
                }
                Ok(Err(e)) => {
                    // Ledger write failed; the worker already logged it loudly.
                    cycle.failures += 1;
                    persistence_error.get_or_insert(e);
                }
                Err(e) => {
                    // Journal entry stays in flight and is recovered on restart.
                    error!("Wallet task panicked: {}", e);
                    cycle.failures += 1;
                }
            }
        }

        match persistence_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Runs a recovery pass now.
    pub async fn recover_now(&self) -> Result<RecoveryPassReport, CoreError> {
        self.ledger.recover_now().await
    }

    /// Stops background tasks. A graceful stop waits for in-flight
    /// confirmations and the running recovery attempt.
    pub async fn shutdown(self) {
        self.refresh_cancel.cancel();
        let _ = self.refresh_task.await;

        if !self.shutdown.is_forced() && self.confirmations.pending() > 0 {
            info!(
                "Waiting for {} in-flight confirmation(s)...",
                self.confirmations.pending()
            );
            let forced = self.shutdown.forced_token();
            tokio::select! {
                _ = self.confirmations.drain() => {}
                _ = forced.cancelled() => {
                    warn!("Forced stop: abandoning in-flight confirmations");
                }
            }
        }

        if self.shutdown.is_forced() {
            // Only the current attempt is cut short; the file is consistent.
            let _ = tokio::time::timeout(Duration::from_secs(5), self.ledger.close()).await;
        } else {
            self.ledger.close().await;
            let _ = self.ledger_task.await;
        }

        if let Some(stats) = self.stats {
            match Arc::try_unwrap(stats) {
                Ok(db) => {
                    if let Err(e) = db.shutdown().await {
                        warn!("Statistics shutdown failed: {:#}", e);
                    }
                }
                Err(_) => warn!("Statistics database still shared; skipping final flush"),
            }
        }
    }
}
