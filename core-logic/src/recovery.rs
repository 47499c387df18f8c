//! # Recovery Ledger
//!
//! Durable record of every wallet whose funds are not yet back on the main
//! wallet.
//!
//! - Wallets are journaled (`InFlight`) before they are funded, so a crash
//!   at any later point leaves a record behind. On the next start those
//!   entries are promoted to `Unresolved`.
//! - A single background worker owns the ledger file. Every mutation is
//!   applied in memory, then the whole file is rewritten atomically.
//!   Submission paths only send commands.
//! - Resolved records are appended to the archive before they leave the
//!   ledger; nothing is dropped without an audit line.
//! - The same worker runs periodic recovery passes (sell, then sweep) as a
//!   separate task that reports back through the command channel.

use crate::config::RecoveryConfig;
use crate::error::{CoreError, FailureReason, SecurityError};
use crate::metrics::MetricsCollector;
use crate::security::{KeySealer, SealedSecret};
use crate::traits::{ChainClient, WalletHandle};
use crate::submitter::Submitter;
use crate::utils::logger::TX_RESULT_TARGET;
use crate::utils::persist::{append_json_line, write_json_atomic};
use crate::utils::retry::{with_retry, RetryConfig};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

const LEDGER_VERSION: u32 = 1;

#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SecretMaterial {
    Plain { secret: String },
    Sealed(SealedSecret),
}

impl fmt::Debug for SecretMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretMaterial::Plain { .. } => f.write_str("Plain(***REDACTED***)"),
            SecretMaterial::Sealed(_) => f.write_str("Sealed(..)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStage {
    /// Journaled before funding; outcome not known yet.
    InFlight,
    /// Needs recovery.
    Unresolved,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryRecord {
    pub wallet_index: u64,
    pub public_key: String,
    pub private_key_material: SecretMaterial,
    #[serde(default)]
    pub token_mint: Option<String>,
    #[serde(default)]
    pub last_known_token_balance: u64,
    #[serde(default)]
    pub failure_reason: Option<FailureReason>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub attempts_made: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub cycle_index: u64,
    pub stage: RecordStage,
    #[serde(default)]
    pub resolved: bool,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl RecoveryRecord {
    /// Marks the record as needing recovery.
    pub fn failed(mut self, reason: FailureReason, detail: impl Into<String>) -> Self {
        self.stage = RecordStage::Unresolved;
        self.failure_reason = Some(reason);
        self.last_error = Some(detail.into());
        self.updated_at = Utc::now();
        self
    }

    pub fn with_token_balance(mut self, balance: u64) -> Self {
        self.last_known_token_balance = balance;
        self
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LedgerFile {
    version: u32,
    next_wallet_index: u64,
    records: Vec<RecoveryRecord>,
}

#[derive(Debug, Default)]
struct LedgerSnapshot {
    records: BTreeMap<u64, RecoveryRecord>,
    next_wallet_index: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryPassReport {
    pub attempted: usize,
    pub resolved: usize,
    pub failed: usize,
    pub remaining_unresolved: usize,
    /// First ledger write that failed during the pass.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persistence_error: Option<String>,
}

/// Performs one recovery attempt for a wallet.
#[async_trait]
pub trait RecoveryExecutor: Send + Sync + 'static {
    async fn recover(&self, record: &RecoveryRecord, wallet: &WalletHandle)
        -> Result<(), CoreError>;
}

#[async_trait]
impl<C: ChainClient> RecoveryExecutor for Submitter<C> {
    async fn recover(
        &self,
        record: &RecoveryRecord,
        wallet: &WalletHandle,
    ) -> Result<(), CoreError> {
        self.settle_wallet(wallet, record.token_mint.as_deref()).await
    }
}

enum LedgerCommand {
    Track {
        records: Vec<RecoveryRecord>,
        ack: oneshot::Sender<Result<(), CoreError>>,
    },
    Enqueue {
        record: RecoveryRecord,
        ack: oneshot::Sender<Result<bool, CoreError>>,
    },
    Complete {
        wallet_index: u64,
        ack: oneshot::Sender<Result<(), CoreError>>,
    },
    Resolve {
        wallet_index: u64,
        ack: oneshot::Sender<Result<bool, CoreError>>,
    },
    AttemptFinished {
        wallet_index: u64,
        result: Result<(), String>,
    },
    RecoverNow {
        ack: oneshot::Sender<RecoveryPassReport>,
    },
    PassFinished,
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

/// Cloneable handle to the ledger worker.
#[derive(Clone)]
pub struct RecoveryLedger {
    tx: mpsc::Sender<LedgerCommand>,
    snapshot: Arc<RwLock<LedgerSnapshot>>,
    sealer: Option<Arc<KeySealer>>,
}

fn closed() -> CoreError {
    CoreError::PersistenceFailure {
        path: "recovery ledger".to_string(),
        reason: "ledger worker stopped".to_string(),
    }
}

impl RecoveryLedger {
    /// Loads (or creates) the ledger and starts its worker.
    pub async fn open(
        config: RecoveryConfig,
        executor: Arc<dyn RecoveryExecutor>,
        metrics: Arc<MetricsCollector>,
        sealer: Option<Arc<KeySealer>>,
    ) -> Result<(Self, JoinHandle<()>), CoreError> {
        let path = PathBuf::from(&config.recovery_file);
        let mut snapshot = LedgerSnapshot::default();
        let mut promoted = 0usize;

        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
                CoreError::PersistenceFailure {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                }
            })?;
            // A ledger that cannot be parsed is never overwritten.
            let file: LedgerFile =
                serde_json::from_str(&content).map_err(|e| CoreError::PersistenceFailure {
                    path: path.display().to_string(),
                    reason: format!("corrupt ledger, refusing to start: {}", e),
                })?;

            let backup = PathBuf::from(format!(
                "{}.{}.bak",
                path.display(),
                Utc::now().format("%Y%m%d_%H%M%S")
            ));
            if let Err(e) = tokio::fs::copy(&path, &backup).await {
                warn!("Could not back up recovery ledger to {:?}: {}", backup, e);
            } else {
                debug!("Recovery ledger backed up to {:?}", backup);
            }

            snapshot.next_wallet_index = file.next_wallet_index;
            for mut record in file.records {
                if record.stage == RecordStage::InFlight {
                    record.stage = RecordStage::Unresolved;
                    record.failure_reason.get_or_insert(FailureReason::Interrupted);
                    record.updated_at = Utc::now();
                    promoted += 1;
                }
                snapshot.next_wallet_index =
                    snapshot.next_wallet_index.max(record.wallet_index + 1);
                snapshot.records.insert(record.wallet_index, record);
            }
        }

        if sealer.is_none() {
            warn!("Recovery ledger stores wallet keys unencrypted (no ledger password set)");
        }

        let unresolved = snapshot.records.len();
        let shared = Arc::new(RwLock::new(LedgerSnapshot {
            records: snapshot.records.clone(),
            next_wallet_index: snapshot.next_wallet_index,
        }));
        let (tx, rx) = mpsc::channel(256);

        let mut worker = LedgerWorker {
            retry: RetryConfig::new(config.write_retries, config.write_backoff_ms).without_jitter(),
            archive: PathBuf::from(&config.archive_file),
            path,
            config,
            records: snapshot.records,
            next_wallet_index: snapshot.next_wallet_index,
            shared: Arc::clone(&shared),
            executor,
            metrics,
            sealer: sealer.clone(),
            tx: tx.clone(),
            pass: None,
            pass_report: RecoveryPassReport::default(),
            pass_waiters: Vec::new(),
            stopping: None,
        };

        if promoted > 0 {
            warn!(
                "RECOVERY: {} wallet(s) were in flight when the last run stopped; queued for recovery",
                promoted
            );
            worker.persist().await?;
        }
        if unresolved > 0 {
            info!("Recovery ledger loaded with {} unresolved wallet(s)", unresolved);
        }

        let handle = tokio::spawn(worker.run(rx).instrument(tracing::info_span!("recovery")));

        Ok((
            Self {
                tx,
                snapshot: shared,
                sealer,
            },
            handle,
        ))
    }

    /// Builds a journal record for a freshly generated wallet.
    pub fn record_for(
        &self,
        wallet: &WalletHandle,
        cycle_index: u64,
        token_mint: Option<String>,
    ) -> Result<RecoveryRecord, CoreError> {
        let material = match &self.sealer {
            Some(sealer) => SecretMaterial::Sealed(sealer.seal(wallet.secret())?),
            None => SecretMaterial::Plain {
                secret: wallet.secret().to_string(),
            },
        };
        let now = Utc::now();
        Ok(RecoveryRecord {
            wallet_index: wallet.index,
            public_key: wallet.public_key.clone(),
            private_key_material: material,
            token_mint,
            last_known_token_balance: 0,
            failure_reason: None,
            last_error: None,
            attempts_made: 0,
            created_at: now,
            updated_at: now,
            cycle_index,
            stage: RecordStage::InFlight,
            resolved: false,
            resolved_at: None,
        })
    }

    /// [`Self::record_for`] for a whole batch, sealing off the async threads.
    pub async fn records_for(
        &self,
        wallets: &[WalletHandle],
        cycle_index: u64,
        token_mint: Option<String>,
    ) -> Result<Vec<RecoveryRecord>, CoreError> {
        if self.sealer.is_none() {
            return wallets
                .iter()
                .map(|w| self.record_for(w, cycle_index, token_mint.clone()))
                .collect();
        }
        let ledger = self.clone();
        let wallets = wallets.to_vec();
        tokio::task::spawn_blocking(move || {
            wallets
                .iter()
                .map(|w| ledger.record_for(w, cycle_index, token_mint.clone()))
                .collect()
        })
        .await
        .map_err(|e| CoreError::chain(format!("sealing task failed: {}", e)))?
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> LedgerCommand,
    ) -> Result<T, CoreError> {
        let (ack, rx) = oneshot::channel();
        self.tx.send(make(ack)).await.map_err(|_| closed())?;
        rx.await.map_err(|_| closed())
    }

    /// Write-ahead journal entry. Resolves once the ledger file is written.
    pub async fn track(&self, records: Vec<RecoveryRecord>) -> Result<(), CoreError> {
        self.request(|ack| LedgerCommand::Track { records, ack })
            .await?
    }

    /// Queues a wallet for recovery. Returns false when it was already
    /// queued; one record per wallet index.
    pub async fn enqueue(&self, record: RecoveryRecord) -> Result<bool, CoreError> {
        self.request(|ack| LedgerCommand::Enqueue { record, ack })
            .await?
    }

    /// Drops the journal entry of a wallet whose funds are back home.
    pub async fn complete(&self, wallet_index: u64) -> Result<(), CoreError> {
        self.request(|ack| LedgerCommand::Complete { wallet_index, ack })
            .await?
    }

    /// Archives and removes a record. Resolving twice is a no-op.
    pub async fn resolve(&self, wallet_index: u64) -> Result<bool, CoreError> {
        self.request(|ack| LedgerCommand::Resolve { wallet_index, ack })
            .await?
    }

    /// Runs a recovery pass now (or joins the running one). Fails when the
    /// pass could not write the ledger.
    pub async fn recover_now(&self) -> Result<RecoveryPassReport, CoreError> {
        let report = self.request(|ack| LedgerCommand::RecoverNow { ack }).await?;
        match report.persistence_error {
            Some(reason) => Err(CoreError::PersistenceFailure {
                path: "recovery ledger".to_string(),
                reason,
            }),
            None => Ok(report),
        }
    }

    /// Stops the worker once any running pass has finished its current
    /// attempt.
    pub async fn close(&self) {
        let _ = self.request(|ack| LedgerCommand::Shutdown { ack }).await;
    }

    fn read<T>(&self, f: impl FnOnce(&LedgerSnapshot) -> T) -> T {
        let guard = self
            .snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&guard)
    }

    pub fn list_unresolved(&self) -> Vec<RecoveryRecord> {
        self.read(|s| {
            s.records
                .values()
                .filter(|r| r.stage == RecordStage::Unresolved)
                .cloned()
                .collect()
        })
    }

    pub fn unresolved_count(&self) -> usize {
        self.read(|s| {
            s.records
                .values()
                .filter(|r| r.stage == RecordStage::Unresolved)
                .count()
        })
    }

    pub fn in_flight_count(&self) -> usize {
        self.read(|s| {
            s.records
                .values()
                .filter(|r| r.stage == RecordStage::InFlight)
                .count()
        })
    }

    pub fn get(&self, wallet_index: u64) -> Option<RecoveryRecord> {
        self.read(|s| s.records.get(&wallet_index).cloned())
    }

    /// First wallet index not used by any run recorded in the ledger.
    pub fn next_wallet_index(&self) -> u64 {
        self.read(|s| s.next_wallet_index)
    }
}

struct LedgerWorker {
    config: RecoveryConfig,
    path: PathBuf,
    archive: PathBuf,
    retry: RetryConfig,
    records: BTreeMap<u64, RecoveryRecord>,
    next_wallet_index: u64,
    shared: Arc<RwLock<LedgerSnapshot>>,
    executor: Arc<dyn RecoveryExecutor>,
    metrics: Arc<MetricsCollector>,
    sealer: Option<Arc<KeySealer>>,
    tx: mpsc::Sender<LedgerCommand>,
    pass: Option<CancellationToken>,
    pass_report: RecoveryPassReport,
    pass_waiters: Vec<oneshot::Sender<RecoveryPassReport>>,
    stopping: Option<oneshot::Sender<()>>,
}

enum Flow {
    Continue,
    Stop,
}

impl LedgerWorker {
    async fn run(mut self, mut rx: mpsc::Receiver<LedgerCommand>) {
        let interval = self.config.interval();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "Recovery worker started (interval {:?}, max {} attempts per wallet)",
            interval, self.config.max_attempts
        );

        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    if let Flow::Stop = self.apply(cmd).await {
                        break;
                    }
                }
                _ = ticker.tick() => self.start_pass(),
            }
        }

        info!("Recovery worker stopped");
    }

    async fn apply(&mut self, cmd: LedgerCommand) -> Flow {
        match cmd {
            LedgerCommand::Track { records, ack } => {
                for record in records {
                    self.next_wallet_index = self.next_wallet_index.max(record.wallet_index + 1);
                    self.records.entry(record.wallet_index).or_insert(record);
                }
                let _ = ack.send(self.persist().await);
            }
            LedgerCommand::Enqueue { record, ack } => {
                let _ = ack.send(self.enqueue(record).await);
            }
            LedgerCommand::Complete { wallet_index, ack } => {
                let result = match self.records.get(&wallet_index).map(|r| r.stage) {
                    Some(RecordStage::InFlight) => {
                        self.records.remove(&wallet_index);
                        self.persist().await
                    }
                    Some(RecordStage::Unresolved) => {
                        debug!("Wallet {} is queued for recovery; left in ledger", wallet_index);
                        Ok(())
                    }
                    None => Ok(()),
                };
                let _ = ack.send(result);
            }
            LedgerCommand::Resolve { wallet_index, ack } => {
                let _ = ack.send(self.resolve(wallet_index).await);
            }
            LedgerCommand::AttemptFinished {
                wallet_index,
                result,
            } => self.attempt_finished(wallet_index, result).await,
            LedgerCommand::RecoverNow { ack } => {
                self.pass_waiters.push(ack);
                self.start_pass();
            }
            LedgerCommand::PassFinished => {
                self.pass = None;
                let mut report = std::mem::take(&mut self.pass_report);
                report.remaining_unresolved = self.unresolved_count();
                if let Some(reason) = &report.persistence_error {
                    error!("RECOVERY pass could not persist the ledger: {}", reason);
                }
                if report.attempted > 0 {
                    info!(
                        "RECOVERY pass: {} attempted, {} resolved, {} failed, {} remaining",
                        report.attempted, report.resolved, report.failed, report.remaining_unresolved
                    );
                }
                for waiter in self.pass_waiters.drain(..) {
                    let _ = waiter.send(report.clone());
                }
                if let Some(ack) = self.stopping.take() {
                    let _ = ack.send(());
                    return Flow::Stop;
                }
            }
            LedgerCommand::Shutdown { ack } => match &self.pass {
                Some(token) => {
                    token.cancel();
                    self.stopping = Some(ack);
                }
                None => {
                    let _ = ack.send(());
                    return Flow::Stop;
                }
            },
        }
        Flow::Continue
    }

    fn unresolved_count(&self) -> usize {
        self.records
            .values()
            .filter(|r| r.stage == RecordStage::Unresolved)
            .count()
    }

    async fn enqueue(&mut self, mut record: RecoveryRecord) -> Result<bool, CoreError> {
        record.stage = RecordStage::Unresolved;
        let index = record.wallet_index;

        match self.records.get_mut(&index) {
            Some(existing) if existing.stage == RecordStage::Unresolved => {
                debug!("Wallet {} already queued for recovery", index);
                return Ok(false);
            }
            Some(existing) => {
                // Keep the journaled key material; take the failure details.
                existing.stage = RecordStage::Unresolved;
                existing.failure_reason = record.failure_reason.or(existing.failure_reason);
                existing.last_error = record.last_error.take().or(existing.last_error.take());
                existing.last_known_token_balance = record.last_known_token_balance;
                if record.token_mint.is_some() {
                    existing.token_mint = record.token_mint.take();
                }
                existing.updated_at = Utc::now();
            }
            None => {
                self.next_wallet_index = self.next_wallet_index.max(index + 1);
                self.records.insert(index, record);
            }
        }

        let reason = self
            .records
            .get(&index)
            .and_then(|r| r.failure_reason)
            .unwrap_or(FailureReason::Other);
        warn!(target: TX_RESULT_TARGET, "RECOVERY wallet {} queued ({})", index, reason);
        self.persist().await.map(|_| true)
    }

    async fn resolve(&mut self, wallet_index: u64) -> Result<bool, CoreError> {
        let Some(record) = self.records.get(&wallet_index) else {
            return Ok(false);
        };

        let mut archived = record.clone();
        archived.resolved = true;
        archived.resolved_at = Some(Utc::now());
        let archive = self.archive.clone();
        with_retry(self.retry, "recovery archive append", || {
            append_json_line(&archive, &archived)
        })
        .await
        .map_err(|e| self.loud_failure(&self.archive, e))?;

        self.records.remove(&wallet_index);
        self.metrics.record_recovered();
        info!(target: TX_RESULT_TARGET, "RECOVERY wallet {} SUCCESS, funds returned", wallet_index);
        self.persist().await.map(|_| true)
    }

    async fn attempt_finished(&mut self, wallet_index: u64, result: Result<(), String>) {
        self.pass_report.attempted += 1;
        match result {
            Ok(()) => match self.resolve(wallet_index).await {
                Ok(_) => self.pass_report.resolved += 1,
                Err(e) => {
                    self.pass_report.failed += 1;
                    error!("Recovered wallet {} could not be archived: {}", wallet_index, e);
                    self.pass_report.persistence_error.get_or_insert(e.to_string());
                }
            },
            Err(message) => {
                self.pass_report.failed += 1;
                let max_attempts = self.config.max_attempts;
                if let Some(record) = self.records.get_mut(&wallet_index) {
                    record.attempts_made += 1;
                    record.last_error = Some(message.clone());
                    record.updated_at = Utc::now();
                    if record.attempts_made >= max_attempts {
                        error!(
                            "RECOVERY wallet {} ({}) FAILED {} times; left for manual recovery: {}",
                            wallet_index, record.public_key, record.attempts_made, message
                        );
                    } else {
                        warn!(
                            "RECOVERY attempt {}/{} for wallet {} FAILED: {}",
                            record.attempts_made, max_attempts, wallet_index, message
                        );
                    }
                }
                if let Err(e) = self.persist().await {
                    self.pass_report.persistence_error.get_or_insert(e.to_string());
                }
            }
        }
    }

    fn open_wallet(&self, record: &RecoveryRecord) -> Result<WalletHandle, CoreError> {
        let secret = match &record.private_key_material {
            SecretMaterial::Plain { secret } => secret.clone(),
            SecretMaterial::Sealed(sealed) => {
                let sealer = self.sealer.as_ref().ok_or(SecurityError::PasswordRequired)?;
                sealer.open(sealed)?.to_string()
            }
        };
        Ok(WalletHandle::new(
            record.wallet_index,
            record.public_key.clone(),
            secret,
        ))
    }

    fn start_pass(&mut self) {
        if self.pass.is_some() {
            return;
        }

        let candidates: Vec<RecoveryRecord> = self
            .records
            .values()
            .filter(|r| r.stage == RecordStage::Unresolved && r.attempts_made < self.config.max_attempts)
            .cloned()
            .collect();

        let mut jobs = Vec::with_capacity(candidates.len());
        for record in candidates {
            match self.open_wallet(&record) {
                Ok(wallet) => jobs.push((record, wallet)),
                Err(e) => error!("Cannot open key of wallet {}: {}", record.wallet_index, e),
            }
        }

        let token = CancellationToken::new();
        self.pass = Some(token.clone());
        let executor = Arc::clone(&self.executor);
        let tx = self.tx.clone();

        tokio::spawn(async move {
            for (record, wallet) in jobs {
                if token.is_cancelled() {
                    break;
                }
                let result = executor
                    .recover(&record, &wallet)
                    .await
                    .map_err(|e| e.to_string());
                let finished = LedgerCommand::AttemptFinished {
                    wallet_index: record.wallet_index,
                    result,
                };
                if tx.send(finished).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(LedgerCommand::PassFinished).await;
        });
    }

    fn loud_failure(&self, path: &std::path::Path, e: anyhow::Error) -> CoreError {
        error!(
            "PERSISTENCE FAILURE on {}: {:#}. Unrecorded wallets may hold funds!",
            path.display(),
            e
        );
        CoreError::PersistenceFailure {
            path: path.display().to_string(),
            reason: format!("{:#}", e),
        }
    }

    /// Publishes the in-memory state and rewrites the ledger file.
    async fn persist(&mut self) -> Result<(), CoreError> {
        {
            let mut shared = self
                .shared
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            shared.records = self.records.clone();
            shared.next_wallet_index = self.next_wallet_index;
        }

        let file = LedgerFile {
            version: LEDGER_VERSION,
            next_wallet_index: self.next_wallet_index,
            records: self.records.values().cloned().collect(),
        };
        let path = self.path.clone();
        with_retry(self.retry, "recovery ledger write", || {
            write_json_atomic(&path, &file)
        })
        .await
        .map_err(|e| self.loud_failure(&self.path, e))
    }
}
