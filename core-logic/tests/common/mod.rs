//! Scripted in-memory chain for integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use core_logic::{
    ChainClient, CoreError, EngineConfig, Endpoint, OperationRequest, PercentileTable, TxSigner,
    TxStatus, WalletHandle,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

pub const MAIN: &str = "main-wallet";

/// How a submitted transaction ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Script {
    Confirm,
    Fail(String),
    NeverFinalize,
}

#[derive(Debug, Clone)]
pub enum MockTx {
    Funding { recipients: Vec<String>, amount: u64 },
    Operation { wallet: u64, token: Option<String>, amount: u64 },
    Sell { wallet: u64, amount: u64 },
    Sweep { wallet: u64 },
}

#[derive(Debug, Clone)]
pub struct Submitted {
    pub tx: MockTx,
    pub fee: u64,
    pub endpoint: String,
    pub signature: String,
}

#[derive(Debug)]
pub struct MockState {
    pub main_balance: u64,
    pub balances: HashMap<u64, u64>,
    pub token_balances: HashMap<u64, u64>,
    /// Error messages returned by the next submissions, in order.
    pub reject_next: VecDeque<String>,
    /// Submissions that land but whose reply is lost to an endpoint fault.
    pub lost_replies: usize,
    /// Submissions refused by the endpoint before reaching the chain.
    pub unavailable_next: usize,
    /// Fee of every submission attempt, accepted or not.
    pub attempted_fees: Vec<u64>,
    pub funding: Script,
    pub operation: Script,
    pub operation_overrides: HashMap<u64, Script>,
    pub sweep: Script,
    pub down: HashSet<String>,
    pub fee_table: PercentileTable,
    pub fee_fetch_fails: bool,
    pub fee_fetches: usize,
    pub submitted: Vec<Submitted>,
    pub polls: Vec<String>,
    outcomes: HashMap<String, Script>,
    next_signature: u64,
}

pub struct MockChain {
    state: Mutex<MockState>,
}

impl MockChain {
    pub fn new(main_balance: u64) -> Self {
        Self {
            state: Mutex::new(MockState {
                main_balance,
                balances: HashMap::new(),
                token_balances: HashMap::new(),
                reject_next: VecDeque::new(),
                lost_replies: 0,
                unavailable_next: 0,
                attempted_fees: Vec::new(),
                funding: Script::Confirm,
                operation: Script::Confirm,
                operation_overrides: HashMap::new(),
                sweep: Script::Confirm,
                down: HashSet::new(),
                fee_table: PercentileTable::default(),
                fee_fetch_fails: false,
                fee_fetches: 0,
                submitted: Vec::new(),
                polls: Vec::new(),
                outcomes: HashMap::new(),
                next_signature: 0,
            }),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn submitted_count(&self, pred: impl Fn(&MockTx) -> bool) -> usize {
        self.state().submitted.iter().filter(|s| pred(&s.tx)).count()
    }

    fn check_endpoint(&self, endpoint: &Endpoint) -> Result<(), CoreError> {
        if self.state().down.contains(&endpoint.url) {
            return Err(CoreError::EndpointUnavailable {
                endpoint: endpoint.url.clone(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

fn wallet_key(index: u64) -> String {
    format!("wallet-{}", index)
}

fn apply(state: &mut MockState, tx: &MockTx) {
    match tx {
        MockTx::Funding { recipients, amount } => {
            for key in recipients {
                if let Some(index) = key.strip_prefix("wallet-").and_then(|i| i.parse().ok()) {
                    state.main_balance -= amount;
                    *state.balances.entry(index).or_default() += amount;
                }
            }
        }
        MockTx::Operation {
            wallet,
            token,
            amount,
        } => {
            if token.is_some() {
                let balance = state.balances.entry(*wallet).or_default();
                *balance = balance.saturating_sub(*amount);
                *state.token_balances.entry(*wallet).or_default() += amount;
            }
        }
        MockTx::Sell { wallet, amount } => {
            state.token_balances.insert(*wallet, 0);
            *state.balances.entry(*wallet).or_default() += amount;
        }
        MockTx::Sweep { wallet } => {
            let balance = state.balances.insert(*wallet, 0).unwrap_or_default();
            state.main_balance += balance;
        }
    }
}

#[async_trait]
impl ChainClient for MockChain {
    type Transaction = (MockTx, u64);

    fn main_public_key(&self) -> String {
        MAIN.to_string()
    }

    fn generate_wallet(&self, index: u64) -> Result<WalletHandle, CoreError> {
        Ok(WalletHandle::new(
            index,
            wallet_key(index),
            format!("secret-{}", index),
        ))
    }

    async fn main_balance(&self, endpoint: &Endpoint) -> Result<u64, CoreError> {
        self.check_endpoint(endpoint)?;
        Ok(self.state().main_balance)
    }

    async fn native_balance(&self, public_key: &str, endpoint: &Endpoint) -> Result<u64, CoreError> {
        self.check_endpoint(endpoint)?;
        let index: u64 = public_key
            .strip_prefix("wallet-")
            .and_then(|i| i.parse().ok())
            .unwrap_or(u64::MAX);
        Ok(self.state().balances.get(&index).copied().unwrap_or_default())
    }

    async fn token_balance(
        &self,
        public_key: &str,
        _token: &str,
        endpoint: &Endpoint,
    ) -> Result<u64, CoreError> {
        self.check_endpoint(endpoint)?;
        let index: u64 = public_key
            .strip_prefix("wallet-")
            .and_then(|i| i.parse().ok())
            .unwrap_or(u64::MAX);
        Ok(self.state().token_balances.get(&index).copied().unwrap_or_default())
    }

    async fn build_funding_transaction(
        &self,
        recipients: &[WalletHandle],
        amounts: &[u64],
        fee: u64,
        _endpoint: &Endpoint,
    ) -> Result<Self::Transaction, CoreError> {
        Ok((
            MockTx::Funding {
                recipients: recipients.iter().map(|w| w.public_key.clone()).collect(),
                amount: amounts.first().copied().unwrap_or_default(),
            },
            fee,
        ))
    }

    async fn build_operation_transaction(
        &self,
        wallet: &WalletHandle,
        request: &OperationRequest,
        fee: u64,
        _endpoint: &Endpoint,
    ) -> Result<Self::Transaction, CoreError> {
        Ok((
            MockTx::Operation {
                wallet: wallet.index,
                token: request.token.clone(),
                amount: request.amount,
            },
            fee,
        ))
    }

    async fn build_sell_transaction(
        &self,
        wallet: &WalletHandle,
        _token: &str,
        amount: u64,
        fee: u64,
        _endpoint: &Endpoint,
    ) -> Result<Self::Transaction, CoreError> {
        Ok((
            MockTx::Sell {
                wallet: wallet.index,
                amount,
            },
            fee,
        ))
    }

    async fn build_sweep_transaction(
        &self,
        wallet: &WalletHandle,
        fee: u64,
        _endpoint: &Endpoint,
    ) -> Result<Option<Self::Transaction>, CoreError> {
        let balance = self.state().balances.get(&wallet.index).copied().unwrap_or_default();
        if balance == 0 {
            return Ok(None);
        }
        Ok(Some((MockTx::Sweep { wallet: wallet.index }, fee)))
    }

    async fn sign_and_submit(
        &self,
        transaction: Self::Transaction,
        _signers: &[TxSigner<'_>],
        endpoint: &Endpoint,
    ) -> Result<String, CoreError> {
        self.check_endpoint(endpoint)?;
        let mut state = self.state();
        let (tx, fee) = transaction;
        state.attempted_fees.push(fee);

        if state.unavailable_next > 0 {
            state.unavailable_next -= 1;
            return Err(CoreError::EndpointUnavailable {
                endpoint: endpoint.url.clone(),
                reason: "service unavailable".to_string(),
            });
        }
        let lost_reply = state.lost_replies > 0;
        if lost_reply {
            state.lost_replies -= 1;
        } else if let Some(message) = state.reject_next.pop_front() {
            return Err(CoreError::chain(message));
        }

        state.next_signature += 1;
        let signature = format!("sig-{}", state.next_signature);
        let script = match &tx {
            MockTx::Funding { .. } => state.funding.clone(),
            MockTx::Operation { wallet, .. } => state
                .operation_overrides
                .get(wallet)
                .cloned()
                .unwrap_or_else(|| state.operation.clone()),
            MockTx::Sell { .. } | MockTx::Sweep { .. } => state.sweep.clone(),
        };
        if script == Script::Confirm {
            apply(&mut state, &tx);
        }
        state.outcomes.insert(signature.clone(), script);
        state.submitted.push(Submitted {
            tx,
            fee,
            endpoint: endpoint.url.clone(),
            signature: signature.clone(),
        });
        if lost_reply {
            return Err(CoreError::EndpointUnavailable {
                endpoint: endpoint.url.clone(),
                reason: "operation timed out".to_string(),
            });
        }
        Ok(signature)
    }

    async fn query_status(&self, signature: &str, endpoint: &Endpoint) -> Result<TxStatus, CoreError> {
        self.check_endpoint(endpoint)?;
        let mut state = self.state();
        state.polls.push(endpoint.url.clone());
        Ok(match state.outcomes.get(signature) {
            Some(Script::Confirm) => TxStatus::Confirmed,
            Some(Script::Fail(message)) => TxStatus::Failed(message.clone()),
            Some(Script::NeverFinalize) | None => TxStatus::Pending,
        })
    }

    async fn fetch_fee_percentiles(&self, url: &str) -> Result<PercentileTable, CoreError> {
        let mut state = self.state();
        state.fee_fetches += 1;
        if state.fee_fetch_fails {
            return Err(CoreError::EndpointUnavailable {
                endpoint: url.to_string(),
                reason: "connection reset".to_string(),
            });
        }
        Ok(state.fee_table.clone())
    }
}

/// Engine config with fast confirmation polling and files under `dir`.
pub fn engine_config(dir: &Path) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.endpoints.primary = "https://primary.test".to_string();
    config.endpoints.alternatives = vec![
        "https://alt-1.test".to_string(),
        "https://alt-2.test".to_string(),
    ];
    config.confirmation.base_delay_ms = 100;
    config.confirmation.max_delay_ms = 1_000;
    config.recovery.recovery_file = dir.join("wallet_recovery/failed.json").display().to_string();
    config.recovery.archive_file = dir.join("wallet_recovery/recovered.jsonl").display().to_string();
    config.recovery.interval_secs = 3_600;
    config.recovery.write_backoff_ms = 1;
    config.orchestrator.main_wallet_reserve = 0;
    config.orchestrator.summary_dir = dir.join("results").display().to_string();
    config
}
