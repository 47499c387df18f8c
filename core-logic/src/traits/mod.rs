use crate::error::CoreError;
use crate::utils::fee_manager::{PercentileTable, TransactionShape};
use crate::utils::rpc_manager::Endpoint;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// An ephemeral batch wallet. The secret is chain-encoded and wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct WalletHandle {
    #[zeroize(skip)]
    pub index: u64,
    #[zeroize(skip)]
    pub public_key: String,
    secret: String,
}

impl WalletHandle {
    pub fn new(index: u64, public_key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            index,
            public_key: public_key.into(),
            secret: secret.into(),
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for WalletHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletHandle")
            .field("index", &self.index)
            .field("public_key", &self.public_key)
            .field("secret", &"***REDACTED***")
            .finish()
    }
}

/// Who has to sign a transaction.
#[derive(Debug, Clone, Copy)]
pub enum TxSigner<'a> {
    /// The long-lived funding wallet held by the chain client.
    Main,
    Wallet(&'a WalletHandle),
}

/// What each batch wallet does once funded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationRequest {
    /// Token to buy. `None` means a plain native transfer.
    pub token: Option<String>,
    pub amount: u64,
    /// Main wallet co-signs and supplies value; the batch wallet pays fees.
    pub use_multisig: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxStatus {
    Pending,
    Confirmed,
    Failed(String),
}

/// Narrow interface to the chain. Transaction building, signing and key
/// encoding live behind it; the core only moves opaque transactions around.
#[async_trait]
pub trait ChainClient: Send + Sync + 'static {
    type Transaction: Send + 'static;

    /// Public key of the main funding wallet.
    fn main_public_key(&self) -> String;

    fn generate_wallet(&self, index: u64) -> Result<WalletHandle, CoreError>;

    /// Fee scaling for the per-wallet operation.
    fn operation_shape(&self, request: &OperationRequest) -> TransactionShape {
        if request.token.is_some() {
            TransactionShape::SWAP
        } else {
            TransactionShape::TRANSFER
        }
    }

    async fn main_balance(&self, endpoint: &Endpoint) -> Result<u64, CoreError>;

    async fn native_balance(&self, public_key: &str, endpoint: &Endpoint)
        -> Result<u64, CoreError>;

    async fn token_balance(
        &self,
        public_key: &str,
        token: &str,
        endpoint: &Endpoint,
    ) -> Result<u64, CoreError>;

    async fn build_funding_transaction(
        &self,
        recipients: &[WalletHandle],
        amounts: &[u64],
        fee: u64,
        endpoint: &Endpoint,
    ) -> Result<Self::Transaction, CoreError>;

    async fn build_operation_transaction(
        &self,
        wallet: &WalletHandle,
        request: &OperationRequest,
        fee: u64,
        endpoint: &Endpoint,
    ) -> Result<Self::Transaction, CoreError>;

    /// Sells `amount` of `token` held by the wallet back to native currency.
    async fn build_sell_transaction(
        &self,
        wallet: &WalletHandle,
        token: &str,
        amount: u64,
        fee: u64,
        endpoint: &Endpoint,
    ) -> Result<Self::Transaction, CoreError>;

    /// Moves the wallet's native balance to the main wallet. `None` when
    /// nothing is left worth sweeping.
    async fn build_sweep_transaction(
        &self,
        wallet: &WalletHandle,
        fee: u64,
        endpoint: &Endpoint,
    ) -> Result<Option<Self::Transaction>, CoreError>;

    async fn sign_and_submit(
        &self,
        transaction: Self::Transaction,
        signers: &[TxSigner<'_>],
        endpoint: &Endpoint,
    ) -> Result<String, CoreError>;

    async fn query_status(&self, signature: &str, endpoint: &Endpoint)
        -> Result<TxStatus, CoreError>;

    async fn fetch_fee_percentiles(&self, url: &str) -> Result<PercentileTable, CoreError>;
}
