//! `ChainClient` for EVM networks: Multicall3 batch funding, Uniswap V2
//! router swaps and one cached HTTP provider per endpoint.

use crate::config::ChainSettings;
use crate::gas::{
    apply_slippage, confirmations_reached, legacy_table, reward_table, saturating_u64, scale,
    GasQuote, FEE_PERCENTILES,
};
use async_trait::async_trait;
use core_logic::{
    ChainClient, ConfigError, CoreError, Endpoint, OperationRequest, PercentileTable, TxSigner,
    TxStatus, WalletError, WalletHandle,
};
use ethers::prelude::*;
use ethers::providers::RpcError;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::utils::to_checksum;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

ethers::contract::abigen!(
    UniswapV2Router,
    r#"[
        function getAmountsOut(uint256 amountIn, address[] path) external view returns (uint256[] amounts)
        function swapExactETHForTokens(uint256 amountOutMin, address[] path, address to, uint256 deadline) external payable returns (uint256[] amounts)
        function swapExactTokensForETHSupportingFeeOnTransferTokens(uint256 amountIn, uint256 amountOutMin, address[] path, address to, uint256 deadline) external
    ]"#
);

ethers::contract::abigen!(
    Erc20,
    r#"[
        function balanceOf(address owner) external view returns (uint256)
        function allowance(address owner, address spender) external view returns (uint256)
        function approve(address spender, uint256 amount) external returns (bool)
    ]"#
);

ethers::contract::abigen!(
    Multicall3,
    r#"[
        struct Call3Value { address target; bool allowFailure; uint256 value; bytes callData; }
        function aggregate3Value(Call3Value[] calls) external payable
    ]"#
);

const TRANSFER_GAS: u64 = 21_000;

/// Transactions sent in order with consecutive nonces. The last one decides
/// the outcome; an approval travels with the swap it enables.
#[derive(Debug, Clone)]
pub struct EvmBundle {
    pub txs: Vec<TypedTransaction>,
}

/// Addresses resolved once from [`ChainSettings`].
#[derive(Debug, Clone)]
struct Contracts {
    router: Option<Address>,
    wrapped_native: Address,
    multicall: Address,
}

pub struct EvmChain {
    main: LocalWallet,
    chain_id: u64,
    legacy_gas: bool,
    contracts: Contracts,
    settings: ChainSettings,
    http: reqwest::Client,
    providers: Mutex<HashMap<String, Arc<Provider<Http>>>>,
}

impl EvmChain {
    pub fn new(main_secret: &str, settings: ChainSettings) -> Result<Self, CoreError> {
        let chain_id = settings.chain_id();
        let contracts = Contracts {
            router: settings
                .router
                .as_deref()
                .map(|r| parse_setting("evm.router", r))
                .transpose()?,
            wrapped_native: parse_setting("evm.wrapped_native", settings.wrapped_native())?,
            multicall: parse_setting("evm.multicall", &settings.multicall)?,
        };
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .map_err(|e| CoreError::chain(format!("http client: {}", e)))?;

        Ok(Self {
            main: local_wallet(main_secret)?.with_chain_id(chain_id),
            chain_id,
            legacy_gas: settings.legacy_gas(),
            contracts,
            settings,
            http,
            providers: Mutex::new(HashMap::new()),
        })
    }

    fn provider(&self, url: &str) -> Result<Arc<Provider<Http>>, CoreError> {
        let mut providers = self.providers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(provider) = providers.get(url) {
            return Ok(Arc::clone(provider));
        }
        let parsed = reqwest::Url::parse(url).map_err(|_| ConfigError::InvalidRpcUrl {
            url: url.to_string(),
        })?;
        let provider = Arc::new(Provider::new(Http::new_with_client(parsed, self.http.clone())));
        providers.insert(url.to_string(), Arc::clone(&provider));
        Ok(provider)
    }

    fn router(&self) -> Result<Address, CoreError> {
        self.contracts.router.ok_or_else(|| {
            ConfigError::MissingField {
                field: "evm.router".to_string(),
            }
            .into()
        })
    }

    fn deadline(&self) -> U256 {
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        U256::from(now + self.settings.deadline_secs)
    }

    async fn gas_quote(
        &self,
        provider: &Provider<Http>,
        tip: u64,
        url: &str,
    ) -> Result<GasQuote, CoreError> {
        if !self.legacy_gas {
            let base_fee = provider
                .get_block(BlockNumber::Latest)
                .await
                .map_err(|e| rpc_error(url, e))?
                .and_then(|block| block.base_fee_per_gas);
            if let Some(base_fee) = base_fee {
                return Ok(GasQuote::eip1559(
                    base_fee,
                    tip,
                    self.settings.base_fee_multiplier,
                ));
            }
            debug!("No base fee reported by {}; using gasPrice", url);
        }
        let gas_price = provider
            .get_gas_price()
            .await
            .map_err(|e| rpc_error(url, e))?;
        Ok(GasQuote::legacy(gas_price, tip))
    }

    async fn nonce(
        &self,
        provider: &Provider<Http>,
        from: Address,
        url: &str,
    ) -> Result<U256, CoreError> {
        provider
            .get_transaction_count(from, Some(BlockNumber::Pending.into()))
            .await
            .map_err(|e| rpc_error(url, e))
    }

    fn request(
        &self,
        quote: GasQuote,
        from: Address,
        to: Address,
        value: U256,
        data: Bytes,
        nonce: U256,
    ) -> TypedTransaction {
        match quote {
            GasQuote::Eip1559 { max_fee, priority } => Eip1559TransactionRequest::new()
                .from(from)
                .to(to)
                .value(value)
                .data(data)
                .nonce(nonce)
                .max_fee_per_gas(max_fee)
                .max_priority_fee_per_gas(priority)
                .chain_id(self.chain_id)
                .into(),
            GasQuote::Legacy { gas_price } => TransactionRequest::new()
                .from(from)
                .to(to)
                .value(value)
                .data(data)
                .nonce(nonce)
                .gas_price(gas_price)
                .chain_id(self.chain_id)
                .into(),
        }
    }

    /// Simulates `tx` and sets its gas limit with the configured headroom.
    async fn estimate_into(
        &self,
        provider: &Provider<Http>,
        tx: &mut TypedTransaction,
        url: &str,
    ) -> Result<(), CoreError> {
        let estimate = provider
            .estimate_gas(tx, None)
            .await
            .map_err(|e| rpc_error(url, e))?;
        tx.set_gas(scale(estimate, self.settings.gas_limit_margin));
        Ok(())
    }

    async fn quote_min_out(
        &self,
        router: &UniswapV2Router<Provider<Http>>,
        amount_in: U256,
        path: Vec<Address>,
        url: &str,
    ) -> Result<U256, CoreError> {
        let amounts = router
            .get_amounts_out(amount_in, path)
            .call()
            .await
            .map_err(|e| contract_error(url, e))?;
        let quoted = amounts
            .last()
            .copied()
            .ok_or_else(|| CoreError::chain("router returned an empty quote"))?;
        Ok(apply_slippage(quoted, self.settings.slippage_bps))
    }

    fn signer_for(&self, from: Address, signers: &[TxSigner<'_>]) -> Result<LocalWallet, CoreError> {
        for signer in signers {
            match signer {
                TxSigner::Main if self.main.address() == from => return Ok(self.main.clone()),
                TxSigner::Wallet(wallet) => {
                    let local = local_wallet(wallet.secret())?;
                    if local.address() == from {
                        return Ok(local.with_chain_id(self.chain_id));
                    }
                }
                TxSigner::Main => {}
            }
        }
        Err(CoreError::chain(format!(
            "no signer for {}",
            to_checksum(&from, None)
        )))
    }
}

fn local_wallet(secret: &str) -> Result<LocalWallet, CoreError> {
    LocalWallet::from_str(secret.trim()).map_err(|e| {
        WalletError::InvalidKeyFormat {
            reason: e.to_string(),
        }
        .into()
    })
}

fn parse_setting(field: &str, value: &str) -> Result<Address, CoreError> {
    Address::from_str(value.trim()).map_err(|e| {
        ConfigError::InvalidValue {
            field: field.to_string(),
            reason: e.to_string(),
        }
        .into()
    })
}

fn parse_address(value: &str) -> Result<Address, CoreError> {
    Address::from_str(value.trim())
        .map_err(|e| CoreError::chain(format!("invalid address {}: {}", value, e)))
}

fn encode_error(function: &str, err: impl std::fmt::Display) -> CoreError {
    CoreError::chain(format!("failed to encode {}: {}", function, err))
}

/// JSON-RPC answers are the node judging the request; anything else means
/// the endpoint never answered.
fn rpc_error(url: &str, err: ProviderError) -> CoreError {
    match &err {
        ProviderError::JsonRpcClientError(inner) => {
            if let Some(response) = inner.as_error_response() {
                return CoreError::chain(response.message.clone());
            }
            if inner.as_serde_error().is_some() {
                return CoreError::chain(err.to_string());
            }
            let message = err.to_string();
            if message.contains("429") {
                return CoreError::chain(message);
            }
            CoreError::EndpointUnavailable {
                endpoint: url.to_string(),
                reason: message,
            }
        }
        ProviderError::HTTPError(_) => CoreError::EndpointUnavailable {
            endpoint: url.to_string(),
            reason: err.to_string(),
        },
        _ => CoreError::chain(err.to_string()),
    }
}

fn contract_error(url: &str, err: ContractError<Provider<Http>>) -> CoreError {
    match err {
        ContractError::MiddlewareError { e } | ContractError::ProviderError { e } => {
            rpc_error(url, e)
        }
        other => CoreError::chain(other.to_string()),
    }
}

#[async_trait]
impl ChainClient for EvmChain {
    type Transaction = EvmBundle;

    fn main_public_key(&self) -> String {
        to_checksum(&self.main.address(), None)
    }

    fn generate_wallet(&self, index: u64) -> Result<WalletHandle, CoreError> {
        let wallet = LocalWallet::new(&mut rand::thread_rng());
        Ok(WalletHandle::new(
            index,
            to_checksum(&wallet.address(), None),
            hex::encode(wallet.signer().to_bytes()),
        ))
    }

    async fn main_balance(&self, endpoint: &Endpoint) -> Result<u64, CoreError> {
        self.provider(&endpoint.url)?
            .get_balance(self.main.address(), None)
            .await
            .map(saturating_u64)
            .map_err(|e| rpc_error(&endpoint.url, e))
    }

    async fn native_balance(&self, public_key: &str, endpoint: &Endpoint) -> Result<u64, CoreError> {
        let owner = parse_address(public_key)?;
        self.provider(&endpoint.url)?
            .get_balance(owner, None)
            .await
            .map(saturating_u64)
            .map_err(|e| rpc_error(&endpoint.url, e))
    }

    async fn token_balance(
        &self,
        public_key: &str,
        token: &str,
        endpoint: &Endpoint,
    ) -> Result<u64, CoreError> {
        let erc20 = Erc20::new(parse_address(token)?, self.provider(&endpoint.url)?);
        erc20
            .balance_of(parse_address(public_key)?)
            .call()
            .await
            .map(saturating_u64)
            .map_err(|e| contract_error(&endpoint.url, e))
    }

    async fn build_funding_transaction(
        &self,
        recipients: &[WalletHandle],
        amounts: &[u64],
        fee: u64,
        endpoint: &Endpoint,
    ) -> Result<Self::Transaction, CoreError> {
        if recipients.len() != amounts.len() {
            return Err(CoreError::chain("recipient and amount counts differ"));
        }
        let provider = self.provider(&endpoint.url)?;

        let calls = recipients
            .iter()
            .zip(amounts)
            .map(|(wallet, amount)| {
                Ok(Call3Value {
                    target: parse_address(&wallet.public_key)?,
                    allow_failure: false,
                    value: U256::from(*amount),
                    call_data: Bytes::new(),
                })
            })
            .collect::<Result<Vec<_>, CoreError>>()?;
        let total = amounts
            .iter()
            .fold(U256::zero(), |sum, amount| sum + U256::from(*amount));
        let data = Multicall3::new(self.contracts.multicall, Arc::clone(&provider))
            .encode("aggregate3Value", (calls,))
            .map_err(|e| encode_error("aggregate3Value", e))?;

        let from = self.main.address();
        let quote = self.gas_quote(&provider, fee, &endpoint.url).await?;
        let nonce = self.nonce(&provider, from, &endpoint.url).await?;
        let mut tx = self.request(quote, from, self.contracts.multicall, total, data, nonce);
        self.estimate_into(&provider, &mut tx, &endpoint.url).await?;
        Ok(EvmBundle { txs: vec![tx] })
    }

    async fn build_operation_transaction(
        &self,
        wallet: &WalletHandle,
        request: &OperationRequest,
        fee: u64,
        endpoint: &Endpoint,
    ) -> Result<Self::Transaction, CoreError> {
        if request.use_multisig {
            return Err(ConfigError::InvalidValue {
                field: "use_multisig".to_string(),
                reason: "not supported on EVM networks".to_string(),
            }
            .into());
        }
        let provider = self.provider(&endpoint.url)?;
        let owner = parse_address(&wallet.public_key)?;
        let amount = U256::from(request.amount);
        let quote = self.gas_quote(&provider, fee, &endpoint.url).await?;
        let nonce = self.nonce(&provider, owner, &endpoint.url).await?;

        let tx = match &request.token {
            None => {
                let mut tx =
                    self.request(quote, owner, self.main.address(), amount, Bytes::new(), nonce);
                tx.set_gas(TRANSFER_GAS);
                tx
            }
            Some(token) => {
                let router_address = self.router()?;
                let router = UniswapV2Router::new(router_address, Arc::clone(&provider));
                let path = vec![self.contracts.wrapped_native, parse_address(token)?];
                let min_out = self
                    .quote_min_out(&router, amount, path.clone(), &endpoint.url)
                    .await?;
                let data = router
                    .encode("swapExactETHForTokens", (min_out, path, owner, self.deadline()))
                    .map_err(|e| encode_error("swapExactETHForTokens", e))?;
                let mut tx = self.request(quote, owner, router_address, amount, data, nonce);
                self.estimate_into(&provider, &mut tx, &endpoint.url).await?;
                tx
            }
        };
        Ok(EvmBundle { txs: vec![tx] })
    }

    async fn build_sell_transaction(
        &self,
        wallet: &WalletHandle,
        token: &str,
        amount: u64,
        fee: u64,
        endpoint: &Endpoint,
    ) -> Result<Self::Transaction, CoreError> {
        let provider = self.provider(&endpoint.url)?;
        let owner = parse_address(&wallet.public_key)?;
        let token = parse_address(token)?;
        let router_address = self.router()?;
        let erc20 = Erc20::new(token, Arc::clone(&provider));

        let held = erc20
            .balance_of(owner)
            .call()
            .await
            .map_err(|e| contract_error(&endpoint.url, e))?;
        // `amount` saturates at u64::MAX for large 18-decimal balances.
        let amount_in = if amount == u64::MAX {
            held
        } else {
            held.min(U256::from(amount))
        };
        if amount_in.is_zero() {
            return Err(CoreError::chain("no token balance to sell"));
        }

        let allowance = erc20
            .allowance(owner, router_address)
            .call()
            .await
            .map_err(|e| contract_error(&endpoint.url, e))?;
        let quote = self.gas_quote(&provider, fee, &endpoint.url).await?;
        let mut nonce = self.nonce(&provider, owner, &endpoint.url).await?;
        let mut txs = Vec::with_capacity(2);

        let needs_approval = allowance < amount_in;
        if needs_approval {
            let data = erc20
                .encode("approve", (router_address, U256::MAX))
                .map_err(|e| encode_error("approve", e))?;
            let mut approve = self.request(quote, owner, token, U256::zero(), data, nonce);
            approve.set_gas(self.settings.approve_gas_limit);
            txs.push(approve);
            nonce += U256::one();
        }

        let router = UniswapV2Router::new(router_address, Arc::clone(&provider));
        let path = vec![token, self.contracts.wrapped_native];
        let min_out = self
            .quote_min_out(&router, amount_in, path.clone(), &endpoint.url)
            .await?;
        let data = router
            .encode(
                "swapExactTokensForETHSupportingFeeOnTransferTokens",
                (amount_in, min_out, path, owner, self.deadline()),
            )
            .map_err(|e| encode_error("swapExactTokensForETHSupportingFeeOnTransferTokens", e))?;
        let mut swap = self.request(quote, owner, router_address, U256::zero(), data, nonce);
        if needs_approval {
            // Cannot be simulated before the approval lands.
            swap.set_gas(self.settings.swap_gas_limit);
        } else {
            self.estimate_into(&provider, &mut swap, &endpoint.url).await?;
        }
        txs.push(swap);

        Ok(EvmBundle { txs })
    }

    async fn build_sweep_transaction(
        &self,
        wallet: &WalletHandle,
        fee: u64,
        endpoint: &Endpoint,
    ) -> Result<Option<Self::Transaction>, CoreError> {
        let provider = self.provider(&endpoint.url)?;
        let owner = parse_address(&wallet.public_key)?;
        let balance = provider
            .get_balance(owner, None)
            .await
            .map_err(|e| rpc_error(&endpoint.url, e))?;
        let quote = self.gas_quote(&provider, fee, &endpoint.url).await?;
        let cost = quote.max_cost(TRANSFER_GAS);
        if balance <= cost {
            debug!(
                "Wallet {} balance {} does not cover sweep cost {}",
                wallet.index, balance, cost
            );
            return Ok(None);
        }

        let nonce = self.nonce(&provider, owner, &endpoint.url).await?;
        let mut tx = self.request(
            quote,
            owner,
            self.main.address(),
            balance - cost,
            Bytes::new(),
            nonce,
        );
        tx.set_gas(TRANSFER_GAS);
        Ok(Some(EvmBundle { txs: vec![tx] }))
    }

    async fn sign_and_submit(
        &self,
        transaction: Self::Transaction,
        signers: &[TxSigner<'_>],
        endpoint: &Endpoint,
    ) -> Result<String, CoreError> {
        let provider = self.provider(&endpoint.url)?;
        let mut last_hash = None;

        for tx in transaction.txs {
            let from = tx
                .from()
                .copied()
                .ok_or_else(|| CoreError::chain("transaction has no sender"))?;
            let wallet = self.signer_for(from, signers)?;
            let signature = wallet
                .sign_transaction(&tx)
                .await
                .map_err(|e| CoreError::chain(format!("signing failed: {}", e)))?;
            let pending = provider
                .send_raw_transaction(tx.rlp_signed(&signature))
                .await
                .map_err(|e| rpc_error(&endpoint.url, e))?;
            last_hash = Some(pending.tx_hash());
        }

        last_hash
            .map(|hash| format!("{:?}", hash))
            .ok_or_else(|| CoreError::chain("empty transaction bundle"))
    }

    async fn query_status(&self, signature: &str, endpoint: &Endpoint) -> Result<TxStatus, CoreError> {
        let hash = H256::from_str(signature)
            .map_err(|e| CoreError::chain(format!("invalid transaction hash {}: {}", signature, e)))?;
        let provider = self.provider(&endpoint.url)?;

        let Some(receipt) = provider
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| rpc_error(&endpoint.url, e))?
        else {
            return Ok(TxStatus::Pending);
        };
        if receipt.status == Some(U64::zero()) {
            return Ok(TxStatus::Failed(format!(
                "transaction failed with status 0 in block {}",
                receipt.block_number.unwrap_or_default()
            )));
        }
        let Some(mined_in) = receipt.block_number else {
            return Ok(TxStatus::Pending);
        };

        let head = provider
            .get_block_number()
            .await
            .map_err(|e| rpc_error(&endpoint.url, e))?;
        if confirmations_reached(head.as_u64(), mined_in.as_u64(), self.settings.confirmations) {
            Ok(TxStatus::Confirmed)
        } else {
            Ok(TxStatus::Pending)
        }
    }

    async fn fetch_fee_percentiles(&self, url: &str) -> Result<PercentileTable, CoreError> {
        let provider = self.provider(url)?;
        if !self.legacy_gas {
            let history = provider
                .fee_history(self.settings.fee_history_blocks, BlockNumber::Latest, &FEE_PERCENTILES)
                .await
                .map_err(|e| rpc_error(url, e))?;
            let table = reward_table(&history.reward);
            if !table.is_empty() {
                return Ok(table);
            }
            debug!("{} returned no fee rewards; pricing from gasPrice", url);
        }
        let gas_price = provider
            .get_gas_price()
            .await
            .map_err(|e| rpc_error(url, e))?;
        Ok(legacy_table(gas_price))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networks::Network;

    const KEY: &str = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    fn settings() -> ChainSettings {
        ChainSettings {
            network: Network::Base,
            router: Some("0x4752ba5DBc23f44D87826276BF6Fd6b1C372aD24".to_string()),
            ..ChainSettings::default()
        }
    }

    fn chain() -> EvmChain {
        EvmChain::new(KEY, settings()).unwrap()
    }

    #[test]
    fn test_generated_wallet_key_round_trips() {
        let chain = chain();
        let wallet = chain.generate_wallet(3).unwrap();
        assert_eq!(wallet.index, 3);
        let restored = local_wallet(wallet.secret()).unwrap();
        assert_eq!(to_checksum(&restored.address(), None), wallet.public_key);
    }

    #[test]
    fn test_bad_main_key_is_rejected() {
        assert!(matches!(
            EvmChain::new("not-hex", settings()),
            Err(CoreError::Wallet(WalletError::InvalidKeyFormat { .. }))
        ));
    }

    #[test]
    fn test_bad_router_is_a_config_error() {
        let settings = ChainSettings {
            router: Some("0x1234".to_string()),
            ..settings()
        };
        assert!(matches!(
            EvmChain::new(KEY, settings),
            Err(CoreError::Config(ConfigError::InvalidValue { .. }))
        ));
    }

    #[test]
    fn test_swaps_need_a_router() {
        let chain = EvmChain::new(KEY, ChainSettings::default()).unwrap();
        assert!(matches!(
            chain.router(),
            Err(CoreError::Config(ConfigError::MissingField { .. }))
        ));
    }

    #[test]
    fn test_requests_follow_gas_mode() {
        let chain = chain();
        let from = chain.main.address();
        let eip1559 = chain.request(
            GasQuote::eip1559(U256::from(100u64), 5, 1.5),
            from,
            from,
            U256::one(),
            Bytes::new(),
            U256::zero(),
        );
        assert!(matches!(eip1559, TypedTransaction::Eip1559(_)));
        assert_eq!(eip1559.chain_id(), Some(U64::from(8453u64)));

        let legacy = chain.request(
            GasQuote::legacy(U256::from(100u64), 5),
            from,
            from,
            U256::one(),
            Bytes::new(),
            U256::zero(),
        );
        assert_eq!(legacy.gas_price(), Some(U256::from(105u64)));
    }

    #[test]
    fn test_signer_matches_sender() {
        let chain = chain();
        let wallet = chain.generate_wallet(0).unwrap();
        let address = parse_address(&wallet.public_key).unwrap();

        let signers = [TxSigner::Wallet(&wallet)];
        assert_eq!(chain.signer_for(address, &signers).unwrap().address(), address);
        // The main wallet only signs when it is asked to.
        assert!(chain.signer_for(chain.main.address(), &signers).is_err());
        assert!(chain
            .signer_for(chain.main.address(), &[TxSigner::Main])
            .is_ok());
    }

    #[test]
    fn test_funding_calldata_targets_every_wallet() {
        let chain = chain();
        let a = chain.generate_wallet(0).unwrap();
        let b = chain.generate_wallet(1).unwrap();
        let provider = chain.provider("https://rpc.example").unwrap();
        let multicall = Multicall3::new(chain.contracts.multicall, provider);

        let calls = vec![
            Call3Value {
                target: parse_address(&a.public_key).unwrap(),
                allow_failure: false,
                value: U256::from(10u64),
                call_data: Bytes::new(),
            },
            Call3Value {
                target: parse_address(&b.public_key).unwrap(),
                allow_failure: false,
                value: U256::from(20u64),
                call_data: Bytes::new(),
            },
        ];
        let data = multicall.encode("aggregate3Value", (calls,)).unwrap();
        // aggregate3Value(Call3Value[]) selector.
        assert_eq!(&data[..4], &[0x17, 0x4d, 0xea, 0x71]);
    }

    #[tokio::test]
    async fn test_providers_are_cached_per_url() {
        let chain = chain();
        let a = chain.provider("https://a.example").unwrap();
        let b = chain.provider("https://a.example").unwrap();
        let c = chain.provider("https://b.example").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert!(matches!(
            chain.provider("not a url"),
            Err(CoreError::Config(ConfigError::InvalidRpcUrl { .. }))
        ));
    }

    #[test]
    fn test_non_transport_provider_errors_are_chain_errors() {
        let err = ProviderError::CustomError("node said no".to_string());
        assert!(matches!(rpc_error("https://a.example", err), CoreError::Chain { .. }));
    }
}
