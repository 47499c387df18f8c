//! `ChainClient` for Solana: v0 messages, Jupiter swaps and one cached RPC
//! client per endpoint.

use crate::config::ChainSettings;
use crate::fees;
use crate::jupiter::{parse_pubkey, JupiterClient};
use async_trait::async_trait;
use core_logic::{
    ChainClient, CoreError, Endpoint, OperationRequest, PercentileTable, TxSigner, TxStatus,
    WalletError, WalletHandle,
};
use solana_client::client_error::{ClientError, ClientErrorKind};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::RpcSendTransactionConfig;
use solana_sdk::address_lookup_table::state::AddressLookupTable;
use solana_sdk::address_lookup_table_account::AddressLookupTableAccount;
use solana_sdk::commitment_config::{CommitmentConfig, CommitmentLevel};
use solana_sdk::compute_budget::ComputeBudgetInstruction;
use solana_sdk::instruction::{AccountMeta, Instruction};
use solana_sdk::message::{v0, VersionedMessage};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signature, Signer};
use solana_sdk::system_instruction;
use solana_sdk::transaction::VersionedTransaction;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

const WRAPPED_SOL: Pubkey = solana_sdk::pubkey!("So11111111111111111111111111111111111111112");
const TOKEN_PROGRAM: Pubkey = solana_sdk::pubkey!("TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA");
const TOKEN_2022_PROGRAM: Pubkey =
    solana_sdk::pubkey!("TokenzQdBNbLqP5VEhdkAS6EPFLC1PHnBqCXEpPxuEb");
const ASSOCIATED_TOKEN_PROGRAM: Pubkey =
    solana_sdk::pubkey!("ATokenGPvbdGVxr1b2hvZbsiqW5xWH25efTNsLJA8knL");
const LAMPORTS_PER_SIGNATURE: u64 = 5_000;
/// Extra compute units per additional recipient of a funding transaction.
const UNITS_PER_TRANSFER: u32 = 300;

pub struct SolanaChain {
    main: Keypair,
    settings: ChainSettings,
    jupiter: JupiterClient,
    http: reqwest::Client,
    clients: Mutex<HashMap<String, Arc<RpcClient>>>,
    /// Owning token program per mint. A mint never changes program.
    token_programs: Mutex<HashMap<Pubkey, Pubkey>>,
}

impl SolanaChain {
    pub fn new(main_secret: &str, settings: ChainSettings) -> Result<Self, CoreError> {
        let timeout = Duration::from_secs(settings.request_timeout_secs);
        let jupiter = JupiterClient::new(&settings.jupiter_url, settings.slippage_bps, timeout)?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CoreError::chain(format!("http client: {}", e)))?;

        Ok(Self {
            main: keypair(main_secret)?,
            settings,
            jupiter,
            http,
            clients: Mutex::new(HashMap::new()),
            token_programs: Mutex::new(HashMap::new()),
        })
    }

    fn client(&self, url: &str) -> Arc<RpcClient> {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        let client = clients.entry(url.to_string()).or_insert_with(|| {
            Arc::new(RpcClient::new_with_timeout_and_commitment(
                url.to_string(),
                Duration::from_secs(self.settings.request_timeout_secs),
                CommitmentConfig::confirmed(),
            ))
        });
        Arc::clone(client)
    }

    /// SPL Token or Token-2022, read from the mint account's owner.
    async fn token_program(&self, mint: &Pubkey, endpoint: &Endpoint) -> Result<Pubkey, CoreError> {
        let cached = self
            .token_programs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(mint)
            .copied();
        if let Some(program) = cached {
            return Ok(program);
        }

        let account = self
            .client(&endpoint.url)
            .get_account_with_commitment(mint, CommitmentConfig::confirmed())
            .await
            .map_err(|e| rpc_error(endpoint, e))?
            .value
            .ok_or_else(|| CoreError::chain(format!("mint {} not found", mint)))?;
        let program = token_program_for_owner(&account.owner)?;

        self.token_programs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(*mint, program);
        Ok(program)
    }

    async fn compile(
        &self,
        payer: &Pubkey,
        instructions: &[Instruction],
        lookup_tables: &[Pubkey],
        endpoint: &Endpoint,
    ) -> Result<VersionedMessage, CoreError> {
        let client = self.client(&endpoint.url);
        let tables = load_lookup_tables(&client, lookup_tables, endpoint).await?;
        let blockhash = client
            .get_latest_blockhash()
            .await
            .map_err(|e| rpc_error(endpoint, e))?;

        let message = v0::Message::try_compile(payer, instructions, &tables, blockhash)
            .map_err(|e| CoreError::chain(format!("message compile failed: {}", e)))?;
        Ok(VersionedMessage::V0(message))
    }
}

async fn load_lookup_tables(
    client: &RpcClient,
    keys: &[Pubkey],
    endpoint: &Endpoint,
) -> Result<Vec<AddressLookupTableAccount>, CoreError> {
    if keys.is_empty() {
        return Ok(Vec::new());
    }
    let accounts = client
        .get_multiple_accounts(keys)
        .await
        .map_err(|e| rpc_error(endpoint, e))?;

    keys.iter()
        .zip(accounts)
        .map(|(key, account)| {
            let account =
                account.ok_or_else(|| CoreError::chain(format!("lookup table {} not found", key)))?;
            let table = AddressLookupTable::deserialize(&account.data)
                .map_err(|e| CoreError::chain(format!("lookup table {}: {}", key, e)))?;
            Ok(AddressLookupTableAccount {
                key: *key,
                addresses: table.addresses.to_vec(),
            })
        })
        .collect()
}

/// Connection-level failures are the endpoint's fault; anything the node
/// answered is classified from its message.
fn rpc_error(endpoint: &Endpoint, err: ClientError) -> CoreError {
    let message = err.to_string();
    match err.kind() {
        ClientErrorKind::Io(_) | ClientErrorKind::Reqwest(_) if !message.contains("429") => {
            CoreError::EndpointUnavailable {
                endpoint: endpoint.url.clone(),
                reason: message,
            }
        }
        _ => CoreError::chain(message),
    }
}

fn keypair(secret: &str) -> Result<Keypair, CoreError> {
    let bytes = bs58::decode(secret.trim())
        .into_vec()
        .map_err(|e| WalletError::InvalidKeyFormat {
            reason: e.to_string(),
        })?;
    Keypair::from_bytes(&bytes).map_err(|e| {
        WalletError::InvalidKeyFormat {
            reason: e.to_string(),
        }
        .into()
    })
}

fn compute_budget(units: u32, micro_lamports: u64) -> [Instruction; 2] {
    [
        ComputeBudgetInstruction::set_compute_unit_limit(units),
        ComputeBudgetInstruction::set_compute_unit_price(micro_lamports),
    ]
}

/// Base signature fee plus the priority fee for `units` at `micro_lamports`.
fn transaction_cost(signatures: u64, units: u32, micro_lamports: u64) -> u64 {
    let priority = (units as u128 * micro_lamports as u128).div_ceil(1_000_000);
    signatures * LAMPORTS_PER_SIGNATURE + priority as u64
}

fn token_program_for_owner(owner: &Pubkey) -> Result<Pubkey, CoreError> {
    if *owner == TOKEN_PROGRAM || *owner == TOKEN_2022_PROGRAM {
        Ok(*owner)
    } else {
        Err(CoreError::chain(format!(
            "account owned by {} is not a token mint",
            owner
        )))
    }
}

/// The token program id is part of the seeds, so the same owner and mint
/// map to different accounts under SPL Token and Token-2022.
fn associated_token_address(owner: &Pubkey, mint: &Pubkey, token_program: &Pubkey) -> Pubkey {
    Pubkey::find_program_address(
        &[owner.as_ref(), token_program.as_ref(), mint.as_ref()],
        &ASSOCIATED_TOKEN_PROGRAM,
    )
    .0
}

/// `CloseAccount`; returns the account's rent to `destination`. Both token
/// programs share the instruction layout.
fn close_token_account(
    token_program: &Pubkey,
    account: &Pubkey,
    destination: &Pubkey,
    owner: &Pubkey,
) -> Instruction {
    Instruction {
        program_id: *token_program,
        accounts: vec![
            AccountMeta::new(*account, false),
            AccountMeta::new(*destination, false),
            AccountMeta::new_readonly(*owner, true),
        ],
        data: vec![9],
    }
}

#[async_trait]
impl ChainClient for SolanaChain {
    type Transaction = VersionedMessage;

    fn main_public_key(&self) -> String {
        self.main.pubkey().to_string()
    }

    fn generate_wallet(&self, index: u64) -> Result<WalletHandle, CoreError> {
        let wallet = Keypair::new();
        Ok(WalletHandle::new(
            index,
            wallet.pubkey().to_string(),
            wallet.to_base58_string(),
        ))
    }

    async fn main_balance(&self, endpoint: &Endpoint) -> Result<u64, CoreError> {
        self.client(&endpoint.url)
            .get_balance(&self.main.pubkey())
            .await
            .map_err(|e| rpc_error(endpoint, e))
    }

    async fn native_balance(&self, public_key: &str, endpoint: &Endpoint) -> Result<u64, CoreError> {
        let owner = parse_pubkey(public_key)?;
        self.client(&endpoint.url)
            .get_balance(&owner)
            .await
            .map_err(|e| rpc_error(endpoint, e))
    }

    async fn token_balance(
        &self,
        public_key: &str,
        token: &str,
        endpoint: &Endpoint,
    ) -> Result<u64, CoreError> {
        let mint = parse_pubkey(token)?;
        let program = self.token_program(&mint, endpoint).await?;
        let ata = associated_token_address(&parse_pubkey(public_key)?, &mint, &program);
        let account = self
            .client(&endpoint.url)
            .get_account_with_commitment(&ata, CommitmentConfig::confirmed())
            .await
            .map_err(|e| rpc_error(endpoint, e))?
            .value;

        // Token account layout (shared by Token-2022): mint (32), owner (32),
        // amount (u64 LE).
        Ok(account
            .and_then(|a| a.data.get(64..72).map(|b| b.to_vec()))
            .and_then(|b| <[u8; 8]>::try_from(b).ok())
            .map(u64::from_le_bytes)
            .unwrap_or(0))
    }

    async fn build_funding_transaction(
        &self,
        recipients: &[WalletHandle],
        amounts: &[u64],
        fee: u64,
        endpoint: &Endpoint,
    ) -> Result<Self::Transaction, CoreError> {
        let main = self.main.pubkey();
        let units = self.settings.transfer_compute_units
            + UNITS_PER_TRANSFER * recipients.len().saturating_sub(1) as u32;

        let mut instructions = compute_budget(units, fee).to_vec();
        for (wallet, amount) in recipients.iter().zip(amounts) {
            instructions.push(system_instruction::transfer(
                &main,
                &parse_pubkey(&wallet.public_key)?,
                *amount,
            ));
        }
        self.compile(&main, &instructions, &[], endpoint).await
    }

    async fn build_operation_transaction(
        &self,
        wallet: &WalletHandle,
        request: &OperationRequest,
        fee: u64,
        endpoint: &Endpoint,
    ) -> Result<Self::Transaction, CoreError> {
        let owner = parse_pubkey(&wallet.public_key)?;
        let main = self.main.pubkey();

        // Multi-sig: the batch wallet pays fees, the main wallet the value.
        let mut value = Vec::new();
        if request.use_multisig {
            value.push(system_instruction::transfer(&main, &owner, request.amount));
        }

        match &request.token {
            Some(token) => {
                let plan = self
                    .jupiter
                    .swap(&owner, &WRAPPED_SOL, &parse_pubkey(token)?, request.amount)
                    .await?;
                let mut instructions = compute_budget(self.settings.swap_compute_units, fee).to_vec();
                instructions.extend(value);
                instructions.extend(plan.instructions);
                self.compile(&owner, &instructions, &plan.lookup_tables, endpoint)
                    .await
            }
            None => {
                let mut instructions =
                    compute_budget(self.settings.transfer_compute_units, fee).to_vec();
                if value.is_empty() {
                    instructions.push(system_instruction::transfer(&owner, &main, request.amount));
                } else {
                    instructions.extend(value);
                }
                self.compile(&owner, &instructions, &[], endpoint).await
            }
        }
    }

    async fn build_sell_transaction(
        &self,
        wallet: &WalletHandle,
        token: &str,
        amount: u64,
        fee: u64,
        endpoint: &Endpoint,
    ) -> Result<Self::Transaction, CoreError> {
        let owner = parse_pubkey(&wallet.public_key)?;
        let mint = parse_pubkey(token)?;
        let program = self.token_program(&mint, endpoint).await?;
        let plan = self.jupiter.swap(&owner, &mint, &WRAPPED_SOL, amount).await?;

        let mut instructions = compute_budget(self.settings.swap_compute_units, fee).to_vec();
        instructions.extend(plan.instructions);
        instructions.push(close_token_account(
            &program,
            &associated_token_address(&owner, &mint, &program),
            &owner,
            &owner,
        ));
        self.compile(&owner, &instructions, &plan.lookup_tables, endpoint)
            .await
    }

    async fn build_sweep_transaction(
        &self,
        wallet: &WalletHandle,
        fee: u64,
        endpoint: &Endpoint,
    ) -> Result<Option<Self::Transaction>, CoreError> {
        let owner = parse_pubkey(&wallet.public_key)?;
        let balance = self.native_balance(&wallet.public_key, endpoint).await?;
        let units = self.settings.transfer_compute_units;
        let cost = transaction_cost(1, units, fee);
        if balance <= cost {
            debug!(
                "Wallet {} balance {} does not cover sweep cost {}",
                wallet.index, balance, cost
            );
            return Ok(None);
        }

        let mut instructions = compute_budget(units, fee).to_vec();
        instructions.push(system_instruction::transfer(
            &owner,
            &self.main.pubkey(),
            balance - cost,
        ));
        self.compile(&owner, &instructions, &[], endpoint)
            .await
            .map(Some)
    }

    async fn sign_and_submit(
        &self,
        transaction: Self::Transaction,
        signers: &[TxSigner<'_>],
        endpoint: &Endpoint,
    ) -> Result<String, CoreError> {
        let wallet_keys = signers
            .iter()
            .filter_map(|signer| match signer {
                TxSigner::Wallet(wallet) => Some(keypair(wallet.secret())),
                TxSigner::Main => None,
            })
            .collect::<Result<Vec<_>, _>>()?;

        let transaction = {
            let mut keys: Vec<&dyn Signer> = wallet_keys.iter().map(|k| k as &dyn Signer).collect();
            if signers.iter().any(|s| matches!(s, TxSigner::Main)) {
                keys.push(&self.main);
            }

            VersionedTransaction::try_new(transaction, &keys)
                .map_err(|e| CoreError::chain(format!("signing failed: {}", e)))?
        };

        let config = RpcSendTransactionConfig {
            preflight_commitment: Some(CommitmentLevel::Confirmed),
            ..RpcSendTransactionConfig::default()
        };
        let signature = self
            .client(&endpoint.url)
            .send_transaction_with_config(&transaction, config)
            .await
            .map_err(|e| rpc_error(endpoint, e))?;
        Ok(signature.to_string())
    }

    async fn query_status(&self, signature: &str, endpoint: &Endpoint) -> Result<TxStatus, CoreError> {
        let signature = Signature::from_str(signature)
            .map_err(|e| CoreError::chain(format!("invalid signature {}: {}", signature, e)))?;
        let statuses = self
            .client(&endpoint.url)
            .get_signature_statuses(&[signature])
            .await
            .map_err(|e| rpc_error(endpoint, e))?;

        Ok(match statuses.value.into_iter().next().flatten() {
            None => TxStatus::Pending,
            Some(status) => match status.err {
                Some(err) => TxStatus::Failed(format!("{:?}", err)),
                None if status.satisfies_commitment(CommitmentConfig::finalized()) => {
                    TxStatus::Confirmed
                }
                None => TxStatus::Pending,
            },
        })
    }

    async fn fetch_fee_percentiles(&self, url: &str) -> Result<PercentileTable, CoreError> {
        if self.settings.helius_fees {
            match fees::helius_table(&self.http, url).await {
                Ok(table) => return Ok(table),
                Err(e) => debug!("Helius fee estimate unavailable, using recent fees: {}", e),
            }
        }
        fees::recent_fees_table(&self.client(url)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> SolanaChain {
        let main = Keypair::new();
        SolanaChain::new(&main.to_base58_string(), ChainSettings::default()).unwrap()
    }

    #[test]
    fn test_generated_wallet_key_round_trips() {
        let chain = chain();
        let wallet = chain.generate_wallet(4).unwrap();
        assert_eq!(wallet.index, 4);
        let restored = keypair(wallet.secret()).unwrap();
        assert_eq!(restored.pubkey().to_string(), wallet.public_key);
    }

    #[test]
    fn test_bad_main_key_is_rejected() {
        assert!(matches!(
            SolanaChain::new("not base58 0OIl", ChainSettings::default()),
            Err(CoreError::Wallet(WalletError::InvalidKeyFormat { .. }))
        ));
    }

    #[test]
    fn test_transaction_cost_rounds_priority_up() {
        assert_eq!(transaction_cost(1, 1_400, 0), 5_000);
        assert_eq!(transaction_cost(1, 1_400, 1), 5_001);
        assert_eq!(transaction_cost(2, 1_000_000, 1_000), 11_000);
    }

    #[test]
    fn test_close_account_layout() {
        let owner = Pubkey::new_unique();
        let mint = Pubkey::new_unique();
        let ata = associated_token_address(&owner, &mint, &TOKEN_PROGRAM);
        let ix = close_token_account(&TOKEN_PROGRAM, &ata, &owner, &owner);
        assert_eq!(ix.program_id, TOKEN_PROGRAM);
        assert_eq!(ix.data, vec![9]);
        assert!(ix.accounts[2].is_signer);
        assert_eq!(associated_token_address(&owner, &mint, &TOKEN_PROGRAM), ata);
    }

    #[test]
    fn test_token_2022_accounts_use_their_program() {
        let owner = Pubkey::new_unique();
        let mint = Pubkey::new_unique();
        let classic = associated_token_address(&owner, &mint, &TOKEN_PROGRAM);
        let extended = associated_token_address(&owner, &mint, &TOKEN_2022_PROGRAM);
        assert_ne!(classic, extended);

        let ix = close_token_account(&TOKEN_2022_PROGRAM, &extended, &owner, &owner);
        assert_eq!(ix.program_id, TOKEN_2022_PROGRAM);
        assert_eq!(ix.accounts[0].pubkey, extended);
    }

    #[test]
    fn test_only_token_programs_own_mints() {
        assert_eq!(token_program_for_owner(&TOKEN_PROGRAM).unwrap(), TOKEN_PROGRAM);
        assert_eq!(
            token_program_for_owner(&TOKEN_2022_PROGRAM).unwrap(),
            TOKEN_2022_PROGRAM
        );
        assert!(token_program_for_owner(&solana_sdk::system_program::id()).is_err());
    }

    #[tokio::test]
    async fn test_token_program_lookup_is_cached() {
        let chain = chain();
        let mint = Pubkey::new_unique();
        chain
            .token_programs
            .lock()
            .unwrap()
            .insert(mint, TOKEN_2022_PROGRAM);

        // Unroutable endpoint: a cache miss would fail.
        let endpoint = Endpoint::new("http://127.0.0.1:9", core_logic::EndpointRole::Primary);
        assert_eq!(
            chain.token_program(&mint, &endpoint).await.unwrap(),
            TOKEN_2022_PROGRAM
        );
    }

    #[tokio::test]
    async fn test_rpc_clients_are_cached_per_url() {
        let chain = chain();
        let a = chain.client("https://a.example");
        let b = chain.client("https://a.example");
        let c = chain.client("https://b.example");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
