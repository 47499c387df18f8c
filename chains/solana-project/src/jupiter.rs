//! Jupiter v6 quote and swap-instructions client.

use base64::{engine::general_purpose::STANDARD, Engine};
use core_logic::CoreError;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use solana_sdk::instruction::{AccountMeta, Instruction};
use solana_sdk::pubkey::Pubkey;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiInstruction {
    program_id: String,
    accounts: Vec<ApiAccount>,
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiAccount {
    pubkey: String,
    is_signer: bool,
    is_writable: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SwapInstructionsResponse {
    #[serde(default)]
    setup_instructions: Vec<ApiInstruction>,
    swap_instruction: ApiInstruction,
    cleanup_instruction: Option<ApiInstruction>,
    #[serde(default)]
    address_lookup_table_addresses: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SwapInstructionsRequest<'a> {
    quote_response: &'a Value,
    user_public_key: String,
    wrap_and_unwrap_sol: bool,
    // Compute budget is set by the caller from the fee estimator.
    dynamic_compute_unit_limit: bool,
}

/// Swap instructions ready to be compiled into a v0 message. Compute budget
/// instructions are not included.
#[derive(Debug)]
pub struct SwapPlan {
    pub instructions: Vec<Instruction>,
    pub lookup_tables: Vec<Pubkey>,
}

pub struct JupiterClient {
    http: Client,
    base_url: String,
    slippage_bps: u16,
}

impl JupiterClient {
    pub fn new(base_url: &str, slippage_bps: u16, timeout: Duration) -> Result<Self, CoreError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CoreError::chain(format!("http client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            slippage_bps,
        })
    }

    async fn quote(&self, input: &Pubkey, output: &Pubkey, amount: u64) -> Result<Value, CoreError> {
        let url = format!("{}/quote", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[
                ("inputMint", input.to_string()),
                ("outputMint", output.to_string()),
                ("amount", amount.to_string()),
                ("slippageBps", self.slippage_bps.to_string()),
            ])
            .send()
            .await
            .map_err(|e| unavailable(&url, e))?;

        let status = response.status();
        let body: Value = response.json().await.map_err(|e| unavailable(&url, e))?;
        if !status.is_success() || body.get("error").is_some() {
            return Err(CoreError::chain(format!(
                "Jupiter quote {} -> {} failed ({}): {}",
                input, output, status, body
            )));
        }
        Ok(body)
    }

    /// Quotes `amount` of `input` into `output` for `user` and fetches the
    /// route's instructions.
    pub async fn swap(
        &self,
        user: &Pubkey,
        input: &Pubkey,
        output: &Pubkey,
        amount: u64,
    ) -> Result<SwapPlan, CoreError> {
        let quote = self.quote(input, output, amount).await?;

        let url = format!("{}/swap-instructions", self.base_url);
        let request = SwapInstructionsRequest {
            quote_response: &quote,
            user_public_key: user.to_string(),
            wrap_and_unwrap_sol: true,
            dynamic_compute_unit_limit: false,
        };
        let response = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| unavailable(&url, e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CoreError::chain(format!(
                "Jupiter swap-instructions failed ({}): {}",
                status, text
            )));
        }
        let body: SwapInstructionsResponse =
            response.json().await.map_err(|e| unavailable(&url, e))?;

        let mut instructions = Vec::with_capacity(body.setup_instructions.len() + 2);
        for ix in &body.setup_instructions {
            instructions.push(to_instruction(ix)?);
        }
        instructions.push(to_instruction(&body.swap_instruction)?);
        if let Some(cleanup) = &body.cleanup_instruction {
            instructions.push(to_instruction(cleanup)?);
        }

        let lookup_tables = body
            .address_lookup_table_addresses
            .iter()
            .map(|key| parse_pubkey(key))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(SwapPlan {
            instructions,
            lookup_tables,
        })
    }
}

fn unavailable(url: &str, err: reqwest::Error) -> CoreError {
    if err.status().is_some_and(|s| s.as_u16() == 429) {
        return CoreError::chain(format!("{}: 429 too many requests", url));
    }
    CoreError::EndpointUnavailable {
        endpoint: url.to_string(),
        reason: err.to_string(),
    }
}

pub fn parse_pubkey(value: &str) -> Result<Pubkey, CoreError> {
    Pubkey::from_str(value).map_err(|e| CoreError::chain(format!("invalid pubkey {}: {}", value, e)))
}

fn to_instruction(ix: &ApiInstruction) -> Result<Instruction, CoreError> {
    let accounts = ix
        .accounts
        .iter()
        .map(|a| {
            Ok(AccountMeta {
                pubkey: parse_pubkey(&a.pubkey)?,
                is_signer: a.is_signer,
                is_writable: a.is_writable,
            })
        })
        .collect::<Result<Vec<_>, CoreError>>()?;
    let data = STANDARD
        .decode(&ix.data)
        .map_err(|e| CoreError::chain(format!("invalid instruction data: {}", e)))?;

    Ok(Instruction {
        program_id: parse_pubkey(&ix.program_id)?,
        accounts,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_swap_instructions_response() {
        let json = serde_json::json!({
            "computeBudgetInstructions": [],
            "setupInstructions": [{
                "programId": "ATokenGPvbdGVxr1b2hvZbsiqW5xWH25efTNsLJA8knL",
                "accounts": [{
                    "pubkey": "So11111111111111111111111111111111111111112",
                    "isSigner": false,
                    "isWritable": true
                }],
                "data": "AQ=="
            }],
            "swapInstruction": {
                "programId": "JUP6LkbZbjS1jKKwapdHNy74zcZ3tLUZoi5QNyVTaV4",
                "accounts": [],
                "data": "AAEC"
            },
            "cleanupInstruction": null,
            "addressLookupTableAddresses": ["So11111111111111111111111111111111111111112"]
        });
        let body: SwapInstructionsResponse = serde_json::from_value(json).unwrap();
        assert_eq!(body.setup_instructions.len(), 1);

        let setup = to_instruction(&body.setup_instructions[0]).unwrap();
        assert_eq!(setup.data, vec![1]);
        assert!(setup.accounts[0].is_writable);

        let swap = to_instruction(&body.swap_instruction).unwrap();
        assert_eq!(swap.data, vec![0, 1, 2]);
        assert!(body.cleanup_instruction.is_none());
    }

    #[test]
    fn test_rejects_bad_pubkey() {
        assert!(parse_pubkey("not-a-key").is_err());
    }
}
