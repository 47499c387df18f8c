use crate::networks::{Network, MULTICALL3};
use ::config::{Config, Environment, File};
use anyhow::{Context, Result};
use core_logic::{
    ConfirmationConfig, EndpointConfig, EngineConfig, FeeConfig, OrchestratorConfig,
    RecoveryConfig, StorageConfig,
};
use serde::Deserialize;

/// `config.toml` layout: the engine sections at the top level plus an
/// `[evm]` table for the network.
#[derive(Debug, Clone, Deserialize)]
pub struct EvmConfig {
    pub endpoints: EndpointConfig,
    #[serde(default)]
    pub fees: FeeConfig,
    #[serde(default)]
    pub confirmation: ConfirmationConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub evm: ChainSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChainSettings {
    pub network: Network,
    /// Overrides the network's chain id (forks, testnets).
    pub chain_id: Option<u64>,
    /// Uniswap V2 compatible router. Required for swaps.
    pub router: Option<String>,
    pub wrapped_native: Option<String>,
    pub multicall: String,
    /// Token bought by `swap` operations when none is given on the command line.
    pub default_token: Option<String>,
    pub slippage_bps: u16,
    /// Force `gasPrice` transactions even where EIP-1559 is available.
    pub legacy_gas: Option<bool>,
    /// `maxFeePerGas` is this multiple of the latest base fee plus the tip.
    pub base_fee_multiplier: f64,
    /// Headroom applied to `eth_estimateGas` results.
    pub gas_limit_margin: f64,
    /// Fixed limits where the swap cannot be simulated (sell behind a
    /// pending approval).
    pub swap_gas_limit: u64,
    pub approve_gas_limit: u64,
    /// Blocks on top of the receipt's block before a transaction counts as
    /// final.
    pub confirmations: u64,
    pub fee_history_blocks: u64,
    pub deadline_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self {
            network: Network::default(),
            chain_id: None,
            router: None,
            wrapped_native: None,
            multicall: MULTICALL3.to_string(),
            default_token: None,
            slippage_bps: 50,
            legacy_gas: None,
            base_fee_multiplier: 1.5,
            gas_limit_margin: 1.2,
            swap_gas_limit: 300_000,
            approve_gas_limit: 60_000,
            confirmations: 2,
            fee_history_blocks: 10,
            deadline_secs: 300,
            request_timeout_secs: 30,
        }
    }
}

impl ChainSettings {
    pub fn chain_id(&self) -> u64 {
        self.chain_id.unwrap_or(self.network.preset().chain_id)
    }

    pub fn legacy_gas(&self) -> bool {
        self.legacy_gas.unwrap_or(self.network.preset().legacy_gas)
    }

    pub fn wrapped_native(&self) -> &str {
        self.wrapped_native
            .as_deref()
            .unwrap_or(self.network.preset().wrapped_native)
    }
}

impl EvmConfig {
    /// Loads `path`, then applies `VOLUME_*` environment overrides such as
    /// `VOLUME_EVM__ROUTER`.
    pub fn load(path: &str) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("VOLUME")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("endpoints.alternatives")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read config {}", path))?;

        settings
            .try_deserialize()
            .with_context(|| format!("Invalid config {}", path))
    }

    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            endpoints: self.endpoints.clone(),
            fees: self.fees.clone(),
            confirmation: self.confirmation.clone(),
            recovery: self.recovery.clone(),
            orchestrator: self.orchestrator.clone(),
            storage: self.storage.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_preset_fills_unset_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[endpoints]\nprimary = \"https://rpc.example\"\nalternatives = []\n\n[evm]\nnetwork = \"bsc\"\nrouter = \"0x10ED43C718714eb63d5aA57B78B54704E256024E\"\n",
        )
        .unwrap();

        let config = EvmConfig::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.evm.network, Network::Bsc);
        assert_eq!(config.evm.chain_id(), 56);
        assert!(config.evm.legacy_gas());
        assert_eq!(config.evm.slippage_bps, 50);
        assert_eq!(config.evm.multicall, MULTICALL3);
        assert!(config.engine().validate().is_ok());
    }

    #[test]
    fn test_explicit_values_override_preset() {
        let settings = ChainSettings {
            network: Network::Base,
            chain_id: Some(84532),
            legacy_gas: Some(true),
            wrapped_native: Some("0x0000000000000000000000000000000000000001".to_string()),
            ..ChainSettings::default()
        };
        assert_eq!(settings.chain_id(), 84532);
        assert!(settings.legacy_gas());
        assert_eq!(
            settings.wrapped_native(),
            "0x0000000000000000000000000000000000000001"
        );
    }
}
