use anyhow::{Context, Result};
use ::config::{Config, Environment, File};
use core_logic::{
    ConfirmationConfig, EndpointConfig, EngineConfig, FeeConfig, OrchestratorConfig,
    RecoveryConfig, StorageConfig,
};
use serde::Deserialize;

/// `config.toml` layout: the engine sections at the top level plus a
/// `[solana]` table for chain specifics.
#[derive(Debug, Clone, Deserialize)]
pub struct SolanaConfig {
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
    pub solana: ChainSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChainSettings {
    pub jupiter_url: String,
    pub slippage_bps: u16,
    /// Token bought by `swap` operations when none is given on the command line.
    pub default_token: Option<String>,
    /// Use Helius `getPriorityFeeEstimate` on the fee provider URL.
    pub helius_fees: bool,
    pub transfer_compute_units: u32,
    pub swap_compute_units: u32,
    pub request_timeout_secs: u64,
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self {
            jupiter_url: "https://quote-api.jup.ag/v6".to_string(),
            slippage_bps: 500,
            default_token: None,
            helius_fees: false,
            transfer_compute_units: 1_400,
            swap_compute_units: 300_000,
            request_timeout_secs: 30,
        }
    }
}

impl SolanaConfig {
    /// Loads `path`, then applies `VOLUME_*` environment overrides such as
    /// `VOLUME_ENDPOINTS__PRIMARY`.
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
    fn test_minimal_toml_loads_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[endpoints]\nprimary = \"https://rpc.example\"\nalternatives = [\"https://alt.example\"]\n\n[solana]\nslippage_bps = 100\n",
        )
        .unwrap();

        let config = SolanaConfig::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.endpoints.alternatives.len(), 1);
        assert_eq!(config.solana.slippage_bps, 100);
        assert_eq!(config.solana.swap_compute_units, 300_000);
        assert_eq!(config.recovery.max_attempts, 5);
        assert!(config.engine().validate().is_ok());
    }
}
