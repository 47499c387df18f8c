use crate::error::ConfigError;
use crate::utils::fee_manager::PriorityLevel;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level settings for the submission engine.
///
/// Every section falls back to its defaults, so a TOML file only needs to
/// name the primary endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub endpoints: EndpointConfig,
    pub fees: FeeConfig,
    pub confirmation: ConfirmationConfig,
    pub recovery: RecoveryConfig,
    pub orchestrator: OrchestratorConfig,
    pub storage: StorageConfig,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.endpoints.validate()?;
        self.fees.validate()?;

        if self.confirmation.max_retries == 0 {
            return Err(invalid("confirmation.max_retries", "must be at least 1"));
        }
        if self.confirmation.base_delay_ms == 0 {
            return Err(invalid("confirmation.base_delay_ms", "must be positive"));
        }
        if self.confirmation.max_concurrent_polls == 0 {
            return Err(invalid("confirmation.max_concurrent_polls", "must be positive"));
        }
        if self.recovery.max_attempts == 0 {
            return Err(invalid("recovery.max_attempts", "must be at least 1"));
        }
        if self.recovery.recovery_file.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "recovery.recovery_file".to_string(),
            });
        }
        if self.orchestrator.max_parallel_wallets == 0 {
            return Err(invalid("orchestrator.max_parallel_wallets", "must be positive"));
        }
        if self.orchestrator.max_submit_attempts == 0 {
            return Err(invalid("orchestrator.max_submit_attempts", "must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

fn validate_url(url: &str) -> Result<(), ConfigError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(ConfigError::InvalidRpcUrl {
            url: url.to_string(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Endpoint reserved for submissions.
    pub primary: String,
    /// Endpoints preferred for confirmation polling.
    pub alternatives: Vec<String>,
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            primary: String::new(),
            alternatives: Vec::new(),
            failure_threshold: 3,
            cooldown_secs: 60,
        }
    }
}

impl EndpointConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.primary.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "endpoints.primary".to_string(),
            });
        }
        validate_url(&self.primary)?;
        for url in &self.alternatives {
            validate_url(url)?;
        }
        if self.failure_threshold == 0 {
            return Err(invalid("endpoints.failure_threshold", "must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeeConfig {
    /// High-quality fee provider. Falls back to the primary endpoint.
    pub fee_provider_url: Option<String>,
    pub refresh_interval_secs: u64,
    /// Early retry after a failed refresh.
    pub retry_interval_secs: u64,
    pub base_level: PriorityLevel,
    /// Highest tier escalation may reach.
    pub max_level: PriorityLevel,
    /// Micro-lamports per compute unit on Solana, wei per gas on EVM networks.
    pub min_fee: u64,
    pub max_fee: u64,
    /// Bump in percent for the 1st, 2nd, ... consecutive failure.
    pub bump_schedule_pct: Vec<u32>,
    pub max_bump_pct: u32,
    pub compute_budget_factor: f64,
    /// Successes needed in recovery mode to step down one tier.
    pub deescalate_after: u32,
    /// Further failures needed in recovery mode to step up one more tier.
    pub escalate_every: u32,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            fee_provider_url: None,
            refresh_interval_secs: 300,
            retry_interval_secs: 30,
            base_level: PriorityLevel::Medium,
            max_level: PriorityLevel::UnsafeMax,
            min_fee: 0,
            max_fee: 5_000_000,
            bump_schedule_pct: vec![25, 75, 150, 275, 425],
            max_bump_pct: 425,
            compute_budget_factor: 1.5,
            deescalate_after: 3,
            escalate_every: 2,
        }
    }
}

impl FeeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(url) = &self.fee_provider_url {
            validate_url(url)?;
        }
        if self.bump_schedule_pct.is_empty() {
            return Err(invalid("fees.bump_schedule_pct", "must not be empty"));
        }
        if self.bump_schedule_pct.windows(2).any(|w| w[1] < w[0]) {
            return Err(invalid("fees.bump_schedule_pct", "must be non-decreasing"));
        }
        if self.max_fee < self.min_fee {
            return Err(invalid("fees.max_fee", "must not be below fees.min_fee"));
        }
        if self.max_level < self.base_level {
            return Err(invalid("fees.max_level", "must not be below fees.base_level"));
        }
        if self.compute_budget_factor < 1.0 {
            return Err(invalid("fees.compute_budget_factor", "must be at least 1.0"));
        }
        if self.deescalate_after == 0 || self.escalate_every == 0 {
            return Err(invalid("fees.deescalate_after", "streak lengths must be positive"));
        }
        if self.refresh_interval_secs == 0 || self.retry_interval_secs == 0 {
            return Err(invalid("fees.refresh_interval_secs", "intervals must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfirmationConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_retries: u32,
    pub max_concurrent_polls: usize,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            max_retries: 5,
            max_concurrent_polls: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub recovery_file: String,
    /// Resolved records are appended here, one JSON object per line.
    pub archive_file: String,
    pub interval_secs: u64,
    /// Attempts per record before it is left for manual recovery.
    pub max_attempts: u32,
    pub write_retries: u32,
    pub write_backoff_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            recovery_file: "wallet_recovery/failed_batch_wallets.json".to_string(),
            archive_file: "wallet_recovery/recovered_wallets.jsonl".to_string(),
            interval_secs: 120,
            max_attempts: 5,
            write_retries: 3,
            write_backoff_ms: 200,
        }
    }
}

impl RecoveryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_parallel_wallets: usize,
    pub max_submit_attempts: u32,
    /// Skip the per-wallet balance check after funding confirms.
    pub trust_funding_confirmation: bool,
    /// Lamports kept on the main wallet on top of the batch amount.
    pub main_wallet_reserve: u64,
    pub summary_dir: String,
    /// Fixed summary path. Defaults to a timestamped file in `summary_dir`.
    pub summary_file: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_parallel_wallets: 8,
            max_submit_attempts: 3,
            trust_funding_confirmation: true,
            main_wallet_reserve: 10_000_000,
            summary_dir: "results".to_string(),
            summary_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Optional SQLite statistics journal.
    pub stats_db: Option<String>,
    pub channel_capacity: usize,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            stats_db: None,
            channel_capacity: 1000,
            batch_size: 200,
            flush_interval_ms: 200,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.endpoints.primary = "https://api.mainnet-beta.solana.com".to_string();
        config
    }

    #[test]
    fn test_defaults_validate_once_primary_is_set() {
        assert!(EngineConfig::default().validate().is_err());
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_alternative_url() {
        let mut config = valid();
        config.endpoints.alternatives.push("ws://nope".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRpcUrl { .. })
        ));
    }

    #[test]
    fn test_rejects_decreasing_bump_schedule() {
        let mut config = valid();
        config.fees.bump_schedule_pct = vec![50, 25];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig = serde_json::from_str(
            r#"{ "endpoints": { "primary": "https://rpc.example" }, "fees": { "max_fee": 42 } }"#,
        )
        .unwrap();
        assert_eq!(config.endpoints.failure_threshold, 3);
        assert_eq!(config.fees.max_fee, 42);
        assert_eq!(config.fees.refresh_interval_secs, 300);
        assert_eq!(config.confirmation.max_retries, 5);
    }
}
