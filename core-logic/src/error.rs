//! # Core Error Types
//!
//! Centralized error definitions for the core-logic crate.
//! All errors implement `std::error::Error` and `std::fmt::Display`.
//!
//! [`CoreError`] carries the submission failure taxonomy. Only configuration
//! level failures are fatal to a run; everything else is local to one wallet
//! or one attempt.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Unified error type for core-logic operations.
///
/// This enum wraps all specific error types and provides a unified
/// error interface for the application layer.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Transient endpoint problem. Triggers failover, never fatal.
    #[error("Endpoint {endpoint} unavailable: {reason}")]
    EndpointUnavailable { endpoint: String, reason: String },

    /// The network refused the transaction (simulation, signature, fee).
    #[error("Submission rejected ({reason}): {message}")]
    SubmissionRejected {
        reason: FailureReason,
        message: String,
    },

    #[error("Confirmation of {signature} timed out after {attempts} polls")]
    ConfirmationTimeout { signature: String, attempts: u32 },

    /// Fatal for one wallet only.
    #[error("Insufficient funds in {wallet}: need {required}, have {available}")]
    InsufficientFunds {
        wallet: String,
        required: u64,
        available: u64,
    },

    /// The recovery ledger could not be written after every retry.
    #[error("Failed to persist {path}: {reason}")]
    PersistenceFailure { path: String, reason: String },

    #[error(transparent)]
    Config(ConfigError),

    #[error(transparent)]
    Wallet(WalletError),

    #[error(transparent)]
    Security(SecurityError),

    #[error("Database error: {0}")]
    Database(DatabaseError),

    #[error("Chain error: {message}")]
    Chain { message: String },
}

impl CoreError {
    pub fn chain(message: impl Into<String>) -> Self {
        CoreError::Chain {
            message: message.into(),
        }
    }

    /// Errors that must abort the whole run instead of one wallet.
    ///
    /// A ledger that cannot be written is treated as fatal: funding more
    /// wallets without a durable record would risk stranding them.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CoreError::Config(_) | CoreError::Security(_) | CoreError::PersistenceFailure { .. }
        )
    }

    /// Maps the error onto the reason recorded in recovery records and fed
    /// to the fee estimator.
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            CoreError::EndpointUnavailable { .. } => FailureReason::EndpointUnavailable,
            CoreError::SubmissionRejected { reason, .. } => *reason,
            CoreError::ConfirmationTimeout { .. } => FailureReason::ConfirmationTimeout,
            CoreError::InsufficientFunds { .. } => FailureReason::InsufficientFunds,
            CoreError::Chain { message } => crate::utils::retry::classify_failure(message),
            _ => FailureReason::Other,
        }
    }
}

impl From<ConfigError> for CoreError {
    fn from(e: ConfigError) -> Self {
        CoreError::Config(e)
    }
}

impl From<WalletError> for CoreError {
    fn from(e: WalletError) -> Self {
        CoreError::Wallet(e)
    }
}

impl From<SecurityError> for CoreError {
    fn from(e: SecurityError) -> Self {
        CoreError::Security(e)
    }
}

impl From<DatabaseError> for CoreError {
    fn from(e: DatabaseError) -> Self {
        CoreError::Database(e)
    }
}

/// Why a submission, confirmation or recovery attempt did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    ComputeBudgetExceeded,
    BlockhashExpired,
    SimulationFailed,
    InsufficientFunds,
    RateLimited,
    EndpointUnavailable,
    OnChainFailure,
    ConfirmationTimeout,
    /// The process stopped before the outcome was known.
    Interrupted,
    Other,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::ComputeBudgetExceeded => "compute_budget_exceeded",
            FailureReason::BlockhashExpired => "blockhash_expired",
            FailureReason::SimulationFailed => "simulation_failed",
            FailureReason::InsufficientFunds => "insufficient_funds",
            FailureReason::RateLimited => "rate_limited",
            FailureReason::EndpointUnavailable => "endpoint_unavailable",
            FailureReason::OnChainFailure => "on_chain_failure",
            FailureReason::ConfirmationTimeout => "confirmation_timeout",
            FailureReason::Interrupted => "interrupted",
            FailureReason::Other => "other",
        }
    }

    /// True when the endpoint itself misbehaved rather than the transaction.
    pub fn is_endpoint_fault(&self) -> bool {
        matches!(
            self,
            FailureReason::EndpointUnavailable | FailureReason::RateLimited
        )
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration-related errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("Invalid RPC URL format: '{url}'")]
    InvalidRpcUrl { url: String },

    #[error("Missing required configuration field: '{field}'")]
    MissingField { field: String },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("I/O error reading {path}: {msg}")]
    IoError { path: String, msg: String },

    #[error("Main wallet balance {balance} below required {required} base units")]
    MainWalletUnderfunded { balance: u64, required: u64 },

    #[error("No usable endpoint: {reason}")]
    NoUsableEndpoint { reason: String },
}

/// Wallet and key material errors
#[derive(Error, Debug, Clone)]
pub enum WalletError {
    #[error("Decryption failed for wallet at '{path}': {reason}")]
    DecryptionFailed { path: String, reason: String },

    #[error("No main wallet found (checked {checked})")]
    NotFound { checked: String },

    #[error("Invalid private key format: {reason}")]
    InvalidKeyFormat { reason: String },
}

/// Statistics database errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Connection pool exhausted (max: {max_size})")]
    PoolExhausted { max_size: u32 },

    #[error("Transaction failed: {msg}")]
    TransactionFailed { msg: String },

    #[error("Statistics channel closed")]
    ChannelClosed,
}

/// Security-related errors
#[derive(Error, Debug, Clone)]
pub enum SecurityError {
    #[error("Password required but not provided")]
    PasswordRequired,

    #[error("Encryption/decryption failed: {reason}")]
    CryptographyFailed { reason: String },

    #[error("Invalid sealed component '{component}': {reason}")]
    InvalidComponent { component: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let cfg = CoreError::from(ConfigError::MainWalletUnderfunded {
            balance: 1,
            required: 10,
        });
        assert!(cfg.is_fatal());

        let funds = CoreError::InsufficientFunds {
            wallet: "w".into(),
            required: 10,
            available: 1,
        };
        assert!(!funds.is_fatal());
        assert_eq!(funds.failure_reason(), FailureReason::InsufficientFunds);

        let timeout = CoreError::ConfirmationTimeout {
            signature: "sig".into(),
            attempts: 5,
        };
        assert!(!timeout.is_fatal());
        assert_eq!(timeout.failure_reason(), FailureReason::ConfirmationTimeout);
    }

    #[test]
    fn test_chain_error_is_classified_from_message() {
        let err = CoreError::chain("Transaction simulation failed: compute budget exceeded");
        assert_eq!(err.failure_reason(), FailureReason::ComputeBudgetExceeded);
    }

    #[test]
    fn test_reason_serializes_snake_case() {
        let json = serde_json::to_string(&FailureReason::BlockhashExpired).unwrap();
        assert_eq!(json, "\"blockhash_expired\"");
    }
}
