//! # Core Logic - Resilient Transaction Submission
//!
//! Chain-agnostic engine behind the volume maker. Chain crates implement
//! [`ChainClient`]; everything else (endpoint failover, fee escalation,
//! confirmation polling, recovery bookkeeping, cycle orchestration) lives
//! here.
//!
//! ## Modules
//!
//! - [`config`] - Engine configuration with defaults for every section
//! - [`confirmation`] - Non-blocking confirmation tracker
//! - [`database`] - Async SQLite statistics journal
//! - [`error`] - Typed error handling with thiserror
//! - [`metrics`] - Run counters behind `get_status`
//! - [`orchestrator`] - Batch, cyclic and infinite run loops
//! - [`recovery`] - Durable recovery ledger and its worker
//! - [`security`] - Secret sealing (AES-256-GCM + scrypt)
//! - [`submitter`] - Submission with fee escalation and failover
//! - [`traits`] - Chain client interface
//! - `utils` - Endpoint pool, fee estimator, logging, retry, wallet loading

pub mod config;
pub mod confirmation;
pub mod database;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod recovery;
pub mod security;
pub mod submitter;
pub mod traits;
pub(crate) mod utils;

// Selective exports - only public API types
pub use config::{
    ConfirmationConfig, EndpointConfig, EngineConfig, FeeConfig, OrchestratorConfig,
    RecoveryConfig, StorageConfig,
};
pub use confirmation::{
    ConfirmationHandle, ConfirmationOutcome, ConfirmationStatus, ConfirmationTracker,
};
pub use database::{OutcomeTotals, StatsDatabase};
pub use error::{
    ConfigError, CoreError, DatabaseError, FailureReason, SecurityError, WalletError,
};
pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use orchestrator::{
    BatchCycle, BatchRequest, InfiniteRequest, Orchestrator, RunHistory, RunMode, RunSummary,
    StatusReport, StopReason, TerminationPolicy,
};
pub use recovery::{
    RecordStage, RecoveryExecutor, RecoveryLedger, RecoveryPassReport, RecoveryRecord,
    SecretMaterial,
};
pub use security::{KeySealer, SealedSecret, SecurityUtils};
pub use submitter::{Submission, Submitter, TxPlan};
pub use traits::{ChainClient, OperationRequest, TxSigner, TxStatus, WalletHandle};

pub use utils::fee_manager::{
    FeeEstimator, FeeState, PercentileTable, PriorityLevel, TransactionShape,
};
pub use utils::logger::{setup_logger, TX_RESULT_TARGET};
pub use utils::persist::write_json_atomic;
pub use utils::retry::{classify_failure, with_retry, RetryConfig};
pub use utils::rpc_manager::{Endpoint, EndpointHealth, EndpointPool, EndpointRole};
pub use utils::runner::{log_run_totals, ShutdownSignal};
pub use utils::wallet_manager::{MainWalletSource, WalletManager};
