mod chain;
mod config;
mod fees;
mod jupiter;

use anyhow::{Context, Result};
use chain::SolanaChain;
use clap::{Args, Parser, Subcommand, ValueEnum};
use crate::config::SolanaConfig;
use core_logic::{
    log_run_totals, setup_logger, BatchRequest, InfiniteRequest, KeySealer, OperationRequest,
    Orchestrator, PriorityLevel, ShutdownSignal, WalletManager,
};
use dialoguer::{theme::ColorfulTheme, Password};
use dotenv::dotenv;
use solana_sdk::native_token::sol_to_lamports;
use std::env;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Creating this file ends an infinite run after the current cycle.
const STOP_FILE: &str = "stop_infinite_mode.flag";

#[derive(Parser, Debug)]
#[command(author, version, about = "Solana volume maker", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "config.toml")]
    config: String,
    #[arg(long, default_value = "logs")]
    log_dir: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a single batch.
    Batch(BatchArgs),
    /// Run batches until a total wallet count is used.
    Cyclic {
        #[command(flatten)]
        batch: BatchArgs,
        #[arg(long, default_value_t = 20)]
        total_wallets: u64,
        /// Seconds between cycles.
        #[arg(long, default_value_t = 2)]
        pause: u64,
    },
    /// Run batches until stopped, a time budget or a success target.
    Infinite {
        #[command(flatten)]
        batch: BatchArgs,
        #[arg(long, default_value_t = 2)]
        pause: u64,
        /// Maximum runtime in hours.
        #[arg(long)]
        hours: Option<f64>,
        /// Stop after this many successful wallets.
        #[arg(long)]
        target_tx: Option<u64>,
    },
    /// Retry every unresolved wallet in the recovery file now.
    Recover,
    /// Print engine status as JSON.
    Status,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum OperationKind {
    Swap,
    Transfer,
}

#[derive(Args, Debug)]
struct BatchArgs {
    /// Wallets per batch.
    #[arg(short, long, default_value_t = 5, value_parser = clap::value_parser!(u64).range(1..=20))]
    wallets: u64,
    /// SOL sent to each wallet.
    #[arg(short, long, default_value_t = 0.001)]
    amount: f64,
    /// SOL each wallet swaps or transfers. Defaults to half the funded amount.
    #[arg(long)]
    swap_amount: Option<f64>,
    #[arg(long, value_enum, default_value_t = OperationKind::Swap)]
    mode: OperationKind,
    /// Token to buy; falls back to `solana.default_token`.
    #[arg(long)]
    token: Option<String>,
    /// Batch wallet pays fees while the main wallet supplies the value.
    #[arg(long)]
    multisig: bool,
    /// Fixed fee tier (min, low, medium, high, very-high, unsafe-max).
    #[arg(long, value_parser = parse_priority)]
    priority: Option<PriorityLevel>,
}

fn parse_priority(value: &str) -> Result<PriorityLevel, String> {
    PriorityLevel::parse(value).ok_or_else(|| format!("unknown priority level '{}'", value))
}

impl BatchArgs {
    fn request(&self, config: &SolanaConfig) -> Result<BatchRequest> {
        let token = match self.mode {
            OperationKind::Swap => Some(
                self.token
                    .clone()
                    .or_else(|| config.solana.default_token.clone())
                    .context("swap mode needs --token or solana.default_token")?,
            ),
            OperationKind::Transfer => None,
        };
        let amount_per_wallet = sol_to_lamports(self.amount);
        let operation_amount = match self.swap_amount {
            Some(sol) => sol_to_lamports(sol),
            None => amount_per_wallet / 2,
        };
        if !self.multisig && operation_amount >= amount_per_wallet {
            anyhow::bail!("--swap-amount must leave room for fees in the funded amount");
        }

        Ok(BatchRequest {
            wallet_count: self.wallets as usize,
            amount_per_wallet,
            operation: OperationRequest {
                token,
                amount: operation_amount,
                use_multisig: self.multisig,
            },
            priority_level: self.priority,
        })
    }
}

/// `WALLET_PASSWORD`, or an interactive prompt.
fn wallet_password() -> Result<String> {
    if let Ok(password) = env::var("WALLET_PASSWORD") {
        return Ok(password);
    }
    warn!("WALLET_PASSWORD environment variable is not set.");
    Password::with_theme(&ColorfulTheme::default())
        .with_prompt("Enter wallet password")
        .interact()
        .context("Password prompt failed")
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();
    let _log_guard = setup_logger(&cli.log_dir);

    info!("Loading Solana config from: {}", cli.config);
    let config = SolanaConfig::load(&cli.config)?;

    let wallets = WalletManager::new("MAIN_WALLET_KEY");
    let password = if wallets.needs_password() {
        Some(wallet_password()?)
    } else {
        env::var("WALLET_PASSWORD").ok()
    };
    let main_secret = wallets.load_main_secret(password.as_deref())?;
    // Recovery records are sealed with the wallet password when there is one.
    let sealer = password.map(KeySealer::new).transpose()?;

    let chain = Arc::new(SolanaChain::new(&main_secret, config.solana.clone())?);
    let shutdown = ShutdownSignal::install_ctrl_c();
    let orchestrator =
        Orchestrator::start(config.engine(), Arc::clone(&chain), sealer, shutdown).await?;

    let started = Instant::now();
    let result = run(&orchestrator, &config, cli.command, started).await;
    if let Err(e) = &result {
        error!("Run failed: {:#}", e);
    }
    orchestrator.shutdown().await;
    result
}

async fn run(
    orchestrator: &Orchestrator<SolanaChain>,
    config: &SolanaConfig,
    command: Command,
    started: Instant,
) -> Result<()> {
    match command {
        Command::Batch(args) => {
            let cycle = orchestrator.run_batch(args.request(config)?).await?;
            log_run_totals(started.elapsed(), cycle.successes, cycle.failures);
        }
        Command::Cyclic {
            batch,
            total_wallets,
            pause,
        } => {
            let summary = orchestrator
                .run_cycles(batch.request(config)?, total_wallets, Duration::from_secs(pause))
                .await?;
            log_run_totals(started.elapsed(), summary.total_successes, summary.total_failures);
        }
        Command::Infinite {
            batch,
            pause,
            hours,
            target_tx,
        } => {
            if Path::new(STOP_FILE).exists() {
                std::fs::remove_file(STOP_FILE)
                    .with_context(|| format!("Failed to remove stale {}", STOP_FILE))?;
            }
            info!("Create {} to stop after the current cycle", STOP_FILE);

            let request = InfiniteRequest {
                batch: batch.request(config)?,
                pause: Duration::from_secs(pause),
                max_runtime: hours.map(|h| Duration::from_secs_f64(h.max(0.0) * 3600.0)),
                target_successes: target_tx,
            };
            let summary = orchestrator
                .run_infinite(request, || Path::new(STOP_FILE).exists())
                .await?;
            log_run_totals(started.elapsed(), summary.total_successes, summary.total_failures);
        }
        Command::Recover => {
            let report = orchestrator.recover_now().await?;
            info!(
                "Recovery pass: {} attempted, {} resolved, {} failed, {} still unresolved",
                report.attempted, report.resolved, report.failed, report.remaining_unresolved
            );
        }
        Command::Status => {
            let report = serde_json::json!({
                "engine": orchestrator.get_status(),
                "history": orchestrator.history().await,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}
