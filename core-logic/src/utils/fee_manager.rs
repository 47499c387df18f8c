//! # Fee Estimator
//!
//! Serves priority fees from a periodically refreshed percentile table and
//! runs the escalation state machine that reacts to submission outcomes.
//!
//! The observation table is replaced wholesale on refresh and read without
//! contention. [`FeeState`] has exactly one writer at a time: every outcome
//! report goes through the same mutex.

use crate::config::FeeConfig;
use crate::error::{CoreError, FailureReason};
use crate::traits::ChainClient;
use crate::utils::rpc_manager::EndpointPool;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Fee tiers, ordered from cheapest to most aggressive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PriorityLevel {
    Min,
    Low,
    Medium,
    High,
    VeryHigh,
    UnsafeMax,
}

impl PriorityLevel {
    pub const ALL: [PriorityLevel; 6] = [
        PriorityLevel::Min,
        PriorityLevel::Low,
        PriorityLevel::Medium,
        PriorityLevel::High,
        PriorityLevel::VeryHigh,
        PriorityLevel::UnsafeMax,
    ];

    pub fn percentile(&self) -> u8 {
        match self {
            PriorityLevel::Min => 0,
            PriorityLevel::Low => 25,
            PriorityLevel::Medium => 50,
            PriorityLevel::High => 75,
            PriorityLevel::VeryHigh => 95,
            PriorityLevel::UnsafeMax => 100,
        }
    }

    pub fn step_up(self) -> Self {
        let idx = self as usize;
        Self::ALL[(idx + 1).min(Self::ALL.len() - 1)]
    }

    pub fn step_down(self) -> Self {
        let idx = self as usize;
        Self::ALL[idx.saturating_sub(1)]
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().replace(['_', '-'], "").as_str() {
            "min" => Some(PriorityLevel::Min),
            "low" => Some(PriorityLevel::Low),
            "medium" => Some(PriorityLevel::Medium),
            "high" => Some(PriorityLevel::High),
            "veryhigh" => Some(PriorityLevel::VeryHigh),
            "unsafemax" => Some(PriorityLevel::UnsafeMax),
            _ => None,
        }
    }
}

/// Caller-supplied scaling for how heavy a transaction is.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransactionShape {
    multiplier: f64,
}

impl TransactionShape {
    pub const TRANSFER: TransactionShape = TransactionShape { multiplier: 1.0 };
    pub const SWAP: TransactionShape = TransactionShape { multiplier: 1.5 };

    pub fn new(multiplier: f64) -> Self {
        let multiplier = if multiplier.is_finite() && multiplier > 0.0 {
            multiplier
        } else {
            1.0
        };
        Self { multiplier }
    }

    /// One transfer per recipient in a single transaction.
    pub fn funding(recipients: usize) -> Self {
        Self::new(1.0 + 0.1 * recipients.saturating_sub(1) as f64)
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }
}

impl Default for TransactionShape {
    fn default() -> Self {
        Self::TRANSFER
    }
}

/// Ordered percentile → fee mapping (micro-lamports per compute unit).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PercentileTable {
    points: BTreeMap<u8, u64>,
}

impl Default for PercentileTable {
    fn default() -> Self {
        Self::from_levels([
            (PriorityLevel::Min, 0),
            (PriorityLevel::Low, 1_000),
            (PriorityLevel::Medium, 10_000),
            (PriorityLevel::High, 100_000),
            (PriorityLevel::VeryHigh, 1_000_000),
            (PriorityLevel::UnsafeMax, 5_000_000),
        ])
    }
}

impl PercentileTable {
    pub fn from_points(points: impl IntoIterator<Item = (u8, u64)>) -> Self {
        Self {
            points: points.into_iter().map(|(p, fee)| (p.min(100), fee)).collect(),
        }
    }

    /// Builds a table from a provider's per-level estimates.
    pub fn from_levels(levels: impl IntoIterator<Item = (PriorityLevel, u64)>) -> Self {
        Self::from_points(levels.into_iter().map(|(l, fee)| (l.percentile(), fee)))
    }

    /// Builds a table from raw fee samples using nearest-rank percentiles.
    pub fn from_samples(mut samples: Vec<u64>) -> Self {
        if samples.is_empty() {
            return Self {
                points: BTreeMap::new(),
            };
        }
        samples.sort_unstable();
        let last = samples.len() - 1;
        Self::from_points(PriorityLevel::ALL.iter().map(|level| {
            let p = level.percentile() as usize;
            let rank = (p * last + 50) / 100;
            (level.percentile(), samples[rank.min(last)])
        }))
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Fee at an arbitrary percentile, interpolated between known points.
    pub fn fee_at(&self, percentile: u8) -> u64 {
        let below = self.points.range(..=percentile).next_back();
        let above = self.points.range(percentile..).next();
        match (below, above) {
            (Some((&p0, &f0)), Some((&p1, &f1))) if p1 > p0 => {
                let span = (p1 - p0) as f64;
                let t = (percentile - p0) as f64 / span;
                (f0 as f64 + (f1 as f64 - f0 as f64) * t).round() as u64
            }
            (Some((_, &fee)), _) | (None, Some((_, &fee))) => fee,
            (None, None) => 0,
        }
    }

    pub fn fee_for(&self, level: PriorityLevel) -> u64 {
        self.fee_at(level.percentile())
    }
}

/// A captured table. Never mutated after capture.
#[derive(Debug, Clone, Serialize)]
pub struct FeeObservation {
    pub table: PercentileTable,
    pub sampled_at: Option<DateTime<Utc>>,
}

/// Process-wide escalation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FeeState {
    pub current_level: PriorityLevel,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub recovery_mode: bool,
}

impl FeeState {
    fn new(level: PriorityLevel) -> Self {
        Self {
            current_level: level,
            consecutive_successes: 0,
            consecutive_failures: 0,
            recovery_mode: false,
        }
    }
}

#[derive(Debug)]
pub struct FeeEstimator {
    config: FeeConfig,
    observation: RwLock<Arc<FeeObservation>>,
    state: Mutex<FeeState>,
}

impl FeeEstimator {
    pub fn new(config: FeeConfig) -> Self {
        let state = FeeState::new(config.base_level.min(config.max_level));
        Self {
            config,
            observation: RwLock::new(Arc::new(FeeObservation {
                table: PercentileTable::default(),
                sampled_at: None,
            })),
            state: Mutex::new(state),
        }
    }

    fn state(&self) -> MutexGuard<'_, FeeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> FeeState {
        *self.state()
    }

    pub fn observation(&self) -> Arc<FeeObservation> {
        let guard = self
            .observation
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }

    /// Replaces the served table.
    pub fn install_table(&self, table: PercentileTable) {
        let observation = Arc::new(FeeObservation {
            table,
            sampled_at: Some(Utc::now()),
        });
        let mut guard = self
            .observation
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = observation;
    }

    fn clamp(&self, fee: f64) -> u64 {
        let fee = if fee.is_finite() { fee.max(0.0) } else { f64::MAX };
        (fee.round() as u64).clamp(self.config.min_fee, self.config.max_fee)
    }

    /// Fee for a requested level and shape. `None` follows the global tier;
    /// in recovery mode the global tier acts as a floor.
    pub fn estimate(&self, level: Option<PriorityLevel>, shape: TransactionShape) -> u64 {
        let state = self.snapshot();
        let requested = level.unwrap_or(state.current_level);
        let effective = if state.recovery_mode {
            requested.max(state.current_level)
        } else {
            requested
        };
        let base = self.observation().table.fee_for(effective);
        self.clamp(base as f64 * shape.multiplier())
    }

    pub fn handle_success(&self) {
        let mut state = self.state();
        state.consecutive_failures = 0;
        state.consecutive_successes = state.consecutive_successes.saturating_add(1);

        if state.recovery_mode && state.consecutive_successes >= self.config.deescalate_after {
            let lowered = state.current_level.step_down().max(PriorityLevel::Low);
            state.current_level = lowered;
            state.consecutive_successes = 0;
            if lowered <= self.config.base_level {
                state.recovery_mode = false;
                info!("Fee recovery mode exited at {:?}", lowered);
            } else {
                debug!("Fee tier lowered to {:?}", lowered);
            }
        }
    }

    /// Records a failure and returns the fee to use for the immediate retry.
    pub fn handle_failure(&self, reason: FailureReason, shape: TransactionShape) -> u64 {
        let (level, failures) = {
            let mut state = self.state();
            state.consecutive_successes = 0;
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);

            let escalate = if !state.recovery_mode {
                state.recovery_mode = true;
                true
            } else {
                (state.consecutive_failures - 1) % self.config.escalate_every == 0
            };
            if escalate {
                let raised = state.current_level.step_up().min(self.config.max_level);
                if raised != state.current_level {
                    warn!(
                        "Fee tier raised {:?} -> {:?} after {} ({} consecutive failures)",
                        state.current_level, raised, reason, state.consecutive_failures
                    );
                }
                state.current_level = raised;
            }
            (state.current_level, state.consecutive_failures)
        };

        let base = self.observation().table.fee_for(level) as f64 * shape.multiplier();
        let bump = self.bump_pct(failures, reason);
        self.clamp(base * (1.0 + bump / 100.0))
    }

    /// Bump in percent for the n-th consecutive failure.
    pub fn bump_pct(&self, failures: u32, reason: FailureReason) -> f64 {
        let schedule = &self.config.bump_schedule_pct;
        let idx = (failures.max(1) as usize - 1).min(schedule.len().saturating_sub(1));
        let mut pct = schedule.get(idx).copied().unwrap_or(0) as f64;
        if reason == FailureReason::ComputeBudgetExceeded {
            pct *= self.config.compute_budget_factor;
        }
        pct.min(self.config.max_bump_pct as f64)
    }

    /// Dedicated fee endpoint when configured, otherwise the primary.
    fn provider_url(&self, pool: &EndpointPool) -> String {
        self.config
            .fee_provider_url
            .clone()
            .unwrap_or_else(|| pool.primary().url.clone())
    }

    pub async fn refresh<C: ChainClient>(
        &self,
        chain: &C,
        pool: &EndpointPool,
    ) -> Result<(), CoreError> {
        let url = self.provider_url(pool);
        let table = chain.fetch_fee_percentiles(&url).await?;
        if table.is_empty() {
            return Err(CoreError::EndpointUnavailable {
                endpoint: url,
                reason: "empty fee table".to_string(),
            });
        }
        debug!(
            "Fee table refreshed from {}: medium={} high={}",
            url,
            table.fee_for(PriorityLevel::Medium),
            table.fee_for(PriorityLevel::High)
        );
        self.install_table(table);
        Ok(())
    }

    /// Fetches immediately, then every `refresh_interval`. A failed fetch
    /// keeps the last good table and retries after `retry_interval`.
    pub fn spawn_refresh_loop<C: ChainClient>(
        self: Arc<Self>,
        chain: Arc<C>,
        pool: Arc<EndpointPool>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let refresh_every = Duration::from_secs(self.config.refresh_interval_secs);
        let retry_after = Duration::from_secs(self.config.retry_interval_secs);

        tokio::spawn(async move {
            loop {
                let wait = match self.refresh(chain.as_ref(), &pool).await {
                    Ok(()) => refresh_every,
                    Err(e) => {
                        warn!("Fee refresh failed, keeping last table: {}", e);
                        retry_after
                    }
                };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
            }
            debug!("Fee refresh loop stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimator() -> FeeEstimator {
        FeeEstimator::new(FeeConfig::default())
    }

    #[test]
    fn test_default_table_matches_levels() {
        let fees = estimator();
        assert_eq!(fees.estimate(Some(PriorityLevel::Medium), TransactionShape::TRANSFER), 10_000);
        assert_eq!(fees.estimate(Some(PriorityLevel::High), TransactionShape::TRANSFER), 100_000);
        assert_eq!(fees.estimate(None, TransactionShape::SWAP), 15_000);
    }

    #[test]
    fn test_table_interpolates() {
        let table = PercentileTable::from_points([(0, 0), (50, 100)]);
        assert_eq!(table.fee_at(25), 50);
        assert_eq!(table.fee_at(100), 100);
    }

    #[test]
    fn test_table_from_samples() {
        let table = PercentileTable::from_samples((1..=101).collect());
        assert_eq!(table.fee_for(PriorityLevel::Min), 1);
        assert_eq!(table.fee_for(PriorityLevel::Medium), 51);
        assert_eq!(table.fee_for(PriorityLevel::UnsafeMax), 101);
        assert!(PercentileTable::from_samples(vec![]).is_empty());
    }

    #[test]
    fn test_failure_enters_recovery_and_raises_tier() {
        let fees = estimator();
        let fee = fees.handle_failure(FailureReason::SimulationFailed, TransactionShape::TRANSFER);
        let state = fees.snapshot();
        assert!(state.recovery_mode);
        assert_eq!(state.current_level, PriorityLevel::High);
        assert_eq!(fee, 125_000);
    }

    #[test]
    fn test_compute_budget_gets_larger_bump() {
        let fees = estimator();
        assert!(
            fees.bump_pct(1, FailureReason::ComputeBudgetExceeded)
                > fees.bump_pct(1, FailureReason::SimulationFailed)
        );
        assert_eq!(fees.bump_pct(5, FailureReason::ComputeBudgetExceeded), 425.0);
        assert_eq!(fees.bump_pct(40, FailureReason::Other), 425.0);
    }

    #[test]
    fn test_fee_never_exceeds_cap() {
        let fees = estimator();
        let cap = FeeConfig::default().max_fee;
        for _ in 0..50 {
            let fee = fees.handle_failure(
                FailureReason::ComputeBudgetExceeded,
                TransactionShape::new(4.0),
            );
            assert!(fee <= cap);
            assert!(fees.estimate(Some(PriorityLevel::UnsafeMax), TransactionShape::new(4.0)) <= cap);
        }
        assert!(fees.snapshot().current_level <= FeeConfig::default().max_level);
    }

    #[test]
    fn test_deescalates_one_tier_per_streak() {
        let fees = estimator();
        for _ in 0..5 {
            fees.handle_failure(FailureReason::Other, TransactionShape::TRANSFER);
        }
        let peak = fees.snapshot().current_level;
        assert_eq!(peak, PriorityLevel::UnsafeMax);

        let mut previous = peak;
        for _ in 0..3 {
            for _ in 0..3 {
                fees.handle_success();
            }
            let now = fees.snapshot().current_level;
            assert_eq!(now, previous.step_down());
            previous = now;
        }
        assert_eq!(previous, PriorityLevel::Medium);
        assert!(!fees.snapshot().recovery_mode);
    }

    #[test]
    fn test_recovery_mode_floors_requested_level() {
        let fees = estimator();
        fees.handle_failure(FailureReason::Other, TransactionShape::TRANSFER);
        assert_eq!(
            fees.estimate(Some(PriorityLevel::Low), TransactionShape::TRANSFER),
            100_000
        );
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(PriorityLevel::parse("very_high"), Some(PriorityLevel::VeryHigh));
        assert_eq!(PriorityLevel::parse("UnsafeMax"), Some(PriorityLevel::UnsafeMax));
        assert_eq!(PriorityLevel::parse("ultra"), None);
    }
}
