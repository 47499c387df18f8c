use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: String,
    pub uptime_secs: u64,
    pub wallets: WalletMetrics,
    pub confirmations: ConfirmationMetrics,
    pub submissions: SubmissionMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct WalletMetrics {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub recovered: u64,
    pub success_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfirmationMetrics {
    pub confirmed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmissionMetrics {
    pub attempts: u64,
    pub rejected: u64,
}

/// Counters shared by the engine's components. Owned by the engine and
/// handed out by `Arc`.
#[derive(Debug)]
pub struct MetricsCollector {
    wallets_total: AtomicU64,
    wallets_success: AtomicU64,
    wallets_failed: AtomicU64,
    wallets_recovered: AtomicU64,
    confirmed: AtomicU64,
    confirm_failed: AtomicU64,
    confirm_timed_out: AtomicU64,
    confirm_latency_sum_ms: AtomicU64,
    confirm_min_latency_ms: AtomicU64,
    confirm_max_latency_ms: AtomicU64,
    submit_attempts: AtomicU64,
    submit_rejected: AtomicU64,
    start_time: Instant,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self {
            wallets_total: AtomicU64::new(0),
            wallets_success: AtomicU64::new(0),
            wallets_failed: AtomicU64::new(0),
            wallets_recovered: AtomicU64::new(0),
            confirmed: AtomicU64::new(0),
            confirm_failed: AtomicU64::new(0),
            confirm_timed_out: AtomicU64::new(0),
            confirm_latency_sum_ms: AtomicU64::new(0),
            confirm_min_latency_ms: AtomicU64::new(u64::MAX),
            confirm_max_latency_ms: AtomicU64::new(0),
            submit_attempts: AtomicU64::new(0),
            submit_rejected: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }
}

/// Terminal confirmation buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationKind {
    Confirmed,
    Failed,
    TimedOut,
}

impl MetricsCollector {
    pub fn record_wallet(&self, success: bool) {
        self.wallets_total.fetch_add(1, Ordering::SeqCst);
        if success {
            self.wallets_success.fetch_add(1, Ordering::SeqCst);
        } else {
            self.wallets_failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn record_recovered(&self) {
        self.wallets_recovered.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_confirmation(&self, kind: ConfirmationKind, latency: Duration) {
        let counter = match kind {
            ConfirmationKind::Confirmed => &self.confirmed,
            ConfirmationKind::Failed => &self.confirm_failed,
            ConfirmationKind::TimedOut => &self.confirm_timed_out,
        };
        counter.fetch_add(1, Ordering::SeqCst);

        if kind == ConfirmationKind::Confirmed {
            let latency_ms = latency.as_millis() as u64;
            self.confirm_latency_sum_ms
                .fetch_add(latency_ms, Ordering::SeqCst);
            self.confirm_min_latency_ms
                .fetch_min(latency_ms, Ordering::SeqCst);
            self.confirm_max_latency_ms
                .fetch_max(latency_ms, Ordering::SeqCst);
        }
    }

    pub fn record_submission(&self, accepted: bool) {
        self.submit_attempts.fetch_add(1, Ordering::SeqCst);
        if !accepted {
            self.submit_rejected.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.wallets_total.load(Ordering::SeqCst);
        if total == 0 {
            return 0.0;
        }
        self.wallets_success.load(Ordering::SeqCst) as f64 / total as f64 * 100.0
    }

    pub fn recovered(&self) -> u64 {
        self.wallets_recovered.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let confirmed = self.confirmed.load(Ordering::SeqCst);
        let latency_sum = self.confirm_latency_sum_ms.load(Ordering::SeqCst);
        let min_latency = self.confirm_min_latency_ms.load(Ordering::SeqCst);

        MetricsSnapshot {
            timestamp: Utc::now().to_rfc3339(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            wallets: WalletMetrics {
                total: self.wallets_total.load(Ordering::SeqCst),
                success: self.wallets_success.load(Ordering::SeqCst),
                failed: self.wallets_failed.load(Ordering::SeqCst),
                recovered: self.recovered(),
                success_rate: self.success_rate(),
            },
            confirmations: ConfirmationMetrics {
                confirmed,
                failed: self.confirm_failed.load(Ordering::SeqCst),
                timed_out: self.confirm_timed_out.load(Ordering::SeqCst),
                avg_latency_ms: if confirmed > 0 {
                    latency_sum as f64 / confirmed as f64
                } else {
                    0.0
                },
                min_latency_ms: if min_latency == u64::MAX { 0 } else { min_latency },
                max_latency_ms: self.confirm_max_latency_ms.load(Ordering::SeqCst),
            },
            submissions: SubmissionMetrics {
                attempts: self.submit_attempts.load(Ordering::SeqCst),
                rejected: self.submit_rejected.load(Ordering::SeqCst),
            },
        }
    }
}
