use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::StorageConfig;
use crate::error::{ConfigError, DatabaseError};
use smallvec::SmallVec;

/// Per-wallet result queued for the statistics journal.
#[derive(Debug, Clone)]
pub struct WalletOutcomeRow {
    pub cycle_index: u64,
    pub wallet_index: u64,
    pub public_key: String,
    pub success: bool,
    pub failure_reason: Option<String>,
    pub signature: Option<String>,
    pub duration_ms: u64,
    pub timestamp: i64,
}

#[derive(Debug, Clone)]
pub struct CycleRow {
    pub cycle_index: u64,
    pub wallets: u64,
    pub succeeded: u64,
    pub queued_for_recovery: u64,
    pub funding_signature: Option<String>,
    pub duration_ms: u64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeTotals {
    pub succeeded: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
pub struct DbMetrics {
    pub queued_entries: AtomicU64,
    pub dropped_entries: AtomicU64,
    pub batch_flush_count: AtomicU64,
    pub total_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct DbMetricsSnapshot {
    pub queued_entries: u64,
    pub dropped_entries: u64,
    pub batch_flush_count: u64,
    pub total_errors: u64,
}

/// SQLite statistics journal.
///
/// Writes are queued and flushed in batches by a background task; a full
/// queue drops the entry with a warning rather than stalling submission.
/// This is reporting only. Recovery state lives in the recovery ledger.
///
/// Not Clone because it owns the flush task. Share it behind an Arc.
#[derive(Debug)]
pub struct StatsDatabase {
    pool: SqlitePool,
    metrics: Arc<DbMetrics>,
    log_sender: Option<mpsc::Sender<WalletOutcomeRow>>,
    flush_handle: Option<JoinHandle<()>>,
}

impl StatsDatabase {
    pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;
    pub const DEFAULT_TIMEOUT_MS: u64 = 30000;

    pub async fn open(db_path: &str, config: &StorageConfig) -> Result<Self> {
        if let Some(parent) = Path::new(db_path).parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::IoError {
                path: parent.display().to_string(),
                msg: e.to_string(),
            })?;
        }
        if !Path::new(db_path).exists() {
            std::fs::File::create(db_path).map_err(|e| ConfigError::IoError {
                path: db_path.to_string(),
                msg: e.to_string(),
            })?;
            info!("Created new database file: {}", db_path);
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(Self::DEFAULT_MAX_CONNECTIONS)
            .acquire_timeout(Duration::from_millis(Self::DEFAULT_TIMEOUT_MS))
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    sqlx::query("PRAGMA journal_mode=WAL;")
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query("PRAGMA synchronous=NORMAL;")
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(&format!("sqlite://{}", db_path))
            .await
            .map_err(|e| DatabaseError::TransactionFailed { msg: e.to_string() })?;

        Self::init_schema(&pool).await?;

        let metrics = Arc::new(DbMetrics::default());
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let flush_handle = tokio::spawn(db_flush_worker(
            rx,
            pool.clone(),
            Arc::clone(&metrics),
            config.batch_size.max(1),
            Duration::from_millis(config.flush_interval_ms.max(1)),
        ));

        info!(
            "Statistics database ready (channel: {}, batch: {}, interval: {}ms)",
            config.channel_capacity, config.batch_size, config.flush_interval_ms
        );

        Ok(Self {
            pool,
            metrics,
            log_sender: Some(tx),
            flush_handle: Some(flush_handle),
        })
    }

    async fn init_schema(pool: &SqlitePool) -> Result<()> {
        let mut conn = pool
            .acquire()
            .await
            .map_err(|_| DatabaseError::PoolExhausted {
                max_size: Self::DEFAULT_MAX_CONNECTIONS,
            })?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS wallet_outcomes (
                id INTEGER PRIMARY KEY,
                cycle_index INTEGER,
                wallet_index INTEGER,
                public_key TEXT,
                status TEXT,
                failure_reason TEXT,
                signature TEXT,
                duration_ms INTEGER,
                timestamp INTEGER
            );
            CREATE TABLE IF NOT EXISTS batch_cycles (
                id INTEGER PRIMARY KEY,
                cycle_index INTEGER,
                wallets INTEGER,
                succeeded INTEGER,
                queued_for_recovery INTEGER,
                funding_signature TEXT,
                duration_ms INTEGER,
                timestamp INTEGER
            );",
        )
        .execute(&mut *conn)
        .await
        .map_err(|e| DatabaseError::TransactionFailed { msg: e.to_string() })?;

        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_wallet_outcomes_cycle ON wallet_outcomes(cycle_index);",
            "CREATE INDEX IF NOT EXISTS idx_wallet_outcomes_status ON wallet_outcomes(status);",
        ];
        for idx_sql in indexes {
            if let Err(e) = sqlx::query(idx_sql).execute(pool).await {
                debug!("Index creation skipped (may exist): {}", e);
            }
        }
        Ok(())
    }

    /// Queues a wallet outcome without waiting for the write.
    pub fn queue_outcome(&self, row: WalletOutcomeRow) -> Result<(), DatabaseError> {
        let sender = self.log_sender.as_ref().ok_or(DatabaseError::ChannelClosed)?;
        match sender.try_send(row) {
            Ok(()) => {
                self.metrics.queued_entries.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.metrics.dropped_entries.fetch_add(1, Ordering::Relaxed);
                warn!("Dropped wallet outcome (statistics channel full), continuing execution");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DatabaseError::ChannelClosed),
        }
    }

    pub async fn record_cycle(&self, row: &CycleRow) -> Result<()> {
        let result = sqlx::query(
            "INSERT INTO batch_cycles (cycle_index, wallets, succeeded, queued_for_recovery, funding_signature, duration_ms, timestamp) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(row.cycle_index as i64)
        .bind(row.wallets as i64)
        .bind(row.succeeded as i64)
        .bind(row.queued_for_recovery as i64)
        .bind(row.funding_signature.as_deref())
        .bind(row.duration_ms as i64)
        .bind(row.timestamp)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            self.metrics.total_errors.fetch_add(1, Ordering::Relaxed);
            error!("Failed to record cycle {}: {}", row.cycle_index, e);
            return Err(e).context("Failed to insert batch cycle");
        }
        Ok(())
    }

    /// All-time wallet totals across runs.
    pub async fn outcome_totals(&self) -> Result<OutcomeTotals> {
        let row = sqlx::query(
            "SELECT
                COALESCE(SUM(CASE WHEN status = 'SUCCESS' THEN 1 ELSE 0 END), 0) AS succeeded,
                COALESCE(SUM(CASE WHEN status = 'FAILED' THEN 1 ELSE 0 END), 0) AS failed
             FROM wallet_outcomes",
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to read wallet totals")?;

        Ok(OutcomeTotals {
            succeeded: row.try_get::<i64, _>("succeeded")?.max(0) as u64,
            failed: row.try_get::<i64, _>("failed")?.max(0) as u64,
        })
    }

    pub async fn cycle_count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM batch_cycles")
            .fetch_one(&self.pool)
            .await
            .context("Failed to count cycles")?;
        Ok(count.max(0) as u64)
    }

    pub fn get_metrics(&self) -> DbMetricsSnapshot {
        DbMetricsSnapshot {
            queued_entries: self.metrics.queued_entries.load(Ordering::Relaxed),
            dropped_entries: self.metrics.dropped_entries.load(Ordering::Relaxed),
            batch_flush_count: self.metrics.batch_flush_count.load(Ordering::Relaxed),
            total_errors: self.metrics.total_errors.load(Ordering::Relaxed),
        }
    }

    /// Flushes queued rows and closes the pool.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("Shutting down statistics database (flushing remaining entries)...");

        // Dropping the sender ends the worker loop.
        self.log_sender = None;

        if let Some(handle) = self.flush_handle.take() {
            match tokio::time::timeout(Duration::from_secs(5), handle).await {
                Ok(Ok(())) => debug!("Statistics flush completed"),
                Ok(Err(e)) => error!("Flush task error: {}", e),
                Err(_) => warn!("Flush timeout - some statistics may be lost"),
            }
        }

        let metrics = self.get_metrics();
        info!(
            "Statistics: {} queued, {} dropped, {} batch flush(es), {} error(s)",
            metrics.queued_entries,
            metrics.dropped_entries,
            metrics.batch_flush_count,
            metrics.total_errors
        );

        self.pool.close().await;
        Ok(())
    }
}

async fn db_flush_worker(
    mut rx: mpsc::Receiver<WalletOutcomeRow>,
    pool: SqlitePool,
    metrics: Arc<DbMetrics>,
    batch_size: usize,
    interval: Duration,
) {
    let mut batch = Vec::with_capacity(batch_size);
    let mut flush_interval = tokio::time::interval(interval);

    loop {
        tokio::select! {
            entry = rx.recv() => {
                let Some(entry) = entry else { break };
                batch.push(entry);
                if batch.len() >= batch_size {
                    flush_and_clear(&mut batch, &pool, &metrics).await;
                }
            }
            _ = flush_interval.tick() => {
                if !batch.is_empty() {
                    flush_and_clear(&mut batch, &pool, &metrics).await;
                }
            }
        }
    }

    if !batch.is_empty() {
        let count = batch.len();
        flush_and_clear(&mut batch, &pool, &metrics).await;
        debug!("Final statistics flush: {} entries", count);
    }
}

async fn flush_and_clear(batch: &mut Vec<WalletOutcomeRow>, pool: &SqlitePool, metrics: &DbMetrics) {
    match flush_batch(batch, pool).await {
        Ok(()) => {
            metrics.batch_flush_count.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            metrics.total_errors.fetch_add(1, Ordering::Relaxed);
            error!("Failed to flush statistics batch: {}", e);
        }
    }
    batch.clear();
}

async fn flush_batch(batch: &[WalletOutcomeRow], pool: &SqlitePool) -> Result<()> {
    let start = Instant::now();

    type FlushRow<'a> = (i64, i64, &'a str, &'static str, Option<&'a str>, Option<&'a str>, i64, i64);
    let mut rows: SmallVec<[FlushRow<'_>; 64]> = SmallVec::new();
    for entry in batch {
        rows.push((
            entry.cycle_index as i64,
            entry.wallet_index as i64,
            &entry.public_key,
            if entry.success { "SUCCESS" } else { "FAILED" },
            entry.failure_reason.as_deref(),
            entry.signature.as_deref(),
            entry.duration_ms as i64,
            entry.timestamp,
        ));
    }

    let mut tx = pool.begin().await?;
    for row in &rows {
        sqlx::query(
            "INSERT INTO wallet_outcomes (cycle_index, wallet_index, public_key, status, failure_reason, signature, duration_ms, timestamp) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(row.0)
        .bind(row.1)
        .bind(row.2)
        .bind(row.3)
        .bind(row.4)
        .bind(row.5)
        .bind(row.6)
        .bind(row.7)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;

    debug!(
        target: "database",
        "Flushed {} entries in {:.2}ms",
        batch.len(),
        start.elapsed().as_secs_f64() * 1000.0
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(wallet_index: u64, success: bool) -> WalletOutcomeRow {
        WalletOutcomeRow {
            cycle_index: 0,
            wallet_index,
            public_key: format!("pk{}", wallet_index),
            success,
            failure_reason: (!success).then(|| "confirmation_timeout".to_string()),
            signature: None,
            duration_ms: 10,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    #[tokio::test]
    async fn test_queued_outcomes_flushed_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.db").display().to_string();
        let config = StorageConfig {
            flush_interval_ms: 60_000,
            ..StorageConfig::default()
        };

        let db = StatsDatabase::open(&path, &config).await.unwrap();
        db.queue_outcome(row(0, true)).unwrap();
        db.queue_outcome(row(1, true)).unwrap();
        db.queue_outcome(row(2, false)).unwrap();
        assert_eq!(db.get_metrics().queued_entries, 3);
        assert_eq!(db.get_metrics().dropped_entries, 0);
        db.record_cycle(&CycleRow {
            cycle_index: 0,
            wallets: 3,
            succeeded: 2,
            queued_for_recovery: 1,
            funding_signature: Some("sig".into()),
            duration_ms: 100,
            timestamp: 0,
        })
        .await
        .unwrap();
        db.shutdown().await.unwrap();

        let db = StatsDatabase::open(&path, &config).await.unwrap();
        assert_eq!(
            db.outcome_totals().await.unwrap(),
            OutcomeTotals {
                succeeded: 2,
                failed: 1
            }
        );
        assert_eq!(db.cycle_count().await.unwrap(), 1);
        db.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_returns_once_queue_is_drained() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.db").display().to_string();
        let config = StorageConfig {
            flush_interval_ms: 100,
            ..StorageConfig::default()
        };

        let db = StatsDatabase::open(&path, &config).await.unwrap();
        db.queue_outcome(row(0, true)).unwrap();

        let started = std::time::Instant::now();
        db.shutdown().await.unwrap();
        assert!(
            started.elapsed() < Duration::from_secs(2),
            "shutdown took {:?}",
            started.elapsed()
        );

        let db = StatsDatabase::open(&path, &config).await.unwrap();
        assert_eq!(db.outcome_totals().await.unwrap().succeeded, 1);
        db.shutdown().await.unwrap();
    }
}
