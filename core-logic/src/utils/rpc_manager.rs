//! # Core Logic - Endpoint Pool
//!
//! Round-robin RPC endpoint selection with health tracking and failover.
//!
//! An endpoint whose consecutive failure count reaches the threshold is
//! skipped until the cooldown since its last failure elapses. After that a
//! single caller receives it as a half-open trial; the trial's reported
//! outcome either restores it or restarts the cooldown.

use crate::config::EndpointConfig;
use crate::error::ConfigError;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointRole {
    Primary,
    Alternative,
}

#[derive(Debug, Default)]
struct EndpointState {
    consecutive_failures: u32,
    last_used_at: Option<Instant>,
    last_failure_at: Option<Instant>,
    trial_started_at: Option<Instant>,
}

/// RPC endpoint information
#[derive(Debug)]
pub struct Endpoint {
    pub url: String,
    pub role: EndpointRole,
    last_latency_ms: AtomicU64,
    state: Mutex<EndpointState>,
}

impl Endpoint {
    pub fn new(url: impl Into<String>, role: EndpointRole) -> Self {
        Self {
            url: url.into(),
            role,
            last_latency_ms: AtomicU64::new(0),
            state: Mutex::new(EndpointState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, EndpointState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn latency_ms(&self) -> u64 {
        self.last_latency_ms.load(Ordering::SeqCst)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state().consecutive_failures
    }

    /// Claims the endpoint for one call if it is healthy or due a trial call.
    fn try_acquire(&self, threshold: u32, cooldown: Duration, now: Instant) -> bool {
        let mut state = self.state();
        if state.consecutive_failures < threshold {
            state.last_used_at = Some(now);
            return true;
        }

        let cooled = state
            .last_failure_at
            .map_or(true, |at| now.duration_since(at) >= cooldown);
        // A trial that never reported back stops blocking after one more cooldown.
        let trial_outstanding = state
            .trial_started_at
            .is_some_and(|at| now.duration_since(at) < cooldown);

        if cooled && !trial_outstanding {
            state.trial_started_at = Some(now);
            state.last_used_at = Some(now);
            debug!("Half-open trial on {}", self.url);
            return true;
        }
        false
    }

    fn is_healthy(&self, threshold: u32) -> bool {
        self.state().consecutive_failures < threshold
    }
}

/// Health status of an RPC endpoint
#[derive(Debug, Clone, Serialize)]
pub struct EndpointHealth {
    pub url: String,
    pub role: EndpointRole,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub latency_ms: u64,
    pub last_used_secs_ago: Option<u64>,
}

/// Owns every configured endpoint. Endpoints are never removed, only skipped.
#[derive(Debug)]
pub struct EndpointPool {
    primary: Arc<Endpoint>,
    alternatives: Vec<Arc<Endpoint>>,
    cursor: AtomicUsize,
    failure_threshold: u32,
    cooldown: Duration,
}

impl EndpointPool {
    pub fn new(config: &EndpointConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::from_parts(
            &config.primary,
            &config.alternatives,
            config.failure_threshold,
            config.cooldown(),
        ))
    }

    pub fn from_parts(
        primary: &str,
        alternatives: &[String],
        failure_threshold: u32,
        cooldown: Duration,
    ) -> Self {
        let alternatives: Vec<Arc<Endpoint>> = alternatives
            .iter()
            .filter(|url| url.as_str() != primary)
            .map(|url| Arc::new(Endpoint::new(url.clone(), EndpointRole::Alternative)))
            .collect();

        info!(
            "Endpoint pool ready: primary {} + {} alternative(s)",
            primary,
            alternatives.len()
        );

        Self {
            primary: Arc::new(Endpoint::new(primary, EndpointRole::Primary)),
            alternatives,
            cursor: AtomicUsize::new(0),
            failure_threshold: failure_threshold.max(1),
            cooldown,
        }
    }

    pub fn primary(&self) -> Arc<Endpoint> {
        Arc::clone(&self.primary)
    }

    /// Picks an endpoint for the given role. Never fails: when nothing else
    /// is usable the primary is returned regardless of its health.
    pub fn next_endpoint(&self, role: EndpointRole) -> Arc<Endpoint> {
        let now = Instant::now();

        if role == EndpointRole::Primary
            && self
                .primary
                .try_acquire(self.failure_threshold, self.cooldown, now)
        {
            return self.primary();
        }

        if let Some(endpoint) = self.next_alternative(now) {
            return endpoint;
        }

        if role == EndpointRole::Alternative && !self.alternatives.is_empty() {
            debug!("No healthy alternative endpoint, falling back to primary");
        }
        self.primary.state().last_used_at = Some(now);
        self.primary()
    }

    fn next_alternative(&self, now: Instant) -> Option<Arc<Endpoint>> {
        let len = self.alternatives.len();
        if len == 0 {
            return None;
        }
        let start = self.cursor.fetch_add(1, Ordering::SeqCst);
        (0..len)
            .map(|offset| &self.alternatives[(start + offset) % len])
            .find(|endpoint| endpoint.try_acquire(self.failure_threshold, self.cooldown, now))
            .cloned()
    }

    pub fn report_outcome(&self, endpoint: &Endpoint, success: bool) {
        let now = Instant::now();
        let mut state = endpoint.state();
        state.last_used_at = Some(now);
        state.trial_started_at = None;

        if success {
            if state.consecutive_failures >= self.failure_threshold {
                info!("RPC {} recovered", endpoint.url);
            }
            state.consecutive_failures = 0;
            return;
        }

        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.last_failure_at = Some(now);
        if state.consecutive_failures == self.failure_threshold {
            warn!(
                "Marking RPC {} as unhealthy after {} failures (cooldown {:?})",
                endpoint.url, state.consecutive_failures, self.cooldown
            );
        }
    }

    pub fn record_latency(&self, endpoint: &Endpoint, latency: Duration) {
        endpoint
            .last_latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn healthy_count(&self) -> usize {
        self.endpoints()
            .filter(|e| e.is_healthy(self.failure_threshold))
            .count()
    }

    fn endpoints(&self) -> impl Iterator<Item = &Arc<Endpoint>> {
        std::iter::once(&self.primary).chain(self.alternatives.iter())
    }

    pub fn health_snapshot(&self) -> Vec<EndpointHealth> {
        let now = Instant::now();
        self.endpoints()
            .map(|e| {
                let state = e.state();
                EndpointHealth {
                    url: e.url.clone(),
                    role: e.role,
                    healthy: state.consecutive_failures < self.failure_threshold,
                    consecutive_failures: state.consecutive_failures,
                    latency_ms: e.latency_ms(),
                    last_used_secs_ago: state
                        .last_used_at
                        .map(|at| now.duration_since(at).as_secs()),
                }
            })
            .collect()
    }
}
