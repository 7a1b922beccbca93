//! Per-service circuit breakers.
//!
//! `closed → open` after `failure_threshold` consecutive failures. An open
//! circuit goes half-open once `reset_timeout` has passed, with its failure
//! counter cleared. Any success closes the circuit; a failure while
//! half-open re-opens it.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::CorrectionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
        }
    }

    /// Apply the time-based `open → half-open` transition.
    fn refresh(&mut self, reset_timeout: Duration) {
        if self.state == CircuitState::Open {
            if let Some(opened) = self.opened_at {
                if opened.elapsed() >= reset_timeout {
                    self.state = CircuitState::HalfOpen;
                    self.consecutive_failures = 0;
                }
            }
        }
    }
}

/// Snapshot of one breaker for inspection.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub key: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
}

pub struct CircuitBreakerRegistry {
    breakers: Mutex<HashMap<String, Breaker>>,
    failure_threshold: u32,
    reset_timeout: Duration,
}

impl CircuitBreakerRegistry {
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            breakers: Mutex::new(HashMap::new()),
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
        }
    }

    pub fn from_config(cfg: &CorrectionConfig) -> Self {
        Self::new(cfg.failure_threshold, cfg.reset_timeout())
    }

    /// Current state of `key`'s circuit. Unknown keys are closed.
    pub async fn state(&self, key: &str) -> CircuitState {
        let mut breakers = self.breakers.lock().await;
        match breakers.get_mut(key) {
            Some(b) => {
                b.refresh(self.reset_timeout);
                b.state
            }
            None => CircuitState::Closed,
        }
    }

    /// Whether a call to `key` may go through.
    pub async fn allows(&self, key: &str) -> bool {
        self.state(key).await != CircuitState::Open
    }

    pub async fn record_success(&self, key: &str) {
        let mut breakers = self.breakers.lock().await;
        let b = breakers.entry(key.to_string()).or_insert_with(Breaker::new);
        if b.state != CircuitState::Closed {
            info!(service = key, from = ?b.state, "circuit closed after success");
        }
        b.state = CircuitState::Closed;
        b.consecutive_failures = 0;
        b.opened_at = None;
    }

    pub async fn record_failure(&self, key: &str) -> CircuitState {
        let mut breakers = self.breakers.lock().await;
        let b = breakers.entry(key.to_string()).or_insert_with(Breaker::new);
        b.refresh(self.reset_timeout);
        b.consecutive_failures += 1;

        let trip = match b.state {
            CircuitState::Closed | CircuitState::HalfOpen => b.consecutive_failures >= self.failure_threshold,
            CircuitState::Open => false,
        };
        if trip {
            warn!(
                service = key,
                failures = b.consecutive_failures,
                threshold = self.failure_threshold,
                "circuit opened"
            );
            b.state = CircuitState::Open;
            b.opened_at = Some(Instant::now());
        }
        b.state
    }

    pub async fn reset(&self, key: &str) {
        self.breakers.lock().await.remove(key);
    }

    pub async fn statuses(&self) -> Vec<BreakerStatus> {
        let mut breakers = self.breakers.lock().await;
        let mut out: Vec<BreakerStatus> = breakers
            .iter_mut()
            .map(|(key, b)| {
                b.refresh(self.reset_timeout);
                BreakerStatus {
                    key: key.clone(),
                    state: b.state,
                    consecutive_failures: b.consecutive_failures,
                }
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }
}
