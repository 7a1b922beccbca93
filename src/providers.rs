//! Narrow collaborator interfaces for system health and load.

use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;

/// Bound on each provider call made while building a snapshot.
pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

/// One named component check reported by the health provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub name: String,
    pub passed: bool,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: HealthState,
    #[serde(default)]
    pub checks: Vec<HealthCheck>,
}

impl HealthStatus {
    pub fn healthy() -> Self {
        Self {
            status: HealthState::Healthy,
            checks: Vec::new(),
        }
    }

    pub fn with_status(status: HealthState) -> Self {
        Self {
            status,
            checks: Vec::new(),
        }
    }

    pub fn failing_checks(&self) -> impl Iterator<Item = &HealthCheck> {
        self.checks.iter().filter(|c| !c.passed)
    }

    /// Health as a score in [0, 1]. Check results refine the coarse status.
    pub fn score(&self) -> f64 {
        let base = match self.status {
            HealthState::Healthy => 1.0,
            HealthState::Degraded => 0.5,
            HealthState::Unhealthy => 0.0,
        };
        if self.checks.is_empty() {
            return base;
        }
        let passed = self.checks.iter().filter(|c| c.passed).count() as f64;
        let ratio = passed / self.checks.len() as f64;
        (base * ratio).clamp(0.0, 1.0)
    }
}

/// Platform-wide execution summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSummary {
    /// Fraction of failing executions, 0.0 – 1.0.
    pub error_rate: f64,
    pub executions_in_progress: u64,
    /// Normalized load, 0.0 – 1.0.
    pub system_load: f64,
    pub active_users: u64,
}

/// Source of platform health, polled during monitoring and pre-checks.
#[async_trait::async_trait]
pub trait HealthProvider: Send + Sync {
    async fn status(&self) -> Result<HealthStatus>;
}

/// Source of platform execution metrics.
#[async_trait::async_trait]
pub trait MetricsSummaryProvider: Send + Sync {
    async fn summary(&self) -> Result<MetricsSummary>;
}

/// Point-in-time view of the system used as learning features.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub observed_at: DateTime<Utc>,
    pub system_load: f64,
    pub system_health: f64,
    pub active_users: u64,
}

impl Default for SystemSnapshot {
    fn default() -> Self {
        Self {
            observed_at: Utc::now(),
            system_load: 0.0,
            system_health: 1.0,
            active_users: 0,
        }
    }
}

impl SystemSnapshot {
    /// Collect a snapshot from whichever providers are available. Provider
    /// errors and calls slower than `limit` degrade to defaults; the snapshot
    /// is advisory.
    pub async fn collect(
        health: Option<&dyn HealthProvider>,
        summary: Option<&dyn MetricsSummaryProvider>,
        limit: Duration,
    ) -> Self {
        let mut snapshot = Self::default();

        if let Some(provider) = health {
            match timeout(limit, provider.status()).await {
                Ok(Ok(status)) => snapshot.system_health = status.score(),
                Ok(Err(e)) => tracing::debug!(error = %e, "health provider unavailable for snapshot"),
                Err(_) => tracing::warn!(timeout_ms = limit.as_millis() as u64, "health provider timed out for snapshot"),
            }
        }

        if let Some(provider) = summary {
            match timeout(limit, provider.summary()).await {
                Ok(Ok(s)) => {
                    snapshot.system_load = s.system_load.clamp(0.0, 1.0);
                    snapshot.active_users = s.active_users;
                }
                Ok(Err(e)) => tracing::debug!(error = %e, "metrics summary unavailable for snapshot"),
                Err(_) => tracing::warn!(timeout_ms = limit.as_millis() as u64, "metrics summary timed out for snapshot"),
            }
        }

        snapshot
    }
}
