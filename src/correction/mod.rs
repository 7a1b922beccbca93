//! Correction contract, strategy catalog, retry and circuit breaking.

pub mod backoff;
pub mod breaker;
pub mod builtin;
pub mod catalog;

use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use catalog::{CatalogCorrection, CorrectionCatalog, FixRegistry, FixStrategy};

#[derive(Debug, Error)]
pub enum CorrectionError {
    #[error("no strategy applies to error type '{0}'")]
    NoApplicableStrategy(String),
    #[error("all {tried} applicable strategies failed for error type '{error_type}'")]
    AllStrategiesFailed { error_type: String, tried: usize },
    #[error("circuit open for service '{0}'")]
    CircuitOpen(String),
    #[error("operation failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

/// Numeric side-information reported by a correction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrectionMetrics {
    pub execution_time_ms: Option<u64>,
    /// Performance deltas observed while applying.
    pub cpu_delta_pct: Option<f64>,
    pub memory_delta_pct: Option<f64>,
    pub latency_delta_ms: Option<f64>,
    /// User-facing impact observed while applying.
    pub downtime_ms: Option<u64>,
    pub affected_users: Option<u64>,
    pub error_count: Option<u64>,
    /// Amounts for trade-like corrections, as decimal strings.
    pub quoted_amount: Option<String>,
    pub executed_amount: Option<String>,
    pub extra: BTreeMap<String, f64>,
}

impl CorrectionMetrics {
    pub fn has_performance_data(&self) -> bool {
        self.cpu_delta_pct.is_some() || self.memory_delta_pct.is_some() || self.latency_delta_ms.is_some()
    }

    pub fn has_user_impact_data(&self) -> bool {
        self.downtime_ms.is_some() || self.affected_users.is_some() || self.error_count.is_some()
    }
}

/// Outcome of one `apply()` invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionResult {
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub changes: Vec<String>,
    #[serde(default)]
    pub metrics: Option<CorrectionMetrics>,
}

impl CorrectionResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            changes: Vec::new(),
            metrics: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            changes: Vec::new(),
            metrics: None,
        }
    }

    /// Builder-style setter for `changes`.
    pub fn with_change(mut self, change: impl Into<String>) -> Self {
        self.changes.push(change.into());
        self
    }

    /// Builder-style setter for `metrics`.
    pub fn with_metrics(mut self, metrics: CorrectionMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// An attemptable remediation unit. `apply` and `rollback` belong to the
/// caller; the loop only decides when they run.
#[async_trait::async_trait]
pub trait Correction: Send + Sync {
    fn id(&self) -> &str;

    fn error_type(&self) -> &str;

    fn method(&self) -> &str;

    async fn apply(&self) -> Result<CorrectionResult>;

    /// Whether [`Correction::rollback`] does anything.
    fn supports_rollback(&self) -> bool {
        false
    }

    async fn rollback(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_builders() {
        let r = CorrectionResult::success("cache purged")
            .with_change("evicted 120 entries")
            .with_metrics(CorrectionMetrics {
                cpu_delta_pct: Some(4.0),
                ..Default::default()
            });
        assert!(r.success);
        assert_eq!(r.changes, vec!["evicted 120 entries".to_string()]);
        let m = r.metrics.unwrap();
        assert!(m.has_performance_data());
        assert!(!m.has_user_impact_data());
    }
}
