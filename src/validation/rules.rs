//! Pre- and post-check rules.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::correction::{Correction, CorrectionResult};
use crate::providers::{HealthProvider, HealthState, MetricsSummaryProvider};
use crate::validation::slippage::validate_slippage;
use crate::validation::ValidationCheckResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckSeverity {
    Low,
    Medium,
    High,
    /// A failing critical check ends the cycle immediately.
    Critical,
}

/// When a rule runs relative to `apply`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleStage {
    Pre,
    Post,
}

#[async_trait::async_trait]
pub trait ValidationRule: Send + Sync {
    fn name(&self) -> &str;

    fn stage(&self) -> RuleStage;

    fn severity(&self) -> CheckSeverity;

    /// Overrides the orchestrator's check timeout.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// `applied` is the apply result for post-checks, `None` before apply.
    async fn check(&self, correction: &dyn Correction, applied: Option<&CorrectionResult>) -> Result<ValidationCheckResult>;
}

// ---------------------------------------------------------------------------
// SystemHealthRule
// ---------------------------------------------------------------------------

/// Refuses to touch a system that already reports itself unhealthy.
pub struct SystemHealthRule {
    provider: Arc<dyn HealthProvider>,
}

impl SystemHealthRule {
    pub fn new(provider: Arc<dyn HealthProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait::async_trait]
impl ValidationRule for SystemHealthRule {
    fn name(&self) -> &str {
        "system_health"
    }

    fn stage(&self) -> RuleStage {
        RuleStage::Pre
    }

    fn severity(&self) -> CheckSeverity {
        CheckSeverity::Critical
    }

    async fn check(&self, _correction: &dyn Correction, _applied: Option<&CorrectionResult>) -> Result<ValidationCheckResult> {
        let status = self.provider.status().await?;
        let score = status.score();
        let result = match status.status {
            HealthState::Unhealthy => ValidationCheckResult::failed("System is unhealthy"),
            HealthState::Degraded => ValidationCheckResult::passed("System is degraded"),
            HealthState::Healthy => ValidationCheckResult::passed("System is healthy"),
        };
        let failing: Vec<&str> = status.failing_checks().map(|c| c.name.as_str()).collect();
        Ok(result
            .with_metric("health_score", score)
            .with_details(json!({ "failing_checks": failing })))
    }
}

// ---------------------------------------------------------------------------
// ErrorRateRule
// ---------------------------------------------------------------------------

/// Fails when the platform error rate is above the threshold after apply.
pub struct ErrorRateRule {
    provider: Arc<dyn MetricsSummaryProvider>,
    max_error_rate: f64,
}

impl ErrorRateRule {
    pub fn new(provider: Arc<dyn MetricsSummaryProvider>, max_error_rate: f64) -> Self {
        Self {
            provider,
            max_error_rate,
        }
    }
}

#[async_trait::async_trait]
impl ValidationRule for ErrorRateRule {
    fn name(&self) -> &str {
        "error_rate"
    }

    fn stage(&self) -> RuleStage {
        RuleStage::Post
    }

    fn severity(&self) -> CheckSeverity {
        CheckSeverity::High
    }

    async fn check(&self, _correction: &dyn Correction, _applied: Option<&CorrectionResult>) -> Result<ValidationCheckResult> {
        let summary = self.provider.summary().await?;
        let result = if summary.error_rate > self.max_error_rate {
            ValidationCheckResult::failed(format!(
                "Error rate {:.1}% above {:.1}%",
                summary.error_rate * 100.0,
                self.max_error_rate * 100.0
            ))
        } else {
            ValidationCheckResult::passed(format!("Error rate {:.1}%", summary.error_rate * 100.0))
        };
        Ok(result
            .with_metric("error_rate", summary.error_rate)
            .with_metric("executions_in_progress", summary.executions_in_progress as f64))
    }
}

// ---------------------------------------------------------------------------
// ServiceHealthRule
// ---------------------------------------------------------------------------

/// Requires every individual health check to pass after apply.
pub struct ServiceHealthRule {
    provider: Arc<dyn HealthProvider>,
}

impl ServiceHealthRule {
    pub fn new(provider: Arc<dyn HealthProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait::async_trait]
impl ValidationRule for ServiceHealthRule {
    fn name(&self) -> &str {
        "service_health"
    }

    fn stage(&self) -> RuleStage {
        RuleStage::Post
    }

    fn severity(&self) -> CheckSeverity {
        CheckSeverity::Medium
    }

    async fn check(&self, _correction: &dyn Correction, _applied: Option<&CorrectionResult>) -> Result<ValidationCheckResult> {
        let status = self.provider.status().await?;
        let failing: Vec<String> = status.failing_checks().map(|c| c.name.clone()).collect();
        if status.status != HealthState::Healthy || !failing.is_empty() {
            return Ok(ValidationCheckResult::failed(format!(
                "Services not healthy ({}): {}",
                match status.status {
                    HealthState::Healthy => "healthy",
                    HealthState::Degraded => "degraded",
                    HealthState::Unhealthy => "unhealthy",
                },
                if failing.is_empty() { "-".to_string() } else { failing.join(", ") }
            ))
            .with_details(json!({ "failing_checks": failing })));
        }
        Ok(ValidationCheckResult::passed(format!("{} service checks passing", status.checks.len())))
    }
}

// ---------------------------------------------------------------------------
// SlippageRule
// ---------------------------------------------------------------------------

/// Compares quoted and executed amounts reported by the correction.
pub struct SlippageRule {
    max_slippage_pct: f64,
}

impl SlippageRule {
    pub fn new(max_slippage_pct: f64) -> Self {
        Self { max_slippage_pct }
    }
}

#[async_trait::async_trait]
impl ValidationRule for SlippageRule {
    fn name(&self) -> &str {
        "slippage"
    }

    fn stage(&self) -> RuleStage {
        RuleStage::Post
    }

    fn severity(&self) -> CheckSeverity {
        CheckSeverity::High
    }

    async fn check(&self, _correction: &dyn Correction, applied: Option<&CorrectionResult>) -> Result<ValidationCheckResult> {
        let amounts = applied
            .and_then(|r| r.metrics.as_ref())
            .and_then(|m| Some((m.quoted_amount.as_deref()?, m.executed_amount.as_deref()?)));
        let Some((quoted, executed)) = amounts else {
            return Ok(ValidationCheckResult::passed("No amounts reported"));
        };
        let v = validate_slippage(quoted, executed, self.max_slippage_pct)?;
        let result = if v.valid {
            ValidationCheckResult::passed(v.message)
        } else {
            ValidationCheckResult::failed(v.message)
        };
        Ok(result.with_metric("slippage_pct", v.slippage_pct))
    }
}
