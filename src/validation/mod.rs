//! Safety-checked application of corrections.
//!
//! Every correction moves through `Precheck -> Apply -> Postcheck -> Monitor`
//! and ends in `Commit` or `Rollback`. Failures inside a phase become a
//! failed [`ValidationResult`]; only attempt exhaustion is returned as an
//! error.

pub mod monitor;
pub mod orchestrator;
pub mod rules;
pub mod slippage;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::correction::CorrectionResult;

pub use monitor::HealthMonitor;
pub use orchestrator::ValidationOrchestrator;
pub use rules::{CheckSeverity, RuleStage, ValidationRule};

/// Recommendation attached when the cycle itself failed unexpectedly.
pub const MANUAL_INTERVENTION: &str = "Manual intervention may be required";

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("manual intervention required: {attempts} consecutive failed attempts for error type '{error_type}'")]
    AttemptsExhausted { error_type: String, attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Precheck,
    Apply,
    Postcheck,
    Monitor,
    Commit,
    Rollback,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Commit | Phase::Rollback)
    }

    /// Whether a cycle may move from `self` to `next`.
    pub fn can_transition_to(self, next: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, next),
            (Precheck, Apply)
                | (Precheck, Rollback)
                | (Apply, Postcheck)
                | (Apply, Rollback)
                | (Postcheck, Monitor)
                | (Postcheck, Rollback)
                | (Monitor, Commit)
                | (Monitor, Rollback)
        )
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Precheck => write!(f, "precheck"),
            Phase::Apply => write!(f, "apply"),
            Phase::Postcheck => write!(f, "postcheck"),
            Phase::Monitor => write!(f, "monitor"),
            Phase::Commit => write!(f, "commit"),
            Phase::Rollback => write!(f, "rollback"),
        }
    }
}

/// Outcome of one rule evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationCheckResult {
    pub passed: bool,
    pub message: String,
    #[serde(default)]
    pub details: Option<serde_json::Value>,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
}

impl ValidationCheckResult {
    pub fn passed(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: None,
            metrics: BTreeMap::new(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            details: None,
            metrics: BTreeMap::new(),
        }
    }

    /// A check that did not finish before its deadline.
    pub fn timeout() -> Self {
        Self::failed("Timeout")
    }

    /// Builder-style setter for `details`.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Builder-style setter for one entry of `metrics`.
    pub fn with_metric(mut self, name: &str, value: f64) -> Self {
        self.metrics.insert(name.to_string(), value);
        self
    }
}

/// A check result labelled with the rule that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedCheck {
    pub rule: String,
    pub severity: CheckSeverity,
    pub result: ValidationCheckResult,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitoringResult {
    pub stable: bool,
    pub polls: u32,
    /// Polls that were degraded, had failing checks, or could not be taken.
    pub incidents: u32,
    pub saw_unhealthy: bool,
    /// Ended early by shutdown.
    pub cancelled: bool,
    pub duration_ms: u64,
}

/// Loop-wide quality figures derived from recent history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationMetrics {
    pub success_rate: f64,
    pub avg_resolution_time_ms: f64,
    /// Share of successes that still saw incidents while monitored.
    pub false_positive_rate: f64,
    /// Sum of the current per-error-type attempt counters.
    pub rollback_count: u32,
    pub performance_impact: f64,
    pub user_impact_score: f64,
}

/// Aggregate outcome of one `validate` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub correction_id: String,
    pub error_type: String,
    pub method: String,
    pub success: bool,
    pub final_phase: Phase,
    pub pre_checks: Vec<NamedCheck>,
    pub post_checks: Vec<NamedCheck>,
    pub apply_result: Option<CorrectionResult>,
    pub monitoring: Option<MonitoringResult>,
    pub metrics: ValidationMetrics,
    pub recommendations: Vec<String>,
    pub rolled_back: bool,
    /// Whole cycle, monitoring window included.
    pub duration_ms: u64,
    /// Time spent inside `apply` alone.
    #[serde(default)]
    pub apply_duration_ms: u64,
    pub started_at: DateTime<Utc>,
}

impl ValidationResult {
    /// An empty, unsuccessful result at the start of a cycle.
    pub fn new(correction_id: &str, error_type: &str, method: &str) -> Self {
        Self {
            correction_id: correction_id.to_string(),
            error_type: error_type.to_string(),
            method: method.to_string(),
            success: false,
            final_phase: Phase::Precheck,
            pre_checks: Vec::new(),
            post_checks: Vec::new(),
            apply_result: None,
            monitoring: None,
            metrics: ValidationMetrics::default(),
            recommendations: Vec::new(),
            rolled_back: false,
            duration_ms: 0,
            apply_duration_ms: 0,
            started_at: Utc::now(),
        }
    }

    /// Share of all checks that passed, or `None` if no check ran.
    pub fn check_pass_ratio(&self) -> Option<f64> {
        let total = self.pre_checks.len() + self.post_checks.len();
        if total == 0 {
            return None;
        }
        let passed = self
            .pre_checks
            .iter()
            .chain(self.post_checks.iter())
            .filter(|c| c.result.passed)
            .count();
        Some(passed as f64 / total as f64)
    }

    /// How long the correction itself took to run. A time reported by the
    /// correction wins over the measured apply phase.
    pub fn execution_time_ms(&self) -> u64 {
        self.apply_result
            .as_ref()
            .and_then(|r| r.metrics.as_ref())
            .and_then(|m| m.execution_time_ms)
            .unwrap_or(self.apply_duration_ms)
    }

    /// Monitoring finished stable but saw incidents along the way.
    pub fn is_false_positive(&self) -> bool {
        self.success && self.monitoring.as_ref().map(|m| m.incidents > 0).unwrap_or(false)
    }
}
