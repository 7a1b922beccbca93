//! Rule-based improvement suggestions from collected metrics.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::metrics::impact::{PerformanceImpact, UserImpact};
use crate::metrics::{ErrorTypeStats, OverallStats, Trend};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub priority: Priority,
    /// Error type the recommendation is about, if any.
    pub error_type: Option<String>,
    pub message: String,
}

impl Recommendation {
    fn new(priority: Priority, error_type: Option<&str>, message: String) -> Self {
        Self {
            priority,
            error_type: error_type.map(str::to_string),
            message,
        }
    }
}

pub const MIN_OVERALL_SUCCESS_RATE: f64 = 0.8;
pub const MAX_AVG_RESOLUTION_MS: f64 = 30_000.0;
pub const MIN_TYPE_SUCCESS_RATE: f64 = 0.7;

/// Highest priority first.
pub fn generate(
    overall: &OverallStats,
    by_type: &BTreeMap<String, ErrorTypeStats>,
    performance: Option<&PerformanceImpact>,
    user: Option<&UserImpact>,
) -> Vec<Recommendation> {
    let mut out = Vec::new();

    if overall.total_validations > 0 && overall.success_rate < MIN_OVERALL_SUCCESS_RATE {
        out.push(Recommendation::new(
            Priority::High,
            None,
            format!(
                "Overall correction success rate is {:.0}%; review strategy selection and pre-checks",
                overall.success_rate * 100.0
            ),
        ));
    }
    if overall.avg_resolution_time_ms > MAX_AVG_RESOLUTION_MS {
        out.push(Recommendation::new(
            Priority::Medium,
            None,
            format!(
                "Average resolution takes {:.1}s; consider faster strategies or shorter monitoring windows",
                overall.avg_resolution_time_ms / 1_000.0
            ),
        ));
    }

    for (error_type, stats) in by_type {
        if stats.total > 0 && stats.success_rate < MIN_TYPE_SUCCESS_RATE {
            out.push(Recommendation::new(
                Priority::Medium,
                Some(error_type),
                format!(
                    "Corrections for {} succeed only {:.0}% of the time; add or tune a strategy",
                    error_type,
                    stats.success_rate * 100.0
                ),
            ));
        }
        if stats.trend == Trend::Degrading {
            out.push(Recommendation::new(
                Priority::Medium,
                Some(error_type),
                format!("Resolution time for {} is degrading", error_type),
            ));
        }
    }

    if let Some(p) = performance.filter(|p| p.level.is_severe()) {
        out.push(Recommendation::new(
            Priority::High,
            None,
            format!(
                "Corrections have {} performance impact; throttle or schedule them off-peak",
                p.level
            ),
        ));
    }
    if let Some(u) = user.filter(|u| u.level.is_severe()) {
        out.push(Recommendation::new(
            Priority::High,
            None,
            format!(
                "Corrections have {} user impact (satisfaction {}/10); prefer non-disruptive strategies",
                u.level, u.satisfaction_score
            ),
        ));
    }

    out.sort_by(|a, b| b.priority.cmp(&a.priority));
    out
}
