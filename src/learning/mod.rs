//! Outcome learning: per-strategy scores and a success-prediction model.

pub mod learner;
pub mod tree;

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::providers::SystemSnapshot;

pub use learner::StrategyLearner;
pub use tree::{DecisionNode, DecisionTree};

#[derive(Debug, Error)]
pub enum LearningError {
    #[error("not enough training samples: have {have}, need {need}")]
    InsufficientData { have: usize, need: usize },
    #[error("a retrain is already running")]
    TrainingInProgress,
    #[error("model training failed: {0}")]
    Training(String),
}

/// Soft constraint learned from a strategy's failure pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyCondition {
    AvoidBusinessHours,
    RequireLowSystemLoad,
}

impl std::fmt::Display for StrategyCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyCondition::AvoidBusinessHours => write!(f, "avoid_business_hours"),
            StrategyCondition::RequireLowSystemLoad => write!(f, "require_low_system_load"),
        }
    }
}

/// Learned performance record for one (error type, method) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionStrategy {
    pub error_type: String,
    pub method: String,
    /// EMA of outcomes, always within [0, 1].
    pub success_rate: f64,
    /// EMA of validation duration.
    pub avg_execution_time_ms: f64,
    pub conditions: Vec<StrategyCondition>,
    pub priority: u32,
    pub observations: u64,
    pub updated_at: DateTime<Utc>,
}

impl CorrectionStrategy {
    pub const INITIAL_PRIORITY: u32 = 5;

    /// Ranking score: success weighted 0.7, speed (relative to 10 s) 0.3.
    pub fn score(&self) -> f64 {
        0.7 * self.success_rate + 0.3 * (1.0 - self.avg_execution_time_ms / 10_000.0)
    }
}

/// Numeric features the decision tree splits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumericFeature {
    SystemLoad,
    PreviousFailures,
    TimeOfDay,
    ActiveUsers,
}

impl NumericFeature {
    pub const ALL: [NumericFeature; 4] = [
        NumericFeature::SystemLoad,
        NumericFeature::PreviousFailures,
        NumericFeature::TimeOfDay,
        NumericFeature::ActiveUsers,
    ];
}

/// Context of one correction attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub error_type: String,
    pub hour_of_day: u32,
    /// 0 = Sunday.
    pub day_of_week: u32,
    pub system_load: f64,
    pub previous_failure_count: u32,
    pub method: String,
    pub system_health: f64,
    pub active_users: u64,
}

impl FeatureVector {
    pub fn new(error_type: &str, method: &str, snapshot: &SystemSnapshot, previous_failure_count: u32) -> Self {
        Self {
            error_type: error_type.to_string(),
            hour_of_day: snapshot.observed_at.hour(),
            day_of_week: snapshot.observed_at.weekday().num_days_from_sunday(),
            system_load: snapshot.system_load,
            previous_failure_count,
            method: method.to_string(),
            system_health: snapshot.system_health,
            active_users: snapshot.active_users,
        }
    }

    pub fn numeric(&self, feature: NumericFeature) -> f64 {
        match feature {
            NumericFeature::SystemLoad => self.system_load,
            NumericFeature::PreviousFailures => self.previous_failure_count as f64,
            NumericFeature::TimeOfDay => self.hour_of_day as f64,
            NumericFeature::ActiveUsers => self.active_users as f64,
        }
    }

    /// 09:00 to 16:59.
    pub fn in_business_hours(&self) -> bool {
        (9..17).contains(&self.hour_of_day)
    }
}

/// One learning sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingData {
    pub features: FeatureVector,
    pub outcome: bool,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionSource {
    Model,
    History,
    Prior,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessPrediction {
    pub probability: f64,
    pub confidence: f64,
    pub source: PredictionSource,
    pub recommendations: Vec<String>,
    /// Better-scoring methods for the same error type, best first.
    pub alternatives: Vec<String>,
}

/// Serializable view of the learner.
#[derive(Debug, Clone, Serialize)]
pub struct ModelExport {
    pub training_samples: usize,
    pub strategies: Vec<CorrectionStrategy>,
    pub last_trained: Option<DateTime<Utc>>,
    pub tree: Option<DecisionTree>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_feature_extraction_from_snapshot() {
        let snapshot = SystemSnapshot {
            // Wednesday
            observed_at: Utc.with_ymd_and_hms(2026, 3, 4, 10, 15, 0).unwrap(),
            system_load: 0.42,
            system_health: 0.9,
            active_users: 12,
        };
        let f = FeatureVector::new("timeout", "increase_timeout", &snapshot, 2);
        assert_eq!(f.hour_of_day, 10);
        assert_eq!(f.day_of_week, 3);
        assert!(f.in_business_hours());
        assert_eq!(f.numeric(NumericFeature::PreviousFailures), 2.0);
        assert_eq!(f.numeric(NumericFeature::ActiveUsers), 12.0);
    }

    #[test]
    fn test_strategy_score() {
        let s = CorrectionStrategy {
            error_type: "timeout".into(),
            method: "retry".into(),
            success_rate: 1.0,
            avg_execution_time_ms: 5_000.0,
            conditions: Vec::new(),
            priority: CorrectionStrategy::INITIAL_PRIORITY,
            observations: 1,
            updated_at: Utc::now(),
        };
        assert!((s.score() - 0.85).abs() < 1e-9);
    }
}
