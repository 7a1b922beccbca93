//! Impact classification of applied corrections.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImpactLevel {
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl ImpactLevel {
    pub fn is_severe(self) -> bool {
        self >= ImpactLevel::High
    }
}

impl std::fmt::Display for ImpactLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImpactLevel::None => write!(f, "none"),
            ImpactLevel::Low => write!(f, "low"),
            ImpactLevel::Medium => write!(f, "medium"),
            ImpactLevel::High => write!(f, "high"),
            ImpactLevel::Critical => write!(f, "critical"),
        }
    }
}

/// Resource deltas observed while a correction ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceImpact {
    pub cpu_delta_pct: f64,
    pub memory_delta_pct: f64,
    pub latency_delta_ms: f64,
    pub level: ImpactLevel,
}

impl PerformanceImpact {
    pub fn assess(cpu_delta_pct: f64, memory_delta_pct: f64, latency_delta_ms: f64) -> Self {
        let (cpu, mem, lat) = (cpu_delta_pct.abs(), memory_delta_pct.abs(), latency_delta_ms.abs());
        let level = if cpu >= 50.0 || mem >= 50.0 || lat >= 1_000.0 {
            ImpactLevel::Critical
        } else if cpu >= 30.0 || mem >= 30.0 || lat >= 500.0 {
            ImpactLevel::High
        } else if cpu >= 15.0 || mem >= 15.0 || lat >= 200.0 {
            ImpactLevel::Medium
        } else {
            ImpactLevel::Low
        };
        Self {
            cpu_delta_pct,
            memory_delta_pct,
            latency_delta_ms,
            level,
        }
    }

    /// Normalized [0, 1] figure for composite scores.
    pub fn score(&self) -> f64 {
        match self.level {
            ImpactLevel::None => 0.0,
            ImpactLevel::Low => 0.1,
            ImpactLevel::Medium => 0.4,
            ImpactLevel::High => 0.7,
            ImpactLevel::Critical => 1.0,
        }
    }
}

/// What users felt while a correction ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserImpact {
    pub downtime_ms: u64,
    pub affected_users: u64,
    pub error_count: u64,
    pub level: ImpactLevel,
    /// 0 (worst) to 10.
    pub satisfaction_score: u32,
}

impl UserImpact {
    pub fn assess(downtime_ms: u64, affected_users: u64, error_count: u64) -> Self {
        let level = if downtime_ms >= 300_000 || affected_users >= 100 || error_count >= 500 {
            ImpactLevel::Critical
        } else if downtime_ms >= 60_000 || affected_users >= 50 || error_count >= 200 {
            ImpactLevel::High
        } else if downtime_ms >= 10_000 || affected_users >= 20 || error_count >= 50 {
            ImpactLevel::Medium
        } else if downtime_ms > 0 || affected_users > 0 || error_count > 0 {
            ImpactLevel::Low
        } else {
            ImpactLevel::None
        };

        let mut satisfaction: i32 = 10;
        if downtime_ms > 0 {
            satisfaction -= 5;
        }
        if error_count > 100 {
            satisfaction -= 3;
        }
        if affected_users > 50 {
            satisfaction -= 2;
        }

        Self {
            downtime_ms,
            affected_users,
            error_count,
            level,
            satisfaction_score: satisfaction.max(0) as u32,
        }
    }
}
