//! In-memory time series and derived correction statistics.

pub mod impact;
pub mod recommend;

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::MetricsConfig;
use crate::correction::CorrectionMetrics;
use crate::history::BoundedHistory;
use crate::validation::ValidationResult;

pub use impact::{ImpactLevel, PerformanceImpact, UserImpact};
pub use recommend::{Priority, Recommendation};

pub const SERIES_RESOLUTION_TIME: &str = "validation.resolution_time_ms";
pub const SERIES_OUTCOME: &str = "validation.outcome";
pub const SERIES_CPU_DELTA: &str = "impact.cpu_delta_pct";
pub const SERIES_MEMORY_DELTA: &str = "impact.memory_delta_pct";
pub const SERIES_LATENCY_DELTA: &str = "impact.latency_delta_ms";
pub const SERIES_DOWNTIME: &str = "impact.downtime_ms";
pub const SERIES_AFFECTED_USERS: &str = "impact.affected_users";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDataPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Improving,
    Stable,
    Degrading,
}

impl Trend {
    /// Compare the mean of the newest `window` samples against the `window`
    /// before them. Each side needs at least five samples.
    pub fn from_samples(samples: &[u64], window: usize) -> Self {
        let recent_n = samples.len().min(window);
        let (older, recent) = samples.split_at(samples.len() - recent_n);
        let prior = &older[older.len().saturating_sub(window)..];
        if recent.len() < 5 || prior.len() < 5 {
            return Trend::Stable;
        }
        let mean = |s: &[u64]| s.iter().sum::<u64>() as f64 / s.len() as f64;
        let (recent_mean, prior_mean) = (mean(recent), mean(prior));
        if recent_mean < prior_mean * 0.9 {
            Trend::Improving
        } else if recent_mean > prior_mean * 1.1 {
            Trend::Degrading
        } else {
            Trend::Stable
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorTypeStats {
    pub total: u64,
    pub successes: u64,
    pub success_rate: f64,
    pub min_resolution_ms: u64,
    pub avg_resolution_ms: f64,
    pub max_resolution_ms: u64,
    pub trend: Trend,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OverallStats {
    pub total_validations: u64,
    pub successful: u64,
    pub success_rate: f64,
    pub avg_resolution_time_ms: f64,
    pub rollbacks: u64,
}

/// Everything the collector knows, at one instant.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub generated_at: DateTime<Utc>,
    pub overall: OverallStats,
    pub error_types: BTreeMap<String, ErrorTypeStats>,
    pub performance: Option<PerformanceImpact>,
    pub user_impact: Option<UserImpact>,
    pub recommendations: Vec<Recommendation>,
    /// Point count per series.
    pub series: BTreeMap<String, usize>,
}

struct TypeAccumulator {
    total: u64,
    successes: u64,
    min_ms: u64,
    max_ms: u64,
    sum_ms: u128,
    recent_ms: BoundedHistory<u64>,
}

impl TypeAccumulator {
    fn new(trend_window: usize) -> Self {
        Self {
            total: 0,
            successes: 0,
            min_ms: u64::MAX,
            max_ms: 0,
            sum_ms: 0,
            recent_ms: BoundedHistory::new(trend_window * 2),
        }
    }

    fn stats(&self, trend_window: usize) -> ErrorTypeStats {
        let recent: Vec<u64> = self.recent_ms.iter().copied().collect();
        ErrorTypeStats {
            total: self.total,
            successes: self.successes,
            success_rate: ratio(self.successes, self.total),
            min_resolution_ms: if self.total == 0 { 0 } else { self.min_ms },
            avg_resolution_ms: if self.total == 0 {
                0.0
            } else {
                self.sum_ms as f64 / self.total as f64
            },
            max_resolution_ms: self.max_ms,
            trend: Trend::from_samples(&recent, trend_window),
        }
    }
}

#[derive(Default)]
struct CollectorState {
    series: HashMap<String, BoundedHistory<MetricDataPoint>>,
    by_type: HashMap<String, TypeAccumulator>,
    total: u64,
    successful: u64,
    sum_ms: u128,
    rollbacks: u64,
    performance: Option<PerformanceImpact>,
    user_impact: Option<UserImpact>,
}

pub struct MetricsCollector {
    config: MetricsConfig,
    state: RwLock<CollectorState>,
}

impl MetricsCollector {
    pub fn new(config: &MetricsConfig) -> Self {
        Self {
            config: config.clone(),
            state: RwLock::new(CollectorState::default()),
        }
    }

    fn push(&self, state: &mut CollectorState, name: &str, value: f64, tags: BTreeMap<String, String>) {
        let cap = self.config.max_series_points;
        state
            .series
            .entry(name.to_string())
            .or_insert_with(|| BoundedHistory::new(cap))
            .push(MetricDataPoint {
                timestamp: Utc::now(),
                value,
                tags,
            });
    }

    /// Append one point to the series `name`.
    pub async fn record(&self, name: &str, value: f64, tags: BTreeMap<String, String>) {
        let mut state = self.state.write().await;
        self.push(&mut state, name, value, tags);
    }

    /// Points of `name`, newest first.
    pub async fn series(&self, name: &str, limit: usize) -> Vec<MetricDataPoint> {
        self.state
            .read()
            .await
            .series
            .get(name)
            .map(|s| s.recent(limit))
            .unwrap_or_default()
    }

    /// Fold one validation outcome into the aggregates, including any
    /// impact figures its correction reported.
    pub async fn record_validation(&self, result: &ValidationResult) {
        let tags = error_type_tags(&result.error_type);
        let trend_window = self.config.trend_window;
        {
            let mut guard = self.state.write().await;
            let state = &mut *guard;
            self.push(state, SERIES_RESOLUTION_TIME, result.duration_ms as f64, tags.clone());
            self.push(state, SERIES_OUTCOME, if result.success { 1.0 } else { 0.0 }, tags);

            state.total += 1;
            state.sum_ms += result.duration_ms as u128;
            if result.success {
                state.successful += 1;
            }
            if result.rolled_back {
                state.rollbacks += 1;
            }

            let acc = state
                .by_type
                .entry(result.error_type.clone())
                .or_insert_with(|| TypeAccumulator::new(trend_window));
            acc.total += 1;
            if result.success {
                acc.successes += 1;
            }
            acc.min_ms = acc.min_ms.min(result.duration_ms);
            acc.max_ms = acc.max_ms.max(result.duration_ms);
            acc.sum_ms += result.duration_ms as u128;
            acc.recent_ms.push(result.duration_ms);
        }

        if let Some(metrics) = result.apply_result.as_ref().and_then(|r| r.metrics.as_ref()) {
            self.record_correction_metrics(&result.error_type, metrics).await;
        }
        debug!(error_type = %result.error_type, success = result.success, "validation recorded");
    }

    async fn record_correction_metrics(&self, error_type: &str, metrics: &CorrectionMetrics) {
        if metrics.has_performance_data() {
            self.record_performance_impact(
                error_type,
                metrics.cpu_delta_pct.unwrap_or(0.0),
                metrics.memory_delta_pct.unwrap_or(0.0),
                metrics.latency_delta_ms.unwrap_or(0.0),
            )
            .await;
        }
        if metrics.has_user_impact_data() {
            self.record_user_impact(
                error_type,
                metrics.downtime_ms.unwrap_or(0),
                metrics.affected_users.unwrap_or(0),
                metrics.error_count.unwrap_or(0),
            )
            .await;
        }
    }

    pub async fn record_performance_impact(
        &self,
        error_type: &str,
        cpu_delta_pct: f64,
        memory_delta_pct: f64,
        latency_delta_ms: f64,
    ) -> PerformanceImpact {
        let impact = PerformanceImpact::assess(cpu_delta_pct, memory_delta_pct, latency_delta_ms);
        let tags = error_type_tags(error_type);
        let mut state = self.state.write().await;
        self.push(&mut state, SERIES_CPU_DELTA, cpu_delta_pct, tags.clone());
        self.push(&mut state, SERIES_MEMORY_DELTA, memory_delta_pct, tags.clone());
        self.push(&mut state, SERIES_LATENCY_DELTA, latency_delta_ms, tags);
        state.performance = Some(impact.clone());
        impact
    }

    pub async fn record_user_impact(
        &self,
        error_type: &str,
        downtime_ms: u64,
        affected_users: u64,
        error_count: u64,
    ) -> UserImpact {
        let impact = UserImpact::assess(downtime_ms, affected_users, error_count);
        let tags = error_type_tags(error_type);
        let mut state = self.state.write().await;
        self.push(&mut state, SERIES_DOWNTIME, downtime_ms as f64, tags.clone());
        self.push(&mut state, SERIES_AFFECTED_USERS, affected_users as f64, tags);
        state.user_impact = Some(impact.clone());
        impact
    }

    pub async fn error_type_stats(&self, error_type: &str) -> Option<ErrorTypeStats> {
        let state = self.state.read().await;
        state.by_type.get(error_type).map(|a| a.stats(self.config.trend_window))
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        let state = self.state.read().await;
        let overall = OverallStats {
            total_validations: state.total,
            successful: state.successful,
            success_rate: ratio(state.successful, state.total),
            avg_resolution_time_ms: if state.total == 0 {
                0.0
            } else {
                state.sum_ms as f64 / state.total as f64
            },
            rollbacks: state.rollbacks,
        };
        let error_types: BTreeMap<String, ErrorTypeStats> = state
            .by_type
            .iter()
            .map(|(k, a)| (k.clone(), a.stats(self.config.trend_window)))
            .collect();
        let recommendations = recommend::generate(
            &overall,
            &error_types,
            state.performance.as_ref(),
            state.user_impact.as_ref(),
        );
        MetricsSnapshot {
            generated_at: Utc::now(),
            overall,
            error_types,
            performance: state.performance.clone(),
            user_impact: state.user_impact.clone(),
            recommendations,
            series: state.series.iter().map(|(k, s)| (k.clone(), s.len())).collect(),
        }
    }
}

fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

fn error_type_tags(error_type: &str) -> BTreeMap<String, String> {
    let mut tags = BTreeMap::new();
    tags.insert("error_type".to_string(), error_type.to_string());
    tags
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correction::CorrectionResult;

    fn result(error_type: &str, success: bool, duration_ms: u64) -> ValidationResult {
        let mut r = ValidationResult::new("c", error_type, "m");
        r.success = success;
        r.duration_ms = duration_ms;
        r
    }

    #[tokio::test]
    async fn test_five_validations_counted() {
        let m = MetricsCollector::new(&MetricsConfig::default());
        for i in 0..5 {
            m.record_validation(&result("timeout", i != 2, 1_000)).await;
        }
        let snap = m.snapshot().await;
        assert_eq!(snap.overall.total_validations, 5);
        assert_eq!(snap.overall.successful, 4);
        assert!((snap.overall.success_rate - 0.8).abs() < 1e-9);
        assert_eq!(snap.series.get(SERIES_OUTCOME), Some(&5));
    }

    #[tokio::test]
    async fn test_per_type_stats() {
        let m = MetricsCollector::new(&MetricsConfig::default());
        for d in [100, 300, 200] {
            m.record_validation(&result("rate_limit", true, d)).await;
        }
        m.record_validation(&result("rate_limit", false, 400)).await;
        let s = m.error_type_stats("rate_limit").await.unwrap();
        assert_eq!(s.total, 4);
        assert_eq!(s.min_resolution_ms, 100);
        assert_eq!(s.max_resolution_ms, 400);
        assert!((s.avg_resolution_ms - 250.0).abs() < 1e-9);
        assert!((s.success_rate - 0.75).abs() < 1e-9);
        assert!(m.error_type_stats("timeout").await.is_none());
    }

    #[test]
    fn test_trend_detection() {
        let improving: Vec<u64> = std::iter::repeat(1_000).take(10).chain(std::iter::repeat(500).take(10)).collect();
        assert_eq!(Trend::from_samples(&improving, 10), Trend::Improving);
        let degrading: Vec<u64> = std::iter::repeat(500).take(10).chain(std::iter::repeat(1_000).take(10)).collect();
        assert_eq!(Trend::from_samples(&degrading, 10), Trend::Degrading);
        assert_eq!(Trend::from_samples(&[100; 20], 10), Trend::Stable);
        // Only four prior samples.
        let short: Vec<u64> = std::iter::repeat(1_000).take(4).chain(std::iter::repeat(10).take(10)).collect();
        assert_eq!(Trend::from_samples(&short, 10), Trend::Stable);
    }

    #[tokio::test]
    async fn test_correction_metrics_feed_impact() {
        let m = MetricsCollector::new(&MetricsConfig::default());
        let mut r = result("memory_error", true, 2_000);
        r.apply_result = Some(CorrectionResult::success("gc").with_metrics(CorrectionMetrics {
            cpu_delta_pct: Some(35.0),
            downtime_ms: Some(1_000),
            ..CorrectionMetrics::default()
        }));
        m.record_validation(&r).await;
        let snap = m.snapshot().await;
        assert_eq!(snap.performance.unwrap().level, ImpactLevel::High);
        let user = snap.user_impact.unwrap();
        assert_eq!(user.level, ImpactLevel::Low);
        assert_eq!(user.satisfaction_score, 5);
        assert!(snap.recommendations.iter().any(|r| r.message.contains("performance impact")));
    }

    #[tokio::test]
    async fn test_series_are_bounded() {
        let m = MetricsCollector::new(&MetricsConfig {
            max_series_points: 3,
            ..MetricsConfig::default()
        });
        for i in 0..5 {
            m.record("queue.depth", i as f64, BTreeMap::new()).await;
        }
        let points = m.series("queue.depth", 10).await;
        assert_eq!(points.len(), 3);
        assert_eq!(points[0].value, 4.0);
    }
}
