//! Strategy scoring and success prediction from validation outcomes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::LearningConfig;
use crate::correction::Correction;
use crate::events::{EventBus, HealingEvent};
use crate::history::BoundedHistory;
use crate::learning::{
    CorrectionStrategy, DecisionTree, FeatureVector, LearningError, ModelExport, PredictionSource,
    StrategyCondition, SuccessPrediction, TrainingData,
};
use crate::providers::{HealthProvider, MetricsSummaryProvider, SystemSnapshot, DEFAULT_PROVIDER_TIMEOUT};
use crate::validation::ValidationResult;

type StrategyKey = (String, String);

struct LearnerState {
    samples: BoundedHistory<TrainingData>,
    /// Samples ever recorded, including evicted ones.
    samples_seen: u64,
    strategies: HashMap<StrategyKey, CorrectionStrategy>,
    tree: Option<Arc<DecisionTree>>,
    trained_at: Option<Instant>,
    trained_at_utc: Option<DateTime<Utc>>,
}

impl LearnerState {
    fn previous_failures(&self, error_type: &str, method: &str) -> u32 {
        self.samples
            .iter()
            .filter(|s| !s.outcome && s.features.error_type == error_type && s.features.method == method)
            .count() as u32
    }
}

pub struct StrategyLearner {
    config: LearningConfig,
    events: EventBus,
    health: Option<Arc<dyn HealthProvider>>,
    summary: Option<Arc<dyn MetricsSummaryProvider>>,
    provider_timeout: Duration,
    state: RwLock<LearnerState>,
    training: Mutex<()>,
}

impl StrategyLearner {
    pub fn new(config: &LearningConfig, events: EventBus) -> Self {
        Self {
            config: config.clone(),
            events,
            health: None,
            summary: None,
            provider_timeout: DEFAULT_PROVIDER_TIMEOUT,
            state: RwLock::new(LearnerState {
                samples: BoundedHistory::new(config.max_training_samples),
                samples_seen: 0,
                strategies: HashMap::new(),
                tree: None,
                trained_at: None,
                trained_at_utc: None,
            }),
            training: Mutex::new(()),
        }
    }

    /// Builder-style setter for the health feature source.
    pub fn with_health_provider(mut self, provider: Arc<dyn HealthProvider>) -> Self {
        self.health = Some(provider);
        self
    }

    /// Builder-style setter for the load and user-count feature source.
    pub fn with_metrics_provider(mut self, provider: Arc<dyn MetricsSummaryProvider>) -> Self {
        self.summary = Some(provider);
        self
    }

    /// Bound on each feature provider call made while learning.
    pub fn with_provider_timeout(mut self, limit: Duration) -> Self {
        self.provider_timeout = limit;
        self
    }

    async fn snapshot(&self) -> SystemSnapshot {
        SystemSnapshot::collect(self.health.as_deref(), self.summary.as_deref(), self.provider_timeout).await
    }

    // ---- Learning ----

    /// Record the outcome of validating `correction`.
    pub async fn learn(&self, correction: &dyn Correction, result: &ValidationResult) {
        let snapshot = self.snapshot().await;
        self.learn_with_snapshot(correction.error_type(), correction.method(), result, &snapshot)
            .await;
    }

    /// [`learn`](Self::learn) with an explicit feature snapshot.
    pub async fn learn_with_snapshot(
        &self,
        error_type: &str,
        method: &str,
        result: &ValidationResult,
        snapshot: &SystemSnapshot,
    ) {
        let demoted = {
            let mut guard = self.state.write().await;
            let state = &mut *guard;

            let previous = state.previous_failures(error_type, method);
            state.samples.push(TrainingData {
                features: FeatureVector::new(error_type, method, snapshot, previous),
                outcome: result.success,
                confidence: sample_confidence(result),
                timestamp: Utc::now(),
            });
            state.samples_seen += 1;

            self.update_strategy(state, error_type, method, result);
            if result.success {
                Vec::new()
            } else {
                self.adjust_strategies(state, error_type)
            }
        };

        for (method, priority) in demoted {
            debug!(error_type = %error_type, method = %method, priority, "strategy demoted");
            self.events.emit(HealingEvent::StrategyDemoted {
                error_type: error_type.to_string(),
                method,
                priority,
            });
        }

        self.retrain_if_due().await;
    }

    fn update_strategy(&self, state: &mut LearnerState, error_type: &str, method: &str, result: &ValidationResult) {
        let alpha = self.config.ema_alpha;
        let outcome = if result.success { 1.0 } else { 0.0 };
        let duration = result.execution_time_ms() as f64;

        let key = (error_type.to_string(), method.to_string());
        match state.strategies.get_mut(&key) {
            Some(s) => {
                s.success_rate = (alpha * outcome + (1.0 - alpha) * s.success_rate).clamp(0.0, 1.0);
                s.avg_execution_time_ms = alpha * duration + (1.0 - alpha) * s.avg_execution_time_ms;
                s.observations += 1;
                s.updated_at = Utc::now();
            }
            None => {
                state.strategies.insert(
                    key,
                    CorrectionStrategy {
                        error_type: error_type.to_string(),
                        method: method.to_string(),
                        success_rate: outcome,
                        avg_execution_time_ms: duration,
                        conditions: Vec::new(),
                        priority: CorrectionStrategy::INITIAL_PRIORITY,
                        observations: 1,
                        updated_at: Utc::now(),
                    },
                );
            }
        }
    }

    /// Demote weak strategies for `error_type` and attach any condition the
    /// failure history points at. Returns the demoted methods.
    fn adjust_strategies(&self, state: &mut LearnerState, error_type: &str) -> Vec<(String, u32)> {
        let failures: Vec<&FeatureVector> = state
            .samples
            .iter()
            .filter(|s| !s.outcome && s.features.error_type == error_type)
            .map(|s| &s.features)
            .collect();

        let mut learned = Vec::new();
        if !failures.is_empty() && failures.len() >= self.config.failure_pattern_min {
            let n = failures.len() as f64;
            let in_hours = failures.iter().filter(|f| f.in_business_hours()).count() as f64;
            if in_hours / n >= self.config.business_hours_ratio {
                learned.push(StrategyCondition::AvoidBusinessHours);
            }
            let mean_load = failures.iter().map(|f| f.system_load).sum::<f64>() / n;
            if mean_load > self.config.high_load_threshold {
                learned.push(StrategyCondition::RequireLowSystemLoad);
            }
        }

        let mut demoted = Vec::new();
        for strategy in state
            .strategies
            .values_mut()
            .filter(|s| s.error_type == error_type && s.success_rate < self.config.demotion_threshold)
        {
            strategy.priority = strategy.priority.saturating_sub(1);
            for condition in &learned {
                if !strategy.conditions.contains(condition) {
                    strategy.conditions.push(*condition);
                }
            }
            demoted.push((strategy.method.clone(), strategy.priority));
        }
        demoted
    }

    // ---- Training ----

    /// Retrain if the model is stale or the sample count hit a multiple of
    /// `retrain_every`, and enough samples exist. Returns whether a new
    /// tree was installed.
    pub async fn retrain_if_due(&self) -> bool {
        let due = {
            let state = self.state.read().await;
            let enough = state.samples.len() >= self.config.min_training_samples;
            let stale = state
                .trained_at
                .map(|t| t.elapsed() > self.config.retrain_interval())
                .unwrap_or(true);
            let every = self.config.retrain_every as u64;
            let milestone = every > 0 && state.samples_seen % every == 0;
            enough && (stale || milestone)
        };
        if !due {
            return false;
        }

        match self.retrain().await {
            Ok(_) => true,
            Err(LearningError::TrainingInProgress) => {
                debug!("retrain already running, skipping");
                false
            }
            Err(e) => {
                warn!(error = %e, "retrain failed");
                false
            }
        }
    }

    /// Rebuild the decision tree from the current samples. Returns the node
    /// count of the new tree.
    pub async fn retrain(&self) -> Result<usize, LearningError> {
        let Ok(_guard) = self.training.try_lock() else {
            return Err(LearningError::TrainingInProgress);
        };

        let samples: Vec<TrainingData> = {
            let state = self.state.read().await;
            if state.samples.len() < self.config.min_training_samples {
                return Err(LearningError::InsufficientData {
                    have: state.samples.len(),
                    need: self.config.min_training_samples,
                });
            }
            state.samples.iter().cloned().collect()
        };

        let sample_count = samples.len();
        let max_depth = self.config.max_depth;
        let min_split = self.config.min_samples_split;
        let started = Instant::now();
        let tree = tokio::task::spawn_blocking(move || DecisionTree::train(&samples, max_depth, min_split))
            .await
            .map_err(|e| LearningError::Training(e.to_string()))?
            .ok_or(LearningError::InsufficientData {
                have: 0,
                need: self.config.min_training_samples,
            })?;

        let nodes = tree.node_count();
        {
            let mut state = self.state.write().await;
            state.tree = Some(Arc::new(tree));
            state.trained_at = Some(Instant::now());
            state.trained_at_utc = Some(Utc::now());
        }

        info!(
            samples = sample_count,
            nodes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "decision tree retrained"
        );
        self.events.emit(HealingEvent::ModelRetrained {
            samples: sample_count,
            nodes,
        });
        Ok(nodes)
    }

    // ---- Prediction ----

    pub async fn predict_success(&self, correction: &dyn Correction) -> SuccessPrediction {
        let snapshot = self.snapshot().await;
        self.predict_with_snapshot(correction.error_type(), correction.method(), &snapshot)
            .await
    }

    pub async fn predict_with_snapshot(
        &self,
        error_type: &str,
        method: &str,
        snapshot: &SystemSnapshot,
    ) -> SuccessPrediction {
        let state = self.state.read().await;
        let previous = state.previous_failures(error_type, method);
        let features = FeatureVector::new(error_type, method, snapshot, previous);
        let strategy = state.strategies.get(&(error_type.to_string(), method.to_string()));

        let (probability, confidence, source) = match (&state.tree, strategy) {
            (Some(tree), _) => {
                let (prediction, confidence) = tree.predict(&features);
                (if prediction { 0.8 } else { 0.2 }, confidence, PredictionSource::Model)
            }
            (None, Some(s)) => (
                s.success_rate,
                (s.observations as f64 / 10.0).min(1.0),
                PredictionSource::History,
            ),
            (None, None) => (0.5, 0.0, PredictionSource::Prior),
        };

        let high_load = features.system_load > self.config.high_load_threshold;
        let mut recommendations = Vec::new();
        if high_load {
            recommendations.push(format!(
                "System load is high ({:.0}%); defer to off-peak hours",
                features.system_load * 100.0
            ));
        }
        if let Some(s) = strategy {
            for condition in &s.conditions {
                match condition {
                    StrategyCondition::AvoidBusinessHours if features.in_business_hours() => recommendations.push(
                        format!("'{}' tends to fail during business hours; schedule it after 17:00", method),
                    ),
                    StrategyCondition::RequireLowSystemLoad if high_load => recommendations
                        .push(format!("'{}' needs low system load; wait for load to drop", method)),
                    _ => {}
                }
            }
        }
        if previous >= 3 {
            recommendations.push(format!(
                "'{}' has failed {} times for {}; consider a different method",
                method, previous, error_type
            ));
        }

        let mut alternatives = Vec::new();
        if probability < self.config.alternative_threshold {
            recommendations.push(format!(
                "Predicted success is low ({:.0}%); review alternatives before applying",
                probability * 100.0
            ));
            let mut candidates: Vec<&CorrectionStrategy> = state
                .strategies
                .values()
                .filter(|s| s.error_type == error_type && s.method != method && s.success_rate > 0.6)
                .collect();
            candidates.sort_by(|a, b| b.success_rate.total_cmp(&a.success_rate));
            alternatives = candidates
                .into_iter()
                .take(self.config.max_alternatives)
                .map(|s| s.method.clone())
                .collect();
        }
        if recommendations.is_empty() {
            recommendations.push(format!("Conditions are favorable for '{}'", method));
        }

        SuccessPrediction {
            probability: probability.clamp(0.0, 1.0),
            confidence: confidence.clamp(0.0, 1.0),
            source,
            recommendations,
            alternatives,
        }
    }

    // ---- Read APIs ----

    /// Highest-scoring known strategy for `error_type`.
    pub async fn get_best_strategy(&self, error_type: &str) -> Option<CorrectionStrategy> {
        let state = self.state.read().await;
        state
            .strategies
            .values()
            .filter(|s| s.error_type == error_type)
            .max_by(|a, b| a.score().total_cmp(&b.score()))
            .cloned()
    }

    /// All strategies, grouped by error type, best first within each.
    pub async fn strategies(&self) -> Vec<CorrectionStrategy> {
        let state = self.state.read().await;
        let mut all: Vec<CorrectionStrategy> = state.strategies.values().cloned().collect();
        all.sort_by(|a, b| {
            a.error_type
                .cmp(&b.error_type)
                .then_with(|| b.score().total_cmp(&a.score()))
        });
        all
    }

    pub async fn training_size(&self) -> usize {
        self.state.read().await.samples.len()
    }

    pub async fn is_trained(&self) -> bool {
        self.state.read().await.tree.is_some()
    }

    pub async fn export_model(&self) -> ModelExport {
        let strategies = self.strategies().await;
        let state = self.state.read().await;
        ModelExport {
            training_samples: state.samples.len(),
            strategies,
            last_trained: state.trained_at_utc,
            tree: state.tree.as_deref().cloned(),
        }
    }
}

/// Confidence in a sample: mean of the check pass ratio and monitoring
/// stability, whichever were observed.
fn sample_confidence(result: &ValidationResult) -> f64 {
    let mut signals = Vec::with_capacity(2);
    if let Some(ratio) = result.check_pass_ratio() {
        signals.push(ratio);
    }
    if let Some(m) = &result.monitoring {
        signals.push(if m.stable { 1.0 } else { 0.0 });
    }
    if signals.is_empty() {
        0.5
    } else {
        signals.iter().sum::<f64>() / signals.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correction::{CorrectionMetrics, CorrectionResult};
    use chrono::TimeZone;

    fn learner() -> StrategyLearner {
        StrategyLearner::new(&LearningConfig::default(), EventBus::default())
    }

    fn outcome(error_type: &str, method: &str, success: bool, duration_ms: u64) -> ValidationResult {
        let mut r = ValidationResult::new("c-1", error_type, method);
        r.success = success;
        r.apply_duration_ms = duration_ms;
        r
    }

    fn at(hour: u32, load: f64) -> SystemSnapshot {
        SystemSnapshot {
            observed_at: Utc.with_ymd_and_hms(2026, 5, 12, hour, 0, 0).unwrap(),
            system_load: load,
            system_health: 1.0,
            active_users: 10,
        }
    }

    #[tokio::test]
    async fn test_ema_update_and_demotion() {
        let l = learner();
        let snap = at(20, 0.1);
        l.learn_with_snapshot("timeout", "retry", &outcome("timeout", "retry", true, 1_000), &snap).await;
        let s = l.get_best_strategy("timeout").await.unwrap();
        assert_eq!(s.success_rate, 1.0);
        assert_eq!(s.priority, 5);

        l.learn_with_snapshot("timeout", "retry", &outcome("timeout", "retry", false, 2_000), &snap).await;
        let s = l.get_best_strategy("timeout").await.unwrap();
        assert!((s.success_rate - 0.7).abs() < 1e-9);
        assert!((s.avg_execution_time_ms - 1_300.0).abs() < 1e-9);
        assert_eq!(s.priority, 5);

        let mut events = l.events.subscribe();
        l.learn_with_snapshot("timeout", "retry", &outcome("timeout", "retry", false, 2_000), &snap).await;
        let s = l.get_best_strategy("timeout").await.unwrap();
        assert!((s.success_rate - 0.49).abs() < 1e-9);
        assert_eq!(s.priority, 4);
        assert!(matches!(
            events.try_recv().unwrap(),
            HealingEvent::StrategyDemoted { priority: 4, .. }
        ));
    }

    #[tokio::test]
    async fn test_rates_and_priorities_stay_bounded() {
        let l = learner();
        let snap = at(3, 0.2);
        for i in 0..150u64 {
            let success = i % 7 == 0;
            l.learn_with_snapshot("rate_limit", "backoff", &outcome("rate_limit", "backoff", success, i * 100), &snap)
                .await;
        }
        for s in l.strategies().await {
            assert!((0.0..=1.0).contains(&s.success_rate));
            assert!(s.priority <= CorrectionStrategy::INITIAL_PRIORITY);
        }
        assert_eq!(l.get_best_strategy("rate_limit").await.unwrap().priority, 0);
    }

    #[tokio::test]
    async fn test_failure_traits_become_conditions() {
        let l = learner();
        for _ in 0..5 {
            l.learn_with_snapshot("memory_error", "gc", &outcome("memory_error", "gc", false, 500), &at(11, 0.9))
                .await;
        }
        let s = l.get_best_strategy("memory_error").await.unwrap();
        assert_eq!(
            s.conditions,
            vec![StrategyCondition::AvoidBusinessHours, StrategyCondition::RequireLowSystemLoad]
        );

        let p = l.predict_with_snapshot("memory_error", "gc", &at(11, 0.9)).await;
        assert!(p.recommendations.iter().any(|r| r.contains("off-peak")));
        assert!(p.recommendations.iter().any(|r| r.contains("business hours")));
    }

    #[tokio::test]
    async fn test_training_waits_for_minimum_samples() {
        let l = learner();
        let snap = at(14, 0.3);
        for i in 0..49 {
            l.learn_with_snapshot("timeout", "retry", &outcome("timeout", "retry", i % 2 == 0, 100), &snap).await;
        }
        assert!(!l.is_trained().await);
        assert!(matches!(
            l.retrain().await,
            Err(LearningError::InsufficientData { have: 49, need: 50 })
        ));

        l.learn_with_snapshot("timeout", "retry", &outcome("timeout", "retry", true, 100), &snap).await;
        assert!(l.is_trained().await);
        let export = l.export_model().await;
        assert_eq!(export.training_samples, 50);
        assert!(export.tree.is_some());
        assert!(export.last_trained.is_some());
    }

    #[tokio::test]
    async fn test_prediction_sources_and_alternatives() {
        let l = learner();
        let snap = at(20, 0.1);

        let p = l.predict_with_snapshot("network_error", "retry", &snap).await;
        assert_eq!(p.source, PredictionSource::Prior);
        assert_eq!(p.probability, 0.5);
        assert!(p.alternatives.is_empty());

        for (method, success) in [("retry", false), ("reroute", true), ("refresh_dns", true), ("reset_pool", true), ("wait", true)] {
            l.learn_with_snapshot("network_error", method, &outcome("network_error", method, success, 100), &snap)
                .await;
        }
        let p = l.predict_with_snapshot("network_error", "retry", &snap).await;
        assert_eq!(p.source, PredictionSource::History);
        assert_eq!(p.probability, 0.0);
        assert_eq!(p.alternatives.len(), 3);
        assert!(!p.alternatives.contains(&"retry".to_string()));
    }

    #[tokio::test]
    async fn test_best_strategy_weighs_speed() {
        let l = learner();
        let snap = at(20, 0.1);
        l.learn_with_snapshot("timeout", "slow", &outcome("timeout", "slow", true, 9_000), &snap).await;
        l.learn_with_snapshot("timeout", "fast", &outcome("timeout", "fast", true, 500), &snap).await;
        assert_eq!(l.get_best_strategy("timeout").await.unwrap().method, "fast");
        assert!(l.get_best_strategy("unknown").await.is_none());
    }

    #[tokio::test]
    async fn test_execution_time_ignores_monitoring_window() {
        let l = learner();
        let snap = at(20, 0.1);

        let mut committed = outcome("timeout", "increase_timeout", true, 800);
        committed.duration_ms = 300_800;
        l.learn_with_snapshot("timeout", "increase_timeout", &committed, &snap).await;

        let mut reported = outcome("timeout", "reset_pool", true, 50);
        reported.duration_ms = 301_000;
        reported.apply_result = Some(CorrectionResult::success("pool reset").with_metrics(CorrectionMetrics {
            execution_time_ms: Some(1_200),
            ..Default::default()
        }));
        l.learn_with_snapshot("timeout", "reset_pool", &reported, &snap).await;

        l.learn_with_snapshot("timeout", "noop_retry", &outcome("timeout", "noop_retry", false, 0), &snap).await;

        let strategies = l.strategies().await;
        let time_of = |m: &str| strategies.iter().find(|s| s.method == m).unwrap().avg_execution_time_ms;
        assert_eq!(time_of("increase_timeout"), 800.0);
        assert_eq!(time_of("reset_pool"), 1_200.0);
        assert_eq!(l.get_best_strategy("timeout").await.unwrap().method, "increase_timeout");
    }
}
