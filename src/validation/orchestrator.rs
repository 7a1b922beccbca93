//! The correction cycle: pre-check, apply, post-check, monitor, then commit
//! or roll back.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ValidationConfig;
use crate::correction::{Correction, CorrectionResult};
use crate::events::{EventBus, HealingEvent};
use crate::history::BoundedHistory;
use crate::learning::StrategyLearner;
use crate::metrics::MetricsCollector;
use crate::providers::HealthProvider;
use crate::validation::monitor::HealthMonitor;
use crate::validation::rules::{CheckSeverity, RuleStage, ValidationRule};
use crate::validation::{
    NamedCheck, Phase, ValidationCheckResult, ValidationError, ValidationMetrics, ValidationResult,
    MANUAL_INTERVENTION,
};

/// How the guarded apply ended.
enum Applied {
    Returned(CorrectionResult),
    Raised(String),
    TimedOut,
}

pub struct ValidationOrchestrator {
    config: ValidationConfig,
    events: EventBus,
    monitor: HealthMonitor,
    rules: RwLock<Vec<Arc<dyn ValidationRule>>>,
    learner: Option<Arc<StrategyLearner>>,
    metrics: Option<Arc<MetricsCollector>>,
    /// Consecutive failed applies per error type.
    attempts: Mutex<HashMap<String, u32>>,
    history: Mutex<BoundedHistory<ValidationResult>>,
    cancel: CancellationToken,
}

impl ValidationOrchestrator {
    pub fn new(config: &ValidationConfig, events: EventBus) -> Self {
        Self {
            config: config.clone(),
            events,
            monitor: HealthMonitor::new(config, None),
            rules: RwLock::new(Vec::new()),
            learner: None,
            metrics: None,
            attempts: Mutex::new(HashMap::new()),
            history: Mutex::new(BoundedHistory::new(config.history_capacity)),
            cancel: CancellationToken::new(),
        }
    }

    /// Builder-style setter for the provider polled while monitoring.
    pub fn with_health_provider(mut self, provider: Arc<dyn HealthProvider>) -> Self {
        self.monitor = HealthMonitor::new(&self.config, Some(provider));
        self
    }

    pub fn with_learner(mut self, learner: Arc<StrategyLearner>) -> Self {
        self.learner = Some(learner);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Cancelling `token` ends any monitoring window in progress as unstable.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub async fn add_rule(&self, rule: Arc<dyn ValidationRule>) {
        debug!(rule = rule.name(), stage = ?rule.stage(), "validation rule registered");
        self.rules.write().await.push(rule);
    }

    pub async fn rule_names(&self) -> Vec<String> {
        self.rules.read().await.iter().map(|r| r.name().to_string()).collect()
    }

    // ---- The cycle ----

    /// Run one correction through the full cycle.
    ///
    /// Every failure inside the cycle is reported as an unsuccessful
    /// [`ValidationResult`]. The only error is
    /// [`ValidationError::AttemptsExhausted`]: the error type has failed
    /// too many times in a row and `apply` was not called.
    pub async fn validate(&self, correction: &dyn Correction) -> Result<ValidationResult, ValidationError> {
        let started = Instant::now();
        let mut result = ValidationResult::new(correction.id(), correction.error_type(), correction.method());
        info!(
            correction_id = %correction.id(),
            error_type = %correction.error_type(),
            method = %correction.method(),
            "validation started"
        );
        self.events.emit(HealingEvent::ValidationStarted {
            correction_id: correction.id().to_string(),
            error_type: correction.error_type().to_string(),
        });

        // Pre-checks.
        self.enter(&mut result, Phase::Precheck);
        result.pre_checks = self.run_checks(RuleStage::Pre, correction, None).await;
        if let Some(failed) = result.pre_checks.iter().find(|c| !c.result.passed) {
            let note = format!("Pre-check '{}' failed: {}", failed.rule, failed.result.message);
            info!(correction_id = %correction.id(), "{}", note);
            result.recommendations.push(note);
            result.recommendations.push("Resolve the failing pre-check before retrying".to_string());
            self.enter(&mut result, Phase::Rollback);
            return Ok(self.finish(correction, result, started).await);
        }

        // Apply.
        self.enter(&mut result, Phase::Apply);
        let apply_started = Instant::now();
        let applied = self.apply_guarded(correction).await?;
        result.apply_duration_ms = apply_started.elapsed().as_millis() as u64;
        match applied {
            Applied::Returned(applied) if applied.success => {
                result.apply_result = Some(applied);
            }
            Applied::Returned(applied) => {
                info!(correction_id = %correction.id(), message = %applied.message, "correction reported failure");
                result
                    .recommendations
                    .push(format!("Correction failed: {}", applied.message));
                result.apply_result = Some(applied);
                self.enter(&mut result, Phase::Rollback);
                return Ok(self.finish(correction, result, started).await);
            }
            Applied::Raised(reason) => {
                error!(correction_id = %correction.id(), error = %reason, "correction raised an error");
                result.apply_result = Some(CorrectionResult::failure(reason.clone()));
                self.roll_back(correction, &mut result, &reason).await;
                result.recommendations.push(MANUAL_INTERVENTION.to_string());
                return Ok(self.finish(correction, result, started).await);
            }
            Applied::TimedOut => {
                warn!(
                    correction_id = %correction.id(),
                    timeout_ms = self.config.apply_timeout_ms,
                    "correction timed out"
                );
                result.apply_result = Some(CorrectionResult::failure("Timeout"));
                self.roll_back(correction, &mut result, "apply timed out").await;
                result.recommendations.push(MANUAL_INTERVENTION.to_string());
                return Ok(self.finish(correction, result, started).await);
            }
        }

        // Post-checks.
        self.enter(&mut result, Phase::Postcheck);
        result.post_checks = self
            .run_checks(RuleStage::Post, correction, result.apply_result.as_ref())
            .await;
        let failed: Vec<String> = result
            .post_checks
            .iter()
            .filter(|c| !c.result.passed)
            .map(|c| format!("{}: {}", c.rule, c.result.message))
            .collect();
        if !failed.is_empty() {
            let reason = format!("post-check failed ({})", failed.join("; "));
            self.roll_back(correction, &mut result, &reason).await;
            result
                .recommendations
                .push(format!("Correction rolled back after {}", reason));
            return Ok(self.finish(correction, result, started).await);
        }

        // Monitoring.
        self.enter(&mut result, Phase::Monitor);
        let monitoring = self.monitor.watch(&self.cancel).await;
        result.monitoring = Some(monitoring.clone());
        if !monitoring.stable {
            let reason = if monitoring.cancelled {
                "monitoring interrupted by shutdown".to_string()
            } else {
                format!(
                    "system unstable: {} incidents in {} polls",
                    monitoring.incidents, monitoring.polls
                )
            };
            self.roll_back(correction, &mut result, &reason).await;
            result
                .recommendations
                .push(format!("Correction rolled back, {}", reason));
            return Ok(self.finish(correction, result, started).await);
        }

        self.enter(&mut result, Phase::Commit);
        result.success = true;
        Ok(self.finish(correction, result, started).await)
    }

    fn enter(&self, result: &mut ValidationResult, phase: Phase) {
        debug_assert!(
            result.final_phase == phase || result.final_phase.can_transition_to(phase),
            "invalid transition {} -> {}",
            result.final_phase,
            phase
        );
        result.final_phase = phase;
        debug!(correction_id = %result.correction_id, phase = %phase, "phase entered");
        self.events.emit(HealingEvent::PhaseEntered {
            correction_id: result.correction_id.clone(),
            phase,
        });
    }

    /// Run the rules of `stage` in registration order. A failing critical
    /// rule stops the remaining ones.
    async fn run_checks(
        &self,
        stage: RuleStage,
        correction: &dyn Correction,
        applied: Option<&CorrectionResult>,
    ) -> Vec<NamedCheck> {
        let rules: Vec<Arc<dyn ValidationRule>> = self
            .rules
            .read()
            .await
            .iter()
            .filter(|r| r.stage() == stage)
            .cloned()
            .collect();

        let mut checks = Vec::with_capacity(rules.len());
        for rule in rules {
            let t = Instant::now();
            let limit = rule.timeout().unwrap_or_else(|| self.config.check_timeout());
            let outcome = match timeout(limit, AssertUnwindSafe(rule.check(correction, applied)).catch_unwind()).await {
                Ok(Ok(Ok(r))) => r,
                Ok(Ok(Err(e))) => ValidationCheckResult::failed(format!("Check error: {:#}", e)),
                Ok(Err(_)) => ValidationCheckResult::failed("Check panicked"),
                Err(_) => ValidationCheckResult::timeout(),
            };
            let abort = !outcome.passed && rule.severity() == CheckSeverity::Critical;
            if !outcome.passed {
                debug!(rule = rule.name(), message = %outcome.message, "check failed");
            }
            checks.push(NamedCheck {
                rule: rule.name().to_string(),
                severity: rule.severity(),
                result: outcome,
                duration_ms: t.elapsed().as_millis() as u64,
            });
            if abort {
                break;
            }
        }
        checks
    }

    /// Apply behind the attempt counter: refuse once the limit is reached,
    /// reset on success, count any failure.
    async fn apply_guarded(&self, correction: &dyn Correction) -> Result<Applied, ValidationError> {
        let error_type = correction.error_type();
        let max = self.config.max_consecutive_attempts;
        {
            let attempts = self.attempts.lock().await;
            let count = attempts.get(error_type).copied().unwrap_or(0);
            if count >= max {
                drop(attempts);
                warn!(error_type = %error_type, attempts = count, "attempts exhausted, manual intervention required");
                self.events.emit(HealingEvent::AttemptsExhausted {
                    error_type: error_type.to_string(),
                    attempts: count,
                });
                return Err(ValidationError::AttemptsExhausted {
                    error_type: error_type.to_string(),
                    attempts: count,
                });
            }
        }

        let applied = match timeout(
            self.config.apply_timeout(),
            AssertUnwindSafe(correction.apply()).catch_unwind(),
        )
        .await
        {
            Ok(Ok(Ok(r))) => Applied::Returned(r),
            Ok(Ok(Err(e))) => Applied::Raised(format!("{:#}", e)),
            Ok(Err(_)) => Applied::Raised("correction panicked".to_string()),
            Err(_) => Applied::TimedOut,
        };

        let mut attempts = self.attempts.lock().await;
        match &applied {
            Applied::Returned(r) if r.success => {
                attempts.insert(error_type.to_string(), 0);
            }
            _ => {
                let count = attempts.entry(error_type.to_string()).or_insert(0);
                *count += 1;
                debug!(error_type = %error_type, attempts = *count, "failed attempt counted");
            }
        }
        Ok(applied)
    }

    /// Best-effort rollback. Errors are logged and never replace the
    /// original failure.
    async fn roll_back(&self, correction: &dyn Correction, result: &mut ValidationResult, reason: &str) {
        self.enter(result, Phase::Rollback);
        if !correction.supports_rollback() {
            result
                .recommendations
                .push("No rollback available; verify system state manually".to_string());
            return;
        }
        match timeout(
            self.config.rollback_timeout(),
            AssertUnwindSafe(correction.rollback()).catch_unwind(),
        )
        .await
        {
            Ok(Ok(Ok(()))) => {
                result.rolled_back = true;
                info!(correction_id = %correction.id(), reason = %reason, "correction rolled back");
                self.events.emit(HealingEvent::RolledBack {
                    correction_id: correction.id().to_string(),
                    reason: reason.to_string(),
                });
            }
            Ok(Ok(Err(e))) => {
                error!(correction_id = %correction.id(), error = %format!("{:#}", e), "rollback failed");
            }
            Ok(Err(_)) => {
                error!(correction_id = %correction.id(), "rollback panicked");
            }
            Err(_) => {
                error!(correction_id = %correction.id(), "rollback timed out");
            }
        }
    }

    /// Derive metrics, notify the learner and collector, record history.
    async fn finish(&self, correction: &dyn Correction, mut result: ValidationResult, started: Instant) -> ValidationResult {
        result.duration_ms = started.elapsed().as_millis() as u64;
        result.metrics = self.derive_metrics(&result).await;
        self.add_recommendations(&mut result).await;

        // A correction that never reached apply says nothing about its method.
        if let Some(learner) = self.learner.as_ref().filter(|_| result.apply_result.is_some()) {
            learner.learn(correction, &result).await;
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_validation(&result).await;
        }
        self.history.lock().await.push(result.clone());

        info!(
            correction_id = %result.correction_id,
            error_type = %result.error_type,
            success = result.success,
            phase = %result.final_phase,
            rolled_back = result.rolled_back,
            duration_ms = result.duration_ms,
            "validation completed"
        );
        self.events.emit(HealingEvent::ValidationCompleted {
            correction_id: result.correction_id.clone(),
            success: result.success,
            duration_ms: result.duration_ms,
        });
        result
    }

    /// Metrics over the recent history window, `current` included.
    async fn derive_metrics(&self, current: &ValidationResult) -> ValidationMetrics {
        let window = self.config.metrics_window.max(1);
        let (n, successes, false_positives, total_ms) = {
            let history = self.history.lock().await;
            let recent: Vec<&ValidationResult> = history
                .tail(window - 1)
                .chain(std::iter::once(current))
                .collect();
            (
                recent.len() as f64,
                recent.iter().filter(|r| r.success).count() as f64,
                recent.iter().filter(|r| r.is_false_positive()).count() as f64,
                recent.iter().map(|r| r.duration_ms as f64).sum::<f64>(),
            )
        };

        let avg_resolution_time_ms = total_ms / n;
        let success_rate = successes / n;
        let false_positive_rate = false_positives / n;
        let performance_impact = (avg_resolution_time_ms / 60_000.0).min(1.0);
        let rollback_count = self.attempts.lock().await.values().sum();

        ValidationMetrics {
            success_rate,
            avg_resolution_time_ms,
            false_positive_rate,
            rollback_count,
            performance_impact,
            user_impact_score: 0.5 * (1.0 - success_rate) + 0.3 * false_positive_rate + 0.2 * performance_impact,
        }
    }

    async fn add_recommendations(&self, result: &mut ValidationResult) {
        let m = &result.metrics;
        let mut extra = Vec::new();
        if m.success_rate < 0.8 {
            extra.push(format!(
                "Recent correction success rate is {:.0}%; review strategy selection",
                m.success_rate * 100.0
            ));
        }
        if m.user_impact_score > 0.5 {
            extra.push("User impact of corrections is high; prefer less disruptive methods".to_string());
        }
        let failures = self.attempt_count(&result.error_type).await;
        if !result.success && failures > 0 {
            let left = self.config.max_consecutive_attempts.saturating_sub(failures);
            extra.push(if left == 0 {
                format!("{} has failed {} times in a row; further attempts are blocked", result.error_type, failures)
            } else {
                format!("{} has failed {} times in a row; {} attempt(s) left", result.error_type, failures, left)
            });
        }
        if let Some(learner) = self.learner.as_ref().filter(|_| !result.success) {
            if let Some(best) = learner.get_best_strategy(&result.error_type).await {
                if best.method != result.method {
                    extra.push(format!("Consider '{}' for {}", best.method, result.error_type));
                }
            }
        }
        result.recommendations.extend(extra);
    }

    // ---- Read APIs ----

    /// Current consecutive failed attempts for `error_type`.
    pub async fn attempt_count(&self, error_type: &str) -> u32 {
        self.attempts.lock().await.get(error_type).copied().unwrap_or(0)
    }

    /// Clear the counter after manual intervention.
    pub async fn reset_attempts(&self, error_type: &str) {
        self.attempts.lock().await.remove(error_type);
        info!(error_type = %error_type, "attempt counter reset");
    }

    /// Newest first.
    pub async fn history(&self, limit: usize) -> Vec<ValidationResult> {
        self.history.lock().await.recent(limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LearningConfig;
    use crate::providers::{HealthState, HealthStatus};
    use anyhow::Result;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[derive(Clone, Copy)]
    enum Behavior {
        Succeed,
        Fail,
        Raise,
        Hang,
    }

    struct Scripted {
        error_type: String,
        behavior: Behavior,
        rollback: bool,
        applies: AtomicU32,
        rollbacks: AtomicU32,
    }

    impl Scripted {
        fn new(error_type: &str, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                error_type: error_type.to_string(),
                behavior,
                rollback: true,
                applies: AtomicU32::new(0),
                rollbacks: AtomicU32::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl Correction for Scripted {
        fn id(&self) -> &str {
            "scripted"
        }
        fn error_type(&self) -> &str {
            &self.error_type
        }
        fn method(&self) -> &str {
            "scripted_fix"
        }
        async fn apply(&self) -> Result<CorrectionResult> {
            self.applies.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Succeed => Ok(CorrectionResult::success("fixed")),
                Behavior::Fail => Ok(CorrectionResult::failure("still broken")),
                Behavior::Raise => anyhow::bail!("connection reset while applying"),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3_600)).await;
                    Ok(CorrectionResult::success("late"))
                }
            }
        }
        fn supports_rollback(&self) -> bool {
            self.rollback
        }
        async fn rollback(&self) -> Result<()> {
            self.rollbacks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Check {
        stage: RuleStage,
        severity: CheckSeverity,
        passes: bool,
        runs: AtomicU32,
    }

    impl Check {
        fn new(stage: RuleStage, severity: CheckSeverity, passes: bool) -> Arc<Self> {
            Arc::new(Self {
                stage,
                severity,
                passes,
                runs: AtomicU32::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl ValidationRule for Check {
        fn name(&self) -> &str {
            "scripted_check"
        }
        fn stage(&self) -> RuleStage {
            self.stage
        }
        fn severity(&self) -> CheckSeverity {
            self.severity
        }
        async fn check(&self, _c: &dyn Correction, _a: Option<&CorrectionResult>) -> Result<ValidationCheckResult> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(if self.passes {
                ValidationCheckResult::passed("ok")
            } else {
                ValidationCheckResult::failed("not ok")
            })
        }
    }

    struct SlowCheck;

    #[async_trait::async_trait]
    impl ValidationRule for SlowCheck {
        fn name(&self) -> &str {
            "slow"
        }
        fn stage(&self) -> RuleStage {
            RuleStage::Post
        }
        fn severity(&self) -> CheckSeverity {
            CheckSeverity::Low
        }
        async fn check(&self, _c: &dyn Correction, _a: Option<&CorrectionResult>) -> Result<ValidationCheckResult> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(ValidationCheckResult::passed("eventually"))
        }
    }

    /// Applies fine, then panics when asked to undo.
    struct BrokenRollback {
        applies: AtomicU32,
    }

    #[async_trait::async_trait]
    impl Correction for BrokenRollback {
        fn id(&self) -> &str {
            "broken_rollback"
        }
        fn error_type(&self) -> &str {
            "cache_error"
        }
        fn method(&self) -> &str {
            "flush_cache"
        }
        async fn apply(&self) -> Result<CorrectionResult> {
            self.applies.fetch_add(1, Ordering::SeqCst);
            Ok(CorrectionResult::success("flushed"))
        }
        fn supports_rollback(&self) -> bool {
            true
        }
        async fn rollback(&self) -> Result<()> {
            panic!("rollback handler crashed");
        }
    }

    struct PanickingCheck;

    #[async_trait::async_trait]
    impl ValidationRule for PanickingCheck {
        fn name(&self) -> &str {
            "panicking"
        }
        fn stage(&self) -> RuleStage {
            RuleStage::Post
        }
        fn severity(&self) -> CheckSeverity {
            CheckSeverity::Medium
        }
        async fn check(&self, _c: &dyn Correction, _a: Option<&CorrectionResult>) -> Result<ValidationCheckResult> {
            panic!("check crashed");
        }
    }

    struct Fixed(HealthState);

    #[async_trait::async_trait]
    impl HealthProvider for Fixed {
        async fn status(&self) -> Result<HealthStatus> {
            Ok(HealthStatus::with_status(self.0))
        }
    }

    fn orchestrator(window_ms: u64) -> ValidationOrchestrator {
        let cfg = ValidationConfig {
            monitoring_window_ms: window_ms,
            ..ValidationConfig::default()
        };
        ValidationOrchestrator::new(&cfg, EventBus::default())
    }

    #[tokio::test]
    async fn test_successful_cycle_commits() {
        let o = orchestrator(0);
        let c = Scripted::new("timeout", Behavior::Succeed);
        let r = o.validate(c.as_ref()).await.unwrap();
        assert!(r.success);
        assert_eq!(r.final_phase, Phase::Commit);
        assert_eq!(c.rollbacks.load(Ordering::SeqCst), 0);
        assert_eq!(o.attempt_count("timeout").await, 0);
        assert_eq!(o.history(10).await.len(), 1);
    }

    #[tokio::test]
    async fn test_critical_precheck_blocks_apply() {
        let o = orchestrator(0);
        let critical = Check::new(RuleStage::Pre, CheckSeverity::Critical, false);
        let later = Check::new(RuleStage::Pre, CheckSeverity::Low, true);
        o.add_rule(critical.clone()).await;
        o.add_rule(later.clone()).await;

        let c = Scripted::new("timeout", Behavior::Succeed);
        let r = o.validate(c.as_ref()).await.unwrap();
        assert!(!r.success);
        assert_eq!(c.applies.load(Ordering::SeqCst), 0);
        assert_eq!(later.runs.load(Ordering::SeqCst), 0);
        assert_eq!(r.pre_checks.len(), 1);
        assert_eq!(o.attempt_count("timeout").await, 0);
    }

    #[tokio::test]
    async fn test_postcheck_failure_rolls_back_once() {
        let o = orchestrator(0);
        o.add_rule(Check::new(RuleStage::Post, CheckSeverity::Medium, false)).await;
        let c = Scripted::new("cache_error", Behavior::Succeed);
        let r = o.validate(c.as_ref()).await.unwrap();
        assert!(!r.success);
        assert!(r.rolled_back);
        assert_eq!(r.final_phase, Phase::Rollback);
        assert_eq!(c.rollbacks.load(Ordering::SeqCst), 1);
        // The apply itself succeeded.
        assert_eq!(o.attempt_count("cache_error").await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_timeout_is_a_failed_check() {
        let o = orchestrator(0);
        o.add_rule(Arc::new(SlowCheck)).await;
        let c = Scripted::new("timeout", Behavior::Succeed);
        let r = o.validate(c.as_ref()).await.unwrap();
        assert!(!r.success);
        assert_eq!(r.post_checks[0].result.message, "Timeout");
        assert_eq!(c.rollbacks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unstable_monitoring_rolls_back() {
        let cfg = ValidationConfig::default();
        let o = ValidationOrchestrator::new(&cfg, EventBus::default()).with_health_provider(Arc::new(Fixed(HealthState::Unhealthy)));
        let c = Scripted::new("memory_error", Behavior::Succeed);
        let r = o.validate(c.as_ref()).await.unwrap();
        assert!(!r.success);
        let m = r.monitoring.unwrap();
        assert!(m.saw_unhealthy);
        assert_eq!(m.polls, 1);
        assert_eq!(c.rollbacks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_raised_error_becomes_manual_intervention() {
        let o = orchestrator(0);
        let c = Scripted::new("database_error", Behavior::Raise);
        let r = o.validate(c.as_ref()).await.unwrap();
        assert!(!r.success);
        assert!(r.recommendations.iter().any(|s| s == MANUAL_INTERVENTION));
        assert_eq!(c.rollbacks.load(Ordering::SeqCst), 1);
        assert_eq!(o.attempt_count("database_error").await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_timeout() {
        let o = orchestrator(0);
        let c = Scripted::new("network_error", Behavior::Hang);
        let r = o.validate(c.as_ref()).await.unwrap();
        assert!(!r.success);
        assert_eq!(r.apply_result.unwrap().message, "Timeout");
        assert_eq!(o.attempt_count("network_error").await, 1);
    }

    #[tokio::test]
    async fn test_exhaustion_after_three_failures() {
        let o = orchestrator(0);
        let c = Scripted::new("rate_limit", Behavior::Fail);
        for i in 1..=3 {
            let r = o.validate(c.as_ref()).await.unwrap();
            assert!(!r.success);
            assert_eq!(c.rollbacks.load(Ordering::SeqCst), 0);
            assert_eq!(r.metrics.rollback_count, i);
        }
        match o.validate(c.as_ref()).await {
            Err(ValidationError::AttemptsExhausted { error_type, attempts }) => {
                assert_eq!(error_type, "rate_limit");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
        assert_eq!(c.applies.load(Ordering::SeqCst), 3);
        assert_eq!(o.history(10).await.len(), 3);

        o.reset_attempts("rate_limit").await;
        assert!(o.validate(c.as_ref()).await.is_ok());
    }

    #[tokio::test]
    async fn test_metrics_over_history() {
        let o = orchestrator(0);
        o.validate(Scripted::new("a", Behavior::Succeed).as_ref()).await.unwrap();
        let r = o.validate(Scripted::new("b", Behavior::Fail).as_ref()).await.unwrap();
        assert!((r.metrics.success_rate - 0.5).abs() < 1e-9);
        assert_eq!(r.metrics.rollback_count, 1);
        let expected = 0.5 * 0.5 + 0.2 * r.metrics.performance_impact;
        assert!((r.metrics.user_impact_score - expected).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_monitoring() {
        let cancel = CancellationToken::new();
        let o = Arc::new(
            ValidationOrchestrator::new(&ValidationConfig::default(), EventBus::default())
                .with_health_provider(Arc::new(Fixed(HealthState::Healthy)))
                .with_cancellation(cancel.clone()),
        );
        let c = Scripted::new("timeout", Behavior::Succeed);
        let task = {
            let o = o.clone();
            let c = c.clone();
            tokio::spawn(async move { o.validate(c.as_ref()).await })
        };
        tokio::time::sleep(Duration::from_secs(30)).await;
        cancel.cancel();
        let r = task.await.unwrap().unwrap();
        assert!(!r.success);
        assert!(r.monitoring.unwrap().cancelled);
        assert_eq!(c.rollbacks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_precheck_abort_is_not_learned() {
        let learner = Arc::new(StrategyLearner::new(&LearningConfig::default(), EventBus::default()));
        let o = orchestrator(0).with_learner(learner.clone());
        o.add_rule(Check::new(RuleStage::Pre, CheckSeverity::Critical, false)).await;

        let c = Scripted::new("timeout", Behavior::Succeed);
        let r = o.validate(c.as_ref()).await.unwrap();
        assert!(!r.success);
        assert!(r.apply_result.is_none());
        assert!(learner.strategies().await.is_empty());
        assert_eq!(learner.training_size().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_learned_time_excludes_monitoring() {
        let learner = Arc::new(StrategyLearner::new(&LearningConfig::default(), EventBus::default()));
        let o = ValidationOrchestrator::new(&ValidationConfig::default(), EventBus::default())
            .with_health_provider(Arc::new(Fixed(HealthState::Healthy)))
            .with_learner(learner.clone());

        let c = Scripted::new("timeout", Behavior::Succeed);
        let r = o.validate(c.as_ref()).await.unwrap();
        assert!(r.success);
        assert_eq!(r.duration_ms, 300_000);
        assert_eq!(r.apply_duration_ms, 0);

        let best = learner.get_best_strategy("timeout").await.unwrap();
        assert_eq!(best.avg_execution_time_ms, 0.0);
        assert!(best.score() > 0.9);
    }

    #[tokio::test]
    async fn test_panics_in_checks_and_rollback_are_contained() {
        let o = orchestrator(0);
        o.add_rule(Arc::new(PanickingCheck)).await;
        let c = BrokenRollback {
            applies: AtomicU32::new(0),
        };

        let r = o.validate(&c).await.unwrap();
        assert!(!r.success);
        assert_eq!(c.applies.load(Ordering::SeqCst), 1);
        assert_eq!(r.post_checks[0].result.message, "Check panicked");
        assert_eq!(r.final_phase, Phase::Rollback);
        assert!(!r.rolled_back);
        assert_eq!(o.history(10).await.len(), 1);
    }
}
