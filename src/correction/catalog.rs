//! Registry of named correction strategies.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CorrectionConfig;
use crate::correction::breaker::{CircuitBreakerRegistry, CircuitState};
use crate::correction::{Correction, CorrectionError, CorrectionResult};
use crate::event::ErrorEvent;
use crate::history::BoundedHistory;

/// A named remediation the catalog can run against an error.
#[async_trait::async_trait]
pub trait FixStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Error types or message fragments this strategy handles.
    fn applicable_errors(&self) -> &[String];

    /// Prior confidence in [0, 1]; higher runs first.
    fn confidence(&self) -> f64;

    async fn execute(&self, error: &ErrorEvent) -> Result<CorrectionResult>;

    fn applies_to(&self, error: &ErrorEvent) -> bool {
        self.applicable_errors().iter().any(|p| error.matches(p))
    }
}

/// Answers "is there an automated fix for this error?".
#[async_trait::async_trait]
pub trait FixRegistry: Send + Sync {
    async fn has_fix(&self, error: &ErrorEvent) -> bool;
}

/// One recorded strategy execution.
#[derive(Debug, Clone, Serialize)]
pub struct CorrectionAttempt {
    pub strategy: String,
    pub error_type: String,
    pub success: bool,
    pub message: String,
    pub duration_ms: u64,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StrategyStats {
    pub attempts: u64,
    pub successes: u64,
}

impl StrategyStats {
    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            return 0.0;
        }
        self.successes as f64 / self.attempts as f64
    }
}

/// Result of a successful catalog run.
#[derive(Debug, Clone)]
pub struct CatalogOutcome {
    pub strategy: String,
    pub result: CorrectionResult,
}

pub struct CorrectionCatalog {
    strategies: RwLock<Vec<Arc<dyn FixStrategy>>>,
    attempts: Mutex<BoundedHistory<CorrectionAttempt>>,
    stats: Mutex<HashMap<String, StrategyStats>>,
    breakers: Arc<CircuitBreakerRegistry>,
}

impl CorrectionCatalog {
    pub fn new(config: &CorrectionConfig, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self {
            strategies: RwLock::new(Vec::new()),
            attempts: Mutex::new(BoundedHistory::new(config.attempt_log_capacity)),
            stats: Mutex::new(HashMap::new()),
            breakers,
        }
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub async fn breaker_state(&self, key: &str) -> CircuitState {
        self.breakers.state(key).await
    }

    /// Register a strategy. A strategy with the same name is replaced.
    pub async fn register(&self, strategy: Arc<dyn FixStrategy>) {
        let mut strategies = self.strategies.write().await;
        strategies.retain(|s| s.name() != strategy.name());
        info!(strategy = strategy.name(), confidence = strategy.confidence(), "registered correction strategy");
        strategies.push(strategy);
    }

    pub async fn unregister(&self, name: &str) -> bool {
        let mut strategies = self.strategies.write().await;
        let before = strategies.len();
        strategies.retain(|s| s.name() != name);
        strategies.len() != before
    }

    pub async fn strategy_names(&self) -> Vec<String> {
        self.strategies.read().await.iter().map(|s| s.name().to_string()).collect()
    }

    /// Strategies that apply to `error`, highest confidence first.
    pub async fn applicable(&self, error: &ErrorEvent) -> Vec<Arc<dyn FixStrategy>> {
        let mut matching: Vec<Arc<dyn FixStrategy>> = self
            .strategies
            .read()
            .await
            .iter()
            .filter(|s| s.applies_to(error))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.confidence().total_cmp(&a.confidence()));
        matching
    }

    /// Run applicable strategies in confidence order until one succeeds.
    pub async fn correct(&self, error: &ErrorEvent) -> Result<CatalogOutcome, CorrectionError> {
        let candidates = self.applicable(error).await;
        if candidates.is_empty() {
            debug!(error_type = %error.error_type, "no applicable correction strategy");
            return Err(CorrectionError::NoApplicableStrategy(error.error_type.clone()));
        }

        let tried = candidates.len();
        for strategy in candidates {
            let started = Instant::now();
            let result = match strategy.execute(error).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(strategy = strategy.name(), error = %e, "correction strategy raised an error");
                    CorrectionResult::failure(e.to_string())
                }
            };
            self.record(strategy.name(), error, &result, started.elapsed().as_millis() as u64)
                .await;

            if result.success {
                info!(strategy = strategy.name(), error_type = %error.error_type, "correction strategy succeeded");
                return Ok(CatalogOutcome {
                    strategy: strategy.name().to_string(),
                    result,
                });
            }
            debug!(strategy = strategy.name(), message = %result.message, "correction strategy failed, trying next");
        }

        Err(CorrectionError::AllStrategiesFailed {
            error_type: error.error_type.clone(),
            tried,
        })
    }

    /// `None` when nothing applies or every strategy failed.
    pub async fn try_correct(&self, error: &ErrorEvent) -> Option<CatalogOutcome> {
        self.correct(error).await.ok()
    }

    async fn record(&self, strategy: &str, error: &ErrorEvent, result: &CorrectionResult, duration_ms: u64) {
        self.attempts.lock().await.push(CorrectionAttempt {
            strategy: strategy.to_string(),
            error_type: error.error_type.clone(),
            success: result.success,
            message: result.message.clone(),
            duration_ms,
            at: Utc::now(),
        });
        let mut stats = self.stats.lock().await;
        let entry = stats.entry(strategy.to_string()).or_default();
        entry.attempts += 1;
        if result.success {
            entry.successes += 1;
        }
    }

    /// Recorded attempts, newest first.
    pub async fn attempts(&self, limit: usize) -> Vec<CorrectionAttempt> {
        self.attempts.lock().await.recent(limit)
    }

    pub async fn strategy_stats(&self) -> HashMap<String, StrategyStats> {
        self.stats.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl FixRegistry for CorrectionCatalog {
    async fn has_fix(&self, error: &ErrorEvent) -> bool {
        self.strategies.read().await.iter().any(|s| s.applies_to(error))
    }
}

/// A [`Correction`] whose `apply` runs the catalog against one error.
pub struct CatalogCorrection {
    id: String,
    method: String,
    error: ErrorEvent,
    catalog: Arc<CorrectionCatalog>,
}

impl CatalogCorrection {
    /// `None` if no strategy applies. The method is the name of the strategy
    /// the catalog will try first.
    pub async fn prepare(catalog: Arc<CorrectionCatalog>, error: ErrorEvent) -> Option<Self> {
        let lead = catalog.applicable(&error).await.into_iter().next()?;
        Some(Self {
            id: uuid::Uuid::new_v4().to_string(),
            method: lead.name().to_string(),
            error,
            catalog,
        })
    }

    pub fn error(&self) -> &ErrorEvent {
        &self.error
    }
}

#[async_trait::async_trait]
impl Correction for CatalogCorrection {
    fn id(&self) -> &str {
        &self.id
    }

    fn error_type(&self) -> &str {
        &self.error.error_type
    }

    fn method(&self) -> &str {
        &self.method
    }

    async fn apply(&self) -> Result<CorrectionResult> {
        match self.catalog.correct(&self.error).await {
            Ok(outcome) => Ok(outcome
                .result
                .with_change(format!("strategy '{}' applied", outcome.strategy))),
            Err(e) => Ok(CorrectionResult::failure(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Scripted {
        name: String,
        patterns: Vec<String>,
        confidence: f64,
        succeed: bool,
        raise: bool,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(name: &str, pattern: &str, confidence: f64, succeed: bool) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                patterns: vec![pattern.into()],
                confidence,
                succeed,
                raise: false,
                calls: AtomicU32::new(0),
            })
        }

        fn raising(name: &str, pattern: &str, confidence: f64) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                patterns: vec![pattern.into()],
                confidence,
                succeed: true,
                raise: true,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl FixStrategy for Scripted {
        fn name(&self) -> &str {
            &self.name
        }
        fn applicable_errors(&self) -> &[String] {
            &self.patterns
        }
        fn confidence(&self) -> f64 {
            self.confidence
        }
        async fn execute(&self, _error: &ErrorEvent) -> Result<CorrectionResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.raise {
                anyhow::bail!("strategy crashed");
            }
            if self.succeed {
                Ok(CorrectionResult::success(format!("{} ok", self.name)))
            } else {
                Ok(CorrectionResult::failure(format!("{} failed", self.name)))
            }
        }
    }

    fn catalog() -> CorrectionCatalog {
        let cfg = CorrectionConfig::default();
        CorrectionCatalog::new(&cfg, Arc::new(CircuitBreakerRegistry::from_config(&cfg)))
    }

    #[tokio::test]
    async fn test_runs_in_confidence_order_until_success() {
        let cat = catalog();
        let low = Scripted::new("low", "timeout", 0.2, true);
        let high = Scripted::new("high", "timeout", 0.9, false);
        let mid = Scripted::new("mid", "timeout", 0.5, true);
        cat.register(low.clone()).await;
        cat.register(high.clone()).await;
        cat.register(mid.clone()).await;

        let outcome = cat.try_correct(&ErrorEvent::new("timeout", "request timed out")).await.unwrap();
        assert_eq!(outcome.strategy, "mid");
        assert_eq!(high.calls.load(Ordering::SeqCst), 1);
        assert_eq!(mid.calls.load(Ordering::SeqCst), 1);
        assert_eq!(low.calls.load(Ordering::SeqCst), 0);

        let attempts = cat.attempts(10).await;
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].strategy, "mid");
        assert!(!attempts[1].success);
    }

    #[tokio::test]
    async fn test_breaker_state_passthrough() {
        let cat = catalog();
        assert_eq!(cat.breaker_state("payments").await, CircuitState::Closed);
        for _ in 0..5 {
            cat.breakers().record_failure("payments").await;
        }
        assert_eq!(cat.breaker_state("payments").await, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_message_substring_matching() {
        let cat = catalog();
        cat.register(Scripted::new("pool", "connection pool", 0.5, true)).await;
        let error = ErrorEvent::new("database_error", "Connection Pool exhausted");
        assert!(cat.has_fix(&error).await);
        assert!(cat.try_correct(&error).await.is_some());
    }

    #[tokio::test]
    async fn test_none_when_nothing_applies_or_all_fail() {
        let cat = catalog();
        assert!(cat.try_correct(&ErrorEvent::new("disk_full", "")).await.is_none());

        cat.register(Scripted::new("a", "disk_full", 0.5, false)).await;
        cat.register(Scripted::raising("b", "disk_full", 0.4)).await;
        let err = cat.correct(&ErrorEvent::new("disk_full", "")).await.unwrap_err();
        assert!(matches!(err, CorrectionError::AllStrategiesFailed { tried: 2, .. }));

        let stats = cat.strategy_stats().await;
        assert_eq!(stats["a"].attempts, 1);
        assert_eq!(stats["b"].success_rate(), 0.0);
    }

    #[tokio::test]
    async fn test_catalog_correction_adapter() {
        let cat = Arc::new(catalog());
        assert!(CatalogCorrection::prepare(cat.clone(), ErrorEvent::new("timeout", "")).await.is_none());

        cat.register(Scripted::new("retry", "timeout", 0.7, true)).await;
        let c = CatalogCorrection::prepare(cat.clone(), ErrorEvent::new("timeout", "")).await.unwrap();
        assert_eq!(c.method(), "retry");
        assert_eq!(c.error_type(), "timeout");
        let result = c.apply().await.unwrap();
        assert!(result.success);
        assert!(result.changes.iter().any(|ch| ch.contains("retry")));
    }
}
