//! Built-in correction strategies.
//!
//! Each strategy wraps a caller-supplied [`RecoveryAction`]: the catalog owns
//! the retry, wait and breaker policy, the action owns the actual side effect.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info};

use crate::correction::backoff::BackoffPolicy;
use crate::correction::breaker::{CircuitBreakerRegistry, CircuitState};
use crate::correction::catalog::FixStrategy;
use crate::correction::{CorrectionMetrics, CorrectionResult};
use crate::event::ErrorEvent;

pub const NETWORK_RETRY: &str = "network-retry";
pub const RATE_LIMIT_BACKOFF: &str = "rate-limit-backoff";
pub const CACHE_CLEANUP: &str = "cache-cleanup";
pub const SERVICE_RESTART: &str = "service-restart";
pub const DEFAULT_FALLBACK: &str = "default-fallback";
pub const CIRCUIT_BREAKER: &str = "circuit-breaker";

/// The side effect a built-in strategy performs: re-issue a request, purge a
/// cache, restart a worker.
#[async_trait::async_trait]
pub trait RecoveryAction: Send + Sync {
    async fn run(&self, error: &ErrorEvent) -> Result<()>;
}

fn patterns(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

// ---------------------------------------------------------------------------
// Network retry
// ---------------------------------------------------------------------------

pub struct NetworkRetryStrategy {
    patterns: Vec<String>,
    policy: BackoffPolicy,
    action: Arc<dyn RecoveryAction>,
}

impl NetworkRetryStrategy {
    pub fn new(action: Arc<dyn RecoveryAction>, policy: BackoffPolicy) -> Self {
        Self {
            patterns: patterns(&["network_error", "econnreset", "econnrefused", "socket hang up", "network"]),
            policy,
            action,
        }
    }
}

#[async_trait::async_trait]
impl FixStrategy for NetworkRetryStrategy {
    fn name(&self) -> &str {
        NETWORK_RETRY
    }

    fn applicable_errors(&self) -> &[String] {
        &self.patterns
    }

    fn confidence(&self) -> f64 {
        0.8
    }

    async fn execute(&self, error: &ErrorEvent) -> Result<CorrectionResult> {
        let started = tokio::time::Instant::now();
        let outcome = self.policy.retry(|_| self.action.run(error)).await;
        let metrics = CorrectionMetrics {
            execution_time_ms: Some(started.elapsed().as_millis() as u64),
            ..Default::default()
        };
        Ok(match outcome {
            Ok(((), attempts)) => CorrectionResult::success(format!("operation succeeded on attempt {}", attempts))
                .with_change(format!("retried with exponential backoff ({} attempts)", attempts))
                .with_metrics(metrics),
            Err(e) => CorrectionResult::failure(e.to_string()).with_metrics(metrics),
        })
    }
}

// ---------------------------------------------------------------------------
// Rate limit
// ---------------------------------------------------------------------------

pub struct RateLimitStrategy {
    patterns: Vec<String>,
    default_wait: Duration,
    action: Arc<dyn RecoveryAction>,
}

impl RateLimitStrategy {
    pub fn new(action: Arc<dyn RecoveryAction>, default_wait: Duration) -> Self {
        Self {
            patterns: patterns(&["rate_limit", "too many requests", "429"]),
            default_wait,
            action,
        }
    }

    /// Wait requested by the error, else the configured default.
    pub fn wait_for(&self, error: &ErrorEvent) -> Duration {
        parse_retry_after(error).unwrap_or(self.default_wait)
    }
}

/// Extract a retry hint from metadata or from "retry after N" / "retry-after: N"
/// in the message. Bare numbers are seconds; an `ms` suffix means milliseconds.
pub fn parse_retry_after(error: &ErrorEvent) -> Option<Duration> {
    if let Some(ms) = error.metadata.retry_after_ms {
        return Some(Duration::from_millis(ms));
    }

    let message = error.message.to_lowercase();
    let idx = ["retry-after", "retry after"].iter().find_map(|marker| message.find(marker).map(|i| i + marker.len()))?;

    let rest = message[idx..].trim_start_matches(|c: char| c == ':' || c == '=' || c.is_whitespace());
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    let value: u64 = digits.parse().ok()?;
    let unit = &rest[digits.len()..];
    if unit.starts_with("ms") {
        Some(Duration::from_millis(value))
    } else {
        Some(Duration::from_secs(value))
    }
}

#[async_trait::async_trait]
impl FixStrategy for RateLimitStrategy {
    fn name(&self) -> &str {
        RATE_LIMIT_BACKOFF
    }

    fn applicable_errors(&self) -> &[String] {
        &self.patterns
    }

    fn confidence(&self) -> f64 {
        0.9
    }

    async fn execute(&self, error: &ErrorEvent) -> Result<CorrectionResult> {
        let wait = self.wait_for(error);
        debug!(wait_ms = wait.as_millis() as u64, "waiting out rate limit");
        tokio::time::sleep(wait).await;

        match self.action.run(error).await {
            Ok(()) => Ok(CorrectionResult::success("request succeeded after rate-limit wait")
                .with_change(format!("waited {} ms before retrying", wait.as_millis()))
                .with_metrics(CorrectionMetrics {
                    execution_time_ms: Some(wait.as_millis() as u64),
                    ..Default::default()
                })),
            Err(e) => Ok(CorrectionResult::failure(format!("still rate limited: {}", e))),
        }
    }
}

// ---------------------------------------------------------------------------
// Cache / memory cleanup, service restart
// ---------------------------------------------------------------------------

/// A strategy that runs its action once and reports a fixed change.
pub struct ActionStrategy {
    name: &'static str,
    patterns: Vec<String>,
    confidence: f64,
    change: &'static str,
    action: Arc<dyn RecoveryAction>,
}

impl ActionStrategy {
    pub fn cache_cleanup(action: Arc<dyn RecoveryAction>) -> Self {
        Self {
            name: CACHE_CLEANUP,
            patterns: patterns(&["memory_error", "out of memory", "heap", "cache"]),
            confidence: 0.6,
            change: "cleared caches and released memory",
            action,
        }
    }

    pub fn service_restart(action: Arc<dyn RecoveryAction>) -> Self {
        Self {
            name: SERVICE_RESTART,
            patterns: patterns(&["service_unavailable", "503", "crashed", "unresponsive"]),
            confidence: 0.5,
            change: "restarted the failing service",
            action,
        }
    }

    /// Builder-style override of the applicability patterns.
    pub fn with_patterns(mut self, list: &[&str]) -> Self {
        self.patterns = patterns(list);
        self
    }
}

#[async_trait::async_trait]
impl FixStrategy for ActionStrategy {
    fn name(&self) -> &str {
        self.name
    }

    fn applicable_errors(&self) -> &[String] {
        &self.patterns
    }

    fn confidence(&self) -> f64 {
        self.confidence
    }

    async fn execute(&self, error: &ErrorEvent) -> Result<CorrectionResult> {
        self.action.run(error).await?;
        info!(strategy = self.name, error_type = %error.error_type, "recovery action completed");
        Ok(CorrectionResult::success(format!("{} completed", self.name)).with_change(self.change))
    }
}

// ---------------------------------------------------------------------------
// Default-value fallback
// ---------------------------------------------------------------------------

/// Substitutes a default value for missing or invalid data. Never fails.
pub struct FallbackStrategy {
    patterns: Vec<String>,
    default_value: serde_json::Value,
}

impl FallbackStrategy {
    pub fn new(default_value: serde_json::Value) -> Self {
        Self {
            patterns: patterns(&["validation_error", "missing", "undefined", "null value"]),
            default_value,
        }
    }
}

#[async_trait::async_trait]
impl FixStrategy for FallbackStrategy {
    fn name(&self) -> &str {
        DEFAULT_FALLBACK
    }

    fn applicable_errors(&self) -> &[String] {
        &self.patterns
    }

    fn confidence(&self) -> f64 {
        0.4
    }

    async fn execute(&self, error: &ErrorEvent) -> Result<CorrectionResult> {
        let target = error.metadata.node_id.as_deref().unwrap_or("input");
        Ok(CorrectionResult::success("applied default value")
            .with_change(format!("{} defaulted to {}", target, self.default_value)))
    }
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

/// Guards a dependency with its per-service breaker. While the circuit is
/// open the strategy succeeds by failing fast instead of calling through.
pub struct CircuitBreakerStrategy {
    patterns: Vec<String>,
    breakers: Arc<CircuitBreakerRegistry>,
    action: Arc<dyn RecoveryAction>,
}

impl CircuitBreakerStrategy {
    pub fn new(breakers: Arc<CircuitBreakerRegistry>, action: Arc<dyn RecoveryAction>) -> Self {
        Self {
            patterns: patterns(&["service_unavailable", "timeout", "circuit"]),
            breakers,
            action,
        }
    }
}

#[async_trait::async_trait]
impl FixStrategy for CircuitBreakerStrategy {
    fn name(&self) -> &str {
        CIRCUIT_BREAKER
    }

    fn applicable_errors(&self) -> &[String] {
        &self.patterns
    }

    fn confidence(&self) -> f64 {
        0.7
    }

    async fn execute(&self, error: &ErrorEvent) -> Result<CorrectionResult> {
        let key = error.service_key();
        if !self.breakers.allows(key).await {
            return Ok(CorrectionResult::success(format!("circuit open for '{}', failing fast", key))
                .with_change("short-circuited calls to failing dependency"));
        }

        match self.action.run(error).await {
            Ok(()) => {
                self.breakers.record_success(key).await;
                Ok(CorrectionResult::success(format!("call to '{}' succeeded", key)))
            }
            Err(e) => {
                let state = self.breakers.record_failure(key).await;
                if state == CircuitState::Open {
                    Ok(CorrectionResult::success(format!("circuit opened for '{}'", key))
                        .with_change("opened circuit; further calls fail fast"))
                } else {
                    Ok(CorrectionResult::failure(format!("call to '{}' failed: {}", key, e)))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ErrorMetadata;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` calls, then succeeds.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl RecoveryAction for Flaky {
        async fn run(&self, _error: &ErrorEvent) -> Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                anyhow::bail!("ECONNRESET");
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_retry_recovers() {
        let action = Flaky::new(2);
        let s = NetworkRetryStrategy::new(action.clone(), BackoffPolicy::default());
        let r = s.execute(&ErrorEvent::new("network_error", "ECONNRESET")).await.unwrap();
        assert!(r.success);
        assert_eq!(action.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_retry_gives_up_after_three() {
        let action = Flaky::new(10);
        let s = NetworkRetryStrategy::new(action.clone(), BackoffPolicy::default());
        let r = s.execute(&ErrorEvent::new("network_error", "down")).await.unwrap();
        assert!(!r.success);
        assert_eq!(action.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_parse_retry_after() {
        let e = ErrorEvent::new("rate_limit", "429 Too Many Requests, retry after 30");
        assert_eq!(parse_retry_after(&e), Some(Duration::from_secs(30)));

        let e = ErrorEvent::new("rate_limit", "Retry-After: 250ms");
        assert_eq!(parse_retry_after(&e), Some(Duration::from_millis(250)));

        let e = ErrorEvent::new("rate_limit", "slow down").with_metadata(ErrorMetadata {
            retry_after_ms: Some(1_500),
            ..Default::default()
        });
        assert_eq!(parse_retry_after(&e), Some(Duration::from_millis(1_500)));

        assert_eq!(parse_retry_after(&ErrorEvent::new("rate_limit", "slow down")), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_defaults_to_sixty_seconds() {
        let s = RateLimitStrategy::new(Flaky::new(0), Duration::from_secs(60));
        let started = tokio::time::Instant::now();
        let r = s.execute(&ErrorEvent::new("rate_limit", "429")).await.unwrap();
        assert!(r.success);
        assert!(started.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_fallback_always_succeeds() {
        let s = FallbackStrategy::new(serde_json::json!(0));
        let r = s.execute(&ErrorEvent::new("validation_error", "missing field")).await.unwrap();
        assert!(r.success);
        assert_eq!(r.changes, vec!["input defaulted to 0".to_string()]);
    }

    #[tokio::test]
    async fn test_action_strategy_propagates_action_error() {
        let s = ActionStrategy::service_restart(Flaky::new(1));
        assert!(s.execute(&ErrorEvent::new("service_unavailable", "")).await.is_err());
        assert!(s.execute(&ErrorEvent::new("service_unavailable", "")).await.unwrap().success);
    }

    #[tokio::test]
    async fn test_circuit_breaker_fails_fast_when_open() {
        let breakers = Arc::new(CircuitBreakerRegistry::new(5, Duration::from_secs(60)));
        let action = Flaky::new(u32::MAX);
        let s = CircuitBreakerStrategy::new(breakers.clone(), action.clone());
        let error = ErrorEvent::new("service_unavailable", "upstream 503").with_service("crm");

        for _ in 0..4 {
            assert!(!s.execute(&error).await.unwrap().success);
        }
        // fifth failure trips the circuit
        assert!(s.execute(&error).await.unwrap().success);
        assert_eq!(breakers.state("crm").await, CircuitState::Open);

        let r = s.execute(&error).await.unwrap();
        assert!(r.success);
        assert!(r.message.contains("failing fast"));
        assert_eq!(action.calls.load(Ordering::SeqCst), 5);
    }
}
