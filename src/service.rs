//! Composition root: builds every component from one config and owns the
//! background tickers.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::alert::channel::{build_channels, LogChannel};
use crate::alert::{AlertChannel, AlertGate, AlertOutcome, AlertStatistics, ChannelKind};
use crate::config::AutohealConfig;
use crate::correction::breaker::CircuitBreakerRegistry;
use crate::correction::{CatalogCorrection, Correction, CorrectionCatalog, FixRegistry, FixStrategy};
use crate::event::ErrorEvent;
use crate::events::{EventBus, HealingEvent};
use crate::learning::{ModelExport, StrategyLearner};
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::providers::{HealthProvider, MetricsSummaryProvider};
use crate::scheduler;
use crate::validation::rules::{ErrorRateRule, ServiceHealthRule, SlippageRule, SystemHealthRule};
use crate::validation::slippage::EXCESSIVE_SLIPPAGE_PCT;
use crate::validation::{ValidationError, ValidationOrchestrator, ValidationResult, ValidationRule};

/// What `handle_error` did with an error.
#[derive(Debug)]
pub enum HealingOutcome {
    /// No automated fix applies, or the matching rule disables auto-fix.
    AlertOnly { alert: AlertOutcome },
    Corrected {
        result: ValidationResult,
        alert: AlertOutcome,
    },
    Failed {
        result: ValidationResult,
        alert: AlertOutcome,
        escalation: AlertOutcome,
    },
}

pub struct AutoHealBuilder {
    config: AutohealConfig,
    health: Option<Arc<dyn HealthProvider>>,
    summary: Option<Arc<dyn MetricsSummaryProvider>>,
    strategies: Vec<Arc<dyn FixStrategy>>,
    channels: Vec<Arc<dyn AlertChannel>>,
    rules: Vec<Arc<dyn ValidationRule>>,
    default_rules: bool,
}

impl AutoHealBuilder {
    pub fn health_provider(mut self, provider: Arc<dyn HealthProvider>) -> Self {
        self.health = Some(provider);
        self
    }

    pub fn metrics_provider(mut self, provider: Arc<dyn MetricsSummaryProvider>) -> Self {
        self.summary = Some(provider);
        self
    }

    pub fn strategy(mut self, strategy: Arc<dyn FixStrategy>) -> Self {
        self.strategies.push(strategy);
        self
    }

    /// Replaces whatever the config builds for the channel's kind.
    pub fn channel(mut self, channel: Arc<dyn AlertChannel>) -> Self {
        self.channels.push(channel);
        self
    }

    pub fn rule(mut self, rule: Arc<dyn ValidationRule>) -> Self {
        self.rules.push(rule);
        self
    }

    /// Skip the built-in health, error-rate and slippage checks.
    pub fn without_default_rules(mut self) -> Self {
        self.default_rules = false;
        self
    }

    pub async fn build(self) -> Result<AutoHeal> {
        let config = self.config;
        let events = EventBus::new(config.events.capacity);
        let shutdown = CancellationToken::new();

        let breakers = Arc::new(CircuitBreakerRegistry::from_config(&config.correction));
        let catalog = Arc::new(CorrectionCatalog::new(&config.correction, breakers.clone()));
        for strategy in self.strategies {
            catalog.register(strategy).await;
        }

        let fixes: Arc<dyn FixRegistry> = catalog.clone();
        let gate = Arc::new(AlertGate::new(&config.alerting, Some(fixes), events.clone()));
        if config.alerting.channels.is_empty() {
            for kind in [
                ChannelKind::Slack,
                ChannelKind::Email,
                ChannelKind::Pagerduty,
                ChannelKind::Webhook,
                ChannelKind::Sms,
            ] {
                gate.register_channel(Arc::new(LogChannel::new(kind))).await;
            }
        }
        for channel in build_channels(&config.alerting.channels)? {
            gate.register_channel(channel).await;
        }
        for channel in self.channels {
            gate.register_channel(channel).await;
        }

        let mut learner = StrategyLearner::new(&config.learning, events.clone())
            .with_provider_timeout(config.validation.check_timeout());
        if let Some(p) = &self.health {
            learner = learner.with_health_provider(p.clone());
        }
        if let Some(p) = &self.summary {
            learner = learner.with_metrics_provider(p.clone());
        }
        let learner = Arc::new(learner);
        let metrics = Arc::new(MetricsCollector::new(&config.metrics));

        let mut orchestrator = ValidationOrchestrator::new(&config.validation, events.clone())
            .with_learner(learner.clone())
            .with_metrics(metrics.clone())
            .with_cancellation(shutdown.child_token());
        if let Some(p) = &self.health {
            orchestrator = orchestrator.with_health_provider(p.clone());
        }
        let orchestrator = Arc::new(orchestrator);

        if self.default_rules {
            if let Some(p) = &self.health {
                orchestrator.add_rule(Arc::new(SystemHealthRule::new(p.clone()))).await;
                orchestrator.add_rule(Arc::new(ServiceHealthRule::new(p.clone()))).await;
            }
            if let Some(p) = &self.summary {
                orchestrator
                    .add_rule(Arc::new(ErrorRateRule::new(p.clone(), config.validation.max_error_rate)))
                    .await;
            }
            orchestrator
                .add_rule(Arc::new(SlippageRule::new(EXCESSIVE_SLIPPAGE_PCT)))
                .await;
        }
        for rule in self.rules {
            orchestrator.add_rule(rule).await;
        }

        Ok(AutoHeal {
            config,
            events,
            breakers,
            catalog,
            gate,
            learner,
            metrics,
            orchestrator,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }
}

/// The self-healing loop as one service value.
pub struct AutoHeal {
    config: AutohealConfig,
    events: EventBus,
    breakers: Arc<CircuitBreakerRegistry>,
    catalog: Arc<CorrectionCatalog>,
    gate: Arc<AlertGate>,
    learner: Arc<StrategyLearner>,
    metrics: Arc<MetricsCollector>,
    orchestrator: Arc<ValidationOrchestrator>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AutoHeal {
    pub fn builder(config: AutohealConfig) -> AutoHealBuilder {
        AutoHealBuilder {
            config,
            health: None,
            summary: None,
            strategies: Vec::new(),
            channels: Vec::new(),
            rules: Vec::new(),
            default_rules: true,
        }
    }

    // ---- Lifecycle ----

    /// Spawn the group flush and retrain tickers. Calling it again while
    /// they run does nothing.
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return;
        }
        tasks.push(tokio::spawn(scheduler::run_alert_flush_loop(
            self.gate.clone(),
            self.config.alerting.flush_interval(),
            self.shutdown.child_token(),
        )));
        tasks.push(tokio::spawn(scheduler::run_retrain_loop(
            self.learner.clone(),
            self.config.learning.retrain_interval(),
            self.shutdown.child_token(),
        )));
        info!("autoheal started");
    }

    /// Stop the tickers and end any monitoring window in progress.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        info!("autoheal stopped");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    // ---- The loop ----

    /// Alert on `error` and, when the catalog has a fix and no rule forbids
    /// it, apply and validate that fix. A failed fix is escalated.
    pub async fn handle_error(&self, error: ErrorEvent) -> Result<HealingOutcome, ValidationError> {
        let error_type = error.error_type.clone();
        let auto_fix_allowed = self
            .gate
            .matching_rule(&error_type)
            .await
            .map(|r| r.auto_fix_enabled)
            .unwrap_or(true);

        let correction = if auto_fix_allowed {
            CatalogCorrection::prepare(self.catalog.clone(), error.clone()).await
        } else {
            None
        };
        let alert = self.gate.send_alert(&error, &error_type, None).await;
        let Some(correction) = correction else {
            return Ok(HealingOutcome::AlertOnly { alert });
        };

        self.gate.mark_auto_fix_in_progress(&error_type).await;
        let validated = self.orchestrator.validate(&correction).await;
        self.gate.mark_auto_fix_complete(&error_type).await;

        match validated {
            Ok(result) if result.success => Ok(HealingOutcome::Corrected { result, alert }),
            Ok(result) => {
                let reason = result
                    .apply_result
                    .as_ref()
                    .map(|r| r.message.clone())
                    .unwrap_or_else(|| format!("validation ended in {}", result.final_phase));
                let escalation = self.gate.escalate(&error, &error_type, &reason).await;
                Ok(HealingOutcome::Failed {
                    result,
                    alert,
                    escalation,
                })
            }
            Err(e) => {
                self.gate.escalate(&error, &error_type, &e.to_string()).await;
                Err(e)
            }
        }
    }

    /// Validate a caller-supplied correction.
    pub async fn validate(&self, correction: &dyn Correction) -> Result<ValidationResult, ValidationError> {
        self.orchestrator.validate(correction).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealingEvent> {
        self.events.subscribe()
    }

    // ---- Read APIs ----

    pub async fn history(&self, limit: usize) -> Vec<ValidationResult> {
        self.orchestrator.history(limit).await
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot().await
    }

    pub async fn export_model(&self) -> ModelExport {
        self.learner.export_model().await
    }

    pub async fn statistics(&self) -> AlertStatistics {
        self.gate.statistics().await
    }

    // ---- Components ----

    pub fn config(&self) -> &AutohealConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn catalog(&self) -> &Arc<CorrectionCatalog> {
        &self.catalog
    }

    pub fn gate(&self) -> &Arc<AlertGate> {
        &self.gate
    }

    pub fn learner(&self) -> &Arc<StrategyLearner> {
        &self.learner
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn orchestrator(&self) -> &Arc<ValidationOrchestrator> {
        &self.orchestrator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correction::builtin::FallbackStrategy;

    fn quick_config() -> AutohealConfig {
        let mut config = AutohealConfig::default();
        config.validation.monitoring_window_ms = 0;
        config
    }

    #[tokio::test]
    async fn test_build_registers_default_rules() {
        let heal = AutoHeal::builder(quick_config()).build().await.unwrap();
        assert_eq!(heal.orchestrator().rule_names().await, vec!["slippage".to_string()]);
        let bare = AutoHeal::builder(quick_config()).without_default_rules().build().await.unwrap();
        assert!(bare.orchestrator().rule_names().await.is_empty());
    }

    #[tokio::test]
    async fn test_unfixable_error_alerts_only() {
        let heal = AutoHeal::builder(quick_config()).build().await.unwrap();
        let outcome = heal
            .handle_error(ErrorEvent::new("data_corruption", "checksum mismatch"))
            .await
            .unwrap();
        match outcome {
            HealingOutcome::AlertOnly { alert } => assert!(alert.is_sent()),
            other => panic!("expected alert only, got {:?}", other),
        }
        assert!(heal.history(10).await.is_empty());
    }

    #[tokio::test]
    async fn test_fixable_error_is_corrected_and_learned() {
        let heal = AutoHeal::builder(quick_config())
            .strategy(Arc::new(FallbackStrategy::new(serde_json::json!([]))))
            .build()
            .await
            .unwrap();
        let outcome = heal
            .handle_error(ErrorEvent::new("validation_error", "missing field"))
            .await
            .unwrap();
        assert!(matches!(outcome, HealingOutcome::Corrected { .. }));
        assert_eq!(heal.snapshot().await.overall.total_validations, 1);
        assert_eq!(heal.export_model().await.strategies.len(), 1);
        assert_eq!(heal.statistics().await.auto_fix_in_progress, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_shutdown() {
        let heal = AutoHeal::builder(quick_config()).build().await.unwrap();
        heal.start().await;
        heal.start().await;
        assert_eq!(heal.tasks.lock().await.len(), 2);
        heal.shutdown().await;
        assert!(heal.is_shutting_down());
        assert!(heal.tasks.lock().await.is_empty());
    }
}
