//! autoheal -- a self-healing loop for long-running services.
//!
//! Errors go through an alert gate. If a fix is known, the fix is applied
//! under validation: pre-checks, a guarded apply, post-checks, a monitoring
//! window, and rollback when any stage fails. Every outcome feeds the
//! strategy learner and the metrics collector.

pub mod alert;
pub mod config;
pub mod correction;
pub mod event;
pub mod events;
pub mod history;
pub mod learning;
pub mod metrics;
pub mod providers;
pub mod scheduler;
pub mod service;
pub mod telemetry;
pub mod validation;

pub use alert::{AlertGate, AlertOutcome, AlertRule, IntelligentAlert};
pub use config::AutohealConfig;
pub use correction::{Correction, CorrectionResult};
pub use event::{ErrorEvent, Severity};
pub use events::{EventBus, HealingEvent};
pub use learning::StrategyLearner;
pub use metrics::MetricsCollector;
pub use service::{AutoHeal, AutoHealBuilder, HealingOutcome};
pub use validation::{Phase, ValidationError, ValidationOrchestrator, ValidationResult};
