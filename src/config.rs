//! TOML configuration for the self-healing loop.
//!
//! Every threshold, window and capacity used by the loop has a compiled-in
//! default here. A config file only needs to name what it overrides.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::alert::channel::ChannelConfig;
use crate::alert::AlertRule;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "AUTOHEAL_CONFIG";

/// System-wide config location checked when the env var is unset.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/autoheal/autoheal.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutohealConfig {
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub alerting: AlertingConfig,
    #[serde(default)]
    pub correction: CorrectionConfig,
    #[serde(default)]
    pub learning: LearningConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AutohealConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded autoheal configuration");
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Try, in order: the `AUTOHEAL_CONFIG` file, the system config file,
    /// compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV_VAR) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "AUTOHEAL_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Reject values that would break invariants of the loop.
    pub fn validate(&self) -> Result<()> {
        let alpha = self.learning.ema_alpha;
        if !(alpha > 0.0 && alpha <= 1.0) {
            anyhow::bail!("learning.ema_alpha must be in (0, 1], got {}", alpha);
        }
        if self.validation.max_consecutive_attempts == 0 {
            anyhow::bail!("validation.max_consecutive_attempts must be at least 1");
        }
        if self.correction.backoff.multiplier < 1.0 {
            anyhow::bail!(
                "correction.backoff.multiplier must be >= 1.0, got {}",
                self.correction.backoff.multiplier
            );
        }
        if self.alerting.max_group_size == 0 {
            anyhow::bail!("alerting.max_group_size must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.validation.max_error_rate) {
            anyhow::bail!(
                "validation.max_error_rate must be in [0, 1], got {}",
                self.validation.max_error_rate
            );
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Deadline for a single pre- or post-check rule.
    pub check_timeout_ms: u64,
    /// Deadline for `Correction::apply`.
    pub apply_timeout_ms: u64,
    /// Deadline for `Correction::rollback`.
    pub rollback_timeout_ms: u64,
    /// Length of the post-apply monitoring window.
    pub monitoring_window_ms: u64,
    /// Health poll interval inside the monitoring window.
    pub monitoring_poll_interval_ms: u64,
    /// Consecutive failed attempts per error type before manual intervention.
    pub max_consecutive_attempts: u32,
    pub history_capacity: usize,
    /// Number of recent results the per-call metrics are derived from.
    pub metrics_window: usize,
    /// Post-check error-rate ceiling (fraction).
    pub max_error_rate: f64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            check_timeout_ms: 10_000,
            apply_timeout_ms: 60_000,
            rollback_timeout_ms: 30_000,
            monitoring_window_ms: 300_000,
            monitoring_poll_interval_ms: 5_000,
            max_consecutive_attempts: 3,
            history_capacity: 1_000,
            metrics_window: 100,
            max_error_rate: 0.05,
        }
    }
}

impl ValidationConfig {
    pub fn check_timeout(&self) -> Duration {
        Duration::from_millis(self.check_timeout_ms)
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_millis(self.apply_timeout_ms)
    }

    pub fn rollback_timeout(&self) -> Duration {
        Duration::from_millis(self.rollback_timeout_ms)
    }

    pub fn monitoring_window(&self) -> Duration {
        Duration::from_millis(self.monitoring_window_ms)
    }

    pub fn monitoring_poll_interval(&self) -> Duration {
        Duration::from_millis(self.monitoring_poll_interval_ms.max(1))
    }
}

// ---------------------------------------------------------------------------
// Alerting
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertingConfig {
    /// Cooldown applied when no rule matches or the rule omits one.
    pub default_cooldown_ms: u64,
    pub grouping_window_ms: u64,
    /// Interval of the grouped-alert flush ticker.
    pub flush_interval_ms: u64,
    /// A group is flushed as soon as it holds this many alerts.
    pub max_group_size: usize,
    pub history_capacity: usize,
    pub rules: Vec<AlertRule>,
    pub channels: Vec<ChannelConfig>,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            default_cooldown_ms: 1_800_000,
            grouping_window_ms: 300_000,
            flush_interval_ms: 60_000,
            max_group_size: 10,
            history_capacity: 1_000,
            rules: Vec::new(),
            channels: Vec::new(),
        }
    }
}

impl AlertingConfig {
    pub fn default_cooldown(&self) -> Duration {
        Duration::from_millis(self.default_cooldown_ms)
    }

    pub fn grouping_window(&self) -> Duration {
        Duration::from_millis(self.grouping_window_ms.max(1))
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }
}

// ---------------------------------------------------------------------------
// Correction catalog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrectionConfig {
    /// Consecutive failures that open a service's circuit.
    pub failure_threshold: u32,
    /// Time an open circuit waits before going half-open.
    pub reset_timeout_ms: u64,
    pub backoff: BackoffConfig,
    /// Wait used by the rate-limit strategy when the error carries no hint.
    pub rate_limit_default_wait_ms: u64,
    pub attempt_log_capacity: usize,
}

impl Default for CorrectionConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
            backoff: BackoffConfig::default(),
            rate_limit_default_wait_ms: 60_000,
            attempt_log_capacity: 1_000,
        }
    }
}

impl CorrectionConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn rate_limit_default_wait(&self) -> Duration {
        Duration::from_millis(self.rate_limit_default_wait_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            max_attempts: 3,
        }
    }
}

// ---------------------------------------------------------------------------
// Learning
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    /// Smoothing factor of the strategy success-rate and timing averages.
    pub ema_alpha: f64,
    pub max_training_samples: usize,
    /// No tree is trained below this many samples.
    pub min_training_samples: usize,
    /// Retrain when the model is older than this.
    pub retrain_interval_ms: u64,
    /// Also retrain whenever the sample count is a multiple of this.
    pub retrain_every: usize,
    pub max_depth: usize,
    pub min_samples_split: usize,
    /// Strategies below this success rate are demoted after a failure.
    pub demotion_threshold: f64,
    /// Failures needed before a shared trait becomes a strategy condition.
    pub failure_pattern_min: usize,
    /// Share of failures inside business hours that marks the trait.
    pub business_hours_ratio: f64,
    pub high_load_threshold: f64,
    /// Predictions below this probability come with alternatives.
    pub alternative_threshold: f64,
    pub max_alternatives: usize,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            ema_alpha: 0.3,
            max_training_samples: 10_000,
            min_training_samples: 50,
            retrain_interval_ms: 3_600_000,
            retrain_every: 100,
            max_depth: 5,
            min_samples_split: 10,
            demotion_threshold: 0.6,
            failure_pattern_min: 5,
            business_hours_ratio: 0.7,
            high_load_threshold: 0.7,
            alternative_threshold: 0.6,
            max_alternatives: 3,
        }
    }
}

impl LearningConfig {
    pub fn retrain_interval(&self) -> Duration {
        Duration::from_millis(self.retrain_interval_ms.max(1))
    }
}

// ---------------------------------------------------------------------------
// Metrics, events, logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub max_series_points: usize,
    /// Samples per window when comparing recent against prior resolution times.
    pub trend_window: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            max_series_points: 10_000,
            trend_window: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: crate::events::DEFAULT_EVENT_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::channel::ChannelKind;
    use crate::event::Severity;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = AutohealConfig::default();

        assert_eq!(cfg.validation.check_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.validation.monitoring_window(), Duration::from_secs(300));
        assert_eq!(cfg.validation.monitoring_poll_interval(), Duration::from_secs(5));
        assert_eq!(cfg.validation.max_consecutive_attempts, 3);
        assert_eq!(cfg.validation.history_capacity, 1_000);
        assert_eq!(cfg.validation.metrics_window, 100);
        assert_eq!(cfg.validation.max_error_rate, 0.05);

        assert_eq!(cfg.alerting.default_cooldown(), Duration::from_secs(1_800));
        assert_eq!(cfg.alerting.grouping_window(), Duration::from_secs(300));
        assert_eq!(cfg.alerting.flush_interval(), Duration::from_secs(60));
        assert_eq!(cfg.alerting.max_group_size, 10);

        assert_eq!(cfg.correction.failure_threshold, 5);
        assert_eq!(cfg.correction.reset_timeout(), Duration::from_secs(60));
        assert_eq!(cfg.correction.backoff.base_delay_ms, 1_000);
        assert_eq!(cfg.correction.backoff.max_delay_ms, 30_000);
        assert_eq!(cfg.correction.backoff.max_attempts, 3);
        assert_eq!(cfg.correction.rate_limit_default_wait(), Duration::from_secs(60));

        assert_eq!(cfg.learning.ema_alpha, 0.3);
        assert_eq!(cfg.learning.max_training_samples, 10_000);
        assert_eq!(cfg.learning.min_training_samples, 50);
        assert_eq!(cfg.learning.retrain_interval(), Duration::from_secs(3_600));
        assert_eq!(cfg.learning.max_depth, 5);

        assert_eq!(cfg.metrics.max_series_points, 10_000);
        assert_eq!(cfg.logging.level, "info");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_parse_rules_and_channels() {
        let toml_str = r#"
[validation]
monitoring_window_ms = 1000

[[alerting.rules]]
pattern = "rate_limit"
severity = "warning"
cooldown_ms = 60000
grouping = true
auto_fix_enabled = true

[[alerting.channels]]
kind = "slack"
webhook_url = "https://hooks.example.com/T000/B000"
format = "slack"

[[alerting.channels]]
kind = "pagerduty"
enabled = false
"#;
        let cfg = AutohealConfig::from_toml(toml_str).unwrap();
        assert_eq!(cfg.validation.monitoring_window_ms, 1000);
        assert_eq!(cfg.validation.check_timeout_ms, 10_000);

        assert_eq!(cfg.alerting.rules.len(), 1);
        let rule = &cfg.alerting.rules[0];
        assert_eq!(rule.pattern, "rate_limit");
        assert_eq!(rule.severity, Severity::Warning);
        assert_eq!(rule.cooldown_ms, Some(60_000));
        assert!(rule.grouping);
        assert!(rule.auto_fix_enabled);

        assert_eq!(cfg.alerting.channels.len(), 2);
        assert_eq!(cfg.alerting.channels[0].kind, ChannelKind::Slack);
        assert!(cfg.alerting.channels[0].enabled);
        assert!(!cfg.alerting.channels[1].enabled);
    }

    #[test]
    fn test_empty_toml_uses_all_defaults() {
        let cfg = AutohealConfig::from_toml("").unwrap();
        assert_eq!(cfg.learning.retrain_every, 100);
        assert!(cfg.alerting.rules.is_empty());
    }

    #[test]
    fn test_invalid_alpha_rejected() {
        let err = AutohealConfig::from_toml("[learning]\nema_alpha = 1.5\n").unwrap_err();
        assert!(err.to_string().contains("ema_alpha"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("autoheal.toml");
        std::fs::write(
            &path,
            r#"
[correction]
failure_threshold = 2
"#,
        )
        .unwrap();

        let cfg = AutohealConfig::load(&path).unwrap();
        assert_eq!(cfg.correction.failure_threshold, 2);
        assert_eq!(cfg.correction.reset_timeout_ms, 60_000);
    }

    #[test]
    fn test_load_missing_file_errors() {
        let result = AutohealConfig::load(Path::new("/nonexistent/autoheal.toml"));
        assert!(result.is_err());
    }
}
