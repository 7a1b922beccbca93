//! Alert governance: whether to alert, where, and how often.

pub mod channel;
pub mod gate;
pub mod templates;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::Severity;

pub use channel::{AlertChannel, ChannelKind};
pub use gate::{AlertGate, AlertOutcome, AlertStatistics};

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("no channel registered for {0}")]
    ChannelMissing(ChannelKind),
    #[error("channel {channel} rejected alert: {reason}")]
    Delivery { channel: ChannelKind, reason: String },
}

/// Registered alerting policy for error types matching `pattern`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    /// Case-insensitive substring of the error type; `*` matches everything.
    pub pattern: String,
    pub severity: Severity,
    /// Falls back to the gate's default cooldown when unset.
    #[serde(default)]
    pub cooldown_ms: Option<u64>,
    #[serde(default)]
    pub grouping: bool,
    #[serde(default)]
    pub auto_fix_enabled: bool,
}

impl AlertRule {
    pub fn new(pattern: impl Into<String>, severity: Severity) -> Self {
        Self {
            pattern: pattern.into(),
            severity,
            cooldown_ms: None,
            grouping: false,
            auto_fix_enabled: false,
        }
    }

    /// Builder-style setter for `cooldown_ms`.
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown_ms = Some(cooldown.as_millis() as u64);
        self
    }

    /// Builder-style setter for `grouping`.
    pub fn grouped(mut self) -> Self {
        self.grouping = true;
        self
    }

    /// Builder-style setter for `auto_fix_enabled`.
    pub fn with_auto_fix(mut self) -> Self {
        self.auto_fix_enabled = true;
        self
    }

    pub fn matches(&self, error_type: &str) -> bool {
        self.pattern == "*" || error_type.to_lowercase().contains(&self.pattern.to_lowercase())
    }

    pub fn cooldown(&self, default: Duration) -> Duration {
        self.cooldown_ms.map(Duration::from_millis).unwrap_or(default)
    }
}

/// A fully rendered alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntelligentAlert {
    pub id: uuid::Uuid,
    pub title: String,
    pub description: String,
    pub severity: Severity,
    pub error_type: String,
    pub suggested_actions: Vec<String>,
    pub auto_fix_available: bool,
    pub auto_fix_in_progress: bool,
    pub group_key: Option<String>,
    /// Number of alerts this one stands for; above 1 for grouped summaries.
    pub occurrences: usize,
    pub timestamp: DateTime<Utc>,
}
