//! Classified runtime errors as they enter the self-healing loop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity levels shared by alerts and error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Structured metadata attached by the detector.
///
/// The key set is closed: every field the loop reads is named here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorMetadata {
    /// Dependency the error originated from. Used as the circuit breaker key.
    pub service: Option<String>,
    /// HTTP status code, when the error came from an HTTP integration.
    pub status_code: Option<u16>,
    /// Server-provided retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
    pub workflow_id: Option<String>,
    pub node_id: Option<String>,
    /// How many times the failing operation has already been attempted upstream.
    pub attempt: Option<u32>,
}

/// Environmental context captured when the error was classified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorContext {
    pub occurred_at: DateTime<Utc>,
    pub environment: Option<String>,
    pub user_id: Option<String>,
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self {
            occurred_at: Utc::now(),
            environment: None,
            user_id: None,
        }
    }
}

/// Immutable classification of a fault, produced by an external detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub error_type: String,
    pub message: String,
    #[serde(default)]
    pub metadata: ErrorMetadata,
    #[serde(default)]
    pub context: ErrorContext,
}

impl ErrorEvent {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            metadata: ErrorMetadata::default(),
            context: ErrorContext::default(),
        }
    }

    /// Builder-style setter for `metadata`.
    pub fn with_metadata(mut self, metadata: ErrorMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Builder-style setter for `metadata.service`.
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.metadata.service = Some(service.into());
        self
    }

    /// Builder-style setter for `context`.
    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = context;
        self
    }

    /// Key used for per-dependency state such as circuit breakers.
    pub fn service_key(&self) -> &str {
        self.metadata.service.as_deref().unwrap_or(&self.error_type)
    }

    /// True if `pattern` names this error's type or appears in its message
    /// (case-insensitive).
    pub fn matches(&self, pattern: &str) -> bool {
        let pattern = pattern.to_lowercase();
        self.error_type.to_lowercase() == pattern || self.message.to_lowercase().contains(&pattern)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_type_or_message_substring() {
        let e = ErrorEvent::new("network_error", "Connection RESET by peer");
        assert!(e.matches("network_error"));
        assert!(e.matches("NETWORK_ERROR"));
        assert!(e.matches("connection reset"));
        assert!(!e.matches("timeout"));
    }

    #[test]
    fn test_service_key_falls_back_to_type() {
        let e = ErrorEvent::new("rate_limit", "429");
        assert_eq!(e.service_key(), "rate_limit");
        let e = e.with_service("stripe");
        assert_eq!(e.service_key(), "stripe");
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::Error);
        assert!(Severity::Warning > Severity::Info);
        assert_eq!(Severity::Error.to_string(), "error");
    }
}
