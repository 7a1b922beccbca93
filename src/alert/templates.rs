//! Per-error-type alert wording, severities and suggested actions.

use crate::event::{ErrorEvent, Severity};

/// Error types that always warrant an alert.
pub const CRITICAL_ERROR_TYPES: &[&str] = &[
    "database_connection_lost",
    "authentication_failure",
    "data_corruption",
    "security_breach",
    "payment_failure",
    "service_unavailable",
];

/// True if `error_type` is on the critical list or the message says "critical".
pub fn is_critical(error: &ErrorEvent, error_type: &str) -> bool {
    CRITICAL_ERROR_TYPES.iter().any(|t| t.eq_ignore_ascii_case(error_type))
        || error.message.to_lowercase().contains("critical")
}

/// Severity used when no rule matches.
pub fn default_severity(error_type: &str) -> Severity {
    match error_type {
        t if CRITICAL_ERROR_TYPES.contains(&t) => Severity::Critical,
        "database_error" | "memory_error" | "authentication_error" | "configuration_error" => Severity::Error,
        "network_error" | "timeout" | "rate_limit" => Severity::Warning,
        "validation_error" => Severity::Info,
        _ => Severity::Warning,
    }
}

pub fn title(error_type: &str) -> String {
    match error_type {
        "network_error" => "Network connectivity issue".to_string(),
        "timeout" => "Operation timed out".to_string(),
        "rate_limit" => "Rate limit exceeded".to_string(),
        "authentication_error" | "authentication_failure" => "Authentication failed".to_string(),
        "database_error" | "database_connection_lost" => "Database problem".to_string(),
        "memory_error" => "Memory pressure".to_string(),
        "service_unavailable" => "Service unavailable".to_string(),
        "validation_error" => "Invalid data".to_string(),
        "configuration_error" => "Configuration error".to_string(),
        other => format!("Error: {}", other.replace('_', " ")),
    }
}

pub fn description(error: &ErrorEvent, error_type: &str) -> String {
    let subject = match error.metadata.service.as_deref() {
        Some(service) => format!(" in {}", service),
        None => String::new(),
    };
    match error_type {
        "rate_limit" => format!("Requests{} are being throttled: {}", subject, error.message),
        "timeout" => format!("An operation{} did not complete in time: {}", subject, error.message),
        _ => format!("{}{}: {}", title(error_type), subject, error.message),
    }
}

pub fn suggested_actions(error_type: &str) -> Vec<String> {
    let actions: &[&str] = match error_type {
        "network_error" => &[
            "Check network connectivity to the upstream service",
            "Verify DNS resolution and firewall rules",
        ],
        "timeout" => &[
            "Increase the operation timeout",
            "Check the upstream service for slow responses",
        ],
        "rate_limit" => &[
            "Reduce request frequency or batch requests",
            "Request a higher quota from the provider",
        ],
        "authentication_error" | "authentication_failure" => &[
            "Verify credentials have not expired",
            "Re-authorize the integration",
        ],
        "database_error" | "database_connection_lost" => &[
            "Check database availability and connection pool size",
            "Review recent schema or credential changes",
        ],
        "memory_error" => &[
            "Reduce batch sizes",
            "Inspect for memory leaks in long-running workflows",
        ],
        "service_unavailable" => &[
            "Check the service status page",
            "Enable a fallback path until the service recovers",
        ],
        _ => &["Inspect the error details and recent changes"],
    };
    actions.iter().map(|a| a.to_string()).collect()
}
