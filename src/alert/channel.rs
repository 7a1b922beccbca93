//! Alert delivery channels.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::alert::IntelligentAlert;
use crate::event::Severity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Slack,
    Email,
    Pagerduty,
    Webhook,
    Sms,
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelKind::Slack => write!(f, "slack"),
            ChannelKind::Email => write!(f, "email"),
            ChannelKind::Pagerduty => write!(f, "pagerduty"),
            ChannelKind::Webhook => write!(f, "webhook"),
            ChannelKind::Sms => write!(f, "sms"),
        }
    }
}

/// Channels an alert of `severity` is routed to.
pub fn channels_for(severity: Severity) -> &'static [ChannelKind] {
    match severity {
        Severity::Info => &[ChannelKind::Slack],
        Severity::Warning | Severity::Error => &[ChannelKind::Slack, ChannelKind::Email],
        Severity::Critical => &[
            ChannelKind::Slack,
            ChannelKind::Email,
            ChannelKind::Pagerduty,
            ChannelKind::Sms,
        ],
    }
}

/// A destination for alerts. Each channel is enabled independently.
#[async_trait::async_trait]
pub trait AlertChannel: Send + Sync {
    fn kind(&self) -> ChannelKind;

    fn is_enabled(&self) -> bool {
        true
    }

    async fn send(&self, alert: &IntelligentAlert) -> Result<()>;
}

/// Payload layout for webhook delivery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookFormat {
    /// The alert serialized as-is.
    #[default]
    Generic,
    /// Slack incoming-webhook `{"text": ...}` body.
    Slack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub kind: ChannelKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Without a URL the channel writes to the log instead.
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub format: WebhookFormat,
}

fn default_enabled() -> bool {
    true
}

/// Build channels from config: a [`WebhookChannel`] where a URL is given,
/// a [`LogChannel`] otherwise.
pub fn build_channels(configs: &[ChannelConfig]) -> Result<Vec<Arc<dyn AlertChannel>>> {
    let mut channels: Vec<Arc<dyn AlertChannel>> = Vec::with_capacity(configs.len());
    for cfg in configs {
        match &cfg.webhook_url {
            Some(url) => {
                let channel = WebhookChannel::new(cfg.kind, url, cfg.format)?.enabled(cfg.enabled);
                channels.push(Arc::new(channel));
            }
            None => channels.push(Arc::new(LogChannel::new(cfg.kind).enabled(cfg.enabled))),
        }
    }
    Ok(channels)
}

// ---------------------------------------------------------------------------
// LogChannel
// ---------------------------------------------------------------------------

/// Writes alerts to the tracing log.
pub struct LogChannel {
    kind: ChannelKind,
    enabled: bool,
}

impl LogChannel {
    pub fn new(kind: ChannelKind) -> Self {
        Self { kind, enabled: true }
    }

    /// Builder-style setter for the enabled flag.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

#[async_trait::async_trait]
impl AlertChannel for LogChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn send(&self, alert: &IntelligentAlert) -> Result<()> {
        match alert.severity {
            Severity::Critical | Severity::Error => warn!(
                channel = %self.kind,
                alert_id = %alert.id,
                severity = %alert.severity,
                error_type = %alert.error_type,
                "{}: {}", alert.title, alert.description
            ),
            _ => info!(
                channel = %self.kind,
                alert_id = %alert.id,
                severity = %alert.severity,
                error_type = %alert.error_type,
                "{}: {}", alert.title, alert.description
            ),
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// WebhookChannel
// ---------------------------------------------------------------------------

/// POSTs alerts as JSON to an HTTP endpoint.
pub struct WebhookChannel {
    kind: ChannelKind,
    url: String,
    format: WebhookFormat,
    enabled: bool,
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(kind: ChannelKind, url: &str, format: WebhookFormat) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build webhook HTTP client")?;
        Ok(Self {
            kind,
            url: url.to_string(),
            format,
            enabled: true,
            client,
        })
    }

    /// Builder-style setter for the enabled flag.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn payload(&self, alert: &IntelligentAlert) -> serde_json::Value {
        match self.format {
            WebhookFormat::Generic => json!({ "alert": alert }),
            WebhookFormat::Slack => {
                let mut text = format!(
                    "*[{}] {}*\n{}",
                    alert.severity.to_string().to_uppercase(),
                    alert.title,
                    alert.description
                );
                for action in &alert.suggested_actions {
                    text.push_str("\n• ");
                    text.push_str(action);
                }
                json!({ "text": text })
            }
        }
    }
}

#[async_trait::async_trait]
impl AlertChannel for WebhookChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn send(&self, alert: &IntelligentAlert) -> Result<()> {
        self.client
            .post(&self.url)
            .json(&self.payload(alert))
            .send()
            .await
            .with_context(|| format!("{} webhook request failed", self.kind))?
            .error_for_status()
            .with_context(|| format!("{} webhook returned an error status", self.kind))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alert() -> IntelligentAlert {
        IntelligentAlert {
            id: uuid::Uuid::new_v4(),
            title: "Rate limit exceeded".into(),
            description: "429 from CRM".into(),
            severity: Severity::Warning,
            error_type: "rate_limit".into(),
            suggested_actions: vec!["Reduce request frequency".into()],
            auto_fix_available: true,
            auto_fix_in_progress: false,
            group_key: None,
            occurrences: 1,
            timestamp: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_severity_routing_table() {
        assert_eq!(channels_for(Severity::Info), &[ChannelKind::Slack]);
        assert_eq!(channels_for(Severity::Error), &[ChannelKind::Slack, ChannelKind::Email]);
        assert_eq!(channels_for(Severity::Critical).len(), 4);
        assert!(channels_for(Severity::Critical).contains(&ChannelKind::Pagerduty));
    }

    #[test]
    fn test_slack_payload() {
        let ch = WebhookChannel::new(ChannelKind::Slack, "http://127.0.0.1:9/hook", WebhookFormat::Slack).unwrap();
        let payload = ch.payload(&alert());
        let text = payload["text"].as_str().unwrap();
        assert!(text.starts_with("*[WARNING] Rate limit exceeded*"));
        assert!(text.contains("• Reduce request frequency"));
    }

    #[test]
    fn test_build_channels_from_config() {
        let configs = vec![
            ChannelConfig {
                kind: ChannelKind::Webhook,
                enabled: true,
                webhook_url: Some("http://127.0.0.1:9/hook".into()),
                format: WebhookFormat::Generic,
            },
            ChannelConfig {
                kind: ChannelKind::Sms,
                enabled: false,
                webhook_url: None,
                format: WebhookFormat::Generic,
            },
        ];
        let channels = build_channels(&configs).unwrap();
        assert_eq!(channels.len(), 2);
        assert_eq!(channels[0].kind(), ChannelKind::Webhook);
        assert!(!channels[1].is_enabled());
    }

    #[tokio::test]
    async fn test_log_channel_accepts_alerts() {
        assert!(LogChannel::new(ChannelKind::Email).send(&alert()).await.is_ok());
    }
}
