//! The alert gate: suppression, routing, grouping and cooldowns.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::alert::channel::{channels_for, AlertChannel, ChannelKind};
use crate::alert::{templates, AlertError, AlertRule, IntelligentAlert};
use crate::config::AlertingConfig;
use crate::correction::FixRegistry;
use crate::event::{ErrorEvent, Severity};
use crate::events::{EventBus, HealingEvent};
use crate::history::BoundedHistory;

/// What `send_alert` did with an alert.
#[derive(Debug)]
pub enum AlertOutcome {
    Suppressed,
    /// Buffered in a group; nothing was delivered yet.
    Grouped { group_key: String, members: usize },
    Sent {
        alert: IntelligentAlert,
        delivered: Vec<ChannelKind>,
        failed: Vec<AlertError>,
    },
}

impl AlertOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, AlertOutcome::Sent { .. })
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AlertStatistics {
    pub total_sent: usize,
    pub suppressed: usize,
    pub delivered_by_channel: BTreeMap<ChannelKind, usize>,
    pub failed_by_channel: BTreeMap<ChannelKind, usize>,
    pub active_cooldowns: usize,
    pub open_groups: usize,
    pub grouped_pending: usize,
    pub auto_fix_in_progress: usize,
}

struct AlertGroup {
    error_type: String,
    opened_at: Instant,
    alerts: Vec<IntelligentAlert>,
}

struct GateState {
    /// error type -> end of its cooldown.
    cooldowns: HashMap<String, Instant>,
    auto_fix: HashSet<String>,
    /// Error types an alert has been delivered for.
    seen: HashSet<String>,
    groups: HashMap<String, AlertGroup>,
    history: BoundedHistory<IntelligentAlert>,
    /// Alerts dispatched since start; `history` forgets old ones.
    sent: usize,
    suppressed: usize,
    delivered: BTreeMap<ChannelKind, usize>,
    failed: BTreeMap<ChannelKind, usize>,
}

impl GateState {
    fn in_cooldown(&self, error_type: &str, now: Instant) -> bool {
        self.cooldowns.get(error_type).map(|until| now < *until).unwrap_or(false)
    }

    /// Rules (2) through (6). Rule (1) needs the fix registry and is checked
    /// before the state lock is taken.
    fn permits(&self, error: &ErrorEvent, error_type: &str, now: Instant) -> bool {
        if self.in_cooldown(error_type, now) {
            return false;
        }
        if self.auto_fix.contains(error_type) {
            return false;
        }
        if !self.seen.contains(error_type) {
            return true;
        }
        templates::is_critical(error, error_type)
    }

    fn start_cooldown(&mut self, error_type: &str, cooldown: Duration, now: Instant) {
        self.cooldowns.insert(error_type.to_string(), now + cooldown);
        self.seen.insert(error_type.to_string());
    }
}

pub struct AlertGate {
    config: AlertingConfig,
    fixes: Option<Arc<dyn FixRegistry>>,
    events: EventBus,
    rules: RwLock<Vec<AlertRule>>,
    channels: RwLock<HashMap<ChannelKind, Arc<dyn AlertChannel>>>,
    state: Mutex<GateState>,
    flushing: Mutex<()>,
}

impl AlertGate {
    pub fn new(config: &AlertingConfig, fixes: Option<Arc<dyn FixRegistry>>, events: EventBus) -> Self {
        Self {
            config: config.clone(),
            fixes,
            events,
            rules: RwLock::new(config.rules.clone()),
            channels: RwLock::new(HashMap::new()),
            state: Mutex::new(GateState {
                cooldowns: HashMap::new(),
                auto_fix: HashSet::new(),
                seen: HashSet::new(),
                groups: HashMap::new(),
                history: BoundedHistory::new(config.history_capacity),
                sent: 0,
                suppressed: 0,
                delivered: BTreeMap::new(),
                failed: BTreeMap::new(),
            }),
            flushing: Mutex::new(()),
        }
    }

    /// Register (or replace) the channel for its kind.
    pub async fn register_channel(&self, channel: Arc<dyn AlertChannel>) {
        self.channels.write().await.insert(channel.kind(), channel);
    }

    pub async fn add_rule(&self, rule: AlertRule) {
        self.rules.write().await.push(rule);
    }

    /// First registered rule matching `error_type`.
    pub async fn matching_rule(&self, error_type: &str) -> Option<AlertRule> {
        self.rules.read().await.iter().find(|r| r.matches(error_type)).cloned()
    }

    async fn known_and_handled(&self, error: &ErrorEvent, rule: Option<&AlertRule>) -> bool {
        match (rule, &self.fixes) {
            (Some(rule), Some(fixes)) if rule.auto_fix_enabled => fixes.has_fix(error).await,
            _ => false,
        }
    }

    /// Decide whether an alert for `error` would be delivered now.
    /// Does not change any state.
    pub async fn should_alert(&self, error: &ErrorEvent, error_type: &str) -> bool {
        let rule = self.matching_rule(error_type).await;
        if self.known_and_handled(error, rule.as_ref()).await {
            return false;
        }
        let state = self.state.lock().await;
        state.permits(error, error_type, Instant::now())
    }

    fn build_alert(&self, error: &ErrorEvent, error_type: &str, rule: Option<&AlertRule>, auto_fix_in_progress: bool) -> IntelligentAlert {
        IntelligentAlert {
            id: uuid::Uuid::new_v4(),
            title: templates::title(error_type),
            description: templates::description(error, error_type),
            severity: rule
                .map(|r| r.severity)
                .unwrap_or_else(|| templates::default_severity(error_type)),
            error_type: error_type.to_string(),
            suggested_actions: templates::suggested_actions(error_type),
            auto_fix_available: rule.map(|r| r.auto_fix_enabled).unwrap_or(false),
            auto_fix_in_progress,
            group_key: None,
            occurrences: 1,
            timestamp: Utc::now(),
        }
    }

    fn group_key(&self, error_type: &str) -> String {
        let window_ms = self.config.grouping_window().as_millis() as i64;
        format!("{}:{}", error_type, Utc::now().timestamp_millis() / window_ms)
    }

    /// Build, gate and deliver an alert. `channels` overrides the severity
    /// routing table.
    pub async fn send_alert(
        &self,
        error: &ErrorEvent,
        error_type: &str,
        channels: Option<&[ChannelKind]>,
    ) -> AlertOutcome {
        let rule = self.matching_rule(error_type).await;
        let handled = self.known_and_handled(error, rule.as_ref()).await;
        let cooldown = rule
            .as_ref()
            .map(|r| r.cooldown(self.config.default_cooldown()))
            .unwrap_or_else(|| self.config.default_cooldown());

        let mut alert = self.build_alert(error, error_type, rule.as_ref(), false);
        let now = Instant::now();

        let mut state = self.state.lock().await;
        if handled || !state.permits(error, error_type, now) {
            state.suppressed += 1;
            drop(state);
            debug!(error_type = %error_type, "alert suppressed");
            self.events.emit(HealingEvent::AlertSuppressed {
                error_type: error_type.to_string(),
            });
            return AlertOutcome::Suppressed;
        }

        if rule.as_ref().map(|r| r.grouping).unwrap_or(false) {
            let key = self.group_key(error_type);
            alert.group_key = Some(key.clone());
            let group = state.groups.entry(key.clone()).or_insert_with(|| AlertGroup {
                error_type: error_type.to_string(),
                opened_at: now,
                alerts: Vec::new(),
            });
            group.alerts.push(alert);
            let members = group.alerts.len();

            if members >= self.config.max_group_size {
                // Full group: summarize now instead of waiting for the ticker.
                if let Some(group) = state.groups.remove(&key) {
                    let summary = summarize(&key, group);
                    state.start_cooldown(error_type, cooldown, now);
                    drop(state);
                    let targets = channels.map(<[ChannelKind]>::to_vec);
                    return self.dispatch(summary, targets).await;
                }
            }
            drop(state);
            debug!(group_key = %key, members, "alert grouped");
            self.events.emit(HealingEvent::AlertGrouped { group_key: key.clone(), members });
            return AlertOutcome::Grouped { group_key: key, members };
        }

        state.start_cooldown(error_type, cooldown, now);
        drop(state);
        self.dispatch(alert, channels.map(<[ChannelKind]>::to_vec)).await
    }

    /// Alert that an automated fix did not resolve `error`. Ignores the
    /// "known and handled" and auto-fix-in-progress suppressions but still
    /// honours the cooldown.
    pub async fn escalate(&self, error: &ErrorEvent, error_type: &str, reason: &str) -> AlertOutcome {
        let rule = self.matching_rule(error_type).await;
        let cooldown = rule
            .as_ref()
            .map(|r| r.cooldown(self.config.default_cooldown()))
            .unwrap_or_else(|| self.config.default_cooldown());
        let now = Instant::now();

        let mut state = self.state.lock().await;
        if state.in_cooldown(error_type, now) {
            state.suppressed += 1;
            drop(state);
            self.events.emit(HealingEvent::AlertSuppressed {
                error_type: error_type.to_string(),
            });
            return AlertOutcome::Suppressed;
        }
        state.start_cooldown(error_type, cooldown, now);
        drop(state);

        let mut alert = self.build_alert(error, error_type, rule.as_ref(), false);
        alert.title = format!("Auto-fix failed: {}", alert.title);
        alert.description = format!("{} ({})", alert.description, reason);
        alert.severity = alert.severity.max(Severity::Error);
        alert.auto_fix_available = false;
        warn!(error_type = %error_type, reason = %reason, "escalating after failed auto-fix");
        self.dispatch(alert, None).await
    }

    /// Send a summary for every group that is old or large enough. Returns
    /// the number of groups flushed; a flush already in progress makes this
    /// a no-op.
    pub async fn flush_groups(&self) -> usize {
        let Ok(_guard) = self.flushing.try_lock() else {
            debug!("group flush already running, skipping");
            return 0;
        };

        let window = self.config.grouping_window();
        let default_cooldown = self.config.default_cooldown();
        let now = Instant::now();

        let due: Vec<(String, AlertGroup)> = {
            let mut state = self.state.lock().await;
            state.cooldowns.retain(|_, until| now < *until);
            let keys: Vec<String> = state
                .groups
                .iter()
                .filter(|(_, g)| {
                    now.duration_since(g.opened_at) >= window || g.alerts.len() >= self.config.max_group_size
                })
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| state.groups.remove(&k).map(|g| (k, g)))
                .collect()
        };

        let mut flushed = 0;
        for (key, group) in due {
            let error_type = group.error_type.clone();
            let cooldown = self
                .matching_rule(&error_type)
                .await
                .map(|r| r.cooldown(default_cooldown))
                .unwrap_or(default_cooldown);
            self.state.lock().await.start_cooldown(&error_type, cooldown, now);
            self.dispatch(summarize(&key, group), None).await;
            flushed += 1;
        }
        if flushed > 0 {
            info!(groups = flushed, "flushed alert groups");
        }
        flushed
    }

    async fn dispatch(&self, alert: IntelligentAlert, targets: Option<Vec<ChannelKind>>) -> AlertOutcome {
        let targets = targets.unwrap_or_else(|| channels_for(alert.severity).to_vec());

        let mut failed = Vec::new();
        let mut selected = Vec::new();
        {
            let channels = self.channels.read().await;
            for kind in targets {
                match channels.get(&kind) {
                    Some(ch) if ch.is_enabled() => selected.push(ch.clone()),
                    Some(_) => debug!(channel = %kind, "channel disabled"),
                    None => failed.push(AlertError::ChannelMissing(kind)),
                }
            }
        }

        let results = join_all(selected.iter().map(|ch| {
            let alert = &alert;
            async move { (ch.kind(), ch.send(alert).await) }
        }))
        .await;

        let mut delivered = Vec::new();
        for (kind, result) in results {
            match result {
                Ok(()) => delivered.push(kind),
                Err(e) => {
                    warn!(channel = %kind, alert_id = %alert.id, error = %e, "alert delivery failed");
                    failed.push(AlertError::Delivery {
                        channel: kind,
                        reason: format!("{:#}", e),
                    });
                }
            }
        }

        {
            let mut state = self.state.lock().await;
            for kind in &delivered {
                *state.delivered.entry(*kind).or_insert(0) += 1;
            }
            for err in &failed {
                let kind = match err {
                    AlertError::ChannelMissing(kind) => *kind,
                    AlertError::Delivery { channel, .. } => *channel,
                };
                *state.failed.entry(kind).or_insert(0) += 1;
            }
            state.history.push(alert.clone());
            state.sent += 1;
        }

        info!(
            alert_id = %alert.id,
            error_type = %alert.error_type,
            severity = %alert.severity,
            delivered = delivered.len(),
            failed = failed.len(),
            "alert sent"
        );
        self.events.emit(HealingEvent::AlertSent {
            alert_id: alert.id,
            error_type: alert.error_type.clone(),
            severity: alert.severity,
        });

        AlertOutcome::Sent { alert, delivered, failed }
    }

    pub async fn mark_auto_fix_in_progress(&self, error_type: &str) {
        self.state.lock().await.auto_fix.insert(error_type.to_string());
    }

    pub async fn mark_auto_fix_complete(&self, error_type: &str) {
        self.state.lock().await.auto_fix.remove(error_type);
    }

    /// Sent alerts, newest first.
    pub async fn history(&self, limit: usize) -> Vec<IntelligentAlert> {
        self.state.lock().await.history.recent(limit)
    }

    pub async fn statistics(&self) -> AlertStatistics {
        let state = self.state.lock().await;
        let now = Instant::now();
        AlertStatistics {
            total_sent: state.sent,
            suppressed: state.suppressed,
            delivered_by_channel: state.delivered.clone(),
            failed_by_channel: state.failed.clone(),
            active_cooldowns: state.cooldowns.values().filter(|until| now < **until).count(),
            open_groups: state.groups.len(),
            grouped_pending: state.groups.values().map(|g| g.alerts.len()).sum(),
            auto_fix_in_progress: state.auto_fix.len(),
        }
    }
}

/// Collapse a group into one alert carrying the batch count.
fn summarize(key: &str, group: AlertGroup) -> IntelligentAlert {
    let count = group.alerts.len();
    let severity = group.alerts.iter().map(|a| a.severity).max().unwrap_or(Severity::Warning);
    let first = group.alerts.into_iter().next();
    let (title, suggested_actions, auto_fix_available) = match first {
        Some(a) => (a.title, a.suggested_actions, a.auto_fix_available),
        None => (templates::title(&group.error_type), Vec::new(), false),
    };
    IntelligentAlert {
        id: uuid::Uuid::new_v4(),
        title: format!("{} ({} occurrences)", title, count),
        description: format!(
            "{} alerts of type {} in the last {}s",
            count,
            group.error_type,
            group.opened_at.elapsed().as_secs()
        ),
        severity,
        error_type: group.error_type,
        suggested_actions,
        auto_fix_available,
        auto_fix_in_progress: false,
        group_key: Some(key.to_string()),
        occurrences: count,
        timestamp: Utc::now(),
    }
}
