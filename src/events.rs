//! Subscription mechanism for loop activity.
//!
//! Components hold a clone of the [`EventBus`] handed to them by the
//! composition root and publish [`HealingEvent`]s on it. Publishing never
//! blocks and never fails when nobody is listening.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::event::Severity;
use crate::validation::Phase;

/// Default broadcast capacity. Slow subscribers observe `Lagged` rather than
/// holding back publishers.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HealingEvent {
    ValidationStarted {
        correction_id: String,
        error_type: String,
    },
    PhaseEntered {
        correction_id: String,
        phase: Phase,
    },
    RolledBack {
        correction_id: String,
        reason: String,
    },
    ValidationCompleted {
        correction_id: String,
        success: bool,
        duration_ms: u64,
    },
    AttemptsExhausted {
        error_type: String,
        attempts: u32,
    },
    AlertSent {
        alert_id: uuid::Uuid,
        error_type: String,
        severity: Severity,
    },
    AlertGrouped {
        group_key: String,
        members: usize,
    },
    AlertSuppressed {
        error_type: String,
    },
    StrategyDemoted {
        error_type: String,
        method: String,
        priority: u32,
    },
    ModelRetrained {
        samples: usize,
        nodes: usize,
    },
}

/// Cloneable publisher handle; every clone feeds the same subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<HealingEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealingEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: HealingEvent) {
        // Err only means there are no receivers right now.
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
