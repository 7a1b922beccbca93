use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::alert::AlertGate;
use crate::learning::StrategyLearner;

fn ticker(period: Duration) -> tokio::time::Interval {
    // First tick one full period from now rather than immediately.
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

/// Flush aged or full alert groups every `period` until `cancel` fires.
pub async fn run_alert_flush_loop(gate: Arc<AlertGate>, period: Duration, cancel: CancellationToken) {
    info!(period_ms = period.as_millis() as u64, "alert flush loop started");
    let mut interval = ticker(period);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let flushed = gate.flush_groups().await;
                debug!(flushed, "alert flush tick");
            }
        }
    }
    info!("alert flush loop stopped");
}

/// Retrain the learner's model whenever it is due, checked every `period`.
pub async fn run_retrain_loop(learner: Arc<StrategyLearner>, period: Duration, cancel: CancellationToken) {
    info!(period_ms = period.as_millis() as u64, "retrain loop started");
    let mut interval = ticker(period);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let retrained = learner.retrain_if_due().await;
                debug!(retrained, "retrain tick");
            }
        }
    }
    info!("retrain loop stopped");
}
