//! Post-apply stability window.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, sleep_until, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ValidationConfig;
use crate::providers::{HealthProvider, HealthState};
use crate::validation::MonitoringResult;

/// Polls the health provider for a fixed window after a correction.
pub struct HealthMonitor {
    provider: Option<Arc<dyn HealthProvider>>,
    window: Duration,
    poll_interval: Duration,
    poll_timeout: Duration,
}

impl HealthMonitor {
    pub fn new(config: &ValidationConfig, provider: Option<Arc<dyn HealthProvider>>) -> Self {
        Self {
            provider,
            window: config.monitoring_window(),
            poll_interval: config.monitoring_poll_interval(),
            poll_timeout: config.check_timeout(),
        }
    }

    /// Watch until the window closes, the system turns unhealthy, or
    /// `cancel` fires. Stable means no incidents, no unhealthy poll and no
    /// cancellation. Without a provider there is nothing to watch and the
    /// result is stable.
    pub async fn watch(&self, cancel: &CancellationToken) -> MonitoringResult {
        let started = Instant::now();
        let mut result = MonitoringResult::default();

        let Some(provider) = &self.provider else {
            result.stable = true;
            return result;
        };

        let deadline = started + self.window;
        let mut ticker = interval_at(started + self.poll_interval, self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while !self.window.is_zero() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("monitoring cancelled");
                    result.cancelled = true;
                    break;
                }
                _ = ticker.tick() => {
                    if Instant::now() > deadline {
                        break;
                    }
                    result.polls += 1;
                    match timeout(self.poll_timeout, provider.status()).await {
                        Ok(Ok(status)) => match status.status {
                            HealthState::Unhealthy => {
                                result.incidents += 1;
                                result.saw_unhealthy = true;
                                warn!(poll = result.polls, "system unhealthy during monitoring");
                                break;
                            }
                            HealthState::Degraded => result.incidents += 1,
                            HealthState::Healthy => {
                                if status.failing_checks().next().is_some() {
                                    result.incidents += 1;
                                }
                            }
                        },
                        Ok(Err(e)) => {
                            warn!(error = %e, "health poll failed");
                            result.incidents += 1;
                        }
                        Err(_) => {
                            warn!("health poll timed out");
                            result.incidents += 1;
                        }
                    }
                }
                _ = sleep_until(deadline) => break,
            }
        }

        result.duration_ms = started.elapsed().as_millis() as u64;
        result.stable = !result.cancelled && !result.saw_unhealthy && result.incidents == 0;
        result
    }
}
