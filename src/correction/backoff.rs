//! Exponential backoff.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::config::BackoffConfig;
use crate::correction::CorrectionError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from(&BackoffConfig::default())
    }
}

impl From<&BackoffConfig> for BackoffPolicy {
    fn from(cfg: &BackoffConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            multiplier: cfg.multiplier.max(1.0),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
            max_attempts: cfg.max_attempts.max(1),
        }
    }
}

impl BackoffPolicy {
    /// Wait before retry number `retry` (1-based): `base * multiplier^(retry-1)`,
    /// capped at `max_delay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(63) as i32;
        let millis = self.base_delay.as_millis() as f64 * self.multiplier.powi(exp);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Run `op` until it succeeds or `max_attempts` is reached, sleeping
    /// between attempts. Returns the successful value and the attempt count.
    pub async fn retry<T, F, Fut>(&self, mut op: F) -> Result<(T, u32), CorrectionError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut last_error = String::new();
        for attempt in 1..=self.max_attempts {
            match op(attempt).await {
                Ok(value) => return Ok((value, attempt)),
                Err(e) => {
                    last_error = e.to_string();
                    if attempt < self.max_attempts {
                        let delay = self.delay_for(attempt);
                        debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying after backoff");
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        Err(CorrectionError::RetriesExhausted {
            attempts: self.max_attempts,
            last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_sequence() {
        let p = BackoffPolicy::default();
        assert_eq!(p.delay_for(1), Duration::from_millis(1_000));
        assert_eq!(p.delay_for(2), Duration::from_millis(2_000));
        assert_eq!(p.delay_for(3), Duration::from_millis(4_000));
        assert_eq!(p.delay_for(6), Duration::from_millis(30_000));
        assert_eq!(p.delay_for(40), Duration::from_millis(30_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_on_third_attempt() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let (value, attempts) = BackoffPolicy::default()
            .retry(|_| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        anyhow::bail!("connection refused")
                    }
                    Ok(n)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 3);
        assert_eq!(attempts, 3);
        // 1s + 2s of backoff
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(3_000));
        assert!(waited < Duration::from_millis(3_100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausts() {
        let err = BackoffPolicy::default()
            .retry(|_| async { Err::<(), _>(anyhow::anyhow!("still down")) })
            .await
            .unwrap_err();
        match err {
            CorrectionError::RetriesExhausted { attempts, last_error } => {
                assert_eq!(attempts, 3);
                assert_eq!(last_error, "still down");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
