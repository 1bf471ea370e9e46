//! Link reconnection with exponential backoff and jitter
//!
//! The poll cycle calls [`ReconnectHelper::ensure_connected`] before touching
//! the link. Each call makes at most one connection attempt, sleeping the
//! backoff delay first when the previous attempt also failed.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ReconnectConfig;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconnectError {
    #[error("gave up reconnecting after {0} attempts")]
    MaxAttemptsExceeded(u32),

    #[error("reconnect attempt {attempt} failed: {reason}")]
    AttemptFailed { attempt: u32, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Reconnecting,
    /// Attempt budget exhausted; only an explicit reset revives the helper
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// 0 means unlimited
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Spread delays by up to a quarter in either direction
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ReconnectConfig::default())
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            backoff_multiplier: config.backoff_multiplier,
            jitter: true,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct ReconnectStats {
    pub total_attempts: u64,
    pub successful_reconnects: u64,
    pub failed_reconnects: u64,
    pub last_connected: Option<Instant>,
}

#[derive(Debug)]
pub struct ReconnectHelper {
    policy: ReconnectPolicy,
    state: ConnectionState,
    /// Consecutive failed attempts since the last success
    failures: u32,
    stats: ReconnectStats,
}

impl ReconnectHelper {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::Disconnected,
            failures: 0,
            stats: ReconnectStats::default(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn stats(&self) -> &ReconnectStats {
        &self.stats
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Operator reset after the budget was exhausted
    pub fn reset(&mut self) {
        self.failures = 0;
        if self.state != ConnectionState::Connected {
            self.state = ConnectionState::Disconnected;
        }
    }

    pub fn mark_connected(&mut self) {
        if self.state != ConnectionState::Connected {
            debug!("Link marked connected");
        }
        self.state = ConnectionState::Connected;
        self.failures = 0;
        self.stats.last_connected = Some(Instant::now());
    }

    pub fn mark_disconnected(&mut self) {
        if self.state == ConnectionState::Connected {
            debug!("Link marked disconnected");
            self.state = ConnectionState::Disconnected;
        }
    }

    /// Delay before the next attempt after `failures` consecutive failures.
    pub fn backoff_delay(&self) -> Duration {
        if self.failures == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(self.failures - 1).unwrap_or(i32::MAX);
        let scaled = self
            .policy
            .initial_delay
            .as_secs_f64()
            * self.policy.backoff_multiplier.powi(exponent);
        let capped = scaled.min(self.policy.max_delay.as_secs_f64());
        let mut delay = Duration::from_secs_f64(capped.max(0.0));

        if self.policy.jitter {
            let spread = delay.as_secs_f64() * 0.25;
            if spread > 0.0 {
                let offset = rand::thread_rng().gen_range(-spread..spread);
                delay = Duration::from_secs_f64((delay.as_secs_f64() + offset).max(0.0));
            }
        }
        delay
    }

    fn exhausted(&self) -> bool {
        self.policy.max_attempts > 0 && self.failures >= self.policy.max_attempts
    }

    /// Make one connection attempt unless already connected or out of budget.
    pub async fn ensure_connected<F, Fut, E>(
        &mut self,
        is_connected: bool,
        connect: F,
    ) -> Result<(), ReconnectError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: std::fmt::Display,
    {
        if is_connected {
            self.mark_connected();
            return Ok(());
        }
        self.mark_disconnected();

        if self.exhausted() {
            self.state = ConnectionState::Failed;
            return Err(ReconnectError::MaxAttemptsExceeded(self.failures));
        }

        let delay = self.backoff_delay();
        if !delay.is_zero() {
            debug!("Waiting {:?} before reconnecting", delay);
            tokio::time::sleep(delay).await;
        }

        self.state = ConnectionState::Reconnecting;
        self.stats.total_attempts += 1;
        let attempt = self.failures + 1;
        info!(
            "Reconnecting link (attempt {}/{})",
            attempt,
            if self.policy.max_attempts == 0 {
                "unlimited".to_string()
            } else {
                self.policy.max_attempts.to_string()
            }
        );

        match connect().await {
            Ok(()) => {
                info!("Link reconnected after {} failed attempts", self.failures);
                self.stats.successful_reconnects += 1;
                self.mark_connected();
                Ok(())
            },
            Err(e) => {
                warn!("Reconnect attempt {} failed: {}", attempt, e);
                self.failures = attempt;
                self.stats.failed_reconnects += 1;
                self.state = if self.exhausted() {
                    ConnectionState::Failed
                } else {
                    ConnectionState::Disconnected
                };
                Err(ReconnectError::AttemptFailed {
                    attempt,
                    reason: e.to_string(),
                })
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut helper = ReconnectHelper::new(policy(0));
        assert_eq!(helper.backoff_delay(), Duration::ZERO);

        let expected = [100, 200, 400, 500, 500];
        for (failures, millis) in expected.iter().enumerate() {
            helper.failures = failures as u32 + 1;
            assert_eq!(helper.backoff_delay(), Duration::from_millis(*millis));
        }
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        let mut helper = ReconnectHelper::new(ReconnectPolicy {
            jitter: true,
            ..policy(0)
        });
        helper.failures = 2;
        for _ in 0..50 {
            let delay = helper.backoff_delay();
            assert!(delay >= Duration::from_millis(150) && delay <= Duration::from_millis(250));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_connected_skips_attempt() {
        let mut helper = ReconnectHelper::new(policy(3));
        let result = helper
            .ensure_connected(true, || async { Err::<(), _>("must not be called") })
            .await;
        assert!(result.is_ok());
        assert_eq!(helper.state(), ConnectionState::Connected);
        assert_eq!(helper.stats().total_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhaustion_then_reset() {
        let mut helper = ReconnectHelper::new(policy(2));

        for attempt in 1..=2 {
            let err = helper
                .ensure_connected(false, || async { Err::<(), _>("refused") })
                .await
                .unwrap_err();
            assert_eq!(
                err,
                ReconnectError::AttemptFailed {
                    attempt,
                    reason: "refused".to_string()
                }
            );
        }
        assert_eq!(helper.state(), ConnectionState::Failed);

        let err = helper
            .ensure_connected(false, || async { Ok::<(), &str>(()) })
            .await
            .unwrap_err();
        assert_eq!(err, ReconnectError::MaxAttemptsExceeded(2));
        assert_eq!(helper.stats().total_attempts, 2);

        helper.reset();
        helper
            .ensure_connected(false, || async { Ok::<(), &str>(()) })
            .await
            .unwrap();
        assert_eq!(helper.state(), ConnectionState::Connected);
        assert_eq!(helper.stats().successful_reconnects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_attempt_waits_backoff() {
        let mut helper = ReconnectHelper::new(policy(0));
        let _ = helper
            .ensure_connected(false, || async { Err::<(), _>("down") })
            .await;

        let start = Instant::now();
        helper
            .ensure_connected(false, || async { Ok::<(), &str>(()) })
            .await
            .unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(100));
        assert_eq!(helper.failures(), 0);
    }
}
