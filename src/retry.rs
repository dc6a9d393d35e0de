//! Poll loops for confirmation tracking and adapter lookups
//!
//! Every wait in the pipeline goes through [`Poller::poll_until`]: a probe is
//! called, and while it reports [`PollStatus::Pending`] or fails it is called
//! again after a delay. Delays are taken from a [`RetryPolicy`] and slept on
//! an injected [`Sleeper`], so tests never wait on a real clock.

use crate::config::RetryConfig;
use crate::error::{RelayerError, RelayerResult};

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Delay schedule for poll loops
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay between polls, and after the first failure
    pub interval: Duration,
    /// Multiplier per consecutive failure; `None` keeps the delay fixed
    pub backoff_factor: Option<u32>,
    pub max_delay: Option<Duration>,
    /// Failure streak length at which an error is raised to operators
    pub alert_after: Option<u32>,
    /// Failure streak length at which polling gives up
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Fixed delay, never gives up
    pub fn fixed(interval: Duration) -> Self {
        Self {
            interval,
            backoff_factor: None,
            max_delay: None,
            alert_after: None,
            max_attempts: None,
        }
    }

    pub fn from_config(poll_interval_ms: u64, config: &RetryConfig) -> Self {
        Self {
            interval: Duration::from_millis(poll_interval_ms),
            backoff_factor: config.backoff_factor.filter(|f| *f > 1),
            max_delay: config.max_delay_ms.map(Duration::from_millis),
            alert_after: config.alert_after.filter(|n| *n > 0),
            max_attempts: config.max_poll_attempts.filter(|n| *n > 0),
        }
    }

    /// Delay before the next probe after `failures` consecutive failures
    pub fn delay_after(&self, failures: u32) -> Duration {
        let delay = match self.backoff_factor {
            Some(factor) if failures > 1 => {
                let multiplier = factor.saturating_pow(failures - 1);
                self.interval.saturating_mul(multiplier)
            }
            _ => self.interval,
        };

        match self.max_delay {
            Some(max) => delay.min(max),
            None => delay,
        }
    }

    /// True on every multiple of the alert threshold
    pub fn should_alert(&self, failures: u32) -> bool {
        matches!(self.alert_after, Some(n) if n > 0 && failures % n == 0)
    }

    pub fn exhausted(&self, failures: u32) -> bool {
        matches!(self.max_attempts, Some(max) if failures >= max)
    }
}

/// Something that can wait
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleeps on the tokio timer
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Outcome of a single probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus<T> {
    Ready(T),
    Pending,
}

/// Runs probes under a retry policy
#[derive(Clone)]
pub struct Poller {
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl Poller {
    pub fn new(policy: RetryPolicy, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { policy, sleeper }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn sleep(&self, duration: Duration) {
        self.sleeper.sleep(duration).await;
    }

    /// Call `probe` until it is ready.
    ///
    /// Pending results are re-probed after the poll interval. Failures are
    /// re-probed after the policy delay and only end the loop when the
    /// policy has an attempt cap.
    pub async fn poll_until<T, F, Fut>(&self, label: &str, mut probe: F) -> RelayerResult<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = RelayerResult<PollStatus<T>>> + Send,
        T: Send,
    {
        let mut failures = 0u32;

        loop {
            let delay = match probe().await {
                Ok(PollStatus::Ready(value)) => return Ok(value),
                Ok(PollStatus::Pending) => {
                    failures = 0;
                    debug!("{}: not ready yet", label);
                    self.policy.interval
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    crate::metrics::record_adapter_error(e.kind());

                    if self.policy.exhausted(failures) {
                        error!("{}: giving up after {} failures: {}", label, failures, e);
                        return Err(RelayerError::Timeout {
                            operation: label.to_string(),
                        });
                    }

                    if self.policy.should_alert(failures) {
                        error!("{}: {} consecutive failures, last: {}", label, failures, e);
                        crate::metrics::record_poll_alert();
                    } else {
                        warn!("{}: attempt failed ({}), retrying: {}", label, failures, e);
                    }
                    self.policy.delay_after(failures)
                }
            };

            self.sleeper.sleep(delay).await;
        }
    }
}
