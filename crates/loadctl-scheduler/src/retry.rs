use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use loadctl_core::{BackoffStrategy, RetryConfig};
use rand::Rng;
use tracing::{info, warn};

/// Bounded retry around one caller-supplied action.
///
/// Every error is retried the same way; there is no transient/permanent
/// split at this layer. The error from the final attempt is returned to the
/// caller unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Backoff unit: the delay after the first failure.
    pub backoff: Duration,
    pub strategy: BackoffStrategy,
    pub max_backoff: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            backoff: Duration::from_millis(cfg.backoff_ms),
            strategy: cfg.strategy,
            max_backoff: Duration::from_millis(cfg.max_backoff_ms),
            jitter: cfg.jitter,
        }
    }
}

/// Per-call bookkeeping, owned by a single `retry` invocation.
#[derive(Debug)]
pub struct RetryContext {
    /// 1-based number of the attempt about to run.
    pub attempt: u32,
    pub max_attempts: u32,
    pub backoff: Duration,
    /// Rendered error of the previous attempt.
    pub last_error: Option<String>,
}

impl RetryPolicy {
    /// A policy with no delay between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Duration::ZERO,
            strategy: BackoffStrategy::Fixed,
            max_backoff: Duration::ZERO,
            jitter: false,
        }
    }

    /// Delay to wait after the `failed_attempt`-th failure, before jitter.
    pub fn delay_for(&self, failed_attempt: u32) -> Duration {
        let n = failed_attempt.max(1);
        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.backoff,
            BackoffStrategy::Linear => self.backoff.saturating_mul(n),
            BackoffStrategy::Exponential => {
                let factor = 2u32.saturating_pow(n - 1);
                self.backoff.saturating_mul(factor)
            }
        };
        if self.max_backoff.is_zero() {
            delay
        } else {
            delay.min(self.max_backoff)
        }
    }

    fn sleep_duration(&self, failed_attempt: u32) -> Duration {
        let base = self.delay_for(failed_attempt);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let ms = base.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=ms))
    }

    /// Run `action(params)` until it succeeds or `max_attempts` are used up.
    pub async fn retry<P, T, E, F, Fut>(&self, params: P, mut action: F) -> Result<T, E>
    where
        P: Clone,
        E: Display,
        F: FnMut(P) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut ctx = RetryContext {
            attempt: 1,
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            last_error: None,
        };

        loop {
            match action(params.clone()).await {
                Ok(value) => {
                    if ctx.attempt > 1 {
                        info!(attempt = ctx.attempt, "action succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if ctx.attempt >= ctx.max_attempts => {
                    warn!(
                        attempts = ctx.attempt,
                        err = %e,
                        "action failed, retries exhausted"
                    );
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.sleep_duration(ctx.attempt);
                    warn!(
                        attempt = ctx.attempt,
                        max_attempts = ctx.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        err = %e,
                        "action failed, retrying"
                    );
                    ctx.last_error = Some(e.to_string());
                    ctx.attempt += 1;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// A single side-effecting step a loader wants retried (one HTTP fetch, one
/// upload attempt, ...). Must be safe to repeat.
#[async_trait]
pub trait RetryableAction: Send + Sync {
    type Params: Clone + Send + Sync;
    type Output: Send;

    async fn attempt(&self, params: Self::Params) -> anyhow::Result<Self::Output>;
}

/// Drive a [`RetryableAction`] through `policy`.
pub async fn retry_action<A>(
    policy: &RetryPolicy,
    action: &A,
    params: A::Params,
) -> anyhow::Result<A::Output>
where
    A: RetryableAction,
{
    policy.retry(params, |p| action.attempt(p)).await
}
