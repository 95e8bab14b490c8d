//! Automatic recovery from transient driver failures.
//!
//! Only [`AutomationError::DriverUnavailable`] is considered transient. Every other
//! error surfaces to the caller on the first occurrence.

use crate::error::{AppResult, AutomationError};
use crate::instrument::InstrumentDriver;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::warn;

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// The maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// The delay before the first retry.
    #[serde(with = "humantime_serde")]
    pub backoff_delay: Duration,
    /// Factor applied to the delay after every failed retry.
    pub backoff_multiplier: f64,
    /// Upper bound for a single backoff delay.
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as i32;
        let scaled = self.backoff_delay.as_secs_f64() * self.backoff_multiplier.max(1.0).powi(exponent);
        Duration::from_secs_f64(scaled.min(self.max_backoff.as_secs_f64()))
    }

    /// Same policy with `extra` additional attempts, used for per-step retry counts.
    pub fn with_additional_attempts(&self, extra: u32) -> Self {
        Self {
            max_attempts: self.max_attempts.saturating_add(extra),
            ..self.clone()
        }
    }
}

/// Sleeps for `duration` in slices of at most `poll_interval`.
///
/// Returns [`AutomationError::Cancelled`] at the first slice boundary after
/// `cancelled` is raised.
pub async fn cancellable_sleep(duration: Duration, poll_interval: Duration, cancelled: &AtomicBool) -> AppResult<()> {
    let deadline = Instant::now() + duration;
    loop {
        if cancelled.load(Ordering::SeqCst) {
            return Err(AutomationError::Cancelled);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        sleep((deadline - now).min(poll_interval)).await;
    }
}

/// Runs a driver operation, retrying transient failures according to `policy`.
///
/// The backoff between attempts is sliced by `poll_interval`, so a cancelled run
/// leaves the retry loop within one interval and never issues another command.
pub async fn retry_driver_call<T, F>(
    policy: &RetryPolicy,
    cancelled: &AtomicBool,
    poll_interval: Duration,
    driver: &mut dyn InstrumentDriver,
    mut op: F,
) -> AppResult<T>
where
    F: for<'d> FnMut(&'d mut dyn InstrumentDriver) -> BoxFuture<'d, AppResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        if cancelled.load(Ordering::SeqCst) {
            return Err(AutomationError::Cancelled);
        }
        match op(&mut *driver).await {
            Err(err) if err.is_transient() && attempt < max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(attempt, max_attempts, ?delay, error = %err, "Driver call failed, retrying");
                cancellable_sleep(delay, poll_interval, cancelled).await?;
                attempt += 1;
            }
            result => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::mock::MockDriver;
    use std::sync::Arc;
    use tracing_test::traced_test;

    const POLL: Duration = Duration::from_millis(5);

    #[test]
    fn test_backoff_grows_and_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_millis(30),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(10));
        assert_eq!(policy.delay_for(2), Duration::from_millis(20));
        assert_eq!(policy.delay_for(3), Duration::from_millis(30));
        assert_eq!(policy.delay_for(4), Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_retry_logic_succeeds() {
        let mut driver = MockDriver::new();
        driver.fail_next(2);
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(1),
            ..RetryPolicy::default()
        };
        let cancelled = AtomicBool::new(false);
        let result = retry_driver_call(&policy, &cancelled, POLL, &mut driver, |d| d.query("*IDN?")).await;
        assert!(result.is_ok());
        assert_eq!(driver.commands(), vec!["*IDN?".to_string()]);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_retries_are_logged() {
        let mut driver = MockDriver::new();
        driver.fail_next(1);
        let policy = RetryPolicy {
            backoff_delay: Duration::from_millis(1),
            ..RetryPolicy::default()
        };
        let cancelled = AtomicBool::new(false);
        let result = retry_driver_call(&policy, &cancelled, POLL, &mut driver, |d| d.write("RUN")).await;
        tokio_test::assert_ok!(result);
        assert!(logs_contain("Driver call failed, retrying"));
    }

    #[tokio::test]
    async fn test_retry_logic_fails() {
        let mut driver = MockDriver::new();
        driver.fail_next(4);
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(1),
            ..RetryPolicy::default()
        };
        let cancelled = AtomicBool::new(false);
        let result = retry_driver_call(&policy, &cancelled, POLL, &mut driver, |d| d.query("*IDN?")).await;
        assert!(matches!(result, Err(AutomationError::DriverUnavailable(_))));
        assert_eq!(driver.pending_failures(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_attempt() {
        let mut driver = MockDriver::new();
        let cancelled = AtomicBool::new(true);
        let result =
            retry_driver_call(&RetryPolicy::default(), &cancelled, POLL, &mut driver, |d| d.write("RUN")).await;
        assert!(matches!(result, Err(AutomationError::Cancelled)));
        assert!(driver.commands().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let mut driver = MockDriver::new();
        driver.fail_next(5);
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff_delay: Duration::from_secs(2),
            ..RetryPolicy::default()
        };
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            flag.store(true, Ordering::SeqCst);
        });

        let started = Instant::now();
        let result = retry_driver_call(&policy, &cancelled, POLL, &mut driver, |d| d.query("*IDN?")).await;
        assert!(matches!(result, Err(AutomationError::Cancelled)));
        assert!(started.elapsed() < Duration::from_millis(500), "{:?}", started.elapsed());
        assert_eq!(driver.pending_failures(), 4);
    }

    #[tokio::test]
    async fn test_cancellable_sleep_runs_to_completion() {
        let cancelled = AtomicBool::new(false);
        let started = Instant::now();
        tokio_test::assert_ok!(cancellable_sleep(Duration::from_millis(12), POLL, &cancelled).await);
        assert!(started.elapsed() >= Duration::from_millis(12));
    }
}
