//! Per-run state.
use super::run::{ExecutionResult, RunError, RunHandle, RunSource, RunStatus, StepOutcome};
use crate::error::{AppResult, AutomationError};
use crate::instrument::DriverGuard;
use crate::sequence::ParameterValue;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;

/// Cancellation and pause flags shared between the API and the worker.
#[derive(Debug)]
pub struct RunControl {
    cancelled: AtomicBool,
    paused: watch::Sender<bool>,
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

impl RunControl {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            cancelled: AtomicBool::new(false),
            paused,
        }
    }

    /// Requests cancellation and wakes a paused run so it can observe it.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.paused.send_modify(|_| {});
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// The raw flag, for retry loops and hardware waits.
    pub fn cancel_flag(&self) -> &AtomicBool {
        &self.cancelled
    }

    /// Returns whether the flag changed.
    pub fn pause(&self) -> bool {
        !self.paused.send_replace(true)
    }

    /// Returns whether the flag changed.
    pub fn resume(&self) -> bool {
        self.paused.send_replace(false)
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Blocks while paused.
    ///
    /// # Errors
    ///
    /// [`AutomationError::Cancelled`] if the run is cancelled before or while paused.
    pub async fn wait_if_paused(&self) -> AppResult<()> {
        let mut paused = self.paused.subscribe();
        loop {
            // mark the current value seen before checking cancellation
            let is_paused = *paused.borrow_and_update();
            if self.is_cancelled() {
                return Err(AutomationError::Cancelled);
            }
            if !is_paused {
                return Ok(());
            }
            if paused.changed().await.is_err() {
                return Ok(());
            }
        }
    }
}

/// State owned by the worker for the duration of one run.
///
/// Holds the exclusive driver lease; dropping the context releases the driver.
pub struct ExecutionContext {
    pub run: RunHandle,
    pub source: RunSource,
    pub current_step: Option<usize>,
    pub outcomes: Vec<StepOutcome>,
    pub measurements: BTreeMap<String, f64>,
    pub variables: BTreeMap<String, ParameterValue>,
    pub log: Vec<String>,
    pub control: std::sync::Arc<RunControl>,
    pub driver: DriverGuard,
    pub started_at: DateTime<Utc>,
}

impl ExecutionContext {
    pub fn new(
        run: RunHandle,
        source: RunSource,
        control: std::sync::Arc<RunControl>,
        driver: DriverGuard,
        variables: BTreeMap<String, ParameterValue>,
    ) -> Self {
        Self {
            run,
            source,
            current_step: None,
            outcomes: Vec::new(),
            measurements: BTreeMap::new(),
            variables,
            log: Vec::new(),
            control,
            driver,
            started_at: Utc::now(),
        }
    }

    /// Converts the context into its final result, releasing the driver.
    pub fn finish(
        self,
        status: RunStatus,
        error: Option<RunError>,
        return_value: Option<String>,
    ) -> ExecutionResult {
        let ExecutionContext {
            run,
            source,
            outcomes,
            measurements,
            log,
            driver,
            started_at,
            ..
        } = self;
        drop(driver);
        ExecutionResult {
            run,
            source,
            status,
            outcomes,
            measurements,
            error,
            return_value,
            log,
            started_at: Some(started_at),
            finished_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_pause_blocks_until_resume() {
        let control = Arc::new(RunControl::new());
        assert!(control.pause());
        assert!(!control.pause());

        let waiter = {
            let control = control.clone();
            tokio::spawn(async move { control.wait_if_paused().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        assert!(control.resume());
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_cancel_wakes_paused_run() {
        let control = Arc::new(RunControl::new());
        control.pause();
        let waiter = {
            let control = control.clone();
            tokio::spawn(async move { control.wait_if_paused().await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        control.cancel();
        let result = tokio::time::timeout(Duration::from_millis(100), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(AutomationError::Cancelled)));
    }
}
