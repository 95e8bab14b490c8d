//! A mock instrument driver serving synthetic waveforms.
//!
//! Clones share state, so a test can hand one clone to the engine and inspect the
//! command log through another.
use super::{ChannelId, InstrumentDriver, Waveform};
use crate::error::{AppResult, AutomationError};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::f64::consts::PI;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::trace;

#[derive(Default)]
struct MockState {
    connected: bool,
    commands: Vec<String>,
    waveforms: HashMap<ChannelId, Waveform>,
    queued_waveforms: HashMap<ChannelId, VecDeque<Waveform>>,
    responses: HashMap<String, String>,
    queued_responses: HashMap<String, VecDeque<String>>,
    pending_failures: u32,
    latency: Duration,
}

/// Mock driver with a command log, fixed or queued waveforms and fault injection.
#[derive(Clone)]
pub struct MockDriver {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    /// A connected mock with no waveforms.
    pub fn new() -> Self {
        let state = MockState {
            connected: true,
            ..MockState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Builder form of [`MockDriver::set_waveform`].
    pub fn with_waveform(self, waveform: Waveform) -> Self {
        self.set_waveform(waveform);
        self
    }

    /// Serve `waveform` for every read of its channel.
    pub fn set_waveform(&self, waveform: Waveform) {
        self.state().waveforms.insert(waveform.channel, waveform);
    }

    /// Serve `waveform` once, before falling back to the fixed waveform.
    pub fn push_waveform(&self, waveform: Waveform) {
        self.state()
            .queued_waveforms
            .entry(waveform.channel)
            .or_default()
            .push_back(waveform);
    }

    /// Fixed response for a query command. Unmatched queries answer `1`.
    pub fn set_response(&self, command: impl Into<String>, response: impl Into<String>) {
        self.state().responses.insert(command.into(), response.into());
    }

    /// One-shot response for a query command, served before the fixed response.
    pub fn push_response(&self, command: impl Into<String>, response: impl Into<String>) {
        self.state()
            .queued_responses
            .entry(command.into())
            .or_default()
            .push_back(response.into());
    }

    /// Fail the next `count` calls with `DriverUnavailable`.
    pub fn fail_next(&self, count: u32) {
        self.state().pending_failures = count;
    }

    pub fn pending_failures(&self) -> u32 {
        self.state().pending_failures
    }

    /// Delay applied to every call.
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    /// Simulate a dropped connection.
    pub fn drop_connection(&self) {
        self.state().connected = false;
    }

    /// Commands written or queried so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    pub fn clear_commands(&self) {
        self.state().commands.clear();
    }

    /// Common prelude: latency, connectivity and injected failures.
    async fn begin(&self, operation: &str) -> AppResult<()> {
        let latency = self.state().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.state();
        if !state.connected {
            return Err(AutomationError::DriverUnavailable(format!(
                "not connected ({})",
                operation
            )));
        }
        if state.pending_failures > 0 {
            state.pending_failures -= 1;
            return Err(AutomationError::DriverUnavailable(format!(
                "injected failure ({})",
                operation
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl InstrumentDriver for MockDriver {
    async fn connect(&mut self) -> AppResult<()> {
        self.state().connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> AppResult<()> {
        self.state().connected = false;
        Ok(())
    }

    async fn write(&mut self, command: &str) -> AppResult<()> {
        self.begin(command).await?;
        trace!(command, "mock write");
        self.state().commands.push(command.to_string());
        Ok(())
    }

    async fn query(&mut self, command: &str) -> AppResult<String> {
        self.begin(command).await?;
        let mut state = self.state();
        state.commands.push(command.to_string());
        let queued = state
            .queued_responses
            .get_mut(command)
            .and_then(|queue| queue.pop_front());
        let response = queued
            .or_else(|| state.responses.get(command).cloned())
            .unwrap_or_else(|| "1".to_string());
        trace!(command, response = %response, "mock query");
        Ok(response)
    }

    async fn read_waveform(&mut self, channel: ChannelId) -> AppResult<Waveform> {
        self.begin("read_waveform").await?;
        let mut state = self.state();
        if let Some(waveform) = state
            .queued_waveforms
            .get_mut(&channel)
            .and_then(|queue| queue.pop_front())
        {
            return Ok(waveform);
        }
        state
            .waveforms
            .get(&channel)
            .cloned()
            .ok_or_else(|| AutomationError::Instrument(format!("No waveform available for {}", channel)))
    }

    fn is_connected(&self) -> bool {
        self.state().connected
    }
}

/// A sine record of `len` samples starting at t = 0.
pub fn sine_waveform(
    channel: ChannelId,
    frequency: f64,
    amplitude: f64,
    sample_interval: f64,
    len: usize,
) -> Waveform {
    let samples = (0..len)
        .map(|i| amplitude * (2.0 * PI * frequency * i as f64 * sample_interval).sin())
        .collect();
    Waveform::new(channel, 0.0, sample_interval, samples)
}

/// A square record alternating between `low` and `high` every `half_period` samples.
pub fn square_waveform(
    channel: ChannelId,
    low: f64,
    high: f64,
    half_period: usize,
    sample_interval: f64,
    len: usize,
) -> Waveform {
    let half_period = half_period.max(1);
    let samples = (0..len)
        .map(|i| if (i / half_period) % 2 == 0 { low } else { high })
        .collect();
    Waveform::new(channel, 0.0, sample_interval, samples)
}
