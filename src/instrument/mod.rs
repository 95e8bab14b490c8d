//! Instrument driver boundary.
//!
//! The automation core never encodes instrument commands itself beyond the
//! configurable [`CommandTemplates`](crate::config::CommandTemplates); it talks to the
//! instrument exclusively through the [`InstrumentDriver`] trait. A driver handles one
//! request at a time, which [`SharedDriver`] enforces across runs.

pub mod lease;
pub mod mock;

pub use lease::{DriverGuard, SharedDriver};

use crate::error::{AppResult, AutomationError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of an analog or digital input channel, numbered from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub u8);

impl ChannelId {
    /// Channel number as used in command templates.
    pub fn number(self) -> u8 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch{}", self.0)
    }
}

impl FromStr for ChannelId {
    type Err = AutomationError;

    /// Accepts `3`, `ch3` and `CH3`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix("ch")
            .or_else(|| trimmed.strip_prefix("CH"))
            .or_else(|| trimmed.strip_prefix("Ch"))
            .unwrap_or(trimmed);
        match digits.parse::<u8>() {
            Ok(n) if n > 0 => Ok(ChannelId(n)),
            _ => Err(AutomationError::Configuration(format!(
                "Invalid channel identifier '{}'",
                s
            ))),
        }
    }
}

/// A block of samples read from one channel.
///
/// `start_time` is the software-observed timestamp (seconds) of the first sample;
/// sample `i` was taken at `start_time + i * sample_interval`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waveform {
    pub channel: ChannelId,
    pub start_time: f64,
    pub sample_interval: f64,
    pub samples: Vec<f64>,
}

impl Waveform {
    pub fn new(channel: ChannelId, start_time: f64, sample_interval: f64, samples: Vec<f64>) -> Self {
        Self {
            channel,
            start_time,
            sample_interval,
            samples,
        }
    }

    /// Timestamp of sample `index`.
    pub fn timestamp(&self, index: usize) -> f64 {
        self.start_time + index as f64 * self.sample_interval
    }

    /// Timestamp of the last sample, or `start_time` for an empty record.
    pub fn end_time(&self) -> f64 {
        self.timestamp(self.samples.len().saturating_sub(1))
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn sample_rate(&self) -> f64 {
        if self.sample_interval > 0.0 {
            1.0 / self.sample_interval
        } else {
            0.0
        }
    }
}

/// Asynchronous driver for a remote measurement instrument.
///
/// All methods are fallible with [`AutomationError::DriverUnavailable`] when
/// connectivity is lost. Implementations may assume exclusive access; callers obtain
/// it through [`SharedDriver::acquire`].
#[async_trait]
pub trait InstrumentDriver: Send + Sync {
    /// Open the connection to the instrument.
    async fn connect(&mut self) -> AppResult<()>;

    /// Close the connection.
    async fn disconnect(&mut self) -> AppResult<()>;

    /// Send a command that produces no response.
    async fn write(&mut self, command: &str) -> AppResult<()>;

    /// Send a command and read its response.
    async fn query(&mut self, command: &str) -> AppResult<String>;

    /// Read the most recent record of a channel.
    async fn read_waveform(&mut self, channel: ChannelId) -> AppResult<Waveform>;

    /// Whether the connection is currently open.
    fn is_connected(&self) -> bool;
}
