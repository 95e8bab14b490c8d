//! Multi-channel acquisition synchronization.
//!
//! A [`ChannelGroup`] names a set of channels, one of which is the timing reference.
//! The [`SyncCoordinator`] arms groups (followers strictly before the reference),
//! collects their records and scores how well the followers line up with the
//! reference.

pub mod coordinator;
pub mod quality;

pub use coordinator::{GroupState, SyncCoordinator};
pub use quality::{offset_score, ChannelQuality, QualityReport};

use crate::config::InstrumentLimits;
use crate::error::{AppResult, AutomationError};
use crate::instrument::ChannelId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Identifier of a channel group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub Uuid);

impl GroupId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for GroupId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// How the channels of a group are tied together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// No coordination; channels are armed in list order and quality is always 1.0.
    Independent,
    /// Followers trigger from the reference's trigger.
    TriggerSync,
    /// Followers share the reference's sample clock.
    SampleSync,
    /// Followers are aligned on a common timestamp base.
    TimeSync,
    /// Followers are phase-locked to the reference.
    PhaseSync,
}

impl SyncMode {
    /// Mnemonic substituted for `{mode}` in the sync mode command.
    pub fn mnemonic(self) -> &'static str {
        match self {
            SyncMode::Independent => "INDEP",
            SyncMode::TriggerSync => "TRIG",
            SyncMode::SampleSync => "SAMP",
            SyncMode::TimeSync => "TIME",
            SyncMode::PhaseSync => "PHAS",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionMode {
    #[default]
    Normal,
    Average,
    PeakDetect,
    HighResolution,
}

impl AcquisitionMode {
    pub fn mnemonic(self) -> &'static str {
        match self {
            AcquisitionMode::Normal => "NORM",
            AcquisitionMode::Average => "AVER",
            AcquisitionMode::PeakDetect => "PEAK",
            AcquisitionMode::HighResolution => "HRES",
        }
    }
}

fn default_pretrigger() -> f64 {
    0.5
}

/// Acquisition timing shared by all channels of a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Samples per second
    pub sample_rate: f64,
    /// Samples per record
    pub record_length: usize,
    /// Seconds per division
    pub timebase: f64,
    /// Trigger delay in seconds
    #[serde(default)]
    pub trigger_delay: f64,
    /// Fraction of the record placed before the trigger point
    #[serde(default = "default_pretrigger")]
    pub pretrigger: f64,
    #[serde(default)]
    pub acquisition_mode: AcquisitionMode,
}

impl TimingConfig {
    pub fn new(sample_rate: f64, record_length: usize, timebase: f64) -> Self {
        Self {
            sample_rate,
            record_length,
            timebase,
            trigger_delay: 0.0,
            pretrigger: default_pretrigger(),
            acquisition_mode: AcquisitionMode::Normal,
        }
    }

    /// Checks the timing against instrument limits.
    pub fn validate(&self, limits: &InstrumentLimits) -> AppResult<()> {
        let invalid = |message: String| Err(AutomationError::InvalidGroupConfiguration(message));
        if !(self.sample_rate > 0.0) || self.sample_rate > limits.max_sample_rate {
            return invalid(format!(
                "sample rate {} S/s is outside (0, {}]",
                self.sample_rate, limits.max_sample_rate
            ));
        }
        if self.record_length < 2 || self.record_length > limits.max_record_length {
            return invalid(format!(
                "record length {} is outside [2, {}]",
                self.record_length, limits.max_record_length
            ));
        }
        if !(self.timebase >= limits.min_timebase && self.timebase <= limits.max_timebase) {
            return invalid(format!(
                "timebase {} s/div is outside [{}, {}]",
                self.timebase, limits.min_timebase, limits.max_timebase
            ));
        }
        if !(0.0..=1.0).contains(&self.pretrigger) {
            return invalid(format!("pretrigger fraction {} is outside [0, 1]", self.pretrigger));
        }
        if !self.trigger_delay.is_finite() {
            return invalid("trigger delay must be finite".to_string());
        }
        Ok(())
    }

    /// Seconds covered by one record.
    pub fn record_duration(&self) -> f64 {
        self.record_length as f64 / self.sample_rate
    }
}

/// Role of a channel within a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelRole {
    Reference,
    Follower,
}

/// A set of channels acquired together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelGroup {
    pub id: GroupId,
    pub channels: Vec<ChannelId>,
    pub reference: ChannelId,
    pub mode: SyncMode,
    pub timing: TimingConfig,
}

impl ChannelGroup {
    /// Builds a group after structural checks: non-empty, no duplicates, reference
    /// among the members.
    pub fn new(
        channels: Vec<ChannelId>,
        reference: ChannelId,
        mode: SyncMode,
        timing: TimingConfig,
    ) -> AppResult<Self> {
        let group = Self {
            id: GroupId::new(),
            channels,
            reference,
            mode,
            timing,
        };
        group.check_structure()?;
        Ok(group)
    }

    pub(crate) fn check_structure(&self) -> AppResult<()> {
        if self.channels.is_empty() {
            return Err(AutomationError::InvalidGroupConfiguration(
                "a group needs at least one channel".to_string(),
            ));
        }
        let unique: BTreeSet<ChannelId> = self.channels.iter().copied().collect();
        if unique.len() != self.channels.len() {
            return Err(AutomationError::InvalidGroupConfiguration(
                "channel list contains duplicates".to_string(),
            ));
        }
        if !unique.contains(&self.reference) {
            return Err(AutomationError::InvalidGroupConfiguration(format!(
                "reference {} is not a member of the group",
                self.reference
            )));
        }
        Ok(())
    }

    /// Members other than the reference, in list order.
    pub fn followers(&self) -> impl Iterator<Item = ChannelId> + '_ {
        self.channels.iter().copied().filter(move |c| *c != self.reference)
    }

    pub fn role(&self, channel: ChannelId) -> Option<ChannelRole> {
        if channel == self.reference {
            Some(ChannelRole::Reference)
        } else if self.channels.contains(&channel) {
            Some(ChannelRole::Follower)
        } else {
            None
        }
    }

    /// Order in which channels are armed: followers first, the reference last.
    /// Independent groups arm in list order.
    pub fn arm_order(&self) -> Vec<ChannelId> {
        if self.mode == SyncMode::Independent {
            return self.channels.clone();
        }
        let mut order: Vec<ChannelId> = self.followers().collect();
        order.push(self.reference);
        order
    }

    pub fn overlaps(&self, other: &ChannelGroup) -> bool {
        self.channels.iter().any(|c| other.channels.contains(c))
    }

    /// Whether the group's members are exactly `channels`, in any order.
    pub fn has_members(&self, channels: &[ChannelId]) -> bool {
        let mine: BTreeSet<_> = self.channels.iter().collect();
        let theirs: BTreeSet<_> = channels.iter().collect();
        mine == theirs
    }
}
