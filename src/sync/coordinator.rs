//! Channel group registry and acquisition sequencing.
//!
//! Group bookkeeping lives behind a short-lived `std::sync::RwLock`, so `quality`
//! and the other status accessors never wait on the instrument. Hardware
//! operations take the driver explicitly; callers hold the driver lease for their
//! duration.

use super::quality::{assess, ChannelQuality, QualityReport};
use super::{ChannelGroup, GroupId, SyncMode, TimingConfig};
use crate::config::{render_command, CommandTemplates, InstrumentLimits, SyncConfig};
use crate::error::{AppResult, AutomationError};
use crate::error_recovery::{retry_driver_call, RetryPolicy};
use crate::instrument::{ChannelId, InstrumentDriver, Waveform};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Lifecycle of a registered group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupState {
    Idle,
    Armed,
    Captured,
    Stopped,
}

struct GroupEntry {
    group: ChannelGroup,
    state: GroupState,
    report: Option<QualityReport>,
}

/// Coordinates arming, acquisition and quality scoring of channel groups.
pub struct SyncCoordinator {
    limits: InstrumentLimits,
    config: SyncConfig,
    commands: CommandTemplates,
    retry: RetryPolicy,
    poll_interval: Duration,
    groups: RwLock<HashMap<GroupId, GroupEntry>>,
}

impl SyncCoordinator {
    pub fn new(
        limits: InstrumentLimits,
        config: SyncConfig,
        commands: CommandTemplates,
        retry: RetryPolicy,
        poll_interval: Duration,
    ) -> Self {
        Self {
            limits,
            config,
            commands,
            retry,
            poll_interval,
            groups: RwLock::new(HashMap::new()),
        }
    }

    /// Coordinator built from the relevant sections of an [`AutomationConfig`](crate::config::AutomationConfig).
    pub fn from_config(config: &crate::config::AutomationConfig) -> Self {
        Self::new(
            config.limits.clone(),
            config.sync.clone(),
            config.commands.clone(),
            config.retry.clone(),
            config.engine.poll_interval,
        )
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<GroupId, GroupEntry>> {
        self.groups.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<GroupId, GroupEntry>> {
        self.groups.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Validates and registers a new group.
    ///
    /// # Errors
    ///
    /// [`AutomationError::InvalidGroupConfiguration`] if the reference is not a member,
    /// the channel list is empty or has duplicates, a channel does not exist on the
    /// instrument, the timing violates instrument limits, or a channel already
    /// belongs to another group.
    pub fn create_group(
        &self,
        channels: Vec<ChannelId>,
        reference: ChannelId,
        mode: SyncMode,
        timing: TimingConfig,
    ) -> AppResult<GroupId> {
        let group = ChannelGroup::new(channels, reference, mode, timing)?;
        self.register(group)
    }

    /// Registers a previously built or persisted group, keeping its id.
    pub fn register(&self, group: ChannelGroup) -> AppResult<GroupId> {
        group.check_structure()?;
        if let Some(bad) = group
            .channels
            .iter()
            .find(|c| c.0 == 0 || c.0 > self.limits.channel_count)
        {
            return Err(AutomationError::InvalidGroupConfiguration(format!(
                "{} does not exist (instrument has {} channels)",
                bad, self.limits.channel_count
            )));
        }
        group.timing.validate(&self.limits)?;

        let mut groups = self.write();
        if groups.contains_key(&group.id) {
            return Err(AutomationError::InvalidGroupConfiguration(format!(
                "group {} is already registered",
                group.id
            )));
        }
        if let Some(other) = groups.values().find(|entry| entry.group.overlaps(&group)) {
            return Err(AutomationError::InvalidGroupConfiguration(format!(
                "channels overlap with group {}",
                other.group.id
            )));
        }
        let id = group.id;
        info!(
            "Created channel group {} ({:?}, reference {}, {} channels)",
            id,
            group.mode,
            group.reference,
            group.channels.len()
        );
        groups.insert(
            id,
            GroupEntry {
                group,
                state: GroupState::Idle,
                report: None,
            },
        );
        Ok(id)
    }

    /// Removes an unarmed group.
    pub fn remove_group(&self, id: GroupId) -> AppResult<ChannelGroup> {
        let mut groups = self.write();
        match groups.get(&id).map(|entry| entry.state) {
            None => Err(AutomationError::UnknownGroup(id.to_string())),
            Some(GroupState::Armed) => Err(AutomationError::InvalidState(format!(
                "group {} is armed; stop it first",
                id
            ))),
            Some(_) => groups
                .remove(&id)
                .map(|entry| entry.group)
                .ok_or_else(|| AutomationError::UnknownGroup(id.to_string())),
        }
    }

    pub fn group(&self, id: GroupId) -> AppResult<ChannelGroup> {
        self.read()
            .get(&id)
            .map(|entry| entry.group.clone())
            .ok_or_else(|| AutomationError::UnknownGroup(id.to_string()))
    }

    pub fn groups(&self) -> Vec<ChannelGroup> {
        self.read().values().map(|entry| entry.group.clone()).collect()
    }

    pub fn state(&self, id: GroupId) -> AppResult<GroupState> {
        self.read()
            .get(&id)
            .map(|entry| entry.state)
            .ok_or_else(|| AutomationError::UnknownGroup(id.to_string()))
    }

    /// The group whose members are exactly `channels`.
    pub fn group_for_channels(&self, channels: &[ChannelId]) -> Option<GroupId> {
        self.read()
            .values()
            .find(|entry| entry.group.has_members(channels))
            .map(|entry| entry.group.id)
    }

    /// Replaces the timing of an unarmed group.
    pub fn update_timing(&self, id: GroupId, timing: TimingConfig) -> AppResult<()> {
        timing.validate(&self.limits)?;
        let mut groups = self.write();
        let entry = groups
            .get_mut(&id)
            .ok_or_else(|| AutomationError::UnknownGroup(id.to_string()))?;
        if entry.state == GroupState::Armed {
            return Err(AutomationError::InvalidState(format!(
                "cannot change timing of armed group {}",
                id
            )));
        }
        entry.group.timing = timing;
        Ok(())
    }

    fn set_state(&self, id: GroupId, state: GroupState) {
        if let Some(entry) = self.write().get_mut(&id) {
            entry.state = state;
        }
    }

    async fn send(
        &self,
        driver: &mut dyn InstrumentDriver,
        cancel: &AtomicBool,
        command: String,
    ) -> AppResult<()> {
        debug!(command = %command, "sync command");
        retry_driver_call(&self.retry, cancel, self.poll_interval, driver, move |d| {
            let command = command.clone();
            Box::pin(async move { d.write(&command).await })
        })
        .await
    }

    async fn ask(
        &self,
        driver: &mut dyn InstrumentDriver,
        cancel: &AtomicBool,
        command: String,
    ) -> AppResult<String> {
        retry_driver_call(&self.retry, cancel, self.poll_interval, driver, move |d| {
            let command = command.clone();
            Box::pin(async move { d.query(&command).await })
        })
        .await
    }

    fn channel_vars(channel: ChannelId) -> HashMap<String, String> {
        HashMap::from([("channel".to_string(), channel.number().to_string())])
    }

    fn timing_command(&self, channel: ChannelId, timing: &TimingConfig) -> AppResult<String> {
        let mut vars = Self::channel_vars(channel);
        vars.insert("sample_rate".to_string(), timing.sample_rate.to_string());
        vars.insert("record_length".to_string(), timing.record_length.to_string());
        vars.insert("timebase".to_string(), timing.timebase.to_string());
        vars.insert("delay".to_string(), timing.trigger_delay.to_string());
        vars.insert("pretrigger".to_string(), timing.pretrigger.to_string());
        vars.insert(
            "acquisition".to_string(),
            timing.acquisition_mode.mnemonic().to_string(),
        );
        render_command(&self.commands.configure_timing, &vars)
    }

    fn channel_command(&self, template: &str, channel: ChannelId) -> AppResult<String> {
        render_command(template, &Self::channel_vars(channel))
    }

    /// Configures and arms every channel of the group.
    ///
    /// Timing is applied to the reference only. Followers are slaved to the reference
    /// and armed first; the reference is armed last, so no follower can miss the
    /// reference's trigger. Independent groups configure and arm each channel in
    /// list order.
    pub async fn start(
        &self,
        id: GroupId,
        driver: &mut dyn InstrumentDriver,
        cancel: &AtomicBool,
    ) -> AppResult<()> {
        let group = self.group(id)?;
        if self.state(id)? == GroupState::Armed {
            return Err(AutomationError::InvalidState(format!("group {} is already armed", id)));
        }
        info!("Starting channel group {} in {:?} mode", id, group.mode);

        let mode_vars = HashMap::from([("mode".to_string(), group.mode.mnemonic().to_string())]);
        self.send(driver, cancel, render_command(&self.commands.sync_mode, &mode_vars)?)
            .await?;

        if group.mode == SyncMode::Independent {
            for channel in group.arm_order() {
                self.send(driver, cancel, self.timing_command(channel, &group.timing)?)
                    .await?;
                self.send(driver, cancel, self.channel_command(&self.commands.arm_channel, channel)?)
                    .await?;
            }
        } else {
            self.send(driver, cancel, self.timing_command(group.reference, &group.timing)?)
                .await?;
            for follower in group.followers() {
                let mut vars = Self::channel_vars(follower);
                vars.insert("reference".to_string(), group.reference.number().to_string());
                self.send(driver, cancel, render_command(&self.commands.follow_reference, &vars)?)
                    .await?;
                self.send(driver, cancel, self.channel_command(&self.commands.arm_channel, follower)?)
                    .await?;
            }
            self.send(
                driver,
                cancel,
                self.channel_command(&self.commands.arm_channel, group.reference)?,
            )
            .await?;
        }

        if let Some(entry) = self.write().get_mut(&id) {
            entry.state = GroupState::Armed;
            entry.report = None;
        }
        Ok(())
    }

    /// Stops acquisition on all channels, reference first.
    pub async fn stop(
        &self,
        id: GroupId,
        driver: &mut dyn InstrumentDriver,
        cancel: &AtomicBool,
    ) -> AppResult<()> {
        let group = self.group(id)?;
        let mut order = group.arm_order();
        order.reverse();
        for channel in order {
            self.send(driver, cancel, self.channel_command(&self.commands.stop_channel, channel)?)
                .await?;
        }
        self.set_state(id, GroupState::Stopped);
        info!("Stopped channel group {}", id);
        Ok(())
    }

    /// Waits for an armed group to finish acquiring, reads all records and commits a
    /// quality report.
    ///
    /// On any failure the group drops back to [`GroupState::Idle`], so the next
    /// acquisition re-arms it from scratch.
    ///
    /// # Errors
    ///
    /// - [`AutomationError::StepTimeout`] if completion is not reported within the
    ///   configured completion timeout
    /// - [`AutomationError::Cancelled`] if `cancel` is raised while waiting
    pub async fn acquire(
        &self,
        id: GroupId,
        driver: &mut dyn InstrumentDriver,
        cancel: &AtomicBool,
    ) -> AppResult<Vec<Waveform>> {
        let group = self.group(id)?;
        if self.state(id)? != GroupState::Armed {
            return Err(AutomationError::InvalidState(format!("group {} is not armed", id)));
        }

        let waveforms = match self.collect(&group, driver, cancel).await {
            Ok(waveforms) => waveforms,
            Err(err) => {
                self.set_state(id, GroupState::Idle);
                return Err(err);
            }
        };
        self.record_waveforms(id, &waveforms)?;
        Ok(waveforms)
    }

    async fn collect(
        &self,
        group: &ChannelGroup,
        driver: &mut dyn InstrumentDriver,
        cancel: &AtomicBool,
    ) -> AppResult<Vec<Waveform>> {
        let timeout = self.config.completion_timeout;
        let deadline = Instant::now() + timeout;
        for channel in group.arm_order() {
            let query = self.channel_command(&self.commands.acquisition_complete, channel)?;
            loop {
                if cancel.load(Ordering::SeqCst) {
                    return Err(AutomationError::Cancelled);
                }
                if self.ask(driver, cancel, query.clone()).await?.trim() == "1" {
                    break;
                }
                if Instant::now() >= deadline {
                    warn!("Channel group {} did not complete within {:?}", group.id, timeout);
                    return Err(AutomationError::StepTimeout(timeout));
                }
                sleep(self.poll_interval).await;
            }
        }

        let mut waveforms = Vec::with_capacity(group.channels.len());
        for channel in group.channels.iter().copied() {
            let waveform = retry_driver_call(&self.retry, cancel, self.poll_interval, driver, move |d| {
                d.read_waveform(channel)
            })
            .await?;
            waveforms.push(waveform);
        }
        Ok(waveforms)
    }

    /// Scores `waveforms` as the latest acquisition of the group and commits the report.
    pub fn record_waveforms(&self, id: GroupId, waveforms: &[Waveform]) -> AppResult<QualityReport> {
        let group = self.group(id)?;
        let report = assess(&group, waveforms, self.config.max_offset)?;
        debug!(group = %id, score = report.score, "sync quality computed");
        let mut groups = self.write();
        let entry = groups
            .get_mut(&id)
            .ok_or_else(|| AutomationError::UnknownGroup(id.to_string()))?;
        entry.state = GroupState::Captured;
        entry.report = Some(report.clone());
        Ok(report)
    }

    /// Alignment score of the latest acquisition, in [0, 1]. Never blocks.
    ///
    /// Independent groups always report 1.0.
    pub fn quality(&self, id: GroupId) -> AppResult<f64> {
        let groups = self.read();
        let entry = groups
            .get(&id)
            .ok_or_else(|| AutomationError::UnknownGroup(id.to_string()))?;
        if entry.group.mode == SyncMode::Independent {
            return Ok(1.0);
        }
        entry.report.as_ref().map(|r| r.score).ok_or_else(|| {
            AutomationError::InvalidState(format!("group {} has no acquisition to score", id))
        })
    }

    /// Per-follower breakdown of the latest report.
    pub fn channel_quality(&self, id: GroupId) -> AppResult<Vec<ChannelQuality>> {
        Ok(self.report(id)?.map(|r| r.channels).unwrap_or_default())
    }

    pub fn report(&self, id: GroupId) -> AppResult<Option<QualityReport>> {
        self.read()
            .get(&id)
            .map(|entry| entry.report.clone())
            .ok_or_else(|| AutomationError::UnknownGroup(id.to_string()))
    }
}
