//! Step execution against the leased driver.
//!
//! The same operations back sequence steps and the functions exposed to scripts.
//! Every driver call goes through [`retry_driver_call`], and every wait re-checks the
//! run's cancellation flag at least once per poll interval.

use super::context::ExecutionContext;
use crate::analysis::{measure, MeasurementKind};
use crate::config::{render_command, AutomationConfig};
use crate::error::{AppResult, AutomationError};
use crate::error_recovery::{cancellable_sleep, retry_driver_call, RetryPolicy};
use crate::instrument::{ChannelId, Waveform};
use crate::sequence::{Bindings, ParameterValue, Step, StepSpec, TriggerRef};
use crate::sync::{GroupState, SyncCoordinator, SyncMode};
use crate::trigger::{ChannelSnapshot, TriggerDefinition, TriggerEvaluator, TriggerHit, TriggerMode, TriggerSet};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

/// Measurement key under which a group acquisition records its sync quality.
pub const SYNC_QUALITY_KEY: &str = "sync_quality";

/// Control flow after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepEffect {
    Next,
    Jump(usize),
}

/// Executes steps and script calls for the engine's worker.
pub struct StepExecutor {
    config: Arc<AutomationConfig>,
    coordinator: Arc<SyncCoordinator>,
    triggers: Arc<RwLock<TriggerSet>>,
}

impl StepExecutor {
    pub fn new(
        config: Arc<AutomationConfig>,
        coordinator: Arc<SyncCoordinator>,
        triggers: Arc<RwLock<TriggerSet>>,
    ) -> Self {
        Self {
            config,
            coordinator,
            triggers,
        }
    }

    pub fn config(&self) -> &AutomationConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    /// Global retry policy extended by `extra` attempts.
    pub fn retry_policy(&self, extra: u32) -> RetryPolicy {
        self.config.retry.with_additional_attempts(extra)
    }

    pub async fn execute(&self, ctx: &mut ExecutionContext, spec: &StepSpec) -> AppResult<StepEffect> {
        let policy = self.retry_policy(spec.retry_count);
        match &spec.step {
            Step::Measure { kind, channel, .. } => {
                let value = self.measure(ctx, *kind, *channel, &policy).await?;
                if let Some(key) = spec.step.measurement_key() {
                    ctx.measurements.insert(key, value);
                }
                Ok(StepEffect::Next)
            }
            Step::Delay { duration } => {
                self.delay(ctx, *duration).await?;
                Ok(StepEffect::Next)
            }
            Step::SetParameter { target, value } => {
                self.set_parameter(ctx, target, value, &policy).await?;
                ctx.variables.insert(target.clone(), value.clone());
                Ok(StepEffect::Next)
            }
            Step::WaitForTrigger { trigger, timeout } => {
                let definition = self.resolve_trigger(trigger)?;
                self.wait_for_trigger(ctx, &definition, *timeout, &policy).await?;
                Ok(StepEffect::Next)
            }
            Step::Acquire { channels } => {
                self.acquire(ctx, channels, &policy).await?;
                Ok(StepEffect::Next)
            }
            Step::Branch {
                condition,
                then_index,
                else_index,
            } => {
                let bindings = Bindings {
                    measurements: &ctx.measurements,
                    variables: &ctx.variables,
                };
                let target = if condition.evaluate(&bindings)? {
                    *then_index
                } else {
                    *else_index
                };
                debug!(run = %ctx.run, target, "branch");
                Ok(StepEffect::Jump(target))
            }
        }
    }

    /// Reads a channel and computes `kind` on the record.
    pub async fn measure(
        &self,
        ctx: &mut ExecutionContext,
        kind: MeasurementKind,
        channel: ChannelId,
        policy: &RetryPolicy,
    ) -> AppResult<f64> {
        let waveform = self.read_waveform(ctx, channel, policy).await?;
        let value = measure(kind, &waveform)?;
        debug!(run = %ctx.run, %channel, %kind, value, "measurement");
        Ok(value)
    }

    async fn read_waveform(
        &self,
        ctx: &mut ExecutionContext,
        channel: ChannelId,
        policy: &RetryPolicy,
    ) -> AppResult<Waveform> {
        let control = ctx.control.clone();
        let poll = self.config.engine.poll_interval;
        retry_driver_call(policy, control.cancel_flag(), poll, &mut *ctx.driver, move |d| {
            d.read_waveform(channel)
        })
        .await
    }

    pub async fn set_parameter(
        &self,
        ctx: &mut ExecutionContext,
        target: &str,
        value: &ParameterValue,
        policy: &RetryPolicy,
    ) -> AppResult<()> {
        let vars = HashMap::from([
            ("target".to_string(), target.to_string()),
            ("value".to_string(), value.to_string()),
        ]);
        let command = render_command(&self.config.commands.set_parameter, &vars)?;
        self.write(ctx, &command, policy).await
    }

    pub async fn write(&self, ctx: &mut ExecutionContext, command: &str, policy: &RetryPolicy) -> AppResult<()> {
        let control = ctx.control.clone();
        let command = command.to_string();
        debug!(run = %ctx.run, command = %command, "write");
        let poll = self.config.engine.poll_interval;
        retry_driver_call(policy, control.cancel_flag(), poll, &mut *ctx.driver, move |d| {
            let command = command.clone();
            Box::pin(async move { d.write(&command).await })
        })
        .await
    }

    pub async fn query(&self, ctx: &mut ExecutionContext, command: &str, policy: &RetryPolicy) -> AppResult<String> {
        let control = ctx.control.clone();
        let command = command.to_string();
        let poll = self.config.engine.poll_interval;
        retry_driver_call(policy, control.cancel_flag(), poll, &mut *ctx.driver, move |d| {
            let command = command.clone();
            Box::pin(async move { d.query(&command).await })
        })
        .await
    }

    /// Sleeps for `duration` in poll-interval slices, stopping early on cancellation.
    pub async fn delay(&self, ctx: &ExecutionContext, duration: Duration) -> AppResult<()> {
        cancellable_sleep(duration, self.config.engine.poll_interval, ctx.control.cancel_flag()).await
    }

    /// Looks up a named definition or wraps an inline tree.
    pub fn resolve_trigger(&self, trigger: &TriggerRef) -> AppResult<TriggerDefinition> {
        match trigger {
            TriggerRef::Named(name) => self
                .triggers
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .get(name)
                .cloned()
                .ok_or_else(|| AutomationError::Configuration(format!("Unknown trigger '{}'", name))),
            TriggerRef::Inline(tree) => Ok(TriggerDefinition::new("inline", tree.clone())),
        }
    }

    /// Polls the trigger's channels until the condition holds or `timeout` elapses.
    ///
    /// Returns `None` when an auto-mode trigger fired on its own at the timeout.
    pub async fn wait_for_trigger(
        &self,
        ctx: &mut ExecutionContext,
        definition: &TriggerDefinition,
        timeout: Duration,
        policy: &RetryPolicy,
    ) -> AppResult<Option<TriggerHit>> {
        let poll = self.config.engine.poll_interval;
        let channels: Vec<ChannelId> = definition.tree.channels().into_iter().collect();
        let mut evaluator = TriggerEvaluator::new(definition.tree.clone());
        let deadline = Instant::now() + timeout;
        debug!(run = %ctx.run, trigger = %definition.name, ?timeout, "waiting for trigger");

        loop {
            if ctx.control.is_cancelled() {
                return Err(AutomationError::Cancelled);
            }
            let mut snapshot = ChannelSnapshot::new();
            for channel in &channels {
                snapshot.insert(self.read_waveform(ctx, *channel, policy).await?);
            }
            if let Some(hit) = evaluator.evaluate(&snapshot) {
                info!("Trigger '{}' satisfied at t={:.9}s", definition.name, hit.timestamp);
                return Ok(Some(hit));
            }
            let now = Instant::now();
            if now >= deadline {
                if definition.mode == TriggerMode::Auto {
                    info!("Trigger '{}' auto-fired after {:?}", definition.name, timeout);
                    return Ok(None);
                }
                return Err(AutomationError::StepTimeout(timeout));
            }
            sleep((deadline - now).min(poll)).await;
        }
    }

    /// Acquires `channels`.
    ///
    /// When a registered channel group has exactly these members, the group is armed
    /// (if needed) and acquired through the coordinator, and its sync quality is
    /// stored under [`SYNC_QUALITY_KEY`]. Otherwise each channel is read directly.
    pub async fn acquire(
        &self,
        ctx: &mut ExecutionContext,
        channels: &[ChannelId],
        policy: &RetryPolicy,
    ) -> AppResult<Vec<Waveform>> {
        if let Some(id) = self.coordinator.group_for_channels(channels) {
            let control = ctx.control.clone();
            if self.coordinator.state(id)? != GroupState::Armed {
                self.coordinator
                    .start(id, &mut *ctx.driver, control.cancel_flag())
                    .await?;
            }
            let waveforms = self
                .coordinator
                .acquire(id, &mut *ctx.driver, control.cancel_flag())
                .await?;
            if self.coordinator.group(id)?.mode != SyncMode::Independent {
                let quality = self.coordinator.quality(id)?;
                ctx.measurements.insert(SYNC_QUALITY_KEY.to_string(), quality);
            }
            return Ok(waveforms);
        }

        let mut waveforms = Vec::with_capacity(channels.len());
        for channel in channels {
            waveforms.push(self.read_waveform(ctx, *channel, policy).await?);
        }
        Ok(waveforms)
    }
}
