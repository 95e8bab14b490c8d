//! Sequence engine: a FIFO run queue drained by one background worker.
//!
//! The engine follows the actor layout of a command channel plus a single task that
//! owns all execution. Callers interact through a cloneable [`SequenceEngine`] handle:
//!
//! - `submit`/`submit_prepared` enqueue a run and return its [`RunHandle`] immediately.
//! - `pause`, `resume` and `cancel` flip flags the worker observes between steps and
//!   at every poll tick.
//! - `status` and `result` read committed snapshots under short synchronous locks and
//!   never wait on the worker.
//!
//! The worker leases the [`SharedDriver`] for the whole of each run, so sequences and
//! scripts never interleave commands on the instrument. The lease is released when the
//! run's [`ExecutionContext`] is finished, before the result is published.

pub mod context;
pub mod executor;
pub mod history;
pub mod run;

pub use context::{ExecutionContext, RunControl};
pub use executor::{StepEffect, StepExecutor, SYNC_QUALITY_KEY};
pub use history::ResultHistory;
pub use run::{
    ExecutionResult, ProgressEvent, ProgressKind, RunError, RunHandle, RunSnapshot, RunSource,
    RunStatus, StepOutcome, StepStatus,
};

use crate::config::AutomationConfig;
use crate::error::{AppResult, AutomationError};
use crate::instrument::SharedDriver;
use crate::script::PreparedScript;
use crate::sequence::Sequence;
use crate::sync::SyncCoordinator;
use crate::trigger::{TriggerDefinition, TriggerSet};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

enum Job {
    Sequence(Sequence),
    Script(Box<PreparedScript>),
}

enum WorkerCommand {
    Run { handle: RunHandle, job: Job },
    Shutdown,
}

struct RunEntry {
    snapshot: RunSnapshot,
    control: Arc<RunControl>,
}

struct EngineShared {
    config: Arc<AutomationConfig>,
    driver: SharedDriver,
    executor: StepExecutor,
    triggers: Arc<RwLock<TriggerSet>>,
    runs: RwLock<HashMap<RunHandle, RunEntry>>,
    history: Mutex<ResultHistory>,
    events: broadcast::Sender<ProgressEvent>,
}

/// Handle to the engine. Cloning shares the same queue and worker.
#[derive(Clone)]
pub struct SequenceEngine {
    shared: Arc<EngineShared>,
    commands: mpsc::UnboundedSender<WorkerCommand>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SequenceEngine {
    /// Validates `config` and spawns the worker on the current tokio runtime.
    pub fn new(config: AutomationConfig, driver: SharedDriver) -> AppResult<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let coordinator = Arc::new(SyncCoordinator::from_config(&config));
        let triggers = Arc::new(RwLock::new(TriggerSet::new("default")));
        let (events, _) = broadcast::channel(config.engine.event_capacity);
        let shared = Arc::new(EngineShared {
            executor: StepExecutor::new(config.clone(), coordinator, triggers.clone()),
            history: Mutex::new(ResultHistory::new(config.engine.history_capacity)),
            runs: RwLock::new(HashMap::new()),
            config,
            driver,
            triggers,
            events,
        });

        let (commands, receiver) = mpsc::unbounded_channel();
        let worker = tokio::spawn(worker_loop(shared.clone(), receiver));
        info!("Sequence engine started.");
        Ok(Self {
            shared,
            commands,
            worker: Arc::new(Mutex::new(Some(worker))),
        })
    }

    /// Queues a private copy of `sequence`.
    ///
    /// # Errors
    ///
    /// [`AutomationError::Configuration`] when the sequence fails validation, and
    /// [`AutomationError::InvalidState`] after shutdown.
    pub fn submit(&self, sequence: &Sequence) -> AppResult<RunHandle> {
        sequence.validate()?;
        let source = RunSource::Sequence {
            id: sequence.id,
            name: sequence.name.clone(),
        };
        self.enqueue(source, Some(sequence.len()), Job::Sequence(sequence.clone()))
    }

    /// Queues a script whose parameters have already been validated and whose source
    /// has been compiled.
    pub fn submit_prepared(&self, script: PreparedScript) -> AppResult<RunHandle> {
        let source = RunSource::Script {
            id: script.script.id,
            name: script.script.name.clone(),
        };
        self.enqueue(source, None, Job::Script(Box::new(script)))
    }

    fn enqueue(&self, source: RunSource, total_steps: Option<usize>, job: Job) -> AppResult<RunHandle> {
        let handle = RunHandle::new();
        let name = source.name().to_string();
        self.shared.write_runs().insert(
            handle,
            RunEntry {
                snapshot: RunSnapshot::queued(handle, source, total_steps),
                control: Arc::new(RunControl::new()),
            },
        );
        if self.commands.send(WorkerCommand::Run { handle, job }).is_err() {
            self.shared.write_runs().remove(&handle);
            return Err(AutomationError::InvalidState(
                "Sequence engine has shut down".to_string(),
            ));
        }
        info!("Queued {} for '{}'.", handle, name);
        self.shared
            .emit(ProgressEvent::new(handle, ProgressKind::Queued, RunStatus::Queued).with_message(name));
        Ok(handle)
    }

    /// Suspends dispatch before the next step. The driver stays leased.
    pub fn pause(&self, handle: RunHandle) -> AppResult<()> {
        {
            let mut runs = self.shared.write_runs();
            let entry = runs
                .get_mut(&handle)
                .ok_or_else(|| AutomationError::UnknownRun(handle.to_string()))?;
            if entry.snapshot.status != RunStatus::Running {
                return Err(AutomationError::InvalidState(format!(
                    "Cannot pause {} while {}",
                    handle, entry.snapshot.status
                )));
            }
            entry.control.pause();
            entry.snapshot.status = RunStatus::Paused;
            entry.snapshot.updated_at = Utc::now();
        }
        info!("Paused {}.", handle);
        self.shared
            .emit(ProgressEvent::new(handle, ProgressKind::Paused, RunStatus::Paused));
        Ok(())
    }

    pub fn resume(&self, handle: RunHandle) -> AppResult<()> {
        {
            let mut runs = self.shared.write_runs();
            let entry = runs
                .get_mut(&handle)
                .ok_or_else(|| AutomationError::UnknownRun(handle.to_string()))?;
            if entry.snapshot.status != RunStatus::Paused {
                return Err(AutomationError::InvalidState(format!(
                    "Cannot resume {} while {}",
                    handle, entry.snapshot.status
                )));
            }
            entry.control.resume();
            entry.snapshot.status = RunStatus::Running;
            entry.snapshot.updated_at = Utc::now();
        }
        info!("Resumed {}.", handle);
        self.shared
            .emit(ProgressEvent::new(handle, ProgressKind::Resumed, RunStatus::Running));
        Ok(())
    }

    /// Requests cancellation.
    ///
    /// A queued run is finalized as `Cancelled` immediately and never leases the
    /// driver. A running or paused run stops at its next poll tick or step boundary.
    pub fn cancel(&self, handle: RunHandle) -> AppResult<()> {
        let queued = {
            let mut runs = self.shared.write_runs();
            let entry = runs
                .get_mut(&handle)
                .ok_or_else(|| AutomationError::UnknownRun(handle.to_string()))?;
            if entry.snapshot.status.is_terminal() {
                return Err(AutomationError::InvalidState(format!(
                    "{} already finished as {}",
                    handle, entry.snapshot.status
                )));
            }
            entry.control.cancel();
            if entry.snapshot.status == RunStatus::Queued {
                entry.snapshot.status = RunStatus::Cancelled;
                Some(entry.snapshot.source.clone())
            } else {
                None
            }
        };

        info!("Cancellation requested for {}.", handle);
        if let Some(source) = queued {
            self.shared.commit(ExecutionResult {
                run: handle,
                source,
                status: RunStatus::Cancelled,
                outcomes: Vec::new(),
                measurements: Default::default(),
                error: None,
                return_value: None,
                log: Vec::new(),
                started_at: None,
                finished_at: Utc::now(),
            });
        }
        Ok(())
    }

    /// Most recently committed snapshot of a run.
    pub fn status(&self, handle: RunHandle) -> AppResult<RunSnapshot> {
        self.shared
            .read_runs()
            .get(&handle)
            .map(|entry| entry.snapshot.clone())
            .ok_or_else(|| AutomationError::UnknownRun(handle.to_string()))
    }

    /// Final result, once the run has finished and while it is still in the history.
    pub fn result(&self, handle: RunHandle) -> Option<ExecutionResult> {
        self.shared.lock_history().get(handle).cloned()
    }

    /// Retained results, oldest first.
    pub fn history(&self) -> Vec<ExecutionResult> {
        self.shared.lock_history().iter().cloned().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.shared.events.subscribe()
    }

    /// Waits until the run has finished and returns its result.
    pub async fn wait_for(&self, handle: RunHandle) -> AppResult<ExecutionResult> {
        let mut events = self.subscribe();
        loop {
            if let Some(result) = self.result(handle) {
                return Ok(result);
            }
            // evicted before we looked
            self.status(handle)?;
            match events.recv().await {
                Ok(event) if event.run == handle && event.kind == ProgressKind::Finished => {}
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "progress subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return self.result(handle).ok_or_else(|| {
                        AutomationError::InvalidState("Sequence engine has shut down".to_string())
                    });
                }
            }
        }
    }

    /// Adds or replaces a named trigger used by `WaitForTrigger` steps and scripts.
    pub fn register_trigger(&self, definition: TriggerDefinition) {
        info!("Registered trigger '{}'.", definition.name);
        self.shared
            .triggers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(definition);
    }

    pub fn set_triggers(&self, triggers: TriggerSet) {
        *self
            .shared
            .triggers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = triggers;
    }

    pub fn triggers(&self) -> TriggerSet {
        self.shared
            .triggers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Channel groups used by `Acquire` steps.
    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        self.shared.executor.coordinator()
    }

    pub fn driver(&self) -> &SharedDriver {
        &self.shared.driver
    }

    pub fn config(&self) -> &AutomationConfig {
        &self.shared.config
    }

    /// Cancels every unfinished run and waits for the worker to exit.
    pub async fn shutdown(&self) -> AppResult<()> {
        let pending: Vec<RunHandle> = self
            .shared
            .read_runs()
            .iter()
            .filter(|(_, entry)| !entry.snapshot.status.is_terminal())
            .map(|(handle, _)| *handle)
            .collect();
        for handle in pending {
            // may have finished in the meantime
            let _ = self.cancel(handle);
        }
        let _ = self.commands.send(WorkerCommand::Shutdown);

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(worker) = worker {
            worker
                .await
                .map_err(|e| AutomationError::InvalidState(format!("Engine worker failed: {}", e)))?;
        }
        info!("Sequence engine stopped.");
        Ok(())
    }
}

async fn worker_loop(shared: Arc<EngineShared>, mut commands: mpsc::UnboundedReceiver<WorkerCommand>) {
    while let Some(command) = commands.recv().await {
        match command {
            WorkerCommand::Run { handle, job } => shared.execute(handle, job).await,
            WorkerCommand::Shutdown => {
                info!("Engine worker received shutdown command.");
                break;
            }
        }
    }

    commands.close();
    while let Ok(command) = commands.try_recv() {
        if let WorkerCommand::Run { handle, .. } = command {
            shared.cancel_unstarted(handle);
        }
    }
}

impl EngineShared {
    fn read_runs(&self) -> std::sync::RwLockReadGuard<'_, HashMap<RunHandle, RunEntry>> {
        self.runs.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_runs(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<RunHandle, RunEntry>> {
        self.runs.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_history(&self) -> std::sync::MutexGuard<'_, ResultHistory> {
        self.history.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: ProgressEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn update_snapshot(&self, handle: RunHandle, update: impl FnOnce(&mut RunSnapshot)) {
        if let Some(entry) = self.write_runs().get_mut(&handle) {
            update(&mut entry.snapshot);
            entry.snapshot.updated_at = Utc::now();
        }
    }

    /// Moves a queued run to `Running`, returning its control block. `None` when the
    /// run was cancelled while it waited in the queue.
    fn begin(&self, handle: RunHandle) -> Option<(Arc<RunControl>, RunSource)> {
        let mut runs = self.write_runs();
        let entry = runs.get_mut(&handle)?;
        if entry.snapshot.status != RunStatus::Queued {
            return None;
        }
        entry.snapshot.status = RunStatus::Running;
        entry.snapshot.updated_at = Utc::now();
        Some((entry.control.clone(), entry.snapshot.source.clone()))
    }

    fn cancel_unstarted(&self, handle: RunHandle) {
        let source = {
            let mut runs = self.write_runs();
            match runs.get_mut(&handle) {
                Some(entry) if entry.snapshot.status == RunStatus::Queued => {
                    entry.control.cancel();
                    entry.snapshot.status = RunStatus::Cancelled;
                    entry.snapshot.source.clone()
                }
                _ => return,
            }
        };
        self.commit(ExecutionResult {
            run: handle,
            source,
            status: RunStatus::Cancelled,
            outcomes: Vec::new(),
            measurements: Default::default(),
            error: None,
            return_value: None,
            log: Vec::new(),
            started_at: None,
            finished_at: Utc::now(),
        });
    }

    /// Publishes a final result: snapshot, history (evicting the oldest), then the
    /// `Finished` event.
    fn commit(&self, result: ExecutionResult) {
        let handle = result.run;
        let status = result.status;
        let message = result.error.as_ref().map(|e| e.message.clone());
        self.update_snapshot(handle, |snapshot| {
            snapshot.status = status;
            snapshot.current_step = None;
            snapshot.completed_steps = result.outcomes.len();
            if status == RunStatus::Completed {
                snapshot.progress = Some(1.0);
            }
            if result.error.is_some() {
                snapshot.last_error = result.error.clone();
            }
        });

        let evicted = self.lock_history().push(result);
        if let Some(evicted) = evicted {
            self.write_runs().remove(&evicted.run);
            debug!(run = %evicted.run, "evicted from result history");
        }

        match &message {
            Some(message) => warn!("{} finished as {}: {}", handle, status, message),
            None => info!("{} finished as {}.", handle, status),
        }
        let mut event = ProgressEvent::new(handle, ProgressKind::Finished, status);
        if let Some(message) = message {
            event = event.with_message(message);
        }
        self.emit(event);
    }

    async fn execute(self: &Arc<Self>, handle: RunHandle, job: Job) {
        let Some((control, source)) = self.begin(handle) else {
            debug!(run = %handle, "skipping run cancelled while queued");
            return;
        };

        let driver = self.driver.acquire(handle.to_string()).await;
        info!("Starting {} ('{}').", handle, source.name());
        self.emit(ProgressEvent::new(handle, ProgressKind::Started, RunStatus::Running));

        let result = match job {
            Job::Sequence(sequence) => {
                let variables = sequence.variables.clone();
                let mut ctx = ExecutionContext::new(handle, source, control, driver, variables);
                let (status, error) = self.run_sequence(&mut ctx, &sequence).await;
                ctx.finish(status, error, None)
            }
            Job::Script(prepared) => {
                let mut ctx = ExecutionContext::new(handle, source, control, driver, Default::default());
                let reporter = RunReporter {
                    shared: self.clone(),
                    run: handle,
                };
                let outcome = crate::script::bridge::execute(
                    &self.executor,
                    &mut ctx,
                    &prepared,
                    &reporter,
                    self.config.script.max_operations,
                )
                .await;
                match outcome {
                    Ok(value) => ctx.finish(RunStatus::Completed, None, value),
                    Err(AutomationError::Cancelled) => ctx.finish(RunStatus::Cancelled, None, None),
                    Err(err) => {
                        let status = if matches!(err, AutomationError::StepTimeout(_)) {
                            RunStatus::TimedOut
                        } else {
                            RunStatus::Failed
                        };
                        let error = RunError {
                            step_index: None,
                            kind: err.kind(),
                            message: err.to_string(),
                        };
                        ctx.finish(status, Some(error), None)
                    }
                }
            }
        };
        self.commit(result);
    }

    async fn run_sequence(
        &self,
        ctx: &mut ExecutionContext,
        sequence: &Sequence,
    ) -> (RunStatus, Option<RunError>) {
        let handle = ctx.run;
        let total = sequence.len();
        let max_dispatched = self.config.engine.max_dispatched_steps;
        let mut index = 0;
        let mut dispatched = 0;

        while index < total {
            if ctx.control.wait_if_paused().await.is_err() {
                return (RunStatus::Cancelled, None);
            }
            tokio::task::yield_now().await;
            if ctx.control.is_cancelled() {
                return (RunStatus::Cancelled, None);
            }

            dispatched += 1;
            if dispatched > max_dispatched {
                let error = AutomationError::InvalidState(format!(
                    "Run exceeded {} dispatched steps",
                    max_dispatched
                ));
                error!("{} aborted: {}", handle, error);
                return (
                    RunStatus::Failed,
                    Some(RunError {
                        step_index: Some(index),
                        kind: error.kind(),
                        message: error.to_string(),
                    }),
                );
            }

            let spec = &sequence.steps[index];
            let label = spec.step.label();
            ctx.current_step = Some(index);
            self.update_snapshot(handle, |snapshot| snapshot.current_step = Some(index));
            self.emit(
                ProgressEvent::new(handle, ProgressKind::StepStarted, RunStatus::Running)
                    .with_step(index)
                    .with_message(label.clone()),
            );

            let started = Instant::now();
            let (status, message, next) = if !spec.enabled {
                debug!(run = %handle, index, "step disabled");
                (StepStatus::Skipped, None, index + 1)
            } else {
                match self.executor.execute(ctx, spec).await {
                    Ok(StepEffect::Next) => (StepStatus::Succeeded, None, index + 1),
                    Ok(StepEffect::Jump(target)) => (StepStatus::Succeeded, None, target),
                    Err(AutomationError::Cancelled) => return (RunStatus::Cancelled, None),
                    Err(err) => {
                        let timed_out = matches!(err, AutomationError::StepTimeout(_));
                        let message = err.to_string();
                        warn!("{} step {} ({}) failed: {}", handle, index, label, message);
                        let run_error = RunError {
                            step_index: Some(index),
                            kind: err.kind(),
                            message: message.clone(),
                        };
                        ctx.outcomes.push(StepOutcome {
                            index,
                            label,
                            status: if timed_out { StepStatus::TimedOut } else { StepStatus::Failed },
                            message: Some(message),
                            duration: started.elapsed(),
                        });
                        match sequence.failure_policy {
                            crate::sequence::FailurePolicy::AbortOnFirstFailure => {
                                let status = if timed_out { RunStatus::TimedOut } else { RunStatus::Failed };
                                return (status, Some(run_error));
                            }
                            crate::sequence::FailurePolicy::ContinueOnFailure => {
                                self.update_snapshot(handle, |snapshot| {
                                    snapshot.last_error = Some(run_error);
                                });
                                self.finish_step(ctx, index, total);
                                index += 1;
                                continue;
                            }
                        }
                    }
                }
            };

            ctx.outcomes.push(StepOutcome {
                index,
                label,
                status,
                message,
                duration: started.elapsed(),
            });
            self.finish_step(ctx, index, total);
            index = next;
        }

        if ctx.control.is_cancelled() {
            return (RunStatus::Cancelled, None);
        }
        (RunStatus::Completed, None)
    }

    fn finish_step(&self, ctx: &ExecutionContext, index: usize, total: usize) {
        let completed = ctx.outcomes.len();
        let progress = if total == 0 {
            1.0
        } else {
            (completed as f64 / total as f64).min(1.0)
        };
        let status = if ctx.control.is_paused() {
            RunStatus::Paused
        } else {
            RunStatus::Running
        };
        self.update_snapshot(ctx.run, |snapshot| {
            snapshot.completed_steps = completed;
            snapshot.progress = Some(progress);
        });
        let mut event = ProgressEvent::new(ctx.run, ProgressKind::StepFinished, status)
            .with_step(index)
            .with_progress(progress);
        if let Some(outcome) = ctx.outcomes.last() {
            event = event.with_message(format!("{:?}", outcome.status).to_lowercase());
        }
        self.emit(event);
    }
}

/// Lets a running script publish progress and log lines for its run.
pub(crate) struct RunReporter {
    shared: Arc<EngineShared>,
    run: RunHandle,
}

impl RunReporter {
    pub(crate) fn progress(&self, fraction: f64) {
        let fraction = fraction.clamp(0.0, 1.0);
        self.shared
            .update_snapshot(self.run, |snapshot| snapshot.progress = Some(fraction));
        self.shared.emit(
            ProgressEvent::new(self.run, ProgressKind::ScriptProgress, RunStatus::Running)
                .with_progress(fraction),
        );
    }

    pub(crate) fn log(&self, line: &str) {
        info!("[{}] {}", self.run, line);
        self.shared.emit(
            ProgressEvent::new(self.run, ProgressKind::ScriptLog, RunStatus::Running).with_message(line),
        );
    }
}
