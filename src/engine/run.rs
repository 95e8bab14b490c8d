//! Run identifiers, status snapshots, results and progress events.
use crate::error::ErrorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Handle returned by `submit`, identifying one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunHandle(pub Uuid);

impl RunHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled | RunStatus::TimedOut
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::TimedOut => "timed_out",
        };
        f.write_str(name)
    }
}

/// How a single step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    TimedOut,
    Skipped,
}

/// Trace entry for one executed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    /// Position of the step in the sequence.
    pub index: usize,
    /// Human-readable step description.
    pub label: String,
    pub status: StepStatus,
    /// Error text for failed and timed-out steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}

/// The error that ended (or was recorded by) a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunError {
    /// Failing step, `None` for errors outside any step (e.g. a script error).
    pub step_index: Option<usize>,
    pub kind: ErrorKind,
    /// Display text of the underlying error.
    pub message: String,
}

/// What a run executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunSource {
    Sequence { id: Uuid, name: String },
    Script { id: Uuid, name: String },
}

impl RunSource {
    pub fn name(&self) -> &str {
        match self {
            RunSource::Sequence { name, .. } | RunSource::Script { name, .. } => name,
        }
    }
}

/// Final record of a run, kept in the bounded history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Handle returned at submission.
    pub run: RunHandle,
    /// The sequence or script that ran.
    pub source: RunSource,
    /// Terminal status.
    pub status: RunStatus,
    /// One entry per dispatched step, in execution order.
    pub outcomes: Vec<StepOutcome>,
    /// Stored measurement values by key.
    pub measurements: BTreeMap<String, f64>,
    /// Set when the run ended `Failed` or `TimedOut`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    /// Script return value, rendered as text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_value: Option<String>,
    /// Lines logged by a script.
    #[serde(default)]
    pub log: Vec<String>,
    /// When the worker picked the run up; unset for runs cancelled while queued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the result was committed.
    pub finished_at: DateTime<Utc>,
}

impl ExecutionResult {
    /// A stored measurement by key.
    pub fn measurement(&self, key: &str) -> Option<f64> {
        self.measurements.get(key).copied()
    }

    /// Outcomes that did not succeed or get skipped.
    pub fn failures(&self) -> impl Iterator<Item = &StepOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, StepStatus::Failed | StepStatus::TimedOut))
    }
}

/// Most recently committed state of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    /// Handle returned at submission.
    pub run: RunHandle,
    /// The sequence or script being run.
    pub source: RunSource,
    /// Current lifecycle state.
    pub status: RunStatus,
    /// Index of the step being executed, if any.
    pub current_step: Option<usize>,
    /// Steps finished so far, whatever their outcome.
    pub completed_steps: usize,
    /// Number of steps for sequences; `None` for scripts.
    pub total_steps: Option<usize>,
    /// Fraction in [0, 1] when known.
    pub progress: Option<f64>,
    /// Most recent step failure, also kept under `ContinueOnFailure`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<RunError>,
    /// Time of the last committed change.
    pub updated_at: DateTime<Utc>,
}

impl RunSnapshot {
    pub(crate) fn queued(run: RunHandle, source: RunSource, total_steps: Option<usize>) -> Self {
        Self {
            run,
            source,
            status: RunStatus::Queued,
            current_step: None,
            completed_steps: 0,
            total_steps,
            progress: None,
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    Queued,
    Started,
    StepStarted,
    StepFinished,
    Paused,
    Resumed,
    ScriptProgress,
    ScriptLog,
    Finished,
}

/// Broadcast notification about a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub run: RunHandle,
    pub kind: ProgressKind,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(run: RunHandle, kind: ProgressKind, status: RunStatus) -> Self {
        Self {
            run,
            kind,
            status,
            step_index: None,
            progress: None,
            message: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_step(mut self, index: usize) -> Self {
        self.step_index = Some(index);
        self
    }

    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress.clamp(0.0, 1.0));
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}
