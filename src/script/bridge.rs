//! Bridge between a Rhai script on a blocking thread and the async run that holds
//! the driver lease.
//!
//! Instrument functions registered with the script engine do not touch the driver
//! themselves. Each call becomes a [`ScriptCall`] sent over a bounded channel, and the
//! engine worker executes it with the run's [`ExecutionContext`] and replies on a
//! oneshot channel. The script therefore never holds the driver outside its run and
//! shares retry, timeout and cancellation handling with sequence steps.
//!
//! Functions available to scripts:
//!
//! | function                        | returns                                |
//! |---------------------------------|----------------------------------------|
//! | `measure(kind, channel)`        | measured value                         |
//! | `set_parameter(target, value)`  | `()`                                   |
//! | `wait(ms)`                      | `()`                                   |
//! | `wait_for_trigger(name, ms)`    | `true` on a real hit, `false` on auto  |
//! | `acquire(channel / [channels])` | number of records acquired             |
//! | `write(cmd)` / `query(cmd)`     | `()` / response text                   |
//! | `log(msg)`                      | `()`                                   |
//! | `param(name)`                   | parameter value                        |
//! | `set_progress(pct)`             | `()`                                   |
//! | `check_stop()`                  | whether cancellation was requested     |
//! | `record(name, value)`           | `()`                                   |

use super::runtime::{base_engine, PreparedScript};
use crate::analysis::MeasurementKind;
use crate::engine::{ExecutionContext, RunControl, RunReporter, StepExecutor};
use crate::error::{AppResult, AutomationError};
use crate::instrument::ChannelId;
use crate::sequence::{ParameterValue, TriggerRef};
use rhai::{Array, Dynamic, Engine, EvalAltResult, Scope, FLOAT, INT};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

type RhaiResult<T> = Result<T, Box<EvalAltResult>>;

// =============================================================================
// Requests
// =============================================================================

#[derive(Debug)]
enum ScriptCall {
    Measure { kind: MeasurementKind, channel: ChannelId },
    SetParameter { target: String, value: ParameterValue },
    Wait(Duration),
    WaitForTrigger { name: String, timeout: Duration },
    Acquire(Vec<ChannelId>),
    Write(String),
    Query(String),
    Log(String),
    Progress(f64),
    Record { name: String, value: f64 },
}

struct ScriptRequest {
    call: ScriptCall,
    reply: oneshot::Sender<AppResult<Dynamic>>,
}

// =============================================================================
// Script side
// =============================================================================

/// Cloned into every registered function.
#[derive(Clone)]
struct ScriptBridge {
    requests: mpsc::Sender<ScriptRequest>,
    /// Last crate error raised through the bridge, kept so the run reports its kind.
    error: Arc<Mutex<Option<AutomationError>>>,
}

impl ScriptBridge {
    fn call(&self, call: ScriptCall) -> RhaiResult<Dynamic> {
        let (reply, response) = oneshot::channel();
        if self.requests.blocking_send(ScriptRequest { call, reply }).is_err() {
            return Err(self.fail(AutomationError::Cancelled));
        }
        match response.blocking_recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(self.fail(err)),
            Err(_) => Err(self.fail(AutomationError::Cancelled)),
        }
    }

    fn fail(&self, err: AutomationError) -> Box<EvalAltResult> {
        let message = err.to_string();
        *self.error.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(err);
        message.into()
    }
}

fn channel_arg(channel: INT) -> RhaiResult<ChannelId> {
    u8::try_from(channel)
        .ok()
        .filter(|n| *n > 0)
        .map(ChannelId)
        .ok_or_else(|| format!("Invalid channel {}", channel).into())
}

fn channel_name_arg(channel: &str) -> RhaiResult<ChannelId> {
    channel.parse().map_err(|e: AutomationError| e.to_string().into())
}

fn kind_arg(kind: &str) -> RhaiResult<MeasurementKind> {
    kind.parse().map_err(|e: AutomationError| e.to_string().into())
}

fn millis_arg(ms: INT) -> RhaiResult<Duration> {
    u64::try_from(ms)
        .map(Duration::from_millis)
        .map_err(|_| format!("Duration must not be negative, got {} ms", ms).into())
}

pub(crate) fn to_dynamic(value: &ParameterValue) -> Dynamic {
    match value {
        ParameterValue::Bool(v) => Dynamic::from_bool(*v),
        ParameterValue::Int(v) => Dynamic::from_int(*v),
        ParameterValue::Float(v) => Dynamic::from_float(*v),
        ParameterValue::Text(v) => Dynamic::from(v.clone()),
    }
}

pub(crate) fn from_dynamic(value: &Dynamic) -> RhaiResult<ParameterValue> {
    if let Ok(v) = value.as_bool() {
        return Ok(ParameterValue::Bool(v));
    }
    if let Ok(v) = value.as_int() {
        return Ok(ParameterValue::Int(v));
    }
    if let Ok(v) = value.as_float() {
        return Ok(ParameterValue::Float(v));
    }
    if value.is_string() {
        return Ok(ParameterValue::Text(value.to_string()));
    }
    Err(format!("Unsupported value of type {}", value.type_name()).into())
}

fn register_functions(
    engine: &mut Engine,
    bridge: ScriptBridge,
    control: Arc<RunControl>,
    params: BTreeMap<String, ParameterValue>,
) {
    let b = bridge.clone();
    engine.register_fn("measure", move |kind: &str, channel: INT| -> RhaiResult<FLOAT> {
        let call = ScriptCall::Measure {
            kind: kind_arg(kind)?,
            channel: channel_arg(channel)?,
        };
        b.call(call)?.as_float().map_err(|t| format!("measure returned {}", t).into())
    });
    let b = bridge.clone();
    engine.register_fn("measure", move |kind: &str, channel: &str| -> RhaiResult<FLOAT> {
        let call = ScriptCall::Measure {
            kind: kind_arg(kind)?,
            channel: channel_name_arg(channel)?,
        };
        b.call(call)?.as_float().map_err(|t| format!("measure returned {}", t).into())
    });

    let b = bridge.clone();
    engine.register_fn("set_parameter", move |target: &str, value: Dynamic| -> RhaiResult<()> {
        b.call(ScriptCall::SetParameter {
            target: target.to_string(),
            value: from_dynamic(&value)?,
        })
        .map(|_| ())
    });

    let b = bridge.clone();
    engine.register_fn("wait", move |ms: INT| -> RhaiResult<()> {
        b.call(ScriptCall::Wait(millis_arg(ms)?)).map(|_| ())
    });

    let b = bridge.clone();
    engine.register_fn("wait_for_trigger", move |name: &str, timeout_ms: INT| -> RhaiResult<bool> {
        let call = ScriptCall::WaitForTrigger {
            name: name.to_string(),
            timeout: millis_arg(timeout_ms)?,
        };
        b.call(call)?.as_bool().map_err(|t| format!("wait_for_trigger returned {}", t).into())
    });

    let b = bridge.clone();
    engine.register_fn("acquire", move |channels: Array| -> RhaiResult<INT> {
        let channels = channels
            .iter()
            .map(|ch| match ch.as_int() {
                Ok(n) => channel_arg(n),
                Err(_) => channel_name_arg(&ch.to_string()),
            })
            .collect::<RhaiResult<Vec<_>>>()?;
        b.call(ScriptCall::Acquire(channels))?
            .as_int()
            .map_err(|t| format!("acquire returned {}", t).into())
    });
    let b = bridge.clone();
    engine.register_fn("acquire", move |channel: INT| -> RhaiResult<INT> {
        b.call(ScriptCall::Acquire(vec![channel_arg(channel)?]))?
            .as_int()
            .map_err(|t| format!("acquire returned {}", t).into())
    });

    let b = bridge.clone();
    engine.register_fn("write", move |command: &str| -> RhaiResult<()> {
        b.call(ScriptCall::Write(command.to_string())).map(|_| ())
    });
    let b = bridge.clone();
    engine.register_fn("query", move |command: &str| -> RhaiResult<String> {
        Ok(b.call(ScriptCall::Query(command.to_string()))?.to_string())
    });

    let b = bridge.clone();
    engine.register_fn("log", move |message: &str| -> RhaiResult<()> {
        b.call(ScriptCall::Log(message.to_string())).map(|_| ())
    });
    let b = bridge.clone();
    engine.on_print(move |message| {
        // print output joins the run log
        let _ = b.call(ScriptCall::Log(message.to_string()));
    });

    engine.register_fn("param", move |name: &str| -> RhaiResult<Dynamic> {
        params
            .get(name)
            .map(to_dynamic)
            .ok_or_else(|| format!("Parameter '{}' is not set", name).into())
    });

    let b = bridge.clone();
    engine.register_fn("set_progress", move |percent: INT| -> RhaiResult<()> {
        b.call(ScriptCall::Progress(percent as f64 / 100.0)).map(|_| ())
    });
    let b = bridge.clone();
    engine.register_fn("set_progress", move |percent: FLOAT| -> RhaiResult<()> {
        b.call(ScriptCall::Progress(percent / 100.0)).map(|_| ())
    });

    engine.register_fn("check_stop", move || control.is_cancelled());

    let b = bridge.clone();
    engine.register_fn("record", move |name: &str, value: FLOAT| -> RhaiResult<()> {
        b.call(ScriptCall::Record {
            name: name.to_string(),
            value,
        })
        .map(|_| ())
    });
    engine.register_fn("record", move |name: &str, value: INT| -> RhaiResult<()> {
        bridge
            .call(ScriptCall::Record {
                name: name.to_string(),
                value: value as f64,
            })
            .map(|_| ())
    });
}

// =============================================================================
// Run side
// =============================================================================

async fn serve(
    executor: &StepExecutor,
    ctx: &mut ExecutionContext,
    reporter: &RunReporter,
    call: ScriptCall,
) -> AppResult<Dynamic> {
    let policy = executor.retry_policy(0);
    match call {
        ScriptCall::Measure { kind, channel } => {
            let value = executor.measure(ctx, kind, channel, &policy).await?;
            ctx.measurements
                .insert(format!("{}_{}", kind.as_str(), channel), value);
            Ok(Dynamic::from_float(value))
        }
        ScriptCall::SetParameter { target, value } => {
            executor.set_parameter(ctx, &target, &value, &policy).await?;
            ctx.variables.insert(target, value);
            Ok(Dynamic::UNIT)
        }
        ScriptCall::Wait(duration) => {
            executor.delay(ctx, duration).await?;
            Ok(Dynamic::UNIT)
        }
        ScriptCall::WaitForTrigger { name, timeout } => {
            let definition = executor.resolve_trigger(&TriggerRef::Named(name))?;
            let hit = executor
                .wait_for_trigger(ctx, &definition, timeout, &policy)
                .await?;
            Ok(Dynamic::from_bool(hit.is_some()))
        }
        ScriptCall::Acquire(channels) => {
            let waveforms = executor.acquire(ctx, &channels, &policy).await?;
            Ok(Dynamic::from_int(waveforms.len() as INT))
        }
        ScriptCall::Write(command) => {
            executor.write(ctx, &command, &policy).await?;
            Ok(Dynamic::UNIT)
        }
        ScriptCall::Query(command) => {
            let response = executor.query(ctx, &command, &policy).await?;
            Ok(Dynamic::from(response))
        }
        ScriptCall::Log(line) => {
            reporter.log(&line);
            ctx.log.push(line);
            Ok(Dynamic::UNIT)
        }
        ScriptCall::Progress(fraction) => {
            reporter.progress(fraction);
            Ok(Dynamic::UNIT)
        }
        ScriptCall::Record { name, value } => {
            ctx.measurements.insert(name, value);
            Ok(Dynamic::UNIT)
        }
    }
}

/// Runs a prepared script to completion, serving its instrument calls.
///
/// Returns the script's final value rendered as text, or `None` for `()`.
pub(crate) async fn execute(
    executor: &StepExecutor,
    ctx: &mut ExecutionContext,
    prepared: &PreparedScript,
    reporter: &RunReporter,
    max_operations: u64,
) -> AppResult<Option<String>> {
    let (requests, mut incoming) = mpsc::channel(1);
    let error_slot = Arc::new(Mutex::new(None));
    let bridge = ScriptBridge {
        requests,
        error: error_slot.clone(),
    };

    let mut engine = base_engine();
    {
        let control = ctx.control.clone();
        let slot = error_slot.clone();
        engine.on_progress(move |count| {
            let err = if control.is_cancelled() {
                AutomationError::Cancelled
            } else if count > max_operations {
                AutomationError::Script(format!(
                    "Safety limit exceeded: maximum {} operations",
                    max_operations
                ))
            } else {
                return None;
            };
            let message = err.to_string();
            *slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(err);
            Some(message.into())
        });
    }
    register_functions(&mut engine, bridge, ctx.control.clone(), prepared.params.clone());

    let mut scope = Scope::new();
    for (name, value) in &prepared.params {
        scope.push_constant(name.clone(), to_dynamic(value));
    }
    let ast = prepared.ast.clone();
    debug!(run = %ctx.run, script = %prepared.script.name, "starting script thread");

    // the engine owns every request sender, so the channel closes when the script ends
    let task = tokio::task::spawn_blocking(move || {
        engine
            .eval_ast_with_scope::<Dynamic>(&mut scope, &ast)
            .map(|value| (!value.is_unit()).then(|| value.to_string()))
    });

    while let Some(ScriptRequest { call, reply }) = incoming.recv().await {
        let result = serve(executor, ctx, reporter, call).await;
        let _ = reply.send(result);
    }

    let outcome = task
        .await
        .map_err(|e| AutomationError::Script(format!("Script thread failed: {}", e)))?;

    match outcome {
        Ok(value) => Ok(value),
        Err(err) => {
            let stored = error_slot
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
            if ctx.control.is_cancelled() {
                return Err(AutomationError::Cancelled);
            }
            match (stored, *err) {
                (Some(stored), EvalAltResult::ErrorTerminated(..)) => Err(stored),
                (Some(stored), other) if other.to_string().contains(&stored.to_string()) => Err(stored),
                (_, other) => Err(AutomationError::Script(other.to_string())),
            }
        }
    }
}
