use scope_automation::analysis::MeasurementKind;
use scope_automation::config::AutomationConfig;
use scope_automation::engine::{ProgressEvent, ProgressKind, RunHandle, RunStatus, SequenceEngine, StepStatus};
use scope_automation::instrument::mock::{sine_waveform, square_waveform, MockDriver};
use scope_automation::instrument::{ChannelId, SharedDriver};
use scope_automation::sequence::{Expr, FailurePolicy, Operand, ParameterValue, Sequence, Step, TriggerRef};
use scope_automation::trigger::{Comparator, TriggerCondition, TriggerDefinition, TriggerMode, TriggerTree};
use scope_automation::{AutomationError, ErrorKind};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;

const POLL: Duration = Duration::from_millis(5);

fn config() -> AutomationConfig {
    let mut config = AutomationConfig::default();
    config.engine.poll_interval = POLL;
    config.retry.backoff_delay = Duration::from_millis(1);
    config.retry.max_backoff = Duration::from_millis(5);
    config
}

fn mock() -> MockDriver {
    MockDriver::new().with_waveform(sine_waveform(ChannelId(1), 1_000.0, 1.0, 1e-6, 2_000))
}

fn engine_with(driver: MockDriver, config: AutomationConfig) -> SequenceEngine {
    SequenceEngine::new(config, SharedDriver::new(driver)).unwrap()
}

fn delay(ms: u64) -> Step {
    Step::Delay {
        duration: Duration::from_millis(ms),
    }
}

fn rms(channel: u8) -> Step {
    Step::Measure {
        kind: MeasurementKind::Rms,
        channel: ChannelId(channel),
        store_as: None,
    }
}

/// A level trigger on ch1 that the mock sine never reaches.
fn unreachable_trigger() -> TriggerTree {
    TriggerTree::single(TriggerCondition::Level {
        channel: ChannelId(1),
        threshold: 100.0,
        comparator: Comparator::Greater,
    })
    .unwrap()
}

async fn next_event(
    events: &mut broadcast::Receiver<ProgressEvent>,
    handle: RunHandle,
    kind: ProgressKind,
    step: Option<usize>,
) -> ProgressEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.unwrap();
            if event.run == handle && event.kind == kind && (step.is_none() || event.step_index == step) {
                return event;
            }
        }
    })
    .await
    .expect("event not observed")
}

#[tokio::test]
async fn successful_sequence_records_every_step_in_order() {
    let engine = engine_with(mock(), config());
    let sequence = Sequence::new("all steps")
        .with_step(Step::SetParameter {
            target: "CH1:SCAL".to_string(),
            value: 0.5.into(),
        })
        .with_step(delay(2))
        .with_step(rms(1))
        .with_step(Step::Acquire {
            channels: vec![ChannelId(1)],
        })
        .with_step(Step::WaitForTrigger {
            trigger: TriggerRef::Inline(
                TriggerTree::single(TriggerCondition::Level {
                    channel: ChannelId(1),
                    threshold: 0.5,
                    comparator: Comparator::Greater,
                })
                .unwrap(),
            ),
            timeout: Duration::from_secs(1),
        });

    let handle = engine.submit(&sequence).unwrap();
    let result = engine.wait_for(handle).await.unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert!(result.error.is_none());
    assert_eq!(result.outcomes.len(), sequence.len());
    for (position, outcome) in result.outcomes.iter().enumerate() {
        assert_eq!(outcome.index, position);
        assert_eq!(outcome.status, StepStatus::Succeeded);
    }
    assert!(result.measurement("rms_ch1").is_some());
}

#[tokio::test]
async fn rms_scenario_reports_exact_value() {
    let driver = MockDriver::new().with_waveform(square_waveform(ChannelId(1), -2.0, 2.0, 16, 1e-6, 1_024));
    let engine = engine_with(driver.clone(), config());
    let sequence = Sequence::new("rms")
        .with_step(Step::SetParameter {
            target: "gain".to_string(),
            value: ParameterValue::Int(2),
        })
        .with_step(delay(10))
        .with_step(rms(1));

    let handle = engine.submit(&sequence).unwrap();
    let result = engine.wait_for(handle).await.unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.outcomes.len(), 3);
    assert_eq!(result.measurement("rms_ch1"), Some(2.0));
    assert_eq!(driver.commands(), vec!["gain 2".to_string()]);
}

#[tokio::test]
async fn cancelling_at_any_step_yields_cancelled_and_releases_driver() {
    for target in 0..4 {
        let engine = engine_with(mock(), config());
        let sequence = Sequence::new("cancel me")
            .with_step(delay(40))
            .with_step(Step::WaitForTrigger {
                trigger: TriggerRef::Inline(unreachable_trigger()),
                timeout: Duration::from_secs(10),
            })
            .with_step(delay(40))
            .with_step(delay(40));

        let mut events = engine.subscribe();
        let handle = engine.submit(&sequence).unwrap();
        next_event(&mut events, handle, ProgressKind::StepStarted, Some(target)).await;
        engine.cancel(handle).unwrap();

        let result = engine.wait_for(handle).await.unwrap();
        assert_eq!(result.status, RunStatus::Cancelled, "cancelled at step {}", target);
        assert_eq!(result.outcomes.len(), target);
        assert!(result.error.is_none());

        tokio::time::sleep(POLL).await;
        assert!(engine.driver().is_available(), "driver still leased after cancel at {}", target);
    }
}

#[tokio::test]
async fn abort_policy_stops_at_first_failure() {
    let engine = engine_with(mock(), config());
    // ch2 has no waveform, so the measurement fails.
    let sequence = Sequence::new("abort").with_step(rms(2)).with_step(delay(1));

    let result = engine.wait_for(engine.submit(&sequence).unwrap()).await.unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.outcomes.len(), 1);
    assert_eq!(result.outcomes[0].status, StepStatus::Failed);
    let error = result.error.unwrap();
    assert_eq!(error.step_index, Some(0));
    assert_eq!(error.kind, ErrorKind::Instrument);
}

#[tokio::test]
async fn continue_policy_runs_remaining_steps() {
    let engine = engine_with(mock(), config());
    let sequence = Sequence::new("continue")
        .with_failure_policy(FailurePolicy::ContinueOnFailure)
        .with_step(rms(2))
        .with_step(rms(1));

    let handle = engine.submit(&sequence).unwrap();
    let result = engine.wait_for(handle).await.unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.outcomes.len(), 2);
    assert_eq!(result.outcomes[0].status, StepStatus::Failed);
    assert_eq!(result.outcomes[1].status, StepStatus::Succeeded);
    assert_eq!(result.failures().count(), 1);

    let snapshot = engine.status(handle).unwrap();
    assert_eq!(snapshot.last_error.map(|e| e.step_index), Some(Some(0)));
}

#[tokio::test]
async fn pause_holds_the_run_until_resumed() {
    let engine = engine_with(mock(), config());
    let mut sequence = Sequence::new("pausable");
    for _ in 0..6 {
        sequence = sequence.with_step(delay(20));
    }

    let mut events = engine.subscribe();
    let handle = engine.submit(&sequence).unwrap();
    next_event(&mut events, handle, ProgressKind::StepStarted, Some(1)).await;
    engine.pause(handle).unwrap();
    assert_eq!(engine.status(handle).unwrap().status, RunStatus::Paused);
    assert!(matches!(engine.pause(handle), Err(AutomationError::InvalidState(_))));

    tokio::time::sleep(Duration::from_millis(80)).await;
    let held = engine.status(handle).unwrap().completed_steps;
    assert!(held <= 2);
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(engine.status(handle).unwrap().completed_steps, held);

    engine.resume(handle).unwrap();
    let result = engine.wait_for(handle).await.unwrap();
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.outcomes.len(), 6);
    assert!(matches!(engine.resume(handle), Err(AutomationError::InvalidState(_))));
}

#[tokio::test]
async fn branch_skips_to_selected_step() {
    let engine = engine_with(mock(), config());
    let sequence = Sequence::new("branching")
        .with_step(Step::SetParameter {
            target: "gain".to_string(),
            value: ParameterValue::Int(2),
        })
        .with_step(Step::Branch {
            condition: Expr::compare(
                Operand::Variable("gain".to_string()),
                Comparator::Greater,
                Operand::Literal(ParameterValue::Int(1)),
            ),
            then_index: 3,
            else_index: 2,
        })
        .with_step(rms(2))
        .with_step(rms(1));

    let result = engine.wait_for(engine.submit(&sequence).unwrap()).await.unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    let visited: Vec<usize> = result.outcomes.iter().map(|o| o.index).collect();
    assert_eq!(visited, vec![0, 1, 3]);
}

#[tokio::test]
async fn endless_branch_loop_is_bounded() {
    let mut config = config();
    config.engine.max_dispatched_steps = 50;
    let engine = engine_with(mock(), config);
    let sequence = Sequence::new("loop").with_step(Step::Branch {
        condition: Expr::compare(
            Operand::Literal(ParameterValue::Int(1)),
            Comparator::Equal,
            Operand::Literal(ParameterValue::Int(1)),
        ),
        then_index: 0,
        else_index: 1,
    });

    let result = engine.wait_for(engine.submit(&sequence).unwrap()).await.unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.outcomes.len(), 50);
    assert_eq!(result.error.unwrap().kind, ErrorKind::InvalidState);
}

#[tokio::test]
async fn transient_driver_failures_are_retried() {
    let driver = mock();
    let engine = engine_with(driver.clone(), config());
    let sequence = Sequence::new("flaky").with_step(rms(1));

    driver.fail_next(2);
    let result = engine.wait_for(engine.submit(&sequence).unwrap()).await.unwrap();
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(driver.pending_failures(), 0);

    driver.fail_next(10);
    let result = engine.wait_for(engine.submit(&sequence).unwrap()).await.unwrap();
    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.error.unwrap().kind, ErrorKind::DriverUnavailable);
}

#[tokio::test]
async fn cancel_during_retry_backoff_returns_promptly() {
    let driver = mock();
    let mut config = config();
    config.retry.max_attempts = 5;
    config.retry.backoff_delay = Duration::from_millis(1_500);
    config.retry.max_backoff = Duration::from_secs(2);
    let engine = engine_with(driver.clone(), config);
    let mut events = engine.subscribe();

    driver.fail_next(10);
    let handle = engine.submit(&Sequence::new("backing off").with_step(rms(1))).unwrap();
    next_event(&mut events, handle, ProgressKind::StepStarted, Some(0)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let cancelled_at = tokio::time::Instant::now();
    engine.cancel(handle).unwrap();
    let result = engine.wait_for(handle).await.unwrap();
    let latency = cancelled_at.elapsed();

    assert_eq!(result.status, RunStatus::Cancelled);
    assert!(latency < Duration::from_millis(100), "cancel took {:?}", latency);
    assert_eq!(driver.pending_failures(), 9);
    tokio::time::sleep(POLL).await;
    assert!(engine.driver().is_available());
}

#[tokio::test]
async fn trigger_wait_times_out() {
    let engine = engine_with(mock(), config());
    let sequence = Sequence::new("no trigger").with_step(Step::WaitForTrigger {
        trigger: TriggerRef::Inline(unreachable_trigger()),
        timeout: Duration::from_millis(30),
    });

    let result = engine.wait_for(engine.submit(&sequence).unwrap()).await.unwrap();

    assert_eq!(result.status, RunStatus::TimedOut);
    assert_eq!(result.outcomes[0].status, StepStatus::TimedOut);
    assert_eq!(result.error.unwrap().kind, ErrorKind::StepTimeout);
}

#[tokio::test]
async fn auto_mode_trigger_fires_on_timeout() {
    let engine = engine_with(mock(), config());
    engine.register_trigger(TriggerDefinition::new("free run", unreachable_trigger()).with_mode(TriggerMode::Auto));
    let sequence = Sequence::new("auto").with_step(Step::WaitForTrigger {
        trigger: TriggerRef::Named("free run".to_string()),
        timeout: Duration::from_millis(30),
    });

    let result = engine.wait_for(engine.submit(&sequence).unwrap()).await.unwrap();
    assert_eq!(result.status, RunStatus::Completed);
}

#[tokio::test]
async fn progress_events_follow_step_boundaries() {
    let engine = engine_with(mock(), config());
    let mut events = engine.subscribe();
    let sequence = Sequence::new("events").with_step(delay(1)).with_step(rms(1));
    let handle = engine.submit(&sequence).unwrap();

    let mut kinds = Vec::new();
    timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.unwrap();
            if event.run != handle {
                continue;
            }
            kinds.push((event.kind, event.step_index));
            if event.kind == ProgressKind::Finished {
                assert_eq!(event.status, RunStatus::Completed);
                break;
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(
        kinds,
        vec![
            (ProgressKind::Queued, None),
            (ProgressKind::Started, None),
            (ProgressKind::StepStarted, Some(0)),
            (ProgressKind::StepFinished, Some(0)),
            (ProgressKind::StepStarted, Some(1)),
            (ProgressKind::StepFinished, Some(1)),
            (ProgressKind::Finished, None),
        ]
    );
}

#[tokio::test]
async fn history_keeps_most_recent_results() {
    let mut config = config();
    config.engine.history_capacity = 2;
    let engine = engine_with(mock(), config);

    let mut handles = Vec::new();
    for n in 0..4 {
        let handle = engine.submit(&Sequence::new(format!("run {}", n))).unwrap();
        engine.wait_for(handle).await.unwrap();
        handles.push(handle);
    }

    let history = engine.history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].run, handles[2]);
    assert_eq!(history[1].run, handles[3]);
    assert!(matches!(engine.status(handles[0]), Err(AutomationError::UnknownRun(_))));
    assert!(engine.result(handles[0]).is_none());
}
