use scope_automation::config::AutomationConfig;
use scope_automation::engine::{ProgressKind, RunStatus, SequenceEngine};
use scope_automation::instrument::mock::{sine_waveform, square_waveform, MockDriver};
use scope_automation::instrument::{ChannelId, SharedDriver};
use scope_automation::script::{ParameterSpec, ParameterType, Script, ScriptRuntime};
use scope_automation::sequence::ParameterValue;
use scope_automation::{AutomationError, ErrorKind};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::timeout;

fn config() -> AutomationConfig {
    let mut config = AutomationConfig::default();
    config.engine.poll_interval = Duration::from_millis(5);
    config.retry.backoff_delay = Duration::from_millis(1);
    config
}

fn runtime_with(driver: MockDriver, config: AutomationConfig) -> ScriptRuntime {
    ScriptRuntime::new(SequenceEngine::new(config, SharedDriver::new(driver)).unwrap())
}

fn params(values: &[(&str, ParameterValue)]) -> BTreeMap<String, ParameterValue> {
    values
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}

#[tokio::test]
async fn basic_measurement_template_reports_rms() {
    let driver = MockDriver::new().with_waveform(square_waveform(ChannelId(2), -2.0, 2.0, 8, 1e-6, 256));
    let runtime = runtime_with(driver, config());

    let handle = runtime
        .run_template(
            "basic_measurement",
            &params(&[("channel", "CH2".into()), ("measurement_type", "rms".into())]),
        )
        .unwrap();
    let result = runtime.engine().wait_for(handle).await.unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.measurement("result"), Some(2.0));
    assert_eq!(result.measurement("rms_ch2"), Some(2.0));
    assert!(result.log.iter().any(|line| line.contains("Measurement result")));
}

#[tokio::test]
async fn invalid_parameters_never_reach_the_instrument() {
    let driver = MockDriver::new();
    let runtime = runtime_with(driver.clone(), config());

    let err = runtime
        .run_template(
            "frequency_sweep",
            &params(&[
                ("num_points", ParameterValue::Int(1)),
                ("channel", ParameterValue::Int(9)),
                ("sweep_mode", "log".into()),
            ]),
        )
        .unwrap_err();

    match err {
        AutomationError::ParameterValidation(message) => {
            assert!(message.contains("num_points"), "{}", message);
            assert!(message.contains("channel"), "{}", message);
            assert!(message.contains("sweep_mode"), "{}", message);
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(driver.commands().is_empty());
    assert!(runtime.engine().history().is_empty());
}

#[tokio::test]
async fn wrongly_typed_parameter_is_rejected() {
    let runtime = runtime_with(MockDriver::new(), config());
    let err = runtime
        .run_template("waveform_capture_analyze", &params(&[("analyze_frequency", "yes".into())]))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ParameterValidation);
}

#[tokio::test]
async fn frequency_sweep_sets_each_point() {
    let driver = MockDriver::new().with_waveform(sine_waveform(ChannelId(1), 1e3, 1.5, 1e-6, 2_000));
    let runtime = runtime_with(driver.clone(), config());

    let handle = runtime
        .run_template(
            "frequency_sweep",
            &params(&[("num_points", ParameterValue::Int(3)), ("settle_ms", ParameterValue::Int(0))]),
        )
        .unwrap();
    let result = runtime.engine().wait_for(handle).await.unwrap();

    assert_eq!(result.status, RunStatus::Completed, "{:?}", result.error);
    assert_eq!(driver.commands(), vec!["FREQ 100", "FREQ 5050", "FREQ 10000"]);
    for point in 0..3 {
        let amplitude = result.measurement(&format!("amplitude_{}", point)).unwrap();
        assert!(amplitude > 1.5 && amplitude <= 3.0, "amplitude {}", amplitude);
    }
    assert_eq!(result.return_value.as_deref(), Some("3"));
}

#[tokio::test]
async fn script_progress_is_published() {
    let driver = MockDriver::new().with_waveform(sine_waveform(ChannelId(1), 1e3, 1.0, 1e-6, 2_000));
    let runtime = runtime_with(driver, config());
    let mut events = runtime.engine().subscribe();

    let handle = runtime
        .run_template("waveform_capture_analyze", &BTreeMap::new())
        .unwrap();

    let progress = timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.unwrap();
            if event.run == handle && event.kind == ProgressKind::ScriptProgress {
                return event.progress;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(progress, Some(1.0));

    let result = runtime.engine().wait_for(handle).await.unwrap();
    assert_eq!(result.status, RunStatus::Completed);
    assert!(result.measurement("frequency").is_some());
}

#[tokio::test]
async fn running_script_can_be_cancelled() {
    let runtime = runtime_with(MockDriver::new(), config());
    let script = Script::new("forever", "loop { wait(10); }");
    let mut events = runtime.engine().subscribe();

    let handle = runtime.run(&script, &BTreeMap::new()).unwrap();
    timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.unwrap();
            if event.run == handle && event.kind == ProgressKind::Started {
                break;
            }
        }
    })
    .await
    .unwrap();
    runtime.engine().cancel(handle).unwrap();

    let result = runtime.engine().wait_for(handle).await.unwrap();
    assert_eq!(result.status, RunStatus::Cancelled);
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert!(runtime.engine().driver().is_available());
}

#[tokio::test]
async fn busy_loop_hits_operation_limit() {
    let mut config = config();
    config.script.max_operations = 1_000;
    let runtime = runtime_with(MockDriver::new(), config);
    let script = Script::new("spin", "let x = 0; loop { x += 1; }");

    let result = runtime
        .engine()
        .wait_for(runtime.run(&script, &BTreeMap::new()).unwrap())
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    let error = result.error.unwrap();
    assert_eq!(error.kind, ErrorKind::Script);
    assert!(error.message.contains("Safety limit exceeded"), "{}", error.message);
}

#[tokio::test]
async fn instrument_errors_fail_the_script_run() {
    let runtime = runtime_with(MockDriver::new(), config());
    let script = Script::new("no signal", "measure(\"rms\", 3)");

    let result = runtime
        .engine()
        .wait_for(runtime.run(&script, &BTreeMap::new()).unwrap())
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.error.unwrap().kind, ErrorKind::Instrument);
}

#[tokio::test]
async fn syntax_errors_are_reported_before_queueing() {
    let runtime = runtime_with(MockDriver::new(), config());
    let err = runtime
        .run(&Script::new("broken", "let x = ;"), &BTreeMap::new())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Script);
    assert!(runtime.engine().history().is_empty());
}

#[tokio::test]
async fn custom_script_parameters_are_visible_as_constants() {
    let runtime = runtime_with(MockDriver::new(), config());
    let script = Script::new("scaled", "record(\"scaled\", gain * 1.5); gain")
        .with_parameter(ParameterSpec::new("gain", ParameterType::Float).with_range(Some(0.0), Some(10.0)));

    let result = runtime
        .engine()
        .wait_for(runtime.run(&script, &params(&[("gain", ParameterValue::Int(4))])).unwrap())
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.measurement("scaled"), Some(6.0));
    assert_eq!(result.return_value.as_deref(), Some("4.0"));
}

#[test]
fn instantiated_templates_are_private_copies() {
    let mut library = scope_automation::script::TemplateLibrary::builtin();
    let mut copy = library.instantiate("frequency_sweep").unwrap();
    copy.source.push_str("\n// local edit");
    copy.parameters.clear();

    let original = library.get("frequency_sweep").unwrap();
    assert_ne!(original.source, copy.source);
    assert_eq!(original.parameters.len(), 6);
    assert_ne!(original.id, copy.id);

    library.register(Script::new("frequency_sweep", "0"));
    assert!(copy.source.contains("local edit"));
}
