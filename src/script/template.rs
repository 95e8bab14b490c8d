//! Built-in and user-registered script templates.
//!
//! Templates are stored as complete [`Script`] values. [`TemplateLibrary::instantiate`]
//! hands out a deep copy with a fresh id, so editing or replacing a template never
//! changes a script that was already created from it.

use super::{ParameterSpec, ParameterType, Script, ScriptKind};
use crate::error::{AppResult, AutomationError};
use std::collections::BTreeMap;
use tracing::debug;
use uuid::Uuid;

const BASIC_MEASUREMENT: &str = r#"// Basic measurement on one channel.
log(`Starting ${measurement_type} measurement on ch${channel}`);

let value = measure(measurement_type, channel);
record("result", value);

log(`Measurement result: ${value}`);
value
"#;

const FREQUENCY_SWEEP: &str = r#"// Steps the source frequency and measures the amplitude at each point.
log(`Starting frequency sweep from ${start_frequency} to ${stop_frequency} Hz`);

let step = (stop_frequency - start_frequency) / (num_points - 1);
let amplitudes = [];

for i in 0..num_points {
    if check_stop() {
        break;
    }
    let frequency = start_frequency + step * i;
    set_parameter(frequency_target, frequency);
    wait(settle_ms);

    let amplitude = measure("amplitude", channel);
    record(`amplitude_${i}`, amplitude);
    amplitudes.push(amplitude);

    set_progress((i + 1) * 100 / num_points);
}

log("Frequency sweep completed");
amplitudes.len()
"#;

const WAVEFORM_CAPTURE_ANALYZE: &str = r#"// Captures one record and reports its time-domain characteristics.
log(`Acquiring waveform from ch${channel}`);
let records = acquire([channel]);
log(`Acquired ${records} record(s)`);

let mean = measure("mean", channel);
let rms = measure("rms", channel);
let peak_to_peak = measure("peak_to_peak", channel);
record("mean", mean);
record("rms", rms);
record("peak_to_peak", peak_to_peak);
log(`Mean: ${mean} V, RMS: ${rms} V, Pk-Pk: ${peak_to_peak} V`);

if analyze_frequency {
    try {
        let frequency = measure("frequency", channel);
        record("frequency", frequency);
        log(`Dominant frequency: ${frequency} Hz`);
    } catch (err) {
        log(`No periodic signal found: ${err}`);
    }
}
set_progress(100);
rms
"#;

/// Named script templates.
#[derive(Debug, Clone, Default)]
pub struct TemplateLibrary {
    templates: BTreeMap<String, Script>,
}

impl TemplateLibrary {
    /// Empty library.
    pub fn new() -> Self {
        Self::default()
    }

    /// Library holding `basic_measurement`, `frequency_sweep` and
    /// `waveform_capture_analyze`.
    pub fn builtin() -> Self {
        let mut library = Self::new();

        library.register(
            Script::new("basic_measurement", BASIC_MEASUREMENT)
                .with_kind(ScriptKind::Measurement)
                .with_description("Perform one measurement on a channel")
                .with_tags(["builtin", "measurement"])
                .with_parameter(
                    ParameterSpec::new("channel", ParameterType::Channel)
                        .with_default(1i64)
                        .with_description("Channel to measure"),
                )
                .with_parameter(
                    ParameterSpec::new("measurement_type", ParameterType::String)
                        .with_default("amplitude")
                        .with_choices(["amplitude", "frequency", "period", "rms", "mean", "peak_to_peak"])
                        .with_description("Type of measurement"),
                ),
        );

        library.register(
            Script::new("frequency_sweep", FREQUENCY_SWEEP)
                .with_kind(ScriptKind::Automation)
                .with_description("Measure amplitude across a frequency range")
                .with_tags(["builtin", "sweep"])
                .with_parameter(
                    ParameterSpec::new("start_frequency", ParameterType::Float)
                        .with_default(100.0)
                        .with_range(Some(1.0), None)
                        .with_description("Start frequency (Hz)"),
                )
                .with_parameter(
                    ParameterSpec::new("stop_frequency", ParameterType::Float)
                        .with_default(10_000.0)
                        .with_range(Some(1.0), None)
                        .with_description("Stop frequency (Hz)"),
                )
                .with_parameter(
                    ParameterSpec::new("num_points", ParameterType::Int)
                        .with_default(10i64)
                        .with_range(Some(2.0), Some(1000.0))
                        .with_description("Number of measurement points"),
                )
                .with_parameter(
                    ParameterSpec::new("channel", ParameterType::Channel)
                        .with_default(1i64)
                        .with_description("Channel to measure"),
                )
                .with_parameter(
                    ParameterSpec::new("frequency_target", ParameterType::String)
                        .with_default("FREQ")
                        .with_description("Instrument setting that selects the source frequency"),
                )
                .with_parameter(
                    ParameterSpec::new("settle_ms", ParameterType::Int)
                        .with_default(100i64)
                        .with_range(Some(0.0), Some(60_000.0))
                        .with_description("Settling time after each frequency change (ms)"),
                ),
        );

        library.register(
            Script::new("waveform_capture_analyze", WAVEFORM_CAPTURE_ANALYZE)
                .with_kind(ScriptKind::Analysis)
                .with_description("Acquire a waveform and analyze it")
                .with_tags(["builtin", "analysis"])
                .with_parameter(
                    ParameterSpec::new("channel", ParameterType::Channel)
                        .with_default(1i64)
                        .with_description("Channel to analyze"),
                )
                .with_parameter(
                    ParameterSpec::new("analyze_frequency", ParameterType::Bool)
                        .with_default(true)
                        .with_description("Also measure the dominant frequency"),
                ),
        );

        library
    }

    /// Adds or replaces a template, keyed by the script's name.
    pub fn register(&mut self, template: Script) {
        debug!("Added template: {}", template.name);
        self.templates.insert(template.name.clone(), template);
    }

    pub fn get(&self, name: &str) -> Option<&Script> {
        self.templates.get(name)
    }

    /// Templates sorted by name.
    pub fn list(&self) -> impl Iterator<Item = &Script> {
        self.templates.values()
    }

    pub fn list_kind(&self, kind: ScriptKind) -> impl Iterator<Item = &Script> {
        self.templates.values().filter(move |t| t.kind == kind)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Deep copy of a template with a fresh id.
    pub fn instantiate(&self, name: &str) -> AppResult<Script> {
        let mut script = self
            .templates
            .get(name)
            .cloned()
            .ok_or_else(|| AutomationError::Configuration(format!("Unknown script template '{}'", name)))?;
        script.id = Uuid::new_v4();
        Ok(script)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::compile;

    #[test]
    fn test_builtin_templates_compile() {
        let library = TemplateLibrary::builtin();
        assert_eq!(library.len(), 3);
        for template in library.list() {
            assert!(compile(&template.source).is_ok(), "{} failed to compile", template.name);
        }
    }

    #[test]
    fn test_instances_are_independent_copies() {
        let mut library = TemplateLibrary::builtin();
        let instance = library.instantiate("basic_measurement").unwrap();
        let template_id = library.get("basic_measurement").unwrap().id;
        assert_ne!(instance.id, template_id);

        let mut edited = library.get("basic_measurement").unwrap().clone();
        edited.source = "42".to_string();
        library.register(edited);
        assert_ne!(instance.source, "42");
        assert_eq!(library.instantiate("basic_measurement").unwrap().source, "42");
    }

    #[test]
    fn test_unknown_template() {
        let library = TemplateLibrary::builtin();
        assert!(library.instantiate("nope").is_err());
        assert_eq!(library.list_kind(ScriptKind::Analysis).count(), 1);
    }
}
