//! CLI entry point for scope_automation.
//!
//! Runs persisted sequences and Rhai scripts against a mock instrument, lists the
//! built-in script templates and validates persisted documents.
//!
//! # Usage
//!
//! ```bash
//! scope_automation run-sequence sequence.json
//! scope_automation run-script sweep.rhai --param num_points=5 --param channel=2
//! scope_automation run-script --template basic_measurement --param measurement_type=rms
//! scope_automation templates
//! scope_automation validate trigger_set.json
//! scope_automation config > scope_automation.toml
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use scope_automation::config::AutomationConfig;
use scope_automation::engine::{ExecutionResult, RunStatus, SequenceEngine};
use scope_automation::instrument::mock::{sine_waveform, MockDriver};
use scope_automation::instrument::{ChannelId, SharedDriver};
use scope_automation::logging;
use scope_automation::persistence::{self, DocumentKind};
use scope_automation::script::{Script, ScriptRuntime, TemplateLibrary};
use scope_automation::sequence::{ParameterValue, Sequence};
use scope_automation::sync::ChannelGroup;
use scope_automation::trigger::TriggerSet;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "scope_automation")]
#[command(about = "Oscilloscope sequence, trigger and script automation", long_about = None)]
struct Cli {
    /// Configuration file (defaults to scope_automation.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a persisted sequence document against the mock instrument
    RunSequence {
        /// Path to a sequence document
        file: PathBuf,
        /// Optional trigger set document registered before the run
        #[arg(long)]
        triggers: Option<PathBuf>,
    },

    /// Run a Rhai script (source file, script document or built-in template)
    RunScript {
        /// Path to a .rhai source file or a script document
        file: Option<PathBuf>,
        /// Run a built-in template instead of a file
        #[arg(long, conflicts_with = "file")]
        template: Option<String>,
        /// Script parameter as name=value (repeatable)
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, ParameterValue)>,
    },

    /// List the built-in script templates
    Templates,

    /// Check that a persisted document loads
    Validate {
        /// Path to a document
        file: PathBuf,
    },

    /// Print the effective configuration as TOML
    Config,
}

fn parse_param(raw: &str) -> Result<(String, ParameterValue), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{}'", raw))?;
    let value = if let Ok(v) = value.parse::<i64>() {
        ParameterValue::Int(v)
    } else if let Ok(v) = value.parse::<f64>() {
        ParameterValue::Float(v)
    } else if let Ok(v) = value.parse::<bool>() {
        ParameterValue::Bool(v)
    } else {
        ParameterValue::Text(value.to_string())
    };
    Ok((name.trim().to_string(), value))
}

fn load_config(path: Option<PathBuf>) -> Result<AutomationConfig> {
    let config = match path {
        Some(path) => AutomationConfig::load_from(&path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => AutomationConfig::load().context("loading configuration")?,
    };
    Ok(config)
}

/// A mock instrument serving a 1 kHz sine on every channel.
fn mock_engine(config: AutomationConfig) -> Result<SequenceEngine> {
    let driver = MockDriver::new();
    for n in 1..=config.limits.channel_count {
        driver.set_waveform(sine_waveform(ChannelId(n), 1_000.0, f64::from(n), 1e-6, 10_000));
    }
    Ok(SequenceEngine::new(config, SharedDriver::new(driver))?)
}

fn print_result(result: &ExecutionResult) {
    println!("Run {} ({}) finished: {}", result.run, result.source.name(), result.status);
    for outcome in &result.outcomes {
        match &outcome.message {
            Some(message) => println!(
                "  [{:>3}] {:<40} {:?} ({:?}): {}",
                outcome.index, outcome.label, outcome.status, outcome.duration, message
            ),
            None => println!(
                "  [{:>3}] {:<40} {:?} ({:?})",
                outcome.index, outcome.label, outcome.status, outcome.duration
            ),
        }
    }
    for line in &result.log {
        println!("  log: {}", line);
    }
    for (key, value) in &result.measurements {
        println!("  {} = {}", key, value);
    }
    if let Some(value) = &result.return_value {
        println!("  returned: {}", value);
    }
    if let Some(error) = &result.error {
        println!("  error ({}): {}", error.kind, error.message);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config)?;
    logging::init(&config.logging)?;

    match cli.command {
        Commands::RunSequence { file, triggers } => run_sequence(config, file, triggers).await,
        Commands::RunScript {
            file,
            template,
            params,
        } => run_script(config, file, template, params).await,
        Commands::Templates => {
            for template in TemplateLibrary::builtin().list() {
                println!("{} ({:?}): {}", template.name, template.kind, template.description);
                for param in &template.parameters {
                    let default = param
                        .default
                        .as_ref()
                        .map(|d| format!(" = {}", d))
                        .unwrap_or_default();
                    println!("    {}: {}{}  {}", param.name, param.kind, default, param.description);
                }
            }
            Ok(())
        }
        Commands::Validate { file } => validate(file),
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

async fn run_sequence(config: AutomationConfig, file: PathBuf, triggers: Option<PathBuf>) -> Result<()> {
    let sequence: Sequence =
        persistence::load(&file).with_context(|| format!("loading sequence {}", file.display()))?;
    let engine = mock_engine(config)?;
    if let Some(path) = triggers {
        let set: TriggerSet =
            persistence::load(&path).with_context(|| format!("loading triggers {}", path.display()))?;
        engine.set_triggers(set);
    }

    let handle = engine.submit(&sequence)?;
    info!("Submitted sequence '{}' as {}", sequence.name, handle);
    let result = engine.wait_for(handle).await?;
    print_result(&result);
    engine.shutdown().await?;

    if result.status != RunStatus::Completed {
        bail!("sequence finished as {}", result.status);
    }
    Ok(())
}

async fn run_script(
    config: AutomationConfig,
    file: Option<PathBuf>,
    template: Option<String>,
    params: Vec<(String, ParameterValue)>,
) -> Result<()> {
    let engine = mock_engine(config)?;
    let runtime = ScriptRuntime::new(engine.clone());
    let params: BTreeMap<String, ParameterValue> = params.into_iter().collect();

    let script = match (file, template) {
        (_, Some(name)) => runtime.templates().instantiate(&name)?,
        (Some(path), None) => {
            if path.extension().is_some_and(|ext| ext == "json") {
                persistence::load::<Script, _>(&path)?
            } else {
                let source = tokio::fs::read_to_string(&path)
                    .await
                    .with_context(|| format!("reading {}", path.display()))?;
                let name = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "script".to_string());
                Script::new(name, source)
            }
        }
        (None, None) => bail!("either a script file or --template is required"),
    };

    let handle = runtime.run(&script, &params)?;
    let result = engine.wait_for(handle).await?;
    print_result(&result);
    engine.shutdown().await?;

    if result.status != RunStatus::Completed {
        bail!("script finished as {}", result.status);
    }
    Ok(())
}

fn validate(file: PathBuf) -> Result<()> {
    let json = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
    let envelope: serde_json::Value = serde_json::from_str(&json).context("parsing document")?;
    let kind: DocumentKind = serde_json::from_value(envelope.get("kind").cloned().unwrap_or_default())
        .context("reading document kind")?;
    match kind {
        DocumentKind::Sequence => {
            let sequence: Sequence = persistence::from_json(&json)?;
            println!("OK: sequence '{}' with {} steps", sequence.name, sequence.len());
        }
        DocumentKind::TriggerSet => {
            let set: TriggerSet = persistence::from_json(&json)?;
            println!("OK: trigger set '{}' with {} triggers", set.name, set.len());
        }
        DocumentKind::ChannelGroup => {
            let group: ChannelGroup = persistence::from_json(&json)?;
            println!("OK: channel group {} ({} channels)", group.id, group.channels.len());
        }
        DocumentKind::Script => {
            let script: Script = persistence::from_json(&json)?;
            scope_automation::script::compile(&script.source)?;
            println!("OK: script '{}' with {} parameters", script.name, script.parameters.len());
        }
    }
    Ok(())
}
