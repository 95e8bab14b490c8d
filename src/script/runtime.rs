//! Script preparation and submission.
use super::{validate_parameters, Script, TemplateLibrary};
use crate::engine::{RunHandle, SequenceEngine};
use crate::error::{AppResult, AutomationError};
use crate::sequence::ParameterValue;
use rhai::{Engine, AST};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// A script ready to run: parameters validated and source compiled.
#[derive(Debug, Clone)]
pub struct PreparedScript {
    pub script: Script,
    pub ast: Arc<AST>,
    pub params: BTreeMap<String, ParameterValue>,
}

/// Rhai engine with the symbol restrictions shared by compilation and execution.
pub(crate) fn base_engine() -> Engine {
    let mut engine = Engine::new();
    engine.disable_symbol("eval");
    engine.set_max_expr_depths(64, 32);
    engine
}

/// Compiles Rhai source.
///
/// # Errors
///
/// [`AutomationError::Script`] describing the first syntax error.
pub fn compile(source: &str) -> AppResult<AST> {
    base_engine()
        .compile(source)
        .map_err(|e| AutomationError::Script(format!("Syntax error: {}", e)))
}

/// Runs scripts on a [`SequenceEngine`], sharing its queue and driver lease.
pub struct ScriptRuntime {
    engine: SequenceEngine,
    templates: TemplateLibrary,
}

impl ScriptRuntime {
    pub fn new(engine: SequenceEngine) -> Self {
        Self {
            engine,
            templates: TemplateLibrary::builtin(),
        }
    }

    pub fn engine(&self) -> &SequenceEngine {
        &self.engine
    }

    pub fn templates(&self) -> &TemplateLibrary {
        &self.templates
    }

    pub fn templates_mut(&mut self) -> &mut TemplateLibrary {
        &mut self.templates
    }

    /// Validates `parameters` and compiles the source without queueing anything.
    pub fn prepare(&self, script: &Script, parameters: &BTreeMap<String, ParameterValue>) -> AppResult<PreparedScript> {
        let channel_count = self.engine.config().limits.channel_count;
        let params = validate_parameters(&script.parameters, parameters, channel_count)?;
        let ast = compile(&script.source)?;
        Ok(PreparedScript {
            script: script.clone(),
            ast: Arc::new(ast),
            params,
        })
    }

    /// Prepares and queues a private copy of `script`.
    ///
    /// # Errors
    ///
    /// [`AutomationError::ParameterValidation`] or [`AutomationError::Script`] before
    /// anything reaches the instrument.
    pub fn run(&self, script: &Script, parameters: &BTreeMap<String, ParameterValue>) -> AppResult<RunHandle> {
        let prepared = self.prepare(script, parameters)?;
        let handle = self.engine.submit_prepared(prepared)?;
        info!("Script '{}' submitted as {}.", script.name, handle);
        Ok(handle)
    }

    /// Instantiates a template and runs the copy.
    pub fn run_template(&self, name: &str, parameters: &BTreeMap<String, ParameterValue>) -> AppResult<RunHandle> {
        let script = self.templates.instantiate(name)?;
        self.run(&script, parameters)
    }
}
