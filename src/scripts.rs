mod api;
mod behaviour;
mod compiler;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use rhai::Engine;
use thiserror::Error;

use crate::events::lock;
use crate::native::NativeEngine;

pub use api::{entity_from_int, entity_to_int, ScriptApi};
pub use behaviour::{ScriptBehaviourFactory, ScriptedBehaviour};
pub use compiler::{
    CompileFailure, CompileReport, CompiledSet, ScriptCompiler, ScriptUnit, ScriptUnitRunner, UnitCache, UnitRunStats,
};

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("script root '{}' is not readable: {source}", .path.display())]
    Root {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("reading '{}': {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("compiling '{}': {message}", .path.display())]
    Compile { path: PathBuf, message: String },
    #[error("evaluating '{unit}': {message}")]
    Eval { unit: String, message: String },
}

/// Lines emitted by scripts through `log`, `warn` or `print`, kept until drained.
#[derive(Clone, Default)]
pub struct ScriptLog {
    lines: Arc<Mutex<Vec<String>>>,
}

impl ScriptLog {
    pub fn push(&self, line: impl Into<String>) {
        lock(&self.lines).push(line.into());
    }

    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *lock(&self.lines))
    }

    pub fn len(&self) -> usize {
        lock(&self.lines).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The single Rhai engine shared by compilation and execution so both agree on the registered API.
pub struct ScriptEngine {
    engine: Engine,
    logs: ScriptLog,
}

impl ScriptEngine {
    pub fn new() -> Self {
        Self::with_log(ScriptLog::default())
    }

    pub fn with_log(logs: ScriptLog) -> Self {
        let mut engine = Engine::new();
        engine.set_fast_operators(true);
        let sink = logs.clone();
        engine.on_print(move |text| {
            tracing::info!(target: "script", "{text}");
            sink.push(text);
        });
        api::register_api(&mut engine);
        Self { engine, logs }
    }

    pub fn rhai(&self) -> &Engine {
        &self.engine
    }

    pub fn logs(&self) -> &ScriptLog {
        &self.logs
    }

    pub fn take_logs(&self) -> Vec<String> {
        self.logs.take()
    }

    pub fn api(&self, native: Arc<dyn NativeEngine>) -> ScriptApi {
        ScriptApi::new(native, self.logs.clone())
    }
}

impl Default for ScriptEngine {
    fn default() -> Self {
        Self::new()
    }
}
