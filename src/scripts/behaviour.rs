use std::sync::Arc;

use anyhow::Result;
use rhai::{CallFnOptions, Dynamic, Map, Scope, FLOAT};

use super::{entity_to_int, ScriptApi, ScriptEngine, ScriptError, ScriptUnit, UnitCache};
use crate::binder::BehaviourFactory;
use crate::native::EntityId;
use crate::scheduler::{Behaviour, BehaviourContext};

/// A behaviour defined by a script exposing any of `start(engine, entity)`,
/// `update(engine, entity, dt)` and `dispose(engine, entity)`. Each instance keeps its own
/// `this` map across calls.
pub struct ScriptedBehaviour {
    unit: Arc<ScriptUnit>,
    engine: Arc<ScriptEngine>,
    api: ScriptApi,
    state: Dynamic,
    entity: Option<EntityId>,
    has_start: bool,
    has_update: bool,
    has_dispose: bool,
}

impl ScriptedBehaviour {
    pub fn new(unit: Arc<ScriptUnit>, engine: Arc<ScriptEngine>, api: ScriptApi) -> Self {
        let defines = |name: &str| unit.ast.iter_functions().any(|f| f.name == name);
        let (has_start, has_update, has_dispose) = (defines("start"), defines("update"), defines("dispose"));
        Self {
            unit,
            engine,
            api,
            state: Dynamic::from_map(Map::new()),
            entity: None,
            has_start,
            has_update,
            has_dispose,
        }
    }

    pub fn unit_name(&self) -> &str {
        &self.unit.name
    }

    pub fn state(&self) -> &Dynamic {
        &self.state
    }

    fn call(&mut self, name: &str, args: impl rhai::FuncArgs) -> Result<()> {
        let mut scope = Scope::new();
        let options = CallFnOptions::new().eval_ast(false).rewind_scope(true).bind_this_ptr(&mut self.state);
        self.engine
            .rhai()
            .call_fn_with_options::<Dynamic>(options, &mut scope, &self.unit.ast, name, args)
            .map(|_| ())
            .map_err(|err| {
                ScriptError::Eval { unit: format!("{}::{name}", self.unit.name), message: err.to_string() }.into()
            })
    }
}

impl Behaviour for ScriptedBehaviour {
    fn attach(&mut self, entity: EntityId) {
        self.entity = Some(entity);
    }

    fn start(&mut self, ctx: &BehaviourContext<'_>) -> Result<()> {
        self.entity = Some(ctx.entity);
        if !self.has_start {
            return Ok(());
        }
        let args = (self.api.clone(), entity_to_int(ctx.entity));
        self.call("start", args)
    }

    fn update(&mut self, ctx: &BehaviourContext<'_>, dt: f32) -> Result<()> {
        if !self.has_update {
            return Ok(());
        }
        let args = (self.api.clone(), entity_to_int(ctx.entity), dt as FLOAT);
        self.call("update", args)
    }

    fn dispose(&mut self) {
        let (true, Some(entity)) = (self.has_dispose, self.entity) else {
            return;
        };
        let args = (self.api.clone(), entity_to_int(entity));
        if let Err(err) = self.call("dispose", args) {
            tracing::error!(target: "script", unit = %self.unit.name, %entity, "{err:#}");
        }
    }
}

/// Resolves script names against the behaviour library's active set.
pub struct ScriptBehaviourFactory {
    library: Arc<UnitCache>,
    api: ScriptApi,
}

impl ScriptBehaviourFactory {
    pub fn new(library: Arc<UnitCache>, api: ScriptApi) -> Self {
        Self { library, api }
    }
}

impl BehaviourFactory for ScriptBehaviourFactory {
    fn create(&self, script_name: &str) -> Option<Box<dyn Behaviour>> {
        let unit = self.library.get(script_name)?;
        let engine = Arc::clone(self.library.compiler().engine());
        Some(Box::new(ScriptedBehaviour::new(unit, engine, self.api.clone())))
    }
}
