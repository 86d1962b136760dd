use std::sync::Arc;

use rand::Rng;
use rhai::{Array, Dynamic, Engine, FLOAT, INT};

use super::ScriptLog;
use crate::native::{EntityId, NativeEngine};

/// The `engine` value scripts receive. Every call degrades to `()`, `false` or `-1` on failure
/// after logging; nothing here raises into the script.
#[derive(Clone)]
pub struct ScriptApi {
    native: Arc<dyn NativeEngine>,
    logs: ScriptLog,
}

impl ScriptApi {
    pub fn new(native: Arc<dyn NativeEngine>, logs: ScriptLog) -> Self {
        Self { native, logs }
    }

    pub fn native(&self) -> &Arc<dyn NativeEngine> {
        &self.native
    }

    fn log(&mut self, message: &str) {
        tracing::info!(target: "script", "{message}");
        self.logs.push(message);
    }

    fn warn(&mut self, message: &str) {
        tracing::warn!(target: "script", "{message}");
        self.logs.push(format!("warn: {message}"));
    }

    fn entities(&mut self) -> Array {
        match self.native.live_entities(usize::MAX) {
            Ok(list) => list.into_iter().map(|entity| Dynamic::from_int(entity_to_int(entity))).collect(),
            Err(err) => {
                tracing::warn!(target: "native", "entities(): {err}");
                Array::new()
            }
        }
    }

    fn is_alive(&mut self, entity: INT) -> bool {
        entity_from_int(entity).is_some_and(|entity| self.native.is_alive(entity))
    }

    fn create_entity(&mut self) -> INT {
        match self.native.create_entity() {
            Ok(entity) => entity_to_int(entity),
            Err(err) => {
                tracing::warn!(target: "native", "create_entity(): {err}");
                -1
            }
        }
    }

    fn destroy_entity(&mut self, entity: INT) -> bool {
        let Some(entity) = entity_from_int(entity) else {
            return false;
        };
        match self.native.destroy_entity(entity) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(target: "native", %entity, "destroy_entity(): {err}");
                false
            }
        }
    }

    fn get_component(&mut self, entity: INT, component: &str) -> Dynamic {
        let Some(entity) = entity_from_int(entity) else {
            return Dynamic::UNIT;
        };
        let json = match self.native.component_json(entity, component) {
            Ok(Some(json)) => json,
            Ok(None) => return Dynamic::UNIT,
            Err(err) => {
                tracing::warn!(target: "native", %entity, component, "get_component(): {err}");
                return Dynamic::UNIT;
            }
        };
        let value = match serde_json::from_str::<serde_json::Value>(&json) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(target: "native", %entity, component, "component payload is not JSON: {err}");
                return Dynamic::UNIT;
            }
        };
        rhai::serde::to_dynamic(value).unwrap_or_else(|err| {
            tracing::warn!(target: "script", %entity, component, "component not representable in scripts: {err}");
            Dynamic::UNIT
        })
    }

    fn set_component(&mut self, entity: INT, component: &str, value: Dynamic) -> bool {
        let Some(entity) = entity_from_int(entity) else {
            return false;
        };
        let json = match rhai::serde::from_dynamic::<serde_json::Value>(&value) {
            Ok(json) => json.to_string(),
            Err(err) => {
                tracing::warn!(
                    target: "script",
                    %entity,
                    component,
                    "set_component() value is not serializable: {err}"
                );
                return false;
            }
        };
        match self.native.set_component_json(entity, component, &json) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(target: "native", %entity, component, "set_component(): {err}");
                false
            }
        }
    }

    fn get_script_data(&mut self, entity: INT, key: &str) -> Dynamic {
        let Some(entity) = entity_from_int(entity) else {
            return Dynamic::UNIT;
        };
        match self.native.script_data(entity, key) {
            Ok(Some(value)) => Dynamic::from(value),
            Ok(None) => Dynamic::UNIT,
            Err(err) => {
                tracing::warn!(target: "native", %entity, key, "get_script_data(): {err}");
                Dynamic::UNIT
            }
        }
    }

    fn set_script_data(&mut self, entity: INT, key: &str, value: &str) -> bool {
        let Some(entity) = entity_from_int(entity) else {
            return false;
        };
        match self.native.set_script_data(entity, key, value) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(target: "native", %entity, key, "set_script_data(): {err}");
                false
            }
        }
    }

    fn remove_script_data(&mut self, entity: INT, key: &str) -> bool {
        let Some(entity) = entity_from_int(entity) else {
            return false;
        };
        match self.native.remove_script_data(entity, key) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(target: "native", %entity, key, "remove_script_data(): {err}");
                false
            }
        }
    }

    fn random_range(&mut self, min: FLOAT, max: FLOAT) -> FLOAT {
        if !(min < max) {
            return min;
        }
        rand::thread_rng().gen_range(min..max)
    }
}

/// Scripts see entities as plain integers; `-1` (and any negative value) means "no entity".
pub fn entity_from_int(value: INT) -> Option<EntityId> {
    if value < 0 {
        None
    } else {
        Some(EntityId(value as u64))
    }
}

pub fn entity_to_int(entity: EntityId) -> INT {
    entity.to_bits() as INT
}

pub(super) fn register_api(engine: &mut Engine) {
    engine.register_type_with_name::<ScriptApi>("Engine");
    engine.register_fn("log", ScriptApi::log);
    engine.register_fn("warn", ScriptApi::warn);
    engine.register_fn("entities", ScriptApi::entities);
    engine.register_fn("is_alive", ScriptApi::is_alive);
    engine.register_fn("create_entity", ScriptApi::create_entity);
    engine.register_fn("destroy_entity", ScriptApi::destroy_entity);
    engine.register_fn("get_component", ScriptApi::get_component);
    engine.register_fn("set_component", ScriptApi::set_component);
    engine.register_fn("get_script_data", ScriptApi::get_script_data);
    engine.register_fn("set_script_data", ScriptApi::set_script_data);
    engine.register_fn("remove_script_data", ScriptApi::remove_script_data);
    engine.register_fn("rand", ScriptApi::random_range);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessEngine;
    use crate::scripts::ScriptEngine;
    use rhai::Scope;

    fn eval<T: std::any::Any + Send + Sync + Clone>(engine: &ScriptEngine, api: ScriptApi, script: &str) -> T {
        let mut scope = Scope::new();
        scope.push("engine", api);
        engine.rhai().eval_with_scope::<T>(&mut scope, script).expect("script should evaluate")
    }

    #[test]
    fn script_data_and_components_roundtrip() {
        let native = Arc::new(HeadlessEngine::new());
        let entity = native.spawn();
        let engine = ScriptEngine::new();
        let api = engine.api(native.clone());
        let id = entity_to_int(entity);

        let ok: bool = eval(&engine, api.clone(), &format!(r#"engine.set_script_data({id}, "mood", "calm")"#));
        assert!(ok);
        let mood: String = eval(&engine, api.clone(), &format!(r#"engine.get_script_data({id}, "mood")"#));
        assert_eq!(mood, "calm");

        let ok: bool =
            eval(&engine, api.clone(), &format!(r#"engine.set_component({id}, "Health", #{{ hp: 4 }})"#));
        assert!(ok);
        let hp: INT = eval(&engine, api, &format!(r#"engine.get_component({id}, "Health").hp"#));
        assert_eq!(hp, 4);
    }

    #[test]
    fn failures_degrade_to_defaults() {
        let native = Arc::new(HeadlessEngine::new());
        let entity = native.spawn();
        native.fail_key("secret");
        let engine = ScriptEngine::new();
        let api = engine.api(native.clone());
        let id = entity_to_int(entity);

        let missing: bool = eval(&engine, api.clone(), &format!(r#"engine.get_script_data({id}, "secret") == ()"#));
        assert!(missing);
        let ok: bool = eval(&engine, api.clone(), r#"engine.set_script_data(-1, "k", "v")"#);
        assert!(!ok);
        let ok: bool = eval(&engine, api, &format!(r#"engine.remove_script_data({id}, "secret")"#));
        assert!(!ok);
    }

    #[test]
    fn log_lines_are_captured() {
        let native = Arc::new(HeadlessEngine::new());
        let engine = ScriptEngine::new();
        let api = engine.api(native);
        let _: () = eval(&engine, api, r#"engine.log("hello"); print("printed");"#);
        assert_eq!(engine.take_logs(), vec!["hello".to_string(), "printed".to_string()]);
        assert!(engine.logs().is_empty());
    }
}
