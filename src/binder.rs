use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use smallvec::SmallVec;
use thiserror::Error;

use crate::events::lock;
use crate::guard::isolate;
use crate::native::{EntityId, NativeEngine, NativeError};
use crate::scheduler::{Behaviour, Scheduler};

/// Structured declaration: `{"scripts": ["door", "patrol"]}`.
pub const SCRIPT_COMPONENT_KEY: &str = "ScriptComponent";
/// Older raw declaration: `["door", "patrol"]`.
pub const LEGACY_SCRIPTS_KEY: &str = "scripts";
pub const DEFAULT_MAX_BIND_ENTITIES: usize = 4096;

pub type ScriptNames = SmallVec<[String; 4]>;

pub trait BehaviourFactory: Send + Sync {
    fn create(&self, script_name: &str) -> Option<Box<dyn Behaviour>>;
}

impl<F> BehaviourFactory for F
where
    F: Fn(&str) -> Option<Box<dyn Behaviour>> + Send + Sync,
{
    fn create(&self, script_name: &str) -> Option<Box<dyn Behaviour>> {
        self(script_name)
    }
}

/// Asks each factory in order and returns the first match.
#[derive(Default, Clone)]
pub struct FactoryChain {
    factories: Vec<Arc<dyn BehaviourFactory>>,
}

impl FactoryChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, factory: Arc<dyn BehaviourFactory>) -> Self {
        self.factories.push(factory);
        self
    }

    pub fn push(&mut self, factory: Arc<dyn BehaviourFactory>) {
        self.factories.push(factory);
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl BehaviourFactory for FactoryChain {
    fn create(&self, script_name: &str) -> Option<Box<dyn Behaviour>> {
        self.factories.iter().find_map(|factory| factory.create(script_name))
    }
}

#[derive(Debug, Error)]
pub enum BindError {
    #[error("enumerating live entities failed: {0}")]
    Enumerate(#[source] NativeError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindReport {
    pub scanned: usize,
    pub attached: usize,
    pub already_bound: usize,
    pub unresolved: Vec<(EntityId, String)>,
    pub pruned: usize,
    pub truncated: bool,
}

#[derive(Deserialize)]
struct ScriptComponent {
    #[serde(default)]
    scripts: Vec<String>,
}

/// Reads the script names an entity declares, preferring the structured key. Read failures are
/// logged and treated as "nothing declared" for that key.
pub fn declared_scripts(engine: &dyn NativeEngine, entity: EntityId) -> ScriptNames {
    let structured = read_key(engine, entity, SCRIPT_COMPONENT_KEY).and_then(|json| {
        match serde_json::from_str::<ScriptComponent>(&json) {
            Ok(component) => Some(component.scripts),
            Err(err) => {
                tracing::warn!(
                    target: "binder",
                    %entity,
                    key = SCRIPT_COMPONENT_KEY,
                    "malformed script declaration: {err}"
                );
                None
            }
        }
    });
    let names = structured.or_else(|| {
        read_key(engine, entity, LEGACY_SCRIPTS_KEY).and_then(|json| match serde_json::from_str::<Vec<String>>(&json) {
            Ok(names) => Some(names),
            Err(err) => {
                tracing::warn!(
                    target: "binder",
                    %entity,
                    key = LEGACY_SCRIPTS_KEY,
                    "malformed script declaration: {err}"
                );
                None
            }
        })
    });
    let mut out = ScriptNames::new();
    for name in names.unwrap_or_default() {
        let name = name.trim();
        if !name.is_empty() && !out.iter().any(|existing| existing == name) {
            out.push(name.to_string());
        }
    }
    out
}

fn read_key(engine: &dyn NativeEngine, entity: EntityId, key: &str) -> Option<String> {
    match engine.script_data(entity, key) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(target: "native", %entity, key, "reading script data failed: {err}");
            None
        }
    }
}

/// Attaches declared behaviours to live entities. Safe to call any number of times.
pub struct EntityScriptBinder {
    engine: Arc<dyn NativeEngine>,
    scheduler: Arc<Scheduler>,
    factory: Arc<dyn BehaviourFactory>,
    max_entities: usize,
    pass: Mutex<()>,
}

impl EntityScriptBinder {
    pub fn new(engine: Arc<dyn NativeEngine>, scheduler: Arc<Scheduler>, factory: Arc<dyn BehaviourFactory>) -> Self {
        Self { engine, scheduler, factory, max_entities: DEFAULT_MAX_BIND_ENTITIES, pass: Mutex::new(()) }
    }

    pub fn with_max_entities(mut self, max_entities: usize) -> Self {
        self.max_entities = max_entities.max(1);
        self
    }

    pub fn max_entities(&self) -> usize {
        self.max_entities
    }

    pub fn bind_all(&self) -> Result<BindReport, BindError> {
        let _pass = lock(&self.pass);
        let entities = self.engine.live_entities(self.max_entities).map_err(BindError::Enumerate)?;
        let mut report = BindReport {
            scanned: entities.len(),
            truncated: entities.len() >= self.max_entities,
            ..Default::default()
        };
        let mut bound: HashSet<(EntityId, String)> = self.scheduler.bindings().into_iter().collect();

        for &entity in &entities {
            for name in declared_scripts(self.engine.as_ref(), entity) {
                let key = (entity, name);
                if bound.contains(&key) {
                    report.already_bound += 1;
                    continue;
                }
                let (entity, name) = key;
                let created = match isolate(|| Ok(self.factory.create(&name))) {
                    Ok(created) => created,
                    Err(fault) => {
                        tracing::error!(target: "binder", %entity, script = %name, "behaviour factory failed: {fault}");
                        None
                    }
                };
                let Some(behaviour) = created else {
                    tracing::warn!(target: "binder", %entity, script = %name, "unresolved behaviour reference");
                    report.unresolved.push((entity, name));
                    continue;
                };
                match self.scheduler.register_behaviour(entity, name.clone(), behaviour) {
                    Some(_) => report.attached += 1,
                    None => report.already_bound += 1,
                }
                bound.insert((entity, name));
            }
        }

        if report.truncated {
            tracing::warn!(
                target: "binder",
                cap = self.max_entities,
                "entity snapshot hit the cap; skipping orphan pruning"
            );
        } else {
            let live: HashSet<EntityId> = entities.iter().copied().collect();
            let orphans: BTreeSet<EntityId> =
                bound.iter().map(|(entity, _)| *entity).filter(|entity| !live.contains(entity)).collect();
            for entity in orphans {
                report.pruned += self.scheduler.purge_entity(entity);
            }
        }

        tracing::debug!(
            target: "binder",
            scanned = report.scanned,
            attached = report.attached,
            already_bound = report.already_bound,
            unresolved = report.unresolved.len(),
            pruned = report.pruned,
            "bind pass complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessEngine;
    use crate::scheduler::BehaviourContext;
    use anyhow::Result;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Noop;

    impl Behaviour for Noop {
        fn update(&mut self, _ctx: &BehaviourContext<'_>, _dt: f32) -> Result<()> {
            Ok(())
        }
    }

    fn setup() -> (Arc<HeadlessEngine>, Arc<Scheduler>, Arc<AtomicUsize>, EntityScriptBinder) {
        let engine = Arc::new(HeadlessEngine::new());
        let scheduler = Arc::new(Scheduler::new(engine.clone()));
        let created = Arc::new(AtomicUsize::new(0));
        let counter = created.clone();
        let factory = move |name: &str| -> Option<Box<dyn Behaviour>> {
            if name == "ghost" {
                return None;
            }
            counter.fetch_add(1, Ordering::SeqCst);
            Some(Box::new(Noop))
        };
        let binder = EntityScriptBinder::new(engine.clone(), scheduler.clone(), Arc::new(factory));
        (engine, scheduler, created, binder)
    }

    #[test]
    fn prefers_structured_declaration() {
        let engine = HeadlessEngine::new();
        let both = engine.spawn_with_script_data([
            (SCRIPT_COMPONENT_KEY, r#"{"scripts":["door","door"," patrol "]}"#.to_string()),
            (LEGACY_SCRIPTS_KEY, r#"["legacy"]"#.to_string()),
        ]);
        let legacy = engine.spawn_with_script_data([(LEGACY_SCRIPTS_KEY, r#"["legacy"]"#.to_string())]);
        let broken = engine.spawn_with_script_data([
            (SCRIPT_COMPONENT_KEY, "{oops".to_string()),
            (LEGACY_SCRIPTS_KEY, r#"["fallback"]"#.to_string()),
        ]);
        assert_eq!(declared_scripts(&engine, both).as_slice(), &["door".to_string(), "patrol".to_string()]);
        assert_eq!(declared_scripts(&engine, legacy).as_slice(), &["legacy".to_string()]);
        assert_eq!(declared_scripts(&engine, broken).as_slice(), &["fallback".to_string()]);
        assert!(declared_scripts(&engine, engine.spawn()).is_empty());
    }

    #[test]
    fn second_pass_adds_nothing() {
        let (engine, scheduler, created, binder) = setup();
        engine.spawn_with_script_data([(LEGACY_SCRIPTS_KEY, r#"["door","patrol"]"#.to_string())]);
        engine.spawn_with_script_data([(SCRIPT_COMPONENT_KEY, r#"{"scripts":["door"]}"#.to_string())]);

        let first = binder.bind_all().unwrap();
        assert_eq!(first.attached, 3);
        let second = binder.bind_all().unwrap();
        assert_eq!(second.attached, 0);
        assert_eq!(second.already_bound, 3);
        assert_eq!(scheduler.behaviour_count(), 3);
        assert_eq!(created.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn unresolved_names_are_reported_not_fatal() {
        let (engine, scheduler, _created, binder) = setup();
        let entity = engine.spawn_with_script_data([(LEGACY_SCRIPTS_KEY, r#"["ghost","door"]"#.to_string())]);
        let report = binder.bind_all().unwrap();
        assert_eq!(report.unresolved, vec![(entity, "ghost".to_string())]);
        assert_eq!(report.attached, 1);
        assert!(scheduler.has_binding(entity, "door"));
    }

    #[test]
    fn native_read_failures_skip_the_entity() {
        let (engine, scheduler, _created, binder) = setup();
        engine.spawn_with_script_data([(LEGACY_SCRIPTS_KEY, r#"["door"]"#.to_string())]);
        engine.fail_key(LEGACY_SCRIPTS_KEY);
        let report = binder.bind_all().unwrap();
        assert_eq!(report.attached, 0);
        assert_eq!(scheduler.behaviour_count(), 0);

        engine.clear_failures();
        assert_eq!(binder.bind_all().unwrap().attached, 1);
    }

    #[test]
    fn destroyed_entities_are_pruned() {
        let (engine, scheduler, _created, binder) = setup();
        let doomed = engine.spawn_with_script_data([(LEGACY_SCRIPTS_KEY, r#"["door"]"#.to_string())]);
        let survivor = engine.spawn_with_script_data([(LEGACY_SCRIPTS_KEY, r#"["door"]"#.to_string())]);
        binder.bind_all().unwrap();
        engine.destroy_entity(doomed).unwrap();

        let report = binder.bind_all().unwrap();
        assert_eq!(report.pruned, 1);
        assert_eq!(scheduler.bindings(), vec![(survivor, "door".to_string())]);
    }

    #[test]
    fn capped_snapshot_skips_pruning() {
        let (engine, scheduler, _created, binder) = setup();
        for _ in 0..3 {
            engine.spawn_with_script_data([(LEGACY_SCRIPTS_KEY, r#"["door"]"#.to_string())]);
        }
        binder.bind_all().unwrap();
        let capped = EntityScriptBinder::new(engine.clone(), scheduler.clone(), Arc::new(FactoryChain::new()))
            .with_max_entities(2);
        let report = capped.bind_all().unwrap();
        assert!(report.truncated);
        assert_eq!(report.pruned, 0);
        assert_eq!(scheduler.behaviour_count(), 3);
    }

    #[test]
    fn factory_chain_falls_through() {
        let none = |_: &str| -> Option<Box<dyn Behaviour>> { None };
        let some = |name: &str| -> Option<Box<dyn Behaviour>> {
            (name == "door").then(|| Box::new(Noop) as Box<dyn Behaviour>)
        };
        let chain = FactoryChain::new().with(Arc::new(none)).with(Arc::new(some));
        assert_eq!(chain.len(), 2);
        assert!(chain.create("door").is_some());
        assert!(chain.create("window").is_none());
    }
}
