use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::binder::{FactoryChain, LEGACY_SCRIPTS_KEY, SCRIPT_COMPONENT_KEY};
use crate::config::RuntimeConfig;
use crate::events::LogicTick;
use crate::headless::HeadlessEngine;
use crate::native::{EntityId, NativeEngine};
use crate::runtime::{EngineContext, ScriptRuntime};

/// A headless scene: script roots on disk, entities with declared behaviours and a tick count.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HarnessFixture {
    /// Directory holding `scripts/`, `behaviours/`, `quests/` and `encounters/`. Relative paths
    /// are resolved against the fixture file.
    #[serde(default = "default_root")]
    pub root: PathBuf,
    #[serde(default = "default_ticks")]
    pub ticks: u64,
    #[serde(default = "default_dt")]
    pub dt: f32,
    #[serde(default)]
    pub entities: Vec<FixtureEntity>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FixtureEntity {
    pub name: String,
    #[serde(default)]
    pub scripts: Vec<String>,
    #[serde(default)]
    pub legacy_scripts: Vec<String>,
    #[serde(default)]
    pub script_data: BTreeMap<String, String>,
    #[serde(default)]
    pub components: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HarnessOutput {
    pub ticks: u64,
    pub dt: f32,
    pub units: Vec<String>,
    pub behaviours: Vec<String>,
    pub results: Vec<TickResult>,
    pub bindings: Vec<BindingSummary>,
    pub rebind: RebindSummary,
    pub quests: Vec<String>,
    pub encounters: Vec<String>,
    pub final_entities: Vec<EntitySummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TickResult {
    pub tick: u64,
    pub logs: Vec<String>,
}

/// Entities are reported by their index in the fixture.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BindingSummary {
    pub entity: usize,
    pub script: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RebindSummary {
    pub attached: usize,
    pub already_bound: usize,
    pub unresolved: Vec<BindingSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntitySummary {
    pub entity: usize,
    pub name: String,
    pub script_data: BTreeMap<String, String>,
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

const fn default_ticks() -> u64 {
    1
}

const fn default_dt() -> f32 {
    1.0 / 60.0
}

pub fn load_fixture<P: AsRef<Path>>(path: P) -> Result<HarnessFixture> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("opening fixture '{}'", path.display()))?;
    let mut fixture: HarnessFixture = serde_json::from_reader(file).with_context(|| "parsing fixture JSON")?;
    if fixture.root.is_relative() {
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        fixture.root = base.join(&fixture.root);
    }
    Ok(fixture)
}

/// Config pointing every root at the fixture directory, with hot reload off.
pub fn fixture_config(fixture: &HarnessFixture) -> RuntimeConfig {
    RuntimeConfig {
        script_root: fixture.root.join("scripts"),
        behaviour_root: fixture.root.join("behaviours"),
        quest_root: fixture.root.join("quests"),
        encounter_root: fixture.root.join("encounters"),
        hot_reload: false,
        ..RuntimeConfig::default()
    }
}

pub fn run_fixture(fixture: &HarnessFixture) -> Result<HarnessOutput> {
    run_fixture_with_config(fixture, fixture_config(fixture))
}

pub fn run_fixture_with_config(fixture: &HarnessFixture, config: RuntimeConfig) -> Result<HarnessOutput> {
    let native = Arc::new(HeadlessEngine::with_tick_interval(fixture.dt));
    let mut indices: HashMap<EntityId, usize> = HashMap::new();
    let mut spawned = Vec::with_capacity(fixture.entities.len());
    for (index, entity) in fixture.entities.iter().enumerate() {
        let id = spawn_entity(&native, entity).with_context(|| format!("spawning fixture entity '{}'", entity.name))?;
        indices.insert(id, index);
        spawned.push(id);
    }

    let context = EngineContext::new(native.clone());
    let runtime = ScriptRuntime::new(Arc::clone(&context), config, FactoryChain::new())?;
    runtime.initialize()?;
    let units = runtime.scripts().snapshot().names().into_iter().map(str::to_string).collect();
    let behaviours = runtime.behaviours().snapshot().names().into_iter().map(str::to_string).collect();
    // Content scripts may log while loading.
    runtime.take_logs();

    let mut results = Vec::with_capacity(fixture.ticks as usize);
    for tick in 0..fixture.ticks {
        context.bridge().publish(&LogicTick { index: tick });
        results.push(TickResult { tick, logs: runtime.take_logs() });
    }

    let summarize = |entity: EntityId, script: String| BindingSummary {
        entity: indices.get(&entity).copied().unwrap_or(usize::MAX),
        script,
    };
    let report = runtime.bind_all()?;
    let rebind = RebindSummary {
        attached: report.attached,
        already_bound: report.already_bound,
        unresolved: report.unresolved.into_iter().map(|(entity, script)| summarize(entity, script)).collect(),
    };
    let bindings =
        runtime.scheduler().bindings().into_iter().map(|(entity, script)| summarize(entity, script)).collect();

    let final_entities = fixture
        .entities
        .iter()
        .zip(&spawned)
        .enumerate()
        .map(|(index, (entity, id))| EntitySummary {
            entity: index,
            name: entity.name.clone(),
            script_data: native.script_data_entries(*id),
        })
        .collect();

    let output = HarnessOutput {
        ticks: fixture.ticks,
        dt: fixture.dt,
        units,
        behaviours,
        results,
        bindings,
        rebind,
        quests: runtime.quests().ids(),
        encounters: runtime.encounters().ids(),
        final_entities,
    };
    runtime.shutdown();
    Ok(output)
}

/// Runs the configured roots with no entities, for checking a content tree from the command line.
pub fn run_roots(config: RuntimeConfig, ticks: u64) -> Result<HarnessOutput> {
    let fixture = HarnessFixture { root: default_root(), ticks, dt: default_dt(), entities: Vec::new() };
    run_fixture_with_config(&fixture, config)
}

fn spawn_entity(native: &HeadlessEngine, entity: &FixtureEntity) -> Result<EntityId> {
    let id = native.spawn();
    native.set_script_data(id, "name", &entity.name)?;
    for (key, value) in &entity.script_data {
        native.set_script_data(id, key, value)?;
    }
    if !entity.legacy_scripts.is_empty() {
        native.set_script_data(id, LEGACY_SCRIPTS_KEY, &serde_json::to_string(&entity.legacy_scripts)?)?;
    }
    if !entity.scripts.is_empty() {
        let declaration = serde_json::json!({ "scripts": entity.scripts });
        native.set_script_data(id, SCRIPT_COMPONENT_KEY, &declaration.to_string())?;
    }
    for (component, value) in &entity.components {
        native.set_component_json(id, component, &value.to_string())?;
    }
    Ok(id)
}
