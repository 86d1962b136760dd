use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use kestrel_scripting::binder::{FactoryChain, SCRIPT_COMPONENT_KEY};
use kestrel_scripting::config::RuntimeConfig;
use kestrel_scripting::events::LogicTick;
use kestrel_scripting::headless::HeadlessEngine;
use kestrel_scripting::native::NativeEngine;
use kestrel_scripting::scheduler::{Behaviour, BehaviourContext};
use kestrel_scripting::{EngineContext, ScriptRuntime};
use tempfile::tempdir;

const LAMP: &str = r#"
fn start(engine, entity) {
    engine.log("lamp lit for " + engine.get_script_data(entity, "name"));
}

fn update(engine, entity, dt) {
    if "ticks" in this { this.ticks += 1; } else { this.ticks = 1; }
    engine.set_script_data(entity, "lamp_ticks", this.ticks.to_string());
}
"#;

const TORCH: &str = r#"
fn dispose(engine, entity) {
    engine.log("torch out for " + engine.get_script_data(entity, "name"));
}
"#;

#[derive(Default)]
struct Counters {
    created: AtomicUsize,
    updates: AtomicUsize,
    disposed: AtomicUsize,
}

struct NativeDoor(Arc<Counters>);

impl Behaviour for NativeDoor {
    fn update(&mut self, _ctx: &BehaviourContext<'_>, _dt: f32) -> Result<()> {
        self.0.updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn dispose(&mut self) {
        self.0.disposed.fetch_add(1, Ordering::SeqCst);
    }
}

struct Scene {
    native: Arc<HeadlessEngine>,
    context: Arc<EngineContext>,
    runtime: ScriptRuntime,
    counters: Arc<Counters>,
    _dir: tempfile::TempDir,
}

fn scene(declarations: &[(&str, &str)]) -> Scene {
    let dir = tempdir().unwrap();
    let mut config = RuntimeConfig { hot_reload: false, ..RuntimeConfig::default() };
    config.resolve_roots(dir.path());
    fs::create_dir_all(&config.behaviour_root).unwrap();
    fs::write(config.behaviour_root.join("lamp.rhai"), LAMP).unwrap();
    fs::write(config.behaviour_root.join("torch.rhai"), TORCH).unwrap();
    // A script named like the host factory's behaviour; the host wins.
    fs::write(config.behaviour_root.join("door.rhai"), r#"fn start(engine, entity) { engine.log("script door"); }"#)
        .unwrap();

    let native = Arc::new(HeadlessEngine::new());
    for (name, scripts) in declarations {
        let entity = native.spawn();
        native.set_script_data(entity, "name", name).unwrap();
        native.set_script_data(entity, SCRIPT_COMPONENT_KEY, scripts).unwrap();
    }

    let counters = Arc::new(Counters::default());
    let door_counters = Arc::clone(&counters);
    let host = FactoryChain::new().with(Arc::new(move |name: &str| -> Option<Box<dyn Behaviour>> {
        if name != "door" {
            return None;
        }
        door_counters.created.fetch_add(1, Ordering::SeqCst);
        Some(Box::new(NativeDoor(Arc::clone(&door_counters))))
    }));

    let context = EngineContext::new(native.clone());
    let runtime = ScriptRuntime::new(Arc::clone(&context), config, host).unwrap();
    runtime.initialize().unwrap();
    Scene { native, context, runtime, counters, _dir: dir }
}

#[test]
fn declared_behaviours_attach_once_and_start_once() {
    let scene = scene(&[("hall", r#"{"scripts":["door","lamp","ghost"]}"#)]);
    assert_eq!(scene.runtime.scheduler().behaviour_count(), 2);
    assert_eq!(scene.counters.created.load(Ordering::SeqCst), 1);

    let again = scene.runtime.bind_all().unwrap();
    assert_eq!(again.attached, 0);
    assert_eq!(again.already_bound, 2);
    assert_eq!(again.unresolved.len(), 1);
    assert_eq!(scene.counters.created.load(Ordering::SeqCst), 1);

    for index in 0..5 {
        scene.context.bridge().publish(&LogicTick { index });
    }
    assert_eq!(scene.runtime.take_logs(), vec!["lamp lit for hall".to_string()]);
    assert_eq!(scene.counters.updates.load(Ordering::SeqCst), 5);
    let entity = scene.native.live_entities(8).unwrap()[0];
    assert_eq!(scene.native.script_data(entity, "lamp_ticks").unwrap().as_deref(), Some("5"));
}

#[test]
fn reload_scene_disposes_and_rebinds() {
    let scene = scene(&[("hall", r#"{"scripts":["door","lamp"]}"#)]);
    scene.context.bridge().publish(&LogicTick { index: 0 });
    assert_eq!(scene.runtime.take_logs().len(), 1);

    let report = scene.runtime.reload_scene().unwrap();
    assert_eq!(report.attached, 2);
    assert_eq!(scene.counters.disposed.load(Ordering::SeqCst), 1);
    assert_eq!(scene.counters.created.load(Ordering::SeqCst), 2);

    scene.context.bridge().publish(&LogicTick { index: 1 });
    assert_eq!(scene.runtime.take_logs(), vec!["lamp lit for hall".to_string()]);
}

#[test]
fn destroyed_entities_lose_their_behaviours() {
    let scene = scene(&[("hall", r#"{"scripts":["door"]}"#), ("porch", r#"{"scripts":["lamp"]}"#)]);
    assert_eq!(scene.runtime.scheduler().behaviour_count(), 2);
    let hall = scene.native.live_entities(8).unwrap()[0];
    scene.native.destroy_entity(hall).unwrap();

    let report = scene.runtime.bind_all().unwrap();
    assert_eq!(report.pruned, 1);
    assert_eq!(scene.counters.disposed.load(Ordering::SeqCst), 1);
    assert_eq!(scene.runtime.scheduler().bindings().len(), 1);
    assert_eq!(scene.runtime.scheduler().bindings()[0].1, "lamp");
}

#[test]
fn shutdown_disposes_every_behaviour_once() {
    let scene = scene(&[("hall", r#"{"scripts":["door"]}"#)]);
    assert!(scene.runtime.shutdown());
    assert!(!scene.runtime.shutdown());
    assert_eq!(scene.counters.disposed.load(Ordering::SeqCst), 1);
    assert!(!scene.context.is_claimed(), "shutdown should release the engine context");
}

#[test]
fn script_dispose_runs_even_without_a_tick() {
    let scene = scene(&[("hall", r#"{"scripts":["torch"]}"#), ("porch", r#"{"scripts":["torch"]}"#)]);
    assert_eq!(scene.runtime.scheduler().purge_behaviours(), 2);
    assert_eq!(
        scene.runtime.take_logs(),
        vec!["torch out for hall".to_string(), "torch out for porch".to_string()]
    );

    scene.runtime.bind_all().unwrap();
    let porch = scene.native.live_entities(8).unwrap()[1];
    scene.native.set_script_data(porch, "name", "back porch").unwrap();
    assert!(scene.runtime.shutdown());
    assert_eq!(
        scene.runtime.take_logs(),
        vec!["torch out for hall".to_string(), "torch out for back porch".to_string()]
    );
}
