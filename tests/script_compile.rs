use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use kestrel_scripting::binder::FactoryChain;
use kestrel_scripting::config::RuntimeConfig;
use kestrel_scripting::events::LogicTick;
use kestrel_scripting::headless::HeadlessEngine;
use kestrel_scripting::scripts::{ScriptCompiler, ScriptEngine, ScriptError};
use kestrel_scripting::watch::RootKind;
use kestrel_scripting::{EngineContext, RuntimeError, ScriptRuntime};
use tempfile::tempdir;

fn config(root: &Path) -> RuntimeConfig {
    let mut config = RuntimeConfig { hot_reload: false, ..RuntimeConfig::default() };
    config.resolve_roots(root);
    config
}

fn write_abc(root: &Path) {
    fs::create_dir_all(root).unwrap();
    fs::write(root.join("A.rhai"), r#"engine.log("A ran at " + tick);"#).unwrap();
    fs::write(root.join("B.rhai"), "fn broken( { let = ; }").unwrap();
    fs::write(root.join("C.rhai"), r#"engine.log("C ran");"#).unwrap();
}

#[test]
fn one_bad_file_leaves_the_other_units_active() {
    let dir = tempdir().unwrap();
    write_abc(dir.path());
    let compiler = ScriptCompiler::new(Arc::new(ScriptEngine::new()), "rhai");
    let report = compiler.compile_all(dir.path(), None).expect("root is readable");
    assert_eq!(report.set.names(), vec!["A", "C"]);
    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].path.ends_with("B.rhai"));
    assert!(matches!(report.failures[0].error, ScriptError::Compile { .. }));
}

#[test]
fn both_valid_units_run_on_the_next_tick() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path());
    write_abc(&cfg.script_root);
    let context = EngineContext::new(Arc::new(HeadlessEngine::new()));
    let runtime = ScriptRuntime::new(Arc::clone(&context), cfg, FactoryChain::new()).unwrap();
    runtime.initialize().unwrap();

    context.bridge().publish(&LogicTick { index: 1 });
    assert_eq!(runtime.take_logs(), vec!["A ran at 1".to_string(), "C ran".to_string()]);
}

#[test]
fn unreadable_root_keeps_the_previous_units() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path());
    write_abc(&cfg.script_root);
    let script_root = cfg.script_root.clone();
    let context = EngineContext::new(Arc::new(HeadlessEngine::new()));
    let runtime = ScriptRuntime::new(Arc::clone(&context), cfg, FactoryChain::new()).unwrap();
    runtime.initialize().unwrap();

    fs::remove_dir_all(&script_root).unwrap();
    let err = runtime.reload_root(RootKind::Scripts).unwrap_err();
    assert!(matches!(err, RuntimeError::Script(ScriptError::Root { .. })));

    context.bridge().publish(&LogicTick { index: 2 });
    assert_eq!(runtime.take_logs(), vec!["A ran at 2".to_string(), "C ran".to_string()]);
}

#[test]
fn edits_take_effect_after_the_root_is_recompiled() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path());
    write_abc(&cfg.script_root);
    let script_root = cfg.script_root.clone();
    let context = EngineContext::new(Arc::new(HeadlessEngine::new()));
    let runtime = ScriptRuntime::new(Arc::clone(&context), cfg, FactoryChain::new()).unwrap();
    runtime.initialize().unwrap();

    fs::write(script_root.join("B.rhai"), r#"engine.log("B fixed");"#).unwrap();
    fs::write(script_root.join("C.rhai"), r#"engine.log("C changed");"#).unwrap();
    assert_eq!(runtime.handle_path_changed(script_root.join("B.rhai")), Some(RootKind::Scripts));
    assert_eq!(runtime.scripts().snapshot().names(), vec!["A", "B", "C"]);

    context.bridge().publish(&LogicTick { index: 3 });
    assert_eq!(
        runtime.take_logs(),
        vec!["A ran at 3".to_string(), "B fixed".to_string(), "C changed".to_string()]
    );
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(25));
    }
    done()
}

/// Writes outside the root and renames in, so the watcher never sees a half-written file.
fn drop_in(staging: &Path, root: &Path, name: &str, source: &str) {
    let staged = staging.join(format!("{name}.staged"));
    fs::write(&staged, source).unwrap();
    fs::rename(&staged, root.join(name)).unwrap();
}

fn watched_runtime(dir: &Path) -> (Arc<EngineContext>, ScriptRuntime, RuntimeConfig) {
    let cfg = RuntimeConfig { hot_reload: true, watch_poll_interval_ms: 25, ..config(dir) };
    fs::create_dir_all(&cfg.script_root).unwrap();
    fs::write(cfg.script_root.join("A.rhai"), r#"engine.log("A ran");"#).unwrap();
    let context = EngineContext::new(Arc::new(HeadlessEngine::new()));
    let runtime = ScriptRuntime::new(Arc::clone(&context), cfg.clone(), FactoryChain::new()).unwrap();
    runtime.initialize().unwrap();
    (context, runtime, cfg)
}

#[test]
fn polled_watcher_picks_up_a_new_unit() {
    let dir = tempdir().unwrap();
    let (context, runtime, cfg) = watched_runtime(dir.path());
    drop_in(dir.path(), &cfg.script_root, "late.rhai", r#"engine.log("late ran");"#);

    let reported = wait_until(Duration::from_secs(10), || runtime.poll_watcher().contains(&RootKind::Scripts));
    assert!(reported, "watcher never reported the scripts root");
    assert_eq!(runtime.scripts().snapshot().names(), vec!["A", "late"]);

    context.bridge().publish(&LogicTick { index: 1 });
    assert_eq!(runtime.take_logs(), vec!["A ran".to_string(), "late ran".to_string()]);
}

#[test]
fn background_hot_reload_swaps_the_active_set() {
    let dir = tempdir().unwrap();
    let (context, runtime, cfg) = watched_runtime(dir.path());
    let runtime = Arc::new(runtime);
    let mut reloader = runtime.spawn_hot_reload().unwrap().expect("hot reload is enabled");
    assert!(reloader.is_running());
    assert!(runtime.spawn_hot_reload().unwrap().is_none());

    drop_in(dir.path(), &cfg.script_root, "A.rhai", r#"engine.log("A edited");"#);
    let swapped = wait_until(Duration::from_secs(10), || {
        context.bridge().publish(&LogicTick { index: 0 });
        runtime.take_logs() == vec!["A edited".to_string()]
    });
    reloader.stop();
    assert!(swapped, "edited unit never became active");
    assert!(!reloader.is_running());
}

#[test]
fn ticks_never_observe_a_partial_set() {
    const UNITS: usize = 24;
    let dir = tempdir().unwrap();
    let cfg = config(dir.path());
    fs::create_dir_all(&cfg.script_root).unwrap();
    let write_version = |version: &str| {
        for index in 0..UNITS {
            let source = format!(r#"engine.log("{version}");"#);
            fs::write(cfg.script_root.join(format!("unit_{index:02}.rhai")), source).unwrap();
        }
    };
    write_version("old");
    let context = EngineContext::new(Arc::new(HeadlessEngine::new()));
    let runtime = ScriptRuntime::new(Arc::clone(&context), cfg.clone(), FactoryChain::new()).unwrap();
    runtime.initialize().unwrap();
    write_version("new");

    let mut seen = Vec::new();
    thread::scope(|scope| {
        let reload = scope.spawn(|| runtime.reload_root(RootKind::Scripts));
        let mut tick = 0;
        while !reload.is_finished() {
            context.bridge().publish(&LogicTick { index: tick });
            seen.push(runtime.take_logs());
            tick += 1;
        }
        reload.join().unwrap().unwrap();
        context.bridge().publish(&LogicTick { index: tick });
        seen.push(runtime.take_logs());
    });

    for logs in &seen {
        assert_eq!(logs.len(), UNITS);
        assert!(logs.iter().all(|line| line == &logs[0]), "tick mixed two unit sets: {logs:?}");
    }
    assert_eq!(seen.last().unwrap()[0], "new");
}
