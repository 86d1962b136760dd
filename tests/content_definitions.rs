use std::fs;
use std::sync::Arc;

use glam::IVec2;
use kestrel_scripting::binder::FactoryChain;
use kestrel_scripting::config::RuntimeConfig;
use kestrel_scripting::headless::HeadlessEngine;
use kestrel_scripting::watch::RootKind;
use kestrel_scripting::{EngineContext, ScriptRuntime};
use tempfile::tempdir;

fn runtime_in(dir: &std::path::Path) -> (RuntimeConfig, ScriptRuntime) {
    let mut config = RuntimeConfig { hot_reload: false, ..RuntimeConfig::default() };
    config.resolve_roots(dir);
    fs::create_dir_all(&config.quest_root).unwrap();
    fs::create_dir_all(&config.encounter_root).unwrap();
    let context = EngineContext::new(Arc::new(HeadlessEngine::new()));
    let runtime = ScriptRuntime::new(context, config.clone(), FactoryChain::new()).unwrap();
    (config, runtime)
}

#[test]
fn quests_and_encounters_load_at_initialize() {
    let dir = tempdir().unwrap();
    let (config, runtime) = runtime_in(dir.path());
    fs::write(
        config.quest_root.join("a_smith.rhai"),
        r#"#{ kind: "quest", id: "rescue_the_smith", title: "Rescue the smith", objectives: ["find", "escort"] }"#,
    )
    .unwrap();
    fs::write(config.quest_root.join("b_copy.rhai"), r#"#{ kind: "quest", id: "rescue_the_smith" }"#).unwrap();
    fs::write(config.quest_root.join("c_blank.rhai"), r#"#{ kind: "quest", id: "" }"#).unwrap();
    fs::write(
        config.encounter_root.join("bats.rhai"),
        r#"
        let region = #{ min: [0, 0], max: [8, 6] };
        #{ kind: "encounter", id: "cave_bats", enemies: ["bat", "bat"], min_level: 2, tile_region: region }
        "#,
    )
    .unwrap();
    fs::write(config.encounter_root.join("number.rhai"), "42").unwrap();

    runtime.initialize().unwrap();

    assert_eq!(runtime.quests().ids(), vec!["rescue_the_smith".to_string()]);
    let quest = runtime.quests().get("rescue_the_smith").unwrap();
    assert_eq!(quest.title, "Rescue the smith");
    assert_eq!(quest.objectives.len(), 2);

    assert_eq!(runtime.encounters().len(), 1);
    let bats = runtime.encounters().get("cave_bats").unwrap();
    assert_eq!(bats.min_level, 2);
    let region = bats.tile_region.unwrap();
    assert!(region.contains(IVec2::new(8, 6)));
    assert!(!region.contains(IVec2::new(9, 0)));
}

#[test]
fn edited_content_is_picked_up_after_a_path_change() {
    let dir = tempdir().unwrap();
    let (config, runtime) = runtime_in(dir.path());
    let quest = config.quest_root.join("smith.rhai");
    fs::write(&quest, r#"#{ kind: "quest", id: "rescue_the_smith" }"#).unwrap();
    runtime.initialize().unwrap();
    assert_eq!(runtime.quests().len(), 1);

    fs::write(config.quest_root.join("herbs.rhai"), r#"#{ kind: "quest", id: "gather_herbs", title: "Herbs" }"#)
        .unwrap();
    fs::write(&quest, r#"#{ kind: "quest", id: "rescue_the_smith", title: "Updated" }"#).unwrap();
    assert_eq!(runtime.handle_path_changed(&quest), Some(RootKind::Quests));

    assert_eq!(runtime.quests().ids(), vec!["gather_herbs".to_string(), "rescue_the_smith".to_string()]);
    assert_eq!(runtime.quests().get("rescue_the_smith").unwrap().title, "Updated");
    assert!(runtime.encounters().is_empty());
}

#[test]
fn removed_root_keeps_published_definitions() {
    let dir = tempdir().unwrap();
    let (config, runtime) = runtime_in(dir.path());
    fs::write(config.encounter_root.join("wolves.rhai"), r#"#{ kind: "encounter", id: "wolves" }"#).unwrap();
    runtime.initialize().unwrap();
    assert_eq!(runtime.encounters().ids(), vec!["wolves".to_string()]);

    fs::remove_dir_all(&config.encounter_root).unwrap();
    assert!(runtime.reload_root(RootKind::Encounters).is_err());
    assert_eq!(runtime.encounters().ids(), vec!["wolves".to_string()]);
}
