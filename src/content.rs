use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use glam::IVec2;
use rhai::{Dynamic, Map, Scope};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::guard::{isolate, Fault};
use crate::scripts::{CompiledSet, ScriptApi, ScriptError, ScriptUnit, UnitCache};

/// A definition produced by evaluating a content script once. The script's last expression must
/// be an object map whose `kind` field equals [`ContentDefinition::KIND`].
pub trait ContentDefinition: DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: &'static str;

    fn id(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestDefinition {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub objectives: Vec<String>,
}

impl ContentDefinition for QuestDefinition {
    const KIND: &'static str = "quest";

    fn id(&self) -> &str {
        &self.id
    }
}

/// Inclusive tile rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileRegion {
    pub min: [i32; 2],
    pub max: [i32; 2],
}

impl TileRegion {
    pub fn contains(&self, tile: IVec2) -> bool {
        let (min, max) = (IVec2::from(self.min), IVec2::from(self.max));
        tile.cmpge(min).all() && tile.cmple(max).all()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncounterDefinition {
    pub id: String,
    #[serde(default)]
    pub enemies: Vec<String>,
    #[serde(default)]
    pub min_level: u32,
    #[serde(default)]
    pub tile_region: Option<TileRegion>,
}

impl ContentDefinition for EncounterDefinition {
    const KIND: &'static str = "encounter";

    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Error)]
pub enum ContentError {
    #[error(transparent)]
    Eval(#[from] ScriptError),
    #[error("'{unit}' panicked: {message}")]
    Panicked { unit: String, message: String },
    #[error("'{unit}' did not return an object map")]
    NotAnObject { unit: String },
    #[error("'{unit}' declares kind '{found}', expected '{expected}'")]
    WrongKind { unit: String, expected: &'static str, found: String },
    #[error("'{unit}' is not a valid {kind}: {message}")]
    Invalid { unit: String, kind: &'static str, message: String },
    #[error("'{unit}' has an empty id")]
    EmptyId { unit: String },
    #[error("'{unit}' redefines '{id}'")]
    DuplicateId { unit: String, id: String },
}

#[derive(Debug, Default)]
pub struct ContentReport {
    pub loaded: usize,
    pub skipped: Vec<ContentError>,
}

/// Evaluates every unit of a content root once and publishes the resulting definitions as a whole.
pub struct ContentLoader<D> {
    cache: Arc<UnitCache>,
    api: ScriptApi,
    loaded: RwLock<Arc<Vec<D>>>,
}

impl<D: ContentDefinition> ContentLoader<D> {
    pub fn new(cache: Arc<UnitCache>, api: ScriptApi) -> Self {
        Self { cache, api, loaded: RwLock::new(Arc::new(Vec::new())) }
    }

    pub fn cache(&self) -> &Arc<UnitCache> {
        &self.cache
    }

    /// Recompiles the root and reloads definitions. When the root is unreadable the previously
    /// loaded definitions stay published.
    pub fn reload(&self) -> Result<ContentReport, ScriptError> {
        let set = self.cache.reload()?;
        Ok(self.load_from(&set))
    }

    pub fn load_from(&self, set: &CompiledSet) -> ContentReport {
        let mut report = ContentReport::default();
        let mut seen = HashSet::new();
        let mut definitions = Vec::with_capacity(set.len());
        for unit in set.units() {
            let outcome = self.evaluate(unit).and_then(|definition| {
                if seen.insert(definition.id().to_string()) {
                    Ok(definition)
                } else {
                    Err(ContentError::DuplicateId { unit: unit.name.clone(), id: definition.id().to_string() })
                }
            });
            match outcome {
                Ok(definition) => definitions.push(definition),
                Err(err) => {
                    tracing::warn!(target: "content", kind = D::KIND, "skipping {err}");
                    report.skipped.push(err);
                }
            }
        }
        report.loaded = definitions.len();
        let published = Arc::new(definitions);
        match self.loaded.write() {
            Ok(mut guard) => *guard = published,
            Err(poisoned) => *poisoned.into_inner() = published,
        }
        tracing::info!(
            target: "content",
            kind = D::KIND,
            loaded = report.loaded,
            skipped = report.skipped.len(),
            "content loaded"
        );
        report
    }

    pub fn definitions(&self) -> Arc<Vec<D>> {
        match self.loaded.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn get(&self, id: &str) -> Option<D> {
        self.definitions().iter().find(|definition| definition.id() == id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        self.definitions().iter().map(|definition| definition.id().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.definitions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evaluate(&self, unit: &ScriptUnit) -> Result<D, ContentError> {
        let engine = self.cache.compiler().engine();
        let value = isolate(|| {
            let mut scope = Scope::new();
            scope.push("engine", self.api.clone());
            engine
                .rhai()
                .eval_ast_with_scope::<Dynamic>(&mut scope, &unit.ast)
                .map_err(|err| {
                    anyhow::Error::new(ScriptError::Eval { unit: unit.name.clone(), message: err.to_string() })
                })
        })
        .map_err(|fault| match fault {
            Fault::Error(err) => match err.downcast::<ScriptError>() {
                Ok(script) => ContentError::Eval(script),
                Err(other) => ContentError::Panicked { unit: unit.name.clone(), message: other.to_string() },
            },
            Fault::Panic(message) => ContentError::Panicked { unit: unit.name.clone(), message },
        })?;

        let Some(map) = value.try_cast::<Map>() else {
            return Err(ContentError::NotAnObject { unit: unit.name.clone() });
        };
        let kind = map.get("kind").and_then(|kind| kind.clone().into_string().ok()).unwrap_or_default();
        if kind != D::KIND {
            return Err(ContentError::WrongKind { unit: unit.name.clone(), expected: D::KIND, found: kind });
        }
        let definition: D = rhai::serde::from_dynamic(&Dynamic::from_map(map)).map_err(|err| ContentError::Invalid {
            unit: unit.name.clone(),
            kind: D::KIND,
            message: err.to_string(),
        })?;
        if definition.id().trim().is_empty() {
            return Err(ContentError::EmptyId { unit: unit.name.clone() });
        }
        Ok(definition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessEngine;
    use crate::scripts::{ScriptCompiler, ScriptEngine};
    use std::fs;
    use tempfile::tempdir;

    fn loader<D: ContentDefinition>(root: &std::path::Path) -> ContentLoader<D> {
        let engine = Arc::new(ScriptEngine::new());
        let api = engine.api(Arc::new(HeadlessEngine::new()));
        let cache = Arc::new(UnitCache::new("content", root, ScriptCompiler::new(engine, "rhai")));
        ContentLoader::new(cache, api)
    }

    #[test]
    fn quests_load_and_bad_units_are_skipped() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("a_rescue.rhai"),
            r#"#{ kind: "quest", id: "rescue", title: "Rescue", objectives: ["find", "return"] }"#,
        )
        .unwrap();
        fs::write(dir.path().join("b_encounter.rhai"), r#"#{ kind: "encounter", id: "bats" }"#).unwrap();
        fs::write(dir.path().join("c_unit.rhai"), "let x = 1;").unwrap();
        fs::write(dir.path().join("d_throws.rhai"), r#"throw "nope";"#).unwrap();
        fs::write(dir.path().join("e_empty.rhai"), r#"#{ kind: "quest", id: "  " }"#).unwrap();
        fs::write(dir.path().join("f_dup.rhai"), r#"#{ kind: "quest", id: "rescue", title: "Again" }"#).unwrap();

        let quests = loader::<QuestDefinition>(dir.path());
        let report = quests.reload().unwrap();
        assert_eq!(report.loaded, 1);
        assert_eq!(report.skipped.len(), 5);
        assert!(matches!(report.skipped[0], ContentError::WrongKind { .. }));
        assert!(matches!(report.skipped[1], ContentError::NotAnObject { .. }));
        assert!(matches!(report.skipped[2], ContentError::Eval(_)));
        assert!(matches!(report.skipped[3], ContentError::EmptyId { .. }));
        assert!(matches!(report.skipped[4], ContentError::DuplicateId { .. }));

        let rescue = quests.get("rescue").unwrap();
        assert_eq!(rescue.title, "Rescue");
        assert_eq!(rescue.objectives, vec!["find".to_string(), "return".to_string()]);
    }

    #[test]
    fn encounters_carry_tile_regions() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("bats.rhai"),
            r#"
                let level = 2 + 1;
                #{ kind: "encounter", id: "bats", enemies: ["bat", "bat"], min_level: level,
                   tile_region: #{ min: [0, 0], max: [4, 4] } }
            "#,
        )
        .unwrap();
        let encounters = loader::<EncounterDefinition>(dir.path());
        encounters.reload().unwrap();
        let bats = encounters.get("bats").unwrap();
        assert_eq!(bats.min_level, 3);
        assert_eq!(bats.enemies.len(), 2);
        let region = bats.tile_region.unwrap();
        assert!(region.contains(IVec2::new(4, 0)));
        assert!(!region.contains(IVec2::new(5, 0)));
    }

    #[test]
    fn unreadable_root_keeps_loaded_definitions() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("quests");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("q.rhai"), r#"#{ kind: "quest", id: "q" }"#).unwrap();
        let quests = loader::<QuestDefinition>(&root);
        quests.reload().unwrap();
        fs::remove_dir_all(&root).unwrap();
        assert!(quests.reload().is_err());
        assert_eq!(quests.ids(), vec!["q".to_string()]);
    }
}
