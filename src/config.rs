use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::binder::DEFAULT_MAX_BIND_ENTITIES;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "RuntimeConfig::default_script_root")]
    pub script_root: PathBuf,
    #[serde(default = "RuntimeConfig::default_behaviour_root")]
    pub behaviour_root: PathBuf,
    #[serde(default = "RuntimeConfig::default_quest_root")]
    pub quest_root: PathBuf,
    #[serde(default = "RuntimeConfig::default_encounter_root")]
    pub encounter_root: PathBuf,
    #[serde(default = "RuntimeConfig::default_script_extension")]
    pub script_extension: String,
    #[serde(default = "RuntimeConfig::default_max_bind_entities")]
    pub max_bind_entities: usize,
    #[serde(default = "RuntimeConfig::default_watch_poll_interval_ms")]
    pub watch_poll_interval_ms: u64,
    #[serde(default = "RuntimeConfig::default_hot_reload")]
    pub hot_reload: bool,
    #[serde(default = "RuntimeConfig::default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeConfigOverrides {
    pub script_root: Option<PathBuf>,
    pub behaviour_root: Option<PathBuf>,
    pub hot_reload: Option<bool>,
    pub log_level: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            script_root: Self::default_script_root(),
            behaviour_root: Self::default_behaviour_root(),
            quest_root: Self::default_quest_root(),
            encounter_root: Self::default_encounter_root(),
            script_extension: Self::default_script_extension(),
            max_bind_entities: Self::default_max_bind_entities(),
            watch_poll_interval_ms: Self::default_watch_poll_interval_ms(),
            hot_reload: Self::default_hot_reload(),
            log_level: Self::default_log_level(),
        }
    }
}

impl RuntimeConfig {
    fn default_script_root() -> PathBuf {
        PathBuf::from("assets/scripts")
    }

    fn default_behaviour_root() -> PathBuf {
        PathBuf::from("assets/behaviours")
    }

    fn default_quest_root() -> PathBuf {
        PathBuf::from("assets/quests")
    }

    fn default_encounter_root() -> PathBuf {
        PathBuf::from("assets/encounters")
    }

    fn default_script_extension() -> String {
        "rhai".to_string()
    }

    const fn default_max_bind_entities() -> usize {
        DEFAULT_MAX_BIND_ENTITIES
    }

    const fn default_watch_poll_interval_ms() -> u64 {
        300
    }

    const fn default_hot_reload() -> bool {
        true
    }

    fn default_log_level() -> String {
        "info".to_string()
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).with_context(|| format!("Failed to read config file {}", path.display()))?;
        let cfg = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(cfg)
    }

    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                tracing::warn!(target: "runtime", "Config load error: {err:#}. Falling back to defaults.");
                Self::default()
            }
        }
    }

    /// Resolves every relative root against `base`, typically the config file's directory.
    pub fn resolve_roots(&mut self, base: &Path) {
        for root in [&mut self.script_root, &mut self.behaviour_root, &mut self.quest_root, &mut self.encounter_root] {
            if root.is_relative() {
                *root = base.join(&*root);
            }
        }
    }

    pub fn watch_poll_interval(&self) -> Duration {
        Duration::from_millis(self.watch_poll_interval_ms.max(1))
    }

    pub fn apply_overrides(&mut self, overrides: &RuntimeConfigOverrides) {
        if let Some(root) = &overrides.script_root {
            self.script_root = root.clone();
        }
        if let Some(root) = &overrides.behaviour_root {
            self.behaviour_root = root.clone();
        }
        if let Some(hot_reload) = overrides.hot_reload {
            self.hot_reload = hot_reload;
        }
        if let Some(level) = &overrides.log_level {
            self.log_level = level.clone();
        }
    }
}

impl RuntimeConfigOverrides {
    pub fn is_empty(&self) -> bool {
        self.applied_fields().is_empty()
    }

    pub fn applied_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.script_root.is_some() {
            fields.push("script_root");
        }
        if self.behaviour_root.is_some() {
            fields.push("behaviour_root");
        }
        if self.hot_reload.is_some() {
            fields.push("hot_reload");
        }
        if self.log_level.is_some() {
            fields.push("log_level");
        }
        fields
    }
}
