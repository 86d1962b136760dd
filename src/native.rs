use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque handle of an entity owned by the native engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub u64);

impl EntityId {
    pub fn to_bits(self) -> u64 {
        self.0
    }

    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NativeError {
    #[error("entity {entity} is not alive")]
    DeadEntity { entity: EntityId },
    #[error("native call '{call}' failed for entity {entity} ('{key}'): code {code}")]
    CallFailed { call: &'static str, entity: EntityId, key: String, code: i32 },
    #[error("native call '{call}' failed: code {code}")]
    EngineCallFailed { call: &'static str, code: i32 },
    #[error("native payload for entity {entity} ('{key}') is not valid UTF-8")]
    InvalidUtf8 { entity: EntityId, key: String },
    #[error("invalid argument for '{call}': {reason}")]
    InvalidArgument { call: &'static str, reason: String },
}

/// The narrow call surface the native engine exposes to the scripting runtime.
///
/// Getters return `Ok(None)` when the key or component is simply absent; `Err` is reserved for
/// calls the native side reported as failed. Component payloads are JSON text and are never
/// interpreted here.
pub trait NativeEngine: Send + Sync {
    fn tick_interval(&self) -> f32;

    fn live_entities(&self, max_count: usize) -> Result<Vec<EntityId>, NativeError>;

    fn create_entity(&self) -> Result<EntityId, NativeError>;

    fn destroy_entity(&self, entity: EntityId) -> Result<(), NativeError>;

    fn is_alive(&self, entity: EntityId) -> bool;

    fn component_json(&self, entity: EntityId, component: &str) -> Result<Option<String>, NativeError>;

    fn set_component_json(&self, entity: EntityId, component: &str, json: &str) -> Result<(), NativeError>;

    fn script_data(&self, entity: EntityId, key: &str) -> Result<Option<String>, NativeError>;

    fn set_script_data(&self, entity: EntityId, key: &str, value: &str) -> Result<(), NativeError>;

    fn remove_script_data(&self, entity: EntityId, key: &str) -> Result<(), NativeError>;
}
