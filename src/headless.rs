use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use bevy_ecs::prelude::*;

use crate::events::lock;
use crate::native::{EntityId, NativeEngine, NativeError};

pub const DEFAULT_TICK_INTERVAL: f32 = 1.0 / 60.0;

// ---------- Components ----------
#[derive(Component, Default, Clone)]
pub struct ScriptData(pub BTreeMap<String, String>);

#[derive(Component, Default, Clone)]
pub struct ComponentBlobs(pub BTreeMap<String, String>);

/// In-process stand-in for the native engine, backed by a `bevy_ecs` world. Used by the harness
/// and by tests; can be told to fail calls touching specific keys.
pub struct HeadlessEngine {
    world: Mutex<World>,
    tick_interval: Mutex<f32>,
    failing_keys: Mutex<HashSet<String>>,
}

impl Default for HeadlessEngine {
    fn default() -> Self {
        Self::with_tick_interval(DEFAULT_TICK_INTERVAL)
    }
}

impl HeadlessEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tick_interval(interval: f32) -> Self {
        Self {
            world: Mutex::new(World::new()),
            tick_interval: Mutex::new(interval),
            failing_keys: Mutex::new(HashSet::new()),
        }
    }

    pub fn set_tick_interval(&self, interval: f32) {
        *lock(&self.tick_interval) = interval;
    }

    pub fn fail_key(&self, key: impl Into<String>) {
        lock(&self.failing_keys).insert(key.into());
    }

    pub fn clear_failures(&self) {
        lock(&self.failing_keys).clear();
    }

    pub fn spawn(&self) -> EntityId {
        let mut world = lock(&self.world);
        let entity = world.spawn((ScriptData::default(), ComponentBlobs::default())).id();
        EntityId(entity.to_bits())
    }

    pub fn spawn_with_script_data<'a>(&self, entries: impl IntoIterator<Item = (&'a str, String)>) -> EntityId {
        let data = entries.into_iter().map(|(key, value)| (key.to_string(), value)).collect();
        let mut world = lock(&self.world);
        let entity = world.spawn((ScriptData(data), ComponentBlobs::default())).id();
        EntityId(entity.to_bits())
    }

    pub fn entity_count(&self) -> usize {
        let mut world = lock(&self.world);
        let mut query = world.query::<Entity>();
        query.iter(&world).count()
    }

    /// Every script data entry of a live entity, empty for dead ones.
    pub fn script_data_entries(&self, entity: EntityId) -> BTreeMap<String, String> {
        let world = lock(&self.world);
        resolve(&world, entity)
            .ok()
            .and_then(|resolved| world.get::<ScriptData>(resolved).map(|data| data.0.clone()))
            .unwrap_or_default()
    }

    fn check_key(&self, call: &'static str, entity: EntityId, key: &str) -> Result<(), NativeError> {
        if lock(&self.failing_keys).contains(key) {
            return Err(NativeError::CallFailed { call, entity, key: key.to_string(), code: -1 });
        }
        Ok(())
    }
}

fn resolve(world: &World, entity: EntityId) -> Result<Entity, NativeError> {
    let Ok(resolved) = Entity::try_from_bits(entity.to_bits()) else {
        return Err(NativeError::DeadEntity { entity });
    };
    if world.get_entity(resolved).is_err() {
        return Err(NativeError::DeadEntity { entity });
    }
    Ok(resolved)
}

impl NativeEngine for HeadlessEngine {
    fn tick_interval(&self) -> f32 {
        *lock(&self.tick_interval)
    }

    fn live_entities(&self, max_count: usize) -> Result<Vec<EntityId>, NativeError> {
        let mut world = lock(&self.world);
        let mut query = world.query::<Entity>();
        let mut entities: Vec<EntityId> = query.iter(&world).map(|e| EntityId(e.to_bits())).collect();
        entities.sort();
        entities.truncate(max_count);
        Ok(entities)
    }

    fn create_entity(&self) -> Result<EntityId, NativeError> {
        Ok(self.spawn())
    }

    fn destroy_entity(&self, entity: EntityId) -> Result<(), NativeError> {
        let mut world = lock(&self.world);
        let resolved = resolve(&world, entity)?;
        world.despawn(resolved);
        Ok(())
    }

    fn is_alive(&self, entity: EntityId) -> bool {
        let world = lock(&self.world);
        resolve(&world, entity).is_ok()
    }

    fn component_json(&self, entity: EntityId, component: &str) -> Result<Option<String>, NativeError> {
        self.check_key("get_component_json", entity, component)?;
        let world = lock(&self.world);
        let resolved = resolve(&world, entity)?;
        Ok(world.get::<ComponentBlobs>(resolved).and_then(|blobs| blobs.0.get(component).cloned()))
    }

    fn set_component_json(&self, entity: EntityId, component: &str, json: &str) -> Result<(), NativeError> {
        self.check_key("set_component_json", entity, component)?;
        if serde_json::from_str::<serde_json::Value>(json).is_err() {
            return Err(NativeError::CallFailed {
                call: "set_component_json",
                entity,
                key: component.to_string(),
                code: -2,
            });
        }
        let mut world = lock(&self.world);
        let resolved = resolve(&world, entity)?;
        if let Some(mut blobs) = world.get_mut::<ComponentBlobs>(resolved) {
            blobs.0.insert(component.to_string(), json.to_string());
            return Ok(());
        }
        let mut blobs = ComponentBlobs::default();
        blobs.0.insert(component.to_string(), json.to_string());
        world.entity_mut(resolved).insert(blobs);
        Ok(())
    }

    fn script_data(&self, entity: EntityId, key: &str) -> Result<Option<String>, NativeError> {
        self.check_key("get_script_data", entity, key)?;
        let world = lock(&self.world);
        let resolved = resolve(&world, entity)?;
        Ok(world.get::<ScriptData>(resolved).and_then(|data| data.0.get(key).cloned()))
    }

    fn set_script_data(&self, entity: EntityId, key: &str, value: &str) -> Result<(), NativeError> {
        self.check_key("set_script_data", entity, key)?;
        let mut world = lock(&self.world);
        let resolved = resolve(&world, entity)?;
        if let Some(mut data) = world.get_mut::<ScriptData>(resolved) {
            data.0.insert(key.to_string(), value.to_string());
            return Ok(());
        }
        let mut data = ScriptData::default();
        data.0.insert(key.to_string(), value.to_string());
        world.entity_mut(resolved).insert(data);
        Ok(())
    }

    fn remove_script_data(&self, entity: EntityId, key: &str) -> Result<(), NativeError> {
        self.check_key("remove_script_data", entity, key)?;
        let mut world = lock(&self.world);
        let resolved = resolve(&world, entity)?;
        if let Some(mut data) = world.get_mut::<ScriptData>(resolved) {
            data.0.remove(key);
        }
        Ok(())
    }
}
