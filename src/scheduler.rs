use std::any::{type_name, TypeId};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, TryLockError};

use anyhow::Result;

use crate::events::lock;
use crate::guard::{isolate, Fault};
use crate::native::{EntityId, NativeEngine};
use crate::scripts::{ScriptUnitRunner, UnitRunStats};
use crate::time::TickSignal;

pub struct TickContext<'a> {
    pub dt: f32,
    pub tick_index: u64,
    pub engine: &'a dyn NativeEngine,
}

pub struct BehaviourContext<'a> {
    pub entity: EntityId,
    pub script_name: &'a str,
    pub dt: f32,
    pub tick_index: u64,
    pub engine: &'a dyn NativeEngine,
}

/// Scene-wide logic. At most one instance per concrete type may be registered.
pub trait StaticSystem: Send + 'static {
    fn on_tick(&mut self, ctx: &TickContext<'_>) -> Result<()>;

    fn shutdown(&mut self) {}
}

/// Per-entity logic. `attach` runs when the behaviour is registered, `start` once right before
/// the first `update`, and `dispose` once when it is removed, whether or not it ever ticked.
pub trait Behaviour: Send + 'static {
    /// Called under the registry lock; must not call back into the scheduler.
    fn attach(&mut self, _entity: EntityId) {}

    fn start(&mut self, _ctx: &BehaviourContext<'_>) -> Result<()> {
        Ok(())
    }

    fn update(&mut self, ctx: &BehaviourContext<'_>, dt: f32) -> Result<()>;

    fn dispose(&mut self) {}
}

trait Finalize {
    fn finalize(&mut self);
}

impl Finalize for dyn StaticSystem {
    fn finalize(&mut self) {
        self.shutdown();
    }
}

impl Finalize for dyn Behaviour {
    fn finalize(&mut self) {
        self.dispose();
    }
}

/// Owns one receiver. Finalization (dispose/shutdown) happens exactly once, even when it is
/// requested while the receiver's own hook is running on the tick thread.
struct Slot<T: ?Sized + Finalize> {
    inner: Mutex<Box<T>>,
    finalized: AtomicBool,
    pending: AtomicBool,
}

impl<T: ?Sized + Finalize> Slot<T> {
    fn new(inner: Box<T>) -> Self {
        Self { inner: Mutex::new(inner), finalized: AtomicBool::new(false), pending: AtomicBool::new(false) }
    }

    fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }

    fn with<R>(&self, hook: impl FnOnce(&mut T) -> R) -> Option<R> {
        if self.is_finalized() {
            return None;
        }
        let result = {
            let mut guard = lock(&self.inner);
            hook(&mut **guard)
        };
        self.finish_pending();
        Some(result)
    }

    fn finalize(&self) {
        if self.finalized.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pending.store(true, Ordering::Release);
        self.finish_pending();
    }

    fn finish_pending(&self) {
        let mut guard = match self.inner.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return,
        };
        if self.pending.swap(false, Ordering::AcqRel) {
            if let Err(fault) = isolate(|| {
                guard.finalize();
                Ok(())
            }) {
                tracing::error!(target: "scheduler", "finalizer failed: {fault}");
            }
        }
    }
}

struct SystemSlot {
    type_id: TypeId,
    type_name: &'static str,
    slot: Slot<dyn StaticSystem>,
}

pub struct BehaviourSlot {
    entity: EntityId,
    script_name: String,
    started: AtomicBool,
    slot: Slot<dyn Behaviour>,
}

impl BehaviourSlot {
    pub fn entity(&self) -> EntityId {
        self.entity
    }

    pub fn script_name(&self) -> &str {
        &self.script_name
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn is_disposed(&self) -> bool {
        self.slot.is_finalized()
    }
}

/// A receiver ready to be registered.
pub enum TickReceiver {
    System { type_id: TypeId, type_name: &'static str, system: Box<dyn StaticSystem> },
    Behaviour { entity: EntityId, script_name: String, behaviour: Box<dyn Behaviour> },
}

impl TickReceiver {
    pub fn system<S: StaticSystem>(system: S) -> Self {
        TickReceiver::System { type_id: TypeId::of::<S>(), type_name: type_name::<S>(), system: Box::new(system) }
    }

    pub fn behaviour(entity: EntityId, script_name: impl Into<String>, behaviour: Box<dyn Behaviour>) -> Self {
        TickReceiver::Behaviour { entity, script_name: script_name.into(), behaviour }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReceiverId(u64);

#[derive(Clone)]
enum Registered {
    System(Arc<SystemSlot>),
    Behaviour(Arc<BehaviourSlot>),
}

#[derive(Clone)]
struct Entry {
    id: ReceiverId,
    receiver: Registered,
    active: Arc<AtomicBool>,
}

impl Entry {
    fn label(&self) -> String {
        match &self.receiver {
            Registered::System(system) => system.type_name.to_string(),
            Registered::Behaviour(slot) => format!("{}@{}", slot.script_name, slot.entity),
        }
    }

    fn retire(&self) {
        self.active.store(false, Ordering::Release);
        match &self.receiver {
            Registered::System(system) => system.slot.finalize(),
            Registered::Behaviour(slot) => slot.slot.finalize(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub invoked: usize,
    pub faults: usize,
    pub units: UnitRunStats,
}

/// The per-tick dispatcher for every system, behaviour and loose script unit.
pub struct Scheduler {
    engine: Arc<dyn NativeEngine>,
    entries: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
    units: Option<ScriptUnitRunner>,
}

impl Scheduler {
    pub fn new(engine: Arc<dyn NativeEngine>) -> Self {
        Self { engine, entries: Mutex::new(Vec::new()), next_id: AtomicU64::new(1), units: None }
    }

    pub fn with_unit_runner(engine: Arc<dyn NativeEngine>, runner: ScriptUnitRunner) -> Self {
        Self { units: Some(runner), ..Self::new(engine) }
    }

    /// Returns `None` when the receiver was rejected: a second instance of an already registered
    /// system type, or a second behaviour for the same (entity, script name) pair.
    pub fn register(&self, receiver: TickReceiver) -> Option<ReceiverId> {
        let mut entries = lock(&self.entries);
        let registered = match receiver {
            TickReceiver::System { type_id, type_name, system } => {
                let duplicate = entries.iter().any(|entry| {
                    matches!(&entry.receiver, Registered::System(existing) if existing.type_id == type_id)
                });
                if duplicate {
                    tracing::debug!(target: "scheduler", system = type_name, "system already registered");
                    return None;
                }
                Registered::System(Arc::new(SystemSlot { type_id, type_name, slot: Slot::new(system) }))
            }
            TickReceiver::Behaviour { entity, script_name, mut behaviour } => {
                let duplicate = entries.iter().any(|entry| match &entry.receiver {
                    Registered::Behaviour(slot) => slot.entity == entity && slot.script_name == script_name,
                    Registered::System(_) => false,
                });
                if duplicate {
                    drop(entries);
                    tracing::debug!(target: "scheduler", %entity, script = %script_name, "behaviour already bound");
                    let rejected = Slot::new(behaviour);
                    rejected.finalize();
                    return None;
                }
                if let Err(fault) = isolate(|| {
                    behaviour.attach(entity);
                    Ok(())
                }) {
                    tracing::error!(target: "scheduler", %entity, script = %script_name, "attach failed: {fault}");
                }
                Registered::Behaviour(Arc::new(BehaviourSlot {
                    entity,
                    script_name,
                    started: AtomicBool::new(false),
                    slot: Slot::new(behaviour),
                }))
            }
        };
        let id = ReceiverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        entries.push(Entry { id, receiver: registered, active: Arc::new(AtomicBool::new(true)) });
        Some(id)
    }

    pub fn register_system<S: StaticSystem>(&self, system: S) -> Option<ReceiverId> {
        self.register(TickReceiver::system(system))
    }

    pub fn register_behaviour(
        &self,
        entity: EntityId,
        script_name: impl Into<String>,
        behaviour: Box<dyn Behaviour>,
    ) -> Option<ReceiverId> {
        self.register(TickReceiver::behaviour(entity, script_name, behaviour))
    }

    pub fn unregister(&self, id: ReceiverId) -> bool {
        let removed = {
            let mut entries = lock(&self.entries);
            entries.iter().position(|entry| entry.id == id).map(|idx| entries.remove(idx))
        };
        match removed {
            Some(entry) => {
                entry.retire();
                true
            }
            None => false,
        }
    }

    pub fn is_registered(&self, id: ReceiverId) -> bool {
        lock(&self.entries).iter().any(|entry| entry.id == id)
    }

    pub fn has_binding(&self, entity: EntityId, script_name: &str) -> bool {
        lock(&self.entries).iter().any(|entry| match &entry.receiver {
            Registered::Behaviour(slot) => slot.entity == entity && slot.script_name == script_name,
            Registered::System(_) => false,
        })
    }

    pub fn bindings(&self) -> Vec<(EntityId, String)> {
        lock(&self.entries)
            .iter()
            .filter_map(|entry| match &entry.receiver {
                Registered::Behaviour(slot) => Some((slot.entity, slot.script_name.clone())),
                Registered::System(_) => None,
            })
            .collect()
    }

    pub fn behaviour(&self, id: ReceiverId) -> Option<Arc<BehaviourSlot>> {
        lock(&self.entries).iter().find(|entry| entry.id == id).and_then(|entry| match &entry.receiver {
            Registered::Behaviour(slot) => Some(Arc::clone(slot)),
            Registered::System(_) => None,
        })
    }

    pub fn system_names(&self) -> Vec<&'static str> {
        lock(&self.entries)
            .iter()
            .filter_map(|entry| match &entry.receiver {
                Registered::System(system) => Some(system.type_name),
                Registered::Behaviour(_) => None,
            })
            .collect()
    }

    pub fn system_count(&self) -> usize {
        self.system_names().len()
    }

    pub fn behaviour_count(&self) -> usize {
        lock(&self.entries).iter().filter(|entry| matches!(entry.receiver, Registered::Behaviour(_))).count()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn unit_runner(&self) -> Option<&ScriptUnitRunner> {
        self.units.as_ref()
    }

    /// Removes and disposes every behaviour; systems stay registered.
    pub fn purge_behaviours(&self) -> usize {
        let removed = self.remove_where(|entry| matches!(entry.receiver, Registered::Behaviour(_)));
        tracing::debug!(target: "scheduler", removed, "purged behaviours");
        removed
    }

    pub fn purge_entity(&self, entity: EntityId) -> usize {
        self.remove_where(|entry| matches!(&entry.receiver, Registered::Behaviour(slot) if slot.entity == entity))
    }

    /// Disposes every behaviour and shuts down every system.
    pub fn shutdown(&self) -> usize {
        self.remove_where(|_| true)
    }

    fn remove_where(&self, predicate: impl Fn(&Entry) -> bool) -> usize {
        let removed: Vec<Entry> = {
            let mut entries = lock(&self.entries);
            let (removed, kept): (Vec<Entry>, Vec<Entry>) = entries.drain(..).partition(|entry| predicate(entry));
            *entries = kept;
            removed
        };
        for entry in &removed {
            entry.retire();
        }
        removed.len()
    }

    /// Runs every receiver once against a snapshot of the registry, then every loose script unit.
    pub fn tick(&self, signal: TickSignal) -> TickReport {
        let snapshot: Vec<Entry> = lock(&self.entries).clone();
        let ctx = TickContext { dt: signal.dt, tick_index: signal.tick_index, engine: self.engine.as_ref() };
        let mut report = TickReport::default();
        for entry in &snapshot {
            if !entry.active.load(Ordering::Acquire) {
                continue;
            }
            let outcome = match &entry.receiver {
                Registered::System(system) => system.slot.with(|system| isolate(|| system.on_tick(&ctx))),
                Registered::Behaviour(slot) => slot.slot.with(|behaviour| run_behaviour(slot, behaviour, &ctx)),
            };
            match outcome {
                None => continue,
                Some(Ok(())) => report.invoked += 1,
                Some(Err(fault)) => {
                    report.invoked += 1;
                    report.faults += 1;
                    tracing::error!(
                        target: "scheduler",
                        receiver = %entry.label(),
                        tick = signal.tick_index,
                        "on_tick failed: {fault}"
                    );
                }
            }
        }
        if let Some(runner) = &self.units {
            report.units = runner.run(signal);
        }
        report
    }
}

fn run_behaviour(slot: &BehaviourSlot, behaviour: &mut dyn Behaviour, tick: &TickContext<'_>) -> Result<(), Fault> {
    let ctx = BehaviourContext {
        entity: slot.entity,
        script_name: &slot.script_name,
        dt: tick.dt,
        tick_index: tick.tick_index,
        engine: tick.engine,
    };
    if !slot.started.swap(true, Ordering::AcqRel) {
        isolate(|| behaviour.start(&ctx))?;
    }
    isolate(|| behaviour.update(&ctx, tick.dt))
}
