use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use bytemuck::{Pod, Zeroable};
use glam::IVec2;
use thiserror::Error;

use crate::guard::isolate;
use crate::native::EntityId;

pub const LOGIC_TICK: &str = "logic_tick";
pub const MOVEMENT_STARTED: &str = "movement_started";
pub const MOVEMENT_COMPLETED: &str = "movement_completed";
pub const ANIMATION_FINISHED: &str = "animation_finished";
pub const STATE_ENTERED: &str = "state_entered";
pub const FRAME_RENDER: &str = "frame_render";

pub const BUILTIN_EVENTS: &[&str] =
    &[LOGIC_TICK, MOVEMENT_STARTED, MOVEMENT_COMPLETED, ANIMATION_FINISHED, STATE_ENTERED, FRAME_RENDER];

pub const STATE_NAME_CAPACITY: usize = 64;

// ---------- Native payload layouts ----------
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct TickPayload {
    pub index: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct MovementPayload {
    pub entity: u64,
    pub tile_x: i32,
    pub tile_y: i32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct EntityPayload {
    pub entity: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct StateEnteredPayload {
    pub entity: u64,
    pub state: [u8; STATE_NAME_CAPACITY],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct FrameRenderPayload {
    pub state: u64,
}

// ---------- Typed events ----------
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogicTick {
    pub index: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MovementStarted {
    pub entity: EntityId,
    pub tile: IVec2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MovementCompleted {
    pub entity: EntityId,
    pub tile: IVec2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnimationFinished {
    pub entity: EntityId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateEntered {
    pub entity: EntityId,
    pub state: String,
}

/// Carries the renderer's opaque state pointer; never dereferenced here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRender {
    pub state: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuiltinEvent {
    LogicTick(LogicTick),
    MovementStarted(MovementStarted),
    MovementCompleted(MovementCompleted),
    AnimationFinished(AnimationFinished),
    StateEntered(StateEntered),
    FrameRender(FrameRender),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventError {
    #[error("built-in event '{name}' expects {expected} payload bytes, got {actual}")]
    SizeMismatch { name: &'static str, expected: usize, actual: usize },
}

/// A strongly typed built-in event with a fixed native payload layout.
pub trait TypedEvent: Sized + Send + Sync + 'static {
    const NAME: &'static str;
    type Payload: Pod;

    fn from_payload(payload: Self::Payload) -> Self;
    fn to_payload(&self) -> Self::Payload;
    fn extract(event: &BuiltinEvent) -> Option<&Self>;
    fn wrap(self) -> BuiltinEvent;

    fn payload_size() -> usize {
        mem::size_of::<Self::Payload>()
    }

    fn decode(payload: &[u8]) -> Result<Self, EventError> {
        let expected = Self::payload_size();
        if payload.len() != expected {
            return Err(EventError::SizeMismatch { name: Self::NAME, expected, actual: payload.len() });
        }
        Ok(Self::from_payload(bytemuck::pod_read_unaligned(payload)))
    }

    fn encode(&self) -> Vec<u8> {
        bytemuck::bytes_of(&self.to_payload()).to_vec()
    }
}

impl TypedEvent for LogicTick {
    const NAME: &'static str = LOGIC_TICK;
    type Payload = TickPayload;

    fn from_payload(payload: TickPayload) -> Self {
        Self { index: payload.index }
    }

    fn to_payload(&self) -> TickPayload {
        TickPayload { index: self.index }
    }

    fn extract(event: &BuiltinEvent) -> Option<&Self> {
        match event {
            BuiltinEvent::LogicTick(ev) => Some(ev),
            _ => None,
        }
    }

    fn wrap(self) -> BuiltinEvent {
        BuiltinEvent::LogicTick(self)
    }
}

impl TypedEvent for MovementStarted {
    const NAME: &'static str = MOVEMENT_STARTED;
    type Payload = MovementPayload;

    fn from_payload(payload: MovementPayload) -> Self {
        Self { entity: EntityId(payload.entity), tile: IVec2::new(payload.tile_x, payload.tile_y) }
    }

    fn to_payload(&self) -> MovementPayload {
        MovementPayload { entity: self.entity.to_bits(), tile_x: self.tile.x, tile_y: self.tile.y }
    }

    fn extract(event: &BuiltinEvent) -> Option<&Self> {
        match event {
            BuiltinEvent::MovementStarted(ev) => Some(ev),
            _ => None,
        }
    }

    fn wrap(self) -> BuiltinEvent {
        BuiltinEvent::MovementStarted(self)
    }
}

impl TypedEvent for MovementCompleted {
    const NAME: &'static str = MOVEMENT_COMPLETED;
    type Payload = MovementPayload;

    fn from_payload(payload: MovementPayload) -> Self {
        Self { entity: EntityId(payload.entity), tile: IVec2::new(payload.tile_x, payload.tile_y) }
    }

    fn to_payload(&self) -> MovementPayload {
        MovementPayload { entity: self.entity.to_bits(), tile_x: self.tile.x, tile_y: self.tile.y }
    }

    fn extract(event: &BuiltinEvent) -> Option<&Self> {
        match event {
            BuiltinEvent::MovementCompleted(ev) => Some(ev),
            _ => None,
        }
    }

    fn wrap(self) -> BuiltinEvent {
        BuiltinEvent::MovementCompleted(self)
    }
}

impl TypedEvent for AnimationFinished {
    const NAME: &'static str = ANIMATION_FINISHED;
    type Payload = EntityPayload;

    fn from_payload(payload: EntityPayload) -> Self {
        Self { entity: EntityId(payload.entity) }
    }

    fn to_payload(&self) -> EntityPayload {
        EntityPayload { entity: self.entity.to_bits() }
    }

    fn extract(event: &BuiltinEvent) -> Option<&Self> {
        match event {
            BuiltinEvent::AnimationFinished(ev) => Some(ev),
            _ => None,
        }
    }

    fn wrap(self) -> BuiltinEvent {
        BuiltinEvent::AnimationFinished(self)
    }
}

impl TypedEvent for StateEntered {
    const NAME: &'static str = STATE_ENTERED;
    type Payload = StateEnteredPayload;

    fn from_payload(payload: StateEnteredPayload) -> Self {
        let len = payload.state.iter().position(|b| *b == 0).unwrap_or(STATE_NAME_CAPACITY);
        let state = String::from_utf8_lossy(&payload.state[..len]).into_owned();
        Self { entity: EntityId(payload.entity), state }
    }

    /// Names longer than the native buffer are truncated on a char boundary.
    fn to_payload(&self) -> StateEnteredPayload {
        let mut state = [0u8; STATE_NAME_CAPACITY];
        let mut len = self.state.len().min(STATE_NAME_CAPACITY);
        while !self.state.is_char_boundary(len) {
            len -= 1;
        }
        state[..len].copy_from_slice(&self.state.as_bytes()[..len]);
        StateEnteredPayload { entity: self.entity.to_bits(), state }
    }

    fn extract(event: &BuiltinEvent) -> Option<&Self> {
        match event {
            BuiltinEvent::StateEntered(ev) => Some(ev),
            _ => None,
        }
    }

    fn wrap(self) -> BuiltinEvent {
        BuiltinEvent::StateEntered(self)
    }
}

impl TypedEvent for FrameRender {
    const NAME: &'static str = FRAME_RENDER;
    type Payload = FrameRenderPayload;

    fn from_payload(payload: FrameRenderPayload) -> Self {
        Self { state: payload.state }
    }

    fn to_payload(&self) -> FrameRenderPayload {
        FrameRenderPayload { state: self.state }
    }

    fn extract(event: &BuiltinEvent) -> Option<&Self> {
        match event {
            BuiltinEvent::FrameRender(ev) => Some(ev),
            _ => None,
        }
    }

    fn wrap(self) -> BuiltinEvent {
        BuiltinEvent::FrameRender(self)
    }
}

impl BuiltinEvent {
    pub fn is_builtin(name: &str) -> bool {
        BUILTIN_EVENTS.contains(&name)
    }

    /// `None` when `name` is not a built-in identifier.
    pub fn decode(name: &str, payload: &[u8]) -> Option<Result<Self, EventError>> {
        fn typed<E: TypedEvent>(payload: &[u8]) -> Result<BuiltinEvent, EventError> {
            E::decode(payload).map(E::wrap)
        }
        let decoded = match name {
            LOGIC_TICK => typed::<LogicTick>(payload),
            MOVEMENT_STARTED => typed::<MovementStarted>(payload),
            MOVEMENT_COMPLETED => typed::<MovementCompleted>(payload),
            ANIMATION_FINISHED => typed::<AnimationFinished>(payload),
            STATE_ENTERED => typed::<StateEntered>(payload),
            FRAME_RENDER => typed::<FrameRender>(payload),
            _ => return None,
        };
        Some(decoded)
    }

    pub fn name(&self) -> &'static str {
        match self {
            BuiltinEvent::LogicTick(_) => LOGIC_TICK,
            BuiltinEvent::MovementStarted(_) => MOVEMENT_STARTED,
            BuiltinEvent::MovementCompleted(_) => MOVEMENT_COMPLETED,
            BuiltinEvent::AnimationFinished(_) => ANIMATION_FINISHED,
            BuiltinEvent::StateEntered(_) => STATE_ENTERED,
            BuiltinEvent::FrameRender(_) => FRAME_RENDER,
        }
    }
}

impl fmt::Display for BuiltinEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuiltinEvent::LogicTick(ev) => write!(f, "LogicTick index={}", ev.index),
            BuiltinEvent::MovementStarted(ev) => {
                write!(f, "MovementStarted entity={} tile=({}, {})", ev.entity, ev.tile.x, ev.tile.y)
            }
            BuiltinEvent::MovementCompleted(ev) => {
                write!(f, "MovementCompleted entity={} tile=({}, {})", ev.entity, ev.tile.x, ev.tile.y)
            }
            BuiltinEvent::AnimationFinished(ev) => write!(f, "AnimationFinished entity={}", ev.entity),
            BuiltinEvent::StateEntered(ev) => write!(f, "StateEntered entity={} state={}", ev.entity, ev.state),
            BuiltinEvent::FrameRender(ev) => write!(f, "FrameRender state={:#x}", ev.state),
        }
    }
}

// ---------- Bridge ----------

/// One native callback invocation. Borrowed for the duration of the call only.
#[derive(Debug, Clone, Copy)]
pub struct NativeEventEnvelope<'a> {
    pub name: &'a str,
    pub payload: &'a [u8],
}

impl<'a> NativeEventEnvelope<'a> {
    pub fn new(name: &'a str, payload: &'a [u8]) -> Self {
        Self { name, payload }
    }

    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Decoded as a built-in event; carries the number of handlers invoked.
    Typed(usize),
    /// Routed to name-keyed raw subscribers.
    Dynamic(usize),
    /// Built-in name with a payload of the wrong size.
    Dropped,
}

type TypedHandler = Arc<dyn Fn(&BuiltinEvent) -> Result<()> + Send + Sync>;
type RawHandler = Arc<dyn Fn(&[u8]) -> Result<()> + Send + Sync>;
/// Ids come from one increasing counter, so key order is subscription order.
type Subscribers<H> = BTreeMap<SubscriptionId, H>;

#[derive(Default)]
pub struct EventBridge {
    next_id: AtomicU64,
    typed: Mutex<HashMap<&'static str, Subscribers<TypedHandler>>>,
    dynamic: Mutex<HashMap<String, Subscribers<RawHandler>>>,
    dropped: AtomicU64,
}

impl EventBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<E, F>(&self, handler: F) -> SubscriptionId
    where
        E: TypedEvent,
        F: Fn(&E) -> Result<()> + Send + Sync + 'static,
    {
        let id = self.allocate_id();
        let erased: TypedHandler = Arc::new(move |event: &BuiltinEvent| match E::extract(event) {
            Some(typed) => handler(typed),
            None => Ok(()),
        });
        lock(&self.typed).entry(E::NAME).or_default().insert(id, erased);
        id
    }

    pub fn subscribe_raw<F>(&self, name: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(&[u8]) -> Result<()> + Send + Sync + 'static,
    {
        let name = name.into();
        if BuiltinEvent::is_builtin(&name) {
            tracing::warn!(target: "events", event = %name, "raw subscription to a built-in event never fires");
        }
        let id = self.allocate_id();
        lock(&self.dynamic).entry(name).or_default().insert(id, Arc::new(handler));
        id
    }

    /// Removes one subscription by id in O(log n); the others keep their order.
    pub fn unsubscribe(&self, name: &str, id: SubscriptionId) -> bool {
        if BuiltinEvent::is_builtin(name) {
            let mut typed = lock(&self.typed);
            if let Some(subscribers) = typed.get_mut(name) {
                if subscribers.remove(&id).is_some() {
                    return true;
                }
            }
        }
        let mut dynamic = lock(&self.dynamic);
        match dynamic.get_mut(name) {
            Some(subscribers) => {
                let removed = subscribers.remove(&id).is_some();
                if subscribers.is_empty() {
                    dynamic.remove(name);
                }
                removed
            }
            None => false,
        }
    }

    pub fn subscriber_count(&self, name: &str) -> usize {
        if BuiltinEvent::is_builtin(name) {
            lock(&self.typed).get(name).map_or(0, BTreeMap::len)
        } else {
            lock(&self.dynamic).get(name).map_or(0, BTreeMap::len)
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Routes one native callback. Handlers run synchronously, in subscription order, outside
    /// of any lock so they may publish or (un)subscribe themselves.
    pub fn dispatch(&self, envelope: NativeEventEnvelope<'_>) -> DispatchOutcome {
        match BuiltinEvent::decode(envelope.name, envelope.payload) {
            Some(Ok(event)) => {
                let handlers = snapshot(lock(&self.typed).get(envelope.name));
                for (id, handler) in &handlers {
                    if let Err(fault) = isolate(|| handler(&event)) {
                        tracing::error!(
                            target: "events",
                            event = envelope.name,
                            subscription = id.0,
                            "subscriber failed: {fault}"
                        );
                    }
                }
                DispatchOutcome::Typed(handlers.len())
            }
            Some(Err(err)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(target: "events", "dropping event: {err}");
                DispatchOutcome::Dropped
            }
            None => {
                let handlers = snapshot(lock(&self.dynamic).get(envelope.name));
                for (id, handler) in &handlers {
                    if let Err(fault) = isolate(|| handler(envelope.payload)) {
                        tracing::error!(
                            target: "events",
                            event = envelope.name,
                            subscription = id.0,
                            "subscriber failed: {fault}"
                        );
                    }
                }
                DispatchOutcome::Dynamic(handlers.len())
            }
        }
    }

    pub fn publish<E: TypedEvent>(&self, event: &E) -> DispatchOutcome {
        let payload = event.encode();
        self.dispatch(NativeEventEnvelope::new(E::NAME, &payload))
    }

    pub fn publish_raw(&self, name: &str, payload: &[u8]) -> DispatchOutcome {
        self.dispatch(NativeEventEnvelope::new(name, payload))
    }

    fn allocate_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

fn snapshot<H: Clone>(subscribers: Option<&Subscribers<H>>) -> Vec<(SubscriptionId, H)> {
    subscribers.map(|subs| subs.iter().map(|(id, handler)| (*id, handler.clone())).collect()).unwrap_or_default()
}

/// Poisoning only means a handler panicked while the table was locked; the table itself is
/// still consistent because every mutation is a single push/remove.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
