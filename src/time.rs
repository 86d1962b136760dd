use std::sync::{Arc, Mutex, Weak};

use anyhow::Result;

use crate::events::{lock, EventBridge, LogicTick, SubscriptionId, TypedEvent};
use crate::guard::isolate;
use crate::native::NativeEngine;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickSignal {
    pub dt: f32,
    pub tick_index: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type TickListener = Arc<dyn Fn(TickSignal) -> Result<()> + Send + Sync>;

#[derive(Default)]
struct Clock {
    last: Option<TickSignal>,
    elapsed: f64,
    ticks_seen: u64,
}

struct TickInner {
    bridge: Arc<EventBridge>,
    engine: Arc<dyn NativeEngine>,
    hook: Mutex<Option<SubscriptionId>>,
    listeners: Mutex<Vec<(ListenerId, TickListener)>>,
    next_listener: Mutex<u64>,
    clock: Mutex<Clock>,
}

/// Turns the native `logic_tick` event into the runtime's single `Tick(dt, index)` notification.
#[derive(Clone)]
pub struct TickSource {
    inner: Arc<TickInner>,
}

impl TickSource {
    pub fn new(bridge: Arc<EventBridge>, engine: Arc<dyn NativeEngine>) -> Self {
        Self {
            inner: Arc::new(TickInner {
                bridge,
                engine,
                hook: Mutex::new(None),
                listeners: Mutex::new(Vec::new()),
                next_listener: Mutex::new(0),
                clock: Mutex::new(Clock::default()),
            }),
        }
    }

    /// Hooks the bridge. Returns `false` when already hooked.
    pub fn init(&self) -> bool {
        let mut hook = lock(&self.inner.hook);
        if hook.is_some() {
            return false;
        }
        let weak: Weak<TickInner> = Arc::downgrade(&self.inner);
        let id = self.inner.bridge.subscribe::<LogicTick, _>(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.on_native_tick(event.index);
            }
            Ok(())
        });
        *hook = Some(id);
        tracing::debug!(target: "tick", "tick source hooked");
        true
    }

    pub fn is_hooked(&self) -> bool {
        lock(&self.inner.hook).is_some()
    }

    pub fn unhook(&self) -> bool {
        let Some(id) = lock(&self.inner.hook).take() else {
            return false;
        };
        let removed = self.inner.bridge.unsubscribe(LogicTick::NAME, id);
        tracing::debug!(target: "tick", removed, "tick source unhooked");
        removed
    }

    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(TickSignal) -> Result<()> + Send + Sync + 'static,
    {
        let id = {
            let mut next = lock(&self.inner.next_listener);
            *next += 1;
            ListenerId(*next)
        };
        lock(&self.inner.listeners).push((id, Arc::new(listener)));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.inner.listeners);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.inner.listeners).len()
    }

    pub fn last_signal(&self) -> Option<TickSignal> {
        lock(&self.inner.clock).last
    }

    pub fn ticks_seen(&self) -> u64 {
        lock(&self.inner.clock).ticks_seen
    }

    pub fn elapsed_seconds(&self) -> f64 {
        lock(&self.inner.clock).elapsed
    }
}

impl TickInner {
    fn on_native_tick(&self, tick_index: u64) {
        let interval = self.engine.tick_interval();
        let dt = if interval.is_finite() && interval >= 0.0 {
            interval
        } else {
            tracing::warn!(target: "tick", interval, "engine reported an invalid tick interval; using 0");
            0.0
        };
        let signal = TickSignal { dt, tick_index };
        {
            let mut clock = lock(&self.clock);
            if let Some(prev) = clock.last {
                if tick_index <= prev.tick_index {
                    tracing::warn!(
                        target: "tick",
                        tick_index,
                        previous = prev.tick_index,
                        "tick index did not advance"
                    );
                }
            }
            clock.last = Some(signal);
            clock.elapsed += f64::from(dt);
            clock.ticks_seen += 1;
        }
        let listeners = lock(&self.listeners).clone();
        for (id, listener) in &listeners {
            if let Err(fault) = isolate(|| listener(signal)) {
                tracing::error!(target: "tick", listener = id.0, tick_index, "tick listener failed: {fault}");
            }
        }
    }
}
