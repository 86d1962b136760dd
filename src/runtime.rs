use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use thiserror::Error;

use crate::binder::{BehaviourFactory, BindError, BindReport, EntityScriptBinder, FactoryChain};
use crate::config::RuntimeConfig;
use crate::content::{ContentLoader, EncounterDefinition, QuestDefinition};
use crate::events::{lock, EventBridge};
use crate::native::NativeEngine;
use crate::scheduler::Scheduler;
use crate::scripts::{
    ScriptApi, ScriptBehaviourFactory, ScriptCompiler, ScriptEngine, ScriptError, ScriptUnitRunner, UnitCache,
};
use crate::time::{ListenerId, TickSource};
use crate::watch::{HotReloadThread, RootKind, RootTable, ScriptRootWatcher};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("a script runtime is already attached to this engine context")]
    AlreadyInitialized,
    #[error("the script runtime has been shut down")]
    ShutDown,
    #[error(transparent)]
    Bind(#[from] BindError),
    #[error(transparent)]
    Script(#[from] ScriptError),
    #[error("hot reload watcher: {0:#}")]
    Watch(anyhow::Error),
}

/// The native engine and its event bridge. At most one [`ScriptRuntime`] may hold it at a time.
pub struct EngineContext {
    native: Arc<dyn NativeEngine>,
    bridge: Arc<EventBridge>,
    claimed: AtomicBool,
}

impl EngineContext {
    pub fn new(native: Arc<dyn NativeEngine>) -> Arc<Self> {
        Self::with_bridge(native, Arc::new(EventBridge::new()))
    }

    pub fn with_bridge(native: Arc<dyn NativeEngine>, bridge: Arc<EventBridge>) -> Arc<Self> {
        Arc::new(Self { native, bridge, claimed: AtomicBool::new(false) })
    }

    pub fn native(&self) -> &Arc<dyn NativeEngine> {
        &self.native
    }

    pub fn bridge(&self) -> &Arc<EventBridge> {
        &self.bridge
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    fn claim(&self) -> Result<(), RuntimeError> {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| RuntimeError::AlreadyInitialized)
    }

    fn release(&self) {
        self.claimed.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Created,
    Running,
    ShutDown,
}

pub struct ScriptRuntime {
    context: Arc<EngineContext>,
    config: RuntimeConfig,
    engine: Arc<ScriptEngine>,
    api: ScriptApi,
    scripts: Arc<UnitCache>,
    behaviours: Arc<UnitCache>,
    quests: ContentLoader<QuestDefinition>,
    encounters: ContentLoader<EncounterDefinition>,
    scheduler: Arc<Scheduler>,
    binder: EntityScriptBinder,
    ticks: TickSource,
    roots: RootTable,
    listener: Mutex<Option<ListenerId>>,
    watcher: Mutex<Option<ScriptRootWatcher>>,
    state: Mutex<RuntimeState>,
}

impl ScriptRuntime {
    /// Claims `context` and wires every component. `host_factories` are consulted before the
    /// script behaviour library when binding.
    pub fn new(
        context: Arc<EngineContext>,
        config: RuntimeConfig,
        host_factories: FactoryChain,
    ) -> Result<Self, RuntimeError> {
        context.claim()?;
        let native = Arc::clone(context.native());
        let engine = Arc::new(ScriptEngine::new());
        let api = engine.api(Arc::clone(&native));
        let compiler = ScriptCompiler::new(Arc::clone(&engine), config.script_extension.clone());
        let cache = |label, root: &Path| Arc::new(UnitCache::new(label, root, compiler.clone()));

        let scripts = cache("scripts", config.script_root.as_path());
        let behaviours = cache("behaviours", config.behaviour_root.as_path());
        let quests = ContentLoader::new(cache("quests", config.quest_root.as_path()), api.clone());
        let encounters = ContentLoader::new(cache("encounters", config.encounter_root.as_path()), api.clone());

        let scheduler = Arc::new(Scheduler::with_unit_runner(
            Arc::clone(&native),
            ScriptUnitRunner::new(Arc::clone(&scripts), api.clone()),
        ));
        let library: Arc<dyn BehaviourFactory> =
            Arc::new(ScriptBehaviourFactory::new(Arc::clone(&behaviours), api.clone()));
        let factory: Arc<dyn BehaviourFactory> = Arc::new(host_factories.with(library));
        let binder = EntityScriptBinder::new(Arc::clone(&native), Arc::clone(&scheduler), factory)
            .with_max_entities(config.max_bind_entities);
        let ticks = TickSource::new(Arc::clone(context.bridge()), native);

        let mut roots = RootTable::default();
        roots.insert(&config.script_root, RootKind::Scripts);
        roots.insert(&config.behaviour_root, RootKind::Behaviours);
        roots.insert(&config.quest_root, RootKind::Quests);
        roots.insert(&config.encounter_root, RootKind::Encounters);

        Ok(Self {
            context,
            config,
            engine,
            api,
            scripts,
            behaviours,
            quests,
            encounters,
            scheduler,
            binder,
            ticks,
            roots,
            listener: Mutex::new(None),
            watcher: Mutex::new(None),
            state: Mutex::new(RuntimeState::Created),
        })
    }

    /// Compiles every root, hooks the tick source and binds declared behaviours. Returns `false`
    /// when the runtime was already running.
    pub fn initialize(&self) -> Result<bool, RuntimeError> {
        let mut state = lock(&self.state);
        match *state {
            RuntimeState::ShutDown => return Err(RuntimeError::ShutDown),
            RuntimeState::Running => return Ok(false),
            RuntimeState::Created => {}
        }
        for kind in RootKind::ALL {
            if let Err(err) = self.reload_root(kind) {
                tracing::warn!(target: "runtime", root = kind.label(), "initial load failed: {err}");
            }
        }
        self.ticks.init();
        let scheduler = Arc::clone(&self.scheduler);
        let listener = self.ticks.add_listener(move |signal| {
            scheduler.tick(signal);
            Ok(())
        });
        *lock(&self.listener) = Some(listener);
        if self.config.hot_reload {
            self.start_watcher();
        }
        *state = RuntimeState::Running;
        drop(state);

        match self.binder.bind_all() {
            Ok(report) => {
                tracing::info!(
                    target: "runtime",
                    attached = report.attached,
                    unresolved = report.unresolved.len(),
                    "runtime initialized"
                );
            }
            Err(err) => tracing::warn!(target: "runtime", "initial bind failed: {err}"),
        }
        Ok(true)
    }

    fn start_watcher(&self) {
        let mut watcher = match ScriptRootWatcher::new(self.config.watch_poll_interval()) {
            Ok(watcher) => watcher,
            Err(err) => {
                tracing::warn!(target: "watch", "hot reload disabled: {err:#}");
                return;
            }
        };
        for (root, kind) in self.roots.roots() {
            if let Err(err) = watcher.watch_root(root, *kind) {
                tracing::warn!(target: "watch", root = %root.display(), "not watching: {err:#}");
            }
        }
        *lock(&self.watcher) = Some(watcher);
    }

    pub fn state(&self) -> RuntimeState {
        *lock(&self.state)
    }

    /// Recompiles one root in full and publishes the result.
    pub fn reload_root(&self, kind: RootKind) -> Result<(), RuntimeError> {
        match kind {
            RootKind::Scripts => {
                self.scripts.reload()?;
            }
            RootKind::Behaviours => {
                self.behaviours.reload()?;
            }
            RootKind::Quests => {
                self.quests.reload()?;
            }
            RootKind::Encounters => {
                self.encounters.reload()?;
            }
        }
        Ok(())
    }

    /// Maps a changed path to its root and recompiles that root. Returns the root that was
    /// reloaded, if any.
    pub fn handle_path_changed(&self, path: impl AsRef<Path>) -> Option<RootKind> {
        let path = path.as_ref();
        let Some(kind) = self.roots.classify(path) else {
            tracing::debug!(target: "watch", path = %path.display(), "change outside every script root");
            return None;
        };
        if let Err(err) = self.reload_root(kind) {
            tracing::error!(target: "watch", root = kind.label(), "reload failed: {err}");
        }
        Some(kind)
    }

    /// Drains the watcher on the calling thread and reloads every changed root.
    pub fn poll_watcher(&self) -> Vec<RootKind> {
        let changed = match lock(&self.watcher).as_mut() {
            Some(watcher) => watcher.drain_changes(),
            None => return Vec::new(),
        };
        for kind in &changed {
            if let Err(err) = self.reload_root(*kind) {
                tracing::error!(target: "watch", root = kind.label(), "reload failed: {err}");
            }
        }
        changed
    }

    /// Moves the watcher onto a background thread. Returns `None` when hot reload is off or the
    /// watcher was already handed out.
    pub fn spawn_hot_reload(self: &Arc<Self>) -> Result<Option<HotReloadThread>, RuntimeError> {
        let Some(watcher) = lock(&self.watcher).take() else {
            return Ok(None);
        };
        let runtime: Weak<Self> = Arc::downgrade(self);
        let thread = HotReloadThread::spawn(watcher, self.config.watch_poll_interval(), move |kind| {
            if let Some(runtime) = runtime.upgrade() {
                if let Err(err) = runtime.reload_root(kind) {
                    tracing::error!(target: "watch", root = kind.label(), "reload failed: {err}");
                }
            }
        })
        .map_err(RuntimeError::Watch)?;
        Ok(Some(thread))
    }

    pub fn bind_all(&self) -> Result<BindReport, RuntimeError> {
        if self.state() == RuntimeState::ShutDown {
            return Err(RuntimeError::ShutDown);
        }
        Ok(self.binder.bind_all()?)
    }

    /// Disposes every behaviour and binds the current scene from scratch.
    pub fn reload_scene(&self) -> Result<BindReport, RuntimeError> {
        if self.state() == RuntimeState::ShutDown {
            return Err(RuntimeError::ShutDown);
        }
        let purged = self.scheduler.purge_behaviours();
        tracing::info!(target: "runtime", purged, "reloading scene");
        Ok(self.binder.bind_all()?)
    }

    /// Detaches from the tick source, disposes every receiver and releases the engine context.
    /// Only the first call does anything.
    pub fn shutdown(&self) -> bool {
        {
            let mut state = lock(&self.state);
            if *state == RuntimeState::ShutDown {
                return false;
            }
            *state = RuntimeState::ShutDown;
        }
        if let Some(listener) = lock(&self.listener).take() {
            self.ticks.remove_listener(listener);
        }
        self.ticks.unhook();
        let _ = lock(&self.watcher).take();
        let disposed = self.scheduler.shutdown();
        self.context.release();
        tracing::info!(target: "runtime", disposed, "runtime shut down");
        true
    }

    pub fn take_logs(&self) -> Vec<String> {
        self.engine.take_logs()
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.context
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn script_engine(&self) -> &Arc<ScriptEngine> {
        &self.engine
    }

    pub fn api(&self) -> &ScriptApi {
        &self.api
    }

    pub fn scripts(&self) -> &Arc<UnitCache> {
        &self.scripts
    }

    pub fn behaviours(&self) -> &Arc<UnitCache> {
        &self.behaviours
    }

    pub fn quests(&self) -> &ContentLoader<QuestDefinition> {
        &self.quests
    }

    pub fn encounters(&self) -> &ContentLoader<EncounterDefinition> {
        &self.encounters
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn ticks(&self) -> &TickSource {
        &self.ticks
    }
}

impl Drop for ScriptRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
