use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use rhai::{Scope, AST, FLOAT, INT};

use super::{ScriptApi, ScriptEngine, ScriptError};
use crate::events::lock;
use crate::guard::isolate;
use crate::time::TickSignal;

pub struct ScriptUnit {
    pub name: String,
    pub source_path: PathBuf,
    pub source_hash: blake3::Hash,
    pub ast: AST,
    pub compiled_at: SystemTime,
}

impl std::fmt::Debug for ScriptUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptUnit")
            .field("name", &self.name)
            .field("source_path", &self.source_path)
            .field("source_hash", &self.source_hash.to_hex().as_str())
            .finish_non_exhaustive()
    }
}

/// An immutable, fully built set of units. Published as a whole and never patched.
#[derive(Debug, Default)]
pub struct CompiledSet {
    root: PathBuf,
    generation: u64,
    units: Vec<Arc<ScriptUnit>>,
}

impl CompiledSet {
    pub fn empty(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), generation: 0, units: Vec::new() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn units(&self) -> &[Arc<ScriptUnit>] {
        &self.units
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ScriptUnit>> {
        self.units.iter().find(|unit| unit.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.units.iter().map(|unit| unit.name.as_str()).collect()
    }
}

#[derive(Debug)]
pub struct CompileFailure {
    pub path: PathBuf,
    pub error: ScriptError,
}

#[derive(Debug)]
pub struct CompileReport {
    pub set: CompiledSet,
    pub failures: Vec<CompileFailure>,
    pub reused: usize,
}

#[derive(Clone)]
pub struct ScriptCompiler {
    engine: Arc<ScriptEngine>,
    extension: String,
}

impl ScriptCompiler {
    pub fn new(engine: Arc<ScriptEngine>, extension: impl Into<String>) -> Self {
        let extension = extension.into().trim_start_matches('.').to_string();
        Self { engine, extension }
    }

    pub fn engine(&self) -> &Arc<ScriptEngine> {
        &self.engine
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Compiles every matching file under `root` in isolation. Only an unreadable root is an
    /// error; per-file failures are returned in the report. Units of `previous` whose source hash
    /// is unchanged are reused instead of recompiled.
    pub fn compile_all(&self, root: &Path, previous: Option<&CompiledSet>) -> Result<CompileReport, ScriptError> {
        let mut sources = Vec::new();
        self.discover(root, &mut sources)
            .map_err(|source| ScriptError::Root { path: root.to_path_buf(), source })?;
        sources.sort();

        let cached: HashMap<&Path, &Arc<ScriptUnit>> = previous
            .map(|set| set.units.iter().map(|unit| (unit.source_path.as_path(), unit)).collect())
            .unwrap_or_default();

        let mut units = Vec::with_capacity(sources.len());
        let mut failures = Vec::new();
        let mut reused = 0;
        for path in sources {
            let source = match fs::read_to_string(&path) {
                Ok(source) => source,
                Err(source) => {
                    failures.push(CompileFailure { error: ScriptError::Read { path: path.clone(), source }, path });
                    continue;
                }
            };
            let hash = blake3::hash(source.as_bytes());
            if let Some(existing) = cached.get(path.as_path()) {
                if existing.source_hash == hash {
                    units.push(Arc::clone(existing));
                    reused += 1;
                    continue;
                }
            }
            match self.engine.rhai().compile(&source) {
                Ok(ast) => units.push(Arc::new(ScriptUnit {
                    name: unit_name(root, &path),
                    source_path: path,
                    source_hash: hash,
                    ast,
                    compiled_at: SystemTime::now(),
                })),
                Err(err) => failures.push(CompileFailure {
                    error: ScriptError::Compile { path: path.clone(), message: err.to_string() },
                    path,
                }),
            }
        }
        let generation = previous.map_or(0, |set| set.generation) + 1;
        Ok(CompileReport { set: CompiledSet { root: root.to_path_buf(), generation, units }, failures, reused })
    }

    fn discover(&self, dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                self.discover(&path, out)?;
            } else if file_type.is_file()
                && path.extension().and_then(|ext| ext.to_str()).is_some_and(|ext| ext == self.extension)
            {
                out.push(path);
            }
        }
        Ok(())
    }
}

/// Units are addressed by their path relative to the root, without extension, using `/`.
fn unit_name(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path).with_extension("");
    relative.components().map(|part| part.as_os_str().to_string_lossy()).collect::<Vec<_>>().join("/")
}

/// Holds the active set for one root and swaps it atomically on reload.
pub struct UnitCache {
    label: &'static str,
    root: PathBuf,
    compiler: ScriptCompiler,
    active: RwLock<Arc<CompiledSet>>,
    reload_guard: Mutex<()>,
    reloads: AtomicU64,
}

impl UnitCache {
    pub fn new(label: &'static str, root: impl Into<PathBuf>, compiler: ScriptCompiler) -> Self {
        let root = root.into();
        Self {
            label,
            active: RwLock::new(Arc::new(CompiledSet::empty(root.clone()))),
            root,
            compiler,
            reload_guard: Mutex::new(()),
            reloads: AtomicU64::new(0),
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn compiler(&self) -> &ScriptCompiler {
        &self.compiler
    }

    pub fn snapshot(&self) -> Arc<CompiledSet> {
        match self.active.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<ScriptUnit>> {
        self.snapshot().get(name).cloned()
    }

    pub fn reload_count(&self) -> u64 {
        self.reloads.load(Ordering::Relaxed)
    }

    /// Recompiles the whole root and publishes the result. When the root cannot be read the
    /// previous set stays active and the error is returned.
    pub fn reload(&self) -> Result<Arc<CompiledSet>, ScriptError> {
        let _serialized = lock(&self.reload_guard);
        let previous = self.snapshot();
        let report = match self.compiler.compile_all(&self.root, Some(&previous)) {
            Ok(report) => report,
            Err(err) => {
                tracing::error!(
                    target: "script",
                    cache = self.label,
                    "recompile failed, keeping {} units: {err}",
                    previous.len()
                );
                return Err(err);
            }
        };
        for failure in &report.failures {
            tracing::error!(target: "script", cache = self.label, "{}", failure.error);
        }
        let published = Arc::new(report.set);
        match self.active.write() {
            Ok(mut guard) => *guard = Arc::clone(&published),
            Err(poisoned) => *poisoned.into_inner() = Arc::clone(&published),
        }
        self.reloads.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            target: "script",
            cache = self.label,
            units = published.len(),
            failed = report.failures.len(),
            reused = report.reused,
            generation = published.generation(),
            "compiled {}",
            self.root.display()
        );
        Ok(published)
    }
}

/// Tick indices past `INT::MAX` saturate instead of wrapping negative.
fn script_tick(tick_index: u64) -> INT {
    INT::try_from(tick_index).unwrap_or(INT::MAX)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnitRunStats {
    pub ran: usize,
    pub failed: usize,
}

/// Re-runs every unit of the active set once per tick with `engine`, `dt` and `tick` in scope.
pub struct ScriptUnitRunner {
    cache: Arc<UnitCache>,
    api: ScriptApi,
}

impl ScriptUnitRunner {
    pub fn new(cache: Arc<UnitCache>, api: ScriptApi) -> Self {
        Self { cache, api }
    }

    pub fn cache(&self) -> &Arc<UnitCache> {
        &self.cache
    }

    pub fn run(&self, signal: TickSignal) -> UnitRunStats {
        let set = self.cache.snapshot();
        let engine = self.cache.compiler.engine();
        let mut stats = UnitRunStats::default();
        for unit in set.units() {
            let result = isolate(|| {
                let mut scope = Scope::new();
                scope.push("engine", self.api.clone());
                scope.push_constant("dt", signal.dt as FLOAT);
                scope.push_constant("tick", script_tick(signal.tick_index));
                engine
                    .rhai()
                    .run_ast_with_scope(&mut scope, &unit.ast)
                    .map_err(|err| {
                        anyhow::Error::new(ScriptError::Eval { unit: unit.name.clone(), message: err.to_string() })
                    })
            });
            match result {
                Ok(()) => stats.ran += 1,
                Err(fault) => {
                    stats.failed += 1;
                    tracing::error!(target: "script", unit = %unit.name, tick = signal.tick_index, "{fault}");
                }
            }
        }
        stats
    }
}
