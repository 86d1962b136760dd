use anyhow::{Context, Result};
use notify::event::ModifyKind;
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RootKind {
    Scripts,
    Behaviours,
    Quests,
    Encounters,
}

impl RootKind {
    pub const ALL: [RootKind; 4] = [RootKind::Scripts, RootKind::Behaviours, RootKind::Quests, RootKind::Encounters];

    pub fn label(self) -> &'static str {
        match self {
            RootKind::Scripts => "scripts",
            RootKind::Behaviours => "behaviours",
            RootKind::Quests => "quests",
            RootKind::Encounters => "encounters",
        }
    }
}

/// Roots registered for change detection, matched by normalized path prefix.
#[derive(Debug, Clone, Default)]
pub struct RootTable {
    roots: Vec<(PathBuf, RootKind)>,
}

impl RootTable {
    pub fn insert(&mut self, root: impl AsRef<Path>, kind: RootKind) -> bool {
        let normalized = normalize_watch_path(root.as_ref());
        if self.roots.iter().any(|(existing, _)| *existing == normalized) {
            return false;
        }
        self.roots.push((normalized, kind));
        true
    }

    /// The most specific registered root containing `path`.
    pub fn classify(&self, path: &Path) -> Option<RootKind> {
        let normalized = normalize_watch_path(path);
        self.roots
            .iter()
            .filter(|(root, _)| normalized.starts_with(root))
            .max_by_key(|(root, _)| root.components().count())
            .map(|(_, kind)| *kind)
    }

    pub fn roots(&self) -> &[(PathBuf, RootKind)] {
        &self.roots
    }
}

pub struct ScriptRootWatcher {
    watcher: RecommendedWatcher,
    rx: Receiver<notify::Result<Event>>,
    table: RootTable,
}

impl ScriptRootWatcher {
    pub fn new(poll_interval: Duration) -> Result<Self> {
        let (tx, rx) = channel();
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })?;
        watcher
            .configure(NotifyConfig::default().with_compare_contents(false).with_poll_interval(poll_interval))
            .context("configure script watcher")?;
        Ok(Self { watcher, rx, table: RootTable::default() })
    }

    pub fn watch_root(&mut self, root: impl AsRef<Path>, kind: RootKind) -> Result<()> {
        let root = root.as_ref();
        if !root.exists() {
            anyhow::bail!("path '{}' does not exist", root.display());
        }
        let normalized = normalize_watch_path(root);
        if !self.table.insert(&normalized, kind) {
            return Ok(());
        }
        self.watcher
            .watch(&normalized, RecursiveMode::Recursive)
            .with_context(|| format!("watch {}", normalized.display()))?;
        tracing::debug!(target: "watch", root = %normalized.display(), kind = kind.label(), "watching");
        Ok(())
    }

    pub fn table(&self) -> &RootTable {
        &self.table
    }

    /// Roots touched since the last drain, each reported once.
    pub fn drain_changes(&mut self) -> Vec<RootKind> {
        let mut changed = BTreeSet::new();
        while let Ok(event) = self.rx.try_recv() {
            match event {
                Ok(event) => {
                    if !is_relevant(&event.kind) {
                        continue;
                    }
                    changed.extend(event.paths.iter().filter_map(|path| self.table.classify(path)));
                }
                Err(err) => tracing::warn!(target: "watch", "script watcher error: {err}"),
            }
        }
        changed.into_iter().collect()
    }
}

fn is_relevant(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Modify(ModifyKind::Data(_))
            | EventKind::Modify(ModifyKind::Name(_))
            | EventKind::Modify(ModifyKind::Any)
            | EventKind::Create(_)
            | EventKind::Remove(_)
    )
}

pub(crate) fn normalize_watch_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else if let Ok(cwd) = env::current_dir() {
        cwd.join(path)
    } else {
        path.to_path_buf()
    };
    if let Ok(canonical) = fs::canonicalize(&absolute) {
        return canonical;
    }
    // Removed files no longer canonicalize; resolve through the parent instead.
    match (absolute.parent().and_then(|parent| fs::canonicalize(parent).ok()), absolute.file_name()) {
        (Some(parent), Some(name)) => parent.join(name),
        (Some(parent), None) => parent,
        _ => absolute,
    }
}

/// Drains a watcher on a background thread and reports each changed root to `on_change`.
pub struct HotReloadThread {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl HotReloadThread {
    pub fn spawn(
        mut watcher: ScriptRootWatcher,
        interval: Duration,
        mut on_change: impl FnMut(RootKind) + Send + 'static,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("script-hot-reload".into())
            .spawn(move || {
                while !flag.load(Ordering::Acquire) {
                    for kind in watcher.drain_changes() {
                        tracing::info!(target: "watch", root = kind.label(), "change detected");
                        on_change(kind);
                    }
                    thread::sleep(interval);
                }
            })
            .context("spawn hot reload thread")?;
        Ok(Self { stop, handle: Some(handle) })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!(target: "watch", "hot reload thread panicked");
            }
        }
    }
}

impl Drop for HotReloadThread {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn kind_label_matches_enum() {
        let labels: Vec<_> = RootKind::ALL.iter().map(|kind| kind.label()).collect();
        assert_eq!(labels, vec!["scripts", "behaviours", "quests", "encounters"]);
    }

    #[test]
    fn paths_classify_to_the_most_specific_root() {
        let dir = tempdir().unwrap();
        let scripts = dir.path().join("scripts");
        let quests = scripts.join("quests");
        fs::create_dir_all(&quests).unwrap();
        let mut table = RootTable::default();
        assert!(table.insert(&scripts, RootKind::Scripts));
        assert!(table.insert(&quests, RootKind::Quests));
        assert!(!table.insert(&scripts, RootKind::Behaviours));

        assert_eq!(table.classify(&scripts.join("a.rhai")), Some(RootKind::Scripts));
        assert_eq!(table.classify(&quests.join("gone.rhai")), Some(RootKind::Quests));
        assert_eq!(table.classify(&dir.path().join("elsewhere.rhai")), None);
    }

    #[test]
    fn missing_root_is_rejected() {
        let dir = tempdir().unwrap();
        let mut watcher = ScriptRootWatcher::new(Duration::from_millis(50)).unwrap();
        assert!(watcher.watch_root(dir.path().join("absent"), RootKind::Scripts).is_err());
        watcher.watch_root(dir.path(), RootKind::Scripts).unwrap();
        assert_eq!(watcher.table().roots().len(), 1);
    }

    #[test]
    fn hot_reload_thread_stops_on_request() {
        let watcher = ScriptRootWatcher::new(Duration::from_millis(50)).unwrap();
        let mut thread = HotReloadThread::spawn(watcher, Duration::from_millis(5), |_| {}).unwrap();
        assert!(thread.is_running());
        thread.stop();
        assert!(!thread.is_running());
    }
}
