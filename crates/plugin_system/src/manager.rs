//! Plugin manager: the single writer over the plugin registry.
//!
//! Every operation that changes the set of running plugins takes the manager
//! lock, performs one batch of loads or unloads, and finishes with exactly one
//! shared-interface rebuild. Background tasks (the hot reload coordinator in
//! particular) never mutate plugins directly; they push [`ReloadRequest`]s
//! onto a queue that [`PluginManager::safe_point`] drains.

use crate::broker::InterfaceBroker;
use crate::context::{PluginContext, PluginStatus};
use crate::discovery::{enumerate_plugin_directories, find_plugin_directory, plugin_directory_name};
use crate::error::PluginSystemError;
use crate::hot_reload::{PolicySource, ReloadRequest, ReloadTrigger};
use crate::isolation::ModuleLoader;
use crate::loader::PluginLoader;
use crate::registry::PluginRegistry;
use crate::resolver::DependencyGraphResolver;
use parking_lot::Mutex;
use plugin_api::{EventBus, InterfaceRegistry, PluginManifest, ReloadPolicy, ServiceSettings};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Where the host is when it hands control to the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafePointKind {
    /// Regular main-loop tick.
    Tick,
    /// Level or world transition; deferred reloads run here.
    LevelTransition,
}

#[derive(Debug, Clone)]
pub struct PluginManagerConfig {
    pub plugins_root: PathBuf,
    pub services: ServiceSettings,
    /// Directory names loaded first, in this order, during [`PluginManager::load_all`].
    pub load_order: Vec<String>,
}

impl PluginManagerConfig {
    pub fn new(plugins_root: impl Into<PathBuf>, services: ServiceSettings) -> Self {
        Self {
            plugins_root: plugins_root.into(),
            services,
            load_order: Vec::new(),
        }
    }

    pub fn with_load_order(mut self, load_order: Vec<String>) -> Self {
        self.load_order = load_order;
        self
    }
}

/// Snapshot of one plugin context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginInfo {
    pub id: String,
    pub directory: PathBuf,
    pub status: PluginStatus,
    pub manifest: Option<PluginManifest>,
    pub last_error: Option<String>,
}

impl From<&PluginContext> for PluginInfo {
    fn from(context: &PluginContext) -> Self {
        Self {
            id: context.id(),
            directory: context.directory().to_path_buf(),
            status: context.status(),
            manifest: context.manifest().cloned(),
            last_error: context.last_error().map(str::to_string),
        }
    }
}

/// Outcome of [`PluginManager::load_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub loaded: Vec<String>,
    /// Plugin id (or directory name) and the error it failed with.
    pub failed: Vec<(String, String)>,
}

struct ManagerState {
    registry: PluginRegistry,
    broker: InterfaceBroker,
    parked: Vec<ReloadRequest>,
}

pub struct PluginManager {
    config: PluginManagerConfig,
    loader: PluginLoader,
    events: Arc<EventBus>,
    state: Mutex<ManagerState>,
    reload_tx: mpsc::UnboundedSender<ReloadRequest>,
    reload_rx: Mutex<mpsc::UnboundedReceiver<ReloadRequest>>,
}

impl PluginManager {
    pub fn new(config: PluginManagerConfig, modules: Arc<dyn ModuleLoader>, events: Arc<EventBus>) -> Self {
        let (reload_tx, reload_rx) = mpsc::unbounded_channel();
        let broker = InterfaceBroker::with_log_sink(Arc::clone(events.log_sink()));
        Self {
            loader: PluginLoader::new(modules, config.services.clone(), Arc::clone(&events)),
            config,
            events,
            state: Mutex::new(ManagerState {
                registry: PluginRegistry::new(),
                broker,
                parked: Vec::new(),
            }),
            reload_tx,
            reload_rx: Mutex::new(reload_rx),
        }
    }

    pub fn plugins_root(&self) -> &Path {
        &self.config.plugins_root
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Sender for queueing reloads from background tasks.
    pub fn reload_sender(&self) -> mpsc::UnboundedSender<ReloadRequest> {
        self.reload_tx.clone()
    }

    /// Loads every plugin under the plugins root.
    ///
    /// Exports are loaded first in dependency order, then plugins in an
    /// order where exporters precede the plugins referencing them. A cycle
    /// falls back to discovery order. Directories named in the configured
    /// load order go first. Individual failures are collected in the
    /// summary; only a failed interface build is returned as an error.
    pub fn load_all(&self) -> Result<LoadSummary, PluginSystemError> {
        let root = self.config.plugins_root.clone();
        info!("🔌 Loading plugins from: {}", root.display());

        let mut guard = self.state.lock();
        let state = &mut *guard;

        let mut resolver = DependencyGraphResolver::new();
        if let Err(e) = resolver.analyze_dependencies(&root) {
            error!("❌ Failed to analyze plugin exports: {}", e);
        }
        self.load_exports(&resolver);

        let directories = enumerate_plugin_directories(&root).unwrap_or_else(|e| {
            error!("❌ Failed to enumerate plugin directories: {}", e);
            Vec::new()
        });
        let ordered = match resolver.plugin_load_order(&directories) {
            Ok(ordered) => ordered,
            Err(cycle) => {
                warn!(
                    "⚠️ Circular plugin dependency detected: {}. Loading in discovery order",
                    cycle
                );
                directories
            }
        };
        let ordered = apply_manual_order(ordered, &self.config.load_order);

        let mut summary = LoadSummary::default();
        for directory in ordered {
            if let Some(index) = state.registry.position_by_directory(&directory) {
                if state.registry.get(index).is_some_and(PluginContext::is_loaded) {
                    debug!("Plugin in {} already loaded", directory.display());
                    continue;
                }
                state.registry.remove(index);
            }

            match self.loader.load(&mut state.registry, &directory, false) {
                Ok(index) => {
                    if let Some(context) = state.registry.get(index) {
                        summary.loaded.push(context.id());
                    }
                }
                Err(e) => {
                    let id = state
                        .registry
                        .find_by_directory(&directory)
                        .map(PluginContext::id)
                        .unwrap_or_else(|| plugin_directory_name(&directory));
                    summary.failed.push((id, e.to_string()));
                }
            }
        }

        state.broker.rebuild(&mut state.registry)?;
        state.broker.notify_all_loaded(&mut state.registry);

        info!(
            "✅ Loaded {} plugins ({} failed)",
            summary.loaded.len(),
            summary.failed.len()
        );
        Ok(summary)
    }

    fn load_exports(&self, resolver: &DependencyGraphResolver) {
        let order = match resolver.load_order() {
            Ok(order) => order,
            Err(cycle) => {
                warn!(
                    "⚠️ Circular export dependency detected: {}. Loading exports in discovery order",
                    cycle
                );
                resolver.discovery_order()
            }
        };
        for path in order {
            if let Err(e) = self.loader.modules().load_shared(&path) {
                warn!("⚠️ Failed to load export {}: {}", path.display(), e);
            }
        }
    }

    /// Loads the plugin `id`.
    ///
    /// A stale context with that id (unloaded, failed or indeterminate) is
    /// replaced by a fresh load attempt; otherwise the plugin tree is
    /// searched for a directory of that name.
    pub fn load_by_id(&self, id: &str) -> Result<(), PluginSystemError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let directory = match state.registry.find_by_id(id) {
            Some(context) if context.is_loaded() => {
                return Err(PluginSystemError::PluginAlreadyLoaded(id.to_string()));
            }
            Some(context) => context.directory().to_path_buf(),
            None => find_plugin_directory(&self.config.plugins_root, id)?
                .ok_or_else(|| PluginSystemError::PluginNotFound(id.to_string()))?,
        };

        if let Some(index) = state.registry.position_by_directory(&directory) {
            if state.registry.get(index).is_some_and(PluginContext::is_loaded) {
                return Err(PluginSystemError::PluginAlreadyLoaded(id.to_string()));
            }
            state.registry.remove(index);
        }

        let result = self.loader.load(&mut state.registry, &directory, false).map(|_| ());
        state.broker.rebuild(&mut state.registry)?;
        result
    }

    /// Unloads the plugin `id`. Unloading an already unloaded plugin succeeds.
    pub fn unload_by_id(&self, id: &str) -> Result<(), PluginSystemError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let index = state
            .registry
            .position_by_id(id)
            .ok_or_else(|| PluginSystemError::PluginNotFound(id.to_string()))?;
        let Some(context) = state.registry.get_mut(index) else {
            return Err(PluginSystemError::PluginNotFound(id.to_string()));
        };
        if !context.is_loaded() {
            debug!("Plugin '{}' is not loaded ({}), nothing to unload", id, context.status());
            return Ok(());
        }

        // Interfaces may hold code from the module about to be released.
        state.broker.dispose();
        let result = self.loader.unload(context);
        state.broker.rebuild(&mut state.registry)?;
        result
    }

    /// Unloads the plugin `id` and loads it again from the same directory.
    pub fn reload_by_id(&self, id: &str) -> Result<(), PluginSystemError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let index = state
            .registry
            .position_by_id(id)
            .ok_or_else(|| PluginSystemError::PluginNotFound(id.to_string()))?;

        state.broker.dispose();
        let result = self.reload_at(&mut state.registry, index);
        state.broker.rebuild(&mut state.registry)?;
        result
    }

    fn reload_at(&self, registry: &mut PluginRegistry, index: usize) -> Result<(), PluginSystemError> {
        let Some(context) = registry.get_mut(index) else {
            return Ok(());
        };
        let directory = context.directory().to_path_buf();
        info!("🔄 Reloading plugin '{}'", context.id());

        self.loader.unload(context)?;
        // The old context goes before the new one exists.
        registry.remove(index);
        self.loader.load(registry, &directory, true).map(|_| ())
    }

    /// Applies queued reload requests.
    ///
    /// Requests for plugins with [`ReloadPolicy::ReloadOnNextSafePoint`] are
    /// parked until a [`SafePointKind::LevelTransition`]. Requests for the
    /// same directory coalesce. Returns the number of plugins reloaded.
    pub fn safe_point(&self, kind: SafePointKind) -> Result<usize, PluginSystemError> {
        let mut incoming = Vec::new();
        {
            let mut reload_rx = self.reload_rx.lock();
            while let Ok(request) = reload_rx.try_recv() {
                incoming.push(request);
            }
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;

        let mut due: Vec<ReloadRequest> = Vec::new();
        if kind == SafePointKind::LevelTransition {
            due.append(&mut state.parked);
        }

        for request in incoming {
            let Some(context) = state.registry.find_by_directory(&request.directory) else {
                debug!("No plugin in {}, dropping reload request", request.directory.display());
                continue;
            };
            match (request.trigger, context.reload_policy()) {
                (ReloadTrigger::Manual, _) => due.push(request),
                (ReloadTrigger::FileChange, ReloadPolicy::OnlyManualReload) => {
                    debug!("Plugin '{}' only reloads manually", context.id());
                }
                (ReloadTrigger::FileChange, ReloadPolicy::ReloadOnNextSafePoint)
                    if kind != SafePointKind::LevelTransition =>
                {
                    info!("⏸️ Deferring reload of '{}' to the next level transition", context.id());
                    state.parked.retain(|parked| parked.directory != request.directory);
                    state.parked.push(request);
                }
                _ => due.push(request),
            }
        }

        let mut directories: Vec<PathBuf> = Vec::new();
        for request in due {
            if !directories.contains(&request.directory) {
                directories.push(request.directory);
            }
        }
        if directories.is_empty() {
            return Ok(0);
        }

        state.broker.dispose();
        let mut reloaded = 0;
        for directory in directories {
            let Some(index) = state.registry.position_by_directory(&directory) else {
                continue;
            };
            match self.reload_at(&mut state.registry, index) {
                Ok(()) => reloaded += 1,
                Err(e) => warn!("⚠️ Hot reload of {} failed: {}", directory.display(), e),
            }
        }
        state.broker.rebuild(&mut state.registry)?;
        Ok(reloaded)
    }

    /// Unloads every loaded plugin in reverse load order and disposes the
    /// shared interfaces.
    pub fn shutdown(&self) {
        info!("🛑 Shutting down plugins");
        let mut guard = self.state.lock();
        let state = &mut *guard;

        state.broker.dispose();
        state.parked.clear();
        for context in state.registry.iter_mut().rev() {
            if let Err(e) = self.loader.unload(context) {
                error!("❌ {}", e);
            }
        }
        info!("✅ All plugins shut down");
    }

    pub fn list_plugins(&self) -> Vec<PluginInfo> {
        self.state.lock().registry.iter().map(PluginInfo::from).collect()
    }

    pub fn status_of(&self, id: &str) -> Option<PluginStatus> {
        self.state.lock().registry.find_by_id(id).map(PluginContext::status)
    }

    pub fn metadata_of(&self, id: &str) -> Option<PluginManifest> {
        self.state
            .lock()
            .registry
            .find_by_id(id)
            .and_then(|context| context.manifest().cloned())
    }

    pub fn path_of(&self, id: &str) -> Option<PathBuf> {
        self.state
            .lock()
            .registry
            .find_by_id(id)
            .map(|context| context.directory().to_path_buf())
    }

    pub fn all_statuses(&self) -> Vec<(String, PluginStatus)> {
        self.state
            .lock()
            .registry
            .iter()
            .map(|context| (context.id(), context.status()))
            .collect()
    }

    pub fn all_metadata(&self) -> Vec<PluginManifest> {
        self.state
            .lock()
            .registry
            .iter()
            .filter_map(|context| context.manifest().cloned())
            .collect()
    }

    pub fn contexts_for_directory(&self, directory: &Path) -> usize {
        self.state.lock().registry.contexts_for_directory(directory)
    }

    pub fn loaded_count(&self) -> usize {
        self.state.lock().registry.loaded_count()
    }

    pub fn parked_reloads(&self) -> usize {
        self.state.lock().parked.len()
    }

    /// Runs `f` against the current shared-interface registry.
    pub fn with_interfaces<R>(&self, f: impl FnOnce(&InterfaceRegistry) -> R) -> R {
        f(self.state.lock().broker.interfaces())
    }
}

impl PolicySource for PluginManager {
    fn reload_policy(&self, directory: &Path) -> Option<ReloadPolicy> {
        self.state
            .lock()
            .registry
            .find_by_directory(directory)
            .filter(|context| context.is_loaded())
            .map(PluginContext::reload_policy)
    }
}

/// Moves directories named in `load_order` to the front, in that order.
fn apply_manual_order(directories: Vec<PathBuf>, load_order: &[String]) -> Vec<PathBuf> {
    if load_order.is_empty() {
        return directories;
    }

    let mut remaining = directories;
    let mut ordered = Vec::with_capacity(remaining.len());
    for name in load_order {
        match remaining.iter().position(|dir| plugin_directory_name(dir) == *name) {
            Some(position) => ordered.push(remaining.remove(position)),
            None => warn!("⚠️ Plugin '{}' in load order was not found", name),
        }
    }
    ordered.extend(remaining);
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_order_moves_listed_first() {
        let directories: Vec<PathBuf> = ["a", "b", "c", "d"].iter().map(PathBuf::from).collect();
        let ordered = apply_manual_order(directories, &["c".to_string(), "missing".to_string(), "a".to_string()]);
        assert_eq!(
            ordered,
            ["c", "a", "b", "d"].iter().map(PathBuf::from).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_empty_manual_order_keeps_order() {
        let directories: Vec<PathBuf> = ["b", "a"].iter().map(PathBuf::from).collect();
        assert_eq!(apply_manual_order(directories.clone(), &[]), directories);
    }
}
