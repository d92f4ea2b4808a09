//! Per-plugin runtime state.

use crate::discovery::plugin_directory_name;
use crate::isolation::IsolationContext;
use plugin_api::{Plugin, PluginManifest, PluginServices, ReloadPolicy};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Lifecycle status of a [`PluginContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginStatus {
    Loading,
    Loaded,
    Error,
    Unloaded,
    /// Unload failed part way; the plugin's resources may still be held.
    Indeterminate,
}

impl PluginStatus {
    pub fn can_transition_to(self, next: PluginStatus) -> bool {
        use PluginStatus::*;
        matches!(
            (self, next),
            (Loading, Loaded) | (Loading, Error) | (Loaded, Unloaded) | (Unloaded, Loading) | (_, Indeterminate)
        )
    }

    /// Statuses a fresh load attempt may replace.
    pub fn is_inactive(self) -> bool {
        matches!(
            self,
            PluginStatus::Unloaded | PluginStatus::Error | PluginStatus::Indeterminate
        )
    }
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PluginStatus::Loading => "loading",
            PluginStatus::Loaded => "loaded",
            PluginStatus::Error => "error",
            PluginStatus::Unloaded => "unloaded",
            PluginStatus::Indeterminate => "indeterminate",
        };
        f.write_str(name)
    }
}

/// Everything the host holds for one plugin directory.
///
/// The context exclusively owns the isolation context, the instance and the
/// services container. The instance must be dropped before its isolation
/// context is disposed, since its code lives in that module.
pub struct PluginContext {
    directory: PathBuf,
    status: PluginStatus,
    pub(crate) manifest: Option<PluginManifest>,
    pub(crate) instance: Option<Box<dyn Plugin>>,
    pub(crate) isolation: Option<Box<dyn IsolationContext>>,
    pub(crate) services: Option<Arc<PluginServices>>,
    pub(crate) last_error: Option<String>,
    hot_reload: bool,
}

impl PluginContext {
    pub(crate) fn new(directory: PathBuf, hot_reload: bool) -> Self {
        Self {
            directory,
            status: PluginStatus::Loading,
            manifest: None,
            instance: None,
            isolation: None,
            services: None,
            last_error: None,
            hot_reload,
        }
    }

    /// Manifest id when known, otherwise the directory name.
    pub fn id(&self) -> String {
        match &self.manifest {
            Some(manifest) => manifest.id.clone(),
            None => plugin_directory_name(&self.directory),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn status(&self) -> PluginStatus {
        self.status
    }

    pub fn manifest(&self) -> Option<&PluginManifest> {
        self.manifest.as_ref()
    }

    pub fn reload_policy(&self) -> ReloadPolicy {
        self.manifest
            .as_ref()
            .map(|manifest| manifest.reload_policy)
            .unwrap_or_default()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Whether this context was created by a reload.
    pub fn is_hot_reload(&self) -> bool {
        self.hot_reload
    }

    pub fn is_loaded(&self) -> bool {
        self.status == PluginStatus::Loaded
    }

    pub(crate) fn set_status(&mut self, next: PluginStatus) {
        if !self.status.can_transition_to(next) {
            warn!(
                "⚠️ Unexpected status change for '{}': {} -> {}",
                self.id(),
                self.status,
                next
            );
        }
        debug!("Plugin '{}' {} -> {}", self.id(), self.status, next);
        self.status = next;
    }

    pub(crate) fn fail(&mut self, status: PluginStatus, message: String) {
        self.last_error = Some(message);
        self.set_status(status);
    }

    /// Runs `hook` against the live instance, if any.
    pub(crate) fn with_instance<R>(&mut self, hook: impl FnOnce(&mut dyn Plugin) -> R) -> Option<R> {
        let instance = self.instance.as_mut()?;
        Some(hook(instance.as_mut()))
    }
}

impl fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginContext")
            .field("id", &self.id())
            .field("directory", &self.directory)
            .field("status", &self.status)
            .field("hot_reload", &self.hot_reload)
            .field("last_error", &self.last_error)
            .finish_non_exhaustive()
    }
}
