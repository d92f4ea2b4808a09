//! Per-plugin service container.
//!
//! The host builds a fresh [`PluginServices`] for every load attempt and
//! disposes it when the plugin is unloaded. Everything a plugin acquires
//! through it (event subscriptions in particular) is released on dispose.
//!
//! The scoped logger writes to the event bus's [`LogSink`](crate::LogSink),
//! which the host creates, so plugin messages reach the host's subscriber.

use crate::events::{EventBus, EventError, SubscriptionId};
use crate::logging::PluginLogger;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("IO error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Template file not found: {}", .0.display())]
    TemplateNotFound(PathBuf),
    #[error("Failed to parse {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },
    #[error("Failed to serialize {}: {message}", path.display())]
    Serialize { path: PathBuf, message: String },
    #[error("Services for plugin '{0}' have been disposed")]
    Disposed(String),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ServiceError + '_ {
    move |source| ServiceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Host-wide roots the per-plugin directories are derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSettings {
    pub config_root: PathBuf,
    pub data_root: PathBuf,
}

impl ServiceSettings {
    pub fn new(config_root: impl Into<PathBuf>, data_root: impl Into<PathBuf>) -> Self {
        Self {
            config_root: config_root.into(),
            data_root: data_root.into(),
        }
    }
}

/// Configuration files of one plugin, kept under `<config_root>/plugins/<id>`.
///
/// Templates ship with the plugin in `resources/templates/` and are copied
/// into place the first time they are requested.
#[derive(Debug, Clone)]
pub struct PluginConfiguration {
    base_path: PathBuf,
    plugin_directory: PathBuf,
    logger: PluginLogger,
}

impl PluginConfiguration {
    pub fn new(plugin_directory: impl Into<PathBuf>, config_root: &Path, logger: PluginLogger) -> Self {
        Self {
            base_path: config_root.join("plugins").join(logger.plugin_id()),
            plugin_directory: plugin_directory.into(),
            logger,
        }
    }

    /// The configuration directory, created on first use.
    pub fn root(&self) -> Result<&Path, ServiceError> {
        fs::create_dir_all(&self.base_path).map_err(io_error(&self.base_path))?;
        Ok(&self.base_path)
    }

    pub fn config_path(&self, name: &str) -> PathBuf {
        self.base_path.join(name)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.config_path(name).is_file()
    }

    pub fn template_path(&self, template: &str) -> PathBuf {
        self.plugin_directory
            .join("resources")
            .join("templates")
            .join(template)
    }

    /// Copies `resources/templates/<template>` to `<root>/<name>` unless the
    /// configuration file already exists.
    pub fn initialize_with_template(&self, name: &str, template: &str) -> Result<&Self, ServiceError> {
        let config_path = self.config_path(name);
        if config_path.exists() {
            return Ok(self);
        }

        let template_path = self.template_path(template);
        if !template_path.is_file() {
            return Err(ServiceError::TemplateNotFound(template_path));
        }

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).map_err(io_error(parent))?;
        }
        fs::copy(&template_path, &config_path).map_err(io_error(&config_path))?;
        self.logger.debug(&format!(
            "Initialized {} from template {}",
            config_path.display(),
            template_path.display()
        ));
        Ok(self)
    }

    /// Writes `model` as TOML to `<root>/<name>` unless the file exists.
    pub fn initialize_toml_with_model<T: Serialize>(&self, name: &str, model: &T) -> Result<&Self, ServiceError> {
        let config_path = self.config_path(name);
        if config_path.exists() {
            return Ok(self);
        }

        let content = toml::to_string_pretty(model).map_err(|e| ServiceError::Serialize {
            path: config_path.clone(),
            message: e.to_string(),
        })?;
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).map_err(io_error(parent))?;
        }
        fs::write(&config_path, content).map_err(io_error(&config_path))?;
        Ok(self)
    }

    pub fn load_toml<T: DeserializeOwned>(&self, name: &str) -> Result<T, ServiceError> {
        let config_path = self.config_path(name);
        let content = fs::read_to_string(&config_path).map_err(io_error(&config_path))?;
        toml::from_str(&content).map_err(|e| ServiceError::Parse {
            path: config_path,
            message: e.to_string(),
        })
    }
}

/// Everything the host hands to one plugin instance.
pub struct PluginServices {
    id: String,
    plugin_directory: PathBuf,
    data_directory: PathBuf,
    logger: PluginLogger,
    configuration: PluginConfiguration,
    events: Arc<EventBus>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    disposed: AtomicBool,
}

impl PluginServices {
    /// Builds the container and creates `<data_root>/<id>`.
    pub fn new(
        id: impl Into<String>,
        plugin_directory: impl Into<PathBuf>,
        settings: &ServiceSettings,
        events: Arc<EventBus>,
    ) -> Result<Self, ServiceError> {
        let id = id.into();
        let plugin_directory = plugin_directory.into();
        let data_directory = settings.data_root.join(&id);
        fs::create_dir_all(&data_directory).map_err(io_error(&data_directory))?;

        let logger = PluginLogger::new(id.clone(), Arc::clone(events.log_sink()));
        Ok(Self {
            configuration: PluginConfiguration::new(plugin_directory.clone(), &settings.config_root, logger.clone()),
            logger,
            id,
            plugin_directory,
            data_directory,
            events,
            subscriptions: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn plugin_directory(&self) -> &Path {
        &self.plugin_directory
    }

    pub fn data_directory(&self) -> &Path {
        &self.data_directory
    }

    pub fn logger(&self) -> &PluginLogger {
        &self.logger
    }

    pub fn configuration(&self) -> &PluginConfiguration {
        &self.configuration
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Subscribes on the shared bus and tracks the subscription for dispose.
    pub fn subscribe<F>(&self, topic: impl Into<String>, handler: F) -> Result<SubscriptionId, ServiceError>
    where
        F: Fn(&serde_json::Value) -> Result<(), EventError> + Send + Sync + 'static,
    {
        // Held across the check so dispose cannot slip in between.
        let mut subscriptions = self.subscriptions.lock();
        if self.is_disposed() {
            return Err(ServiceError::Disposed(self.id.clone()));
        }
        let id = self.events.subscribe(topic, handler);
        subscriptions.push(id);
        Ok(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscriptions.lock().retain(|tracked| *tracked != id);
        self.events.unsubscribe(id)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Removes every tracked subscription while keeping the container usable.
    pub fn revoke_subscriptions(&self) -> usize {
        let mut subscriptions = self.subscriptions.lock();
        subscriptions
            .drain(..)
            .filter(|id| self.events.unsubscribe(*id))
            .count()
    }

    /// Removes every tracked subscription and refuses new ones. Returns how
    /// many were removed.
    pub fn dispose(&self) -> usize {
        let mut subscriptions = self.subscriptions.lock();
        if self.disposed.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let removed = subscriptions
            .drain(..)
            .filter(|id| self.events.unsubscribe(*id))
            .count();
        self.logger
            .debug(&format!("Disposed services for plugin '{}' ({} subscriptions)", self.id, removed));
        removed
    }
}

impl std::fmt::Debug for PluginServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginServices")
            .field("id", &self.id)
            .field("plugin_directory", &self.plugin_directory)
            .field("data_directory", &self.data_directory)
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}
