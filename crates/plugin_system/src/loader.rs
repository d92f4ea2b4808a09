//! Loading and unloading of individual plugins.

use crate::context::{PluginContext, PluginStatus};
use crate::discovery::entry_module_path;
use crate::error::PluginSystemError;
use crate::isolation::{IsolationContext, ModuleLoader};
use crate::registry::PluginRegistry;
use plugin_api::{panic_message, EventBus, Plugin, PluginServices, ServiceSettings};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Turns plugin directories into running plugin contexts.
pub struct PluginLoader {
    modules: Arc<dyn ModuleLoader>,
    settings: ServiceSettings,
    events: Arc<EventBus>,
}

impl PluginLoader {
    pub fn new(modules: Arc<dyn ModuleLoader>, settings: ServiceSettings, events: Arc<EventBus>) -> Self {
        Self {
            modules,
            settings,
            events,
        }
    }

    pub fn modules(&self) -> &Arc<dyn ModuleLoader> {
        &self.modules
    }

    /// Loads the plugin in `directory` into a new context at the end of the
    /// registry and returns its index.
    ///
    /// The context is registered even when loading fails, with status
    /// `Error`, so the failure stays queryable. The caller must have removed
    /// any previous context for the directory.
    pub fn load(
        &self,
        registry: &mut PluginRegistry,
        directory: &Path,
        hot_reload: bool,
    ) -> Result<usize, PluginSystemError> {
        info!("🔄 Loading plugin from: {}", directory.display());

        let (index, superseded) = registry.insert(PluginContext::new(directory.to_path_buf(), hot_reload));
        if let Some(old) = superseded {
            warn!(
                "⚠️ Replaced stale context for {} (status {})",
                directory.display(),
                old.status()
            );
        }

        let Some(context) = registry.get_mut(index) else {
            return Err(PluginSystemError::PluginNotFound(directory.display().to_string()));
        };
        match self.try_load(context, hot_reload) {
            Ok(()) => {
                context.set_status(PluginStatus::Loaded);
                info!(
                    "✅ Successfully loaded plugin '{}' from {}",
                    context.id(),
                    directory.display()
                );
                Ok(index)
            }
            Err(e) => {
                error!("❌ Failed to load plugin from {}: {}", directory.display(), e);
                context.fail(PluginStatus::Error, e.to_string());
                Err(e)
            }
        }
    }

    fn try_load(&self, context: &mut PluginContext, hot_reload: bool) -> Result<(), PluginSystemError> {
        let directory = context.directory().to_path_buf();
        let entry = entry_module_path(&directory);
        if !entry.is_file() {
            return Err(PluginSystemError::MissingEntryModule {
                directory,
                expected: entry,
            });
        }

        let mut isolation = self.modules.open(&entry)?;
        let registration = match self.single_registration(isolation.as_ref()) {
            Ok(registration) => registration,
            Err(e) => {
                dispose_isolation(&mut isolation, &mut Vec::new());
                return Err(e);
            }
        };
        let Some(manifest) = registration.manifest.clone() else {
            dispose_isolation(&mut isolation, &mut Vec::new());
            return Err(PluginSystemError::MissingManifest {
                module: entry,
                type_name: registration.type_name.to_string(),
            });
        };
        if let Err(e) = manifest.validate() {
            dispose_isolation(&mut isolation, &mut Vec::new());
            return Err(PluginSystemError::Metadata {
                path: entry,
                message: e.to_string(),
            });
        }

        let id = manifest.id.clone();
        context.manifest = Some(manifest);

        let services = match PluginServices::new(&id, &directory, &self.settings, Arc::clone(&self.events)) {
            Ok(services) => Arc::new(services),
            Err(e) => {
                dispose_isolation(&mut isolation, &mut Vec::new());
                return Err(e.into());
            }
        };

        let factory = registration.factory;
        drop(registration);
        let mut instance = match catch_unwind(AssertUnwindSafe(|| factory(Arc::clone(&services)))) {
            Ok(instance) => instance,
            Err(panic) => {
                let message = format!("constructor panicked: {}", panic_message(panic.as_ref()));
                let failures = teardown(&id, None, Some(isolation), Some(services));
                return Err(load_exception(&id, &directory, message, failures));
            }
        };

        let result = match catch_unwind(AssertUnwindSafe(|| instance.load(hot_reload))) {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(panic) => Err(format!("load panicked: {}", panic_message(panic.as_ref()))),
        };

        match result {
            Ok(()) => {
                context.instance = Some(instance);
                context.isolation = Some(isolation);
                context.services = Some(services);
                Ok(())
            }
            Err(message) => {
                warn!("⚠️ Plugin '{}' failed in load, cleaning up", id);
                let failures = teardown(&id, Some(instance), Some(isolation), Some(services));
                Err(load_exception(&id, &directory, message, failures))
            }
        }
    }

    fn single_registration(
        &self,
        isolation: &dyn IsolationContext,
    ) -> Result<plugin_api::PluginRegistration, PluginSystemError> {
        let mut registrations = isolation.registrations()?;
        if registrations.len() != 1 {
            return Err(PluginSystemError::MissingEntryType {
                module: isolation.module_path().to_path_buf(),
                found: registrations.len(),
            });
        }
        Ok(registrations.remove(0))
    }

    /// Unloads a context.
    ///
    /// Unloading an `Unloaded` context is a no-op, as is unloading one that
    /// never finished loading. If any teardown step fails the context ends up
    /// `Indeterminate`.
    pub fn unload(&self, context: &mut PluginContext) -> Result<(), PluginSystemError> {
        if context.status() != PluginStatus::Loaded {
            return Ok(());
        }

        let id = context.id();
        info!("🔌 Unloading plugin '{}'", id);
        let failures = teardown(
            &id,
            context.instance.take(),
            context.isolation.take(),
            context.services.take(),
        );

        if failures.is_empty() {
            context.set_status(PluginStatus::Unloaded);
            info!("✅ Plugin '{}' unloaded", id);
            Ok(())
        } else {
            let message = failures.join("; ");
            error!("❌ Plugin '{}' did not unload cleanly: {}", id, message);
            context.fail(PluginStatus::Indeterminate, message.clone());
            Err(PluginSystemError::UnloadFailure { id, message })
        }
    }
}

fn load_exception(id: &str, directory: &Path, message: String, cleanup_failures: Vec<String>) -> PluginSystemError {
    let message = if cleanup_failures.is_empty() {
        message
    } else {
        format!("{message} (cleanup: {})", cleanup_failures.join("; "))
    };
    PluginSystemError::LoadException {
        id: id.to_string(),
        directory: directory.to_path_buf(),
        message,
    }
}

fn dispose_isolation(isolation: &mut Box<dyn IsolationContext>, failures: &mut Vec<String>) {
    if let Err(e) = isolation.dispose() {
        failures.push(format!("isolation dispose: {e}"));
    }
}

/// Releases a plugin in order: instance unload, isolation dispose, services
/// dispose. Every step runs even if an earlier one failed; the failures are
/// returned.
fn teardown(
    id: &str,
    instance: Option<Box<dyn Plugin>>,
    isolation: Option<Box<dyn IsolationContext>>,
    services: Option<Arc<PluginServices>>,
) -> Vec<String> {
    let mut failures = Vec::new();

    if let Some(mut instance) = instance {
        match catch_unwind(AssertUnwindSafe(|| instance.unload())) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => failures.push(format!("unload: {e}")),
            Err(panic) => failures.push(format!("unload panicked: {}", panic_message(panic.as_ref()))),
        }
        // The instance's code lives in the isolation context.
        if let Err(panic) = catch_unwind(AssertUnwindSafe(move || drop(instance))) {
            failures.push(format!("drop panicked: {}", panic_message(panic.as_ref())));
        }
    }

    // Event handlers are plugin code too and must not outlive the module.
    if let Some(services) = &services {
        let revoked = services.revoke_subscriptions();
        if revoked > 0 {
            info!("Removed {} event subscriptions left by '{}'", revoked, id);
        }
    }

    if let Some(mut isolation) = isolation {
        dispose_isolation(&mut isolation, &mut failures);
    }

    if let Some(services) = services {
        services.dispose();
    }

    failures
}
