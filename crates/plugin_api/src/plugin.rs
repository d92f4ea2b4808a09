//! Core plugin trait and error type.
//!
//! Every hook on [`Plugin`] is synchronous: the host calls them while it
//! holds the single-writer lock at a safe point, so a plugin never observes
//! two lifecycle transitions at once.

use crate::interfaces::{InterfaceError, InterfaceRegistry};
use crate::services::ServiceError;
use std::any::Any;

/// Lifecycle surface every plugin entry type implements.
///
/// Plugin types are constructed by the host through the factory in their
/// [`PluginRegistration`](crate::PluginRegistration), which hands them their
/// `Arc<PluginServices>`. After construction the host calls, in order:
///
/// 1. [`load`](Plugin::load), with `hot_reload` set when the plugin replaces
///    a previous instance of itself
/// 2. The shared-interface hooks, once per container rebuild
/// 3. [`on_all_plugins_loaded`](Plugin::on_all_plugins_loaded), once after
///    the startup batch
/// 4. [`unload`](Plugin::unload), before the module is released
///
/// A panic inside any hook is caught by the host and treated like an `Err`.
pub trait Plugin: Send + 'static {
    /// Acquire resources and start working.
    fn load(&mut self, hot_reload: bool) -> Result<(), PluginError>;

    /// Release everything acquired in `load`.
    fn unload(&mut self) -> Result<(), PluginError>;

    /// Contribute shared interfaces to the container being built.
    fn configure_shared_interface(
        &mut self,
        _interfaces: &mut InterfaceRegistry,
    ) -> Result<(), PluginError> {
        Ok(())
    }

    /// Resolve interfaces contributed by other plugins.
    fn use_shared_interface(&mut self, _interfaces: &InterfaceRegistry) -> Result<(), PluginError> {
        Ok(())
    }

    /// Called after every consumer has resolved against the new container.
    fn on_shared_interface_injected(
        &mut self,
        _interfaces: &InterfaceRegistry,
    ) -> Result<(), PluginError> {
        Ok(())
    }

    /// Called once after the host finishes its initial load batch.
    fn on_all_plugins_loaded(&mut self) -> Result<(), PluginError> {
        Ok(())
    }
}

/// Errors raised by plugin code.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("Plugin initialization failed: {0}")]
    InitializationFailed(String),
    #[error("Plugin execution error: {0}")]
    ExecutionError(String),
    #[error("Invalid plugin manifest: {0}")]
    InvalidManifest(String),
    #[error("Shared interface error: {0}")]
    Interface(#[from] InterfaceError),
    #[error("Plugin service error: {0}")]
    Service(#[from] ServiceError),
    #[error("Plugin runtime error: {0}")]
    Runtime(String),
}

/// Extracts a readable message from a caught panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
