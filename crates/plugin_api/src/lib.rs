//! # Plugin API
//!
//! The contract between the plugin host runtime and the dynamically loaded
//! plugins it manages. Both sides link against this crate so that the types
//! crossing the module boundary agree.
//!
//! ## What a plugin provides
//!
//! - A type implementing [`Plugin`], constructed from an `Arc<PluginServices>`
//! - A [`PluginManifest`] describing its id, version and [`ReloadPolicy`]
//! - The exported `plugin_registrations` symbol, generated by [`declare_plugin!`]
//!
//! ## What the host provides
//!
//! - [`PluginServices`]: a per-plugin container with a scoped logger,
//!   configuration access, a data directory and an [`EventBus`] handle
//! - [`InterfaceRegistry`]: the shared-interface container rebuilt after every
//!   batch of lifecycle changes
//! - [`LogSink`]: where plugin log records end up. Plugins should log through
//!   [`PluginServices::logger`] rather than calling `tracing` themselves; a
//!   plugin's own `tracing` copy has no subscriber installed.
//!
//! ## Example
//!
//! ```rust,no_run
//! use plugin_api::*;
//! use std::sync::Arc;
//!
//! pub struct HelloPlugin {
//!     services: Arc<PluginServices>,
//! }
//!
//! impl HelloPlugin {
//!     pub fn new(services: Arc<PluginServices>) -> Self {
//!         Self { services }
//!     }
//! }
//!
//! impl Plugin for HelloPlugin {
//!     fn load(&mut self, hot_reload: bool) -> Result<(), PluginError> {
//!         self.services.logger().info(&format!("hello (hot reload: {hot_reload})"));
//!         Ok(())
//!     }
//!
//!     fn unload(&mut self) -> Result<(), PluginError> {
//!         Ok(())
//!     }
//! }
//!
//! declare_plugin!(HelloPlugin, PluginManifest::new("hello", "1.0.0"));
//! ```

pub mod events;
pub mod interfaces;
pub mod logging;
pub mod macros;
pub mod manifest;
pub mod plugin;
pub mod registration;
pub mod services;

pub use events::{EventBus, EventError, EventStats, SubscriptionId};
pub use interfaces::{InterfaceError, InterfaceRegistry, RegistryState};
pub use logging::{LogLevel, LogSink, PluginLogger, TracingLogSink, PLUGIN_LOG_TARGET};
pub use manifest::{PluginManifest, ReloadPolicy};
pub use plugin::{panic_message, Plugin, PluginError};
pub use registration::{PluginFactory, PluginRegistration, RegistrationFn, REGISTRATION_SYMBOL};
pub use services::{PluginConfiguration, PluginServices, ServiceError, ServiceSettings};
