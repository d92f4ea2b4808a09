//! Plugin host runtime.
//!
//! This crate discovers plugin directories, orders them by the modules they
//! export and reference, loads each one behind its own isolation boundary,
//! rebuilds the shared-interface registry after every batch of changes and
//! hot-reloads plugins when their entry modules change on disk.
//!
//! [`PluginManager`] is the entry point. It serializes every mutation behind
//! a single lock and applies queued hot reloads at host-defined safe points.

mod broker;
mod context;
mod discovery;
mod error;
mod hot_reload;
mod isolation;
mod loader;
mod manager;
mod registry;
mod resolver;

#[cfg(test)]
mod tests;

pub use broker::InterfaceBroker;
pub use context::{PluginContext, PluginStatus};
pub use discovery::{
    entry_module_directory, entry_module_path, enumerate_plugin_directories, find_plugin_directory,
    is_plugin_directory_name, plugin_directory_name,
};
pub use error::{CyclicDependencyError, PluginSystemError};
pub use hot_reload::{
    probe_file, FileChange, HotReloadConfig, PluginWatcher, PolicySource, ProbeOutcome,
    ReloadCoordinator, ReloadRequest, ReloadTrigger, WatchState,
};
pub use isolation::{IsolationContext, ModuleLoader, NativeModuleLoader, SharedModuleTable, StaticModuleLoader};
pub use loader::PluginLoader;
pub use manager::{LoadSummary, PluginInfo, PluginManager, PluginManagerConfig, SafePointKind};
pub use registry::PluginRegistry;
pub use resolver::{read_module_metadata, DependencyGraph, DependencyGraphResolver, ExportedModule, ModuleMetadata};

/// Re-export of the plugin contract so hosts need only one dependency.
pub use plugin_api;
