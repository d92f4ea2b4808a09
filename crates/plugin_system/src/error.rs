//! Error types for the plugin system.

use plugin_api::{InterfaceError, ServiceError};
use std::path::PathBuf;
use thiserror::Error;

/// A dependency cycle, listed from its first node back to that node again.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{}", self.path())]
pub struct CyclicDependencyError {
    cycle: Vec<String>,
}

impl CyclicDependencyError {
    pub fn new(cycle: Vec<String>) -> Self {
        Self { cycle }
    }

    pub fn cycle(&self) -> &[String] {
        &self.cycle
    }

    /// The cycle rendered as `A -> B -> A`.
    pub fn path(&self) -> String {
        self.cycle.join(" -> ")
    }
}

#[derive(Error, Debug)]
pub enum PluginSystemError {
    #[error("Circular dependency detected: {0}")]
    CyclicDependency(#[from] CyclicDependencyError),

    #[error("Plugin entry module not found: {}", expected.display())]
    MissingEntryModule { directory: PathBuf, expected: PathBuf },

    #[error("Expected exactly one plugin entry type in {}, found {found}", module.display())]
    MissingEntryType { module: PathBuf, found: usize },

    #[error("Plugin entry type '{type_name}' in {} declares no manifest", module.display())]
    MissingManifest { module: PathBuf, type_name: String },

    #[error("Plugin '{id}' failed to load from {}: {message}", directory.display())]
    LoadException {
        id: String,
        directory: PathBuf,
        message: String,
    },

    #[error("Could not open {} after {attempts} attempts", path.display())]
    FileLockTimeout { path: PathBuf, attempts: u32 },

    #[error("Plugin '{id}' did not unload cleanly: {message}")]
    UnloadFailure { id: String, message: String },

    #[error("Shared interface build failed: {0}")]
    InterfaceBuild(#[source] InterfaceError),

    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    #[error("Plugin already loaded: {0}")]
    PluginAlreadyLoaded(String),

    #[error("Library loading error: {0}")]
    Library(String),

    #[error("Invalid module metadata in {}: {message}", path.display())]
    Metadata { path: PathBuf, message: String },

    #[error("Plugin service error: {0}")]
    Service(#[from] ServiceError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PluginSystemError {
    /// Whether this error aborts a whole batch rather than a single plugin.
    pub fn is_batch_fatal(&self) -> bool {
        matches!(self, PluginSystemError::InterfaceBuild(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_path_format() {
        let error = CyclicDependencyError::new(vec!["A".into(), "B".into(), "A".into()]);
        assert_eq!(error.path(), "A -> B -> A");
        assert_eq!(error.to_string(), "A -> B -> A");

        let wrapped = PluginSystemError::from(error);
        assert_eq!(wrapped.to_string(), "Circular dependency detected: A -> B -> A");
    }

    #[test]
    fn test_only_interface_build_is_batch_fatal() {
        let build = PluginSystemError::InterfaceBuild(InterfaceError::NotFound("x".into()));
        assert!(build.is_batch_fatal());
        assert!(!PluginSystemError::PluginNotFound("x".into()).is_batch_fatal());
    }
}
