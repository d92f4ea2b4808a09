//! Configuration management for the plugin host.
//!
//! This module handles loading, validation, and conversion of host
//! configuration from TOML files and command-line arguments.

use plugin_system::plugin_api::ServiceSettings;
use plugin_system::{HotReloadConfig, PluginManagerConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Default tick interval for serde deserialization
fn default_tick_interval() -> u64 {
    50 // 20 ticks per second
}

fn default_debounce_ms() -> u64 {
    2000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_retry_delay_ms() -> u64 {
    500
}

fn default_enabled() -> bool {
    true
}

/// Application configuration loaded from TOML file.
///
/// Every section may be omitted; missing sections and fields take their
/// defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Plugin discovery and storage locations
    #[serde(default)]
    pub plugins: PluginSettings,
    /// File watching and reload timing
    #[serde(default)]
    pub hot_reload: HotReloadSettings,
    /// Main loop settings
    #[serde(default)]
    pub host: HostSettings,
    /// Logging configuration settings
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Plugin system configuration.
///
/// Controls where plugins are discovered and where their configuration and
/// data files live.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginSettings {
    /// Directory path where plugin folders are located
    pub directory: String,
    /// Root under which each plugin gets `plugins/<id>/` for its config files
    pub config_root: String,
    /// Root under which each plugin gets a `<id>/` data directory
    pub data_root: String,
    /// Plugin directory names loaded first, in this order
    pub load_order: Vec<String>,
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            directory: "plugins".to_string(),
            config_root: "config".to_string(),
            data_root: "data".to_string(),
            load_order: Vec::new(),
        }
    }
}

/// Hot reload configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotReloadSettings {
    /// Whether entry modules are watched for changes
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Quiet period after the last change before reloading
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Attempts to open a changed module before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First retry delay; doubles after every failed attempt
    #[serde(default = "default_initial_retry_delay_ms")]
    pub initial_retry_delay_ms: u64,
}

impl Default for HotReloadSettings {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            debounce_ms: default_debounce_ms(),
            max_attempts: default_max_attempts(),
            initial_retry_delay_ms: default_initial_retry_delay_ms(),
        }
    }
}

/// Host main loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostSettings {
    /// Interval between safe points in milliseconds
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval(),
        }
    }
}

/// Logging system configuration.
///
/// Controls log output format and level.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    /// Whether to output logs in JSON format
    pub json_format: bool,
    /// Level for messages plugins write through their scoped logger.
    /// Follows `level` when unset.
    pub plugin_level: Option<String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            plugin_level: None,
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, creates a default configuration file at the specified path
    /// and returns the default configuration.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// The loaded (or default) configuration, or an error if the file could
    /// not be read, parsed or created.
    pub async fn load_from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let config: AppConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            // Create default config file
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content).await?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Converts the plugin settings into the manager's configuration.
    pub fn to_manager_config(&self) -> PluginManagerConfig {
        let services = ServiceSettings::new(
            PathBuf::from(&self.plugins.config_root),
            PathBuf::from(&self.plugins.data_root),
        );
        PluginManagerConfig::new(PathBuf::from(&self.plugins.directory), services)
            .with_load_order(self.plugins.load_order.clone())
    }

    pub fn to_hot_reload_config(&self) -> HotReloadConfig {
        HotReloadConfig {
            enabled: self.hot_reload.enabled,
            debounce: Duration::from_millis(self.hot_reload.debounce_ms),
            max_attempts: self.hot_reload.max_attempts,
            initial_retry_delay: Duration::from_millis(self.hot_reload.initial_retry_delay_ms),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.host.tick_interval_ms)
    }

    /// Validates the configuration settings.
    ///
    /// # Returns
    ///
    /// `Ok(())` if the configuration is valid, or an error message describing
    /// the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.plugins.directory.trim().is_empty() {
            return Err("Plugin directory cannot be empty".to_string());
        }
        if self.plugins.config_root.trim().is_empty() {
            return Err("Plugin config root cannot be empty".to_string());
        }
        if self.plugins.data_root.trim().is_empty() {
            return Err("Plugin data root cannot be empty".to_string());
        }

        if self.host.tick_interval_ms == 0 {
            return Err("host.tick_interval_ms must be greater than 0".to_string());
        }

        if self.hot_reload.max_attempts == 0 {
            return Err("hot_reload.max_attempts must be greater than 0".to_string());
        }

        // Validate log level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                &self.logging.level
            ));
        }
        if let Some(plugin_level) = &self.logging.plugin_level {
            if !valid_levels.contains(&plugin_level.as_str()) {
                return Err(format!(
                    "Invalid plugin log level: {plugin_level}. Must be one of: {valid_levels:?}"
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.plugins.directory, "plugins");
        assert_eq!(config.host.tick_interval_ms, 50);
        assert!(config.hot_reload.enabled);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.plugins.directory = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.host.tick_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.hot_reload.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.logging.level = "loud".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.contains("loud"));

        let mut config = AppConfig::default();
        config.logging.plugin_level = Some("chatty".to_string());
        let err = config.validate().unwrap_err();
        assert!(err.contains("plugin log level"));
    }

    #[test]
    fn test_partial_file_takes_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [plugins]
            directory = "/opt/host/plugins"
            load_order = ["core", "economy"]

            [hot_reload]
            debounce_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.plugins.directory, "/opt/host/plugins");
        assert_eq!(config.plugins.config_root, "config");
        assert_eq!(config.plugins.load_order, vec!["core", "economy"]);
        assert_eq!(config.hot_reload.debounce_ms, 250);
        assert_eq!(config.hot_reload.max_attempts, 3);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_conversions() {
        let mut config = AppConfig::default();
        config.plugins.load_order = vec!["core".to_string()];
        config.hot_reload.debounce_ms = 100;
        config.hot_reload.initial_retry_delay_ms = 20;

        let manager = config.to_manager_config();
        assert_eq!(manager.plugins_root, PathBuf::from("plugins"));
        assert_eq!(manager.load_order, vec!["core".to_string()]);
        assert_eq!(manager.services.config_root, PathBuf::from("config"));
        assert_eq!(manager.services.data_root, PathBuf::from("data"));

        let hot_reload = config.to_hot_reload_config();
        assert_eq!(hot_reload.debounce, Duration::from_millis(100));
        assert_eq!(hot_reload.initial_retry_delay, Duration::from_millis(20));
        assert_eq!(hot_reload.max_attempts, 3);
        assert_eq!(config.tick_interval(), Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_load_creates_default_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");

        let created = AppConfig::load_from_file(&path).await.unwrap();
        assert!(path.exists());

        let loaded = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(loaded.plugins.directory, created.plugins.directory);
        assert_eq!(loaded.host.tick_interval_ms, created.host.tick_interval_ms);
        assert_eq!(loaded.logging.level, created.logging.level);
    }

    #[tokio::test]
    async fn test_load_rejects_malformed_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        tokio::fs::write(&path, "[plugins\ndirectory = ").await.unwrap();

        assert!(AppConfig::load_from_file(&path).await.is_err());
    }
}
