//! # Plugin Host - Main Entry Point
//!
//! Long-running host process for the plugin system. This entry point handles
//! CLI parsing, configuration loading, logging setup and the application
//! lifecycle.
//!
//! ## Quick Start
//!
//! ```bash
//! # Run with default configuration
//! plugin_host
//!
//! # Specify custom configuration
//! plugin_host --config production.toml
//!
//! # Override specific settings
//! plugin_host --plugins /opt/host/plugins --log-level debug --no-hot-reload
//!
//! # JSON logging for production
//! plugin_host --json-logs
//! ```
//!
//! ## Configuration
//!
//! The host loads configuration from a TOML file (default: `config.toml`).
//! If the file doesn't exist, a default configuration will be created.
//!
//! ## Signal Handling
//!
//! The host shuts down gracefully on SIGINT (Ctrl+C) and SIGTERM (Unix
//! systems), unloading every plugin in reverse load order.

use tracing::error;

mod app;
mod cli;
mod config;
mod logging;
mod signals;

/// Main entry point for the plugin host.
///
/// # Exit Codes
///
/// * **0**: Successful execution and shutdown
/// * **1**: Error during startup, configuration, or runtime
///
/// Note: This function is called from an async context (main with #[tokio::main]),
/// so it should NOT have #[tokio::main] itself.
pub async fn init() -> Result<(), Box<dyn std::error::Error>> {
    // Parse CLI arguments first
    let args = CliArgs::parse();

    // Load configuration to get logging settings
    let mut log_settings = AppConfig::load_from_file(&args.config_path)
        .await
        .unwrap_or_default()
        .logging;
    if let Some(level) = &args.log_level {
        log_settings.level = level.clone();
    }

    // Setup logging before anything else
    if let Err(e) = logging::setup_logging(&log_settings, args.json_logs) {
        eprintln!("❌ Failed to setup logging: {e}");
        std::process::exit(1);
    }

    // Create and run application
    match Application::new(args).await {
        Ok(app) => {
            if let Err(e) = app.run().await {
                error!("❌ Application error: {}", e);
                std::process::exit(1);
            }
        }
        Err(e) => {
            error!("❌ Failed to start application: {}", e);
            std::process::exit(1);
        }
    }

    Ok(())
}

// Re-export main types for library usage
pub use app::{Application, LEVEL_TRANSITION_TOPIC};
pub use cli::CliArgs;
pub use config::{AppConfig, HostSettings, HotReloadSettings, LoggingSettings, PluginSettings};
