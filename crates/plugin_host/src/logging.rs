//! Host logging setup.
//!
//! Plugins log through a sink the host creates, so their records arrive here
//! under the `plugin` target with a `plugin_id` field. The default filter
//! levels host and plugin output separately and keeps the file watcher
//! backend quiet.

use crate::config::LoggingSettings;
use plugin_system::plugin_api::PLUGIN_LOG_TARGET;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter directives used when `RUST_LOG` is not set.
pub fn default_directives(config: &LoggingSettings) -> String {
    let plugin_level = config.plugin_level.as_deref().unwrap_or(&config.level);
    format!(
        "{},{}={},notify=warn",
        config.level, PLUGIN_LOG_TARGET, plugin_level
    )
}

fn build_filter(config: &LoggingSettings) -> Result<EnvFilter, Box<dyn std::error::Error>> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => Ok(EnvFilter::try_new(default_directives(config))?),
    }
}

/// Installs the global subscriber.
///
/// `RUST_LOG` replaces the configured directives entirely, e.g.
/// `RUST_LOG=warn,plugin=debug` to follow only plugin output.
///
/// # Arguments
///
/// * `config` - Logging configuration from the config file
/// * `json_format` - Forces JSON output (CLI override)
pub fn setup_logging(
    config: &LoggingSettings,
    json_format: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let filter = build_filter(config)?;
    let registry = tracing_subscriber::registry().with(filter);

    if json_format || config.json_format {
        registry
            .with(fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(false)
                .with_target(true)
            )
            .try_init()?;
    } else {
        registry
            .with(fmt::layer()
                .with_ansi(true)
                .with_target(true)
                .with_thread_names(true)
            )
            .try_init()?;
    }

    info!("🔧 Logging initialized: {}", default_directives(config));
    Ok(())
}

/// Displays the startup banner using proper logging.
pub fn display_banner() {
    let version = option_env!("CARGO_PKG_VERSION").unwrap_or("UNK");
    info!("╔══════════════════════════════════════════╗");
    info!("║             🔌 PLUGIN HOST 🔌            ║");
    info!("║                  v{:<10}             ║", version);
    info!("║                                          ║");
    info!("║  Dependency-ordered plugin loading       ║");
    info!("║  Shared interfaces, rebuilt per batch    ║");
    info!("║  Hot reload at safe points               ║");
    info!("╚══════════════════════════════════════════╝");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plugin_level_follows_host_level() {
        let config = LoggingSettings::default();
        assert_eq!(default_directives(&config), "info,plugin=info,notify=warn");
    }

    #[test]
    fn test_plugin_level_override() {
        let config = LoggingSettings {
            level: "warn".to_string(),
            plugin_level: Some("debug".to_string()),
            ..LoggingSettings::default()
        };
        assert_eq!(default_directives(&config), "warn,plugin=debug,notify=warn");
        assert!(EnvFilter::try_new(default_directives(&config)).is_ok());
    }
}
