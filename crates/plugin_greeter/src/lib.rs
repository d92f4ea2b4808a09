//! Sample plugin: welcomes players as they connect.
//!
//! Deploy the built library as `plugins/plugin_greeter/plugin_greeter.<ext>`
//! (dropping the `lib` prefix cargo adds on unix) and copy `resources/` next
//! to it so the configuration template is found.
//!
//! The plugin
//! - writes `greeter.toml` into its config directory on first load,
//! - subscribes to `player.connected` and answers on `greeter.welcomed`,
//! - shares its welcome message as the `greeter.welcome_message` interface.
//!
//! All logging goes through the scoped logger from its services; this
//! library's own `tracing` would have no subscriber behind it.

use plugin_api::{
    declare_plugin, InterfaceRegistry, Plugin, PluginError, PluginManifest, PluginServices,
    ReloadPolicy, ServiceError,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const CONFIG_FILE: &str = "greeter.toml";
const CONNECTED_TOPIC: &str = "player.connected";
const WELCOMED_TOPIC: &str = "greeter.welcomed";
const WELCOME_INTERFACE: &str = "greeter.welcome_message";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GreeterSettings {
    pub welcome_message: String,
    #[serde(default = "default_announce")]
    pub announce: bool,
}

fn default_announce() -> bool {
    true
}

impl Default for GreeterSettings {
    fn default() -> Self {
        Self {
            welcome_message: "Welcome, {name}!".to_string(),
            announce: true,
        }
    }
}

impl GreeterSettings {
    pub fn welcome(&self, name: &str) -> String {
        self.welcome_message.replace("{name}", name)
    }
}

#[derive(Debug, Deserialize)]
struct PlayerConnected {
    name: String,
}

#[derive(Debug, Serialize)]
struct Welcomed<'a> {
    name: &'a str,
    message: String,
    welcome_count: u64,
}

pub struct GreeterPlugin {
    services: Arc<PluginServices>,
    settings: GreeterSettings,
    welcome_count: Arc<AtomicU64>,
}

impl GreeterPlugin {
    pub fn new(services: Arc<PluginServices>) -> Self {
        Self {
            services,
            settings: GreeterSettings::default(),
            welcome_count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Seeds the config file from the shipped template, or from the
    /// defaults when the template is not deployed.
    fn load_settings(&self) -> Result<GreeterSettings, ServiceError> {
        let configuration = self.services.configuration();
        match configuration.initialize_with_template(CONFIG_FILE, CONFIG_FILE) {
            Ok(_) => {}
            Err(ServiceError::TemplateNotFound(path)) => {
                self.services
                    .logger()
                    .debug(&format!("No template at {}, writing defaults", path.display()));
                configuration.initialize_toml_with_model(CONFIG_FILE, &GreeterSettings::default())?;
            }
            Err(e) => return Err(e),
        }
        configuration.load_toml(CONFIG_FILE)
    }
}

impl Plugin for GreeterPlugin {
    fn load(&mut self, hot_reload: bool) -> Result<(), PluginError> {
        self.settings = self.load_settings()?;

        let settings = self.settings.clone();
        let welcome_count = Arc::clone(&self.welcome_count);
        let services = Arc::clone(&self.services);
        self.services.subscribe(CONNECTED_TOPIC, move |payload| {
            let player: PlayerConnected = serde_json::from_value(payload.clone())?;
            let count = welcome_count.fetch_add(1, Ordering::Relaxed) + 1;
            let message = settings.welcome(&player.name);
            services.logger().info(&format!("👋 {message}"));

            if settings.announce {
                services.events().publish_event(
                    WELCOMED_TOPIC,
                    &Welcomed {
                        name: &player.name,
                        message,
                        welcome_count: count,
                    },
                )?;
            }
            Ok(())
        })?;

        let logger = self.services.logger();
        if hot_reload {
            logger.info("🔄 Greeter reloaded");
        } else {
            logger.info("🎉 Greeter loaded");
        }
        Ok(())
    }

    fn unload(&mut self) -> Result<(), PluginError> {
        self.services.logger().info(&format!(
            "👋 Greeter unloading after {} welcomes",
            self.welcome_count.load(Ordering::Relaxed)
        ));
        Ok(())
    }

    fn configure_shared_interface(&mut self, interfaces: &mut InterfaceRegistry) -> Result<(), PluginError> {
        interfaces.add_shared_interface(WELCOME_INTERFACE, self.settings.welcome_message.clone())?;
        Ok(())
    }

    fn on_all_plugins_loaded(&mut self) -> Result<(), PluginError> {
        self.services.logger().debug("All plugins loaded, ready to greet");
        Ok(())
    }
}

declare_plugin!(
    GreeterPlugin,
    PluginManifest::new("plugin_greeter", env!("CARGO_PKG_VERSION"))
        .with_author("Plugin Host Team")
        .with_reload_policy(ReloadPolicy::ReloadImmediately)
);

#[cfg(test)]
mod tests {
    use super::*;
    use plugin_api::{EventBus, ServiceSettings};
    use serde_json::json;
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn services(temp_dir: &TempDir, plugin_dir: &Path) -> Arc<PluginServices> {
        let settings = ServiceSettings::new(temp_dir.path().join("config"), temp_dir.path().join("data"));
        Arc::new(
            PluginServices::new("plugin_greeter", plugin_dir, &settings, Arc::new(EventBus::new())).unwrap(),
        )
    }

    #[test]
    fn test_registration_carries_manifest() {
        let registrations = plugin_registrations();
        assert_eq!(registrations.len(), 1);
        let manifest = registrations[0].manifest.as_ref().unwrap();
        assert_eq!(manifest.id, "plugin_greeter");
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_welcomes_connected_players() {
        let temp_dir = TempDir::new().unwrap();
        let services = services(&temp_dir, temp_dir.path());
        let welcomed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&welcomed);
        services.events().subscribe(WELCOMED_TOPIC, move |payload| {
            sink.lock().unwrap().push(payload.clone());
            Ok(())
        });

        let mut plugin = GreeterPlugin::new(Arc::clone(&services));
        plugin.load(false).unwrap();
        assert!(services.configuration().exists(CONFIG_FILE));

        services.events().publish(CONNECTED_TOPIC, &json!({ "name": "Ada" }));
        let seen = std::mem::take(&mut *welcomed.lock().unwrap());
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["message"], "Welcome, Ada!");
        assert_eq!(seen[0]["welcome_count"], 1);

        // Malformed payloads are the handler's failure, not the publisher's.
        services.events().publish(CONNECTED_TOPIC, &json!({ "id": 7 }));
        assert_eq!(services.events().stats().handler_failures, 1);

        plugin.unload().unwrap();
        assert_eq!(services.dispose(), 1);
    }

    #[test]
    fn test_template_overrides_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let plugin_dir = temp_dir.path().join("plugin_greeter");
        let templates = plugin_dir.join("resources").join("templates");
        std::fs::create_dir_all(&templates).unwrap();
        std::fs::write(
            templates.join(CONFIG_FILE),
            "welcome_message = \"Hi {name}\"\nannounce = false\n",
        )
        .unwrap();

        let services = services(&temp_dir, &plugin_dir);
        let mut plugin = GreeterPlugin::new(Arc::clone(&services));
        plugin.load(false).unwrap();

        assert_eq!(plugin.settings.welcome("Grace"), "Hi Grace");
        assert!(!plugin.settings.announce);

        let mut interfaces = InterfaceRegistry::new();
        plugin.configure_shared_interface(&mut interfaces).unwrap();
        interfaces.build().unwrap();
        let message = interfaces.get_shared_interface::<String>(WELCOME_INTERFACE).unwrap();
        assert_eq!(message.as_str(), "Hi {name}");
    }
}
