//! Main application logic and lifecycle management.
//!
//! This module contains the `Application` struct that loads the plugin tree,
//! wires up hot reload, drives safe points from the main loop and unloads
//! everything on shutdown.

use crate::{
    cli::CliArgs,
    config::AppConfig,
    logging::display_banner,
    signals::{setup_signal_handlers, setup_signal_handlers_silent},
};
use plugin_system::plugin_api::{EventBus, SubscriptionId};
use plugin_system::{
    ModuleLoader, NativeModuleLoader, PluginManager, PluginWatcher, PolicySource, ReloadCoordinator,
    SafePointKind,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Event topic a plugin publishes to announce a level or world transition.
/// The next safe point then applies deferred reloads.
pub const LEVEL_TRANSITION_TOPIC: &str = "host.level_transition";

/// Main application struct.
///
/// Owns the event bus and plugin manager for the lifetime of the process.
pub struct Application {
    /// Loaded application configuration
    config: AppConfig,
    events: Arc<EventBus>,
    manager: Arc<PluginManager>,
    shutdown: CancellationToken,
    level_transition: Arc<AtomicBool>,
    level_subscription: SubscriptionId,
}

impl Application {
    /// Creates a new application instance.
    ///
    /// # Process
    ///
    /// 1. Load configuration from file (creating default if missing)
    /// 2. Apply command-line argument overrides
    /// 3. Validate merged configuration
    /// 4. Display startup banner
    /// 5. Build the plugin manager around the native module loader
    pub async fn new(args: CliArgs) -> Result<Self, Box<dyn std::error::Error>> {
        info!("🔧 Loading configuration from: {}", args.config_path.display());
        let mut config = AppConfig::load_from_file(&args.config_path).await?;

        // Apply CLI overrides
        if let Some(plugin_dir) = args.plugin_dir {
            config.plugins.directory = plugin_dir.to_string_lossy().to_string();
        }

        if let Some(log_level) = args.log_level {
            config.logging.level = log_level;
        }

        if args.json_logs {
            config.logging.json_format = true;
        }

        if args.no_hot_reload {
            config.hot_reload.enabled = false;
        }

        // Validate configuration
        if let Err(e) = config.validate() {
            return Err(format!("Configuration validation failed: {e}").into());
        } else {
            info!("✅ Configuration loaded and validated successfully");
        }

        display_banner();

        Ok(Self::with_module_loader(config, Arc::new(NativeModuleLoader::new())))
    }

    /// Builds an application from a validated configuration and the module
    /// loader plugins are opened through.
    pub fn with_module_loader(config: AppConfig, modules: Arc<dyn ModuleLoader>) -> Self {
        let events = Arc::new(EventBus::new());
        let manager = Arc::new(PluginManager::new(
            config.to_manager_config(),
            modules,
            Arc::clone(&events),
        ));

        let level_transition = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&level_transition);
        let level_subscription = events.subscribe(LEVEL_TRANSITION_TOPIC, move |_| {
            flag.store(true, Ordering::Release);
            Ok(())
        });

        Self {
            config,
            events,
            manager,
            shutdown: CancellationToken::new(),
            level_transition,
            level_subscription,
        }
    }

    pub fn manager(&self) -> &Arc<PluginManager> {
        &self.manager
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Token that stops the main loop when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Runs the host until a shutdown signal arrives or the shutdown token
    /// is cancelled.
    ///
    /// A failed shared-interface build during the initial load is fatal;
    /// individual plugin failures are logged and the host keeps running.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        info!("🌟 Starting plugin host");
        self.log_configuration_summary();

        let summary = match self.manager.load_all() {
            Ok(summary) => summary,
            Err(e) => {
                error!("❌ Initial plugin load failed: {}", e);
                self.manager.shutdown();
                self.events.unsubscribe(self.level_subscription);
                return Err(e.into());
            }
        };
        for (id, reason) in &summary.failed {
            warn!("⚠️ Plugin '{}' is not running: {}", id, reason);
        }
        info!(
            "📊 {} plugins running, {} failed",
            summary.loaded.len(),
            summary.failed.len()
        );

        let watcher = self.start_hot_reload();

        info!("✅ Plugin host is now running!");
        info!("🛑 Press Ctrl+C to gracefully shutdown");

        self.main_loop().await;

        info!("🛑 Shutdown requested, unloading plugins...");
        self.shutdown.cancel();
        drop(watcher);

        self.manager.shutdown();
        self.events.unsubscribe(self.level_subscription);

        self.log_final_statistics();
        info!("✅ Plugin host shutdown complete");
        Ok(())
    }

    async fn main_loop(&self) {
        let mut interval = tokio::time::interval(self.config.tick_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let signal = setup_signal_handlers(self.shutdown.clone());
        tokio::pin!(signal);
        let mut signals_active = true;

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,
                result = &mut signal, if signals_active => {
                    signals_active = false;
                    match result {
                        Ok(()) => {
                            spawn_merciless_shutdown();
                            break;
                        }
                        Err(e) => error!("❌ Failed to set up signal handlers: {}", e),
                    }
                }
                _ = interval.tick() => {
                    self.safe_point();
                }
            }
        }
    }

    /// Runs one safe point. A level transition announced since the last
    /// safe point makes this one apply deferred reloads.
    fn safe_point(&self) -> usize {
        let kind = if self.level_transition.swap(false, Ordering::AcqRel) {
            SafePointKind::LevelTransition
        } else {
            SafePointKind::Tick
        };

        match self.manager.safe_point(kind) {
            Ok(0) => 0,
            Ok(reloaded) => {
                info!("🔄 Reloaded {} plugins at {:?} safe point", reloaded, kind);
                reloaded
            }
            Err(e) => {
                error!("❌ Safe point failed: {}", e);
                0
            }
        }
    }

    fn start_hot_reload(&self) -> Option<PluginWatcher> {
        let config = self.config.to_hot_reload_config();
        if !config.enabled {
            info!("🔥 Hot reload disabled");
            return None;
        }

        let (changes_tx, changes_rx) = mpsc::unbounded_channel();
        let watcher = match PluginWatcher::start(self.manager.plugins_root(), changes_tx) {
            Ok(watcher) => watcher,
            Err(e) => {
                warn!(
                    "⚠️ Could not watch {}: {}. Hot reload disabled",
                    self.manager.plugins_root().display(),
                    e
                );
                return None;
            }
        };

        ReloadCoordinator::new(
            config,
            Arc::clone(&self.manager) as Arc<dyn PolicySource>,
            self.manager.reload_sender(),
        )
        .spawn(changes_rx, self.shutdown.child_token());

        info!("🔥 Hot reload watching {}", watcher.root().display());
        Some(watcher)
    }

    fn log_configuration_summary(&self) {
        info!("📋 Configuration Summary:");
        info!("  🔌 Plugin directory: {}", self.config.plugins.directory);
        info!("  ⚙️ Plugin config root: {}", self.config.plugins.config_root);
        info!("  💾 Plugin data root: {}", self.config.plugins.data_root);
        if !self.config.plugins.load_order.is_empty() {
            info!("  📑 Load first: {}", self.config.plugins.load_order.join(", "));
        }
        info!("  ⏱️ Tick interval: {}ms", self.config.host.tick_interval_ms);
        info!(
            "  🔥 Hot reload: {} (debounce {}ms)",
            if self.config.hot_reload.enabled { "on" } else { "off" },
            self.config.hot_reload.debounce_ms
        );
    }

    fn log_final_statistics(&self) {
        let stats = self.events.stats();
        info!("📊 Final Statistics:");
        info!("  - Events published: {}", stats.events_published);
        info!("  - Handler invocations: {}", stats.events_handled);
        info!("  - Handler failures: {}", stats.handler_failures);
    }
}

/// A second signal during shutdown exits immediately.
fn spawn_merciless_shutdown() {
    tokio::spawn(async move {
        if let Err(e) = setup_signal_handlers_silent().await {
            error!("Failed to set up merciless shutdown signal handler: {e}");
            return;
        }

        warn!("Shutdown handler received again! I'll make this quick.");
        std::process::exit(1);
    });
}
