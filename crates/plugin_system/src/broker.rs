//! Shared-interface rebuild protocol.
//!
//! After every batch of lifecycle changes the broker throws the previous
//! [`InterfaceRegistry`] away and builds a new one from the plugins that are
//! loaded now:
//!
//! 1. Dispose the previous registry
//! 2. Every loaded plugin contributes into a fresh registry
//! 3. The registry is built and sealed
//! 4. Every loaded plugin consumes the sealed registry, then every loaded
//!    plugin is told injection is complete
//!
//! No plugin can observe a registry that is still being filled. A failure in
//! a single plugin's hook is logged and skipped; a failure to build the
//! registry fails the whole rebuild.

use crate::error::PluginSystemError;
use crate::registry::PluginRegistry;
use plugin_api::{panic_message, InterfaceRegistry, LogSink, PluginError, TracingLogSink};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct InterfaceBroker {
    interfaces: InterfaceRegistry,
    log: Arc<dyn LogSink>,
}

impl Default for InterfaceBroker {
    fn default() -> Self {
        Self::with_log_sink(TracingLogSink::shared())
    }
}

impl fmt::Debug for InterfaceBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterfaceBroker")
            .field("interfaces", &self.interfaces)
            .finish_non_exhaustive()
    }
}

fn run_hook(id: &str, phase: &str, hook: impl FnOnce() -> Result<(), PluginError>) -> bool {
    match catch_unwind(AssertUnwindSafe(hook)) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!("⚠️ Plugin '{}' failed during {}: {}", id, phase, e);
            false
        }
        Err(panic) => {
            warn!(
                "⚠️ Plugin '{}' panicked during {}: {}",
                id,
                phase,
                panic_message(panic.as_ref())
            );
            false
        }
    }
}

impl InterfaceBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registries built by this broker report conflicts to `log`.
    pub fn with_log_sink(log: Arc<dyn LogSink>) -> Self {
        Self {
            interfaces: InterfaceRegistry::new().with_log_sink(Arc::clone(&log)),
            log,
        }
    }

    /// The registry from the most recent rebuild.
    pub fn interfaces(&self) -> &InterfaceRegistry {
        &self.interfaces
    }

    pub fn generation(&self) -> u64 {
        self.interfaces.generation()
    }

    /// Drops the current registry without building a new one.
    pub fn dispose(&mut self) {
        self.interfaces.dispose();
    }

    pub fn rebuild(&mut self, plugins: &mut PluginRegistry) -> Result<(), PluginSystemError> {
        let generation = self.interfaces.generation() + 1;
        debug!("Rebuilding shared interfaces (generation {})", generation);

        self.interfaces.dispose();

        let mut fresh = InterfaceRegistry::with_generation(generation).with_log_sink(Arc::clone(&self.log));
        for context in plugins.loaded_mut() {
            let id = context.id();
            fresh.set_contributor(Some(id.clone()));
            context.with_instance(|instance| {
                run_hook(&id, "contribute", || instance.configure_shared_interface(&mut fresh))
            });
        }
        fresh.set_contributor(None);

        if let Err(e) = fresh.build() {
            error!("❌ Shared interface build failed: {}", e);
            fresh.dispose();
            self.interfaces = fresh;
            return Err(PluginSystemError::InterfaceBuild(e));
        }
        self.interfaces = fresh;

        let interfaces = &self.interfaces;
        for context in plugins.loaded_mut() {
            let id = context.id();
            context.with_instance(|instance| {
                run_hook(&id, "consume", || instance.use_shared_interface(interfaces))
            });
        }
        for context in plugins.loaded_mut() {
            let id = context.id();
            context.with_instance(|instance| {
                run_hook(&id, "injection notice", || instance.on_shared_interface_injected(interfaces))
            });
        }

        info!(
            "🔗 Shared interfaces rebuilt: generation {}, {} interfaces from {} plugins",
            generation,
            self.interfaces.len(),
            plugins.loaded_count()
        );
        Ok(())
    }

    /// Tells every loaded plugin the startup batch is complete.
    pub fn notify_all_loaded(&self, plugins: &mut PluginRegistry) {
        for context in plugins.loaded_mut() {
            let id = context.id();
            context.with_instance(|instance| run_hook(&id, "all-loaded notice", || instance.on_all_plugins_loaded()));
        }
    }
}
