//! Registrations exported by plugin entry modules.

use crate::manifest::PluginManifest;
use crate::plugin::Plugin;
use crate::services::PluginServices;
use std::fmt;
use std::sync::Arc;

/// Name of the symbol every entry module exports.
pub const REGISTRATION_SYMBOL: &[u8] = b"plugin_registrations";

/// Constructs a plugin instance bound to its services container.
pub type PluginFactory = fn(Arc<PluginServices>) -> Box<dyn Plugin>;

/// Signature of the exported [`REGISTRATION_SYMBOL`].
pub type RegistrationFn = fn() -> Vec<PluginRegistration>;

/// One plugin entry type found in a module.
///
/// The host requires exactly one registration per entry module, and that
/// registration must carry a manifest.
#[derive(Clone)]
pub struct PluginRegistration {
    pub type_name: &'static str,
    pub manifest: Option<PluginManifest>,
    pub factory: PluginFactory,
}

impl PluginRegistration {
    pub fn new(
        type_name: &'static str,
        manifest: Option<PluginManifest>,
        factory: PluginFactory,
    ) -> Self {
        Self {
            type_name,
            manifest,
            factory,
        }
    }
}

impl fmt::Debug for PluginRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistration")
            .field("type_name", &self.type_name)
            .field("manifest", &self.manifest)
            .finish_non_exhaustive()
    }
}
