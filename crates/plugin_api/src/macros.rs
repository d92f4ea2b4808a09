//! # Plugin Declaration Macro
//!
//! [`declare_plugin!`] generates the exported `plugin_registrations` symbol
//! the host looks up when it opens an entry module. The plugin type needs a
//! `fn new(services: Arc<PluginServices>) -> Self` constructor.

/// Exports the registration for a plugin entry type.
///
/// The two-argument form attaches a manifest, which the host requires before
/// it will construct the plugin. The one-argument form exports a bare
/// registration and exists for modules that are not meant to be loaded as
/// plugins on their own.
///
/// ```rust,no_run
/// use plugin_api::*;
/// use std::sync::Arc;
///
/// pub struct Greeter;
///
/// impl Greeter {
///     pub fn new(_services: Arc<PluginServices>) -> Self {
///         Greeter
///     }
/// }
///
/// impl Plugin for Greeter {
///     fn load(&mut self, _hot_reload: bool) -> Result<(), PluginError> { Ok(()) }
///     fn unload(&mut self) -> Result<(), PluginError> { Ok(()) }
/// }
///
/// declare_plugin!(
///     Greeter,
///     PluginManifest::new("greeter", "1.0.0").with_reload_policy(ReloadPolicy::ReloadImmediately)
/// );
/// ```
#[macro_export]
macro_rules! declare_plugin {
    (@export $plugin_type:ty, $manifest:expr) => {
        #[no_mangle]
        pub fn plugin_registrations() -> ::std::vec::Vec<$crate::PluginRegistration> {
            fn create(
                services: ::std::sync::Arc<$crate::PluginServices>,
            ) -> ::std::boxed::Box<dyn $crate::Plugin> {
                ::std::boxed::Box::new(<$plugin_type>::new(services))
            }

            ::std::vec![$crate::PluginRegistration::new(
                ::std::any::type_name::<$plugin_type>(),
                $manifest,
                create,
            )]
        }
    };
    ($plugin_type:ty, $manifest:expr) => {
        $crate::declare_plugin!(@export $plugin_type, ::std::option::Option::Some($manifest));
    };
    ($plugin_type:ty) => {
        $crate::declare_plugin!(@export $plugin_type, ::std::option::Option::None);
    };
}
