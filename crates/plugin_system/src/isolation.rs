//! Module loading boundaries.
//!
//! Export modules are loaded once into a host-wide [`SharedModuleTable`]
//! with global symbol visibility so every plugin resolves against the same
//! copies. Entry modules are opened privately, one [`IsolationContext`] per
//! load attempt, so a plugin's own symbols never collide with another's.
//! The `plugin_api` types are shared by identity because host and plugins
//! link the same crate.
//!
//! Native modules are never mapped from the plugin tree. Each one is copied
//! to a private shadow file first, so a rebuild can overwrite the original
//! while the old code is still running.

use crate::error::PluginSystemError;
use libloading::{Library, Symbol};
use parking_lot::Mutex;
use plugin_api::{panic_message, PluginRegistration, RegistrationFn, REGISTRATION_SYMBOL};
use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// A loaded entry module and the registrations it exposes.
pub trait IsolationContext: Send {
    fn module_path(&self) -> &Path;

    /// Reads the module's registration list.
    fn registrations(&self) -> Result<Vec<PluginRegistration>, PluginSystemError>;

    /// Releases the module. Disposing twice is a no-op.
    ///
    /// Nothing created from the module's code may outlive this call.
    fn dispose(&mut self) -> Result<(), PluginSystemError>;
}

/// Mechanism the loader uses to bring code into the process.
pub trait ModuleLoader: Send + Sync {
    /// Loads an export module into the shared namespace. Idempotent per path.
    fn load_shared(&self, path: &Path) -> Result<(), PluginSystemError>;

    /// Opens an entry module behind a fresh isolation boundary.
    fn open(&self, entry_module: &Path) -> Result<Box<dyn IsolationContext>, PluginSystemError>;
}

fn library_error(path: &Path, e: libloading::Error) -> PluginSystemError {
    PluginSystemError::Library(format!("Failed to load {}: {}", path.display(), e))
}

/// Copies `path` into a fresh temp file named after it.
fn shadow_copy(path: &Path, directory: Option<&Path>) -> Result<NamedTempFile, PluginSystemError> {
    let copy_error = |e: io::Error| {
        PluginSystemError::Library(format!("Failed to shadow-copy {}: {}", path.display(), e))
    };

    let prefix = format!(
        "{}-",
        path.file_stem().map(|stem| stem.to_string_lossy()).unwrap_or_default()
    );
    let suffix = path
        .extension()
        .map(|extension| format!(".{}", extension.to_string_lossy()))
        .unwrap_or_default();
    let mut builder = tempfile::Builder::new();
    builder.prefix(&prefix).suffix(&suffix);

    let mut source = File::open(path).map_err(copy_error)?;
    let mut shadow = match directory {
        Some(directory) => builder.tempfile_in(directory),
        None => builder.tempfile(),
    }
    .map_err(copy_error)?;
    io::copy(&mut source, shadow.as_file_mut()).map_err(copy_error)?;
    shadow.as_file().sync_all().map_err(copy_error)?;
    Ok(shadow)
}

/// A library mapped from its shadow copy. The copy is deleted after the
/// library is closed.
struct ShadowLibrary {
    library: Library,
    _shadow: NamedTempFile,
}

impl ShadowLibrary {
    fn open(path: &Path, global: bool, directory: Option<&Path>) -> Result<Self, PluginSystemError> {
        let shadow = shadow_copy(path, directory)?;
        let library = open_library(shadow.path(), global).map_err(|e| library_error(path, e))?;
        debug!("Mapped {} from {}", path.display(), shadow.path().display());
        Ok(Self {
            library,
            _shadow: shadow,
        })
    }

    fn close(self) -> Result<(), libloading::Error> {
        self.library.close()
    }
}

#[cfg(unix)]
fn open_library(path: &Path, global: bool) -> Result<Library, libloading::Error> {
    use libloading::os::unix::{Library as UnixLibrary, RTLD_GLOBAL, RTLD_LOCAL, RTLD_NOW};
    let visibility = if global { RTLD_GLOBAL } else { RTLD_LOCAL };
    // SAFETY: module initializers run here; plugin modules are trusted code.
    unsafe { UnixLibrary::open(Some(path), RTLD_NOW | visibility) }.map(Library::from)
}

#[cfg(not(unix))]
fn open_library(path: &Path, _global: bool) -> Result<Library, libloading::Error> {
    // SAFETY: module initializers run here; plugin modules are trusted code.
    unsafe { Library::new(path) }
}

/// Export modules loaded for the lifetime of the host.
///
/// Modules are released in reverse load order when the table is dropped.
#[derive(Default)]
pub struct SharedModuleTable {
    modules: Mutex<Vec<(PathBuf, ShadowLibrary)>>,
    shadow_directory: Option<PathBuf>,
}

impl SharedModuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self, path: &Path) -> Result<bool, PluginSystemError> {
        let mut modules = self.modules.lock();
        if modules.iter().any(|(loaded, _)| loaded == path) {
            return Ok(false);
        }
        let library = ShadowLibrary::open(path, true, self.shadow_directory.as_deref())?;
        info!("📦 Loaded shared module {}", path.display());
        modules.push((path.to_path_buf(), library));
        Ok(true)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.modules.lock().iter().any(|(loaded, _)| loaded == path)
    }

    pub fn len(&self) -> usize {
        self.modules.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.lock().is_empty()
    }
}

impl Drop for SharedModuleTable {
    fn drop(&mut self) {
        let modules = self.modules.get_mut();
        while let Some((path, library)) = modules.pop() {
            if let Err(e) = library.close() {
                warn!("⚠️ Failed to close shared module {}: {}", path.display(), e);
            }
        }
    }
}

/// Loads real dynamic libraries through `libloading`.
#[derive(Default)]
pub struct NativeModuleLoader {
    shared: SharedModuleTable,
    shadow_directory: Option<PathBuf>,
}

impl NativeModuleLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Places shadow copies in `directory` instead of the system temp dir,
    /// e.g. when that is mounted `noexec`.
    pub fn with_shadow_directory(directory: impl Into<PathBuf>) -> Self {
        let directory = directory.into();
        Self {
            shared: SharedModuleTable {
                modules: Mutex::new(Vec::new()),
                shadow_directory: Some(directory.clone()),
            },
            shadow_directory: Some(directory),
        }
    }

    pub fn shared_modules(&self) -> &SharedModuleTable {
        &self.shared
    }
}

impl ModuleLoader for NativeModuleLoader {
    fn load_shared(&self, path: &Path) -> Result<(), PluginSystemError> {
        self.shared.load(path).map(|_| ())
    }

    fn open(&self, entry_module: &Path) -> Result<Box<dyn IsolationContext>, PluginSystemError> {
        let library = ShadowLibrary::open(entry_module, false, self.shadow_directory.as_deref())?;
        debug!("Opened entry module {}", entry_module.display());
        Ok(Box::new(NativeIsolationContext {
            path: entry_module.to_path_buf(),
            library: Some(library),
        }))
    }
}

struct NativeIsolationContext {
    path: PathBuf,
    library: Option<ShadowLibrary>,
}

impl IsolationContext for NativeIsolationContext {
    fn module_path(&self) -> &Path {
        &self.path
    }

    fn registrations(&self) -> Result<Vec<PluginRegistration>, PluginSystemError> {
        let library = self.library.as_ref().ok_or_else(|| {
            PluginSystemError::Library(format!("{} has been disposed", self.path.display()))
        })?;

        // SAFETY: the symbol is generated by `declare_plugin!` with this signature.
        let registrations: Symbol<RegistrationFn> = match unsafe { library.library.get(REGISTRATION_SYMBOL) } {
            Ok(symbol) => symbol,
            Err(e) => {
                debug!("No registration symbol in {}: {}", self.path.display(), e);
                return Err(PluginSystemError::MissingEntryType {
                    module: self.path.clone(),
                    found: 0,
                });
            }
        };

        catch_unwind(AssertUnwindSafe(|| registrations())).map_err(|panic| {
            PluginSystemError::Library(format!(
                "{} panicked while listing registrations: {}",
                self.path.display(),
                panic_message(panic.as_ref())
            ))
        })
    }

    fn dispose(&mut self) -> Result<(), PluginSystemError> {
        match self.library.take() {
            Some(library) => library.close().map_err(|e| {
                PluginSystemError::Library(format!("Failed to close {}: {}", self.path.display(), e))
            }),
            None => Ok(()),
        }
    }
}

/// Serves registrations compiled into the host.
///
/// Modules are keyed by entry-module file stem, which is the plugin
/// directory name, so the on-disk directory convention still applies.
#[derive(Default)]
pub struct StaticModuleLoader {
    modules: HashMap<String, RegistrationFn>,
    shared: Mutex<Vec<PathBuf>>,
}

impl StaticModuleLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_module(mut self, name: impl Into<String>, registrations: RegistrationFn) -> Self {
        self.register(name, registrations);
        self
    }

    pub fn register(&mut self, name: impl Into<String>, registrations: RegistrationFn) {
        self.modules.insert(name.into(), registrations);
    }

    /// Export modules recorded by [`ModuleLoader::load_shared`], in order.
    pub fn shared_modules(&self) -> Vec<PathBuf> {
        self.shared.lock().clone()
    }
}

impl ModuleLoader for StaticModuleLoader {
    fn load_shared(&self, path: &Path) -> Result<(), PluginSystemError> {
        let mut shared = self.shared.lock();
        if !shared.iter().any(|loaded| loaded == path) {
            shared.push(path.to_path_buf());
        }
        Ok(())
    }

    fn open(&self, entry_module: &Path) -> Result<Box<dyn IsolationContext>, PluginSystemError> {
        let name = entry_module
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        let registrations = *self.modules.get(&name).ok_or_else(|| {
            PluginSystemError::Library(format!("No static module registered as '{name}'"))
        })?;
        Ok(Box::new(StaticIsolationContext {
            path: entry_module.to_path_buf(),
            registrations: Some(registrations),
        }))
    }
}

struct StaticIsolationContext {
    path: PathBuf,
    registrations: Option<RegistrationFn>,
}

impl IsolationContext for StaticIsolationContext {
    fn module_path(&self) -> &Path {
        &self.path
    }

    fn registrations(&self) -> Result<Vec<PluginRegistration>, PluginSystemError> {
        let registrations = self.registrations.ok_or_else(|| {
            PluginSystemError::Library(format!("{} has been disposed", self.path.display()))
        })?;
        Ok(registrations())
    }

    fn dispose(&mut self) -> Result<(), PluginSystemError> {
        self.registrations = None;
        Ok(())
    }
}
