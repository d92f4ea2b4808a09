//! Plugin directory discovery.
//!
//! A plugin is a directory directly under the plugins root (or under a
//! bracket-named grouping folder such as `[gameplay]`) whose entry module is
//! `<dir>/<dirName>.<ext>`. Directory entries are visited in file-name order
//! so the discovery order is reproducible between runs.

use crate::error::PluginSystemError;
use std::env::consts::DLL_EXTENSION;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const DISABLED_DIRECTORY_NAMES: [&str; 3] = ["disable", "disabled", "_"];

/// `[name]` folders group plugins and are never plugins themselves.
pub fn is_group_directory_name(name: &str) -> bool {
    name.len() >= 2 && name.starts_with('[') && name.ends_with(']')
}

pub fn is_excluded_directory_name(name: &str) -> bool {
    DISABLED_DIRECTORY_NAMES.contains(&name) || (name.len() >= 2 && name.starts_with('_'))
}

pub fn is_plugin_directory_name(name: &str) -> bool {
    !name.is_empty() && !is_excluded_directory_name(name) && !is_group_directory_name(name)
}

/// The directory's own name, which is also its fallback plugin id.
pub fn plugin_directory_name(directory: &Path) -> String {
    directory
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

pub fn entry_module_path(directory: &Path) -> PathBuf {
    directory.join(format!("{}.{}", plugin_directory_name(directory), DLL_EXTENSION))
}

pub fn exports_directory(directory: &Path) -> PathBuf {
    directory.join("resources").join("exports")
}

pub fn is_module_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .map(|ext| ext == DLL_EXTENSION)
            .unwrap_or(false)
}

/// If `path` is the entry module of its parent directory, returns that directory.
pub fn entry_module_directory(path: &Path) -> Option<PathBuf> {
    let directory = path.parent()?;
    let name = directory.file_name()?.to_str()?;
    if !is_plugin_directory_name(name) {
        return None;
    }
    let is_entry = path.extension().map(|ext| ext == DLL_EXTENSION).unwrap_or(false)
        && path.file_stem().and_then(|stem| stem.to_str()) == Some(name);
    is_entry.then(|| directory.to_path_buf())
}

fn sorted_subdirectories(directory: &Path) -> Result<Vec<(String, PathBuf)>, PluginSystemError> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(directory)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        entries.push((entry.file_name().to_string_lossy().into_owned(), path));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(entries)
}

/// Lists plugin directories under `root` in discovery order.
///
/// A missing root is not an error; it simply holds no plugins.
pub fn enumerate_plugin_directories(root: &Path) -> Result<Vec<PathBuf>, PluginSystemError> {
    if !root.is_dir() {
        warn!("⚠️ Plugin directory does not exist: {}", root.display());
        return Ok(Vec::new());
    }

    let mut found = Vec::new();
    collect_plugin_directories(root, &mut found)?;
    debug!("Discovered {} plugin directories under {}", found.len(), root.display());
    Ok(found)
}

fn collect_plugin_directories(directory: &Path, found: &mut Vec<PathBuf>) -> Result<(), PluginSystemError> {
    for (name, path) in sorted_subdirectories(directory)? {
        if is_excluded_directory_name(&name) {
            debug!("Skipping disabled directory {}", path.display());
            continue;
        }
        if is_group_directory_name(&name) {
            collect_plugin_directories(&path, found)?;
            continue;
        }
        found.push(path);
    }
    Ok(())
}

/// Finds the plugin directory named `name` anywhere in the plugin tree.
pub fn find_plugin_directory(root: &Path, name: &str) -> Result<Option<PathBuf>, PluginSystemError> {
    Ok(enumerate_plugin_directories(root)?
        .into_iter()
        .find(|directory| plugin_directory_name(directory) == name))
}
