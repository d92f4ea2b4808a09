//! Dependency ordering for exported modules and the plugins that own them.
//!
//! Everything here is a static metadata read: module files are listed and
//! their TOML sidecars parsed, but no module is ever opened. Scanning is
//! therefore free of side effects and safe to repeat.
//!
//! A reference that names no known export is not an edge. Such a module is
//! treated as independent even though the missing export might simply not
//! have been scanned; this leniency is intentional and must not be turned
//! into an error.

use crate::discovery::{
    entry_module_path, enumerate_plugin_directories, exports_directory, is_module_file,
    plugin_directory_name,
};
use crate::error::{CyclicDependencyError, PluginSystemError};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Sidecar `<stem>.toml` next to a module.
#[derive(Debug, Default, Deserialize)]
struct ModuleMetadataFile {
    name: Option<String>,
    #[serde(default)]
    references: Vec<String>,
}

/// Name and declared references of one module file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleMetadata {
    pub name: String,
    pub path: PathBuf,
    pub references: Vec<String>,
}

fn default_module_name(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    if cfg!(not(windows)) {
        if let Some(stripped) = stem.strip_prefix("lib").filter(|rest| !rest.is_empty()) {
            return stripped.to_string();
        }
    }
    stem
}

/// Reads the sidecar metadata of `module_path`, if any.
///
/// Without a sidecar the module is named after its file stem (minus the
/// `lib` prefix cdylibs get on unix) and declares no references.
pub fn read_module_metadata(module_path: &Path) -> Result<ModuleMetadata, PluginSystemError> {
    let sidecar = module_path.with_extension("toml");
    let file = if sidecar.is_file() {
        let content = fs::read_to_string(&sidecar)?;
        toml::from_str::<ModuleMetadataFile>(&content).map_err(|e| PluginSystemError::Metadata {
            path: sidecar.clone(),
            message: e.to_string(),
        })?
    } else {
        ModuleMetadataFile::default()
    };

    Ok(ModuleMetadata {
        name: file.name.unwrap_or_else(|| default_module_name(module_path)),
        path: module_path.to_path_buf(),
        references: file.references,
    })
}

/// An export module and the plugin directory it ships in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedModule {
    pub metadata: ModuleMetadata,
    pub owner: PathBuf,
}

impl ExportedModule {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn path(&self) -> &Path {
        &self.metadata.path
    }
}

/// Directed graph of named nodes, each mapped to a path.
///
/// Nodes keep their insertion order, which is the tie-break for
/// [`topological_order`](Self::topological_order).
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<String>,
    paths: HashMap<String, PathBuf>,
    edges: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node. The first path registered for a name wins.
    pub fn add_node(&mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> bool {
        let name = name.into();
        if self.paths.contains_key(&name) {
            return false;
        }
        self.paths.insert(name.clone(), path.into());
        self.nodes.push(name);
        true
    }

    /// Records that `from` requires `to`. Ignored unless both nodes exist.
    pub fn add_edge(&mut self, from: &str, to: &str) -> bool {
        if from == to || !self.contains(from) || !self.contains(to) {
            return false;
        }
        let dependencies = self.edges.entry(from.to_string()).or_default();
        if dependencies.iter().any(|existing| existing == to) {
            return false;
        }
        dependencies.push(to.to_string());
        true
    }

    pub fn contains(&self, name: &str) -> bool {
        self.paths.contains_key(name)
    }

    pub fn path_of(&self, name: &str) -> Option<&Path> {
        self.paths.get(name).map(PathBuf::as_path)
    }

    pub fn dependencies_of(&self, name: &str) -> &[String] {
        self.edges.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Depth-first topological sort: dependencies come before dependents.
    pub fn topological_order(&self) -> Result<Vec<String>, CyclicDependencyError> {
        let mut visited = HashSet::new();
        let mut visiting = HashSet::new();
        let mut stack = Vec::new();
        let mut order = Vec::with_capacity(self.nodes.len());

        for node in &self.nodes {
            self.visit(node, &mut visited, &mut visiting, &mut stack, &mut order)?;
        }
        Ok(order)
    }

    fn visit<'a>(
        &'a self,
        node: &'a str,
        visited: &mut HashSet<&'a str>,
        visiting: &mut HashSet<&'a str>,
        stack: &mut Vec<&'a str>,
        order: &mut Vec<String>,
    ) -> Result<(), CyclicDependencyError> {
        if visited.contains(node) {
            return Ok(());
        }
        if visiting.contains(node) {
            return Err(cycle_from_stack(stack, node));
        }

        visiting.insert(node);
        stack.push(node);
        for dependency in self.dependencies_of(node) {
            self.visit(dependency, visited, visiting, stack, order)?;
        }
        stack.pop();
        visiting.remove(node);
        visited.insert(node);
        order.push(node.to_string());
        Ok(())
    }

    /// Paths in topological order.
    pub fn load_order(&self) -> Result<Vec<PathBuf>, CyclicDependencyError> {
        Ok(self
            .topological_order()?
            .iter()
            .filter_map(|name| self.paths.get(name).cloned())
            .collect())
    }

    /// Human-readable dump of every node and its resolved dependencies.
    pub fn visualize(&self) -> String {
        let mut out = String::from("Dependency graph:\n");
        for node in &self.nodes {
            let dependencies = self.dependencies_of(node);
            if dependencies.is_empty() {
                let _ = writeln!(out, "  {node}");
            } else {
                let _ = writeln!(out, "  {node} -> {}", dependencies.join(", "));
            }
        }
        out
    }
}

fn cycle_from_stack(stack: &[&str], start: &str) -> CyclicDependencyError {
    let position = stack.iter().position(|node| *node == start).unwrap_or(0);
    let mut cycle: Vec<String> = stack[position..].iter().map(|node| node.to_string()).collect();
    cycle.push(start.to_string());
    CyclicDependencyError::new(cycle)
}

/// Builds export and plugin dependency graphs from a plugin tree.
#[derive(Debug, Default)]
pub struct DependencyGraphResolver {
    exports: Vec<ExportedModule>,
    graph: DependencyGraph,
}

impl DependencyGraphResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lists every export module under `root` in discovery order.
    ///
    /// Unreadable metadata is logged and the module skipped. When two
    /// modules share a name the first one discovered is kept.
    pub fn scan_exports(root: &Path) -> Result<Vec<ExportedModule>, PluginSystemError> {
        let mut exports: Vec<ExportedModule> = Vec::new();
        let mut seen = HashSet::new();

        for plugin_directory in enumerate_plugin_directories(root)? {
            let exports_dir = exports_directory(&plugin_directory);
            if !exports_dir.is_dir() {
                continue;
            }

            let mut modules: Vec<PathBuf> = fs::read_dir(&exports_dir)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|path| is_module_file(path))
                .collect();
            modules.sort();

            for module in modules {
                let metadata = match read_module_metadata(&module) {
                    Ok(metadata) => metadata,
                    Err(e) => {
                        warn!("⚠️ Skipping export {}: {}", module.display(), e);
                        continue;
                    }
                };
                if !seen.insert(metadata.name.clone()) {
                    warn!(
                        "⚠️ Export '{}' at {} shadows an earlier export with the same name",
                        metadata.name,
                        module.display()
                    );
                    continue;
                }
                exports.push(ExportedModule {
                    metadata,
                    owner: plugin_directory.clone(),
                });
            }
        }

        Ok(exports)
    }

    /// Scans `root` and builds the export graph, keeping only references
    /// that resolve to a known export.
    pub fn analyze_dependencies(&mut self, root: &Path) -> Result<(), PluginSystemError> {
        self.exports = Self::scan_exports(root)?;
        self.graph = DependencyGraph::new();

        for export in &self.exports {
            self.graph.add_node(export.name(), export.path());
        }
        for export in &self.exports {
            for reference in &export.metadata.references {
                if self.graph.add_edge(export.name(), reference) {
                    debug!("Export '{}' depends on '{}'", export.name(), reference);
                }
            }
        }

        debug!("{}", self.graph.visualize());
        Ok(())
    }

    pub fn exports(&self) -> &[ExportedModule] {
        &self.exports
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Export module paths, dependencies first.
    pub fn load_order(&self) -> Result<Vec<PathBuf>, CyclicDependencyError> {
        self.graph.load_order()
    }

    /// Export module paths in plain discovery order.
    pub fn discovery_order(&self) -> Vec<PathBuf> {
        self.exports.iter().map(|e| e.path().to_path_buf()).collect()
    }

    /// Orders plugin directories so that a plugin comes after every plugin
    /// owning an export it references.
    ///
    /// A plugin's references are those of its entry module sidecar plus
    /// those of its own exports. Directories keep their given order when
    /// unconstrained.
    pub fn plugin_load_order(&self, directories: &[PathBuf]) -> Result<Vec<PathBuf>, CyclicDependencyError> {
        let owners: HashMap<&str, &Path> = self
            .exports
            .iter()
            .map(|export| (export.name(), export.owner.as_path()))
            .collect();

        let mut graph = DependencyGraph::new();
        for directory in directories {
            graph.add_node(plugin_directory_name(directory), directory.clone());
        }

        for directory in directories {
            let name = plugin_directory_name(directory);
            for reference in self.plugin_references(directory) {
                let Some(owner) = owners.get(reference.as_str()) else {
                    continue;
                };
                if *owner != directory.as_path() {
                    graph.add_edge(&name, &plugin_directory_name(owner));
                }
            }
        }

        graph.load_order()
    }

    fn plugin_references(&self, directory: &Path) -> Vec<String> {
        let mut references = Vec::new();
        let entry = entry_module_path(directory);
        if entry.with_extension("toml").is_file() {
            match read_module_metadata(&entry) {
                Ok(metadata) => references.extend(metadata.references),
                Err(e) => warn!("⚠️ Ignoring entry metadata of {}: {}", directory.display(), e),
            }
        }
        for export in self.exports.iter().filter(|e| e.owner == directory) {
            references.extend(export.metadata.references.iter().cloned());
        }
        references
    }
}
