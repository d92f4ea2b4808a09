//! Flat, ordered list of plugin contexts.

use crate::context::{PluginContext, PluginStatus};
use std::path::Path;

/// Registry of every plugin context the host knows about.
///
/// Order is load order. At most one context exists per plugin directory.
#[derive(Debug, Default)]
pub struct PluginRegistry {
    contexts: Vec<PluginContext>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `context`, returning any context it supersedes for the same
    /// directory.
    pub(crate) fn insert(&mut self, context: PluginContext) -> (usize, Option<PluginContext>) {
        let superseded = self
            .position_by_directory(context.directory())
            .map(|index| self.contexts.remove(index));
        self.contexts.push(context);
        (self.contexts.len() - 1, superseded)
    }

    pub(crate) fn remove(&mut self, index: usize) -> PluginContext {
        self.contexts.remove(index)
    }

    pub fn get(&self, index: usize) -> Option<&PluginContext> {
        self.contexts.get(index)
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut PluginContext> {
        self.contexts.get_mut(index)
    }

    /// Finds a context by plugin id. Loaded contexts win over stale ones.
    pub fn position_by_id(&self, id: &str) -> Option<usize> {
        let mut fallback = None;
        for (index, context) in self.contexts.iter().enumerate() {
            if context.id() != id {
                continue;
            }
            if context.status() == PluginStatus::Loaded {
                return Some(index);
            }
            fallback.get_or_insert(index);
        }
        fallback
    }

    pub fn find_by_id(&self, id: &str) -> Option<&PluginContext> {
        self.position_by_id(id).map(|index| &self.contexts[index])
    }

    pub fn position_by_directory(&self, directory: &Path) -> Option<usize> {
        self.contexts
            .iter()
            .position(|context| context.directory() == directory)
    }

    pub fn find_by_directory(&self, directory: &Path) -> Option<&PluginContext> {
        self.position_by_directory(directory)
            .map(|index| &self.contexts[index])
    }

    pub fn contexts_for_directory(&self, directory: &Path) -> usize {
        self.contexts
            .iter()
            .filter(|context| context.directory() == directory)
            .count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PluginContext> {
        self.contexts.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl DoubleEndedIterator<Item = &mut PluginContext> {
        self.contexts.iter_mut()
    }

    pub(crate) fn loaded_mut(&mut self) -> impl Iterator<Item = &mut PluginContext> {
        self.contexts.iter_mut().filter(|context| context.is_loaded())
    }

    pub fn loaded_count(&self) -> usize {
        self.contexts.iter().filter(|context| context.is_loaded()).count()
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}
