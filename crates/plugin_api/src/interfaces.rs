//! Shared-interface container.
//!
//! Plugins publish objects for each other through an [`InterfaceRegistry`].
//! The host builds a fresh registry after every batch of lifecycle changes:
//! contributors write into it while it is [`RegistryState::Open`], the host
//! seals it with [`InterfaceRegistry::build`], and consumers then resolve
//! against the sealed registry. Consumers must not keep references from one
//! generation after the host moves to the next.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::logging::{emit, LogLevel, LogSink, TracingLogSink};

type SharedInterface = Arc<dyn Any + Send + Sync>;

/// Lifecycle of a single registry generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryState {
    Open,
    Built,
    Disposed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InterfaceError {
    #[error("Shared interface registry does not accept contributions in state {0:?}")]
    NotOpen(RegistryState),
    #[error("Shared interface registry is not built (state {0:?})")]
    NotBuilt(RegistryState),
    #[error("Shared interface not found: {0}")]
    NotFound(String),
    #[error("Shared interface '{key}' is not of type {expected}")]
    TypeMismatch { key: String, expected: &'static str },
    #[error("Shared interface '{key}' contributed more than once (by {first} and {second})")]
    DuplicateKey {
        key: String,
        first: String,
        second: String,
    },
}

/// String-keyed container of shared interfaces for one generation.
pub struct InterfaceRegistry {
    state: RegistryState,
    generation: u64,
    interfaces: HashMap<String, SharedInterface>,
    contributors: HashMap<String, String>,
    current_contributor: Option<String>,
    conflicts: Vec<InterfaceError>,
    log: Arc<dyn LogSink>,
}

impl InterfaceRegistry {
    pub fn new() -> Self {
        Self::with_generation(0)
    }

    pub fn with_generation(generation: u64) -> Self {
        Self {
            state: RegistryState::Open,
            generation,
            interfaces: HashMap::new(),
            contributors: HashMap::new(),
            current_contributor: None,
            conflicts: Vec::new(),
            log: TracingLogSink::shared(),
        }
    }

    /// Sends conflict warnings and lifecycle notes to `log`.
    pub fn with_log_sink(mut self, log: Arc<dyn LogSink>) -> Self {
        self.log = log;
        self
    }

    pub fn state(&self) -> RegistryState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Names the plugin whose contributions follow. Set by the host.
    pub fn set_contributor(&mut self, contributor: Option<String>) {
        self.current_contributor = contributor;
    }

    /// Publishes `value` under `key`.
    ///
    /// A key contributed twice is recorded as a conflict and fails
    /// [`build`](Self::build). The first contribution is kept.
    pub fn add_shared_interface<T>(&mut self, key: impl Into<String>, value: T) -> Result<(), InterfaceError>
    where
        T: Any + Send + Sync,
    {
        self.add_shared_arc(key, Arc::new(value))
    }

    /// Like [`add_shared_interface`](Self::add_shared_interface) for a value
    /// the contributor keeps a handle to.
    pub fn add_shared_arc<T>(&mut self, key: impl Into<String>, value: Arc<T>) -> Result<(), InterfaceError>
    where
        T: Any + Send + Sync,
    {
        if self.state != RegistryState::Open {
            return Err(InterfaceError::NotOpen(self.state));
        }

        let key = key.into();
        let contributor = self
            .current_contributor
            .clone()
            .unwrap_or_else(|| "host".to_string());

        if let Some(first) = self.contributors.get(&key) {
            emit(
                &*self.log,
                LogLevel::Warn,
                format_args!(
                    "⚠️ Shared interface '{}' already contributed by '{}', ignoring '{}'",
                    key, first, contributor
                ),
            );
            let conflict = InterfaceError::DuplicateKey {
                key: key.clone(),
                first: first.clone(),
                second: contributor.clone(),
            };
            self.conflicts.push(conflict.clone());
            return Err(conflict);
        }

        emit(
            &*self.log,
            LogLevel::Debug,
            format_args!("Shared interface '{}' contributed by '{}'", key, contributor),
        );
        self.contributors.insert(key.clone(), contributor);
        self.interfaces.insert(key, value);
        Ok(())
    }

    /// Seals the registry. Fails with the first recorded conflict.
    pub fn build(&mut self) -> Result<(), InterfaceError> {
        if self.state != RegistryState::Open {
            return Err(InterfaceError::NotOpen(self.state));
        }
        if let Some(conflict) = self.conflicts.first() {
            return Err(conflict.clone());
        }
        self.current_contributor = None;
        self.state = RegistryState::Built;
        Ok(())
    }

    /// Resolves `key` as a `T`. Only valid once the registry is built.
    pub fn get_shared_interface<T>(&self, key: &str) -> Result<Arc<T>, InterfaceError>
    where
        T: Any + Send + Sync,
    {
        if self.state != RegistryState::Built {
            return Err(InterfaceError::NotBuilt(self.state));
        }
        let value = self
            .interfaces
            .get(key)
            .ok_or_else(|| InterfaceError::NotFound(key.to_string()))?;
        Arc::clone(value)
            .downcast::<T>()
            .map_err(|_| InterfaceError::TypeMismatch {
                key: key.to_string(),
                expected: std::any::type_name::<T>(),
            })
    }

    pub fn has_shared_interface(&self, key: &str) -> bool {
        self.interfaces.contains_key(key)
    }

    pub fn contributor_of(&self, key: &str) -> Option<&str> {
        self.contributors.get(key).map(String::as_str)
    }

    /// Registered keys in sorted order.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.interfaces.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.interfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty()
    }

    /// Drops every interface this generation holds.
    pub fn dispose(&mut self) {
        if self.state == RegistryState::Disposed {
            return;
        }
        emit(
            &*self.log,
            LogLevel::Debug,
            format_args!(
                "Disposing shared interface generation {} ({} interfaces)",
                self.generation,
                self.interfaces.len()
            ),
        );
        self.interfaces.clear();
        self.contributors.clear();
        self.conflicts.clear();
        self.current_contributor = None;
        self.state = RegistryState::Disposed;
    }
}

impl Default for InterfaceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InterfaceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterfaceRegistry")
            .field("state", &self.state)
            .field("generation", &self.generation)
            .field("keys", &self.keys())
            .finish()
    }
}
