//! Host-owned event bus.
//!
//! The bus is created once by the host and handed to every plugin through
//! its [`PluginServices`](crate::PluginServices). Subscriptions made through
//! the services container are tracked there and removed when the plugin is
//! disposed, so a reloaded plugin never leaves handlers behind.
//!
//! Plugins run their own copy of the bus code, so its diagnostics go
//! through the host's [`LogSink`] rather than `tracing` directly.

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use uuid::Uuid;

use crate::logging::{emit, LogLevel, LogSink, TracingLogSink};
use crate::plugin::panic_message;

/// Callback invoked with the payload of every event on its topic.
pub type EventHandlerFn = dyn Fn(&serde_json::Value) -> Result<(), EventError> + Send + Sync;

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("Handler execution failed: {0}")]
    HandlerExecutionFailed(String),
    #[error("Event serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),
}

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Statistics for event bus monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventStats {
    pub events_published: u64,
    pub events_handled: u64,
    pub handler_failures: u64,
    pub total_handlers: usize,
}

#[derive(Clone)]
struct Subscription {
    id: SubscriptionId,
    handler: Arc<EventHandlerFn>,
}

/// Topic-keyed publish/subscribe bus.
pub struct EventBus {
    handlers: DashMap<String, Vec<Subscription>>,
    topics: DashMap<SubscriptionId, String>,
    stats: RwLock<EventStats>,
    log: Arc<dyn LogSink>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_log_sink(TracingLogSink::shared())
    }

    pub fn with_log_sink(log: Arc<dyn LogSink>) -> Self {
        Self {
            handlers: DashMap::new(),
            topics: DashMap::new(),
            stats: RwLock::new(EventStats::default()),
            log,
        }
    }

    /// The sink plugin loggers and bus diagnostics write to.
    pub fn log_sink(&self) -> &Arc<dyn LogSink> {
        &self.log
    }

    pub fn subscribe<F>(&self, topic: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(&serde_json::Value) -> Result<(), EventError> + Send + Sync + 'static,
    {
        let topic = topic.into();
        let id = SubscriptionId::new();
        self.handlers
            .entry(topic.clone())
            .or_default()
            .push(Subscription {
                id,
                handler: Arc::new(handler),
            });
        emit(&*self.log, LogLevel::Debug, format_args!("📝 Subscribed {} to '{}'", id, topic));
        self.topics.insert(id, topic);
        self.stats.write().total_handlers += 1;
        id
    }

    /// Removes a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let Some((_, topic)) = self.topics.remove(&id) else {
            return false;
        };

        let mut removed = false;
        if let Some(mut subscriptions) = self.handlers.get_mut(&topic) {
            let before = subscriptions.len();
            subscriptions.retain(|subscription| subscription.id != id);
            removed = subscriptions.len() != before;
        }
        self.handlers.remove_if(&topic, |_, subscriptions| subscriptions.is_empty());

        if removed {
            self.stats.write().total_handlers -= 1;
            emit(&*self.log, LogLevel::Debug, format_args!("Unsubscribed {} from '{}'", id, topic));
        }
        removed
    }

    /// Delivers `payload` to every handler on `topic`.
    ///
    /// Returns the number of handlers invoked. A failing or panicking handler
    /// is logged and counted but does not stop delivery to the others.
    pub fn publish(&self, topic: &str, payload: &serde_json::Value) -> usize {
        // Snapshot so handlers may subscribe or unsubscribe while running.
        let subscriptions: Vec<Subscription> = match self.handlers.get(topic) {
            Some(entry) => entry.value().clone(),
            None => Vec::new(),
        };

        let mut failures = 0u64;
        for subscription in &subscriptions {
            match catch_unwind(AssertUnwindSafe(|| (subscription.handler)(payload))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    emit(
                        &*self.log,
                        LogLevel::Error,
                        format_args!("❌ Handler {} failed on '{}': {}", subscription.id, topic, e),
                    );
                }
                Err(panic) => {
                    failures += 1;
                    emit(
                        &*self.log,
                        LogLevel::Error,
                        format_args!(
                            "💥 Handler {} panicked on '{}': {}",
                            subscription.id,
                            topic,
                            panic_message(panic.as_ref())
                        ),
                    );
                }
            }
        }

        if subscriptions.is_empty() {
            emit(&*self.log, LogLevel::Warn, format_args!("⚠️ No handlers for event '{}'", topic));
        }

        let mut stats = self.stats.write();
        stats.events_published += 1;
        stats.events_handled += subscriptions.len() as u64 - failures;
        stats.handler_failures += failures;
        subscriptions.len()
    }

    /// Serializes `event` and publishes it.
    pub fn publish_event<T: Serialize>(&self, topic: &str, event: &T) -> Result<usize, EventError> {
        let payload = serde_json::to_value(event)?;
        Ok(self.publish(topic, &payload))
    }

    pub fn handler_count(&self, topic: &str) -> usize {
        self.handlers.get(topic).map(|entry| entry.len()).unwrap_or(0)
    }

    /// Live subscriptions across every topic.
    pub fn subscription_count(&self) -> usize {
        self.topics.len()
    }

    pub fn stats(&self) -> EventStats {
        self.stats.read().clone()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("topics", &self.handlers.len())
            .field("stats", &self.stats())
            .finish()
    }
}
