//! Logging across the module boundary.
//!
//! A plugin links its own copy of this crate and of `tracing`, and that copy
//! never sees the host's subscriber. Plugin-facing logging therefore goes
//! through a [`LogSink`] trait object created by the host: the vtable points
//! at host code, so the host's `tracing` dispatcher does the emitting.

use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Target of messages written through a [`PluginLogger`].
pub const PLUGIN_LOG_TARGET: &str = "plugin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Host-side destination for log records raised by plugin code.
///
/// `plugin_id` is set for messages a plugin logs itself and `None` for
/// diagnostics of the shared containers (event bus, interface registry).
pub trait LogSink: Send + Sync {
    fn log(&self, plugin_id: Option<&str>, level: LogLevel, message: &str);
}

/// Forwards records to the `tracing` subscriber of the code that created it.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogSink;

impl TracingLogSink {
    /// A sink bound to the calling binary's `tracing` dispatcher.
    pub fn shared() -> Arc<dyn LogSink> {
        Arc::new(TracingLogSink)
    }
}

impl LogSink for TracingLogSink {
    fn log(&self, plugin_id: Option<&str>, level: LogLevel, message: &str) {
        match plugin_id {
            Some(plugin_id) => match level {
                LogLevel::Trace => trace!(target: PLUGIN_LOG_TARGET, plugin_id, "{}", message),
                LogLevel::Debug => debug!(target: PLUGIN_LOG_TARGET, plugin_id, "{}", message),
                LogLevel::Info => info!(target: PLUGIN_LOG_TARGET, plugin_id, "{}", message),
                LogLevel::Warn => warn!(target: PLUGIN_LOG_TARGET, plugin_id, "{}", message),
                LogLevel::Error => error!(target: PLUGIN_LOG_TARGET, plugin_id, "{}", message),
            },
            None => match level {
                LogLevel::Trace => trace!("{}", message),
                LogLevel::Debug => debug!("{}", message),
                LogLevel::Info => info!("{}", message),
                LogLevel::Warn => warn!("{}", message),
                LogLevel::Error => error!("{}", message),
            },
        }
    }
}

pub(crate) fn emit(sink: &dyn LogSink, level: LogLevel, args: fmt::Arguments<'_>) {
    sink.log(None, level, &args.to_string());
}

/// Logger that tags every message with the owning plugin's id.
#[derive(Clone)]
pub struct PluginLogger {
    plugin_id: String,
    sink: Arc<dyn LogSink>,
}

impl PluginLogger {
    pub fn new(plugin_id: impl Into<String>, sink: Arc<dyn LogSink>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            sink,
        }
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        self.sink.log(Some(&self.plugin_id), level, message);
    }

    pub fn trace(&self, message: &str) {
        self.log(LogLevel::Trace, message);
    }

    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }
}

impl fmt::Debug for PluginLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginLogger")
            .field("plugin_id", &self.plugin_id)
            .finish_non_exhaustive()
    }
}
