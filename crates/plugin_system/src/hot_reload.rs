//! File-change driven hot reload.
//!
//! Three pieces cooperate here:
//!
//! - [`PluginWatcher`] wraps a `notify` watcher on the plugins root and
//!   forwards only entry-module changes as [`FileChange`]s
//! - [`ReloadCoordinator`] runs as a single task, debounces changes per
//!   plugin directory, waits for the file to become readable and applies the
//!   plugin's [`ReloadPolicy`]
//! - The resulting [`ReloadRequest`]s go to the manager's queue, which applies
//!   them at the next safe point
//!
//! Background tasks never touch the plugin registry themselves.

use crate::discovery::entry_module_directory;
use crate::error::PluginSystemError;
use notify::event::ModifyKind;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use plugin_api::ReloadPolicy;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Hot reload tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotReloadConfig {
    pub enabled: bool,
    /// Quiet period after the last change before a reload is attempted.
    pub debounce: Duration,
    /// Attempts to open the changed file before giving up.
    pub max_attempts: u32,
    /// Delay after the first failed attempt; doubles after each failure.
    pub initial_retry_delay: Duration,
}

impl Default for HotReloadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce: Duration::from_secs(2),
            max_attempts: 3,
            initial_retry_delay: Duration::from_millis(500),
        }
    }
}

/// Per-directory hot reload state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Idle,
    PendingChange,
    WaitingForUnlock,
    Reloading,
}

/// An entry module changed on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub directory: PathBuf,
    pub path: PathBuf,
    pub at: Instant,
}

impl FileChange {
    pub fn new(directory: impl Into<PathBuf>, path: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            path: path.into(),
            at: Instant::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadTrigger {
    FileChange,
    Manual,
}

/// Asks the single writer to reload the plugin in `directory`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadRequest {
    pub directory: PathBuf,
    pub requested_at: Instant,
    pub trigger: ReloadTrigger,
}

impl ReloadRequest {
    pub fn manual(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            requested_at: Instant::now(),
            trigger: ReloadTrigger::Manual,
        }
    }
}

/// Looks up the reload policy of the plugin loaded from a directory.
///
/// `None` means no plugin is loaded from there and changes are ignored.
pub trait PolicySource: Send + Sync {
    fn reload_policy(&self, directory: &Path) -> Option<ReloadPolicy>;
}

/// Converts a raw notify event into entry-module changes.
pub fn file_changes(event: &Event) -> Vec<FileChange> {
    let relevant = match &event.kind {
        EventKind::Create(_) => true,
        EventKind::Modify(ModifyKind::Metadata(_)) => false,
        EventKind::Modify(_) => true,
        _ => false,
    };
    if !relevant {
        return Vec::new();
    }

    event
        .paths
        .iter()
        .filter_map(|path| entry_module_directory(path).map(|directory| FileChange::new(directory, path)))
        .collect()
}

/// Sends the entry-module changes in `event` on. Returns how many were
/// delivered.
fn forward_changes(event: &Event, changes: &mpsc::UnboundedSender<FileChange>) -> usize {
    let mut delivered = 0;
    for change in file_changes(event) {
        debug!("Entry module changed: {}", change.path.display());
        match changes.send(change) {
            Ok(()) => delivered += 1,
            Err(e) => debug!("Reload coordinator gone, dropping change to {}", e.0.path.display()),
        }
    }
    delivered
}

/// Filesystem watcher over the whole plugin tree.
///
/// Dropping it stops the underlying OS watch.
pub struct PluginWatcher {
    root: PathBuf,
    _watcher: RecommendedWatcher,
}

impl PluginWatcher {
    pub fn start(root: &Path, changes: mpsc::UnboundedSender<FileChange>) -> Result<Self, notify::Error> {
        info!("👀 Watching {} for plugin changes", root.display());

        let mut watcher = RecommendedWatcher::new(
            move |result: Result<Event, notify::Error>| match result {
                Ok(event) => {
                    forward_changes(&event, &changes);
                }
                Err(e) => error!("❌ File watcher error: {}", e),
            },
            Config::default(),
        )?;
        watcher.watch(root, RecursiveMode::Recursive)?;

        Ok(Self {
            root: root.to_path_buf(),
            _watcher: watcher,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Acquired,
    Cancelled,
}

fn open_for_shared_read(path: &Path) -> std::io::Result<std::fs::File> {
    let mut options = std::fs::OpenOptions::new();
    options.read(true);
    #[cfg(windows)]
    {
        use std::os::windows::fs::OpenOptionsExt;
        // FILE_SHARE_READ: fails while a writer still holds the file.
        options.share_mode(0x0000_0001);
    }
    options.open(path)
}

/// Tries to open `path` for shared read with exponential backoff.
pub async fn probe_file(
    path: &Path,
    max_attempts: u32,
    initial_delay: Duration,
    cancel: &CancellationToken,
) -> Result<ProbeOutcome, PluginSystemError> {
    let mut delay = initial_delay;
    for attempt in 1..=max_attempts {
        match open_for_shared_read(path) {
            Ok(_) => return Ok(ProbeOutcome::Acquired),
            Err(e) => {
                debug!(
                    "Attempt {}/{} to open {} failed: {}",
                    attempt,
                    max_attempts,
                    path.display(),
                    e
                );
            }
        }
        if attempt == max_attempts {
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => return Ok(ProbeOutcome::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        delay = delay.saturating_mul(2);
    }

    Err(PluginSystemError::FileLockTimeout {
        path: path.to_path_buf(),
        attempts: max_attempts,
    })
}

#[derive(Debug)]
struct DirectoryWatch {
    state: WatchState,
    last_seen: Instant,
    generation: u64,
    cancel: Option<CancellationToken>,
}

/// Debounces file changes and turns settled ones into reload requests.
#[derive(Clone)]
pub struct ReloadCoordinator {
    config: HotReloadConfig,
    policies: Arc<dyn PolicySource>,
    reloads: mpsc::UnboundedSender<ReloadRequest>,
    directories: Arc<Mutex<HashMap<PathBuf, DirectoryWatch>>>,
}

impl ReloadCoordinator {
    pub fn new(
        config: HotReloadConfig,
        policies: Arc<dyn PolicySource>,
        reloads: mpsc::UnboundedSender<ReloadRequest>,
    ) -> Self {
        Self {
            config,
            policies,
            reloads,
            directories: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn state_of(&self, directory: &Path) -> WatchState {
        self.directories
            .lock()
            .get(directory)
            .map(|watch| watch.state)
            .unwrap_or(WatchState::Idle)
    }

    pub fn last_seen(&self, directory: &Path) -> Option<Instant> {
        self.directories.lock().get(directory).map(|watch| watch.last_seen)
    }

    pub fn spawn(
        self,
        changes: mpsc::UnboundedReceiver<FileChange>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(changes, shutdown))
    }

    pub async fn run(self, mut changes: mpsc::UnboundedReceiver<FileChange>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                change = changes.recv() => match change {
                    Some(change) => self.handle_change(change, &shutdown).await,
                    None => break,
                },
            }
        }

        for watch in self.directories.lock().values_mut() {
            if let Some(cancel) = watch.cancel.take() {
                cancel.cancel();
            }
            watch.state = WatchState::Idle;
        }
        debug!("Reload coordinator stopped");
    }

    /// Starts (or restarts) the settle wait for a change.
    ///
    /// The policy lookup may wait on the manager lock while a safe point is
    /// loading plugins, so it runs on the blocking pool.
    pub async fn handle_change(&self, change: FileChange, shutdown: &CancellationToken) {
        let directory = change.directory.clone();
        let policies = Arc::clone(&self.policies);
        let lookup = directory.clone();
        let policy = match tokio::task::spawn_blocking(move || policies.reload_policy(&lookup)).await {
            Ok(policy) => policy,
            Err(e) => {
                error!("❌ Reload policy lookup for {} failed: {}", directory.display(), e);
                return;
            }
        };
        match policy {
            None => {
                debug!("Ignoring change in {}: no plugin loaded there", directory.display());
                return;
            }
            Some(ReloadPolicy::OnlyManualReload) => {
                info!(
                    "📝 Change detected in {}, plugin only reloads manually",
                    directory.display()
                );
                return;
            }
            Some(_) => {}
        }

        let cancel = shutdown.child_token();
        let generation = {
            let mut directories = self.directories.lock();
            let watch = directories.entry(directory.clone()).or_insert(DirectoryWatch {
                state: WatchState::Idle,
                last_seen: change.at,
                generation: 0,
                cancel: None,
            });
            if let Some(stale) = watch.cancel.replace(cancel.clone()) {
                stale.cancel();
                debug!("Superseded pending reload of {}", directory.display());
            }
            watch.state = WatchState::PendingChange;
            watch.last_seen = change.at;
            watch.generation += 1;
            watch.generation
        };

        let coordinator = self.clone();
        tokio::spawn(async move { coordinator.settle(change, cancel, generation).await });
    }

    async fn settle(self, change: FileChange, cancel: CancellationToken, generation: u64) {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(self.config.debounce) => {}
        }

        if !self.advance(&change.directory, generation, WatchState::WaitingForUnlock) {
            return;
        }

        let probe = probe_file(
            &change.path,
            self.config.max_attempts,
            self.config.initial_retry_delay,
            &cancel,
        )
        .await;
        match probe {
            Ok(ProbeOutcome::Acquired) => self.enqueue(&change, generation),
            Ok(ProbeOutcome::Cancelled) => {}
            Err(e) => {
                warn!("⚠️ Hot reload of {} abandoned: {}", change.directory.display(), e);
                self.finish(&change.directory, generation);
            }
        }
    }

    fn advance(&self, directory: &Path, generation: u64, next: WatchState) -> bool {
        let mut directories = self.directories.lock();
        match directories.get_mut(directory) {
            Some(watch) if watch.generation == generation => {
                watch.state = next;
                true
            }
            _ => false,
        }
    }

    fn enqueue(&self, change: &FileChange, generation: u64) {
        let mut directories = self.directories.lock();
        let Some(watch) = directories.get_mut(&change.directory) else {
            return;
        };
        // Checked under the lock so a superseding change cannot slip in.
        if watch.generation != generation {
            return;
        }

        watch.state = WatchState::Reloading;
        let request = ReloadRequest {
            directory: change.directory.clone(),
            requested_at: change.at,
            trigger: ReloadTrigger::FileChange,
        };
        if self.reloads.send(request).is_err() {
            warn!("⚠️ Reload queue closed, dropping reload of {}", change.directory.display());
        } else {
            info!("🔄 Queued hot reload of {}", change.directory.display());
        }
        watch.state = WatchState::Idle;
        watch.cancel = None;
    }

    fn finish(&self, directory: &Path, generation: u64) {
        let mut directories = self.directories.lock();
        if let Some(watch) = directories.get_mut(directory) {
            if watch.generation == generation {
                watch.state = WatchState::Idle;
                watch.cancel = None;
            }
        }
    }
}
