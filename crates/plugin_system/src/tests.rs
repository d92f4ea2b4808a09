//! End-to-end tests of the plugin host against plugin trees on disk.
//!
//! Plugins are compiled into the test binary and served through
//! [`StaticModuleLoader`]; the directories and entry-module files are still
//! laid out on disk so discovery and ordering run for real. Test plugins
//! report their lifecycle hooks on the shared event bus.

use crate::*;
use parking_lot::Mutex;
use plugin_api::{
    EventBus, InterfaceError, InterfaceRegistry, Plugin, PluginError, PluginManifest,
    PluginRegistration, PluginServices, ReloadPolicy, ServiceSettings,
};
use serde_json::json;
use std::env::consts::DLL_EXTENSION;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const LIFECYCLE: &str = "test.lifecycle";
const PING: &str = "test.ping";
const CONSUMED: &str = "test.consumed";

fn record(services: &PluginServices, hook: &str, hot_reload: bool) {
    services.events().publish(
        LIFECYCLE,
        &json!({ "plugin": services.id(), "hook": hook, "hot_reload": hot_reload }),
    );
}

trait TestPlugin: Plugin + Sized {
    fn create(services: Arc<PluginServices>) -> Self;
}

fn factory<P: TestPlugin>(services: Arc<PluginServices>) -> Box<dyn Plugin> {
    Box::new(P::create(services))
}

fn registration<P: TestPlugin>(id: &str, policy: ReloadPolicy) -> PluginRegistration {
    PluginRegistration::new(
        std::any::type_name::<P>(),
        Some(PluginManifest::new(id, "1.0.0").with_reload_policy(policy)),
        factory::<P>,
    )
}

/// Records every hook and keeps one event subscription while loaded.
struct RecordingPlugin {
    services: Arc<PluginServices>,
}

impl TestPlugin for RecordingPlugin {
    fn create(services: Arc<PluginServices>) -> Self {
        Self { services }
    }
}

impl Plugin for RecordingPlugin {
    fn load(&mut self, hot_reload: bool) -> Result<(), PluginError> {
        record(&self.services, "load", hot_reload);
        self.services.subscribe(PING, |_| Ok(()))?;
        Ok(())
    }

    fn unload(&mut self) -> Result<(), PluginError> {
        record(&self.services, "unload", false);
        Ok(())
    }

    fn on_all_plugins_loaded(&mut self) -> Result<(), PluginError> {
        record(&self.services, "all_loaded", false);
        Ok(())
    }
}

struct FailingPlugin {
    services: Arc<PluginServices>,
}

impl TestPlugin for FailingPlugin {
    fn create(services: Arc<PluginServices>) -> Self {
        Self { services }
    }
}

impl Plugin for FailingPlugin {
    fn load(&mut self, hot_reload: bool) -> Result<(), PluginError> {
        record(&self.services, "load", hot_reload);
        self.services.subscribe(PING, |_| Ok(()))?;
        Err(PluginError::InitializationFailed("database unreachable".to_string()))
    }

    fn unload(&mut self) -> Result<(), PluginError> {
        record(&self.services, "unload", false);
        Ok(())
    }
}

struct PanickingPlugin;

impl TestPlugin for PanickingPlugin {
    fn create(_services: Arc<PluginServices>) -> Self {
        PanickingPlugin
    }
}

impl Plugin for PanickingPlugin {
    fn load(&mut self, _hot_reload: bool) -> Result<(), PluginError> {
        panic!("plugin bug during load");
    }

    fn unload(&mut self) -> Result<(), PluginError> {
        Ok(())
    }
}

/// Loads fine but can never unload cleanly.
struct StuckPlugin {
    services: Arc<PluginServices>,
}

impl TestPlugin for StuckPlugin {
    fn create(services: Arc<PluginServices>) -> Self {
        Self { services }
    }
}

impl Plugin for StuckPlugin {
    fn load(&mut self, hot_reload: bool) -> Result<(), PluginError> {
        record(&self.services, "load", hot_reload);
        Ok(())
    }

    fn unload(&mut self) -> Result<(), PluginError> {
        Err(PluginError::ExecutionError("worker thread will not stop".to_string()))
    }
}

/// Contributes the `greeting` interface.
struct ProviderPlugin;

impl TestPlugin for ProviderPlugin {
    fn create(_services: Arc<PluginServices>) -> Self {
        ProviderPlugin
    }
}

impl Plugin for ProviderPlugin {
    fn load(&mut self, _hot_reload: bool) -> Result<(), PluginError> {
        Ok(())
    }

    fn unload(&mut self) -> Result<(), PluginError> {
        Ok(())
    }

    fn configure_shared_interface(&mut self, interfaces: &mut InterfaceRegistry) -> Result<(), PluginError> {
        interfaces.add_shared_interface("greeting", "hello".to_string())?;
        Ok(())
    }
}

/// Resolves `greeting` and reports what it saw.
struct ConsumerPlugin {
    services: Arc<PluginServices>,
}

impl TestPlugin for ConsumerPlugin {
    fn create(services: Arc<PluginServices>) -> Self {
        Self { services }
    }
}

impl Plugin for ConsumerPlugin {
    fn load(&mut self, _hot_reload: bool) -> Result<(), PluginError> {
        Ok(())
    }

    fn unload(&mut self) -> Result<(), PluginError> {
        Ok(())
    }

    fn use_shared_interface(&mut self, interfaces: &InterfaceRegistry) -> Result<(), PluginError> {
        let greeting = interfaces.get_shared_interface::<String>("greeting")?;
        self.services
            .events()
            .publish(CONSUMED, &json!({ "phase": "use", "value": greeting.as_str() }));
        Ok(())
    }

    fn on_shared_interface_injected(&mut self, interfaces: &InterfaceRegistry) -> Result<(), PluginError> {
        self.services.events().publish(
            CONSUMED,
            &json!({ "phase": "injected", "generation": interfaces.generation() }),
        );
        Ok(())
    }
}

fn alpha_module() -> Vec<PluginRegistration> {
    vec![registration::<RecordingPlugin>("alpha", ReloadPolicy::ReloadImmediately)]
}

fn beta_module() -> Vec<PluginRegistration> {
    vec![registration::<RecordingPlugin>("beta", ReloadPolicy::ReloadImmediately)]
}

fn gamma_module() -> Vec<PluginRegistration> {
    vec![registration::<RecordingPlugin>("gamma", ReloadPolicy::ReloadImmediately)]
}

fn charlie_module() -> Vec<PluginRegistration> {
    vec![registration::<RecordingPlugin>("charlie", ReloadPolicy::ReloadImmediately)]
}

fn zeta_module() -> Vec<PluginRegistration> {
    vec![registration::<RecordingPlugin>("zeta", ReloadPolicy::ReloadImmediately)]
}

fn plugin_x_module() -> Vec<PluginRegistration> {
    vec![registration::<RecordingPlugin>("pluginX", ReloadPolicy::ReloadImmediately)]
}

fn plugin_a_module() -> Vec<PluginRegistration> {
    vec![registration::<RecordingPlugin>("plugin_a", ReloadPolicy::ReloadImmediately)]
}

fn plugin_b_module() -> Vec<PluginRegistration> {
    vec![registration::<RecordingPlugin>("plugin_b", ReloadPolicy::ReloadImmediately)]
}

fn deferred_module() -> Vec<PluginRegistration> {
    vec![registration::<RecordingPlugin>("deferred", ReloadPolicy::ReloadOnNextSafePoint)]
}

fn manual_module() -> Vec<PluginRegistration> {
    vec![registration::<RecordingPlugin>("manual", ReloadPolicy::OnlyManualReload)]
}

fn failing_module() -> Vec<PluginRegistration> {
    vec![registration::<FailingPlugin>("failing", ReloadPolicy::ReloadImmediately)]
}

fn panicking_module() -> Vec<PluginRegistration> {
    vec![registration::<PanickingPlugin>("panicking", ReloadPolicy::ReloadImmediately)]
}

fn stuck_module() -> Vec<PluginRegistration> {
    vec![registration::<StuckPlugin>("stuck", ReloadPolicy::ReloadImmediately)]
}

fn provider_module() -> Vec<PluginRegistration> {
    vec![registration::<ProviderPlugin>("provider", ReloadPolicy::ReloadImmediately)]
}

fn consumer_module() -> Vec<PluginRegistration> {
    vec![registration::<ConsumerPlugin>("consumer", ReloadPolicy::ReloadImmediately)]
}

fn second_provider_module() -> Vec<PluginRegistration> {
    vec![registration::<ProviderPlugin>("provider_two", ReloadPolicy::ReloadImmediately)]
}

fn empty_module() -> Vec<PluginRegistration> {
    Vec::new()
}

fn twin_module() -> Vec<PluginRegistration> {
    vec![
        registration::<RecordingPlugin>("twin_one", ReloadPolicy::ReloadImmediately),
        registration::<RecordingPlugin>("twin_two", ReloadPolicy::ReloadImmediately),
    ]
}

fn anonymous_module() -> Vec<PluginRegistration> {
    vec![PluginRegistration::new(
        "RecordingPlugin",
        None,
        factory::<RecordingPlugin>,
    )]
}

fn all_modules() -> StaticModuleLoader {
    StaticModuleLoader::new()
        .with_module("alpha", alpha_module)
        .with_module("beta", beta_module)
        .with_module("gamma", gamma_module)
        .with_module("charlie", charlie_module)
        .with_module("zeta", zeta_module)
        .with_module("pluginX", plugin_x_module)
        .with_module("plugin_a", plugin_a_module)
        .with_module("plugin_b", plugin_b_module)
        .with_module("deferred", deferred_module)
        .with_module("manual", manual_module)
        .with_module("failing", failing_module)
        .with_module("panicking", panicking_module)
        .with_module("stuck", stuck_module)
        .with_module("provider", provider_module)
        .with_module("provider_two", second_provider_module)
        .with_module("consumer", consumer_module)
        .with_module("empty", empty_module)
        .with_module("twin", twin_module)
        .with_module("anonymous", anonymous_module)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Hook {
    plugin: String,
    hook: String,
    hot_reload: bool,
}

struct TestHost {
    temp_dir: TempDir,
    root: PathBuf,
    modules: Arc<StaticModuleLoader>,
    events: Arc<EventBus>,
    hooks: Arc<Mutex<Vec<Hook>>>,
    manager: PluginManager,
}

fn create_plugin_dir(root: &Path, relative: &str) -> PathBuf {
    let directory = root.join(relative);
    fs::create_dir_all(&directory).unwrap();
    fs::write(entry_module_path(&directory), b"").unwrap();
    directory
}

fn toml_list(items: &[&str]) -> String {
    let quoted: Vec<String> = items.iter().map(|item| format!("\"{item}\"")).collect();
    format!("[{}]", quoted.join(", "))
}

fn write_export(plugin: &Path, name: &str, references: &[&str]) -> PathBuf {
    let exports = plugin.join("resources").join("exports");
    fs::create_dir_all(&exports).unwrap();
    let module = exports.join(format!("{name}.{DLL_EXTENSION}"));
    fs::write(&module, b"").unwrap();
    fs::write(
        exports.join(format!("{name}.toml")),
        format!("name = \"{name}\"\nreferences = {}\n", toml_list(references)),
    )
    .unwrap();
    module
}

fn write_entry_references(plugin: &Path, references: &[&str]) {
    fs::write(
        entry_module_path(plugin).with_extension("toml"),
        format!("references = {}\n", toml_list(references)),
    )
    .unwrap();
}

fn host(directories: &[&str]) -> TestHost {
    host_with_order(directories, Vec::new())
}

fn host_with_order(directories: &[&str], load_order: Vec<String>) -> TestHost {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("plugins");
    fs::create_dir_all(&root).unwrap();
    for directory in directories {
        create_plugin_dir(&root, directory);
    }

    let events = Arc::new(EventBus::new());
    let hooks = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&hooks);
    events.subscribe(LIFECYCLE, move |payload| {
        sink.lock().push(Hook {
            plugin: payload["plugin"].as_str().unwrap_or_default().to_string(),
            hook: payload["hook"].as_str().unwrap_or_default().to_string(),
            hot_reload: payload["hot_reload"].as_bool().unwrap_or(false),
        });
        Ok(())
    });

    let modules = Arc::new(all_modules());
    let settings = ServiceSettings::new(temp_dir.path().join("config"), temp_dir.path().join("data"));
    let config = PluginManagerConfig::new(&root, settings).with_load_order(load_order);
    let manager = PluginManager::new(config, Arc::clone(&modules) as Arc<dyn ModuleLoader>, Arc::clone(&events));

    TestHost {
        temp_dir,
        root,
        modules,
        events,
        hooks,
        manager,
    }
}

impl TestHost {
    fn hooks_of(&self, plugin: &str) -> Vec<(String, bool)> {
        self.hooks
            .lock()
            .iter()
            .filter(|hook| hook.plugin == plugin)
            .map(|hook| (hook.hook.clone(), hook.hot_reload))
            .collect()
    }

    fn sequence(&self, hook: &str) -> Vec<String> {
        self.hooks
            .lock()
            .iter()
            .filter(|recorded| recorded.hook == hook)
            .map(|recorded| recorded.plugin.clone())
            .collect()
    }

    fn directory(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }
}

fn hook(name: &str, hot_reload: bool) -> (String, bool) {
    (name.to_string(), hot_reload)
}

#[test]
fn test_load_all_loads_every_plugin() {
    let host = host(&["alpha", "beta"]);
    let summary = host.manager.load_all().unwrap();

    assert_eq!(summary.loaded, vec!["alpha", "beta"]);
    assert!(summary.failed.is_empty());
    assert_eq!(host.manager.status_of("alpha"), Some(PluginStatus::Loaded));
    assert_eq!(host.manager.status_of("beta"), Some(PluginStatus::Loaded));
    assert_eq!(
        host.hooks_of("alpha"),
        vec![hook("load", false), hook("all_loaded", false)]
    );
    assert_eq!(host.events.handler_count(PING), 2);
    assert!(host.temp_dir.path().join("data").join("alpha").is_dir());
}

#[test]
fn test_exporter_loads_before_referencing_plugin() {
    let host = host(&["alpha", "zeta"]);
    write_entry_references(&host.directory("alpha"), &["Utils"]);
    let utils = write_export(&host.directory("zeta"), "Utils", &[]);

    host.manager.load_all().unwrap();

    assert_eq!(host.sequence("load"), vec!["zeta", "alpha"]);
    assert_eq!(host.modules.shared_modules(), vec![utils]);
}

#[test]
fn test_unresolved_reference_still_loads() {
    let host = host(&["alpha", "charlie"]);
    write_entry_references(&host.directory("charlie"), &["Utils"]);

    let summary = host.manager.load_all().unwrap();

    assert!(summary.failed.is_empty());
    assert_eq!(host.manager.status_of("charlie"), Some(PluginStatus::Loaded));
    assert_eq!(host.sequence("load"), vec!["alpha", "charlie"]);
}

#[test]
fn test_group_folder_is_never_a_plugin() {
    let host = host(&["[group]/pluginX", "alpha"]);
    host.manager.load_all().unwrap();

    assert_eq!(host.manager.status_of("pluginX"), Some(PluginStatus::Loaded));
    assert_eq!(host.manager.path_of("pluginX"), Some(host.directory("[group]/pluginX")));
    assert_eq!(host.manager.status_of("group"), None);
    assert_eq!(host.manager.metadata_of("group"), None);

    let ids: Vec<String> = host.manager.all_statuses().into_iter().map(|(id, _)| id).collect();
    assert!(ids.contains(&"pluginX".to_string()));
    assert!(!ids.iter().any(|id| id == "group" || id == "[group]"));
    assert!(host.manager.all_metadata().iter().all(|m| m.id != "group"));
}

#[test]
fn test_export_cycle_falls_back_to_discovery_order() {
    let host = host(&["plugin_a", "plugin_b"]);
    let a = write_export(&host.directory("plugin_a"), "A", &["B"]);
    let b = write_export(&host.directory("plugin_b"), "B", &["A"]);

    let summary = host.manager.load_all().unwrap();

    assert_eq!(summary.loaded, vec!["plugin_a", "plugin_b"]);
    assert_eq!(host.modules.shared_modules(), vec![a, b]);
}

#[test]
fn test_missing_entry_module_does_not_stop_batch() {
    let host = host(&["alpha"]);
    fs::create_dir_all(host.directory("ghost")).unwrap();

    let summary = host.manager.load_all().unwrap();

    assert_eq!(summary.loaded, vec!["alpha"]);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].0, "ghost");
    assert_eq!(host.manager.status_of("ghost"), Some(PluginStatus::Error));

    let info = host
        .manager
        .list_plugins()
        .into_iter()
        .find(|info| info.id == "ghost")
        .unwrap();
    assert!(info.last_error.unwrap().contains("entry module not found"));

    let err = host.manager.load_by_id("ghost").unwrap_err();
    assert!(matches!(err, PluginSystemError::MissingEntryModule { .. }));
}

#[test]
fn test_entry_type_must_be_unique() {
    let host = host(&["empty", "twin"]);
    host.manager.load_all().unwrap();

    assert_eq!(host.manager.status_of("empty"), Some(PluginStatus::Error));
    assert_eq!(host.manager.status_of("twin"), Some(PluginStatus::Error));

    let err = host.manager.load_by_id("empty").unwrap_err();
    assert!(matches!(err, PluginSystemError::MissingEntryType { found: 0, .. }));
    let err = host.manager.load_by_id("twin").unwrap_err();
    assert!(matches!(err, PluginSystemError::MissingEntryType { found: 2, .. }));
}

#[test]
fn test_entry_type_needs_manifest() {
    let host = host(&["anonymous"]);
    host.manager.load_all().unwrap();

    assert_eq!(host.manager.status_of("anonymous"), Some(PluginStatus::Error));
    let err = host.manager.load_by_id("anonymous").unwrap_err();
    assert!(matches!(err, PluginSystemError::MissingManifest { .. }));
}

#[test]
fn test_failed_load_cleans_up() {
    let host = host(&["failing", "alpha"]);
    let summary = host.manager.load_all().unwrap();

    assert_eq!(summary.loaded, vec!["alpha"]);
    assert_eq!(host.manager.status_of("failing"), Some(PluginStatus::Error));
    assert_eq!(host.hooks_of("failing"), vec![hook("load", false), hook("unload", false)]);
    // Only alpha's subscription survives.
    assert_eq!(host.events.handler_count(PING), 1);

    let err = host.manager.load_by_id("failing").unwrap_err();
    match err {
        PluginSystemError::LoadException { id, directory, message } => {
            assert_eq!(id, "failing");
            assert_eq!(directory, host.directory("failing"));
            assert!(message.contains("database unreachable"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(host.manager.contexts_for_directory(&host.directory("failing")), 1);
}

#[test]
fn test_panicking_load_is_contained() {
    let host = host(&["panicking", "alpha"]);
    host.manager.load_all().unwrap();

    assert_eq!(host.manager.status_of("panicking"), Some(PluginStatus::Error));
    assert_eq!(host.manager.status_of("alpha"), Some(PluginStatus::Loaded));

    let err = host.manager.load_by_id("panicking").unwrap_err();
    assert!(err.to_string().contains("plugin bug during load"));
}

#[test]
fn test_unload_is_idempotent() {
    let host = host(&["alpha"]);
    host.manager.load_all().unwrap();

    host.manager.unload_by_id("alpha").unwrap();
    host.manager.unload_by_id("alpha").unwrap();

    assert_eq!(host.manager.status_of("alpha"), Some(PluginStatus::Unloaded));
    assert_eq!(
        host.hooks_of("alpha"),
        vec![hook("load", false), hook("all_loaded", false), hook("unload", false)]
    );
    assert_eq!(host.events.handler_count(PING), 0);
}

#[test]
fn test_unload_failure_is_indeterminate() {
    let host = host(&["stuck"]);
    host.manager.load_all().unwrap();

    let err = host.manager.unload_by_id("stuck").unwrap_err();
    assert!(matches!(err, PluginSystemError::UnloadFailure { ref id, .. } if id == "stuck"));
    assert_eq!(host.manager.status_of("stuck"), Some(PluginStatus::Indeterminate));

    // An explicit reload forces a fresh load attempt.
    host.manager.reload_by_id("stuck").unwrap();
    assert_eq!(host.manager.status_of("stuck"), Some(PluginStatus::Loaded));
    assert_eq!(host.manager.contexts_for_directory(&host.directory("stuck")), 1);
}

#[test]
fn test_reload_leaves_exactly_one_context() {
    let host = host(&["alpha", "beta"]);
    host.manager.load_all().unwrap();

    host.manager.reload_by_id("alpha").unwrap();

    assert_eq!(host.manager.status_of("alpha"), Some(PluginStatus::Loaded));
    assert_eq!(host.manager.contexts_for_directory(&host.directory("alpha")), 1);
    assert_eq!(host.manager.list_plugins().len(), 2);
    assert_eq!(
        host.hooks_of("alpha"),
        vec![
            hook("load", false),
            hook("all_loaded", false),
            hook("unload", false),
            hook("load", true),
        ]
    );
    // The old instance's subscription went with it.
    assert_eq!(host.events.handler_count(PING), 2);
}

#[test]
fn test_load_by_id() {
    let host = host(&["alpha"]);
    host.manager.load_all().unwrap();

    let err = host.manager.load_by_id("alpha").unwrap_err();
    assert!(matches!(err, PluginSystemError::PluginAlreadyLoaded(_)));

    host.manager.unload_by_id("alpha").unwrap();
    host.manager.load_by_id("alpha").unwrap();
    assert_eq!(host.manager.status_of("alpha"), Some(PluginStatus::Loaded));
    assert_eq!(host.manager.contexts_for_directory(&host.directory("alpha")), 1);

    // Deployed after startup.
    create_plugin_dir(&host.root, "[late]/beta");
    assert_eq!(host.manager.status_of("beta"), None);
    host.manager.load_by_id("beta").unwrap();
    assert_eq!(host.manager.status_of("beta"), Some(PluginStatus::Loaded));

    let err = host.manager.load_by_id("nope").unwrap_err();
    assert!(matches!(err, PluginSystemError::PluginNotFound(_)));
}

#[test]
fn test_unknown_id_is_not_found() {
    let host = host(&["alpha"]);
    host.manager.load_all().unwrap();

    assert!(matches!(
        host.manager.unload_by_id("nope"),
        Err(PluginSystemError::PluginNotFound(_))
    ));
    assert!(matches!(
        host.manager.reload_by_id("nope"),
        Err(PluginSystemError::PluginNotFound(_))
    ));
    assert_eq!(host.manager.path_of("nope"), None);
}

#[test]
fn test_manual_load_order() {
    let host = host_with_order(
        &["alpha", "beta", "gamma"],
        vec!["gamma".to_string(), "alpha".to_string()],
    );
    host.manager.load_all().unwrap();

    assert_eq!(host.sequence("load"), vec!["gamma", "alpha", "beta"]);
}

#[test]
fn test_shared_interfaces_rebuilt_per_batch() {
    let host = host(&["consumer", "provider"]);
    let consumed = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&consumed);
    host.events.subscribe(CONSUMED, move |payload| {
        sink.lock().push(payload.clone());
        Ok(())
    });

    host.manager.load_all().unwrap();

    // The consumer loads first but still sees the provider's contribution.
    assert_eq!(
        *consumed.lock(),
        vec![
            json!({ "phase": "use", "value": "hello" }),
            json!({ "phase": "injected", "generation": 1 }),
        ]
    );
    host.manager.with_interfaces(|interfaces| {
        assert_eq!(interfaces.generation(), 1);
        assert_eq!(interfaces.keys(), vec!["greeting".to_string()]);
        assert_eq!(interfaces.contributor_of("greeting"), Some("provider"));
    });

    consumed.lock().clear();
    host.manager.unload_by_id("provider").unwrap();

    // The consumer's lookup fails, which is logged but not fatal.
    assert_eq!(
        *consumed.lock(),
        vec![json!({ "phase": "injected", "generation": 2 })]
    );
    host.manager.with_interfaces(|interfaces| {
        assert_eq!(interfaces.generation(), 2);
        assert!(interfaces.is_empty());
    });
}

#[test]
fn test_interface_conflict_fails_batch() {
    let host = host(&["provider", "provider_two"]);

    let err = host.manager.load_all().unwrap_err();
    assert!(err.is_batch_fatal());
    match err {
        PluginSystemError::InterfaceBuild(InterfaceError::DuplicateKey { key, first, second }) => {
            assert_eq!(key, "greeting");
            assert_eq!(first, "provider");
            assert_eq!(second, "provider_two");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(host.manager.status_of("provider"), Some(PluginStatus::Loaded));
}

fn file_change_request(directory: PathBuf) -> ReloadRequest {
    ReloadRequest {
        directory,
        requested_at: std::time::Instant::now(),
        trigger: ReloadTrigger::FileChange,
    }
}

#[test]
fn test_safe_point_applies_immediate_reloads() {
    let host = host(&["alpha", "beta"]);
    host.manager.load_all().unwrap();

    let sender = host.manager.reload_sender();
    sender.send(file_change_request(host.directory("alpha"))).unwrap();
    sender.send(file_change_request(host.directory("alpha"))).unwrap();
    sender.send(file_change_request(host.directory("missing"))).unwrap();

    assert_eq!(host.manager.safe_point(SafePointKind::Tick).unwrap(), 1);
    assert_eq!(host.hooks_of("alpha").last(), Some(&hook("load", true)));
    assert_eq!(host.manager.contexts_for_directory(&host.directory("alpha")), 1);
    assert_eq!(host.manager.safe_point(SafePointKind::Tick).unwrap(), 0);
}

#[test]
fn test_deferred_reload_waits_for_level_transition() {
    let host = host(&["deferred"]);
    host.manager.load_all().unwrap();

    let sender = host.manager.reload_sender();
    sender.send(file_change_request(host.directory("deferred"))).unwrap();
    sender.send(file_change_request(host.directory("deferred"))).unwrap();

    assert_eq!(host.manager.safe_point(SafePointKind::Tick).unwrap(), 0);
    assert_eq!(host.manager.parked_reloads(), 1);
    assert_eq!(host.sequence("load"), vec!["deferred"]);

    assert_eq!(host.manager.safe_point(SafePointKind::LevelTransition).unwrap(), 1);
    assert_eq!(host.manager.parked_reloads(), 0);
    assert_eq!(host.hooks_of("deferred").last(), Some(&hook("load", true)));
}

#[test]
fn test_manual_only_plugin_ignores_file_changes() {
    let host = host(&["manual"]);
    host.manager.load_all().unwrap();

    let sender = host.manager.reload_sender();
    sender.send(file_change_request(host.directory("manual"))).unwrap();
    assert_eq!(host.manager.safe_point(SafePointKind::LevelTransition).unwrap(), 0);

    sender.send(ReloadRequest::manual(host.directory("manual"))).unwrap();
    assert_eq!(host.manager.safe_point(SafePointKind::Tick).unwrap(), 1);
}

#[test]
fn test_manager_reports_reload_policies() {
    let host = host(&["deferred", "alpha"]);
    host.manager.load_all().unwrap();

    assert_eq!(
        host.manager.reload_policy(&host.directory("deferred")),
        Some(ReloadPolicy::ReloadOnNextSafePoint)
    );
    assert_eq!(
        host.manager.reload_policy(&host.directory("alpha")),
        Some(ReloadPolicy::ReloadImmediately)
    );
    assert_eq!(host.manager.reload_policy(&host.directory("unknown")), None);

    host.manager.unload_by_id("alpha").unwrap();
    assert_eq!(host.manager.reload_policy(&host.directory("alpha")), None);
}

#[test]
fn test_shutdown_unloads_in_reverse_order() {
    let host = host(&["alpha", "beta", "gamma"]);
    host.manager.load_all().unwrap();

    host.manager.shutdown();

    assert_eq!(host.sequence("unload"), vec!["gamma", "beta", "alpha"]);
    assert!(host
        .manager
        .all_statuses()
        .iter()
        .all(|(_, status)| *status == PluginStatus::Unloaded));
    assert_eq!(host.events.handler_count(PING), 0);
    host.manager.with_interfaces(|interfaces| assert!(interfaces.is_empty()));
}

#[tokio::test]
async fn test_file_change_reaches_manager_once() {
    let host = host(&["alpha"]);
    host.manager.load_all().unwrap();
    let TestHost {
        temp_dir: _temp_dir,
        root,
        hooks,
        manager,
        ..
    } = host;
    let manager = Arc::new(manager);

    let config = HotReloadConfig {
        enabled: true,
        debounce: Duration::from_millis(100),
        max_attempts: 3,
        initial_retry_delay: Duration::from_millis(10),
    };
    let shutdown = tokio_util::sync::CancellationToken::new();
    let (changes, change_rx) = tokio::sync::mpsc::unbounded_channel();
    ReloadCoordinator::new(config, Arc::clone(&manager) as Arc<dyn PolicySource>, manager.reload_sender())
        .spawn(change_rx, shutdown.clone());

    let directory = root.join("alpha");
    let entry = entry_module_path(&directory);
    for _ in 0..3 {
        changes.send(FileChange::new(&directory, &entry)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(manager.safe_point(SafePointKind::Tick).unwrap(), 1);
    let reloads = hooks
        .lock()
        .iter()
        .filter(|recorded| recorded.hook == "load" && recorded.hot_reload)
        .count();
    assert_eq!(reloads, 1);
    shutdown.cancel();
}
