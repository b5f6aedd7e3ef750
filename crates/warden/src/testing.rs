//! Test doubles for the orchestrator's collaborators, and a harness wiring
//! them into an [`Orchestrator`] over a temporary workspace.

use std::collections::HashSet;
use std::fs;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::Sender;
use nix::sys::signal::Signal;
use oci_spec::runtime::Spec;
use serde_json::Value;
use tempfile::TempDir;

use crate::config::{CONFIG_FILE, StartState};
use crate::hibernate::HibernateOptions;
use crate::logger::ContainerLogger;
use crate::orchestrator::{Callbacks, Collaborators, Orchestrator};
use crate::plugins::{
    DynamicMount, HintFlags, LegacyHints, LegacyHookRunner, LegacyPlugin, LoggerHandle,
    PluginContext, RdkPlugin, RdkPluginRegistry,
};
use crate::reaper::{ExitEvent, ExitWatcher};
use crate::runtime::{ConsoleBuffer, ContainerListItem, ContainerStatus, Runtime};
use crate::settings::Settings;
use crate::{ContainerId, Error, Result};

/// A shared, ordered log of what the doubles were asked to do.
pub type Calls = Arc<Mutex<Vec<String>>>;

fn record(calls: &Calls, call: String) {
    calls.lock().unwrap().push(call);
}

pub struct FakeRdkPlugin {
    name: String,
    hints: HintFlags,
    dependencies: Vec<String>,
    fail_on: HintFlags,
    sleep: Option<Duration>,
    logging: bool,
    mounts: bool,
    calls: Calls,
}

impl FakeRdkPlugin {
    pub fn new(name: impl Into<String>, hints: HintFlags) -> Self {
        Self {
            name: name.into(),
            hints,
            dependencies: vec![],
            fail_on: HintFlags::empty(),
            sleep: None,
            logging: false,
            mounts: false,
            calls: Calls::default(),
        }
    }

    pub fn with_calls(mut self, calls: Calls) -> Self {
        self.calls = calls;
        self
    }

    pub fn failing(mut self, hint: HintFlags) -> Self {
        self.fail_on = self.fail_on | hint;
        self
    }

    pub fn sleeping(mut self, duration: Duration) -> Self {
        self.sleep = Some(duration);
        self
    }

    pub fn depending_on(mut self, plugin: impl Into<String>) -> Self {
        self.dependencies.push(plugin.into());
        self
    }

    /// Marks the plugin as the container's logging plugin.
    pub fn logging(mut self) -> Self {
        self.logging = true;
        self
    }

    /// Accepts dynamic mounts.
    pub fn with_mounts(mut self) -> Self {
        self.mounts = true;
        self
    }
}

impl RdkPlugin for FakeRdkPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn hook_hints(&self) -> HintFlags {
        self.hints
    }

    fn dependencies(&self) -> Vec<String> {
        self.dependencies.clone()
    }

    fn run(&self, hook: HintFlags, _ctx: &PluginContext, deadline: Option<Instant>) -> Result<()> {
        let hook_name = hook.name().unwrap_or("unknown");
        record(&self.calls, format!("{}:{hook_name}", self.name));
        if let Some(sleep) = self.sleep {
            let left = deadline.map_or(sleep, |d| d.saturating_duration_since(Instant::now()));
            thread::sleep(sleep.min(left));
            if left < sleep {
                return Err(Error::Plugin {
                    name: self.name.clone(),
                    reason: format!("{hook_name} timed out"),
                });
            }
        }
        if self.fail_on.intersects(hook) {
            return Err(Error::Plugin {
                name: self.name.clone(),
                reason: format!("{hook_name} failed"),
            });
        }
        Ok(())
    }

    fn is_logging(&self) -> bool {
        self.logging
    }

    fn add_mount(&self, _ctx: &PluginContext, mount: &DynamicMount) -> Option<Result<()>> {
        self.mounts.then(|| {
            record(
                &self.calls,
                format!("{}:addMount({})", self.name, mount.source.display()),
            );
            Ok(())
        })
    }

    fn remove_mount(&self, _ctx: &PluginContext, source: &Path) -> Option<Result<()>> {
        self.mounts.then(|| {
            record(
                &self.calls,
                format!("{}:removeMount({})", self.name, source.display()),
            );
            Ok(())
        })
    }
}

/// A legacy plugin taking part in every hook point synchronously.
pub struct FakeLegacyPlugin {
    name: String,
    hints: LegacyHints,
    fail_on: Vec<&'static str>,
    calls: Calls,
}

impl FakeLegacyPlugin {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hints: LegacyHints::POST_CONSTRUCTION_SYNC
                .union(LegacyHints::PRE_START_SYNC)
                .union(LegacyHints::POST_START_SYNC)
                .union(LegacyHints::POST_STOP_SYNC)
                .union(LegacyHints::PRE_DESTRUCTION_SYNC),
            fail_on: vec![],
            calls: Calls::default(),
        }
    }

    pub fn with_calls(mut self, calls: Calls) -> Self {
        self.calls = calls;
        self
    }

    /// Fails the hook with the given name, e.g. `preStart`.
    pub fn failing(mut self, hook: &'static str) -> Self {
        self.fail_on.push(hook);
        self
    }

    fn hook(&self, hook: &str) -> Result<()> {
        record(&self.calls, format!("{}:{hook}", self.name));
        if self.fail_on.iter().any(|failing| *failing == hook) {
            return Err(Error::Others(format!("{} failed {hook}", self.name)));
        }
        Ok(())
    }
}

impl LegacyPlugin for FakeLegacyPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn hook_hints(&self) -> LegacyHints {
        self.hints
    }

    fn post_construction(
        &self,
        _id: &ContainerId,
        _start_state: &StartState,
        _rootfs: &Path,
        _data: &Value,
    ) -> Result<()> {
        self.hook("postConstruction")
    }

    fn pre_start(&self, _id: &ContainerId, _pid: i32, _rootfs: &Path, _data: &Value) -> Result<()> {
        self.hook("preStart")
    }

    fn post_start(&self, _id: &ContainerId, _pid: i32, _rootfs: &Path, _data: &Value) -> Result<()> {
        self.hook("postStart")
    }

    fn post_stop(&self, _id: &ContainerId, _rootfs: &Path, _data: &Value) -> Result<()> {
        self.hook("postStop")
    }

    fn pre_destruction(&self, _id: &ContainerId, _rootfs: &Path, _data: &Value) -> Result<()> {
        self.hook("preDestruction")
    }
}

/// A runtime that only records its calls. Pids are handed out in pairs
/// (runtime tool, container init) starting at 1000.
pub struct FakeRuntime {
    calls: Calls,
    failures: Mutex<HashSet<String>>,
    next_pid: AtomicI32,
    listed: Mutex<Vec<ContainerListItem>>,
}

impl FakeRuntime {
    pub fn new(calls: Calls) -> Self {
        Self {
            calls,
            failures: Mutex::new(HashSet::new()),
            next_pid: AtomicI32::new(1000),
            listed: Mutex::new(vec![]),
        }
    }

    /// Makes `step` (`create`, `start`, `kill`, ...) fail until
    /// [`FakeRuntime::succeed`] is called for it.
    pub fn fail(&self, step: &str) {
        self.failures.lock().unwrap().insert(step.to_string());
    }

    pub fn succeed(&self, step: &str) {
        self.failures.lock().unwrap().remove(step);
    }

    pub fn set_list(&self, items: Vec<ContainerListItem>) {
        *self.listed.lock().unwrap() = items;
    }

    fn call(&self, step: &str, args: String) -> Result<()> {
        record(&self.calls, format!("runtime:{step}({args})"));
        if self.failures.lock().unwrap().contains(step) {
            return Err(Error::Runtime(format!("{step} failed")));
        }
        Ok(())
    }

    fn pids(&self) -> (i32, i32) {
        let pid = self.next_pid.fetch_add(2, Ordering::SeqCst);
        (pid, pid + 1)
    }
}

impl Runtime for FakeRuntime {
    fn create(
        &self,
        id: &ContainerId,
        _bundle: &Path,
        console: &ConsoleBuffer,
        files: &[OwnedFd],
        custom_config: Option<&Path>,
    ) -> Result<(i32, i32)> {
        let config = custom_config.map_or_else(
            || CONFIG_FILE.to_string(),
            |path| path.file_name().unwrap_or_default().to_string_lossy().into_owned(),
        );
        console.write_all(format!("creating {id}\n").as_bytes())?;
        self.call("create", format!("{id},{config},{}", files.len()))?;
        Ok(self.pids())
    }

    fn start(&self, id: &ContainerId, console: &ConsoleBuffer) -> Result<()> {
        console.write_all(format!("starting {id}\n").as_bytes())?;
        self.call("start", id.to_string())
    }

    fn kill(&self, id: &ContainerId, signal: Signal, _all: bool) -> Result<()> {
        self.call("kill", format!("{id},{signal}"))
    }

    fn pause(&self, id: &ContainerId) -> Result<()> {
        self.call("pause", id.to_string())
    }

    fn resume(&self, id: &ContainerId) -> Result<()> {
        self.call("resume", id.to_string())
    }

    fn exec(&self, id: &ContainerId, _options: &str, command: &str) -> Result<(i32, i32)> {
        self.call("exec", format!("{id},{command}"))?;
        Ok(self.pids())
    }

    fn destroy(&self, id: &ContainerId, _console: Option<&ConsoleBuffer>, force: bool) -> Result<()> {
        self.call("destroy", format!("{id},{force}"))
    }

    fn list(&self) -> Result<Vec<ContainerListItem>> {
        self.call("list", String::new())?;
        Ok(self.listed.lock().unwrap().clone())
    }

    fn state(&self, id: &ContainerId) -> ContainerStatus {
        self.listed
            .lock()
            .unwrap()
            .iter()
            .find(|item| &item.id == id)
            .map_or(ContainerStatus::Unknown, |item| item.status)
    }

    fn hibernate(&self, pid: i32, _options: &HibernateOptions) -> Result<()> {
        self.call("hibernate", pid.to_string())
    }

    fn wakeup(&self, pid: i32) -> Result<()> {
        self.call("wakeup", pid.to_string())
    }
}

/// Records logger calls as `logger:<call>(<pid>)`.
pub struct RecordingLogger {
    calls: Calls,
}

impl RecordingLogger {
    pub fn new(calls: Calls) -> Self {
        Self { calls }
    }
}

impl ContainerLogger for RecordingLogger {
    fn start_container_logging(
        &self,
        id: &ContainerId,
        _runtime_pid: i32,
        container_pid: i32,
        _logger: &LoggerHandle,
    ) -> bool {
        record(&self.calls, format!("logger:start({id},{container_pid})"));
        true
    }

    fn dump_buffer(&self, _buffer: &ConsoleBuffer, container_pid: i32, _logger: &LoggerHandle) -> bool {
        record(&self.calls, format!("logger:dump({container_pid})"));
        true
    }

    fn wait_for_logging_to_finish(&self, container_pid: i32) {
        record(&self.calls, format!("logger:wait({container_pid})"));
    }

    fn shutdown(&self) {
        record(&self.calls, "logger:shutdown()".to_string());
    }
}

/// An exit watcher whose processes only exit when the test says so.
#[derive(Default)]
pub struct ManualWatcher {
    exits: Mutex<Option<Sender<ExitEvent>>>,
    watched: Mutex<Vec<i32>>,
}

impl ManualWatcher {
    pub fn watched(&self) -> Vec<i32> {
        self.watched.lock().unwrap().clone()
    }

    /// Reports `pid` as exited with `status`.
    pub fn exit(&self, pid: i32, status: i32) -> bool {
        match &*self.exits.lock().unwrap() {
            Some(exits) => exits.send(ExitEvent { pid, status }).is_ok(),
            None => false,
        }
    }
}

impl ExitWatcher for ManualWatcher {
    fn watch(&self, pid: i32, exits: Sender<ExitEvent>) -> Result<()> {
        self.watched.lock().unwrap().push(pid);
        *self.exits.lock().unwrap() = Some(exits);
        Ok(())
    }
}

pub struct OrchestratorTestBuilder {
    rdk: Vec<FakeRdkPlugin>,
    legacy: Vec<FakeLegacyPlugin>,
    settings: Settings,
    tempdir: TempDir,
}

impl OrchestratorTestBuilder {
    pub fn new() -> Result<Self> {
        // to enable logging run `export RUST_LOG=debug` and append
        // --show-output to the cargo command
        let _ = env_logger::try_init();

        let tempdir = tempfile::tempdir()?;
        let settings = Settings {
            workspace_dir: tempdir.path().join("workspace"),
            // keep the startup sweep out of the way of the tests
            cleanup_delay_ms: 60 * 60 * 1000,
            post_halt_timeout_ms: 1000,
            ..Settings::default()
        };
        Ok(Self {
            rdk: vec![],
            legacy: vec![],
            settings,
            tempdir,
        })
    }

    pub fn with_rdk_plugin(mut self, plugin: FakeRdkPlugin) -> Self {
        self.rdk.push(plugin);
        self
    }

    pub fn with_legacy_plugin(mut self, plugin: FakeLegacyPlugin) -> Self {
        self.legacy.push(plugin);
        self
    }

    /// The workspace the orchestrator will use; it may not exist yet.
    pub fn workspace_dir(&self) -> &Path {
        &self.settings.workspace_dir
    }

    pub fn with_cleanup_delay(mut self, delay: Duration) -> Self {
        self.settings.cleanup_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn build(self) -> Result<OrchestratorTest> {
        let calls = Calls::default();
        let events = Calls::default();

        let mut rdk = RdkPluginRegistry::new();
        for plugin in self.rdk {
            rdk.register(Arc::new(plugin.with_calls(calls.clone())));
        }
        let mut legacy = LegacyHookRunner::new();
        for plugin in self.legacy {
            legacy.register(Arc::new(plugin.with_calls(calls.clone())));
        }

        let runtime = Arc::new(FakeRuntime::new(calls.clone()));
        let watcher = Arc::new(ManualWatcher::default());
        let collaborators = Collaborators {
            runtime: runtime.clone(),
            legacy,
            rdk,
            logger: Arc::new(RecordingLogger::new(calls.clone())),
            watcher: watcher.clone(),
        };

        let callbacks = {
            let (started, stopped, hibernated, awoken) =
                (events.clone(), events.clone(), events.clone(), events.clone());
            Callbacks::default()
                .on_started(move |cd, id| record(&started, format!("started({cd},{id})")))
                .on_stopped(move |cd, id, status| {
                    record(&stopped, format!("stopped({cd},{id},{status})"))
                })
                .on_hibernated(move |cd, id| record(&hibernated, format!("hibernated({cd},{id})")))
                .on_awoken(move |cd, id| record(&awoken, format!("awoken({cd},{id})")))
        };

        let orchestrator = Orchestrator::new(self.settings.clone(), collaborators, callbacks)?;
        Ok(OrchestratorTest {
            orchestrator,
            runtime,
            watcher,
            calls,
            events,
            settings: self.settings,
            bundles: AtomicUsize::new(0),
            tempdir: self.tempdir,
        })
    }
}

pub struct OrchestratorTest {
    pub orchestrator: Orchestrator,
    pub runtime: Arc<FakeRuntime>,
    pub watcher: Arc<ManualWatcher>,
    /// Runtime, plugin and logger calls, in order.
    pub calls: Calls,
    /// Client callbacks, in order.
    pub events: Calls,
    pub settings: Settings,
    bundles: AtomicUsize,
    tempdir: TempDir,
}

impl OrchestratorTest {
    /// Writes a bundle whose config is the default OCI spec with the fields
    /// of `extra` merged in.
    pub fn bundle(&self, extra: Value) -> Result<PathBuf> {
        let n = self.bundles.fetch_add(1, Ordering::SeqCst);
        let dir = self.tempdir.path().join(format!("bundle{n}"));
        fs::create_dir_all(dir.join("rootfs"))?;

        let mut doc = serde_json::to_value(Spec::default())?;
        if let (Value::Object(doc), Value::Object(extra)) = (&mut doc, extra) {
            doc.extend(extra);
        }
        fs::write(dir.join(CONFIG_FILE), serde_json::to_string_pretty(&doc)?)?;
        Ok(dir)
    }

    pub fn start(&self, id: &str, bundle: &Path) -> i32 {
        self.orchestrator
            .start_container_from_bundle(&ContainerId::create(id), bundle, vec![], "", "", &[])
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn take_calls(&self) -> Vec<String> {
        std::mem::take(&mut *self.calls.lock().unwrap())
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    /// Polls `condition` for up to five seconds.
    pub fn wait_for(&self, condition: impl Fn(&Self) -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition(self) {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        condition(self)
    }
}
