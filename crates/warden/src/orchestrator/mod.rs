//! The container lifecycle orchestrator.
//!
//! [`Orchestrator`] owns the registry of containers, keyed by descriptor, and
//! drives each of them through [`ContainerState`]. Runtime invocations and
//! plugin hooks never run under the registry lock; operations claim a
//! container by moving it into a transitional state (or setting its busy flag)
//! first, and commit the outcome afterwards.
//!
//! Process exits are delivered by an [`ExitWatcher`] over a channel to a
//! monitor thread, which runs the stop hooks, restarts crashed containers
//! when their config asks for it, and tears everything else down.

use std::collections::BTreeMap;
use std::fs;
use std::os::fd::OwnedFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{Sender, bounded, unbounded};
use log::LevelFilter;

use crate::config::remove_generated_bundles;
use crate::container::{Artifacts, Container};
use crate::descriptor::DescriptorPool;
use crate::logger::ContainerLogger;
use crate::plugins::{DynamicMount, LegacyHookRunner, RdkPluginRegistry};
use crate::reaper::{ExitEvent, ExitWatcher};
use crate::runtime::Runtime;
use crate::settings::Settings;
use crate::state::ContainerState;
use crate::timer::TimerQueue;
use crate::{ContainerId, Error, Result};

mod cleanup;
mod control;
mod monitor;
mod startup;

use startup::{Overrides, Source};

pub type ContainerCallback = Box<dyn Fn(i32, &ContainerId) + Send + Sync>;
pub type StoppedCallback = Box<dyn Fn(i32, &ContainerId, i32) + Send + Sync>;

/// Notifications sent to the daemon's clients.
///
/// Callbacks run on the thread that completed the transition, never under
/// the registry lock, so they may call back into the orchestrator.
#[derive(Default)]
pub struct Callbacks {
    started: Option<ContainerCallback>,
    stopped: Option<StoppedCallback>,
    hibernated: Option<ContainerCallback>,
    awoken: Option<ContainerCallback>,
}

impl Callbacks {
    pub fn on_started(mut self, f: impl Fn(i32, &ContainerId) + Send + Sync + 'static) -> Self {
        self.started = Some(Box::new(f));
        self
    }

    /// Called once per container, after teardown, with the exit status of
    /// its init process.
    pub fn on_stopped(
        mut self,
        f: impl Fn(i32, &ContainerId, i32) + Send + Sync + 'static,
    ) -> Self {
        self.stopped = Some(Box::new(f));
        self
    }

    pub fn on_hibernated(mut self, f: impl Fn(i32, &ContainerId) + Send + Sync + 'static) -> Self {
        self.hibernated = Some(Box::new(f));
        self
    }

    pub fn on_awoken(mut self, f: impl Fn(i32, &ContainerId) + Send + Sync + 'static) -> Self {
        self.awoken = Some(Box::new(f));
        self
    }

    fn started(&self, cd: i32, id: &ContainerId) {
        if let Some(f) = &self.started {
            f(cd, id);
        }
    }

    fn stopped(&self, cd: i32, id: &ContainerId, status: i32) {
        if let Some(f) = &self.stopped {
            f(cd, id, status);
        }
    }

    fn hibernated(&self, cd: i32, id: &ContainerId) {
        if let Some(f) = &self.hibernated {
            f(cd, id);
        }
    }

    fn awoken(&self, cd: i32, id: &ContainerId) {
        if let Some(f) = &self.awoken {
            f(cd, id);
        }
    }
}

/// The services the orchestrator drives.
pub struct Collaborators {
    pub runtime: Arc<dyn Runtime>,
    pub legacy: LegacyHookRunner,
    pub rdk: RdkPluginRegistry,
    pub logger: Arc<dyn ContainerLogger>,
    pub watcher: Arc<dyn ExitWatcher>,
}

#[derive(Default)]
struct Registry {
    containers: BTreeMap<i32, Container>,
    descriptors: DescriptorPool,
}

impl Registry {
    fn find_by_id(&self, id: &ContainerId) -> Option<&Container> {
        self.containers.values().find(|c| &c.id == id)
    }

    fn find_by_pid(&mut self, pid: i32) -> Option<&mut Container> {
        if pid <= 0 {
            return None;
        }
        self.containers
            .values_mut()
            .find(|c| c.container_pid == pid || c.exec_pids.contains(&pid))
    }
}

#[derive(Default)]
struct Starts {
    in_flight: usize,
    closed: bool,
}

/// Counts the starts and restarts in progress so shutdown can wait for them
/// to settle before tearing containers down.
#[derive(Default)]
struct StartGate {
    starts: Mutex<Starts>,
    idle: Condvar,
}

struct StartGuard<'a>(&'a StartGate);

impl StartGate {
    fn enter(&self) -> Result<StartGuard<'_>> {
        let mut starts = self.starts.lock().unwrap();
        if starts.closed {
            return Err(Error::FailedPrecondition("shutting down".into()));
        }
        starts.in_flight += 1;
        Ok(StartGuard(self))
    }

    fn close(&self) {
        self.starts.lock().unwrap().closed = true;
    }

    fn wait_idle(&self) {
        let starts = self.starts.lock().unwrap();
        let _starts = self.idle.wait_while(starts, |s| s.in_flight > 0).unwrap();
    }
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        let mut starts = self.0.starts.lock().unwrap();
        starts.in_flight -= 1;
        if starts.in_flight == 0 {
            self.0.idle.notify_all();
        }
    }
}

struct Inner {
    registry: Mutex<Registry>,
    starts: StartGate,
    runtime: Arc<dyn Runtime>,
    legacy: LegacyHookRunner,
    plugins: RdkPluginRegistry,
    logger: Arc<dyn ContainerLogger>,
    watcher: Arc<dyn ExitWatcher>,
    exits: Sender<ExitEvent>,
    callbacks: Callbacks,
    settings: Settings,
}

impl Inner {
    fn watch(&self, pid: i32) {
        if let Err(err) = self.watcher.watch(pid, self.exits.clone()) {
            log::error!("failed to watch process {pid}: {err}");
        }
    }
}

pub struct Orchestrator {
    inner: Arc<Inner>,
    timer: TimerQueue,
    monitor: Mutex<Option<JoinHandle<()>>>,
    stop_monitor: Sender<()>,
    shut_down: AtomicBool,
}

fn succeeded(op: &str, cd: i32, result: Result<()>) -> bool {
    match result {
        Ok(()) => true,
        Err(err) => {
            log::error!("{op} of container {cd} failed: {err}");
            false
        }
    }
}

impl Orchestrator {
    /// Starts the monitor thread and the timer queue, and schedules a sweep
    /// for containers the runtime knows about but the orchestrator does not.
    pub fn new(settings: Settings, collaborators: Collaborators, callbacks: Callbacks) -> Result<Self> {
        fs::create_dir_all(&settings.workspace_dir)?;
        remove_generated_bundles(&settings.workspace_dir)?;

        let (exits_tx, exits_rx) = unbounded();
        let (stop_tx, stop_rx) = bounded(1);
        let cleanup_delay = settings.cleanup_delay();

        let inner = Arc::new(Inner {
            registry: Mutex::new(Registry::default()),
            starts: StartGate::default(),
            runtime: collaborators.runtime,
            legacy: collaborators.legacy,
            plugins: collaborators.rdk,
            logger: collaborators.logger,
            watcher: collaborators.watcher,
            exits: exits_tx,
            callbacks,
            settings,
        });

        let monitor = thread::Builder::new().name("monitor".into()).spawn({
            let inner = inner.clone();
            move || inner.monitor(exits_rx, stop_rx)
        })?;

        let orchestrator = Self {
            inner,
            timer: TimerQueue::new()?,
            monitor: Mutex::new(Some(monitor)),
            stop_monitor: stop_tx,
            shut_down: AtomicBool::new(false),
        };
        if !orchestrator.schedule_cleanup(cleanup_delay) {
            log::warn!("failed to schedule the initial cleanup");
        }
        Ok(orchestrator)
    }

    /// Starts a container from an OCI bundle on disk.
    ///
    /// Returns the new container descriptor, or `-1` on failure, in which
    /// case everything set up on the way has been undone.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self, files), level = "Info"))]
    pub fn start_container_from_bundle(
        &self,
        id: &ContainerId,
        bundle: &Path,
        files: Vec<OwnedFd>,
        command: &str,
        display_socket: &str,
        env_vars: &[String],
    ) -> i32 {
        let overrides = Overrides {
            command,
            display_socket,
            env_vars,
        };
        self.start(id, Source::Bundle(bundle), files, &overrides)
    }

    /// Starts a container from a legacy JSON spec; the bundle is generated
    /// under the workspace directory and removed with the container.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self, spec, files), level = "Info"))]
    pub fn start_container_from_spec(
        &self,
        id: &ContainerId,
        spec: &str,
        files: Vec<OwnedFd>,
        command: &str,
        display_socket: &str,
        env_vars: &[String],
    ) -> i32 {
        let overrides = Overrides {
            command,
            display_socket,
            env_vars,
        };
        self.start(id, Source::Spec(spec), files, &overrides)
    }

    fn start(&self, id: &ContainerId, source: Source, files: Vec<OwnedFd>, overrides: &Overrides) -> i32 {
        match self.inner.start_container(id, source, files, overrides) {
            Ok(cd) => {
                log::info!("started container {id} as descriptor {cd}");
                cd
            }
            Err(err) => {
                log::error!("failed to start container {id:?}: {err}");
                -1
            }
        }
    }

    /// Asks the container to stop. `true` means the request was accepted;
    /// the stopped callback fires once teardown is complete.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self), level = "Info"))]
    pub fn stop_container(&self, cd: i32, with_prejudice: bool) -> bool {
        succeeded("stop", cd, self.inner.stop_container(cd, with_prejudice))
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self), level = "Info"))]
    pub fn pause_container(&self, cd: i32) -> bool {
        succeeded("pause", cd, self.inner.pause_container(cd))
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self), level = "Info"))]
    pub fn resume_container(&self, cd: i32) -> bool {
        succeeded("resume", cd, self.inner.resume_container(cd))
    }

    /// Checkpoints the container's memory; `options` is a comma separated
    /// list such as `compress=lz4,dump_dir=/media/dumps`.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self), level = "Info"))]
    pub fn hibernate_container(&self, cd: i32, options: &str) -> bool {
        succeeded("hibernate", cd, self.inner.hibernate_container(cd, options))
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self), level = "Info"))]
    pub fn wakeup_container(&self, cd: i32) -> bool {
        succeeded("wakeup", cd, self.inner.wakeup_container(cd))
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self), level = "Info"))]
    pub fn exec_in_container(&self, cd: i32, options: &str, command: &str) -> bool {
        succeeded("exec", cd, self.inner.exec_in_container(cd, options, command))
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self), level = "Info"))]
    pub fn add_container_mount(
        &self,
        cd: i32,
        source: &Path,
        destination: &Path,
        options: &[String],
        data: &str,
    ) -> bool {
        let mount = DynamicMount {
            source: source.to_path_buf(),
            destination: destination.to_path_buf(),
            options: options.to_vec(),
            data: data.to_string(),
        };
        succeeded("add mount", cd, self.inner.add_container_mount(cd, &mount))
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self), level = "Info"))]
    pub fn remove_container_mount(&self, cd: i32, source: &Path) -> bool {
        succeeded("remove mount", cd, self.inner.remove_container_mount(cd, source))
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self), level = "Info"))]
    pub fn add_annotation(&self, cd: i32, key: &str, value: &str) -> bool {
        succeeded("annotate", cd, self.inner.add_annotation(cd, key, value))
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self), level = "Info"))]
    pub fn remove_annotation(&self, cd: i32, key: &str) -> bool {
        succeeded("remove annotation", cd, self.inner.remove_annotation(cd, key))
    }

    pub fn list_containers(&self) -> Vec<(i32, ContainerId)> {
        let registry = self.inner.registry.lock().unwrap();
        registry
            .containers
            .values()
            .map(|c| (c.descriptor, c.id.clone()))
            .collect()
    }

    /// Descriptor of the container with `id`, or `-1`.
    pub fn container_descriptor(&self, id: &ContainerId) -> i32 {
        let registry = self.inner.registry.lock().unwrap();
        registry.find_by_id(id).map_or(-1, |c| c.descriptor)
    }

    pub fn state_of_container(&self, cd: i32) -> ContainerState {
        let registry = self.inner.registry.lock().unwrap();
        registry
            .containers
            .get(&cd)
            .map_or(ContainerState::Invalid, |c| c.state)
    }

    /// A JSON snapshot of the container, or an empty string if `cd` is
    /// unknown.
    pub fn stats_of_container(&self, cd: i32) -> String {
        let registry = self.inner.registry.lock().unwrap();
        let Some(container) = registry.containers.get(&cd) else {
            return String::new();
        };
        serde_json::json!({
            "id": container.id,
            "state": container.state.as_str(),
            "pids": container.pids(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })
        .to_string()
    }

    /// The config the container was started with, including any per-start
    /// customisation.
    pub fn oci_config_of_container(&self, cd: i32) -> String {
        let Some(artifacts) = self.artifacts(cd) else {
            return String::new();
        };
        if let Some(path) = &artifacts.custom_config {
            match fs::read_to_string(path) {
                Ok(config) => return config,
                Err(err) => log::warn!("failed to read {path:?}: {err}"),
            }
        }
        match artifacts.config.lock().unwrap().to_json() {
            Ok(config) => config,
            Err(err) => {
                log::error!("failed to render config of container {cd}: {err}");
                String::new()
            }
        }
    }

    /// The legacy spec the container was started from, if any.
    pub fn spec_of_container(&self, cd: i32) -> String {
        self.artifacts(cd)
            .and_then(|artifacts| artifacts.config.lock().unwrap().legacy_spec().map(str::to_string))
            .unwrap_or_default()
    }

    fn artifacts(&self, cd: i32) -> Option<Arc<Artifacts>> {
        let registry = self.inner.registry.lock().unwrap();
        registry.containers.get(&cd).map(|c| c.artifacts.clone())
    }

    /// Runs a sweep for stale runtime containers after `delay`.
    pub fn schedule_cleanup(&self, delay: Duration) -> bool {
        let inner = Arc::downgrade(&self.inner);
        let id = self.timer.add(delay, true, move || {
            if let Some(inner) = inner.upgrade() {
                inner.cleanup_invalid_containers();
            }
            false
        });
        id > 0
    }

    /// Maps the daemon's numeric log levels onto the `log` facade.
    pub fn set_log_level(&self, level: i32) -> bool {
        let filter = match level {
            0 | 1 => LevelFilter::Error,
            2 => LevelFilter::Warn,
            3 | 4 => LevelFilter::Info,
            5 => LevelFilter::Debug,
            _ => {
                log::warn!("invalid log level {level}");
                return false;
            }
        };
        log::set_max_level(filter);
        log::info!("log level set to {filter}");
        true
    }

    fn kill_all(&self) {
        let descriptors: Vec<i32> = {
            let registry = self.inner.registry.lock().unwrap();
            registry.containers.keys().copied().collect()
        };
        for cd in descriptors {
            if let Err(err) = self.inner.stop_container(cd, true) {
                log::warn!("failed to kill container {cd}: {err}");
            }
        }
    }

    /// Kills every container and waits for its teardown. Starts still in
    /// progress are stopped once they finish; new ones are refused.
    /// Idempotent; also run on drop. Not to be called from a callback.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("shutting down orchestrator");

        self.timer.stop();
        self.inner.starts.close();

        // the first pass marks starting containers, the second kills what
        // they became
        self.kill_all();
        self.inner.starts.wait_idle();
        self.kill_all();
        self.inner.tear_down_all();

        let _ = self.stop_monitor.send(());
        if let Some(monitor) = self.monitor.lock().unwrap().take() {
            if monitor.join().is_err() {
                log::error!("monitor thread panicked");
            }
        }

        self.inner.logger.shutdown();
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
