use std::fs;
use std::os::fd::OwnedFd;
use std::path::Path;
use std::sync::{Arc, Mutex};

use nix::sys::signal::Signal;

use super::Inner;
use crate::config::{Bundle, ContainerConfig, POST_INSTALL_MARKER, Rootfs, StartState};
use crate::container::{Artifacts, Container, RestartPolicy};
use crate::plugins::{HintFlags, LoggerHandle, RdkPluginManager};
use crate::runtime::ConsoleBuffer;
use crate::{ContainerId, Error, Result};

pub(super) enum Source<'a> {
    Bundle(&'a Path),
    Spec(&'a str),
}

/// Per-start changes to the container's config.
pub(super) struct Overrides<'a> {
    pub command: &'a str,
    pub display_socket: &'a str,
    pub env_vars: &'a [String],
}

impl Overrides<'_> {
    fn is_empty(&self) -> bool {
        self.command.is_empty() && self.display_socket.is_empty() && self.env_vars.is_empty()
    }
}

/// A container whose init process is running.
pub(super) struct Launched {
    pub pid: i32,
    pub console: Arc<ConsoleBuffer>,
}

pub(super) struct LaunchFailure {
    pub error: Error,
    /// The runtime had created the container before the failure.
    pub created: bool,
}

impl LaunchFailure {
    fn before_create(error: Error) -> Self {
        Self {
            error,
            created: false,
        }
    }
}

impl Inner {
    pub(super) fn start_container(
        &self,
        id: &ContainerId,
        source: Source,
        files: Vec<OwnedFd>,
        overrides: &Overrides,
    ) -> Result<i32> {
        if id.is_empty() {
            return Err(Error::InvalidArgument("invalid container id".into()));
        }
        let _start = self.starts.enter()?;
        self.ensure_unique(id)?;

        let (bundle, config) = match source {
            Source::Bundle(path) => {
                let bundle = Bundle::from_path(path)?;
                let config = ContainerConfig::from_bundle(&bundle)?;
                (bundle, config)
            }
            Source::Spec(spec) => {
                let config = ContainerConfig::from_legacy_spec(spec)?;
                let bundle = Bundle::create(&self.settings.workspace_dir, id)?;
                (bundle, config)
            }
        };
        if !config.is_valid() {
            return Err(Error::InvalidArgument(format!("invalid config for {id}")));
        }

        let rootfs = Rootfs::new(&bundle, &config)?;
        if !bundle.is_valid() || !rootfs.is_valid() {
            return Err(Error::InvalidArgument(format!(
                "invalid bundle or rootfs for {id} at {:?}",
                bundle.path()
            )));
        }

        let start_state = StartState::new(files)?;
        let rdk = RdkPluginManager::new(
            &self.plugins,
            id,
            bundle.path(),
            rootfs.path(),
            config.rdk_plugins(),
        )?;
        let legacy_plugins = config.legacy_plugins().clone();

        let (cd, artifacts) = {
            let mut registry = self.registry.lock().unwrap();
            if registry.find_by_id(id).is_some() {
                return Err(Error::AlreadyExists(format!("container {id}")));
            }
            let cd = registry.descriptors.alloc();
            if cd < 0 {
                return Err(Error::Others("no free container descriptors".into()));
            }

            let custom_config =
                (!overrides.is_empty()).then(|| bundle.path().join(format!("config-{cd}.json")));
            let artifacts = Arc::new(Artifacts {
                bundle,
                rootfs,
                config: Mutex::new(config),
                legacy_plugins,
                rdk,
                custom_config,
            });
            registry
                .containers
                .insert(cd, Container::new(cd, id.clone(), artifacts.clone()));
            (cd, artifacts)
        };

        let files = match self.prepare(cd, id, &artifacts, &start_state, overrides) {
            Ok(files) => files,
            Err(err) => {
                self.roll_back(cd, id, &artifacts, false);
                return Err(err);
            }
        };
        let launched = match self.launch(cd, id, &artifacts, files) {
            Ok(launched) => launched,
            Err(failure) => {
                self.roll_back(cd, id, &artifacts, failure.created);
                return Err(failure.error);
            }
        };

        self.commit_started(cd, id, launched)?;
        Ok(cd)
    }

    fn ensure_unique(&self, id: &ContainerId) -> Result<()> {
        let registry = self.registry.lock().unwrap();
        match registry.find_by_id(id) {
            Some(_) => Err(Error::AlreadyExists(format!("container {id}"))),
            None => Ok(()),
        }
    }

    /// Runs the construction hooks and writes the config files the runtime
    /// is handed. Returns the descriptors to pass to `create`.
    fn prepare(
        &self,
        cd: i32,
        id: &ContainerId,
        artifacts: &Artifacts,
        start_state: &StartState,
        overrides: &Overrides,
    ) -> Result<Vec<OwnedFd>> {
        let rootfs = artifacts.rootfs.path();
        if !self.legacy.execute_post_construction_hooks(
            &artifacts.legacy_plugins,
            id,
            start_state,
            rootfs,
        ) {
            return Err(Error::Plugin {
                name: "legacy".into(),
                reason: "postConstruction hooks failed".into(),
            });
        }

        let marker = artifacts.bundle.path().join(POST_INSTALL_MARKER);
        if marker.exists() {
            log::debug!("post-installation hooks already ran for {id}");
        } else {
            if !artifacts.rdk.run_plugins(HintFlags::POST_INSTALLATION, None) {
                return Err(Error::Plugin {
                    name: "rdk".into(),
                    reason: "postInstallation hooks failed".into(),
                });
            }
            fs::write(&marker, b"")?;
        }

        if !artifacts.rdk.run_plugins(HintFlags::PRE_CREATION, None) {
            return Err(Error::Plugin {
                name: "rdk".into(),
                reason: "preCreation hooks failed".into(),
            });
        }

        let mut config = artifacts.config.lock().unwrap();
        config.add_env(&start_state.env());
        config.write_config_json(artifacts.bundle.config_path())?;

        if config.restart_on_crash() {
            let files = start_state.files()?;
            let mut registry = self.registry.lock().unwrap();
            if let Some(container) = registry
                .containers
                .get_mut(&cd)
                .filter(|c| !c.curse_of_death)
            {
                container.restart = RestartPolicy::new(true);
                container.files = files;
            }
        }

        if let Some(path) = &artifacts.custom_config {
            let custom = config.customise(
                overrides.command,
                overrides.display_socket,
                &self.settings.display_socket_mount,
                overrides.env_vars,
            )?;
            fs::write(path, custom)
                .map_err(|err| Error::Others(format!("failed to write {path:?}: {err}")))?;
        }
        start_state.files()
    }

    /// Creates and starts the container. On failure after creation the
    /// container is killed and destroyed again before returning.
    pub(super) fn launch(
        &self,
        cd: i32,
        id: &ContainerId,
        artifacts: &Artifacts,
        files: Vec<OwnedFd>,
    ) -> Result<Launched, LaunchFailure> {
        let console = Arc::new(ConsoleBuffer::new().map_err(LaunchFailure::before_create)?);
        let logger = artifacts.rdk.container_logger();

        let created = self.runtime.create(
            id,
            artifacts.bundle.path(),
            &console,
            &files,
            artifacts.custom_config.as_deref(),
        );
        drop(files);
        let (runtime_pid, pid) = match created {
            Ok(pids) => pids,
            Err(err) => {
                if let Some(logger) = &logger {
                    self.logger.dump_buffer(&console, -1, logger);
                }
                return Err(LaunchFailure::before_create(err));
            }
        };

        self.set_container_pid(cd, pid);
        artifacts.rdk.set_container_pid(pid);
        if let Some(logger) = &logger {
            self.logger.dump_buffer(&console, pid, logger);
            if !self
                .logger
                .start_container_logging(id, runtime_pid, pid, logger)
            {
                log::warn!("failed to start logging for {id}");
            }
        }

        if let Err(err) = self.start_created(cd, id, artifacts, pid, &console) {
            self.abandon(cd, id, pid, &console, logger.as_ref());
            return Err(LaunchFailure {
                error: err,
                created: true,
            });
        }
        if let Some(logger) = &logger {
            self.logger.dump_buffer(&console, pid, logger);
        }

        let rootfs = artifacts.rootfs.path();
        if !self
            .legacy
            .execute_post_start_hooks(&artifacts.legacy_plugins, id, pid, rootfs)
        {
            log::warn!("postStart hooks failed for {id}");
        }
        if !artifacts.rdk.run_plugins(HintFlags::POST_START, None) {
            log::warn!("postStart plugins failed for {id}");
        }

        Ok(Launched { pid, console })
    }

    fn start_created(
        &self,
        cd: i32,
        id: &ContainerId,
        artifacts: &Artifacts,
        pid: i32,
        console: &ConsoleBuffer,
    ) -> Result<()> {
        if self.is_cursed(cd) {
            return Err(Error::FailedPrecondition(format!(
                "{id} was stopped while starting"
            )));
        }
        if !self.legacy.execute_pre_start_hooks(
            &artifacts.legacy_plugins,
            id,
            pid,
            artifacts.rootfs.path(),
        ) {
            return Err(Error::Plugin {
                name: "legacy".into(),
                reason: "preStart hooks failed".into(),
            });
        }
        self.runtime
            .start(id, console)
            .map_err(|err| Error::Runtime(format!("start of {id} failed: {err}")))
    }

    /// Kills and destroys a created container that could not be started.
    fn abandon(
        &self,
        cd: i32,
        id: &ContainerId,
        pid: i32,
        console: &ConsoleBuffer,
        logger: Option<&LoggerHandle>,
    ) {
        if let Err(err) = self.runtime.kill(id, Signal::SIGKILL, true) {
            log::warn!("failed to kill {id}: {err}");
        }
        if let Err(err) = self.runtime.destroy(id, Some(console), true) {
            log::error!("failed to destroy {id}: {err}");
        }
        if let Some(logger) = logger {
            self.logger.dump_buffer(console, pid, logger);
            self.logger.wait_for_logging_to_finish(pid);
        }

        // forget the pid so its exit is not taken for the container's, but
        // still reap it
        self.set_container_pid(cd, -1);
        self.watch(pid);
    }

    /// Undoes a failed start once the record is in the registry. The RDK
    /// stop hooks only run if the runtime created the container.
    fn roll_back(&self, cd: i32, id: &ContainerId, artifacts: &Artifacts, created: bool) {
        log::warn!("rolling back start of {id}");

        if created
            && !artifacts
                .rdk
                .run_plugins(HintFlags::POST_HALT, Some(self.settings.post_halt_timeout()))
        {
            log::warn!("postHalt plugins failed for {id}");
        }
        if !self.legacy.execute_pre_destruction_hooks(
            &artifacts.legacy_plugins,
            id,
            artifacts.rootfs.path(),
        ) {
            log::warn!("preDestruction hooks failed for {id}");
        }
        self.remove_custom_config(artifacts);

        let mut registry = self.registry.lock().unwrap();
        registry.containers.remove(&cd);
        registry.descriptors.free(cd);
    }

    pub(super) fn remove_custom_config(&self, artifacts: &Artifacts) {
        let Some(path) = &artifacts.custom_config else {
            return;
        };
        if let Err(err) = fs::remove_file(path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                log::warn!("failed to remove {path:?}: {err}");
            }
        }
    }

    /// Moves a launched container to `Running` and tells the clients. A stop
    /// that arrived meanwhile is carried out now.
    pub(super) fn commit_started(&self, cd: i32, id: &ContainerId, launched: Launched) -> Result<()> {
        let Launched { pid, console } = launched;
        let cursed = {
            let mut registry = self.registry.lock().unwrap();
            let container = registry
                .containers
                .get_mut(&cd)
                .ok_or_else(|| Error::NotFound(format!("container {id}")))?;
            container.state.started()?;
            container.container_pid = pid;
            container.console = Some(console);
            container.reaped = false;
            container.curse_of_death
        };

        self.watch(pid);
        self.callbacks.started(cd, id);

        if cursed {
            log::info!("{id} was asked to stop while starting");
            if let Err(err) = self.stop_container(cd, false) {
                log::warn!("failed to stop {id}: {err}");
            }
        }
        Ok(())
    }

    fn set_container_pid(&self, cd: i32, pid: i32) {
        let mut registry = self.registry.lock().unwrap();
        if let Some(container) = registry.containers.get_mut(&cd) {
            container.container_pid = pid;
        }
    }

    fn is_cursed(&self, cd: i32) -> bool {
        let registry = self.registry.lock().unwrap();
        registry
            .containers
            .get(&cd)
            .is_some_and(|c| c.curse_of_death)
    }
}
