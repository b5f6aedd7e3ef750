use std::sync::Arc;

use crossbeam::channel::Receiver;

use super::Inner;
use crate::config::dup_cloexec;
use crate::container::Artifacts;
use crate::plugins::HintFlags;
use crate::reaper::ExitEvent;
use crate::runtime::ConsoleBuffer;
use crate::state::ContainerState;
use crate::{ContainerId, Error, Result};

/// Status reported for containers killed during shutdown.
const KILLED_STATUS: i32 = 128 + libc::SIGKILL;

/// A container whose init process has gone and which is now owned by the
/// thread that claimed it.
struct Claimed {
    cd: i32,
    id: ContainerId,
    artifacts: Arc<Artifacts>,
}

impl Inner {
    pub(super) fn monitor(&self, exits: Receiver<ExitEvent>, stop: Receiver<()>) {
        log::debug!("monitor thread started");
        loop {
            crossbeam::select! {
                recv(exits) -> event => match event {
                    Ok(event) => self.handle_exit(event),
                    Err(_) => break,
                },
                recv(stop) -> _ => break,
            }
        }
        log::debug!("monitor thread stopped");
    }

    pub(super) fn handle_exit(&self, event: ExitEvent) {
        let ExitEvent { pid, status } = event;
        let (claimed, restart) = {
            let mut registry = self.registry.lock().unwrap();
            let Some(container) = registry.find_by_pid(pid) else {
                log::debug!("ignoring exit of untracked process {pid}");
                return;
            };

            if container.container_pid != pid {
                container.exec_pids.retain(|p| *p != pid);
                log::debug!("exec'd process {pid} of {} exited with {status}", container.id);
                return;
            }
            if container.reaped {
                return;
            }

            log::info!("container {} (pid {pid}) exited with {status}", container.id);
            container.reaped = true;
            if let Err(err) = container.state.exited() {
                log::warn!("{}: {err}", container.id);
            }
            let restart = container.restart.should_restart(status);
            let claimed = Claimed {
                cd: container.descriptor,
                id: container.id.clone(),
                artifacts: container.artifacts.clone(),
            };
            (claimed, restart)
        };

        self.run_stop_hooks(&claimed, status);
        if restart {
            match self.restart(&claimed) {
                Ok(()) => return,
                Err(err) => log::error!("failed to restart {}: {err}", claimed.id),
            }
        }
        self.teardown(&claimed, status, false);
    }

    fn run_stop_hooks(&self, claimed: &Claimed, status: i32) {
        let Claimed { id, artifacts, .. } = claimed;
        if !self
            .legacy
            .execute_post_stop_hooks(&artifacts.legacy_plugins, id, artifacts.rootfs.path())
        {
            log::warn!("postStop hooks failed for {id}");
        }
        artifacts.rdk.set_exit_status(status);
        if !artifacts.rdk.run_plugins(HintFlags::POST_STOP, None) {
            log::warn!("postStop plugins failed for {id}");
        }
    }

    /// Destroys the dead container and launches it again from the same
    /// bundle and descriptors.
    fn restart(&self, claimed: &Claimed) -> Result<()> {
        let Claimed { cd, id, artifacts } = claimed;
        let _start = self.starts.enter()?;
        log::info!("restarting {id}");

        let (old_pid, old_console, files) = {
            let registry = self.registry.lock().unwrap();
            let container = registry
                .containers
                .get(cd)
                .ok_or_else(|| Error::NotFound(format!("container {id}")))?;
            let files = container
                .files
                .iter()
                .map(dup_cloexec)
                .collect::<Result<Vec<_>>>()?;
            (container.container_pid, container.console.clone(), files)
        };

        let console = ConsoleBuffer::new()?;
        if let Err(err) = self.runtime.destroy(id, Some(&console), false) {
            log::warn!("failed to destroy {id} before restart: {err}");
        }
        if let Some(logger) = artifacts.rdk.container_logger() {
            if let Some(old) = &old_console {
                self.logger.dump_buffer(old, old_pid, &logger);
            }
            self.logger.dump_buffer(&console, old_pid, &logger);
            self.logger.wait_for_logging_to_finish(old_pid);
        }

        {
            let mut registry = self.registry.lock().unwrap();
            let container = registry
                .containers
                .get_mut(cd)
                .ok_or_else(|| Error::NotFound(format!("container {id}")))?;
            if !container.restart.is_enabled() {
                return Err(Error::FailedPrecondition(format!(
                    "{id} was stopped while restarting"
                )));
            }
            container.state.restart()?;
            container.container_pid = -1;
            container.console = None;
        }

        let launched = match self.launch(*cd, id, artifacts, files) {
            Ok(launched) => launched,
            Err(failure) => {
                let mut registry = self.registry.lock().unwrap();
                if let Some(container) = registry.containers.get_mut(cd) {
                    container.state = ContainerState::Stopping;
                }
                return Err(failure.error);
            }
        };
        self.commit_started(*cd, id, launched)
    }

    /// Destroys the container and drops its record. `force` also destroys a
    /// container whose processes may still be running.
    fn teardown(&self, claimed: &Claimed, status: i32, force: bool) {
        let Claimed { cd, id, artifacts } = claimed;

        let (pid, console) = {
            let registry = self.registry.lock().unwrap();
            match registry.containers.get(cd) {
                Some(container) => (container.container_pid, container.console.clone()),
                None => return,
            }
        };

        if !artifacts
            .rdk
            .run_plugins(HintFlags::POST_HALT, Some(self.settings.post_halt_timeout()))
        {
            log::warn!("postHalt plugins failed for {id}");
        }

        let destroy_console = match ConsoleBuffer::new() {
            Ok(console) => Some(console),
            Err(err) => {
                log::warn!("no console for destroying {id}: {err}");
                None
            }
        };
        if let Err(err) = self.runtime.destroy(id, destroy_console.as_ref(), force) {
            log::error!("failed to destroy {id}: {err}");
        }

        if let Some(logger) = artifacts.rdk.container_logger() {
            for console in console.as_deref().into_iter().chain(destroy_console.as_ref()) {
                self.logger.dump_buffer(console, pid, &logger);
            }
            self.logger.wait_for_logging_to_finish(pid);
        }

        if !self
            .legacy
            .execute_pre_destruction_hooks(&artifacts.legacy_plugins, id, artifacts.rootfs.path())
        {
            log::warn!("preDestruction hooks failed for {id}");
        }
        self.remove_custom_config(artifacts);

        {
            let mut registry = self.registry.lock().unwrap();
            registry.containers.remove(cd);
            registry.descriptors.free(*cd);
        }

        log::info!("container {id} stopped with status {status}");
        self.callbacks.stopped(*cd, id, status);
    }

    /// Claims every container the monitor has not claimed and tears it down
    /// on this thread.
    pub(super) fn tear_down_all(&self) {
        let claimed: Vec<Claimed> = {
            let mut registry = self.registry.lock().unwrap();
            registry
                .containers
                .values_mut()
                .filter(|c| !c.reaped)
                .map(|container| {
                    container.reaped = true;
                    container.restart.disable();
                    if let Err(err) = container.state.exited() {
                        log::warn!("{}: {err}", container.id);
                    }
                    Claimed {
                        cd: container.descriptor,
                        id: container.id.clone(),
                        artifacts: container.artifacts.clone(),
                    }
                })
                .collect()
        };

        for container in claimed {
            self.run_stop_hooks(&container, KILLED_STATUS);
            self.teardown(&container, KILLED_STATUS, true);
        }
    }
}
