use std::path::Path;
use std::sync::Arc;

use nix::sys::signal::Signal;

use super::Inner;
use crate::container::{Artifacts, Container};
use crate::hibernate::HibernateOptions;
use crate::plugins::DynamicMount;
use crate::state::ContainerState;
use crate::{ContainerId, Error, Result};

enum StopAction {
    Done,
    Kill(ContainerId),
    Resume,
    Wakeup,
}

impl Inner {
    fn with_container<T>(&self, cd: i32, f: impl FnOnce(&mut Container) -> Result<T>) -> Result<T> {
        let mut registry = self.registry.lock().unwrap();
        let container = registry
            .containers
            .get_mut(&cd)
            .ok_or_else(|| Error::NotFound(format!("container descriptor {cd}")))?;
        f(container)
    }

    fn running(&self, cd: i32) -> Result<(ContainerId, Arc<Artifacts>)> {
        self.with_container(cd, |c| {
            if c.state != ContainerState::Running {
                return Err(Error::FailedPrecondition(format!(
                    "{} is {}, not running",
                    c.id,
                    c.state.as_str()
                )));
            }
            Ok((c.id.clone(), c.artifacts.clone()))
        })
    }

    /// Marks the container busy for a runtime call that needs it in
    /// `required` state.
    fn begin(&self, cd: i32, required: ContainerState) -> Result<ContainerId> {
        self.with_container(cd, |c| {
            if c.busy {
                return Err(Error::FailedPrecondition(format!("{} is busy", c.id)));
            }
            if c.state != required {
                return Err(Error::FailedPrecondition(format!(
                    "{} is {}, not {}",
                    c.id,
                    c.state.as_str(),
                    required.as_str()
                )));
            }
            c.busy = true;
            Ok(c.id.clone())
        })
    }

    fn finish(
        &self,
        cd: i32,
        result: Result<()>,
        commit: impl FnOnce(&mut ContainerState) -> Result<()>,
    ) -> Result<()> {
        self.with_container(cd, |c| {
            c.busy = false;
            result?;
            commit(&mut c.state)
        })
    }

    pub(super) fn stop_container(&self, cd: i32, with_prejudice: bool) -> Result<()> {
        let action = self.with_container(cd, |c| {
            c.restart.disable();
            c.files.clear();
            match c.state {
                ContainerState::Starting => {
                    log::info!("{} is starting, it will be stopped once started", c.id);
                    c.curse_of_death = true;
                    Ok(StopAction::Done)
                }
                ContainerState::Stopping => Ok(StopAction::Done),
                ContainerState::Running if c.busy => {
                    Err(Error::FailedPrecondition(format!("{} is busy", c.id)))
                }
                ContainerState::Running => {
                    c.state.stop()?;
                    Ok(StopAction::Kill(c.id.clone()))
                }
                ContainerState::Paused => Ok(StopAction::Resume),
                ContainerState::Hibernated => Ok(StopAction::Wakeup),
                state => Err(Error::FailedPrecondition(format!(
                    "cannot stop {} while {}",
                    c.id,
                    state.as_str()
                ))),
            }
        })?;

        match action {
            StopAction::Done => Ok(()),
            StopAction::Resume => {
                self.resume_container(cd)?;
                self.stop_container(cd, with_prejudice)
            }
            StopAction::Wakeup => {
                self.wakeup_container(cd)?;
                self.stop_container(cd, with_prejudice)
            }
            StopAction::Kill(id) => {
                let signal = if with_prejudice {
                    Signal::SIGKILL
                } else {
                    Signal::SIGTERM
                };
                log::info!("stopping {id} with {signal}");
                if let Err(err) = self.runtime.kill(&id, signal, false) {
                    self.with_container(cd, |c| {
                        if c.state == ContainerState::Stopping && !c.reaped {
                            c.state.abort_transition()?;
                        }
                        Ok(())
                    })?;
                    return Err(err);
                }
                Ok(())
            }
        }
    }

    pub(super) fn pause_container(&self, cd: i32) -> Result<()> {
        let id = self.begin(cd, ContainerState::Running)?;
        let result = self.runtime.pause(&id);
        self.finish(cd, result, ContainerState::pause)
    }

    pub(super) fn resume_container(&self, cd: i32) -> Result<()> {
        let id = self.begin(cd, ContainerState::Paused)?;
        let result = self.runtime.resume(&id);
        self.finish(cd, result, ContainerState::resume)
    }

    pub(super) fn hibernate_container(&self, cd: i32, options: &str) -> Result<()> {
        let options: HibernateOptions = options.parse()?;
        let (id, pid) = self.with_container(cd, |c| {
            if c.busy {
                return Err(Error::FailedPrecondition(format!("{} is busy", c.id)));
            }
            c.state.hibernate()?;
            Ok((c.id.clone(), c.container_pid))
        })?;

        match self.runtime.hibernate(pid, &options) {
            Ok(()) => {
                self.with_container(cd, |c| c.state.hibernated())?;
                log::info!("{id} hibernated");
                self.callbacks.hibernated(cd, &id);
                Ok(())
            }
            Err(err) => {
                self.abort(cd, ContainerState::Hibernating);
                Err(err)
            }
        }
    }

    pub(super) fn wakeup_container(&self, cd: i32) -> Result<()> {
        let (id, pid) = self.with_container(cd, |c| {
            if c.busy {
                return Err(Error::FailedPrecondition(format!("{} is busy", c.id)));
            }
            c.state.wakeup()?;
            Ok((c.id.clone(), c.container_pid))
        })?;

        match self.runtime.wakeup(pid) {
            Ok(()) => {
                self.with_container(cd, |c| c.state.awoken())?;
                log::info!("{id} woke up");
                self.callbacks.awoken(cd, &id);
                Ok(())
            }
            Err(err) => {
                self.abort(cd, ContainerState::Awakening);
                Err(err)
            }
        }
    }

    /// Reverts `transitional` unless the container has moved on since.
    fn abort(&self, cd: i32, transitional: ContainerState) {
        let reverted = self.with_container(cd, |c| {
            if c.state == transitional {
                c.state.abort_transition()?;
            }
            Ok(())
        });
        if let Err(err) = reverted {
            log::warn!("failed to revert container {cd}: {err}");
        }
    }

    pub(super) fn exec_in_container(&self, cd: i32, options: &str, command: &str) -> Result<()> {
        let (id, artifacts) = self.running(cd)?;

        let (runtime_pid, pid) = self.runtime.exec(&id, options, command)?;
        if pid <= 0 {
            return Err(Error::Runtime(format!("exec in {id} returned no pid")));
        }
        if let Some(logger) = artifacts.rdk.container_logger() {
            if !self
                .logger
                .start_container_logging(&id, runtime_pid, pid, &logger)
            {
                log::warn!("failed to start logging for process {pid} of {id}");
            }
        }

        self.with_container(cd, |c| {
            c.exec_pids.push(pid);
            Ok(())
        })?;
        self.watch(pid);
        log::info!("executed {command:?} in {id} as pid {pid}");
        Ok(())
    }

    pub(super) fn add_container_mount(&self, cd: i32, mount: &DynamicMount) -> Result<()> {
        let (id, artifacts) = self.running(cd)?;
        if !artifacts.rdk.add_mount(mount) {
            return Err(Error::Others(format!(
                "failed to mount {:?} into {id}",
                mount.source
            )));
        }
        Ok(())
    }

    pub(super) fn remove_container_mount(&self, cd: i32, source: &Path) -> Result<()> {
        let (id, artifacts) = self.running(cd)?;
        if !artifacts.rdk.remove_mount(source) {
            return Err(Error::Others(format!(
                "failed to unmount {source:?} from {id}"
            )));
        }
        Ok(())
    }

    pub(super) fn add_annotation(&self, cd: i32, key: &str, value: &str) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidArgument("empty annotation key".into()));
        }
        let (id, artifacts) = self.with_container(cd, |c| {
            c.annotations.insert(key.to_string(), value.to_string());
            Ok((c.id.clone(), c.artifacts.clone()))
        })?;
        if !artifacts.rdk.annotate(key, Some(value)) {
            log::debug!("annotation {key} of {id} not taken up by any plugin");
        }
        Ok(())
    }

    pub(super) fn remove_annotation(&self, cd: i32, key: &str) -> Result<()> {
        let (id, artifacts) = self.with_container(cd, |c| match c.annotations.remove(key) {
            Some(_) => Ok((c.id.clone(), c.artifacts.clone())),
            None => Err(Error::NotFound(format!("annotation {key} on {}", c.id))),
        })?;
        if !artifacts.rdk.annotate(key, None) {
            log::debug!("removal of annotation {key} of {id} not taken up by any plugin");
        }
        Ok(())
    }
}
