use std::collections::BTreeMap;
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::ContainerId;
use crate::config::{Bundle, ContainerConfig, Rootfs};
use crate::plugins::RdkPluginManager;
use crate::runtime::ConsoleBuffer;
use crate::state::ContainerState;

const MAX_RESTARTS: u32 = 10;
const RESTART_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Crash-restart bookkeeping for one container.
#[derive(Debug, Default)]
pub(crate) struct RestartPolicy {
    enabled: bool,
    count: u32,
    last: Option<Instant>,
}

impl RestartPolicy {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Default::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    /// Restarts are given up after more than ten attempts within five
    /// minutes of each other.
    pub fn should_restart_at(&mut self, status: i32, now: Instant) -> bool {
        if !self.enabled || status == 0 {
            return false;
        }

        if self
            .last
            .is_none_or(|last| now.saturating_duration_since(last) > RESTART_WINDOW)
        {
            self.count = 0;
        }

        self.count += 1;
        if self.count > MAX_RESTARTS {
            log::error!(
                "restart attempted {MAX_RESTARTS} times within {RESTART_WINDOW:?}, giving up"
            );
            return false;
        }
        self.last = Some(now);
        true
    }

    pub fn should_restart(&mut self, status: i32) -> bool {
        self.should_restart_at(status, Instant::now())
    }
}

/// On-disk state and plugin contracts of a container, shared with the
/// threads running its hooks.
pub(crate) struct Artifacts {
    pub bundle: Bundle,
    pub rootfs: Rootfs,
    pub config: Mutex<ContainerConfig>,
    pub legacy_plugins: BTreeMap<String, Value>,
    pub rdk: RdkPluginManager,
    pub custom_config: Option<PathBuf>,
}

/// A registry entry.
pub(crate) struct Container {
    pub descriptor: i32,
    pub id: ContainerId,
    pub state: ContainerState,
    /// Init process of the container, `-1` until created.
    pub container_pid: i32,
    pub artifacts: Arc<Artifacts>,
    pub restart: RestartPolicy,
    /// Copies of the start fds, handed to `create` again on restart.
    pub files: Vec<OwnedFd>,
    /// Captures the output of the running container.
    pub console: Option<Arc<ConsoleBuffer>>,
    pub exec_pids: Vec<i32>,
    pub annotations: BTreeMap<String, String>,
    /// Set when a stop arrives while the container is still starting.
    pub curse_of_death: bool,
    /// A pause/resume/exec runtime call is in flight.
    pub busy: bool,
    /// Teardown has been claimed by the monitor or by shutdown.
    pub reaped: bool,
}

impl Container {
    pub fn new(descriptor: i32, id: ContainerId, artifacts: Arc<Artifacts>) -> Self {
        Self {
            descriptor,
            id,
            state: ContainerState::Starting,
            container_pid: -1,
            artifacts,
            restart: RestartPolicy::default(),
            files: vec![],
            console: None,
            exec_pids: vec![],
            annotations: BTreeMap::new(),
            curse_of_death: false,
            busy: false,
            reaped: false,
        }
    }

    pub fn pids(&self) -> Vec<i32> {
        let mut pids = Vec::with_capacity(1 + self.exec_pids.len());
        if self.container_pid > 0 {
            pids.push(self.container_pid);
        }
        pids.extend(&self.exec_pids);
        pids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_or_clean_exit_never_restarts() {
        let mut policy = RestartPolicy::new(false);
        assert!(!policy.should_restart(1));

        let mut policy = RestartPolicy::new(true);
        assert!(!policy.should_restart(0));
        assert!(policy.should_restart(137));

        policy.disable();
        assert!(!policy.should_restart(137));
    }

    #[test]
    fn test_gives_up_after_ten_quick_restarts() {
        let mut policy = RestartPolicy::new(true);
        let start = Instant::now();
        for i in 0..10 {
            assert!(policy.should_restart_at(1, start + Duration::from_secs(i)));
        }
        assert!(!policy.should_restart_at(1, start + Duration::from_secs(11)));
    }

    #[test]
    fn test_window_resets_counter() {
        let mut policy = RestartPolicy::new(true);
        let start = Instant::now();
        for i in 0..10 {
            assert!(policy.should_restart_at(1, start + Duration::from_secs(i)));
        }
        // more than five minutes since the last attempt
        assert!(policy.should_restart_at(1, start + Duration::from_secs(9 + 301)));
    }
}
