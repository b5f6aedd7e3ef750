use nix::sys::signal::Signal;

use super::Inner;
use crate::runtime::ContainerStatus;

impl Inner {
    /// Kills and destroys containers the runtime still knows about but that
    /// are not in the registry, e.g. leftovers from a previous daemon.
    pub(super) fn cleanup_invalid_containers(&self) {
        let containers = match self.runtime.list() {
            Ok(containers) => containers,
            Err(err) => {
                log::error!("failed to list runtime containers: {err}");
                return;
            }
        };

        for item in containers {
            let known = {
                let registry = self.registry.lock().unwrap();
                registry.find_by_id(&item.id).is_some()
            };
            if known {
                continue;
            }

            log::warn!(
                "found invalid container {} ({:?}), cleaning up",
                item.id,
                item.status
            );
            match item.status {
                ContainerStatus::Paused | ContainerStatus::Pausing | ContainerStatus::Running => {
                    if let Err(err) = self.runtime.kill(&item.id, Signal::SIGKILL, true) {
                        log::warn!("failed to kill {}: {err}", item.id);
                    }
                }
                ContainerStatus::Created | ContainerStatus::Stopped | ContainerStatus::Unknown => {}
            }
            if let Err(err) = self.runtime.destroy(&item.id, None, true) {
                log::error!("failed to destroy invalid container {}: {err}", item.id);
            }
        }
    }
}
