//! Waiting for container processes to exit.

use std::os::fd::{AsFd, FromRawFd, OwnedFd};
use std::thread;

use crossbeam::channel::Sender;
use nix::errno::Errno;
use nix::sys::wait::{Id, WaitPidFlag, WaitStatus, waitid};

use crate::Result;

/// Exit status reported when the process could not be waited on, for
/// example because it was not a child of the daemon.
pub const UNKNOWN_EXIT_STATUS: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitEvent {
    pub pid: i32,
    /// The exit code, or `128 + signal` for a killed process.
    pub status: i32,
}

/// Reports process exits to the orchestrator's monitor thread.
pub trait ExitWatcher: Send + Sync {
    /// Starts watching `pid`; exactly one [`ExitEvent`] is sent once it exits.
    fn watch(&self, pid: i32, exits: Sender<ExitEvent>) -> Result<()>;
}

/// Waits on a pidfd from a dedicated thread per process.
///
/// Container init processes are reparented to the daemon once the runtime
/// tool exits, provided the daemon is a child subreaper.
#[derive(Debug, Default, Clone, Copy)]
pub struct PidFdWatcher;

fn pidfd_open(pid: i32) -> Result<OwnedFd> {
    let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid, 0) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd as i32) })
}

fn wait_exit(pidfd: &OwnedFd, pid: i32) -> i32 {
    loop {
        match waitid(Id::PIDFd(pidfd.as_fd()), WaitPidFlag::WEXITED) {
            Ok(WaitStatus::Exited(_, code)) => return code,
            Ok(WaitStatus::Signaled(_, sig, dumped)) => {
                log::info!("process {pid} killed by signal {sig}, dumped: {dumped}");
                return 128 + sig as i32;
            }
            Ok(status) => log::debug!("process {pid}: ignoring wait status {status:?}"),
            Err(Errno::EINTR) => continue,
            Err(err) => {
                log::warn!("failed to wait for process {pid}: {err}");
                return UNKNOWN_EXIT_STATUS;
            }
        }
    }
}

impl ExitWatcher for PidFdWatcher {
    fn watch(&self, pid: i32, exits: Sender<ExitEvent>) -> Result<()> {
        let pidfd = match pidfd_open(pid) {
            Ok(fd) => fd,
            Err(err) => {
                // already gone, report it straight away
                log::warn!("failed to open pidfd for {pid}: {err}");
                let _ = exits.send(ExitEvent {
                    pid,
                    status: UNKNOWN_EXIT_STATUS,
                });
                return Ok(());
            }
        };

        thread::Builder::new()
            .name(format!("{pid}-wait"))
            .spawn(move || {
                let status = wait_exit(&pidfd, pid);
                log::debug!("process {pid} exited with {status}");
                let _ = exits.send(ExitEvent { pid, status });
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::process::Command;
    use std::time::Duration;

    use crossbeam::channel::unbounded;

    use super::*;

    #[test]
    fn test_reports_exit_code_and_signal() -> Result<()> {
        let (tx, rx) = unbounded();

        let child = Command::new("sh").args(["-c", "exit 3"]).spawn()?;
        PidFdWatcher.watch(child.id() as i32, tx.clone())?;
        let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(event, ExitEvent { pid: child.id() as i32, status: 3 });

        let child = Command::new("sleep").arg("30").spawn()?;
        let pid = child.id() as i32;
        PidFdWatcher.watch(pid, tx)?;
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), nix::sys::signal::SIGKILL)?;
        let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(event.status, 128 + libc::SIGKILL);
        Ok(())
    }

    #[test]
    fn test_missing_process_is_reported() -> Result<()> {
        let (tx, rx) = unbounded();
        // pid_max is far below this
        PidFdWatcher.watch(i32::MAX - 1, tx)?;
        let event = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(event.status, UNKNOWN_EXIT_STATUS);
        Ok(())
    }
}
