use std::ffi::OsStr;
use std::fs;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use nix::sys::signal::Signal;
use serde::Deserialize;

use super::{ContainerListItem, ContainerStatus, ConsoleBuffer, Runtime};
use crate::config::dup_cloexec_above;
use crate::hibernate::{HibernateOptions, Memcr};
use crate::{ContainerId, Error, Result};

// fds passed into the container are parked above this number before being
// moved to 3.. in the child, so the two ranges never overlap
const PARKED_FD_BASE: i32 = 256;

/// Drives an OCI runtime binary (`crun` or `runc`) by spawning it once per
/// operation.
#[derive(Debug, Clone)]
pub struct RunC {
    binary: PathBuf,
    root: PathBuf,
    exec_init: Option<PathBuf>,
    memcr: Memcr,
}

#[derive(Deserialize)]
struct ListEntry {
    id: String,
    #[serde(default)]
    pid: i32,
    #[serde(default)]
    status: String,
    #[serde(default)]
    bundle: String,
}

#[derive(Deserialize)]
struct StateEntry {
    #[serde(default)]
    status: String,
}

impl RunC {
    pub fn new(binary: impl Into<PathBuf>, root: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            root: root.into(),
            exec_init: None,
            memcr: Memcr::default(),
        }
    }

    /// Wraps exec'd commands with an init binary that forwards signals.
    pub fn with_exec_init(mut self, init: impl Into<PathBuf>) -> Self {
        self.exec_init = Some(init.into());
        self
    }

    pub fn with_memcr(mut self, memcr: Memcr) -> Self {
        self.memcr = memcr;
        self
    }

    fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--root").arg(&self.root).args(args);
        cmd.stdin(Stdio::null());
        cmd
    }

    fn run(&self, mut cmd: Command, console: Option<&ConsoleBuffer>) -> Result<Output> {
        log::debug!("running {cmd:?}");
        let output = match console {
            Some(console) => {
                let status = cmd.stdout(console.stdio()?).stderr(console.stdio()?).status()?;
                Output {
                    status,
                    stdout: vec![],
                    stderr: vec![],
                }
            }
            None => cmd.output()?,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Runtime(format!(
                "{cmd:?} failed with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(output)
    }
}

fn read_pid_file(path: &Path) -> Result<i32> {
    let contents = fs::read_to_string(path)?;
    contents
        .trim()
        .parse()
        .map_err(|err| Error::Runtime(format!("invalid pid file {path:?}: {err}")))
}

impl Runtime for RunC {
    fn create(
        &self,
        id: &ContainerId,
        bundle: &Path,
        console: &ConsoleBuffer,
        files: &[OwnedFd],
        custom_config: Option<&Path>,
    ) -> Result<(i32, i32)> {
        let pid_file = bundle.join("container.pid");
        let _ = fs::remove_file(&pid_file);

        let mut cmd = self.command(["create", "--bundle"]);
        cmd.arg(bundle).arg("--pid-file").arg(&pid_file);
        cmd.arg("--preserve-fds").arg(files.len().to_string());
        if let Some(config) = custom_config {
            cmd.arg("--config").arg(config);
        }
        cmd.arg(id.as_str());

        let parked = files
            .iter()
            .enumerate()
            .map(|(i, fd)| dup_cloexec_above(fd, PARKED_FD_BASE + i as i32))
            .collect::<Result<Vec<_>>>()?;
        let raw: Vec<i32> = parked.iter().map(|fd| fd.as_raw_fd()).collect();
        unsafe {
            cmd.pre_exec(move || {
                for (i, fd) in raw.iter().enumerate() {
                    if libc::dup2(*fd, 3 + i as i32) < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }

        let mut child = cmd.stdout(console.stdio()?).stderr(console.stdio()?).spawn()?;
        let runtime_pid = child.id() as i32;
        let status = child.wait()?;
        drop(parked);

        if !status.success() {
            return Err(Error::Runtime(format!(
                "create of {id} failed with {status}"
            )));
        }

        let container_pid = read_pid_file(&pid_file)?;
        log::info!("created container {id} (runtime pid {runtime_pid}, init pid {container_pid})");
        Ok((runtime_pid, container_pid))
    }

    fn start(&self, id: &ContainerId, console: &ConsoleBuffer) -> Result<()> {
        self.run(self.command(["start", id.as_str()]), Some(console))?;
        Ok(())
    }

    fn kill(&self, id: &ContainerId, signal: Signal, all: bool) -> Result<()> {
        let mut cmd = self.command(["kill"]);
        if all {
            cmd.arg("--all");
        }
        cmd.arg(id.as_str()).arg((signal as i32).to_string());
        self.run(cmd, None)?;
        Ok(())
    }

    fn pause(&self, id: &ContainerId) -> Result<()> {
        self.run(self.command(["pause", id.as_str()]), None)?;
        Ok(())
    }

    fn resume(&self, id: &ContainerId) -> Result<()> {
        self.run(self.command(["resume", id.as_str()]), None)?;
        Ok(())
    }

    fn exec(&self, id: &ContainerId, options: &str, command: &str) -> Result<(i32, i32)> {
        let dir = tempfile::tempdir()?;
        let pid_file = dir.path().join("exec.pid");

        let mut cmd = self.command(["exec", "--detach", "--pid-file"]);
        cmd.arg(&pid_file);
        cmd.args(options.split_whitespace());
        cmd.arg(id.as_str());
        if let Some(init) = &self.exec_init {
            cmd.arg(init);
        }
        cmd.args(command.split_whitespace());

        let mut child = cmd.stdout(Stdio::null()).stderr(Stdio::piped()).spawn()?;
        let runtime_pid = child.id() as i32;
        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(Error::Runtime(format!(
                "exec in {id} failed with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok((runtime_pid, read_pid_file(&pid_file)?))
    }

    fn destroy(
        &self,
        id: &ContainerId,
        console: Option<&ConsoleBuffer>,
        force: bool,
    ) -> Result<()> {
        let mut cmd = self.command(["delete"]);
        if force {
            cmd.arg("--force");
        }
        cmd.arg(id.as_str());
        self.run(cmd, console)?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<ContainerListItem>> {
        let output = self.run(self.command(["list", "--format", "json"]), None)?;
        if output.stdout.iter().all(u8::is_ascii_whitespace) {
            return Ok(vec![]);
        }

        // runc prints `null` when there are no containers
        let entries: Option<Vec<ListEntry>> = serde_json::from_slice(&output.stdout)?;
        let items = entries
            .unwrap_or_default()
            .into_iter()
            .filter_map(|entry| {
                let id = ContainerId::create(&entry.id);
                if id.is_empty() {
                    log::warn!("runtime reported container with invalid id {:?}", entry.id);
                    return None;
                }
                Some(ContainerListItem {
                    id,
                    pid: entry.pid,
                    bundle: entry.bundle,
                    status: ContainerStatus::parse(&entry.status),
                })
            })
            .collect();
        Ok(items)
    }

    fn state(&self, id: &ContainerId) -> ContainerStatus {
        let output = match self.run(self.command(["state", id.as_str()]), None) {
            Ok(output) => output,
            Err(err) => {
                log::debug!("state of {id}: {err}");
                return ContainerStatus::Unknown;
            }
        };
        match serde_json::from_slice::<StateEntry>(&output.stdout) {
            Ok(state) => ContainerStatus::parse(&state.status),
            Err(err) => {
                log::warn!("failed to parse state of {id}: {err}");
                ContainerStatus::Unknown
            }
        }
    }

    fn hibernate(&self, pid: i32, options: &HibernateOptions) -> Result<()> {
        self.memcr.checkpoint(pid, options)
    }

    fn wakeup(&self, pid: i32) -> Result<()> {
        self.memcr.restore(pid)
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use tempfile::tempdir;

    use super::*;

    // stand-in runtime binary: answers `list` and `state`, fails `pause`
    const FAKE_RUNTIME: &str = r#"#!/bin/sh
shift 2
case "$1" in
    list) echo '[{"id":"a.123","pid":42,"status":"running","bundle":"/b"},{"id":"123","pid":1,"status":"stopped","bundle":"/c"}]' ;;
    state) echo '{"status":"paused"}' ;;
    pause) echo "cannot pause" >&2; exit 1 ;;
    start) echo "started $2" ;;
    *) exit 0 ;;
esac
"#;

    fn fake_runtime(dir: &Path) -> Result<RunC> {
        let path = dir.join("fake-runtime");
        fs::write(&path, FAKE_RUNTIME)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
        Ok(RunC::new(path, dir.join("root")))
    }

    #[test]
    fn test_list_and_state() -> Result<()> {
        let dir = tempdir()?;
        let runc = fake_runtime(dir.path())?;

        let items = runc.list()?;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id.as_str(), "a.123");
        assert_eq!(items[0].pid, 42);
        assert_eq!(items[0].status, ContainerStatus::Running);

        assert_eq!(runc.state(&ContainerId::create("a.123")), ContainerStatus::Paused);
        Ok(())
    }

    #[test]
    fn test_failures_are_errors() -> Result<()> {
        let dir = tempdir()?;
        let runc = fake_runtime(dir.path())?;
        let err = runc.pause(&ContainerId::create("a.123")).unwrap_err();
        assert!(err.to_string().contains("cannot pause"));
        Ok(())
    }

    #[test]
    fn test_start_output_goes_to_console() -> Result<()> {
        let dir = tempdir()?;
        let runc = fake_runtime(dir.path())?;
        let console = ConsoleBuffer::new()?;
        runc.start(&ContainerId::create("a.123"), &console)?;
        assert_eq!(console.contents()?, b"started a.123\n");
        Ok(())
    }

    #[test]
    fn test_missing_binary() {
        let runc = RunC::new("/nonexistent/crun", "/tmp");
        assert!(runc.list().is_err());
        assert_eq!(runc.state(&ContainerId::create("a")), ContainerStatus::Unknown);
    }
}
