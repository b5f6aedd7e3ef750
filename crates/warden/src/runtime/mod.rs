//! Contract for the external OCI runtime tool and its production implementation.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::os::fd::OwnedFd;
use std::path::Path;
use std::process::Stdio;

use nix::sys::memfd::{MemFdCreateFlag, memfd_create};
use nix::sys::signal::Signal;

use crate::hibernate::HibernateOptions;
use crate::{ContainerId, Result};

mod runc;

pub use runc::RunC;

/// Status of a container as reported by the runtime tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Unknown,
    Created,
    Running,
    Pausing,
    Paused,
    Stopped,
}

impl ContainerStatus {
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "created" => Self::Created,
            "running" => Self::Running,
            "pausing" => Self::Pausing,
            "paused" => Self::Paused,
            "stopped" => Self::Stopped,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerListItem {
    pub id: ContainerId,
    pub pid: i32,
    pub bundle: String,
    pub status: ContainerStatus,
}

/// Synchronous driver for the external container runtime.
///
/// Every call blocks until the runtime tool has finished. The orchestrator
/// never holds its registry lock across these calls.
pub trait Runtime: Send + Sync {
    /// Creates the container without starting it, returning the pid of the
    /// runtime tool and the pid of the container's init process.
    fn create(
        &self,
        id: &ContainerId,
        bundle: &Path,
        console: &ConsoleBuffer,
        files: &[OwnedFd],
        custom_config: Option<&Path>,
    ) -> Result<(i32, i32)>;

    fn start(&self, id: &ContainerId, console: &ConsoleBuffer) -> Result<()>;

    fn kill(&self, id: &ContainerId, signal: Signal, all: bool) -> Result<()>;

    fn pause(&self, id: &ContainerId) -> Result<()>;

    fn resume(&self, id: &ContainerId) -> Result<()>;

    /// Runs an extra process inside the container, returning the runtime
    /// tool's pid and the pid of the new process.
    fn exec(&self, id: &ContainerId, options: &str, command: &str) -> Result<(i32, i32)>;

    fn destroy(&self, id: &ContainerId, console: Option<&ConsoleBuffer>, force: bool)
    -> Result<()>;

    fn list(&self) -> Result<Vec<ContainerListItem>>;

    fn state(&self, id: &ContainerId) -> ContainerStatus;

    /// Checkpoints the memory of `pid` so the container's footprint drops.
    fn hibernate(&self, pid: i32, options: &HibernateOptions) -> Result<()>;

    fn wakeup(&self, pid: i32) -> Result<()>;
}

/// Anonymous memfd capturing the console output of runtime invocations, so it
/// can be dumped into the container's log once a logger is attached.
#[derive(Debug)]
pub struct ConsoleBuffer {
    file: File,
}

impl ConsoleBuffer {
    pub fn new() -> Result<Self> {
        let fd = memfd_create(c"console", MemFdCreateFlag::MFD_CLOEXEC)?;
        Ok(Self {
            file: File::from(fd),
        })
    }

    /// A handle usable as stdout/stderr of a spawned process.
    pub fn stdio(&self) -> Result<Stdio> {
        Ok(Stdio::from(self.file.try_clone()?))
    }

    pub fn contents(&self) -> Result<Vec<u8>> {
        let mut file = self.file.try_clone()?;
        file.seek(SeekFrom::Start(0))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        Ok(buf)
    }

    pub fn write_all(&self, data: &[u8]) -> Result<()> {
        use std::io::Write;
        let mut file = self.file.try_clone()?;
        file.seek(SeekFrom::End(0))?;
        file.write_all(data)?;
        Ok(())
    }
}
