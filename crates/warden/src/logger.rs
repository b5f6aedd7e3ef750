//! Attaching container output to a logging sink.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::plugins::LoggerHandle;
use crate::runtime::ConsoleBuffer;
use crate::{ContainerId, Result};

/// Routes the console output of containers and exec'd processes to the
/// logging plugin selected for the container.
///
/// Sessions are keyed by the pid of the logged process and outlive the
/// container until [`ContainerLogger::wait_for_logging_to_finish`] is called.
pub trait ContainerLogger: Send + Sync {
    fn start_container_logging(
        &self,
        id: &ContainerId,
        runtime_pid: i32,
        container_pid: i32,
        logger: &LoggerHandle,
    ) -> bool;

    /// Copies buffered runtime output into the log of `container_pid`.
    fn dump_buffer(&self, buffer: &ConsoleBuffer, container_pid: i32, logger: &LoggerHandle) -> bool;

    fn wait_for_logging_to_finish(&self, _container_pid: i32) {}

    fn shutdown(&self) {}
}

struct Session {
    path: PathBuf,
    // bytes of the console buffer already copied
    offset: usize,
}

/// Appends container output to `<dir>/<id>.log`, or to the file named by a
/// `path` entry in the logging plugin's data.
pub struct FileLogger {
    dir: PathBuf,
    sessions: Mutex<HashMap<i32, Session>>,
}

impl FileLogger {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    fn log_path(&self, id: &str, logger: &LoggerHandle) -> PathBuf {
        match logger.data.get("path").and_then(|p| p.as_str()) {
            Some(path) => PathBuf::from(path),
            None => self.dir.join(format!("{id}.log")),
        }
    }
}

fn append(path: &Path, data: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(data)?;
    Ok(())
}

impl ContainerLogger for FileLogger {
    fn start_container_logging(
        &self,
        id: &ContainerId,
        runtime_pid: i32,
        container_pid: i32,
        logger: &LoggerHandle,
    ) -> bool {
        let path = self.log_path(id.as_str(), logger);
        let banner = format!("-- {id}: logging pid {container_pid} (runtime pid {runtime_pid})\n");
        if let Err(err) = append(&path, banner.as_bytes()) {
            log::error!("failed to open log {path:?} for {id}: {err}");
            return false;
        }

        log::debug!("logging {id} ({container_pid}) to {path:?} via {}", logger.name());
        let mut sessions = self.sessions.lock().unwrap();
        let offset = sessions.get(&container_pid).map_or(0, |s| s.offset);
        sessions.insert(container_pid, Session { path, offset });
        true
    }

    fn dump_buffer(&self, buffer: &ConsoleBuffer, container_pid: i32, logger: &LoggerHandle) -> bool {
        let contents = match buffer.contents() {
            Ok(contents) => contents,
            Err(err) => {
                log::error!("failed to read console buffer: {err}");
                return false;
            }
        };

        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions.entry(container_pid).or_insert_with(|| Session {
            path: self.log_path(&format!("pid-{container_pid}"), logger),
            offset: 0,
        });
        if contents.len() < session.offset {
            // a fresh buffer, e.g. after a restart
            session.offset = 0;
        }

        let fresh = &contents[session.offset..];
        if fresh.is_empty() {
            return true;
        }
        match append(&session.path, fresh) {
            Ok(()) => {
                session.offset = contents.len();
                true
            }
            Err(err) => {
                log::error!("failed to write log {:?}: {err}", session.path);
                false
            }
        }
    }

    fn wait_for_logging_to_finish(&self, container_pid: i32) {
        self.sessions.lock().unwrap().remove(&container_pid);
    }

    fn shutdown(&self) {
        let mut sessions = self.sessions.lock().unwrap();
        if !sessions.is_empty() {
            log::info!("closing {} logging sessions", sessions.len());
        }
        sessions.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::tempdir;

    use super::*;
    use crate::plugins::HintFlags;
    use crate::testing::FakeRdkPlugin;

    fn handle(data: serde_json::Value) -> LoggerHandle {
        LoggerHandle {
            plugin: Arc::new(FakeRdkPlugin::new("logging", HintFlags::empty()).logging()),
            data,
        }
    }

    #[test]
    fn test_dump_only_appends_new_output() -> Result<()> {
        let dir = tempdir()?;
        let logger = FileLogger::new(dir.path())?;
        let handle = handle(serde_json::Value::Null);
        let id = ContainerId::create("app");

        assert!(logger.start_container_logging(&id, 10, 11, &handle));
        let console = ConsoleBuffer::new()?;
        console.write_all(b"one\n")?;
        assert!(logger.dump_buffer(&console, 11, &handle));
        console.write_all(b"two\n")?;
        assert!(logger.dump_buffer(&console, 11, &handle));
        assert!(logger.dump_buffer(&console, 11, &handle));

        let log = fs::read_to_string(dir.path().join("app.log"))?;
        assert_eq!(
            log,
            "-- app: logging pid 11 (runtime pid 10)\none\ntwo\n"
        );
        logger.wait_for_logging_to_finish(11);
        logger.shutdown();
        Ok(())
    }

    #[test]
    fn test_path_from_plugin_data() -> Result<()> {
        let dir = tempdir()?;
        let target = dir.path().join("custom.log");
        let logger = FileLogger::new(dir.path().join("logs"))?;
        let handle = handle(serde_json::json!({ "path": target }));

        let console = ConsoleBuffer::new()?;
        console.write_all(b"early output\n")?;
        // no session yet: the dump still lands in the configured file
        assert!(logger.dump_buffer(&console, 7, &handle));
        assert_eq!(fs::read_to_string(&target)?, "early output\n");
        Ok(())
    }
}
