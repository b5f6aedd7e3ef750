//! Client for the memory checkpoint/restore service used to hibernate
//! container processes.
//!
//! The service listens on a unix socket (locator starting with `/`) or on a
//! `host:port` tcp address. Each request is a packed `{code: i32, pid: i32}`
//! and each response a single `i32`.

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::{Error, Result};

pub const DEFAULT_LOCATOR: &str = "/tmp/memcrcom";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(20000);

const CHECKPOINT: i32 = 100;
const RESTORE: i32 = 101;

const RESP_OK: i32 = 0;
const RESP_INVALID_PID: i32 = -2;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Compression {
    #[default]
    None,
    Lz4,
    Zstd,
}

/// Options accepted by `hibernate_container`, given as a comma separated
/// `key=value` list, e.g. `dump_dir=/media/dumps,compress=zstd`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HibernateOptions {
    pub dump_dir: Option<PathBuf>,
    pub compression: Compression,
    pub timeout: Option<Duration>,
}

impl FromStr for HibernateOptions {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut opts = Self::default();
        for item in s.split(',').map(str::trim).filter(|i| !i.is_empty()) {
            let (key, value) = item.split_once('=').unwrap_or((item, ""));
            match key {
                "dump_dir" => opts.dump_dir = Some(PathBuf::from(value)),
                "compress" => {
                    opts.compression = match value {
                        "" | "none" => Compression::None,
                        "lz4" => Compression::Lz4,
                        "zstd" => Compression::Zstd,
                        other => {
                            return Err(Error::InvalidArgument(format!(
                                "unknown compression {other:?}"
                            )));
                        }
                    }
                }
                "timeout" => {
                    let ms = value.parse::<u64>().map_err(|err| {
                        Error::InvalidArgument(format!("bad timeout {value:?}: {err}"))
                    })?;
                    opts.timeout = Some(Duration::from_millis(ms));
                }
                other => {
                    return Err(Error::InvalidArgument(format!(
                        "unknown hibernate option {other:?}"
                    )));
                }
            }
        }
        Ok(opts)
    }
}

#[derive(Debug, Clone)]
pub struct Memcr {
    locator: String,
    timeout: Duration,
}

impl Default for Memcr {
    fn default() -> Self {
        Self::new(DEFAULT_LOCATOR, DEFAULT_TIMEOUT)
    }
}

impl Memcr {
    pub fn new(locator: impl Into<String>, timeout: Duration) -> Self {
        Self {
            locator: locator.into(),
            timeout,
        }
    }

    pub fn checkpoint(&self, pid: i32, options: &HibernateOptions) -> Result<()> {
        log::debug!("checkpointing pid {pid} with {options:?}");
        let timeout = options.timeout.unwrap_or(self.timeout);
        match self.send(CHECKPOINT, pid, timeout)? {
            RESP_OK => {
                log::info!("hibernate process PID {pid} success");
                Ok(())
            }
            code => Err(Error::Runtime(format!(
                "hibernate process PID {pid} failed with {code}"
            ))),
        }
    }

    pub fn restore(&self, pid: i32) -> Result<()> {
        match self.send(RESTORE, pid, self.timeout)? {
            RESP_OK => {
                log::info!("wakeup process PID {pid} success");
                Ok(())
            }
            RESP_INVALID_PID => {
                log::warn!("wakeup process PID {pid}: invalid pid, nothing to wake up");
                Ok(())
            }
            code => Err(Error::Runtime(format!(
                "wakeup process PID {pid} failed with {code}"
            ))),
        }
    }

    fn send(&self, code: i32, pid: i32, timeout: Duration) -> Result<i32> {
        if self.locator.is_empty() {
            return Err(Error::InvalidArgument("memcr locator is empty".into()));
        }

        if self.locator.starts_with('/') {
            let stream = UnixStream::connect(&self.locator)?;
            stream.set_read_timeout(Some(timeout))?;
            exchange(stream, code, pid)
        } else {
            let addr: SocketAddr = self.locator.parse().map_err(|err| {
                Error::InvalidArgument(format!("invalid server address {}: {err}", self.locator))
            })?;
            let stream = TcpStream::connect_timeout(&addr, timeout)?;
            stream.set_read_timeout(Some(timeout))?;
            exchange(stream, code, pid)
        }
    }
}

fn exchange(mut stream: impl Read + Write, code: i32, pid: i32) -> Result<i32> {
    let mut req = [0u8; 8];
    req[..4].copy_from_slice(&code.to_ne_bytes());
    req[4..].copy_from_slice(&pid.to_ne_bytes());
    stream.write_all(&req)?;

    let mut resp = [0u8; 4];
    match stream.read_exact(&mut resp) {
        Ok(()) => Ok(i32::from_ne_bytes(resp)),
        Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Err(
            Error::Runtime(format!("request for pid {pid} timed out")),
        ),
        Err(err) => Err(err.into()),
    }
}
