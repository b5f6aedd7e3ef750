//! Daemon log sink: `time=".." level=.. msg=".."` lines on stderr or in a
//! log file.

use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use log::kv::{self, Visitor};
use log::{LevelFilter, Metadata, Record};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

pub const LOG_ENV: &str = "RUST_LOG";

enum Sink {
    Stderr,
    File(File),
}

pub struct DaemonLogger {
    sink: Mutex<Sink>,
}

impl DaemonLogger {
    pub fn stderr() -> Self {
        Self {
            sink: Mutex::new(Sink::Stderr),
        }
    }

    pub fn with_path(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            sink: Mutex::new(Sink::File(file)),
        })
    }
}

struct KeyValues(String);

impl<'kvs> Visitor<'kvs> for KeyValues {
    fn visit_pair(&mut self, k: kv::Key<'kvs>, v: kv::Value<'kvs>) -> Result<(), kv::Error> {
        write!(&mut self.0, " {k}=\"{v}\"")?;
        Ok(())
    }
}

fn format_line(record: &Record) -> String {
    let mut kvs = KeyValues(String::new());
    let _ = record.key_values().visit(&mut kvs);
    format!(
        "time=\"{}\" level={}{} msg=\"{}\"",
        rfc3339_formatted(),
        record.level().as_str().to_lowercase(),
        kvs.0,
        record.args()
    )
}

impl log::Log for DaemonLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format_line(record);
        // write errors are dropped
        match &mut *self.sink.lock().unwrap() {
            Sink::Stderr => {
                let _ = writeln!(io::stderr().lock(), "{line}");
            }
            Sink::File(file) => {
                let _ = writeln!(file, "{line}");
            }
        }
    }

    fn flush(&self) {
        if let Sink::File(file) = &*self.sink.lock().unwrap() {
            let _ = file.sync_all();
        }
    }
}

pub fn init(debug: bool, default_log_level: &str, log_file: Option<&Path>) -> anyhow::Result<()> {
    let logger = match log_file {
        Some(path) => DaemonLogger::with_path(path)?,
        None => DaemonLogger::stderr(),
    };
    log::set_max_level(logging_level(
        debug,
        std::env::var(LOG_ENV).ok().as_deref(),
        default_log_level,
    ));
    log::set_boxed_logger(Box::new(logger))?;
    Ok(())
}

fn logging_level(debug: bool, env: Option<&str>, default_log_level: &str) -> LevelFilter {
    let level = env.unwrap_or(default_log_level);
    let level = LevelFilter::from_str(level).unwrap_or(LevelFilter::Info);
    if debug && LevelFilter::Debug > level {
        LevelFilter::Debug
    } else {
        level
    }
}

fn rfc3339_formatted() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or(OffsetDateTime::now_utc().to_string())
}
