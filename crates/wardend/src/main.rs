use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use git_version::git_version;
use warden::logger::FileLogger;
use warden::plugins::{LegacyHookRunner, RdkPluginRegistry};
use warden::reaper::PidFdWatcher;
use warden::runtime::RunC;
use warden::{Callbacks, Collaborators, Orchestrator, Settings};

mod logger;

const DEFAULT_CONFIG: &str = "/etc/wardend.toml";

const VERSION: &str = env!("CARGO_PKG_VERSION");
const REVISION: &str = git_version!(
    args = ["--match=:", "--always", "--abbrev=15", "--dirty=.m"],
    fallback = "<none>",
);

#[derive(Debug, PartialEq)]
struct Flags {
    config: PathBuf,
    debug: bool,
    version: bool,
}

fn parse(args: &[OsString]) -> anyhow::Result<Flags> {
    let mut flags = Flags {
        config: PathBuf::from(DEFAULT_CONFIG),
        debug: false,
        version: false,
    };

    let mut args = args.iter();
    while let Some(arg) = args.next() {
        match arg.to_str() {
            Some("--config") | Some("-c") => match args.next() {
                Some(path) => flags.config = PathBuf::from(path),
                None => bail!("--config requires a path"),
            },
            Some("--debug") => flags.debug = true,
            Some("--version") | Some("-v") => flags.version = true,
            _ => bail!("unexpected argument {arg:?}"),
        }
    }
    Ok(flags)
}

fn collaborators(settings: &Settings) -> anyhow::Result<Collaborators> {
    let mut runtime =
        RunC::new(&settings.runtime_path, &settings.runtime_root).with_memcr(settings.memcr());
    if let Some(init) = &settings.exec_init {
        runtime = runtime.with_exec_init(init);
    }

    let rdk = RdkPluginRegistry::from_dir(&settings.plugin_dir)
        .with_context(|| format!("loading plugins from {:?}", settings.plugin_dir))?;
    log::info!("rdk plugins: {:?}", rdk.names());

    let legacy = match &settings.legacy_plugin_dir {
        Some(dir) => LegacyHookRunner::from_dir(dir)
            .with_context(|| format!("loading legacy plugins from {dir:?}"))?,
        None => LegacyHookRunner::new(),
    };

    let logger = FileLogger::new(settings.workspace_dir.join("logs"))?;

    Ok(Collaborators {
        runtime: Arc::new(runtime),
        legacy,
        rdk,
        logger: Arc::new(logger),
        watcher: Arc::new(PidFdWatcher),
    })
}

fn callbacks() -> Callbacks {
    Callbacks::default()
        .on_started(|cd, id| log::info!("container {id} started (descriptor {cd})"))
        .on_stopped(|cd, id, status| {
            log::info!("container {id} stopped (descriptor {cd}, status {status})")
        })
        .on_hibernated(|cd, id| log::info!("container {id} hibernated (descriptor {cd})"))
        .on_awoken(|cd, id| log::info!("container {id} awoken (descriptor {cd})"))
}

fn run(flags: Flags) -> anyhow::Result<()> {
    let settings = Settings::load(&flags.config)?;
    logger::init(
        flags.debug,
        settings.default_log_level.as_deref().unwrap_or("info"),
        settings.log_file.as_deref(),
    )?;
    log::info!("wardend {VERSION} ({REVISION}) starting with {:?}", flags.config);

    // container init processes are reparented to us once the runtime exits
    nix::sys::prctl::set_child_subreaper(true).context("becoming child subreaper")?;

    let orchestrator = Orchestrator::new(settings.clone(), collaborators(&settings)?, callbacks())?;

    let (tx, rx) = std::sync::mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;
    let _ = rx.recv();

    log::info!("shutting down");
    orchestrator.shutdown();
    Ok(())
}

fn main() {
    let os_args: Vec<_> = std::env::args_os().collect();
    let flags = match parse(&os_args[1..]) {
        Ok(flags) => flags,
        Err(err) => {
            eprintln!("wardend: {err}");
            eprintln!("usage: wardend [--config <path>] [--debug] [--version]");
            std::process::exit(2);
        }
    };

    if flags.version {
        println!("wardend:");
        println!("  Version: {VERSION}");
        println!("  Revision: {REVISION}");
        return;
    }

    if let Err(err) = run(flags) {
        log::error!("{err:#}");
        eprintln!("wardend: {err:#}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(args: &[&str]) -> Vec<OsString> {
        args.iter().map(OsString::from).collect()
    }

    #[test]
    fn test_parse_defaults() -> anyhow::Result<()> {
        let flags = parse(&[])?;
        assert_eq!(
            flags,
            Flags {
                config: PathBuf::from(DEFAULT_CONFIG),
                debug: false,
                version: false,
            }
        );
        Ok(())
    }

    #[test]
    fn test_parse_flags() -> anyhow::Result<()> {
        let flags = parse(&args(&["--debug", "--config", "/tmp/w.toml", "-v"]))?;
        assert!(flags.debug);
        assert!(flags.version);
        assert_eq!(flags.config, PathBuf::from("/tmp/w.toml"));
        Ok(())
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse(&args(&["--config"])).is_err());
        assert!(parse(&args(&["--bogus"])).is_err());
    }

    #[test]
    fn test_collaborators_from_settings() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let settings = Settings {
            workspace_dir: dir.path().join("workspace"),
            plugin_dir: dir.path().join("plugins"),
            ..Default::default()
        };
        let collaborators = collaborators(&settings)?;
        assert!(collaborators.rdk.names().is_empty());
        assert!(collaborators.legacy.plugin_names().is_empty());
        assert!(dir.path().join("workspace/logs").is_dir());
        Ok(())
    }
}
