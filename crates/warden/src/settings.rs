use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::hibernate::Memcr;
use crate::{Error, Result};

/// Daemon settings, read from a toml file. Every field has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Scratch space for generated bundles and container logs.
    pub workspace_dir: PathBuf,
    /// State directory of the runtime tool (`--root`).
    pub runtime_root: PathBuf,
    pub runtime_path: PathBuf,
    /// Init binary wrapping commands run with `exec`, if any.
    pub exec_init: Option<PathBuf>,
    /// Where RDK plugin manifests are looked up.
    pub plugin_dir: PathBuf,
    pub legacy_plugin_dir: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub default_log_level: Option<String>,
    pub cleanup_delay_ms: u64,
    pub post_halt_timeout_ms: u64,
    pub hibernate_locator: String,
    pub hibernate_timeout_ms: u64,
    pub display_socket_mount: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            workspace_dir: PathBuf::from("/tmp/dobby"),
            runtime_root: PathBuf::from("/run/rdk/crun"),
            runtime_path: PathBuf::from("crun"),
            exec_init: None,
            plugin_dir: PathBuf::from("/usr/lib/plugins/dobby"),
            legacy_plugin_dir: None,
            log_file: None,
            default_log_level: None,
            cleanup_delay_ms: 0,
            post_halt_timeout_ms: 4000,
            hibernate_locator: crate::hibernate::DEFAULT_LOCATOR.to_string(),
            hibernate_timeout_ms: crate::hibernate::DEFAULT_TIMEOUT.as_millis() as u64,
            display_socket_mount: PathBuf::from("/tmp/westeros"),
        }
    }
}

impl Settings {
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|err| Error::InvalidArgument(format!("invalid settings: {err}")))
    }

    /// Loads settings from `path`; a missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(text) => Self::from_toml(&text),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                log::info!("no settings at {path:?}, using defaults");
                Ok(Self::default())
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn cleanup_delay(&self) -> Duration {
        Duration::from_millis(self.cleanup_delay_ms)
    }

    pub fn post_halt_timeout(&self) -> Duration {
        Duration::from_millis(self.post_halt_timeout_ms)
    }

    pub fn memcr(&self) -> Memcr {
        Memcr::new(
            self.hibernate_locator.clone(),
            Duration::from_millis(self.hibernate_timeout_ms),
        )
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() -> Result<()> {
        let settings = Settings::from_toml(
            r#"
            workspace_dir = "/var/lib/warden"
            post_halt_timeout_ms = 100
            "#,
        )?;
        assert_eq!(settings.workspace_dir, PathBuf::from("/var/lib/warden"));
        assert_eq!(settings.post_halt_timeout(), Duration::from_millis(100));
        assert_eq!(settings.runtime_path, PathBuf::from("crun"));
        assert_eq!(settings.hibernate_timeout_ms, 20000);
        assert_eq!(settings.cleanup_delay(), Duration::ZERO);
        assert_eq!(settings.exec_init, None);
        Ok(())
    }

    #[test]
    fn test_invalid_settings() {
        let err = Settings::from_toml("workspace_dir = 3").unwrap_err();
        assert!(err.to_string().starts_with("invalid argument: invalid settings:"));
        assert!(Settings::from_toml("no_such_knob = true").is_err());
    }

    #[test]
    fn test_missing_file_is_default() -> Result<()> {
        let dir = tempdir()?;
        assert_eq!(Settings::load(dir.path().join("none.toml"))?, Settings::default());

        let path = dir.path().join("warden.toml");
        fs::write(&path, "cleanup_delay_ms = 250\n")?;
        assert_eq!(Settings::load(&path)?.cleanup_delay_ms, 250);
        Ok(())
    }
}
