//! Plugins implemented as standalone executables.
//!
//! Each plugin is described by a JSON manifest:
//!
//! ```json
//! {
//!     "name": "networking",
//!     "path": "/usr/libexec/dobby/networking",
//!     "hints": ["preCreation", "postHalt"],
//!     "dependencies": ["storage"]
//! }
//! ```
//!
//! A hook runs the executable with the hook name as its only argument and
//! the [`PluginContext`] as JSON on stdin. Exit code 0 means success. The
//! executable runs in its own process group; when a hook has a deadline the
//! whole group is killed once it passes.
//!
//! Legacy plugins use the same manifest with legacy hook names
//! (`postConstruction`, `preStart`, `postStart`, `postStop`,
//! `preDestruction`), each optionally suffixed with `Async`.

use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::legacy::{LegacyHints, LegacyPlugin};
use super::rdk::{DynamicMount, PluginContext, RdkPlugin};
use super::HintFlags;
use crate::config::StartState;
use crate::{ContainerId, Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecPluginManifest {
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub hints: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// The plugin receives container console output.
    #[serde(default)]
    pub logging: bool,
    /// The plugin handles `addMount`, `removeMount` and `annotate`.
    #[serde(default)]
    pub mounts: bool,
}

#[derive(Debug, Clone)]
pub struct ExecRdkPlugin {
    manifest: ExecPluginManifest,
    hints: HintFlags,
}

impl ExecRdkPlugin {
    pub fn new(mut manifest: ExecPluginManifest, base: &Path) -> Result<Self> {
        let mut hints = HintFlags::empty();
        for name in &manifest.hints {
            let hint = HintFlags::from_name(name).ok_or_else(|| {
                Error::InvalidArgument(format!("plugin {}: unknown hint {name:?}", manifest.name))
            })?;
            hints = hints | hint;
        }
        if manifest.path.is_relative() {
            manifest.path = base.join(&manifest.path);
        }
        Ok(Self { manifest, hints })
    }

    /// Reads a manifest; a relative `path` is taken relative to the manifest.
    pub fn from_manifest(path: impl AsRef<Path>) -> Result<Self> {
        let (manifest, base) = read_manifest(path.as_ref())?;
        Self::new(manifest, base)
    }

    pub fn manifest(&self) -> &ExecPluginManifest {
        &self.manifest
    }

    fn invoke(&self, arg: &str, payload: &Value, deadline: Option<Instant>) -> Result<()> {
        run_executable(&self.manifest.name, &self.manifest.path, arg, payload, deadline)
    }
}

fn read_manifest(path: &Path) -> Result<(ExecPluginManifest, &Path)> {
    let manifest: ExecPluginManifest = serde_json::from_str(&fs::read_to_string(path)?)
        .map_err(|err| Error::InvalidArgument(format!("invalid manifest {path:?}: {err}")))?;
    Ok((manifest, path.parent().unwrap_or(Path::new("/"))))
}

#[derive(Debug, Clone)]
pub struct ExecLegacyPlugin {
    manifest: ExecPluginManifest,
    hints: LegacyHints,
}

impl ExecLegacyPlugin {
    pub fn new(mut manifest: ExecPluginManifest, base: &Path) -> Result<Self> {
        let mut hints = LegacyHints::default();
        for name in &manifest.hints {
            let hint = LegacyHints::from_name(name).ok_or_else(|| {
                Error::InvalidArgument(format!("plugin {}: unknown hint {name:?}", manifest.name))
            })?;
            hints = hints.union(hint);
        }
        if manifest.path.is_relative() {
            manifest.path = base.join(&manifest.path);
        }
        Ok(Self { manifest, hints })
    }

    pub fn from_manifest(path: impl AsRef<Path>) -> Result<Self> {
        let (manifest, base) = read_manifest(path.as_ref())?;
        Self::new(manifest, base)
    }

    fn invoke(
        &self,
        arg: &str,
        id: &ContainerId,
        pid: Option<i32>,
        rootfs: &Path,
        data: &Value,
    ) -> Result<()> {
        let payload = serde_json::json!({
            "id": id,
            "pid": pid,
            "rootfs": rootfs,
            "data": data,
        });
        run_executable(&self.manifest.name, &self.manifest.path, arg, &payload, None)
    }
}

impl LegacyPlugin for ExecLegacyPlugin {
    fn name(&self) -> &str {
        &self.manifest.name
    }

    fn hook_hints(&self) -> LegacyHints {
        self.hints
    }

    fn post_construction(
        &self,
        id: &ContainerId,
        _start_state: &StartState,
        rootfs: &Path,
        data: &Value,
    ) -> Result<()> {
        self.invoke("postConstruction", id, None, rootfs, data)
    }

    fn pre_start(&self, id: &ContainerId, pid: i32, rootfs: &Path, data: &Value) -> Result<()> {
        self.invoke("preStart", id, Some(pid), rootfs, data)
    }

    fn post_start(&self, id: &ContainerId, pid: i32, rootfs: &Path, data: &Value) -> Result<()> {
        self.invoke("postStart", id, Some(pid), rootfs, data)
    }

    fn post_stop(&self, id: &ContainerId, rootfs: &Path, data: &Value) -> Result<()> {
        self.invoke("postStop", id, None, rootfs, data)
    }

    fn pre_destruction(&self, id: &ContainerId, rootfs: &Path, data: &Value) -> Result<()> {
        self.invoke("preDestruction", id, None, rootfs, data)
    }
}

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Runs a plugin executable for one hook and waits for it, at most until
/// `deadline`.
fn run_executable(
    name: &str,
    path: &Path,
    arg: &str,
    payload: &Value,
    deadline: Option<Instant>,
) -> Result<()> {
    log::debug!("running plugin {name} {arg}");

    let mut child = Command::new(path)
        .arg(arg)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .process_group(0)
        .spawn()
        .map_err(|err| Error::Plugin {
            name: name.to_string(),
            reason: format!("failed to execute {path:?}: {err}"),
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        // BrokenPipe only means the plugin exited without reading its
        // input; its exit status decides the outcome.
        if let Err(err) = stdin.write_all(payload.to_string().as_bytes()) {
            if err.kind() != ErrorKind::BrokenPipe {
                kill_group(&child);
            }
        }
    }

    // a process left behind in the group may hold stderr open, so the
    // reader is not waited for after a timeout
    let stderr = child.stderr.take().map(|mut stderr| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf);
            buf
        })
    });

    let Some(status) = wait_until(&mut child, deadline)? else {
        return Err(Error::Plugin {
            name: name.to_string(),
            reason: format!("{arg} timed out and was killed"),
        });
    };
    if !status.success() {
        let stderr = stderr
            .and_then(|reader| reader.join().ok())
            .unwrap_or_default();
        return Err(Error::Plugin {
            name: name.to_string(),
            reason: format!(
                "{arg} exited with {status}: {}",
                String::from_utf8_lossy(&stderr).trim()
            ),
        });
    }
    Ok(())
}

/// Waits for the child to exit. Past the deadline its process group is
/// killed and the child reaped, and `None` returned.
fn wait_until(child: &mut Child, deadline: Option<Instant>) -> Result<Option<ExitStatus>> {
    let Some(deadline) = deadline else {
        return Ok(Some(child.wait()?));
    };
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            kill_group(child);
            child.wait()?;
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL.min(left));
    }
}

fn kill_group(child: &Child) {
    let group = Pid::from_raw(child.id() as i32);
    if let Err(err) = signal::killpg(group, Signal::SIGKILL) {
        log::warn!("failed to kill process group {group}: {err}");
    }
}

impl RdkPlugin for ExecRdkPlugin {
    fn name(&self) -> &str {
        &self.manifest.name
    }

    fn hook_hints(&self) -> HintFlags {
        self.hints
    }

    fn dependencies(&self) -> Vec<String> {
        self.manifest.dependencies.clone()
    }

    fn run(&self, hook: HintFlags, ctx: &PluginContext, deadline: Option<Instant>) -> Result<()> {
        let arg = hook.name().ok_or_else(|| {
            Error::InvalidArgument(format!("{hook:?} is not a single hook point"))
        })?;
        self.invoke(arg, &serde_json::to_value(ctx)?, deadline)
    }

    fn is_logging(&self) -> bool {
        self.manifest.logging
    }

    fn add_mount(&self, ctx: &PluginContext, mount: &DynamicMount) -> Option<Result<()>> {
        if !self.manifest.mounts {
            return None;
        }
        let payload = serde_json::json!({ "container": ctx, "mount": mount });
        Some(self.invoke("addMount", &payload, None))
    }

    fn remove_mount(&self, ctx: &PluginContext, source: &Path) -> Option<Result<()>> {
        if !self.manifest.mounts {
            return None;
        }
        let payload = serde_json::json!({ "container": ctx, "source": source });
        Some(self.invoke("removeMount", &payload, None))
    }

    fn annotate(&self, ctx: &PluginContext, key: &str, value: Option<&str>) -> Option<Result<()>> {
        if !self.manifest.mounts {
            return None;
        }
        let payload = serde_json::json!({ "container": ctx, "key": key, "value": value });
        Some(self.invoke("annotate", &payload, None))
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use tempfile::tempdir;

    use super::*;
    use crate::ContainerId;
    use crate::plugins::RdkPluginRegistry;

    // records its argument and input next to itself, fails postHalt
    const PLUGIN: &str = r#"#!/bin/sh
dir=$(dirname "$0")
echo "$1" >> "$dir/calls"
cat > "$dir/input"
[ "$1" != "postHalt" ]
"#;

    // records its pid and outlives any reasonable deadline
    const STUCK_PLUGIN: &str = r#"#!/bin/sh
echo $$ > "$(dirname "$0")/pid"
exec sleep 30
"#;

    fn install(dir: &Path, manifest: Value) -> Result<PathBuf> {
        install_script(dir, PLUGIN, manifest)
    }

    fn install_script(dir: &Path, script: &str, manifest: Value) -> Result<PathBuf> {
        let bin = dir.join("plugin.sh");
        fs::write(&bin, script)?;
        fs::set_permissions(&bin, fs::Permissions::from_mode(0o755))?;
        let path = dir.join("plugin.json");
        fs::write(&path, manifest.to_string())?;
        Ok(path)
    }

    fn context() -> PluginContext {
        PluginContext {
            id: ContainerId::create("app"),
            bundle: "/bundle".into(),
            rootfs: "/bundle/rootfs".into(),
            pid: 42,
            exit_status: None,
            data: serde_json::json!({ "verbose": true }),
        }
    }

    #[test]
    fn test_hook_gets_name_and_context() -> Result<()> {
        let dir = tempdir()?;
        let manifest = install(
            dir.path(),
            serde_json::json!({
                "name": "networking",
                "path": "plugin.sh",
                "hints": ["preCreation", "postHalt"],
                "dependencies": ["storage"]
            }),
        )?;
        let plugin = ExecRdkPlugin::from_manifest(&manifest)?;
        assert_eq!(plugin.hook_hints(), HintFlags::PRE_CREATION | HintFlags::POST_HALT);
        assert_eq!(plugin.dependencies(), vec!["storage"]);

        plugin.run(HintFlags::PRE_CREATION, &context(), None)?;
        let input: Value = serde_json::from_str(&fs::read_to_string(dir.path().join("input"))?)?;
        assert_eq!(input["id"], "app");
        assert_eq!(input["pid"], 42);
        assert_eq!(input["data"]["verbose"], true);

        let err = plugin.run(HintFlags::POST_HALT, &context(), None).unwrap_err();
        assert!(err.to_string().contains("postHalt exited"));
        assert_eq!(
            fs::read_to_string(dir.path().join("calls"))?,
            "preCreation\npostHalt\n"
        );
        Ok(())
    }

    #[test]
    fn test_mounts_only_when_declared() -> Result<()> {
        let dir = tempdir()?;
        let manifest = install(
            dir.path(),
            serde_json::json!({ "name": "storage", "path": "plugin.sh", "mounts": true }),
        )?;
        let plugin = ExecRdkPlugin::from_manifest(&manifest)?;
        let mount = DynamicMount {
            source: "/media/usb".into(),
            destination: "/mnt".into(),
            options: vec![],
            data: String::new(),
        };
        assert!(matches!(plugin.add_mount(&context(), &mount), Some(Ok(()))));
        let input: Value = serde_json::from_str(&fs::read_to_string(dir.path().join("input"))?)?;
        assert_eq!(input["mount"]["source"], "/media/usb");

        let plain = ExecRdkPlugin::new(
            ExecPluginManifest {
                name: "plain".into(),
                path: "/bin/true".into(),
                hints: vec![],
                dependencies: vec![],
                logging: false,
                mounts: false,
            },
            dir.path(),
        )?;
        assert!(plain.add_mount(&context(), &mount).is_none());
        assert!(plain.annotate(&context(), "k", None).is_none());
        Ok(())
    }

    #[test]
    fn test_registry_from_dir() -> Result<()> {
        let dir = tempdir()?;
        install(
            dir.path(),
            serde_json::json!({ "name": "networking", "path": "plugin.sh", "hints": ["postStart"] }),
        )?;
        fs::write(dir.path().join("broken.json"), "{")?;
        fs::write(
            dir.path().join("badhint.json"),
            r#"{ "name": "x", "path": "plugin.sh", "hints": ["never"] }"#,
        )?;

        let registry = RdkPluginRegistry::from_dir(dir.path())?;
        assert_eq!(registry.names(), vec!["networking"]);

        let empty = RdkPluginRegistry::from_dir(dir.path().join("missing"))?;
        assert!(empty.names().is_empty());
        Ok(())
    }

    #[test]
    fn test_deadline_kills_the_plugin() -> Result<()> {
        let dir = tempdir()?;
        let manifest = install_script(
            dir.path(),
            STUCK_PLUGIN,
            serde_json::json!({ "name": "stuck", "path": "plugin.sh", "hints": ["postHalt"] }),
        )?;
        let plugin = ExecRdkPlugin::from_manifest(&manifest)?;

        let started = Instant::now();
        let deadline = started + Duration::from_millis(500);
        let err = plugin
            .run(HintFlags::POST_HALT, &context(), Some(deadline))
            .unwrap_err();
        assert!(err.to_string().contains("timed out"), "{err}");
        assert!(started.elapsed() < Duration::from_secs(5));

        let pid = fs::read_to_string(dir.path().join("pid"))?;
        let pid = pid.trim();
        assert!(!pid.is_empty());
        // killed and reaped
        assert!(!Path::new("/proc").join(pid).exists());
        Ok(())
    }

    #[test]
    fn test_missing_executable() -> Result<()> {
        let dir = tempdir()?;
        let plugin = ExecRdkPlugin::new(
            ExecPluginManifest {
                name: "ghost".into(),
                path: "does-not-exist".into(),
                hints: vec!["postStart".into()],
                dependencies: vec![],
                logging: false,
                mounts: false,
            },
            dir.path(),
        )?;
        assert!(plugin.run(HintFlags::POST_START, &context(), None).is_err());
        Ok(())
    }

    #[test]
    fn test_legacy_exec_plugin() -> Result<()> {
        let dir = tempdir()?;
        let manifest = install(
            dir.path(),
            serde_json::json!({
                "name": "jumper",
                "path": "plugin.sh",
                "hints": ["preStart", "postStopAsync"]
            }),
        )?;
        let plugin = ExecLegacyPlugin::from_manifest(&manifest)?;
        assert_eq!(
            plugin.hook_hints(),
            LegacyHints::PRE_START_SYNC.union(LegacyHints::POST_STOP_ASYNC)
        );

        let id = ContainerId::create("app");
        plugin.pre_start(&id, 42, Path::new("/rootfs"), &serde_json::json!({ "port": 1 }))?;
        let input: Value = serde_json::from_str(&fs::read_to_string(dir.path().join("input"))?)?;
        assert_eq!(input["pid"], 42);
        assert_eq!(input["data"]["port"], 1);

        let bad = ExecPluginManifest {
            name: "bad".into(),
            path: "plugin.sh".into(),
            hints: vec!["preCreation".into()],
            dependencies: vec![],
            logging: false,
            mounts: false,
        };
        assert!(ExecLegacyPlugin::new(bad, dir.path()).is_err());
        Ok(())
    }
}
