//! On-disk artifacts of a container: the bundle directory, its rootfs, the
//! OCI config (with the daemon's plugin extensions) and the start state that
//! carries file descriptors and environment into the container.

use std::collections::BTreeMap;
use std::fs;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use oci_spec::runtime::{Mount, MountBuilder, ProcessBuilder, RootBuilder, Spec, UserBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{ContainerId, Error, Result};

pub(crate) const CONFIG_FILE: &str = "config.json";
pub(crate) const POST_INSTALL_MARKER: &str = "postinstallhooksuccess";

/// The bundle directory handed to the runtime.
///
/// Bundles generated from a legacy spec are owned by the daemon and removed
/// when the last handle is dropped.
#[derive(Debug)]
pub struct Bundle {
    path: PathBuf,
    persist: bool,
}

impl Bundle {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let path = path
            .canonicalize()
            .map_err(|err| Error::InvalidArgument(format!("bundle {path:?}: {err}")))?;
        Ok(Self {
            path,
            persist: true,
        })
    }

    pub fn create(workspace: impl AsRef<Path>, id: &ContainerId) -> Result<Self> {
        let path = workspace.as_ref().join(format!("bundle-{id}"));
        if path.exists() {
            return Err(Error::AlreadyExists(format!("bundle {path:?}")));
        }
        fs::create_dir_all(&path)?;
        Ok(Self {
            path,
            persist: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config_path(&self) -> PathBuf {
        self.path.join(CONFIG_FILE)
    }

    pub fn is_valid(&self) -> bool {
        self.path.is_dir()
    }
}

impl Drop for Bundle {
    fn drop(&mut self) {
        if !self.persist {
            if let Err(err) = fs::remove_dir_all(&self.path) {
                log::warn!("failed to remove bundle {:?}: {err}", self.path);
            }
        }
    }
}

/// Removes bundles generated for legacy specs that a previous daemon left
/// behind, so their ids can be started again.
pub(crate) fn remove_generated_bundles(workspace: impl AsRef<Path>) -> Result<()> {
    for entry in fs::read_dir(workspace)? {
        let entry = entry?;
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with("bundle-") || !entry.file_type()?.is_dir() {
            continue;
        }
        log::warn!("removing stale bundle {:?}", entry.path());
        fs::remove_dir_all(entry.path())?;
    }
    Ok(())
}

#[derive(Debug)]
pub struct Rootfs {
    path: PathBuf,
}

impl Rootfs {
    pub fn new(bundle: &Bundle, config: &ContainerConfig) -> Result<Self> {
        let root = config
            .spec()
            .root()
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("rootfs is not set in runtime spec".into()))?;
        let path = bundle.path().join(root.path());
        if !config.is_bundle() {
            fs::create_dir_all(&path)?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_valid(&self) -> bool {
        self.path.is_dir()
    }
}

/// Per-plugin entry of the `rdkPlugins` config extension.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RdkPluginConfig {
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq)]
enum Source {
    Bundle,
    Spec(String),
}

/// Subset of the legacy JSON spec format accepted by `start_container_from_spec`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacySpec {
    version: String,
    args: Vec<String>,
    #[serde(default)]
    cwd: Option<PathBuf>,
    #[serde(default)]
    env: Vec<String>,
    #[serde(default)]
    user: Option<LegacyUser>,
    #[serde(default)]
    restart_on_crash: bool,
    #[serde(default)]
    mounts: Vec<LegacyMount>,
    #[serde(default)]
    plugins: Vec<LegacyPluginEntry>,
    #[serde(default)]
    rdk_plugins: BTreeMap<String, RdkPluginConfig>,
}

#[derive(Debug, Deserialize)]
struct LegacyUser {
    uid: u32,
    gid: u32,
}

#[derive(Debug, Deserialize)]
struct LegacyMount {
    source: String,
    destination: String,
    #[serde(rename = "type", default = "default_mount_type")]
    typ: String,
    #[serde(default)]
    options: Vec<String>,
}

fn default_mount_type() -> String {
    "bind".to_string()
}

#[derive(Debug, Deserialize)]
struct LegacyPluginEntry {
    name: String,
    #[serde(default)]
    data: Value,
}

/// The OCI config of a container together with the daemon's extension fields
/// (`rdkPlugins`, `legacyPlugins`, `restartOnCrash`).
///
/// The JSON document it was read from is kept as is; rendering only patches
/// the fields the daemon changes, so anything the typed [`Spec`] does not
/// model survives.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    spec: Spec,
    document: Map<String, Value>,
    rdk_plugins: BTreeMap<String, RdkPluginConfig>,
    legacy_plugins: BTreeMap<String, Value>,
    restart_on_crash: bool,
    source: Source,
}

impl ContainerConfig {
    pub fn from_bundle(bundle: &Bundle) -> Result<Self> {
        let text = fs::read_to_string(bundle.config_path())?;
        let raw: Value = serde_json::from_str(&text)?;
        let spec: Spec = serde_json::from_value(raw.clone())?;
        let Value::Object(document) = raw else {
            return Err(Error::InvalidArgument("config is not a JSON object".into()));
        };

        let rdk_plugins = match document.get("rdkPlugins") {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|err| Error::InvalidArgument(format!("invalid rdkPlugins: {err}")))?,
            None => BTreeMap::new(),
        };

        let mut legacy_plugins = BTreeMap::new();
        if let Some(value) = document.get("legacyPlugins") {
            let Value::Object(plugins) = value else {
                return Err(Error::InvalidArgument("invalid legacyPlugins field".into()));
            };
            for (name, plugin) in plugins {
                let Value::Object(plugin) = plugin else {
                    return Err(Error::InvalidArgument(format!(
                        "invalid legacyPlugins entry {name}"
                    )));
                };
                let data = plugin.get("data").cloned().unwrap_or(Value::Null);
                legacy_plugins.insert(name.clone(), data);
            }
        }

        let restart_on_crash = document
            .get("restartOnCrash")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        Ok(Self {
            spec,
            document,
            rdk_plugins,
            legacy_plugins,
            restart_on_crash,
            source: Source::Bundle,
        })
    }

    pub fn from_legacy_spec(json: &str) -> Result<Self> {
        let legacy: LegacySpec = serde_json::from_str(json)
            .map_err(|err| Error::InvalidArgument(format!("invalid spec: {err}")))?;

        if !matches!(legacy.version.as_str(), "1.0" | "1.1") {
            return Err(Error::InvalidArgument(format!(
                "unsupported spec version {}",
                legacy.version
            )));
        }
        if legacy.args.is_empty() {
            return Err(Error::InvalidArgument("spec has no args".into()));
        }

        let mut spec = Spec::default();

        let mut process = ProcessBuilder::default()
            .args(legacy.args)
            .cwd(legacy.cwd.unwrap_or_else(|| PathBuf::from("/")));
        if !legacy.env.is_empty() {
            process = process.env(legacy.env);
        }
        if let Some(user) = legacy.user {
            process = process.user(UserBuilder::default().uid(user.uid).gid(user.gid).build()?);
        }
        spec.set_process(Some(process.build()?));
        spec.set_root(Some(RootBuilder::default().path("rootfs").readonly(false).build()?));

        let mut mounts = spec.mounts().clone().unwrap_or_default();
        for mount in legacy.mounts {
            mounts.push(
                MountBuilder::default()
                    .source(mount.source)
                    .destination(mount.destination)
                    .typ(mount.typ)
                    .options(mount.options)
                    .build()?,
            );
        }
        spec.set_mounts(Some(mounts));

        let legacy_plugins: BTreeMap<String, Value> = legacy
            .plugins
            .into_iter()
            .map(|plugin| (plugin.name, plugin.data))
            .collect();

        let Value::Object(mut document) = serde_json::to_value(&spec)? else {
            return Err(Error::Others("spec did not render to an object".into()));
        };
        if !legacy.rdk_plugins.is_empty() {
            document.insert("rdkPlugins".into(), serde_json::to_value(&legacy.rdk_plugins)?);
        }

        Ok(Self {
            spec,
            document,
            rdk_plugins: legacy.rdk_plugins,
            legacy_plugins,
            restart_on_crash: legacy.restart_on_crash,
            source: Source::Spec(json.to_string()),
        })
    }

    pub fn is_valid(&self) -> bool {
        let has_args = self
            .spec
            .process()
            .as_ref()
            .and_then(|p| p.args().as_ref())
            .is_some_and(|args| !args.is_empty());
        has_args && self.spec.root().is_some()
    }

    pub fn is_bundle(&self) -> bool {
        self.source == Source::Bundle
    }

    pub fn spec(&self) -> &Spec {
        &self.spec
    }

    /// The legacy JSON spec the container was built from, if any.
    pub fn legacy_spec(&self) -> Option<&str> {
        match &self.source {
            Source::Spec(json) => Some(json),
            Source::Bundle => None,
        }
    }

    pub fn rdk_plugins(&self) -> &BTreeMap<String, RdkPluginConfig> {
        &self.rdk_plugins
    }

    pub fn legacy_plugins(&self) -> &BTreeMap<String, Value> {
        &self.legacy_plugins
    }

    pub fn restart_on_crash(&self) -> bool {
        self.restart_on_crash
    }

    fn env(&self) -> Vec<String> {
        self.spec
            .process()
            .as_ref()
            .and_then(|p| p.env().clone())
            .unwrap_or_default()
    }

    /// Sets environment variables, replacing earlier values of the same
    /// name, so a config that already carries them stays unchanged.
    pub fn add_env(&mut self, vars: &[String]) {
        if vars.is_empty() {
            return;
        }
        let mut process = self.spec.process().clone().unwrap_or_default();
        let mut env = process.env().clone().unwrap_or_default();
        merge_env(&mut env, vars);
        process.set_env(Some(env));
        self.spec.set_process(Some(process));
    }

    /// Renders the config as the JSON document written into the bundle.
    pub fn to_json(&self) -> Result<String> {
        self.patch(None, self.env(), vec![])
    }

    pub fn write_config_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        fs::write(path, self.to_json()?)
            .map_err(|err| Error::Others(format!("failed to write {path:?}: {err}")))
    }

    /// Produces the per-descriptor config used when the caller overrides the
    /// command, the display socket or the environment.
    pub fn customise(
        &self,
        command: &str,
        display_socket: &str,
        display_mount: &Path,
        env_vars: &[String],
    ) -> Result<String> {
        let mut env = self.env();
        let args: Vec<String> = command.split_whitespace().map(str::to_string).collect();

        let mut mounts = vec![];
        if !display_socket.is_empty() {
            let socket = Path::new(display_socket);
            let name = socket
                .file_name()
                .ok_or_else(|| Error::InvalidArgument(format!("bad display socket {socket:?}")))?;
            mounts.push(
                MountBuilder::default()
                    .source(socket)
                    .destination(display_mount.join(name))
                    .typ("bind")
                    .options(vec!["bind".to_string(), "nosuid".to_string(), "nodev".to_string()])
                    .build()?,
            );
            merge_env(
                &mut env,
                &[
                    format!("XDG_RUNTIME_DIR={}", display_mount.display()),
                    format!("WAYLAND_DISPLAY={}", name.to_string_lossy()),
                ],
            );
        }

        merge_env(&mut env, env_vars);
        self.patch((!args.is_empty()).then_some(args), env, mounts)
    }

    fn patch(&self, args: Option<Vec<String>>, env: Vec<String>, mounts: Vec<Mount>) -> Result<String> {
        let mut doc = self.document.clone();

        let process = doc
            .entry("process")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(process) = process {
            if let Some(args) = args {
                process.insert("args".into(), serde_json::to_value(args)?);
            }
            if !env.is_empty() {
                process.insert("env".into(), serde_json::to_value(env)?);
            }
        }

        if !mounts.is_empty() {
            let list = doc
                .entry("mounts")
                .or_insert_with(|| Value::Array(vec![]));
            if let Value::Array(list) = list {
                for mount in mounts {
                    list.push(serde_json::to_value(mount)?);
                }
            }
        }

        Ok(serde_json::to_string_pretty(&Value::Object(doc))?)
    }
}

fn env_name(var: &str) -> &str {
    var.split_once('=').map_or(var, |(name, _)| name)
}

fn merge_env(env: &mut Vec<String>, vars: &[String]) {
    for var in vars {
        match env.iter_mut().find(|e| env_name(e) == env_name(var)) {
            Some(existing) => existing.clone_from(var),
            None => env.push(var.clone()),
        }
    }
}

#[derive(Default)]
struct StartStateInner {
    files: Vec<(String, OwnedFd)>,
    env: Vec<String>,
}

/// File descriptors and environment variables injected into a container at
/// start. Legacy plugins may add to it during post-construction.
#[derive(Default)]
pub struct StartState {
    inner: Mutex<StartStateInner>,
}

impl StartState {
    pub fn new(files: Vec<OwnedFd>) -> Result<Self> {
        let state = Self::default();
        for fd in files {
            state.push("Generic", fd)?;
        }
        Ok(state)
    }

    /// Adds a descriptor on behalf of a plugin and returns the fd number it
    /// will have inside the container.
    pub fn add_file_descriptor(&self, plugin: &str, fd: &OwnedFd) -> Result<i32> {
        let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFD) };
        if flags < 0 || flags & libc::FD_CLOEXEC == 0 {
            return Err(Error::InvalidArgument(format!(
                "fd from {plugin} is invalid or doesn't have FD_CLOEXEC set"
            )));
        }
        self.push(plugin, dup_cloexec(fd)?)
    }

    pub fn add_environment_variable(&self, var: impl Into<String>) {
        self.inner.lock().unwrap().env.push(var.into());
    }

    pub fn env(&self) -> Vec<String> {
        self.inner.lock().unwrap().env.clone()
    }

    /// Duplicates of every descriptor, in container fd order.
    pub fn files(&self) -> Result<Vec<OwnedFd>> {
        let inner = self.inner.lock().unwrap();
        inner.files.iter().map(|(_, fd)| dup_cloexec(fd)).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, plugin: &str, fd: OwnedFd) -> Result<i32> {
        let mut inner = self.inner.lock().unwrap();
        let container_fd = 3 + inner.files.len() as i32;
        inner.files.push((plugin.to_string(), fd));
        Ok(container_fd)
    }
}

pub(crate) fn dup_cloexec(fd: &OwnedFd) -> Result<OwnedFd> {
    dup_cloexec_above(fd, 3)
}

pub(crate) fn dup_cloexec_above(fd: &OwnedFd, min: i32) -> Result<OwnedFd> {
    let dupped = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, min) };
    if dupped < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(dupped) })
}

#[cfg(test)]
mod tests {
    use std::fs::File;

    use tempfile::tempdir;

    use super::*;

    fn write_bundle(dir: &Path, extra: Value) -> Result<()> {
        fs::create_dir(dir.join("rootfs"))?;
        let mut doc = serde_json::to_value(Spec::default())?;
        if let (Value::Object(doc), Value::Object(extra)) = (&mut doc, extra) {
            doc.extend(extra);
        }
        fs::write(dir.join(CONFIG_FILE), serde_json::to_string(&doc)?)?;
        Ok(())
    }

    #[test]
    fn test_bundle_config_extensions() -> Result<()> {
        let dir = tempdir()?;
        write_bundle(
            dir.path(),
            serde_json::json!({
                "restartOnCrash": true,
                "rdkPlugins": {
                    "logging": { "required": true, "data": { "sink": "file" } },
                    "storage": { "dependsOn": ["logging"] }
                },
                "legacyPlugins": { "jumper": { "data": { "port": 9001 } } }
            }),
        )?;

        let bundle = Bundle::from_path(dir.path())?;
        let config = ContainerConfig::from_bundle(&bundle)?;
        assert!(config.is_valid());
        assert!(config.is_bundle());
        assert!(config.restart_on_crash());
        assert!(config.rdk_plugins()["logging"].required);
        assert_eq!(config.rdk_plugins()["storage"].depends_on, vec!["logging"]);
        assert_eq!(config.legacy_plugins()["jumper"]["port"], 9001);

        let rendered: Value = serde_json::from_str(&config.to_json()?)?;
        assert!(rendered.get("rdkPlugins").is_some());
        assert!(rendered.get("process").is_some());

        let rootfs = Rootfs::new(&bundle, &config)?;
        assert!(rootfs.is_valid());
        Ok(())
    }

    #[test]
    fn test_config_json_keeps_unknown_fields() -> Result<()> {
        let dir = tempdir()?;
        write_bundle(
            dir.path(),
            serde_json::json!({ "vendorHints": { "gpu": "on" } }),
        )?;
        let bundle = Bundle::from_path(dir.path())?;

        // a second start reads back what the first one wrote
        for _ in 0..2 {
            let mut config = ContainerConfig::from_bundle(&bundle)?;
            config.add_env(&["A=1".to_string()]);
            config.write_config_json(bundle.config_path())?;
        }

        let written: Value = serde_json::from_str(&fs::read_to_string(bundle.config_path())?)?;
        assert_eq!(written["vendorHints"]["gpu"], "on");
        let env = written["process"]["env"].as_array().cloned().unwrap_or_default();
        assert_eq!(env.iter().filter(|v| *v == "A=1").count(), 1);
        Ok(())
    }

    #[test]
    fn test_add_env_replaces_by_name() -> Result<()> {
        let json = r#"{ "version": "1.0", "args": ["sleep"], "env": ["A=B", "C=D"] }"#;
        let mut config = ContainerConfig::from_legacy_spec(json)?;
        config.add_env(&["A=X".to_string(), "E=F".to_string()]);
        let env = config.spec().process().clone().unwrap().env().clone().unwrap();
        assert!(env.contains(&"A=X".to_string()));
        assert!(!env.contains(&"A=B".to_string()));
        assert!(env.contains(&"C=D".to_string()));
        assert!(env.contains(&"E=F".to_string()));
        Ok(())
    }

    #[test]
    fn test_remove_generated_bundles() -> Result<()> {
        let dir = tempdir()?;
        fs::create_dir_all(dir.path().join("bundle-app/rootfs"))?;
        fs::create_dir(dir.path().join("logs"))?;

        remove_generated_bundles(dir.path())?;
        assert!(!dir.path().join("bundle-app").exists());
        assert!(dir.path().join("logs").is_dir());

        Bundle::create(dir.path(), &ContainerId::create("app"))?;
        Ok(())
    }

    #[test]
    fn test_missing_bundle_is_rejected() {
        assert!(Bundle::from_path("/definitely/not/here").is_err());
    }

    #[test]
    fn test_legacy_spec() -> Result<()> {
        let json = r#"{
            "version": "1.0",
            "args": ["sleep", "10"],
            "env": ["A=B"],
            "user": { "uid": 1000, "gid": 1000 },
            "restartOnCrash": true,
            "mounts": [ { "source": "/tmp", "destination": "/data", "options": ["bind"] } ],
            "plugins": [ { "name": "jumper", "data": { "port": 1 } } ]
        }"#;
        let config = ContainerConfig::from_legacy_spec(json)?;
        assert!(config.is_valid());
        assert!(!config.is_bundle());
        assert!(config.restart_on_crash());
        assert_eq!(config.legacy_spec(), Some(json));
        assert!(config.legacy_plugins().contains_key("jumper"));

        let process = config.spec().process().clone().unwrap();
        assert_eq!(process.args().clone().unwrap(), vec!["sleep", "10"]);
        assert_eq!(process.user().uid(), 1000);

        let dir = tempdir()?;
        let id = ContainerId::create("legacy.app");
        let path = {
            let bundle = Bundle::create(dir.path(), &id)?;
            let rootfs = Rootfs::new(&bundle, &config)?;
            assert!(rootfs.is_valid());
            bundle.path().to_path_buf()
        };
        // generated bundles are removed with their last handle
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn test_legacy_spec_rejects_bad_input() {
        assert!(ContainerConfig::from_legacy_spec("not json").is_err());
        assert!(ContainerConfig::from_legacy_spec(r#"{"version":"9","args":["a"]}"#).is_err());
        assert!(ContainerConfig::from_legacy_spec(r#"{"version":"1.0","args":[]}"#).is_err());
    }

    #[test]
    fn test_customise() -> Result<()> {
        let json = r#"{ "version": "1.0", "args": ["sleep", "10"] }"#;
        let config = ContainerConfig::from_legacy_spec(json)?;
        let custom = config.customise(
            "echo hello world",
            "/run/wayland-0",
            Path::new("/tmp/westeros"),
            &["EXTRA=1".to_string()],
        )?;
        let custom: Spec = serde_json::from_str(&custom)?;
        let process = custom.process().clone().unwrap();
        assert_eq!(process.args().clone().unwrap(), vec!["echo", "hello", "world"]);
        let env = process.env().clone().unwrap();
        assert!(env.contains(&"EXTRA=1".to_string()));
        assert!(env.contains(&"WAYLAND_DISPLAY=wayland-0".to_string()));
        let mounts = custom.mounts().clone().unwrap();
        assert!(
            mounts
                .iter()
                .any(|m| m.destination() == Path::new("/tmp/westeros/wayland-0"))
        );
        Ok(())
    }

    #[test]
    fn test_start_state_fds() -> Result<()> {
        let dir = tempdir()?;
        let file: OwnedFd = File::create(dir.path().join("f"))?.into();
        let state = StartState::new(vec![file])?;
        assert_eq!(state.len(), 1);

        let other: OwnedFd = File::create(dir.path().join("g"))?.into();
        assert_eq!(state.add_file_descriptor("ipc", &other)?, 4);
        state.add_environment_variable("LISTEN=1");
        assert_eq!(state.env(), vec!["LISTEN=1"]);
        assert_eq!(state.files()?.len(), 2);
        Ok(())
    }
}
