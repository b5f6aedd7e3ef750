use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{RecvTimeoutError, bounded};
use serde::Serialize;
use serde_json::Value;

use super::exec::ExecRdkPlugin;
use super::{DependencySolver, HintFlags, HookPoint, OnFailure, Step, run_ordered};
use crate::config::RdkPluginConfig;
use crate::{ContainerId, Error, Result};

/// What a plugin sees of the container when one of its hooks runs.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginContext {
    pub id: ContainerId,
    pub bundle: PathBuf,
    pub rootfs: PathBuf,
    pub pid: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<i32>,
    pub data: Value,
}

/// A mount added to, or removed from, a running container.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicMount {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub options: Vec<String>,
    pub data: String,
}

/// A plugin addressed by [`HintFlags`].
///
/// The dynamic mount and annotation operations return `None` when the plugin
/// does not support them.
pub trait RdkPlugin: Send + Sync {
    fn name(&self) -> &str;

    fn hook_hints(&self) -> HintFlags;

    fn dependencies(&self) -> Vec<String> {
        vec![]
    }

    /// Runs one hook. With a deadline the plugin must have stopped all work
    /// for the hook, including any processes it spawned, by that instant.
    fn run(&self, hook: HintFlags, ctx: &PluginContext, deadline: Option<Instant>) -> Result<()>;

    /// Whether this plugin receives the container's console output.
    fn is_logging(&self) -> bool {
        false
    }

    fn add_mount(&self, _ctx: &PluginContext, _mount: &DynamicMount) -> Option<Result<()>> {
        None
    }

    fn remove_mount(&self, _ctx: &PluginContext, _source: &Path) -> Option<Result<()>> {
        None
    }

    fn annotate(&self, _ctx: &PluginContext, _key: &str, _value: Option<&str>) -> Option<Result<()>> {
        None
    }
}

/// All RDK plugins known to the daemon, by name.
#[derive(Default, Clone)]
pub struct RdkPluginRegistry {
    plugins: BTreeMap<String, Arc<dyn RdkPlugin>>,
}

impl RdkPluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads every `*.json` plugin manifest found in `dir`.
    ///
    /// A missing directory yields an empty registry; broken manifests are
    /// skipped.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut registry = Self::new();
        if !dir.is_dir() {
            log::warn!("plugin directory {dir:?} does not exist, no RDK plugins loaded");
            return Ok(registry);
        }

        let mut manifests: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        manifests.sort();

        for manifest in manifests {
            match ExecRdkPlugin::from_manifest(&manifest) {
                Ok(plugin) => {
                    registry.register(Arc::new(plugin));
                }
                Err(err) => log::warn!("skipping plugin manifest {manifest:?}: {err}"),
            }
        }
        log::info!("loaded {} RDK plugins from {dir:?}", registry.plugins.len());
        Ok(registry)
    }

    pub fn register(&mut self, plugin: Arc<dyn RdkPlugin>) -> bool {
        let name = plugin.name().to_string();
        if self.plugins.contains_key(&name) {
            log::warn!("RDK plugin {name} already registered");
            return false;
        }
        self.plugins.insert(name, plugin);
        true
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn RdkPlugin>> {
        self.plugins.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.plugins.keys().cloned().collect()
    }
}

/// The logging plugin chosen for a container, with its config data.
#[derive(Clone)]
pub struct LoggerHandle {
    pub plugin: Arc<dyn RdkPlugin>,
    pub data: Value,
}

impl LoggerHandle {
    pub fn name(&self) -> &str {
        self.plugin.name()
    }
}

impl fmt::Debug for LoggerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoggerHandle")
            .field("plugin", &self.name())
            .field("data", &self.data)
            .finish()
    }
}

struct Loaded {
    plugin: Arc<dyn RdkPlugin>,
    config: RdkPluginConfig,
}

/// The RDK plugins configured for one container.
pub struct RdkPluginManager {
    plugins: BTreeMap<String, Loaded>,
    solver: DependencySolver,
    ctx: Mutex<PluginContext>,
}

impl RdkPluginManager {
    pub fn new(
        registry: &RdkPluginRegistry,
        id: &ContainerId,
        bundle: &Path,
        rootfs: &Path,
        configs: &BTreeMap<String, RdkPluginConfig>,
    ) -> Result<Self> {
        let mut plugins = BTreeMap::new();
        let mut solver = DependencySolver::new();

        for (name, config) in configs {
            match registry.get(name) {
                Some(plugin) => {
                    solver.add_plugin(name);
                    plugins.insert(
                        name.clone(),
                        Loaded {
                            plugin,
                            config: config.clone(),
                        },
                    );
                }
                None if config.required => {
                    return Err(Error::Plugin {
                        name: name.clone(),
                        reason: "required plugin is not installed".into(),
                    });
                }
                None => log::warn!("plugin {name} is not installed, skipping it for {id}"),
            }
        }

        for (name, loaded) in &plugins {
            let mut deps = loaded.plugin.dependencies();
            deps.extend(loaded.config.depends_on.iter().cloned());
            for dep in deps {
                if !solver.add_dependency(name, &dep) && loaded.config.required {
                    return Err(Error::Plugin {
                        name: name.clone(),
                        reason: format!("dependency {dep} is not loaded"),
                    });
                }
            }
        }

        Ok(Self {
            plugins,
            solver,
            ctx: Mutex::new(PluginContext {
                id: id.clone(),
                bundle: bundle.to_path_buf(),
                rootfs: rootfs.to_path_buf(),
                pid: -1,
                exit_status: None,
                data: Value::Null,
            }),
        })
    }

    pub fn list_loaded_plugins(&self) -> Vec<String> {
        self.plugins.keys().cloned().collect()
    }

    pub fn set_container_pid(&self, pid: i32) {
        self.ctx.lock().unwrap().pid = pid;
    }

    pub fn set_exit_status(&self, status: i32) {
        self.ctx.lock().unwrap().exit_status = Some(status);
    }

    pub fn container_logger(&self) -> Option<LoggerHandle> {
        self.plugins
            .values()
            .find(|loaded| loaded.plugin.is_logging())
            .map(|loaded| LoggerHandle {
                plugin: loaded.plugin.clone(),
                data: loaded.config.data.clone(),
            })
    }

    /// Runs `hint` on every plugin that implements it, dependencies first
    /// (or last, for teardown hooks).
    ///
    /// A required plugin failing aborts the batch; other failures are only
    /// logged. With a timeout, a plugin that overruns it counts as failed.
    pub fn run_plugins(&self, hint: HintFlags, timeout: Option<Duration>) -> bool {
        if self.plugins.is_empty() {
            return true;
        }

        let order = if hint.runs_reversed() {
            self.solver.reversed_order()
        } else {
            self.solver.order()
        };
        if order.is_empty() {
            log::error!("failed to resolve plugin order for {hint:?}");
            return false;
        }

        let base = self.ctx.lock().unwrap().clone();
        let steps = order.into_iter().filter_map(|name| {
            let loaded = self.plugins.get(&name)?;
            if !loaded.plugin.hook_hints().contains(hint) {
                return None;
            }
            let ctx = PluginContext {
                data: loaded.config.data.clone(),
                ..base.clone()
            };
            let plugin = loaded.plugin.clone();
            Some(Step {
                name: loaded.plugin.name(),
                on_failure: if loaded.config.required {
                    OnFailure::Abort
                } else {
                    OnFailure::Ignore
                },
                run: Box::new(move || invoke(plugin, hint, ctx, timeout)),
            })
        });
        run_ordered(HookPoint::Rdk(hint), steps)
    }

    pub fn add_mount(&self, mount: &DynamicMount) -> bool {
        self.dispatch("addMount", |plugin, ctx| plugin.add_mount(ctx, mount))
    }

    pub fn remove_mount(&self, source: &Path) -> bool {
        self.dispatch("removeMount", |plugin, ctx| plugin.remove_mount(ctx, source))
    }

    pub fn annotate(&self, key: &str, value: Option<&str>) -> bool {
        self.dispatch("annotate", |plugin, ctx| plugin.annotate(ctx, key, value))
    }

    fn dispatch<F>(&self, what: &str, call: F) -> bool
    where
        F: Fn(&dyn RdkPlugin, &PluginContext) -> Option<Result<()>>,
    {
        let base = self.ctx.lock().unwrap().clone();
        let mut handled = false;
        let mut success = true;
        for (name, loaded) in &self.plugins {
            let ctx = PluginContext {
                data: loaded.config.data.clone(),
                ..base.clone()
            };
            match call(loaded.plugin.as_ref(), &ctx) {
                None => continue,
                Some(Ok(())) => handled = true,
                Some(Err(err)) => {
                    log::error!("{what} failed in plugin {name} for {}: {err}", base.id);
                    handled = true;
                    success = false;
                }
            }
        }
        if !handled {
            log::warn!("no plugin of {} supports {what}", base.id);
        }
        handled && success
    }
}

/// How long past its deadline a plugin is waited for before it is given up.
const DEADLINE_GRACE: Duration = Duration::from_millis(250);

fn invoke(
    plugin: Arc<dyn RdkPlugin>,
    hint: HintFlags,
    ctx: PluginContext,
    timeout: Option<Duration>,
) -> Result<()> {
    let Some(timeout) = timeout else {
        return plugin.run(hint, &ctx, None);
    };
    let deadline = Instant::now() + timeout;

    let name = plugin.name().to_string();
    let (tx, rx) = bounded(1);
    thread::Builder::new()
        .name(format!("{name}-hook"))
        .spawn(move || {
            let _ = tx.send(plugin.run(hint, &ctx, Some(deadline)));
        })?;

    match rx.recv_timeout(timeout + DEADLINE_GRACE) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(Error::Plugin {
            name,
            reason: format!("{hint:?} timed out after {timeout:?}"),
        }),
        Err(RecvTimeoutError::Disconnected) => Err(Error::Plugin {
            name,
            reason: format!("{hint:?} panicked"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRdkPlugin;

    fn load(
        plugins: Vec<FakeRdkPlugin>,
        configs: &[(&str, bool, &[&str])],
    ) -> Result<(RdkPluginManager, Arc<Mutex<Vec<String>>>)> {
        let calls = Arc::new(Mutex::new(vec![]));
        let mut registry = RdkPluginRegistry::new();
        for plugin in plugins {
            registry.register(Arc::new(plugin.with_calls(calls.clone())));
        }
        let configs = configs
            .iter()
            .map(|(name, required, deps)| {
                let config = RdkPluginConfig {
                    required: *required,
                    depends_on: deps.iter().map(|d| d.to_string()).collect(),
                    data: serde_json::json!({ "name": name }),
                };
                (name.to_string(), config)
            })
            .collect();
        let manager = RdkPluginManager::new(
            &registry,
            &ContainerId::create("app"),
            Path::new("/bundle"),
            Path::new("/bundle/rootfs"),
            &configs,
        )?;
        Ok((manager, calls))
    }

    const ALL: HintFlags = HintFlags::from_bits(0xff);

    #[test]
    fn test_runs_in_dependency_order() -> Result<()> {
        let (manager, calls) = load(
            vec![
                FakeRdkPlugin::new("networking", ALL),
                FakeRdkPlugin::new("storage", ALL),
                FakeRdkPlugin::new("logging", ALL),
            ],
            &[
                ("networking", false, &["storage"]),
                ("storage", false, &["logging"]),
                ("logging", false, &[]),
            ],
        )?;

        assert!(manager.run_plugins(HintFlags::PRE_CREATION, None));
        assert!(manager.run_plugins(HintFlags::POST_HALT, None));
        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                "logging:preCreation",
                "storage:preCreation",
                "networking:preCreation",
                "networking:postHalt",
                "storage:postHalt",
                "logging:postHalt",
            ]
        );
        Ok(())
    }

    #[test]
    fn test_required_failure_aborts() -> Result<()> {
        let (manager, calls) = load(
            vec![
                FakeRdkPlugin::new("a", ALL).failing(HintFlags::POST_START),
                FakeRdkPlugin::new("b", ALL),
            ],
            &[("a", true, &[]), ("b", false, &[])],
        )?;
        assert!(!manager.run_plugins(HintFlags::POST_START, None));
        assert_eq!(*calls.lock().unwrap(), vec!["a:postStart"]);
        Ok(())
    }

    #[test]
    fn test_optional_failure_is_ignored() -> Result<()> {
        let (manager, calls) = load(
            vec![
                FakeRdkPlugin::new("a", ALL).failing(HintFlags::POST_START),
                FakeRdkPlugin::new("b", HintFlags::POST_START),
                FakeRdkPlugin::new("c", HintFlags::POST_STOP),
            ],
            &[("a", false, &[]), ("b", false, &[]), ("c", false, &[])],
        )?;
        assert!(manager.run_plugins(HintFlags::POST_START, None));
        assert_eq!(*calls.lock().unwrap(), vec!["a:postStart", "b:postStart"]);
        Ok(())
    }

    #[test]
    fn test_cycle_fails() -> Result<()> {
        let (manager, calls) = load(
            vec![FakeRdkPlugin::new("a", ALL), FakeRdkPlugin::new("b", ALL)],
            &[("a", false, &["b"]), ("b", false, &["a"])],
        )?;
        assert!(!manager.run_plugins(HintFlags::PRE_CREATION, None));
        assert!(calls.lock().unwrap().is_empty());
        Ok(())
    }

    #[test]
    fn test_timeout_counts_as_failure() -> Result<()> {
        let (manager, _) = load(
            vec![FakeRdkPlugin::new("slow", ALL).sleeping(Duration::from_millis(500))],
            &[("slow", true, &[])],
        )?;
        assert!(!manager.run_plugins(HintFlags::POST_HALT, Some(Duration::from_millis(50))));
        Ok(())
    }

    #[test]
    fn test_missing_plugins() -> Result<()> {
        assert!(load(vec![], &[("ghost", true, &[])]).is_err());

        let (manager, _) = load(vec![], &[("ghost", false, &[])])?;
        assert!(manager.list_loaded_plugins().is_empty());
        assert!(manager.run_plugins(HintFlags::POST_START, None));
        Ok(())
    }

    #[test]
    fn test_context_and_logger() -> Result<()> {
        let (manager, _) = load(
            vec![
                FakeRdkPlugin::new("logging", ALL).logging(),
                FakeRdkPlugin::new("storage", ALL),
            ],
            &[("logging", false, &[]), ("storage", false, &[])],
        )?;

        let logger = manager.container_logger().unwrap();
        assert_eq!(logger.name(), "logging");
        assert_eq!(logger.data["name"], "logging");

        manager.set_container_pid(42);
        manager.set_exit_status(9);
        let ctx = manager.ctx.lock().unwrap().clone();
        assert_eq!(ctx.pid, 42);
        assert_eq!(ctx.exit_status, Some(9));
        Ok(())
    }

    #[test]
    fn test_dynamic_mounts_need_support() -> Result<()> {
        let mount = DynamicMount {
            source: "/media/usb".into(),
            destination: "/mnt/usb".into(),
            options: vec!["bind".into()],
            data: String::new(),
        };

        let (manager, _) = load(vec![FakeRdkPlugin::new("a", ALL)], &[("a", false, &[])])?;
        assert!(!manager.add_mount(&mount));

        let (manager, calls) = load(
            vec![FakeRdkPlugin::new("storage", ALL).with_mounts()],
            &[("storage", false, &[])],
        )?;
        assert!(manager.add_mount(&mount));
        assert!(manager.remove_mount(Path::new("/media/usb")));
        assert!(!manager.annotate("key", Some("value")));
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["storage:addMount(/media/usb)", "storage:removeMount(/media/usb)"]
        );
        Ok(())
    }
}
