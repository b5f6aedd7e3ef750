use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use serde_json::Value;

use super::exec::ExecLegacyPlugin;
use super::{HookPoint, OnFailure, Step, run_ordered};
use crate::config::StartState;
use crate::{ContainerId, Result};

/// Which legacy hook points a plugin implements, and whether each one runs
/// synchronously or on a worker thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LegacyHints(u32);

impl LegacyHints {
    pub const POST_CONSTRUCTION_SYNC: Self = Self(1 << 0);
    pub const PRE_START_SYNC: Self = Self(1 << 1);
    pub const POST_START_SYNC: Self = Self(1 << 2);
    pub const POST_STOP_SYNC: Self = Self(1 << 3);
    pub const PRE_DESTRUCTION_SYNC: Self = Self(1 << 4);

    pub const POST_CONSTRUCTION_ASYNC: Self = Self(1 << 16);
    pub const PRE_START_ASYNC: Self = Self(1 << 17);
    pub const POST_START_ASYNC: Self = Self(1 << 18);
    pub const POST_STOP_ASYNC: Self = Self(1 << 19);
    pub const PRE_DESTRUCTION_ASYNC: Self = Self(1 << 20);

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn contains(&self, other: Self) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    /// Parses a hook name such as `preStart` or `postStopAsync`.
    pub fn from_name(name: &str) -> Option<Self> {
        let (point, asynchronous) = match name.strip_suffix("Async") {
            Some(point) => (point, true),
            None => (name, false),
        };
        let point = match point {
            "postConstruction" => HookPoint::PostConstruction,
            "preStart" => HookPoint::PreStart,
            "postStart" => HookPoint::PostStart,
            "postStop" => HookPoint::PostStop,
            "preDestruction" => HookPoint::PreDestruction,
            _ => return None,
        };
        let (sync, async_) = Self::for_point(point);
        Some(if asynchronous { async_ } else { sync })
    }

    fn for_point(point: HookPoint) -> (Self, Self) {
        match point {
            HookPoint::PostConstruction => {
                (Self::POST_CONSTRUCTION_SYNC, Self::POST_CONSTRUCTION_ASYNC)
            }
            HookPoint::PreStart => (Self::PRE_START_SYNC, Self::PRE_START_ASYNC),
            HookPoint::PostStart => (Self::POST_START_SYNC, Self::POST_START_ASYNC),
            HookPoint::PostStop => (Self::POST_STOP_SYNC, Self::POST_STOP_ASYNC),
            HookPoint::PreDestruction => {
                (Self::PRE_DESTRUCTION_SYNC, Self::PRE_DESTRUCTION_ASYNC)
            }
            HookPoint::Rdk(_) => (Self::default(), Self::default()),
        }
    }
}

/// A plugin using the fixed five-point legacy hook protocol.
///
/// `data` is the plugin's entry from the container config, passed through
/// untouched. Hooks a plugin does not advertise in [`LegacyPlugin::hook_hints`]
/// are never called.
pub trait LegacyPlugin: Send + Sync {
    fn name(&self) -> &str;

    fn hook_hints(&self) -> LegacyHints;

    fn post_construction(
        &self,
        _id: &ContainerId,
        _start_state: &StartState,
        _rootfs: &Path,
        _data: &Value,
    ) -> Result<()> {
        Ok(())
    }

    fn pre_start(&self, _id: &ContainerId, _pid: i32, _rootfs: &Path, _data: &Value) -> Result<()> {
        Ok(())
    }

    fn post_start(
        &self,
        _id: &ContainerId,
        _pid: i32,
        _rootfs: &Path,
        _data: &Value,
    ) -> Result<()> {
        Ok(())
    }

    fn post_stop(&self, _id: &ContainerId, _rootfs: &Path, _data: &Value) -> Result<()> {
        Ok(())
    }

    fn pre_destruction(&self, _id: &ContainerId, _rootfs: &Path, _data: &Value) -> Result<()> {
        Ok(())
    }
}

/// Runs legacy plugin hooks for a container's `name -> data` plugin map.
#[derive(Default, Clone)]
pub struct LegacyHookRunner {
    plugins: BTreeMap<String, Arc<dyn LegacyPlugin>>,
}

impl LegacyHookRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads every `*.json` legacy plugin manifest found in `dir`.
    pub fn from_dir(dir: impl AsRef<Path>) -> crate::Result<Self> {
        let dir = dir.as_ref();
        let mut runner = Self::new();
        if !dir.is_dir() {
            log::warn!("legacy plugin directory {dir:?} does not exist");
            return Ok(runner);
        }

        let mut manifests: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        manifests.sort();

        for manifest in manifests {
            match ExecLegacyPlugin::from_manifest(&manifest) {
                Ok(plugin) => {
                    runner.register(Arc::new(plugin));
                }
                Err(err) => log::warn!("skipping legacy plugin manifest {manifest:?}: {err}"),
            }
        }
        Ok(runner)
    }

    pub fn register(&mut self, plugin: Arc<dyn LegacyPlugin>) -> bool {
        let name = plugin.name().to_string();
        if self.plugins.contains_key(&name) {
            log::warn!("legacy plugin {name} already registered");
            return false;
        }
        log::debug!("registered legacy plugin {name}");
        self.plugins.insert(name, plugin);
        true
    }

    pub fn plugin_names(&self) -> Vec<String> {
        self.plugins.keys().cloned().collect()
    }

    pub fn execute_post_construction_hooks(
        &self,
        plugins: &BTreeMap<String, Value>,
        id: &ContainerId,
        start_state: &StartState,
        rootfs: &Path,
    ) -> bool {
        self.execute(HookPoint::PostConstruction, plugins, |plugin, data| {
            plugin.post_construction(id, start_state, rootfs, data)
        })
    }

    pub fn execute_pre_start_hooks(
        &self,
        plugins: &BTreeMap<String, Value>,
        id: &ContainerId,
        pid: i32,
        rootfs: &Path,
    ) -> bool {
        self.execute(HookPoint::PreStart, plugins, |plugin, data| {
            plugin.pre_start(id, pid, rootfs, data)
        })
    }

    pub fn execute_post_start_hooks(
        &self,
        plugins: &BTreeMap<String, Value>,
        id: &ContainerId,
        pid: i32,
        rootfs: &Path,
    ) -> bool {
        self.execute(HookPoint::PostStart, plugins, |plugin, data| {
            plugin.post_start(id, pid, rootfs, data)
        })
    }

    pub fn execute_post_stop_hooks(
        &self,
        plugins: &BTreeMap<String, Value>,
        id: &ContainerId,
        rootfs: &Path,
    ) -> bool {
        self.execute(HookPoint::PostStop, plugins, |plugin, data| {
            plugin.post_stop(id, rootfs, data)
        })
    }

    pub fn execute_pre_destruction_hooks(
        &self,
        plugins: &BTreeMap<String, Value>,
        id: &ContainerId,
        rootfs: &Path,
    ) -> bool {
        self.execute(HookPoint::PreDestruction, plugins, |plugin, data| {
            plugin.pre_destruction(id, rootfs, data)
        })
    }

    fn execute<F>(&self, point: HookPoint, plugins: &BTreeMap<String, Value>, call: F) -> bool
    where
        F: Fn(&dyn LegacyPlugin, &Value) -> Result<()> + Sync,
    {
        let (sync_flag, async_flag) = LegacyHints::for_point(point);
        let call = &call;

        thread::scope(|s| {
            let mut pending = Vec::new();

            let steps = plugins.iter().filter_map(|(name, data)| {
                let Some(plugin) = self.plugins.get(name) else {
                    log::warn!("no legacy plugin named {name}, skipping {point}");
                    return None;
                };
                let hints = plugin.hook_hints();
                if hints.contains(async_flag) {
                    let handle = s.spawn(move || call(plugin.as_ref(), data));
                    pending.push((name.as_str(), handle));
                    None
                } else if hints.contains(sync_flag) {
                    Some(Step {
                        name: name.as_str(),
                        on_failure: OnFailure::Fail,
                        run: Box::new(move || call(plugin.as_ref(), data)),
                    })
                } else {
                    None
                }
            });
            let sync_ok = run_ordered(point, steps);

            let mut async_ok = true;
            for (name, handle) in pending {
                match handle.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        log::error!("async {point} hook of {name} failed: {err}");
                        async_ok = false;
                    }
                    Err(_) => {
                        log::error!("async {point} hook of {name} panicked");
                        async_ok = false;
                    }
                }
            }
            sync_ok && async_ok
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::Error;

    struct Recorder {
        name: String,
        hints: LegacyHints,
        fail: bool,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        fn record(&self, what: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("{}:{what}", self.name));
            if self.fail {
                return Err(Error::Others(format!("{} failed", self.name)));
            }
            Ok(())
        }
    }

    impl LegacyPlugin for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn hook_hints(&self) -> LegacyHints {
            self.hints
        }

        fn pre_start(&self, _: &ContainerId, pid: i32, _: &Path, _: &Value) -> Result<()> {
            self.record(&format!("preStart({pid})"))
        }

        fn post_stop(&self, _: &ContainerId, _: &Path, data: &Value) -> Result<()> {
            self.record(&format!("postStop({data})"))
        }
    }

    fn runner(calls: &Arc<Mutex<Vec<String>>>, plugins: &[(&str, LegacyHints, bool)]) -> LegacyHookRunner {
        let mut runner = LegacyHookRunner::new();
        for (name, hints, fail) in plugins {
            assert!(runner.register(Arc::new(Recorder {
                name: name.to_string(),
                hints: *hints,
                fail: *fail,
                calls: calls.clone(),
            })));
        }
        runner
    }

    #[test]
    fn test_every_plugin_runs_even_after_failure() {
        let calls = Arc::new(Mutex::new(vec![]));
        let runner = runner(
            &calls,
            &[
                ("a", LegacyHints::PRE_START_SYNC, true),
                ("b", LegacyHints::PRE_START_SYNC, false),
            ],
        );
        let plugins = BTreeMap::from([("a".to_string(), Value::Null), ("b".to_string(), Value::Null)]);
        let id = ContainerId::create("app");

        assert!(!runner.execute_pre_start_hooks(&plugins, &id, 42, Path::new("/rootfs")));
        assert_eq!(*calls.lock().unwrap(), vec!["a:preStart(42)", "b:preStart(42)"]);
    }

    #[test]
    fn test_async_hooks_are_joined() {
        let calls = Arc::new(Mutex::new(vec![]));
        let runner = runner(
            &calls,
            &[
                ("a", LegacyHints::POST_STOP_ASYNC, false),
                ("b", LegacyHints::POST_STOP_ASYNC, true),
            ],
        );
        let plugins = BTreeMap::from([
            ("a".to_string(), serde_json::json!(1)),
            ("b".to_string(), serde_json::json!(2)),
        ]);
        let id = ContainerId::create("app");

        assert!(!runner.execute_post_stop_hooks(&plugins, &id, Path::new("/rootfs")));
        let mut got = calls.lock().unwrap().clone();
        got.sort();
        assert_eq!(got, vec!["a:postStop(1)", "b:postStop(2)"]);
    }

    #[test]
    fn test_unknown_and_unhinted_plugins_are_skipped() {
        let calls = Arc::new(Mutex::new(vec![]));
        let runner = runner(&calls, &[("a", LegacyHints::POST_STOP_SYNC, false)]);
        let plugins = BTreeMap::from([
            ("a".to_string(), Value::Null),
            ("ghost".to_string(), Value::Null),
        ]);
        let id = ContainerId::create("app");

        // "a" only implements postStop
        assert!(runner.execute_pre_start_hooks(&plugins, &id, 1, Path::new("/")));
        assert!(calls.lock().unwrap().is_empty());
        assert!(runner.execute_pre_destruction_hooks(&plugins, &id, Path::new("/")));
    }

    #[test]
    fn test_hint_names() {
        assert_eq!(LegacyHints::from_name("preStart"), Some(LegacyHints::PRE_START_SYNC));
        assert_eq!(
            LegacyHints::from_name("postConstructionAsync"),
            Some(LegacyHints::POST_CONSTRUCTION_ASYNC)
        );
        assert_eq!(LegacyHints::from_name("postHalt"), None);
    }

    #[test]
    fn test_duplicate_registration() {
        let calls = Arc::new(Mutex::new(vec![]));
        let mut runner = runner(&calls, &[("a", LegacyHints::POST_STOP_SYNC, false)]);
        assert!(!runner.register(Arc::new(Recorder {
            name: "a".into(),
            hints: LegacyHints::default(),
            fail: false,
            calls: calls.clone(),
        })));
        assert_eq!(runner.plugin_names(), vec!["a"]);
    }
}
