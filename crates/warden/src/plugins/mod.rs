//! Plugin hook runners.
//!
//! Two plugin families hook into a container's lifecycle: legacy plugins,
//! called at five fixed points, and RDK plugins, addressed by [`HintFlags`].
//! Both are sequenced by [`run_ordered`].

use std::fmt;
use std::ops::BitOr;

mod exec;
mod legacy;
mod rdk;
mod solver;

pub use exec::{ExecLegacyPlugin, ExecPluginManifest, ExecRdkPlugin};
pub use legacy::{LegacyHints, LegacyHookRunner, LegacyPlugin};
pub use rdk::{
    DynamicMount, LoggerHandle, PluginContext, RdkPlugin, RdkPluginManager, RdkPluginRegistry,
};
pub use solver::DependencySolver;

/// Bitmask selecting the lifecycle points an RDK plugin takes part in.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct HintFlags(u32);

impl HintFlags {
    pub const POST_INSTALLATION: Self = Self(0x01);
    pub const PRE_CREATION: Self = Self(0x02);
    pub const CREATE_RUNTIME: Self = Self(0x04);
    pub const CREATE_CONTAINER: Self = Self(0x08);
    pub const START_CONTAINER: Self = Self(0x10);
    pub const POST_START: Self = Self(0x20);
    pub const POST_HALT: Self = Self(0x40);
    pub const POST_STOP: Self = Self(0x80);

    const NAMES: [(Self, &'static str); 8] = [
        (Self::POST_INSTALLATION, "postInstallation"),
        (Self::PRE_CREATION, "preCreation"),
        (Self::CREATE_RUNTIME, "createRuntime"),
        (Self::CREATE_CONTAINER, "createContainer"),
        (Self::START_CONTAINER, "startContainer"),
        (Self::POST_START, "postStart"),
        (Self::POST_HALT, "postHalt"),
        (Self::POST_STOP, "postStop"),
    ];

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits & 0xff)
    }

    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(&self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Teardown hooks run with dependents before their dependencies.
    pub const fn runs_reversed(&self) -> bool {
        self.0 >= Self::POST_HALT.0
    }

    /// Name of a single hook point, e.g. `postInstallation`.
    pub fn name(&self) -> Option<&'static str> {
        Self::NAMES
            .iter()
            .find(|(flag, _)| flag == self)
            .map(|(_, name)| *name)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::NAMES
            .iter()
            .find(|(_, n)| n.eq_ignore_ascii_case(name))
            .map(|(flag, _)| *flag)
    }
}

impl BitOr for HintFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for HintFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "HintFlags({})", names.join(" | "))
    }
}

/// A point in the container lifecycle at which plugins are invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPoint {
    PostConstruction,
    PreStart,
    PostStart,
    PostStop,
    PreDestruction,
    Rdk(HintFlags),
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PostConstruction => f.write_str("PostConstruction"),
            Self::PreStart => f.write_str("PreStart"),
            Self::PostStart => f.write_str("PostStart"),
            Self::PostStop => f.write_str("PostStop"),
            Self::PreDestruction => f.write_str("PreDestruction"),
            Self::Rdk(hint) => write!(f, "{}", hint.name().unwrap_or("rdk")),
        }
    }
}

/// What a failing step does to the rest of its batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OnFailure {
    /// Stop running further steps; the batch fails.
    Abort,
    /// Keep running further steps; the batch fails.
    Fail,
    /// Keep running further steps; the batch is unaffected.
    Ignore,
}

pub(crate) struct Step<'a> {
    pub name: &'a str,
    pub on_failure: OnFailure,
    pub run: Box<dyn FnOnce() -> crate::Result<()> + 'a>,
}

/// Runs `steps` in order, applying each step's failure policy.
pub(crate) fn run_ordered<'a>(point: HookPoint, steps: impl IntoIterator<Item = Step<'a>>) -> bool {
    let mut success = true;
    for step in steps {
        if let Err(err) = (step.run)() {
            match step.on_failure {
                OnFailure::Abort => {
                    log::error!("required plugin {} failed at {point}: {err}", step.name);
                    return false;
                }
                OnFailure::Fail => {
                    log::error!("plugin {} failed at {point}: {err}", step.name);
                    success = false;
                }
                OnFailure::Ignore => {
                    log::warn!("non-required plugin {} failed at {point}: {err}", step.name);
                }
            }
        }
    }
    success
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::Error;

    fn step<'a>(
        name: &'static str,
        on_failure: OnFailure,
        ok: bool,
        log: &'a RefCell<Vec<&'static str>>,
    ) -> Step<'a> {
        Step {
            name,
            on_failure,
            run: Box::new(move || {
                log.borrow_mut().push(name);
                if ok {
                    Ok(())
                } else {
                    Err(Error::Others("boom".into()))
                }
            }),
        }
    }

    #[test]
    fn test_hint_flags() {
        let flags = HintFlags::POST_START | HintFlags::POST_STOP;
        assert!(flags.contains(HintFlags::POST_STOP));
        assert!(!flags.contains(HintFlags::POST_HALT));
        assert!(flags.intersects(HintFlags::POST_START | HintFlags::PRE_CREATION));
        assert_eq!(flags.bits(), 0xa0);
        assert_eq!(format!("{flags:?}"), "HintFlags(postStart | postStop)");
        assert_eq!(HintFlags::from_name("PostHalt"), Some(HintFlags::POST_HALT));
        assert!(HintFlags::POST_HALT.runs_reversed());
        assert!(!HintFlags::POST_START.runs_reversed());
    }

    #[test]
    fn test_abort_stops_the_batch() {
        let log = RefCell::new(vec![]);
        let ok = run_ordered(
            HookPoint::Rdk(HintFlags::PRE_CREATION),
            [
                step("a", OnFailure::Abort, true, &log),
                step("b", OnFailure::Abort, false, &log),
                step("c", OnFailure::Abort, true, &log),
            ],
        );
        assert!(!ok);
        assert_eq!(*log.borrow(), vec!["a", "b"]);
    }

    #[test]
    fn test_fail_runs_everything() {
        let log = RefCell::new(vec![]);
        let ok = run_ordered(
            HookPoint::PreStart,
            [
                step("a", OnFailure::Fail, false, &log),
                step("b", OnFailure::Fail, true, &log),
            ],
        );
        assert!(!ok);
        assert_eq!(*log.borrow(), vec!["a", "b"]);
    }

    #[test]
    fn test_ignore_keeps_success() {
        let log = RefCell::new(vec![]);
        let ok = run_ordered(
            HookPoint::Rdk(HintFlags::POST_START),
            [
                step("a", OnFailure::Ignore, false, &log),
                step("b", OnFailure::Abort, true, &log),
            ],
        );
        assert!(ok);
        assert_eq!(*log.borrow(), vec!["a", "b"]);
    }
}
