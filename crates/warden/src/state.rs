use serde::Serialize;

use crate::Error::FailedPrecondition;
use crate::Result;

/// Lifecycle state of a container record.
///
/// There is no `Stopped` state: once teardown completes the record is
/// removed from the registry and queries report [`ContainerState::Invalid`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Invalid,
    Starting,
    Running,
    Stopping,
    Paused,
    Hibernating,
    Hibernated,
    Awakening,
}

impl ContainerState {
    /// Numeric code reported over the control interface.
    pub fn code(&self) -> i32 {
        match self {
            Self::Invalid => 0,
            Self::Starting => 1,
            Self::Running => 2,
            Self::Stopping => 3,
            Self::Paused => 4,
            Self::Hibernating => 5,
            Self::Hibernated => 6,
            Self::Awakening => 7,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invalid => "invalid",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Paused => "paused",
            Self::Hibernating => "hibernating",
            Self::Hibernated => "hibernated",
            Self::Awakening => "awakening",
        }
    }

    pub(crate) fn started(&mut self) -> Result<()> {
        *self = match self {
            Self::Starting => Ok(Self::Running),
            _ => state_transition_error(*self, Self::Running),
        }?;
        Ok(())
    }

    pub(crate) fn stop(&mut self) -> Result<()> {
        *self = match self {
            Self::Running | Self::Stopping => Ok(Self::Stopping),
            _ => state_transition_error(*self, Self::Stopping),
        }?;
        Ok(())
    }

    /// The init process went away; every settled state funnels into `Stopping`.
    pub(crate) fn exited(&mut self) -> Result<()> {
        *self = match self {
            Self::Running
            | Self::Stopping
            | Self::Paused
            | Self::Hibernating
            | Self::Hibernated
            | Self::Awakening => Ok(Self::Stopping),
            _ => state_transition_error(*self, Self::Stopping),
        }?;
        Ok(())
    }

    pub(crate) fn restart(&mut self) -> Result<()> {
        *self = match self {
            Self::Stopping => Ok(Self::Starting),
            _ => state_transition_error(*self, Self::Starting),
        }?;
        Ok(())
    }

    pub(crate) fn pause(&mut self) -> Result<()> {
        *self = match self {
            Self::Running => Ok(Self::Paused),
            _ => state_transition_error(*self, Self::Paused),
        }?;
        Ok(())
    }

    pub(crate) fn resume(&mut self) -> Result<()> {
        *self = match self {
            Self::Paused => Ok(Self::Running),
            _ => state_transition_error(*self, Self::Running),
        }?;
        Ok(())
    }

    pub(crate) fn hibernate(&mut self) -> Result<()> {
        *self = match self {
            Self::Running => Ok(Self::Hibernating),
            _ => state_transition_error(*self, Self::Hibernating),
        }?;
        Ok(())
    }

    pub(crate) fn hibernated(&mut self) -> Result<()> {
        *self = match self {
            Self::Hibernating => Ok(Self::Hibernated),
            _ => state_transition_error(*self, Self::Hibernated),
        }?;
        Ok(())
    }

    pub(crate) fn wakeup(&mut self) -> Result<()> {
        *self = match self {
            Self::Hibernated => Ok(Self::Awakening),
            _ => state_transition_error(*self, Self::Awakening),
        }?;
        Ok(())
    }

    pub(crate) fn awoken(&mut self) -> Result<()> {
        *self = match self {
            Self::Awakening => Ok(Self::Running),
            _ => state_transition_error(*self, Self::Running),
        }?;
        Ok(())
    }

    /// Undo a transitional state after its runtime call failed.
    pub(crate) fn abort_transition(&mut self) -> Result<()> {
        *self = match self {
            Self::Hibernating => Ok(Self::Running),
            Self::Awakening => Ok(Self::Hibernated),
            // the stop signal could not be delivered
            Self::Stopping => Ok(Self::Running),
            _ => state_transition_error(*self, "Aborted"),
        }?;
        Ok(())
    }
}

fn state_transition_error<T>(from: impl std::fmt::Debug, to: impl std::fmt::Debug) -> Result<T> {
    Err(FailedPrecondition(format!(
        "invalid state transition: {from:?} => {to:?}"
    )))
}
