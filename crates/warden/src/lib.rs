#![doc = include_str!("../README.md")]

pub mod config;
pub(crate) mod container;
pub mod container_id;
pub(crate) mod descriptor;
pub mod error;
pub mod hibernate;
pub mod logger;
pub mod orchestrator;
pub mod plugins;
pub mod reaper;
pub mod runtime;
pub mod settings;
pub mod state;
pub mod timer;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use container_id::ContainerId;
pub use error::{Error, Result};
pub use orchestrator::{Callbacks, Collaborators, Orchestrator};
pub use settings::Settings;
pub use state::ContainerState;
