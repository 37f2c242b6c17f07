//! Daemon launch orchestration.
//!
//! The [`launcher::Launcher`] brings up one daemon per target through a
//! [`launcher::Invoker`], either directly from this process or through a
//! tree of [`relay`]s. [`topology`] decides the tree shape, [`command`] builds
//! each agent argv, and [`protocol`] is the parent/relay wire format. Shared
//! vocabulary lives in [`types`].

pub mod command;
pub mod launcher;
pub mod process;
pub mod protocol;
pub mod relay;
pub mod topology;
pub mod types;

pub use launcher::{Invocation, InvocationReport, Invoker, Launcher};
pub use process::ProcessInvoker;
pub use topology::{LaunchTopology, SubtreePlan};
pub use types::{
    FailureReason, JobLaunchResult, LaunchOutcome, LaunchSettings, LaunchTarget, RemoteOptions,
    TargetId, TargetReport,
};
