//! Type definitions for the launch orchestration subsystem.
//!
//! These types form the shared vocabulary between the [`super::launcher::Launcher`],
//! the invocation backends, the relay protocol, and the CLI summary.
//! Everything that crosses the relay channel derives both `Serialize` and
//! `Deserialize`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::command::wants_daemonize;
use crate::agent::ResolvedAgent;
use crate::config::LauncherConfig;

/// Position of a target in the job's enumeration order.
pub type TargetId = usize;

/// One node to bring a daemon up on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchTarget {
    /// Index in the job's node list.
    pub id: TargetId,
    /// Address handed to the launch agent.
    pub node: String,
    /// Daemon command line to run on the node.
    pub command: Vec<String>,
    /// Target that launches this one, or `None` for the root (this process).
    pub parent: Option<TargetId>,
    /// Distance from the root (direct children of the root have depth 1).
    pub depth: usize,
}

impl LaunchTarget {
    /// A target not yet placed in a topology.
    pub fn new(node: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            id: 0,
            node: node.into(),
            command,
            parent: None,
            depth: 1,
        }
    }
}

/// Why a target did not come up.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    #[error("agent exited with {}{}", describe_exit(*code), describe_tail(diagnostics))]
    NonZeroExit {
        /// Exit code, or `None` when the agent died from a signal.
        code: Option<i32>,
        /// Last lines of the agent's output.
        diagnostics: String,
    },

    #[error("launch agent not found at {path}")]
    AgentNotFound { path: String },

    #[error("failed to start launch agent: {message}")]
    SpawnFailed { message: String },

    #[error("timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("terminated because the launch was cancelled")]
    Interrupted,

    #[error("not launched: parent target {parent} failed")]
    ParentFailed { parent: TargetId },

    #[error("relay protocol error: {message}")]
    Protocol { message: String },
}

impl FailureReason {
    pub fn timeout(after: Duration) -> Self {
        FailureReason::Timeout {
            after_ms: u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        FailureReason::Protocol {
            message: message.into(),
        }
    }
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(c) => format!("code {c}"),
        None => "a signal".to_string(),
    }
}

fn describe_tail(diagnostics: &str) -> String {
    if diagnostics.is_empty() {
        String::new()
    } else {
        format!(": {diagnostics}")
    }
}

/// Terminal state of one target.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LaunchOutcome {
    Succeeded,
    Failed { reason: FailureReason },
    /// Never started because the launch was cancelled.
    Cancelled,
}

impl LaunchOutcome {
    pub fn failed(reason: FailureReason) -> Self {
        LaunchOutcome::Failed { reason }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, LaunchOutcome::Succeeded)
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        match self {
            LaunchOutcome::Failed { reason } => Some(reason),
            _ => None,
        }
    }
}

/// Outcome of one target, tagged with who it was.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetReport {
    pub id: TargetId,
    pub node: String,
    pub outcome: LaunchOutcome,
}

impl TargetReport {
    pub fn new(target: &LaunchTarget, outcome: LaunchOutcome) -> Self {
        Self {
            id: target.id,
            node: target.node.clone(),
            outcome,
        }
    }
}

/// Options for the remote side of each invocation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteOptions {
    /// Directory to change into before running the daemon.
    pub chdir: Option<String>,
    /// Directory prepended to the remote `LD_LIBRARY_PATH`.
    pub pass_libpath: Option<String>,
    /// Append `--daemonize` to the daemon command.
    pub daemonize: bool,
}

/// Knobs fixed for one launch and handed down to every relay.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSettings {
    /// Invocations allowed in flight at one level.
    pub concurrency: usize,
    /// Minimum spacing between invocation starts at one level.
    pub delay: Option<Duration>,
    /// Launch-tree branching factor; 1 launches every target from the root.
    pub fanout: usize,
    /// Time allowed until a leaf exits or an interior target is ready.
    pub invocation_timeout: Option<Duration>,
    /// Time allowed for the whole launch; expiry cancels it.
    pub job_timeout: Option<Duration>,
    /// Program run on interior targets to take over their subtree.
    pub relay_program: String,
    pub remote: RemoteOptions,
    /// Log verbosity forwarded to relays as `-v` flags.
    #[serde(default)]
    pub verbosity: i32,
}

impl Default for LaunchSettings {
    fn default() -> Self {
        Self {
            concurrency: crate::config::merge::DEFAULT_NUM_CONCURRENT,
            delay: None,
            fanout: crate::config::merge::DEFAULT_FANOUT,
            invocation_timeout: None,
            job_timeout: None,
            relay_program: crate::config::merge::DEFAULT_RELAY_PROGRAM.to_string(),
            remote: RemoteOptions::default(),
            verbosity: 0,
        }
    }
}

impl LaunchSettings {
    /// Settings for launching with `agent` under `config`.
    pub fn from_config(config: &LauncherConfig, agent: &ResolvedAgent) -> Self {
        Self {
            concurrency: config.num_concurrent.max(1),
            delay: config.delay,
            fanout: config.effective_fanout().max(1),
            invocation_timeout: config.invocation_timeout,
            job_timeout: config.job_timeout,
            relay_program: config.relay_program.clone(),
            remote: RemoteOptions {
                chdir: config.chdir.clone(),
                pass_libpath: config.pass_libpath.clone(),
                daemonize: wants_daemonize(
                    agent.mechanism,
                    config.daemonize_qrsh,
                    config.daemonize_llspawn,
                ),
            },
            verbosity: config.verbosity,
        }
    }
}

/// Aggregated result of bringing up one job's daemons.
#[derive(Clone, Debug, Serialize)]
pub struct JobLaunchResult {
    /// Unique identifier for this launch (UUID v4).
    pub job_id: String,
    /// RFC 3339 timestamp of when the launch began.
    pub started_at: String,
    /// Wall-clock duration in seconds.
    pub elapsed_secs: f64,
    /// One report per target, in enumeration order.
    pub reports: Vec<TargetReport>,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// The launch was cancelled before every target finished.
    pub was_cancelled: bool,
    /// Cancellation came from the job timeout.
    pub timed_out: bool,
}

impl JobLaunchResult {
    pub fn from_reports(
        job_id: String,
        started_at: String,
        elapsed: Duration,
        mut reports: Vec<TargetReport>,
        was_cancelled: bool,
        timed_out: bool,
    ) -> Self {
        reports.sort_by_key(|r| r.id);
        let succeeded = reports.iter().filter(|r| r.outcome.is_success()).count();
        let cancelled = reports
            .iter()
            .filter(|r| r.outcome == LaunchOutcome::Cancelled)
            .count();
        let failed = reports.len() - succeeded - cancelled;
        Self {
            job_id,
            started_at,
            elapsed_secs: elapsed.as_secs_f64(),
            reports,
            succeeded,
            failed,
            cancelled,
            was_cancelled,
            timed_out,
        }
    }

    /// Every target came up.
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.cancelled == 0
    }

    /// Reports of failed targets, in enumeration order.
    pub fn failures(&self) -> Vec<&TargetReport> {
        self.reports
            .iter()
            .filter(|r| r.outcome.failure().is_some())
            .collect()
    }

    pub fn outcome_of(&self, id: TargetId) -> Option<&LaunchOutcome> {
        self.reports.iter().find(|r| r.id == id).map(|r| &r.outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(id: TargetId, outcome: LaunchOutcome) -> TargetReport {
        TargetReport {
            id,
            node: format!("n{id}"),
            outcome,
        }
    }

    #[test]
    fn result_counts_and_orders_reports() {
        let result = JobLaunchResult::from_reports(
            "job".into(),
            "now".into(),
            Duration::from_millis(1500),
            vec![
                report(2, LaunchOutcome::Cancelled),
                report(0, LaunchOutcome::Succeeded),
                report(1, LaunchOutcome::failed(FailureReason::Interrupted)),
            ],
            true,
            false,
        );
        assert_eq!(
            result.reports.iter().map(|r| r.id).collect::<Vec<_>>(),
            [0, 1, 2]
        );
        assert_eq!((result.succeeded, result.failed, result.cancelled), (1, 1, 1));
        assert_eq!(result.failures().len(), 1);
        assert_eq!(result.failures()[0].id, 1);
        assert!(!result.is_success());
        assert_eq!(result.elapsed_secs, 1.5);
    }

    #[test]
    fn failure_reasons_render_readably() {
        let reason = FailureReason::NonZeroExit {
            code: Some(255),
            diagnostics: "ssh: connect to host n3 port 22: Connection refused".into(),
        };
        assert_eq!(
            reason.to_string(),
            "agent exited with code 255: ssh: connect to host n3 port 22: Connection refused"
        );
        let signalled = FailureReason::NonZeroExit {
            code: None,
            diagnostics: String::new(),
        };
        assert_eq!(signalled.to_string(), "agent exited with a signal");
        assert_eq!(
            FailureReason::timeout(Duration::from_secs(2)).to_string(),
            "timed out after 2000ms"
        );
    }

    #[test]
    fn outcomes_cross_the_wire_intact() {
        let report = report(
            7,
            LaunchOutcome::failed(FailureReason::ParentFailed { parent: 3 }),
        );
        let line = serde_json::to_string(&report).unwrap();
        let back: TargetReport = serde_json::from_str(&line).unwrap();
        assert_eq!(back, report);
    }

    #[test]
    fn settings_carry_config_verbosity_to_relays() {
        let config = LauncherConfig {
            verbosity: 2,
            ..Default::default()
        };
        let agent = ResolvedAgent::from_candidate(std::path::PathBuf::from("/usr/bin/ssh"), &["ssh"]);
        let settings = LaunchSettings::from_config(&config, &agent);
        assert_eq!(settings.verbosity, 2);

        // Assignments from a relay that predates the field still decode.
        let mut value = serde_json::to_value(&settings).unwrap();
        value.as_object_mut().unwrap().remove("verbosity");
        let back: LaunchSettings = serde_json::from_value(value).unwrap();
        assert_eq!(back.verbosity, 0);
    }
}
