use serde::Deserialize;
use std::time::Duration;

use crate::agent::DetectionPolicy;

/// The TOML file structure for rshlaunch.toml.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    pub agent: Option<AgentConfig>,
    pub launch: Option<LaunchConfig>,
    pub remote: Option<RemoteConfig>,
}

#[derive(Debug, Deserialize)]
pub struct AgentConfig {
    /// Colon-delimited candidate list, e.g. "ssh -p 2222 : rsh".
    pub command: Option<String>,
    /// Extra arguments appended to the resolved agent.
    pub args: Option<String>,
    pub x11: Option<bool>,
    pub disable_qrsh: Option<bool>,
    pub disable_llspawn: Option<bool>,
    pub daemonize_qrsh: Option<bool>,
    pub daemonize_llspawn: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct LaunchConfig {
    pub num_concurrent: Option<i64>,
    /// `sec[:usec]`
    pub delay: Option<String>,
    pub fanout: Option<i64>,
    pub no_tree_spawn: Option<bool>,
    pub timeout_secs: Option<u64>,
    pub job_timeout_secs: Option<u64>,
    pub relay_program: Option<String>,
    pub verbosity: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct RemoteConfig {
    pub chdir: Option<String>,
    pub pass_libpath: Option<String>,
}

/// Fully-resolved launcher configuration. All fields have values.
#[derive(Debug, Clone, PartialEq)]
pub struct LauncherConfig {
    pub agent: String,
    /// Whether any layer set `agent` (as opposed to the built-in default).
    pub agent_explicit: bool,
    pub agent_args: Vec<String>,
    pub num_concurrent: usize,
    pub delay: Option<Duration>,
    pub fanout: usize,
    pub no_tree_spawn: bool,
    pub disable_qrsh: bool,
    pub disable_llspawn: bool,
    pub daemonize_qrsh: bool,
    pub daemonize_llspawn: bool,
    pub x11_forwarding: bool,
    pub verbosity: i32,
    pub invocation_timeout: Option<Duration>,
    pub job_timeout: Option<Duration>,
    pub relay_program: String,
    pub chdir: Option<String>,
    pub pass_libpath: Option<String>,
}

impl LauncherConfig {
    pub fn detection_policy(&self) -> DetectionPolicy {
        DetectionPolicy {
            disable_grid_engine: self.disable_qrsh,
            disable_resource_manager: self.disable_llspawn,
        }
    }

    /// Fan-out actually used for the launch tree; 1 means flat.
    pub fn effective_fanout(&self) -> usize {
        if self.no_tree_spawn { 1 } else { self.fanout }
    }
}

impl Default for LauncherConfig {
    fn default() -> Self {
        PartialConfig::default().finalize()
    }
}

/// Partial config used during merge. All fields are Option so that
/// missing fields don't override lower-priority values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialConfig {
    pub agent: Option<String>,
    pub agent_args: Option<String>,
    pub num_concurrent: Option<i64>,
    pub delay: Option<String>,
    pub fanout: Option<i64>,
    pub no_tree_spawn: Option<bool>,
    pub disable_qrsh: Option<bool>,
    pub disable_llspawn: Option<bool>,
    pub daemonize_qrsh: Option<bool>,
    pub daemonize_llspawn: Option<bool>,
    pub x11_forwarding: Option<bool>,
    pub verbosity: Option<i32>,
    pub timeout_secs: Option<u64>,
    pub job_timeout_secs: Option<u64>,
    pub relay_program: Option<String>,
    pub chdir: Option<String>,
    pub pass_libpath: Option<String>,
}

impl ConfigFile {
    pub fn to_partial(self) -> PartialConfig {
        let agent = self.agent;
        let launch = self.launch;
        let remote = self.remote;
        PartialConfig {
            agent: agent.as_ref().and_then(|a| a.command.clone()),
            agent_args: agent.as_ref().and_then(|a| a.args.clone()),
            x11_forwarding: agent.as_ref().and_then(|a| a.x11),
            disable_qrsh: agent.as_ref().and_then(|a| a.disable_qrsh),
            disable_llspawn: agent.as_ref().and_then(|a| a.disable_llspawn),
            daemonize_qrsh: agent.as_ref().and_then(|a| a.daemonize_qrsh),
            daemonize_llspawn: agent.as_ref().and_then(|a| a.daemonize_llspawn),
            num_concurrent: launch.as_ref().and_then(|l| l.num_concurrent),
            delay: launch.as_ref().and_then(|l| l.delay.clone()),
            fanout: launch.as_ref().and_then(|l| l.fanout),
            no_tree_spawn: launch.as_ref().and_then(|l| l.no_tree_spawn),
            timeout_secs: launch.as_ref().and_then(|l| l.timeout_secs),
            job_timeout_secs: launch.as_ref().and_then(|l| l.job_timeout_secs),
            relay_program: launch.as_ref().and_then(|l| l.relay_program.clone()),
            verbosity: launch.as_ref().and_then(|l| l.verbosity),
            chdir: remote.as_ref().and_then(|r| r.chdir.clone()),
            pass_libpath: remote.as_ref().and_then(|r| r.pass_libpath.clone()),
        }
    }
}
