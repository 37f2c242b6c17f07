//! Launch-agent selection.
//!
//! Decides which remote-execution mechanism this process will use and turns
//! it into a [`ResolvedAgent`]: an explicitly configured agent is honored or
//! the run fails; otherwise the cluster environment may mandate grid-engine or
//! resource-manager launching; otherwise the generic candidate list is tried.

pub mod configure;
pub mod environment;
pub mod locator;
pub mod types;

pub use configure::configure;
pub use environment::{ClusterEnvironmentHint, DetectionPolicy, EnvProvider, MapEnv, ProcessEnv};
pub use locator::resolve;
pub use types::{LaunchAgentSpec, Mechanism, ResolvedAgent, DEFAULT_AGENT};

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::config::LauncherConfig;
use crate::error::SelectionError;

/// The agent chosen for this process and the environment that led to it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentSelection {
    pub agent: ResolvedAgent,
    pub environment: ClusterEnvironmentHint,
}

/// Select and configure the launch agent.
///
/// Returns [`SelectionError::AgentNotFound`] (fatal) when an explicitly
/// configured agent cannot be located, and [`SelectionError::Unavailable`]
/// (non-fatal) when the environment-mandated or default agent is missing.
/// A mandated agent that is missing never falls back to the generic list.
pub fn select_launch_agent(
    config: &LauncherConfig,
    env: &dyn EnvProvider,
    cwd: &Path,
) -> Result<AgentSelection, SelectionError> {
    let path_var = env.var("PATH").map(OsString::from).unwrap_or_default();

    if config.agent_explicit {
        let spec = LaunchAgentSpec::parse(&config.agent);
        let agent = locator::resolve(&spec, Some(&path_var), cwd).ok_or_else(|| {
            tracing::error!(agent = %config.agent, "Requested launch agent not found");
            SelectionError::AgentNotFound {
                agent: config.agent.clone(),
            }
        })?;
        return Ok(finish(agent, ClusterEnvironmentHint::None, config));
    }

    let environment = environment::classify(env, config.detection_policy());
    let (spec, search_path) = match environment.mandated_agent() {
        Some((mandated, Some(dir))) => (LaunchAgentSpec::parse(mandated), dir.into_os_string()),
        Some((mandated, None)) => (LaunchAgentSpec::parse(mandated), path_var),
        None => (LaunchAgentSpec::parse(&config.agent), path_var),
    };

    match locator::resolve(&spec, Some(&search_path), cwd) {
        Some(agent) => Ok(finish(agent, environment, config)),
        None => {
            let reason = format!(
                "cannot find an executable for `{spec}` in {}",
                describe_search_path(&search_path)
            );
            tracing::debug!(mechanism = environment.name(), %reason, "Launch agent unavailable");
            Err(SelectionError::Unavailable {
                mechanism: environment.name().to_string(),
                reason,
            })
        }
    }
}

fn finish(
    agent: ResolvedAgent,
    environment: ClusterEnvironmentHint,
    config: &LauncherConfig,
) -> AgentSelection {
    // Extra args first, so a user-supplied -X or -x suppresses the default.
    let agent = configure::with_extra_args(&agent, &config.agent_args);
    let agent = configure::configure(&agent, config.x11_forwarding, config.verbosity);
    tracing::info!(
        mechanism = %agent.mechanism,
        path = %agent.path.display(),
        argv = ?agent.argv,
        environment = environment.name(),
        "Launch agent selected"
    );
    AgentSelection { agent, environment }
}

fn describe_search_path(search_path: &std::ffi::OsStr) -> String {
    if search_path.is_empty() {
        return "an empty search path".to_string();
    }
    let dirs: Vec<PathBuf> = std::env::split_paths(search_path).collect();
    format!(
        "[{}]",
        dirs.iter()
            .map(|d| d.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    )
}
