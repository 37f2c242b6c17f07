//! Cluster environment detection.
//!
//! Grid-engine and resource-manager allocations each mandate their own launch
//! agent. The markers are read through [`EnvProvider`] so callers and tests
//! can supply an environment without touching the real process one.

use std::collections::HashMap;
use std::path::PathBuf;

/// Grid-engine installation root.
pub const SGE_ROOT: &str = "SGE_ROOT";
/// Grid-engine architecture string (`lx-amd64`, ...).
pub const SGE_ARC: &str = "ARC";
/// Grid-engine parallel-environment host file.
pub const SGE_PE_HOSTFILE: &str = "PE_HOSTFILE";
/// Grid-engine job id.
pub const SGE_JOB_ID: &str = "JOB_ID";
/// Resource-manager job step id.
pub const LOADL_STEP_ID: &str = "LOADL_STEP_ID";

/// Launcher used inside a grid-engine allocation.
pub const GRID_ENGINE_AGENT: &str = "qrsh -inherit -V";
/// Launcher used inside a resource-manager job step.
pub const RESOURCE_MANAGER_AGENT: &str = "llspawn";

/// Read access to environment variables.
pub trait EnvProvider {
    fn var(&self, key: &str) -> Option<String>;
}

/// The real process environment.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessEnv;

impl EnvProvider for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var_os(key).map(|v| v.to_string_lossy().into_owned())
    }
}

/// A fixed set of variables, for tests and for callers that build their own.
#[derive(Clone, Debug, Default)]
pub struct MapEnv {
    vars: HashMap<String, String>,
}

impl MapEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.vars.insert(key.to_string(), value.into());
        self
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MapEnv {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            vars: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

impl EnvProvider for MapEnv {
    fn var(&self, key: &str) -> Option<String> {
        self.vars.get(key).cloned()
    }
}

/// Which scheduler context, if any, this process runs under.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClusterEnvironmentHint {
    None,
    GridEngine { root: PathBuf, arch: String },
    ResourceManager,
}

impl ClusterEnvironmentHint {
    /// The agent this environment mandates and the directory list to search
    /// for it (`None` = the normal `PATH`).
    pub fn mandated_agent(&self) -> Option<(&'static str, Option<PathBuf>)> {
        match self {
            ClusterEnvironmentHint::None => None,
            ClusterEnvironmentHint::GridEngine { root, arch } => {
                Some((GRID_ENGINE_AGENT, Some(root.join("bin").join(arch))))
            }
            ClusterEnvironmentHint::ResourceManager => Some((RESOURCE_MANAGER_AGENT, None)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClusterEnvironmentHint::None => "generic",
            ClusterEnvironmentHint::GridEngine { .. } => "grid-engine",
            ClusterEnvironmentHint::ResourceManager => "resource-manager",
        }
    }
}

/// Which detections the user has switched off.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DetectionPolicy {
    pub disable_grid_engine: bool,
    pub disable_resource_manager: bool,
}

/// Classify the ambient environment.
///
/// Grid engine is checked first and needs all four of its markers; the
/// resource manager needs its step id. The first match wins.
pub fn classify(env: &dyn EnvProvider, policy: DetectionPolicy) -> ClusterEnvironmentHint {
    if !policy.disable_grid_engine {
        let root = env.var(SGE_ROOT);
        let arch = env.var(SGE_ARC);
        let hostfile = env.var(SGE_PE_HOSTFILE);
        let job_id = env.var(SGE_JOB_ID);
        if let (Some(root), Some(arch), Some(_), Some(_)) = (root, arch, hostfile, job_id) {
            tracing::debug!(root = %root, arch = %arch, "Grid engine allocation detected");
            return ClusterEnvironmentHint::GridEngine {
                root: PathBuf::from(root),
                arch,
            };
        }
    }

    if !policy.disable_resource_manager && env.var(LOADL_STEP_ID).is_some() {
        tracing::debug!("Resource manager job step detected");
        return ClusterEnvironmentHint::ResourceManager;
    }

    ClusterEnvironmentHint::None
}
