//! Shared vocabulary for launch-agent resolution.
//!
//! A [`LaunchAgentSpec`] is what the user (or the defaults) asked for; a
//! [`ResolvedAgent`] is the first candidate of that spec that actually exists
//! on this host, ready to be used as the prefix of every remote invocation.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Default candidate list when nothing else is configured.
pub const DEFAULT_AGENT: &str = "ssh : rsh";

/// Ordered list of candidate launch-agent command lines.
///
/// Parsed from a `:`-delimited string such as `"ssh -p 2222 : rsh"`. Each
/// candidate is trimmed; empty candidates are dropped. The list cannot be
/// changed once built.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LaunchAgentSpec {
    candidates: Vec<String>,
}

impl LaunchAgentSpec {
    pub fn parse(list: &str) -> Self {
        let candidates = list
            .split(':')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect();
        Self { candidates }
    }

    pub fn candidates(&self) -> &[String] {
        &self.candidates
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

impl FromStr for LaunchAgentSpec {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl fmt::Display for LaunchAgentSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.candidates.join(" : "))
    }
}

/// Which family of remote-execution mechanism an agent belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mechanism {
    SshFamily,
    RshFamily,
    GridEngine,
    ResourceManager,
    UserDefined,
}

impl Mechanism {
    /// Tag an agent by the basename of its executable.
    pub fn from_basename(name: &str) -> Self {
        match name {
            "ssh" => Mechanism::SshFamily,
            "rsh" | "remsh" => Mechanism::RshFamily,
            "qrsh" => Mechanism::GridEngine,
            "llspawn" => Mechanism::ResourceManager,
            _ => Mechanism::UserDefined,
        }
    }

    /// Agents whose remote side hands the command line to a login shell.
    pub fn uses_remote_shell(self) -> bool {
        matches!(self, Mechanism::SshFamily | Mechanism::RshFamily)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mechanism::SshFamily => "ssh-family",
            Mechanism::RshFamily => "rsh-family",
            Mechanism::GridEngine => "grid-engine",
            Mechanism::ResourceManager => "resource-manager",
            Mechanism::UserDefined => "user-defined",
        }
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A launch agent located on this host.
///
/// `argv[0]` is the basename of the executable (`ssh`, not `/usr/bin/ssh`);
/// the absolute path used to exec it lives in `path`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedAgent {
    pub path: PathBuf,
    pub argv: Vec<String>,
    pub mechanism: Mechanism,
}

impl ResolvedAgent {
    /// Build from a located executable and the candidate's tokens.
    ///
    /// `tokens[0]` is replaced by the executable's basename; the remaining
    /// tokens are kept as fixed flags.
    pub fn from_candidate(path: PathBuf, tokens: &[&str]) -> Self {
        let basename = basename(&path).unwrap_or_else(|| tokens[0].to_string());
        let mechanism = Mechanism::from_basename(&basename);
        let mut argv = Vec::with_capacity(tokens.len());
        argv.push(basename);
        argv.extend(tokens.iter().skip(1).map(|t| t.to_string()));
        Self {
            path,
            argv,
            mechanism,
        }
    }

    pub fn basename(&self) -> &str {
        self.argv.first().map_or("", String::as_str)
    }

    /// Flags following argv[0].
    pub fn flags(&self) -> &[String] {
        self.argv.get(1..).unwrap_or_default()
    }
}

fn basename(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_trims_and_drops_empty_candidates() {
        let spec = LaunchAgentSpec::parse("  ssh -p 22 : :rsh  : ");
        assert_eq!(spec.candidates(), ["ssh -p 22", "rsh"]);
    }

    #[test]
    fn parse_of_blank_list_is_empty() {
        assert!(LaunchAgentSpec::parse("").is_empty());
        assert!(LaunchAgentSpec::parse(" : :  ").is_empty());
    }

    #[test]
    fn default_agent_lists_ssh_then_rsh() {
        let spec: LaunchAgentSpec = DEFAULT_AGENT.parse().unwrap();
        assert_eq!(spec.candidates(), ["ssh", "rsh"]);
        assert_eq!(spec.to_string(), "ssh : rsh");
    }

    #[test]
    fn from_candidate_replaces_argv0_with_basename() {
        let agent = ResolvedAgent::from_candidate(
            PathBuf::from("/usr/bin/ssh"),
            &["/usr/bin/ssh", "-o", "BatchMode=yes"],
        );
        assert_eq!(agent.argv, ["ssh", "-o", "BatchMode=yes"]);
        assert_eq!(agent.path, PathBuf::from("/usr/bin/ssh"));
        assert_eq!(agent.mechanism, Mechanism::SshFamily);
        assert_eq!(agent.flags(), ["-o", "BatchMode=yes"]);
    }

    #[test]
    fn empty_argv_has_no_basename_or_flags() {
        let agent = ResolvedAgent {
            path: PathBuf::from("/usr/bin/ssh"),
            argv: Vec::new(),
            mechanism: Mechanism::SshFamily,
        };
        assert_eq!(agent.basename(), "");
        assert!(agent.flags().is_empty());
    }

    #[test]
    fn mechanism_tags_follow_basename() {
        assert_eq!(Mechanism::from_basename("rsh"), Mechanism::RshFamily);
        assert_eq!(Mechanism::from_basename("qrsh"), Mechanism::GridEngine);
        assert_eq!(Mechanism::from_basename("llspawn"), Mechanism::ResourceManager);
        assert_eq!(Mechanism::from_basename("my-launcher"), Mechanism::UserDefined);
    }
}
