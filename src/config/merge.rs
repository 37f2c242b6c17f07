use super::schema::{LauncherConfig, PartialConfig};
use crate::agent::DEFAULT_AGENT;
use std::time::Duration;

/// Default number of agent invocations in flight per launching process.
pub const DEFAULT_NUM_CONCURRENT: usize = 128;
/// Default branching factor of the launch tree.
pub const DEFAULT_FANOUT: usize = 64;
/// Program run on interior tree nodes to take over their subtree.
pub const DEFAULT_RELAY_PROGRAM: &str = "rshlaunch";

impl PartialConfig {
    /// Merge self with a lower-priority fallback.
    /// Self's non-None values take precedence.
    pub fn with_fallback(self, fallback: PartialConfig) -> PartialConfig {
        PartialConfig {
            agent: self.agent.or(fallback.agent),
            agent_args: self.agent_args.or(fallback.agent_args),
            num_concurrent: self.num_concurrent.or(fallback.num_concurrent),
            delay: self.delay.or(fallback.delay),
            fanout: self.fanout.or(fallback.fanout),
            no_tree_spawn: self.no_tree_spawn.or(fallback.no_tree_spawn),
            disable_qrsh: self.disable_qrsh.or(fallback.disable_qrsh),
            disable_llspawn: self.disable_llspawn.or(fallback.disable_llspawn),
            daemonize_qrsh: self.daemonize_qrsh.or(fallback.daemonize_qrsh),
            daemonize_llspawn: self.daemonize_llspawn.or(fallback.daemonize_llspawn),
            x11_forwarding: self.x11_forwarding.or(fallback.x11_forwarding),
            verbosity: self.verbosity.or(fallback.verbosity),
            timeout_secs: self.timeout_secs.or(fallback.timeout_secs),
            job_timeout_secs: self.job_timeout_secs.or(fallback.job_timeout_secs),
            relay_program: self.relay_program.or(fallback.relay_program),
            chdir: self.chdir.or(fallback.chdir),
            pass_libpath: self.pass_libpath.or(fallback.pass_libpath),
        }
    }

    /// Convert to LauncherConfig, filling any remaining gaps with defaults.
    ///
    /// Out-of-range values are corrected with a warning rather than rejected.
    pub fn finalize(self) -> LauncherConfig {
        let num_concurrent = match self.num_concurrent {
            None => DEFAULT_NUM_CONCURRENT,
            Some(n) if n <= 0 => {
                tracing::warn!(
                    num_concurrent = n,
                    "Concurrency limit must be greater than zero; using 1"
                );
                1
            }
            Some(n) => usize::try_from(n).unwrap_or(usize::MAX),
        };

        let fanout = match self.fanout {
            None => DEFAULT_FANOUT,
            Some(n) if n <= 0 => {
                tracing::warn!(fanout = n, "Fan-out must be greater than zero; launching flat");
                1
            }
            Some(n) => usize::try_from(n).unwrap_or(usize::MAX),
        };

        let delay = self.delay.as_deref().and_then(parse_delay);

        LauncherConfig {
            agent_explicit: self.agent.is_some(),
            agent: self.agent.unwrap_or_else(|| DEFAULT_AGENT.to_string()),
            agent_args: self
                .agent_args
                .map(|a| a.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            num_concurrent,
            delay,
            fanout,
            no_tree_spawn: self.no_tree_spawn.unwrap_or(false),
            disable_qrsh: self.disable_qrsh.unwrap_or(false),
            disable_llspawn: self.disable_llspawn.unwrap_or(false),
            daemonize_qrsh: self.daemonize_qrsh.unwrap_or(false),
            daemonize_llspawn: self.daemonize_llspawn.unwrap_or(false),
            x11_forwarding: self.x11_forwarding.unwrap_or(false),
            verbosity: self.verbosity.unwrap_or(0),
            invocation_timeout: self.timeout_secs.filter(|s| *s > 0).map(Duration::from_secs),
            job_timeout: self.job_timeout_secs.filter(|s| *s > 0).map(Duration::from_secs),
            relay_program: self
                .relay_program
                .unwrap_or_else(|| DEFAULT_RELAY_PROGRAM.to_string()),
            chdir: self.chdir,
            pass_libpath: self.pass_libpath,
        }
    }
}

/// Parse an inter-launch delay of the form `sec[:usec]`.
///
/// A seconds field that is not a number counts as zero; a zero delay means
/// no delay at all.
pub fn parse_delay(value: &str) -> Option<Duration> {
    let value = value.trim();
    let (secs, usecs) = match value.split_once(':') {
        Some((s, u)) => (s, Some(u)),
        None => (value, None),
    };

    let secs = match secs.trim().parse::<u64>() {
        Ok(s) => s,
        Err(_) => {
            if !secs.trim().is_empty() {
                tracing::warn!(delay = %value, "Invalid seconds in launch delay; using 0");
            }
            0
        }
    };
    let usecs = match usecs.map(|u| u.trim().parse::<u64>()) {
        None => 0,
        Some(Ok(u)) => u,
        Some(Err(_)) => {
            tracing::warn!(delay = %value, "Invalid microseconds in launch delay; using 0");
            0
        }
    };

    let delay = Duration::from_secs(secs) + Duration::from_micros(usecs);
    (!delay.is_zero()).then_some(delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = PartialConfig::default().finalize();
        assert_eq!(config.agent, "ssh : rsh");
        assert!(!config.agent_explicit);
        assert_eq!(config.num_concurrent, 128);
        assert_eq!(config.fanout, 64);
        assert_eq!(config.delay, None);
        assert_eq!(config.relay_program, "rshlaunch");
        assert_eq!(config.effective_fanout(), 64);
    }

    #[test]
    fn non_positive_concurrency_is_corrected_to_one() {
        for n in [0, -5] {
            let config = PartialConfig {
                num_concurrent: Some(n),
                ..Default::default()
            }
            .finalize();
            assert_eq!(config.num_concurrent, 1);
        }
    }

    #[test]
    fn any_layer_setting_agent_makes_it_explicit() {
        let config = PartialConfig::default()
            .with_fallback(PartialConfig {
                agent: Some("rsh".into()),
                ..Default::default()
            })
            .finalize();
        assert!(config.agent_explicit);
        assert_eq!(config.agent, "rsh");
    }

    #[test]
    fn higher_layer_wins() {
        let cli = PartialConfig {
            num_concurrent: Some(8),
            ..Default::default()
        };
        let file = PartialConfig {
            num_concurrent: Some(64),
            delay: Some("2".into()),
            ..Default::default()
        };
        let config = cli.with_fallback(file).finalize();
        assert_eq!(config.num_concurrent, 8);
        assert_eq!(config.delay, Some(Duration::from_secs(2)));
    }

    #[test]
    fn no_tree_spawn_forces_flat_launch() {
        let config = PartialConfig {
            no_tree_spawn: Some(true),
            fanout: Some(16),
            ..Default::default()
        }
        .finalize();
        assert_eq!(config.effective_fanout(), 1);
    }

    #[test]
    fn agent_args_are_split_on_whitespace() {
        let config = PartialConfig {
            agent_args: Some("-o BatchMode=yes  -q".into()),
            ..Default::default()
        }
        .finalize();
        assert_eq!(config.agent_args, ["-o", "BatchMode=yes", "-q"]);
    }

    #[test]
    fn parse_delay_accepts_seconds_and_microseconds() {
        assert_eq!(parse_delay("3"), Some(Duration::from_secs(3)));
        assert_eq!(
            parse_delay("1:500000"),
            Some(Duration::from_secs(1) + Duration::from_micros(500_000))
        );
        assert_eq!(parse_delay("0:250"), Some(Duration::from_micros(250)));
    }

    #[test]
    fn parse_delay_treats_zero_and_garbage_as_none() {
        assert_eq!(parse_delay("0"), None);
        assert_eq!(parse_delay("0:0"), None);
        assert_eq!(parse_delay("soon"), None);
        assert_eq!(parse_delay(""), None);
    }

    #[test]
    fn zero_timeouts_mean_no_timeout() {
        let config = PartialConfig {
            timeout_secs: Some(0),
            job_timeout_secs: Some(30),
            ..Default::default()
        }
        .finalize();
        assert_eq!(config.invocation_timeout, None);
        assert_eq!(config.job_timeout, Some(Duration::from_secs(30)));
    }
}
