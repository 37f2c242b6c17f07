//! Argument vectors for agent invocations.

use crate::agent::{Mechanism, ResolvedAgent};

use super::types::{LaunchSettings, LaunchTarget, RemoteOptions};

/// Flag appended to the daemon command when the launcher should detach it.
pub const DAEMONIZE_FLAG: &str = "--daemonize";

/// Build the full argv for launching `target`.
///
/// Shape: `<agent argv> <node> [preamble] [relay wrapper] <daemon command> [--daemonize]`.
/// The relay wrapper is added when the target is responsible for a subtree.
pub fn build_argv(
    agent: &ResolvedAgent,
    target: &LaunchTarget,
    relays_subtree: bool,
    settings: &LaunchSettings,
) -> Vec<String> {
    let mut argv = agent.argv.clone();
    argv.push(target.node.clone());

    if agent.mechanism.uses_remote_shell() {
        argv.extend(remote_preamble(&settings.remote));
    }

    if relays_subtree {
        argv.extend([settings.relay_program.clone(), "relay".to_string()]);
        if let Some(flag) = verbosity_flag(settings.verbosity) {
            argv.push(flag);
        }
        argv.extend([
            "--node".to_string(),
            target.node.clone(),
            "--".to_string(),
        ]);
    }

    argv.extend(target.command.iter().cloned());

    if settings.remote.daemonize {
        argv.push(DAEMONIZE_FLAG.to_string());
    }
    argv
}

/// `-v` repeated `verbosity` times, so a relay logs at its root's level.
fn verbosity_flag(verbosity: i32) -> Option<String> {
    let count = usize::try_from(verbosity).ok().filter(|&n| n > 0)?;
    Some(format!("-{}", "v".repeat(count.min(usize::from(u8::MAX)))))
}

/// Shell words run before the daemon on agents that go through a remote shell.
fn remote_preamble(remote: &RemoteOptions) -> Vec<String> {
    let mut words = Vec::new();
    if let Some(dir) = &remote.chdir {
        words.extend(["cd".to_string(), dir.clone(), "&&".to_string()]);
    }
    if let Some(libpath) = &remote.pass_libpath {
        words.extend([
            "env".to_string(),
            format!("LD_LIBRARY_PATH={libpath}:$LD_LIBRARY_PATH"),
        ]);
    }
    words
}

/// Whether the daemon should be told to detach for this agent.
pub fn wants_daemonize(mechanism: Mechanism, daemonize_qrsh: bool, daemonize_llspawn: bool) -> bool {
    match mechanism {
        Mechanism::GridEngine => daemonize_qrsh,
        Mechanism::ResourceManager => daemonize_llspawn,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn ssh() -> ResolvedAgent {
        ResolvedAgent::from_candidate(PathBuf::from("/usr/bin/ssh"), &["ssh", "-x"])
    }

    fn target() -> LaunchTarget {
        LaunchTarget::new("node7", vec!["prted".into(), "--debug".into()])
    }

    #[test]
    fn leaf_argv_has_documented_shape() {
        let argv = build_argv(&ssh(), &target(), false, &LaunchSettings::default());
        assert_eq!(argv, ["ssh", "-x", "node7", "prted", "--debug"]);
    }

    #[test]
    fn interior_target_is_wrapped_in_relay() {
        let settings = LaunchSettings {
            relay_program: "/opt/bin/rshlaunch".into(),
            ..Default::default()
        };
        let argv = build_argv(&ssh(), &target(), true, &settings);
        assert_eq!(
            argv,
            [
                "ssh", "-x", "node7", "/opt/bin/rshlaunch", "relay", "--node", "node7", "--",
                "prted", "--debug"
            ]
        );
    }

    #[test]
    fn relay_inherits_verbosity() {
        let settings = LaunchSettings {
            relay_program: "rshlaunch".into(),
            verbosity: 2,
            ..Default::default()
        };
        let argv = build_argv(&ssh(), &target(), true, &settings);
        assert_eq!(
            argv,
            [
                "ssh", "-x", "node7", "rshlaunch", "relay", "-vv", "--node", "node7", "--",
                "prted", "--debug"
            ]
        );
        // Leaves never see it.
        let argv = build_argv(&ssh(), &target(), false, &settings);
        assert_eq!(argv, ["ssh", "-x", "node7", "prted", "--debug"]);
    }

    #[test]
    fn remote_shell_preamble_precedes_command() {
        let settings = LaunchSettings {
            remote: RemoteOptions {
                chdir: Some("/scratch".into()),
                pass_libpath: Some("/opt/lib".into()),
                daemonize: false,
            },
            ..Default::default()
        };
        let argv = build_argv(&ssh(), &target(), false, &settings);
        assert_eq!(
            argv,
            [
                "ssh", "-x", "node7", "cd", "/scratch", "&&", "env",
                "LD_LIBRARY_PATH=/opt/lib:$LD_LIBRARY_PATH", "prted", "--debug"
            ]
        );
    }

    #[test]
    fn non_shell_agents_skip_preamble_but_can_daemonize() {
        let qrsh = ResolvedAgent::from_candidate(
            PathBuf::from("/opt/sge/bin/lx-amd64/qrsh"),
            &["qrsh", "-inherit", "-V"],
        );
        let settings = LaunchSettings {
            remote: RemoteOptions {
                chdir: Some("/scratch".into()),
                pass_libpath: None,
                daemonize: true,
            },
            ..Default::default()
        };
        let argv = build_argv(&qrsh, &target(), false, &settings);
        assert_eq!(
            argv,
            ["qrsh", "-inherit", "-V", "node7", "prted", "--debug", "--daemonize"]
        );
    }

    #[test]
    fn daemonize_follows_mechanism() {
        assert!(wants_daemonize(Mechanism::GridEngine, true, false));
        assert!(!wants_daemonize(Mechanism::GridEngine, false, true));
        assert!(wants_daemonize(Mechanism::ResourceManager, false, true));
        assert!(!wants_daemonize(Mechanism::SshFamily, true, true));
    }
}
