//! Mechanism-specific adjustments to a resolved agent's argv prefix.

use super::types::{Mechanism, ResolvedAgent};

/// Flag asking ssh to forward X11.
pub const X11_ENABLE: &str = "-X";
/// Flag asking ssh not to forward X11.
pub const X11_DISABLE: &str = "-x";

/// Adjust an agent for X11 forwarding and debug output.
///
/// Only ssh-family agents change. When X11 was requested, `-X` is appended
/// unless either spelling is already present. Otherwise, with no debug output
/// requested (`verbosity <= 0`), `-x` is appended unless either spelling is
/// present. Applying this twice gives the same result as applying it once.
pub fn configure(agent: &ResolvedAgent, x11_requested: bool, verbosity: i32) -> ResolvedAgent {
    let mut configured = agent.clone();
    if agent.mechanism != Mechanism::SshFamily {
        return configured;
    }

    let has_x11_flag = agent
        .flags()
        .iter()
        .any(|f| f.eq_ignore_ascii_case(X11_ENABLE));

    if x11_requested {
        if !has_x11_flag {
            configured.argv.push(X11_ENABLE.to_string());
        }
    } else if verbosity <= 0 && !has_x11_flag {
        configured.argv.push(X11_DISABLE.to_string());
    }
    configured
}

/// Append extra agent arguments from configuration.
///
/// The arguments are added as one block, and not at all if the flags already
/// contain that exact sequence.
pub fn with_extra_args(agent: &ResolvedAgent, args: &[String]) -> ResolvedAgent {
    let mut extended = agent.clone();
    if args.is_empty() || agent.flags().windows(args.len()).any(|w| w == args) {
        return extended;
    }
    extended.argv.extend(args.iter().cloned());
    extended
}
