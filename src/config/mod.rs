pub mod merge;
pub mod schema;

pub use merge::parse_delay;
pub use schema::*;

use crate::agent::EnvProvider;
use crate::cli::{AgentArgs, Cli, Commands, LaunchArgs};
use crate::error::ConfigError;
use anyhow::Context;
use std::path::Path;

/// Prefix of environment variables read as a configuration layer.
pub const ENV_PREFIX: &str = "RSHLAUNCH_";

/// Load configuration by merging global, file, environment, and CLI sources.
/// Precedence: CLI > environment > `--config` file > global config > defaults.
///
/// A missing global config is fine; a missing or unparsable `--config` file is an error.
pub fn load_config(cli: &Cli, env: &dyn EnvProvider) -> anyhow::Result<LauncherConfig> {
    load_config_with_global(cli, env, global_config_path().as_deref())
}

/// [`load_config`] with the global config file given explicitly; `None`
/// skips that layer.
pub fn load_config_with_global(
    cli: &Cli,
    env: &dyn EnvProvider,
    global_path: Option<&Path>,
) -> anyhow::Result<LauncherConfig> {
    // Layer 1: Global config (~/.config/rshlaunch/rshlaunch.toml or platform equivalent)
    let global = match global_path {
        Some(path) => load_global_config(path),
        None => {
            tracing::debug!("Could not determine global config directory");
            PartialConfig::default()
        }
    };

    // Layer 2: Explicit config file
    let file = match &cli.config {
        Some(path) => load_explicit_config(path)?,
        None => PartialConfig::default(),
    };

    // Layer 3: Environment
    let env_partial = env_to_partial(env);

    // Layer 4: CLI args
    let cli_partial = cli_to_partial(cli);

    let config = cli_partial
        .with_fallback(env_partial)
        .with_fallback(file)
        .with_fallback(global)
        .finalize();

    Ok(config)
}

/// Load the global config file.
/// Returns empty PartialConfig if the file is missing or unusable.
fn load_global_config(path: &Path) -> PartialConfig {
    match load_toml_file(path) {
        Ok(partial) => partial,
        Err(ConfigError::IoError(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config file at {}, using defaults", path.display());
            PartialConfig::default()
        }
        Err(e) => {
            tracing::warn!("Ignoring global config: {e}");
            PartialConfig::default()
        }
    }
}

fn load_explicit_config(path: &Path) -> anyhow::Result<PartialConfig> {
    load_toml_file(path).with_context(|| format!("Failed to load config at {}", path.display()))
}

/// Load and parse a TOML config file into a PartialConfig.
fn load_toml_file(path: &Path) -> Result<PartialConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    let file: ConfigFile = toml::from_str(&contents).map_err(|e| ConfigError::ParseError {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    tracing::info!("Loaded config from {}", path.display());
    Ok(file.to_partial())
}

/// Resolve the platform-specific global config path.
/// Linux: ~/.config/rshlaunch/rshlaunch.toml
fn global_config_path() -> Option<std::path::PathBuf> {
    directories::ProjectDirs::from("", "", "rshlaunch")
        .map(|dirs| dirs.config_dir().join("rshlaunch.toml"))
}

/// Read the `RSHLAUNCH_*` variables.
pub fn env_to_partial(env: &dyn EnvProvider) -> PartialConfig {
    let get = |name: &str| env.var(&format!("{ENV_PREFIX}{name}"));
    PartialConfig {
        agent: get("AGENT"),
        num_concurrent: get("NUM_CONCURRENT").and_then(|v| match v.trim().parse::<i64>() {
            Ok(n) => Some(n),
            Err(_) => {
                tracing::warn!(value = %v, "Ignoring non-numeric {ENV_PREFIX}NUM_CONCURRENT");
                None
            }
        }),
        delay: get("DELAY"),
        no_tree_spawn: get("NO_TREE_SPAWN").and_then(|v| parse_bool(&v)),
        disable_qrsh: get("DISABLE_QRSH").and_then(|v| parse_bool(&v)),
        disable_llspawn: get("DISABLE_LLSPAWN").and_then(|v| parse_bool(&v)),
        ..Default::default()
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        other => {
            tracing::warn!(value = other, "Ignoring unrecognized boolean");
            None
        }
    }
}

/// Convert CLI arguments to a PartialConfig for merging.
fn cli_to_partial(cli: &Cli) -> PartialConfig {
    let verbosity = (cli.verbose > 0).then(|| i32::from(cli.verbose));
    let base = PartialConfig {
        verbosity,
        ..Default::default()
    };
    match &cli.command {
        Commands::Launch { agent, launch, .. } => {
            agent_to_partial(agent).with_fallback(launch_to_partial(launch)).with_fallback(base)
        }
        Commands::Resolve { agent } => agent_to_partial(agent).with_fallback(base),
        Commands::Topology { fanout, .. } => PartialConfig {
            fanout: *fanout,
            ..base
        },
        Commands::Relay { .. } => base,
    }
}

fn agent_to_partial(args: &AgentArgs) -> PartialConfig {
    PartialConfig {
        agent: args.agent.clone(),
        agent_args: args.agent_args.clone(),
        x11_forwarding: args.x11.then_some(true),
        disable_qrsh: args.disable_qrsh.then_some(true),
        disable_llspawn: args.disable_llspawn.then_some(true),
        ..Default::default()
    }
}

fn launch_to_partial(args: &LaunchArgs) -> PartialConfig {
    PartialConfig {
        num_concurrent: args.num_concurrent,
        delay: args.delay.clone(),
        fanout: args.fanout,
        no_tree_spawn: args.no_tree_spawn.then_some(true),
        timeout_secs: args.timeout,
        job_timeout_secs: args.job_timeout,
        relay_program: args.relay_program.clone(),
        ..Default::default()
    }
}
