use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "rshlaunch", version, about = "Start runtime daemons on remote nodes")]
pub struct Cli {
    /// Path to config file (in addition to the global one)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Increase diagnostic output (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start one daemon on every listed node
    Launch {
        #[command(flatten)]
        agent: AgentArgs,

        #[command(flatten)]
        launch: LaunchArgs,

        /// Comma-separated target nodes
        #[arg(long, value_delimiter = ',')]
        hosts: Vec<String>,

        /// File with one target node per line
        #[arg(long)]
        hostfile: Option<PathBuf>,

        /// Daemon command line to run on each node
        #[arg(last = true, required = true)]
        daemon: Vec<String>,
    },
    /// Show which launch agent would be used
    Resolve {
        #[command(flatten)]
        agent: AgentArgs,
    },
    /// Print the launch tree for a node count
    Topology {
        /// Number of target nodes
        #[arg(long)]
        nodes: usize,

        /// Tree branching factor (1 = flat)
        #[arg(long)]
        fanout: Option<i64>,
    },
    /// Start the local daemon, then launch the subtree assigned by the parent
    #[command(hide = true)]
    Relay {
        /// Name of this node in the launch tree
        #[arg(long)]
        node: String,

        /// Daemon command line for this node
        #[arg(last = true)]
        daemon: Vec<String>,
    },
}

/// Options controlling launch-agent selection.
#[derive(Args, Debug, Default, Clone)]
pub struct AgentArgs {
    /// Launch agent candidates, e.g. "ssh : rsh"
    #[arg(long)]
    pub agent: Option<String>,

    /// Extra arguments appended to the launch agent
    #[arg(long, allow_hyphen_values = true)]
    pub agent_args: Option<String>,

    /// Forward X11 through ssh-family agents
    #[arg(long)]
    pub x11: bool,

    /// Do not use qrsh inside a grid engine allocation
    #[arg(long)]
    pub disable_qrsh: bool,

    /// Do not use llspawn inside a resource manager job step
    #[arg(long)]
    pub disable_llspawn: bool,
}

/// Options controlling the launch itself.
#[derive(Args, Debug, Default, Clone)]
pub struct LaunchArgs {
    /// Agent invocations allowed in flight at once (must be > 0)
    #[arg(long, allow_negative_numbers = true)]
    pub num_concurrent: Option<i64>,

    /// Delay between agent invocations, sec[:usec]
    #[arg(long)]
    pub delay: Option<String>,

    /// Launch tree branching factor
    #[arg(long, allow_negative_numbers = true)]
    pub fanout: Option<i64>,

    /// Launch every node directly from this process
    #[arg(long)]
    pub no_tree_spawn: bool,

    /// Per-invocation timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Timeout for the whole launch in seconds
    #[arg(long)]
    pub job_timeout: Option<u64>,

    /// Program run on interior tree nodes
    #[arg(long)]
    pub relay_program: Option<String>,
}
