use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

use rshlaunch::agent::{self, AgentSelection, ProcessEnv};
use rshlaunch::cli::{Cli, Commands};
use rshlaunch::config::{self, LauncherConfig};
use rshlaunch::error::SelectionError;
use rshlaunch::hosts;
use rshlaunch::orchestration::relay::run_relay;
use rshlaunch::orchestration::{
    JobLaunchResult, LaunchOutcome, LaunchSettings, LaunchTarget, LaunchTopology, Launcher,
    ProcessInvoker, SubtreePlan,
};

/// Exit status when no launch mechanism is usable in this environment.
const EXIT_UNAVAILABLE: i32 = 2;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr: a relay's stdout is its protocol channel.
    let level = if cli.verbose > 0 {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .init();

    let config = config::load_config(&cli, &ProcessEnv)?;
    tracing::debug!(
        agent = %config.agent,
        num_concurrent = config.num_concurrent,
        fanout = config.effective_fanout(),
        "Config loaded"
    );

    match cli.command {
        Commands::Launch {
            hosts: host_list,
            hostfile,
            daemon,
            ..
        } => {
            let selection = select(&config)?;
            let nodes = hosts::collect_hosts(&host_list, hostfile.as_deref())?;
            if nodes.is_empty() {
                anyhow::bail!("no target nodes given (use --hosts or --hostfile)");
            }
            let targets: Vec<LaunchTarget> = nodes
                .into_iter()
                .map(|node| LaunchTarget::new(node, daemon.clone()))
                .collect();

            let settings = LaunchSettings::from_config(&config, &selection.agent);
            let launcher = Launcher::new(selection.agent, settings, ProcessInvoker::new());
            let cancel = CancellationToken::new();
            spawn_interrupt_handler(cancel.clone());

            let result = launcher.launch(targets, &cancel).await;
            print_summary(&result);
            if !result.is_success() {
                anyhow::bail!(
                    "{} of {} targets did not launch",
                    result.failed + result.cancelled,
                    result.reports.len()
                );
            }
        }
        Commands::Resolve { .. } => {
            let selection = select(&config)?;
            println!("environment: {}", selection.environment.name());
            println!("mechanism:   {}", selection.agent.mechanism);
            println!("path:        {}", selection.agent.path.display());
            println!("argv:        {}", selection.agent.argv.join(" "));
        }
        Commands::Topology { nodes, .. } => {
            let targets = (0..nodes)
                .map(|i| LaunchTarget::new(format!("node{i}"), Vec::new()))
                .collect();
            let topology = LaunchTopology::build(targets, config.effective_fanout());
            print_topology(&topology);
        }
        Commands::Relay { node, daemon } => {
            let cancel = CancellationToken::new();
            spawn_interrupt_handler(cancel.clone());
            run_relay(&node, &daemon, cancel).await?;
        }
    }

    Ok(())
}

/// Select the agent, exiting with [`EXIT_UNAVAILABLE`] when no mechanism is usable.
fn select(config: &LauncherConfig) -> anyhow::Result<AgentSelection> {
    let cwd = std::env::current_dir()?;
    match agent::select_launch_agent(config, &ProcessEnv, &cwd) {
        Ok(selection) => Ok(selection),
        Err(e @ SelectionError::AgentNotFound { .. }) => Err(e.into()),
        Err(e @ SelectionError::Unavailable { .. }) => {
            println!("unavailable: {e}");
            std::process::exit(EXIT_UNAVAILABLE);
        }
    }
}

/// Cancel `token` on Ctrl-C, SIGTERM or SIGHUP.
///
/// SIGHUP matters for relays: it is what a remote shell delivers when the
/// connection to the parent drops.
fn spawn_interrupt_handler(token: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if result.is_err() {
                    return;
                }
            }
            () = signalled(SignalKind::terminate()) => {}
            () = signalled(SignalKind::hangup()) => {}
        }
        tracing::warn!("Interrupted; cancelling launch");
        token.cancel();
    });
}

/// Resolve on the first delivery of `kind`, or never if it cannot be watched.
async fn signalled(kind: SignalKind) {
    match signal(kind) {
        Ok(mut sig) => {
            sig.recv().await;
        }
        Err(_) => std::future::pending::<()>().await,
    }
}

fn print_summary(result: &JobLaunchResult) {
    for report in &result.reports {
        match &report.outcome {
            LaunchOutcome::Succeeded => println!("  ok        {}", report.node),
            LaunchOutcome::Failed { reason } => println!("  FAILED    {}: {reason}", report.node),
            LaunchOutcome::Cancelled => println!("  cancelled {}", report.node),
        }
    }
    let mut line = format!(
        "{} launched, {} failed, {} cancelled in {:.2}s",
        result.succeeded, result.failed, result.cancelled, result.elapsed_secs
    );
    if result.timed_out {
        line.push_str(" (job timeout)");
    } else if result.was_cancelled {
        line.push_str(" (interrupted)");
    }
    println!("{line}");
}

fn print_topology(topology: &LaunchTopology) {
    println!(
        "{} nodes, fan-out {}, depth {}",
        topology.len(),
        topology.fanout(),
        topology.depth()
    );
    for plan in topology.clone().into_plans() {
        print_plan(&plan, 1);
    }
}

fn print_plan(plan: &SubtreePlan, indent: usize) {
    println!("{}{}", "  ".repeat(indent), plan.target.node);
    for child in &plan.children {
        print_plan(child, indent + 1);
    }
}
