//! Bounded, tree-shaped daemon launch.
//!
//! [`Launcher`] turns a job's targets into a [`LaunchTopology`] and runs the
//! same level algorithm at the root and, through relays, at every interior
//! node: start invocations in enumeration order, keep at most `concurrency`
//! of them in flight, space starts by the configured delay, and collect one
//! [`TargetReport`] per target. A fan-out of 1 is just a tree whose plans
//! have no children.
//!
//! **Cancellation model:** the caller's [`CancellationToken`] (or the job
//! timeout, through a child token) stops new starts immediately. In-flight
//! invocations are handed the same token and terminate their children;
//! targets that were never started are reported as [`LaunchOutcome::Cancelled`].

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use futures::future::{FutureExt, LocalBoxFuture};
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::command::build_argv;
use super::protocol::SubtreeAssignment;
use super::topology::{LaunchTopology, SubtreePlan};
use super::types::{
    FailureReason, JobLaunchResult, LaunchOutcome, LaunchSettings, LaunchTarget, TargetReport,
};
use crate::agent::ResolvedAgent;

/// Everything needed to start one agent invocation.
#[derive(Clone, Debug)]
pub struct Invocation {
    pub target: LaunchTarget,
    /// Executable to run (the agent's absolute path).
    pub program: PathBuf,
    /// Full argument vector; `argv[0]` is the agent basename.
    pub argv: Vec<String>,
    /// Subtree the target must launch once ready, if any.
    pub assignment: Option<SubtreeAssignment>,
    pub timeout: Option<Duration>,
}

/// What an invocation produced: the target's own outcome plus whatever its
/// relay reported for descendants.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvocationReport {
    pub outcome: LaunchOutcome,
    pub descendants: Vec<TargetReport>,
}

impl InvocationReport {
    pub fn leaf(outcome: LaunchOutcome) -> Self {
        Self {
            outcome,
            descendants: Vec::new(),
        }
    }
}

/// Backend that runs one invocation to a terminal outcome.
///
/// Implementations must return promptly once `cancel` fires, and must not
/// start anything if it has already fired.
#[allow(async_fn_in_trait)]
pub trait Invoker {
    async fn invoke(&self, invocation: Invocation, cancel: CancellationToken) -> InvocationReport;
}

/// Drives the launch of a job's daemons with one resolved agent.
pub struct Launcher<I> {
    agent: ResolvedAgent,
    settings: LaunchSettings,
    invoker: I,
}

impl<I: Invoker> Launcher<I> {
    pub fn new(agent: ResolvedAgent, mut settings: LaunchSettings, invoker: I) -> Self {
        settings.concurrency = settings.concurrency.max(1);
        settings.fanout = settings.fanout.max(1);
        Self {
            agent,
            settings,
            invoker,
        }
    }

    pub fn agent(&self) -> &ResolvedAgent {
        &self.agent
    }

    pub fn settings(&self) -> &LaunchSettings {
        &self.settings
    }

    pub fn invoker(&self) -> &I {
        &self.invoker
    }

    /// Launch one daemon per target and wait for every target to finish.
    ///
    /// Returns once every target has a terminal outcome. Cancelling `cancel`
    /// (or hitting the job timeout) ends the launch early with unstarted
    /// targets marked cancelled.
    pub async fn launch(
        &self,
        targets: Vec<LaunchTarget>,
        cancel: &CancellationToken,
    ) -> JobLaunchResult {
        let job_id = Uuid::new_v4().to_string();
        let started_at = Utc::now().to_rfc3339();
        let start = std::time::Instant::now();

        let topology = LaunchTopology::build(targets, self.settings.fanout);
        tracing::info!(
            job_id = %job_id,
            targets = topology.len(),
            fanout = topology.fanout(),
            depth = topology.depth(),
            direct = topology.children_of(None).len(),
            concurrency = self.settings.concurrency,
            "Launching daemons"
        );

        let job_cancel = cancel.child_token();
        let launch = self.launch_subtree(topology.into_plans(), job_cancel.clone());
        tokio::pin!(launch);

        let deadline = self.settings.job_timeout.map(|t| Instant::now() + t);
        let mut timed_out = false;
        let reports = loop {
            tokio::select! {
                reports = &mut launch => break reports,
                () = wait_until(deadline), if !timed_out => {
                    tracing::warn!(
                        job_id = %job_id,
                        timeout_secs = self.settings.job_timeout.map_or(0.0, |t| t.as_secs_f64()),
                        "Job launch timed out; cancelling remaining targets"
                    );
                    timed_out = true;
                    job_cancel.cancel();
                }
            }
        };

        let result = JobLaunchResult::from_reports(
            job_id,
            started_at,
            start.elapsed(),
            reports,
            job_cancel.is_cancelled(),
            timed_out,
        );
        tracing::info!(
            job_id = %result.job_id,
            succeeded = result.succeeded,
            failed = result.failed,
            cancelled = result.cancelled,
            elapsed_secs = result.elapsed_secs,
            "Launch finished"
        );
        result
    }

    /// Launch a set of sibling plans from this process.
    ///
    /// This is one level of the tree: the root calls it with its direct
    /// children, and a relay calls it with the plans it was assigned.
    /// Returns a report for every target in every plan.
    pub async fn launch_subtree(
        &self,
        plans: Vec<SubtreePlan>,
        cancel: CancellationToken,
    ) -> Vec<TargetReport> {
        let total: usize = plans.iter().map(SubtreePlan::len).sum();
        let mut reports = Vec::with_capacity(total);
        let mut pending: VecDeque<SubtreePlan> = plans.into();
        let mut in_flight: FuturesUnordered<LocalBoxFuture<'_, Vec<TargetReport>>> =
            FuturesUnordered::new();
        let mut next_start = Instant::now();

        loop {
            let cancelled = cancel.is_cancelled();
            if in_flight.is_empty() && (pending.is_empty() || cancelled) {
                break;
            }
            let can_start =
                !cancelled && !pending.is_empty() && in_flight.len() < self.settings.concurrency;

            tokio::select! {
                biased;
                () = cancel.cancelled(), if !cancelled => {
                    tracing::info!(
                        pending = pending.len(),
                        in_flight = in_flight.len(),
                        "Launch cancelled; no further invocations will start"
                    );
                }
                Some(batch) = in_flight.next(), if !in_flight.is_empty() => {
                    reports.extend(batch);
                }
                () = tokio::time::sleep_until(next_start), if can_start => {
                    // The token may have fired while this branch was being polled.
                    if cancel.is_cancelled() {
                        continue;
                    }
                    let Some(plan) = pending.pop_front() else {
                        continue;
                    };
                    if let Some(delay) = self.settings.delay {
                        next_start = Instant::now() + delay;
                    }
                    in_flight.push(self.invoke_plan(plan, cancel.clone()).boxed_local());
                }
                else => break,
            }
        }

        for plan in pending {
            reports.extend(
                plan.targets()
                    .into_iter()
                    .map(|t| TargetReport::new(t, LaunchOutcome::Cancelled)),
            );
        }
        reports
    }

    /// Invoke one plan's target and account for its whole subtree.
    async fn invoke_plan(&self, plan: SubtreePlan, cancel: CancellationToken) -> Vec<TargetReport> {
        let SubtreePlan { target, children } = plan;
        let descendants: Vec<LaunchTarget> = children
            .iter()
            .flat_map(|c| c.targets().into_iter().cloned().collect::<Vec<_>>())
            .collect();

        let argv = build_argv(&self.agent, &target, !children.is_empty(), &self.settings);
        let assignment = (!children.is_empty()).then(|| SubtreeAssignment {
            agent: self.agent.clone(),
            settings: self.settings.clone(),
            children,
        });

        tracing::debug!(
            target_id = target.id,
            node = %target.node,
            argv = ?argv,
            subtree = descendants.len(),
            "Invoking launch agent"
        );

        let invocation = Invocation {
            target: target.clone(),
            program: self.agent.path.clone(),
            argv,
            assignment,
            timeout: self.settings.invocation_timeout,
        };
        let report = self.invoker.invoke(invocation, cancel.clone()).await;

        match &report.outcome {
            LaunchOutcome::Succeeded => {
                tracing::debug!(target_id = target.id, node = %target.node, "Daemon launched");
            }
            LaunchOutcome::Failed { reason } => {
                tracing::warn!(target_id = target.id, node = %target.node, %reason, "Daemon launch failed");
            }
            LaunchOutcome::Cancelled => {
                tracing::debug!(target_id = target.id, node = %target.node, "Daemon launch cancelled");
            }
        }

        let mut reported: HashMap<usize, LaunchOutcome> = report
            .descendants
            .into_iter()
            .map(|r| (r.id, r.outcome))
            .collect();

        let mut out = Vec::with_capacity(1 + descendants.len());
        for descendant in &descendants {
            let outcome = reported
                .remove(&descendant.id)
                .unwrap_or_else(|| unreported_outcome(&target, &report.outcome, &cancel));
            out.push(TargetReport::new(descendant, outcome));
        }
        if !reported.is_empty() {
            tracing::warn!(
                node = %target.node,
                unexpected = reported.len(),
                "Relay reported targets outside its subtree; ignoring them"
            );
        }
        out.insert(0, TargetReport::new(&target, report.outcome));
        out
    }
}

/// Outcome for a descendant its relay never reported on.
fn unreported_outcome(
    parent: &LaunchTarget,
    parent_outcome: &LaunchOutcome,
    cancel: &CancellationToken,
) -> LaunchOutcome {
    if cancel.is_cancelled() {
        return LaunchOutcome::Cancelled;
    }
    match parent_outcome {
        LaunchOutcome::Failed { .. } => {
            LaunchOutcome::failed(FailureReason::ParentFailed { parent: parent.id })
        }
        LaunchOutcome::Cancelled => LaunchOutcome::Cancelled,
        LaunchOutcome::Succeeded => LaunchOutcome::failed(FailureReason::protocol(format!(
            "relay on {} did not report this target",
            parent.node
        ))),
    }
}

/// Sleep until `deadline`, or forever when there is none.
pub(crate) async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}
