//! Invocation backend that runs the launch agent as a local child process.
//!
//! Each invocation:
//! - Runs in its own process group (`process_group(0)`) so termination
//!   reaches the agent and anything it forked
//! - Has `kill_on_drop(true)` as a safety net
//! - Keeps the last lines of the agent's output for failure diagnostics
//!
//! Leaf targets succeed when the agent exits 0. Interior targets run a relay
//! (see [`super::protocol`]): they succeed once the relay reports `ready`,
//! and the reports the relay streams back cover their subtree.

use std::collections::VecDeque;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::launcher::{Invocation, InvocationReport, Invoker, wait_until};
use super::protocol::{
    ParentMessage, RelayMessage, SubtreeAssignment, encode_line, parse_relay_line,
};
use super::types::{FailureReason, LaunchOutcome, TargetReport};

/// Lines of agent output retained per invocation.
const OUTPUT_BUFFER_CAPACITY: usize = 200;

/// Lines of retained output quoted in a failure.
const DIAGNOSTIC_LINES: usize = 20;

/// Time between SIGTERM and SIGKILL when stopping an agent.
pub const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// How long to wait for output readers after the agent exits.
const READER_DRAIN: Duration = Duration::from_millis(200);

/// Runs invocations with `tokio::process`.
#[derive(Clone, Debug)]
pub struct ProcessInvoker {
    grace: Duration,
}

impl Default for ProcessInvoker {
    fn default() -> Self {
        Self {
            grace: DEFAULT_TERMINATE_GRACE,
        }
    }
}

impl ProcessInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }
}

impl Invoker for ProcessInvoker {
    async fn invoke(&self, invocation: Invocation, cancel: CancellationToken) -> InvocationReport {
        if cancel.is_cancelled() {
            return InvocationReport::leaf(LaunchOutcome::Cancelled);
        }

        let deadline = invocation.timeout.map(|t| Instant::now() + t);
        let relay = invocation.assignment.is_some();
        let mut child = match spawn(&invocation, relay) {
            Ok(child) => child,
            Err(e) => {
                return InvocationReport::leaf(LaunchOutcome::failed(spawn_failure(
                    &invocation,
                    &e,
                )));
            }
        };
        tracing::debug!(
            node = %invocation.target.node,
            pid = child.id(),
            relay,
            "Launch agent started"
        );

        let tail = OutputTail::default();
        let mut readers = Vec::new();
        if let Some(stderr) = child.stderr.take() {
            readers.push(capture(stderr, tail.clone(), invocation.target.node.clone()));
        }

        let report = match invocation.assignment {
            Some(assignment) => {
                let ctx = RunContext {
                    node: &invocation.target.node,
                    timeout: invocation.timeout,
                    deadline,
                    cancel: &cancel,
                    grace: self.grace,
                    tail: &tail,
                };
                drive_relay(&mut child, assignment, ctx).await
            }
            None => {
                if let Some(stdout) = child.stdout.take() {
                    readers.push(capture(stdout, tail.clone(), invocation.target.node.clone()));
                }
                let outcome = run_leaf(
                    &mut child,
                    invocation.timeout,
                    deadline,
                    &cancel,
                    self.grace,
                    &readers,
                    &tail,
                )
                .await;
                InvocationReport::leaf(outcome)
            }
        };

        for reader in readers {
            reader.abort();
        }
        report
    }
}

struct RunContext<'a> {
    node: &'a str,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    cancel: &'a CancellationToken,
    grace: Duration,
    tail: &'a OutputTail,
}

fn spawn(invocation: &Invocation, relay: bool) -> io::Result<Child> {
    // process_group(0) and arg0 need the CommandExt trait on Unix.
    #[allow(unused_imports)]
    use std::os::unix::process::CommandExt;

    let mut command = Command::new(&invocation.program);
    if let Some(arg0) = invocation.argv.first() {
        command.arg0(arg0);
    }
    command
        .args(invocation.argv.iter().skip(1))
        .process_group(0)
        .stdin(if relay { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
}

fn spawn_failure(invocation: &Invocation, error: &io::Error) -> FailureReason {
    if error.kind() == io::ErrorKind::NotFound {
        FailureReason::AgentNotFound {
            path: invocation.program.display().to_string(),
        }
    } else {
        FailureReason::SpawnFailed {
            message: error.to_string(),
        }
    }
}

async fn run_leaf(
    child: &mut Child,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    cancel: &CancellationToken,
    grace: Duration,
    readers: &[JoinHandle<()>],
    tail: &OutputTail,
) -> LaunchOutcome {
    let status = tokio::select! {
        biased;
        () = cancel.cancelled() => {
            terminate(child, grace).await;
            return LaunchOutcome::failed(FailureReason::Interrupted);
        }
        () = wait_until(deadline) => {
            terminate(child, grace).await;
            return LaunchOutcome::failed(FailureReason::timeout(timeout.unwrap_or_default()));
        }
        status = child.wait() => status,
    };

    // Let the readers catch the last lines before quoting them.
    let drain = Instant::now() + READER_DRAIN;
    for reader in readers {
        while !reader.is_finished() && Instant::now() < drain {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
    exit_outcome(status, tail)
}

async fn drive_relay(
    child: &mut Child,
    assignment: SubtreeAssignment,
    ctx: RunContext<'_>,
) -> InvocationReport {
    let Some(stdout) = child.stdout.take() else {
        terminate(child, ctx.grace).await;
        return InvocationReport::leaf(LaunchOutcome::failed(FailureReason::protocol(
            "relay stdout was not captured",
        )));
    };
    let mut lines = BufReader::new(stdout).lines();

    // The target itself is up once the relay says so.
    loop {
        let line = tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => {
                terminate(child, ctx.grace).await;
                return InvocationReport::leaf(LaunchOutcome::failed(FailureReason::Interrupted));
            }
            () = wait_until(ctx.deadline) => {
                terminate(child, ctx.grace).await;
                return InvocationReport::leaf(LaunchOutcome::failed(
                    FailureReason::timeout(ctx.timeout.unwrap_or_default()),
                ));
            }
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) => match parse_relay_line(&line) {
                Some(RelayMessage::Ready { .. }) => break,
                Some(other) => {
                    tracing::debug!(node = ctx.node, message = ?other, "Relay message before ready");
                }
                None => ctx.tail.push(line),
            },
            Ok(None) | Err(_) => {
                let status = child.wait().await;
                let outcome = match exit_outcome(status, ctx.tail) {
                    LaunchOutcome::Succeeded => LaunchOutcome::failed(FailureReason::protocol(
                        "relay exited without reporting ready",
                    )),
                    failed => failed,
                };
                return InvocationReport::leaf(outcome);
            }
        }
    }
    tracing::debug!(node = ctx.node, "Relay ready; sending subtree assignment");

    let mut stdin = match send_assignment(child, &assignment).await {
        Ok(stdin) => Some(stdin),
        Err(e) => {
            terminate(child, ctx.grace).await;
            return InvocationReport::leaf(LaunchOutcome::failed(FailureReason::protocol(format!(
                "failed to send subtree assignment: {e}"
            ))));
        }
    };

    let mut descendants: Vec<TargetReport> = Vec::new();
    let mut kill_at: Option<Instant> = None;
    loop {
        let line = tokio::select! {
            biased;
            () = ctx.cancel.cancelled(), if kill_at.is_none() => {
                // The relay may sit outside our process group, so tell it over
                // stdin and let it report what it started.
                if let Some(stdin) = stdin.take() {
                    send_cancel(stdin).await;
                }
                kill_at = Some(Instant::now() + ctx.grace);
                continue;
            }
            () = wait_until(kill_at), if kill_at.is_some() => {
                tracing::warn!(node = ctx.node, "Relay did not finish after cancel; killing it");
                break;
            }
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) => match parse_relay_line(&line) {
                Some(RelayMessage::Outcome { report }) => descendants.push(report),
                Some(RelayMessage::Done) => break,
                Some(RelayMessage::Ready { .. }) => {}
                None => ctx.tail.push(line),
            },
            Ok(None) | Err(_) => break,
        }
    }
    drop(stdin);

    match tokio::time::timeout(ctx.grace, child.wait()).await {
        Ok(Ok(status)) if !status.success() => {
            tracing::warn!(node = ctx.node, code = status.code(), "Relay exited with failure");
        }
        Ok(_) => {}
        Err(_) => terminate(child, ctx.grace).await,
    }

    InvocationReport {
        outcome: LaunchOutcome::Succeeded,
        descendants,
    }
}

/// Write the assignment and hand back stdin. The relay treats stdin closing
/// as its parent going away, so the caller holds it until the subtree is done.
async fn send_assignment(child: &mut Child, assignment: &SubtreeAssignment) -> io::Result<ChildStdin> {
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "relay stdin was not captured"))?;
    let line = encode_line(assignment).map_err(io::Error::other)?;
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await?;
    Ok(stdin)
}

/// Send `cancel` and close stdin. A relay that already exited makes the write
/// fail, which is fine: the close carries the same meaning.
async fn send_cancel(mut stdin: ChildStdin) {
    if let Ok(line) = encode_line(&ParentMessage::Cancel) {
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            tracing::debug!(error = %e, "Could not send cancel to relay");
            return;
        }
        let _ = stdin.flush().await;
    }
}

fn exit_outcome(status: io::Result<ExitStatus>, tail: &OutputTail) -> LaunchOutcome {
    match status {
        Ok(status) if status.success() => LaunchOutcome::Succeeded,
        Ok(status) => LaunchOutcome::failed(FailureReason::NonZeroExit {
            code: status.code(),
            diagnostics: tail.last(DIAGNOSTIC_LINES),
        }),
        Err(e) => LaunchOutcome::failed(FailureReason::SpawnFailed {
            message: format!("wait failed: {e}"),
        }),
    }
}

fn signal_group(child: &Child, signal: Signal) {
    if let Some(pid) = child.id() {
        let _ = killpg(Pid::from_raw(pid as i32), signal);
    }
}

/// Stop the agent's process group: SIGTERM, then SIGKILL after `grace`.
async fn terminate(child: &mut Child, grace: Duration) {
    signal_group(child, Signal::SIGTERM);
    if tokio::time::timeout(grace, child.wait()).await.is_ok() {
        return;
    }
    signal_group(child, Signal::SIGKILL);
    // Reap the child to prevent zombies.
    let _ = child.wait().await;
}

/// Bounded buffer of an agent's most recent output lines.
#[derive(Clone, Debug, Default)]
struct OutputTail {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl OutputTail {
    fn push(&self, line: String) {
        let mut buf = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        if buf.len() >= OUTPUT_BUFFER_CAPACITY {
            buf.pop_front();
        }
        buf.push_back(line);
    }

    fn last(&self, n: usize) -> String {
        let buf = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        let start = buf.len().saturating_sub(n);
        buf.iter().skip(start).cloned().collect::<Vec<_>>().join("\n")
    }
}

fn capture<R>(stream: R, tail: OutputTail, node: String) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::trace!(node = %node, line = %line, "agent output");
            tail.push(line);
        }
    })
}
