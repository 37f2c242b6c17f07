//! The relay: what an interior target runs in place of its bare daemon.
//!
//! A relay starts the node's own daemon, tells its parent it is ready, then
//! takes over launching the subtree the parent hands it, using the same
//! [`Launcher`] the root uses. Its stdout is the protocol channel, so the
//! daemon's stdout is redirected to stderr.
//!
//! Stdin stays open for the whole subtree launch. A `cancel` line or end of
//! file cancels the relay's launch: over ssh the relay is not in the parent's
//! process group, and stdin is the only thing that tells it the parent is gone.

use std::os::fd::AsFd;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::launcher::Launcher;
use super::process::ProcessInvoker;
use super::protocol::{
    ParentMessage, RelayMessage, SubtreeAssignment, encode_line, parse_parent_line,
};
use crate::agent::ResolvedAgent;
use crate::agent::locator::find_executable;
use crate::error::RelayError;

/// Run a relay for `node` over this process's stdin and stdout.
pub async fn run_relay(
    node: &str,
    daemon: &[String],
    cancel: CancellationToken,
) -> Result<(), RelayError> {
    start_daemon(daemon, &cancel).await?;
    relay_subtree(node, tokio::io::stdin(), tokio::io::stdout(), cancel).await
}

/// Handshake with the parent and launch the assigned subtree.
///
/// Split from [`run_relay`] so the channel can be any reader and writer.
pub async fn relay_subtree<R, W>(
    node: &str,
    input: R,
    mut output: W,
    cancel: CancellationToken,
) -> Result<(), RelayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    send(&mut output, &RelayMessage::Ready {
        node: node.to_string(),
    })
    .await?;

    let mut input = BufReader::new(input).lines();
    let assignment = read_assignment(&mut input).await?;
    let targets: usize = assignment.children.iter().map(|c| c.len()).sum();
    tracing::info!(node, targets, "Relay received subtree assignment");

    let agent = localize(assignment.agent);
    let launcher = Launcher::new(agent, assignment.settings, ProcessInvoker::new());
    let launch = launcher.launch_subtree(assignment.children, cancel.clone());
    tokio::pin!(launch);

    let mut watching = true;
    let reports = loop {
        tokio::select! {
            reports = &mut launch => break reports,
            () = watch_parent(&mut input), if watching => {
                watching = false;
                if !cancel.is_cancelled() {
                    tracing::warn!(node, "Parent cancelled or went away; stopping subtree launch");
                    cancel.cancel();
                }
            }
        }
    };

    for report in reports {
        send(&mut output, &RelayMessage::Outcome { report }).await?;
    }
    send(&mut output, &RelayMessage::Done).await?;
    Ok(())
}

async fn start_daemon(daemon: &[String], cancel: &CancellationToken) -> Result<(), RelayError> {
    let Some((program, args)) = daemon.split_first() else {
        return Ok(());
    };
    let failed = |message: String| RelayError::DaemonFailed {
        command: daemon.join(" "),
        message,
    };

    let stderr = std::io::stderr().as_fd().try_clone_to_owned()?;
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stderr))
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| failed(e.to_string()))?;

    let status = tokio::select! {
        () = cancel.cancelled() => {
            let _ = child.kill().await;
            return Err(failed("interrupted".to_string()));
        }
        status = child.wait() => status?,
    };
    if status.success() {
        tracing::debug!(daemon = %program, "Local daemon started");
        Ok(())
    } else {
        Err(failed(format!("exited with {status}")))
    }
}

async fn read_assignment<R: AsyncRead + Unpin>(
    lines: &mut Lines<BufReader<R>>,
) -> Result<SubtreeAssignment, RelayError> {
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let assignment: SubtreeAssignment = serde_json::from_str(line.trim())?;
        if assignment.agent.argv.is_empty() {
            return Err(RelayError::Malformed(serde::de::Error::custom(
                "launch agent has an empty argv",
            )));
        }
        return Ok(assignment);
    }
    Err(RelayError::NoAssignment)
}

/// Resolve once the parent sends `cancel` or closes the channel.
async fn watch_parent<R: AsyncRead + Unpin>(lines: &mut Lines<BufReader<R>>) {
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if parse_parent_line(&line) == Some(ParentMessage::Cancel) {
                    return;
                }
            }
            Ok(None) | Err(_) => return,
        }
    }
}

async fn send<W: AsyncWrite + Unpin>(output: &mut W, message: &RelayMessage) -> Result<(), RelayError> {
    let line = encode_line(message)?;
    output.write_all(line.as_bytes()).await?;
    output.flush().await?;
    Ok(())
}

/// The parent's agent path may not exist on this node; fall back to its
/// basename on the local `PATH`.
fn localize(mut agent: ResolvedAgent) -> ResolvedAgent {
    if agent.path.is_file() {
        return agent;
    }
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
    let path_var = std::env::var_os("PATH");
    match find_executable(agent.basename(), path_var.as_deref(), &cwd) {
        Some(path) => {
            tracing::debug!(from = %agent.path.display(), to = %path.display(), "Relocated launch agent");
            agent.path = path;
        }
        None => {
            tracing::warn!(agent = agent.basename(), "Launch agent not found on this node");
        }
    }
    agent
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::protocol::parse_relay_line;
    use crate::orchestration::types::{FailureReason, LaunchOutcome, LaunchSettings, LaunchTarget};
    use crate::orchestration::topology::SubtreePlan;

    fn assignment(children: Vec<SubtreePlan>) -> SubtreeAssignment {
        SubtreeAssignment {
            agent: ResolvedAgent::from_candidate(PathBuf::from("/nonexistent/ssh"), &["ssh"]),
            settings: LaunchSettings::default(),
            children,
        }
    }

    fn messages(output: &[u8]) -> Vec<RelayMessage> {
        String::from_utf8_lossy(output)
            .lines()
            .filter_map(parse_relay_line)
            .collect()
    }

    #[tokio::test]
    async fn empty_assignment_reports_ready_then_done() {
        let input = encode_line(&assignment(vec![])).unwrap();
        let mut output = Vec::new();
        relay_subtree("n1", input.as_bytes(), &mut output, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            messages(&output),
            [RelayMessage::Ready { node: "n1".into() }, RelayMessage::Done]
        );
    }

    #[tokio::test]
    async fn closed_channel_without_assignment_is_an_error() {
        let mut output = Vec::new();
        let err = relay_subtree("n1", &b""[..], &mut output, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::NoAssignment));
        // Ready still went out before the parent hung up.
        assert_eq!(messages(&output), [RelayMessage::Ready { node: "n1".into() }]);
    }

    #[tokio::test]
    async fn garbage_assignment_is_malformed() {
        let mut output = Vec::new();
        let err = relay_subtree("n1", &b"{\"agent\":42}\n"[..], &mut output, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Malformed(_)));
    }

    #[tokio::test]
    async fn cancelled_relay_reports_children_cancelled() {
        let mut target = LaunchTarget::new("n3", vec!["prted".into()]);
        target.id = 3;
        let input = encode_line(&assignment(vec![SubtreePlan {
            target,
            children: vec![],
        }]))
        .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut output = Vec::new();
        relay_subtree("n1", input.as_bytes(), &mut output, cancel)
            .await
            .unwrap();

        let msgs = messages(&output);
        assert_eq!(msgs.len(), 3);
        match &msgs[1] {
            RelayMessage::Outcome { report } => {
                assert_eq!(report.id, 3);
                assert_eq!(report.outcome, LaunchOutcome::Cancelled);
            }
            other => panic!("expected outcome, got {other:?}"),
        }
        assert_eq!(msgs[2], RelayMessage::Done);
    }

    #[tokio::test]
    async fn empty_agent_argv_is_malformed() {
        let mut bad = assignment(vec![]);
        bad.agent.argv.clear();
        let input = encode_line(&bad).unwrap();
        let mut output = Vec::new();
        let err = relay_subtree("n1", input.as_bytes(), &mut output, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Malformed(_)));
    }

    /// Runs n2 (`sleep 10`) then n3 (`touch marker`) one at a time through a
    /// local stand-in agent, and lets `hang_up` act on the parent's end of
    /// the channel while n2 is still running.
    async fn relay_with_parent<F, Fut>(hang_up: F)
    where
        F: FnOnce(tokio::io::DuplexStream) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let fakesh = dir.path().join("fakesh");
        std::fs::write(&fakesh, "#!/bin/sh\nshift\nexec \"$@\"\n").unwrap();
        std::fs::set_permissions(&fakesh, std::fs::Permissions::from_mode(0o755)).unwrap();
        let marker = dir.path().join("marker");

        let mut slow = LaunchTarget::new("n2", vec!["sleep".into(), "10".into()]);
        slow.id = 2;
        let mut late = LaunchTarget::new(
            "n3",
            vec!["touch".into(), marker.to_string_lossy().into_owned()],
        );
        late.id = 3;
        let plan = SubtreeAssignment {
            agent: ResolvedAgent::from_candidate(fakesh, &["fakesh"]),
            settings: LaunchSettings {
                concurrency: 1,
                ..Default::default()
            },
            children: vec![
                SubtreePlan { target: slow, children: vec![] },
                SubtreePlan { target: late, children: vec![] },
            ],
        };

        let (mut parent, relay_end) = tokio::io::duplex(64 * 1024);
        parent
            .write_all(encode_line(&plan).unwrap().as_bytes())
            .await
            .unwrap();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
            hang_up(parent).await;
        });

        let mut output = Vec::new();
        let start = std::time::Instant::now();
        relay_subtree("n1", relay_end, &mut output, CancellationToken::new())
            .await
            .unwrap();
        assert!(start.elapsed() < std::time::Duration::from_secs(5));

        let outcomes: Vec<(usize, LaunchOutcome)> = messages(&output)
            .into_iter()
            .filter_map(|m| match m {
                RelayMessage::Outcome { report } => Some((report.id, report.outcome)),
                _ => None,
            })
            .collect();
        assert_eq!(
            outcomes,
            [
                (2, LaunchOutcome::failed(FailureReason::Interrupted)),
                (3, LaunchOutcome::Cancelled),
            ]
        );
        assert!(!marker.exists(), "n3 was started after the parent hung up");
    }

    #[tokio::test]
    async fn parent_cancel_line_stops_pending_children() {
        relay_with_parent(|mut parent| async move {
            let line = encode_line(&ParentMessage::Cancel).unwrap();
            parent.write_all(line.as_bytes()).await.unwrap();
            // Keep the channel open: the cancel line alone must be enough.
            tokio::time::sleep(std::time::Duration::from_secs(10)).await;
            drop(parent);
        })
        .await;
    }

    #[tokio::test]
    async fn parent_closing_stdin_stops_pending_children() {
        relay_with_parent(|parent| async move { drop(parent) }).await;
    }

    #[tokio::test]
    async fn failing_daemon_stops_the_relay() {
        let err = start_daemon(&["false".to_string()], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::DaemonFailed { .. }));
        start_daemon(&["true".to_string()], &CancellationToken::new())
            .await
            .unwrap();
    }
}
