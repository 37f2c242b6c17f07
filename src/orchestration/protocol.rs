//! Messages exchanged between a launching process and a relay.
//!
//! Both directions carry one JSON object per line. The relay speaks first
//! (`ready`) once its own daemon is up. The parent then sends exactly one
//! [`SubtreeAssignment`] and keeps the relay's stdin open while the subtree
//! launches. The relay answers with one `outcome` per descendant followed by
//! `done`.
//!
//! Stdin is the relay's only link to its parent when the agent puts it in
//! another session or on another host. A [`ParentMessage::Cancel`] line or
//! end of file on stdin both mean: start nothing more, report, and exit.

use serde::{Deserialize, Serialize};

use super::topology::SubtreePlan;
use super::types::{LaunchSettings, TargetReport};
use crate::agent::ResolvedAgent;

/// Relay to parent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayMessage {
    Ready { node: String },
    Outcome { report: TargetReport },
    Done,
}

/// Parent to relay: the subtree this relay must bring up and how.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtreeAssignment {
    pub agent: ResolvedAgent,
    pub settings: LaunchSettings,
    pub children: Vec<SubtreePlan>,
}

/// Parent to relay, after the assignment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParentMessage {
    Cancel,
}

/// Encode a message as one newline-terminated line.
pub fn encode_line<T: Serialize>(message: &T) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Decode a relay message, or `None` for lines that are not protocol traffic
/// (daemon chatter on the same stream).
pub fn parse_relay_line(line: &str) -> Option<RelayMessage> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

/// Decode a parent control line; anything unrecognised is ignored.
pub fn parse_parent_line(line: &str) -> Option<ParentMessage> {
    serde_json::from_str(line.trim()).ok()
}
