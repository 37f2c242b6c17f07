use std::path::PathBuf;

/// Errors reading or parsing a config file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config at {path}: {message}")]
    ParseError { path: PathBuf, message: String },
}

/// Errors raised while selecting a launch agent for this process.
///
/// Only [`SelectionError::AgentNotFound`] is fatal: an agent the user asked
/// for by name must never be silently replaced.
#[derive(Debug, thiserror::Error)]
pub enum SelectionError {
    #[error("launch agent `{agent}` was requested but none of its candidates could be found or executed")]
    AgentNotFound { agent: String },

    #[error("{mechanism} launching is unavailable: {reason}")]
    Unavailable { mechanism: String, reason: String },
}

impl SelectionError {
    /// Whether the whole run must stop rather than report this launcher as unavailable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SelectionError::AgentNotFound { .. })
    }
}

/// Errors on the relay side of the subtree handshake.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("I/O error on relay channel: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed relay message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Parent closed the channel before sending a subtree assignment")]
    NoAssignment,

    #[error("Local daemon `{command}` failed: {message}")]
    DaemonFailed { command: String, message: String },
}
