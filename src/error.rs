use thiserror::Error;

/// Error kinds the control channel can report back to the host.
///
/// Every handler-facing error collapses to exactly one of these; the control
/// channel only ever emits a bare `ERROR` frame, so the kind matters for
/// logging and internal control flow, not for anything on the wire.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("parse error: {0}")]
    ParseError(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("os error: {0}")]
    Os(#[from] nix::Error),

    #[error("os error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::ParseError(e.to_string())
    }
}

impl AgentError {
    /// Whether this error is severe enough to also be logged at `error!`
    /// level rather than `warn!`.
    pub fn is_severe(&self) -> bool {
        matches!(self, AgentError::Os(_) | AgentError::Internal(_))
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
