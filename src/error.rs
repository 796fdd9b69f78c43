use thiserror::Error;

/// Errors surfaced by the agent client.
///
/// These are plain values: they are cloned into every waiter that observed
/// the same failure, and compared directly in tests.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentError {
    /// The transport is not ready or has gone away.
    #[error("agent not available: {reason}")]
    AgentNotAvailable { reason: String },

    /// A request was submitted while another one was still in flight.
    #[error("another request is already in flight")]
    OperationInProgress,

    /// A response frame contained bytes beyond the message's expected shape.
    #[error("response frame has {0} trailing byte(s)")]
    TrailingBytes(usize),

    /// A response frame was structurally malformed.
    #[error("bad response: {0}")]
    BadResponse(String),

    /// The agent answered FAILURE to an operation that expected data.
    #[error("agent refused the request")]
    AgentFailure,
}

impl AgentError {
    pub(crate) fn not_available(reason: impl Into<String>) -> Self {
        AgentError::AgentNotAvailable {
            reason: reason.into(),
        }
    }

    /// The error every waiter receives when the connection goes away
    /// underneath it.
    pub(crate) fn channel_inactive() -> Self {
        AgentError::not_available("channel inactive")
    }
}

impl From<std::io::Error> for AgentError {
    fn from(err: std::io::Error) -> Self {
        AgentError::not_available(err.to_string())
    }
}
