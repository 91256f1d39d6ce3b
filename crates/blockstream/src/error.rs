//! Error types for block streaming.

use thiserror::Error as ThisError;

/// General error type for block stream connections.
#[derive(Clone, Debug, Eq, PartialEq, ThisError)]
#[non_exhaustive]
pub enum BlockStreamError {
    /// The transport failed to open, send on, or close a stream.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The operation is not allowed in the current connection state.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// The connection manager is no longer running.
    #[error("connection manager stopped")]
    ManagerStopped,
}

impl BlockStreamError {
    pub(crate) fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub(crate) fn illegal(message: impl Into<String>) -> Self {
        Self::IllegalState(message.into())
    }
}
