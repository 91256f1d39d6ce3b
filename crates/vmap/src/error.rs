//! Error types for the virtual map.

use thiserror::Error as ThisError;

use crate::codec::CodecError;

/// General error type for virtual map operations.
#[derive(Debug, ThisError)]
#[non_exhaustive]
pub enum VmapError {
    /// An argument failed validation at the call site.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not allowed in the current state of the view.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// The root hash was requested before the hashing pass ran.
    #[error("view {version} has not been hashed yet")]
    NotHashedYet {
        /// Version of the view.
        version: u64,
    },

    /// A serialized chunk could not be decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The chunk backend failed.
    #[error("chunk backend failure: {0}")]
    Backend(String),
}

impl VmapError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub(crate) fn illegal(message: impl Into<String>) -> Self {
        Self::IllegalState(message.into())
    }
}
