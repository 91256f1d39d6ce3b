//! Block-stream protocol messages.
//!
//! Messages are framed with borsh when they cross a byte transport.

use core::fmt;

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

use crate::error::BlockStreamError;

/// Outcome a block node reports when it ends a stream.
#[derive(BorshDeserialize, BorshSerialize, Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[borsh(use_discriminant = true)]
#[repr(u8)]
pub enum StatusCode {
    Unspecified = 0,
    Success = 1,
    InternalError = 2,
    PersistenceFailed = 3,
    Timeout = 4,
    OutOfOrder = 5,
    BadStateProof = 6,
    Behind = 7,
    Unknown = 8,
}

impl StatusCode {
    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unspecified => "unspecified",
            Self::Success => "success",
            Self::InternalError => "internal_error",
            Self::PersistenceFailed => "persistence_failed",
            Self::Timeout => "timeout",
            Self::OutOfOrder => "out_of_order",
            Self::BadStateProof => "bad_state_proof",
            Self::Behind => "behind",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message received from a block node.
#[derive(BorshDeserialize, BorshSerialize, Clone, Debug, Eq, PartialEq)]
pub enum InboundMessage {
    /// The node persisted every item up to and including `block_number`.
    Acknowledgement {
        block_number: u64,
        already_exists: bool,
    },
    /// The node ended the stream.
    EndOfStream {
        block_number: u64,
        status: StatusCode,
    },
    /// The node already has `block_number` and asks us to move past it.
    SkipBlock { block_number: u64 },
    /// The node asks for retransmission starting at `block_number`.
    ResendBlock { block_number: u64 },
}

impl InboundMessage {
    pub fn decode(bytes: &[u8]) -> Result<Self, BlockStreamError> {
        borsh::from_slice(bytes).map_err(|err| BlockStreamError::transport(err.to_string()))
    }

    pub fn encode(&self) -> Result<Vec<u8>, BlockStreamError> {
        borsh::to_vec(self).map_err(|err| BlockStreamError::transport(err.to_string()))
    }
}

/// Items of one block sent to a block node.
#[derive(BorshDeserialize, BorshSerialize, Clone, Debug, Eq, PartialEq)]
pub struct PublishRequest {
    pub block_number: u64,
    pub items: Vec<Vec<u8>>,
}

impl PublishRequest {
    pub fn decode(bytes: &[u8]) -> Result<Self, BlockStreamError> {
        borsh::from_slice(bytes).map_err(|err| BlockStreamError::transport(err.to_string()))
    }

    pub fn encode(&self) -> Result<Vec<u8>, BlockStreamError> {
        borsh::to_vec(self).map_err(|err| BlockStreamError::transport(err.to_string()))
    }
}

/// A candidate block node.
///
/// Lower `priority` values are preferred.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct PeerDescriptor {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub priority: u32,
}

impl PeerDescriptor {
    pub fn new(host: impl Into<String>, port: u16, priority: u32) -> Self {
        Self {
            host: host.into(),
            port,
            priority,
        }
    }
}

impl fmt::Display for PeerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
