//! Streams locally produced blocks to remote block nodes.
//!
//! ## Core Concepts
//!
//! - **BlockNodeConnection**: per-peer state machine, one worker task
//!   publishing blocks and one task handling node responses
//! - **ConnectionManager**: picks the peer, owns every retry timer and fails
//!   over when a peer cannot serve the stream
//! - **BlockBuffer**: source of the blocks to publish
//! - **BlockNodeTransport**: opens streams, see [`transport::LoopbackTransport`]
//!   for an in-process one

#![deny(
    unsafe_code,
    clippy::expect_used,
    clippy::panic,
    clippy::unwrap_in_result,
    clippy::unwrap_used
)]
#![cfg_attr(
    test,
    allow(
        clippy::expect_used,
        clippy::missing_assert_message,
        clippy::panic,
        clippy::unwrap_used,
        reason = "Not useful in unit tests"
    )
)]

pub mod buffer;
pub mod config;
pub mod connection;
pub mod error;
pub mod limiter;
pub mod manager;
pub mod messages;
pub mod metrics;
pub mod transport;

pub use buffer::{BlockBuffer, InMemoryBlockBuffer};
pub use config::BlockStreamConfig;
pub use connection::{
    acknowledgement_action, BlockNodeConnection, ConnectionEvent, ConnectionState, RetryPlan,
    StreamContext,
};
pub use error::BlockStreamError;
pub use limiter::EndOfStreamLimiter;
pub use manager::{ConnectionManager, ManagerHandle, ManagerStatus, PeerStatus};
pub use messages::{InboundMessage, PeerDescriptor, PublishRequest, StatusCode};
pub use metrics::{BlockStreamMetrics, NoopMetrics, PrometheusBlockStreamMetrics};
pub use transport::{BlockNodeTransport, LoopbackTransport, NodeSession, RequestStream, StreamPair};
