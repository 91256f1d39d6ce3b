//! Virtual merkle map with a chunked hash representation.
//!
//! Keys live at the leaves of a dense binary tree addressed by breadth-first
//! paths. Hashes of the tree are kept in fixed-height [`HashChunk`]s so the
//! index tracks one entry per sub-tree instead of one per node.
//!
//! ## Core Concepts
//!
//! - **Path**: breadth-first node number, see [`path`]
//! - **HashChunk**: hashes of `height` ranks below a chunk root
//! - **VirtualIndex**: chunk id to chunk mapping with a bounded cache
//! - **VirtualMap**: copy-on-write key-value views hashed in parallel

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
        clippy::cast_possible_truncation,
        clippy::expect_used,
        clippy::missing_assert_message,
        clippy::panic,
        clippy::unwrap_used,
        reason = "Not useful in unit tests"
    )
)]

pub mod chunk;
pub mod codec;
pub mod config;
pub mod error;
pub mod hasher;
pub mod index;
pub mod map;
pub mod path;

pub use chunk::{ChunkId, Hash, HashChunk, DIGEST_LENGTH, NULL_HASH};
pub use config::VirtualMapConfig;
pub use error::VmapError;
pub use index::{ChunkBackend, ChunkCoordinates, InMemoryChunkBackend, VirtualIndex};
pub use map::{LeafRange, LeafRecord, ViewState, VirtualMap};
pub use path::Path;
