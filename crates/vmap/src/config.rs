//! Virtual map tuning knobs.

use serde::{Deserialize, Serialize};

/// Default number of ranks stored per hash chunk.
pub const DEFAULT_CHUNK_HEIGHT: u32 = 5;

/// Default number of chunks the committed index keeps in memory.
pub const DEFAULT_MAX_CACHED_CHUNKS: usize = 4096;

/// Virtual map configuration.
#[derive(Copy, Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "snake_case")]
pub struct VirtualMapConfig {
    /// Ranks per hash chunk
    pub chunk_height: u32,

    /// Chunks held by the index cache before the least recently used are evicted
    pub max_cached_chunks: usize,
}

impl Default for VirtualMapConfig {
    fn default() -> Self {
        Self {
            chunk_height: DEFAULT_CHUNK_HEIGHT,
            max_cached_chunks: DEFAULT_MAX_CACHED_CHUNKS,
        }
    }
}
