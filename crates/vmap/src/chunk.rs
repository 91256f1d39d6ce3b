//! Fixed-size blocks of tree hashes.
//!
//! A chunk of height `h` rooted at `path` holds the hashes of the `h` ranks
//! directly below `path` (the hash of `path` itself lives in the parent
//! chunk). Chunk roots sit on ranks that are multiples of `h`, so every
//! non-root path belongs to exactly one chunk:
//!
//! ```text
//! height 2, chunk rooted at 0 holds paths 1..=6:
//!
//!                 0
//!           1           2            <- index 0, 1
//!        3     4     5     6         <- index 2, 3, 4, 5
//!       ...   ...   ...   ...        <- chunks rooted at 3, 4, 5, 6
//! ```
//!
//! Storing whole sub-tree blocks instead of one hash per index entry keeps
//! the chunk index small for trees with hundreds of millions of leaves.

#[cfg(test)]
#[path = "tests/chunk.rs"]
mod tests;

use core::ops::Range;
use core::slice::ChunksExactMut;

use crate::codec;
use crate::error::VmapError;
use crate::path::{self, Path, MAX_RANK};

/// Length in bytes of a single digest.
pub const DIGEST_LENGTH: usize = 32;

/// Largest supported chunk height.
pub const MAX_CHUNK_HEIGHT: u32 = 16;

/// A single tree hash.
pub type Hash = [u8; DIGEST_LENGTH];

/// The hash of an absent node.
pub const NULL_HASH: Hash = [0; DIGEST_LENGTH];

/// Zero-based identifier of a chunk, numbered breadth first.
pub type ChunkId = u64;

/// Number of hash slots in a chunk of the given height.
///
/// Only heights up to [`MAX_CHUNK_HEIGHT`] are valid chunk heights. Larger
/// heights saturate at `usize::MAX` instead of overflowing.
#[must_use]
pub const fn chunk_size(height: u32) -> usize {
    match 1_usize.checked_shl(height.saturating_add(1)) {
        Some(slots) => slots - 2,
        None => usize::MAX,
    }
}

fn check_height(height: u32) -> Result<(), VmapError> {
    if height == 0 || height > MAX_CHUNK_HEIGHT {
        return Err(VmapError::invalid(format!(
            "chunk height must be in 1..={MAX_CHUNK_HEIGHT}, got {height}"
        )));
    }

    Ok(())
}

fn check_chunk_path(chunk_path: Path, height: u32) -> Result<(), VmapError> {
    check_height(height)?;

    if path::rank(chunk_path) % height != 0 {
        return Err(VmapError::invalid(format!(
            "path {chunk_path} has rank {} which is not a multiple of height {height}",
            path::rank(chunk_path)
        )));
    }

    Ok(())
}

/// Computes the id of the chunk rooted at `chunk_path`.
///
/// Chunks rooted at rank `L * height` come after the `Σ 2^(i * height)`,
/// `i < L`, chunks on the levels above and are ordered left to right.
pub fn path_to_chunk_id(chunk_path: Path, height: u32) -> Result<ChunkId, VmapError> {
    check_chunk_path(chunk_path, height)?;

    let level = path::rank(chunk_path) / height;
    let level_start = (0..level).fold(0_u64, |acc, i| acc | (1 << (i * height)));

    Ok(level_start + path::index_in_rank(chunk_path))
}

/// Inverse of [`path_to_chunk_id`].
pub fn chunk_id_to_chunk_path(chunk_id: ChunkId, height: u32) -> Result<Path, VmapError> {
    check_height(height)?;

    let mut level_start = 0_u64;
    let mut chunk_rank = 0;

    while chunk_rank <= MAX_RANK {
        let level_count = 1_u64 << chunk_rank;

        if chunk_id - level_start < level_count {
            return Ok(path::path_at(chunk_rank, chunk_id - level_start));
        }

        level_start += level_count;
        chunk_rank += height;
    }

    Err(VmapError::invalid(format!(
        "chunk id {chunk_id} is out of range for height {height}"
    )))
}

/// Returns the root path of the chunk holding the hash of `path`.
pub fn chunk_path_for(path: Path, height: u32) -> Result<Path, VmapError> {
    check_height(height)?;

    if path == path::ROOT_PATH {
        return Err(VmapError::invalid("the root path does not belong to a chunk"));
    }

    let path_rank = path::rank(path);
    let chunk_rank = (path_rank - 1) / height * height;

    Ok(path::ancestor(path, path_rank - chunk_rank))
}

/// Position of `path` within the chunk rooted at `chunk_path`.
///
/// Walks down from the chunk's first child rank, adding up the level sizes
/// (2, 4, 8, ...) until the rank of `path` is reached.
pub fn path_index_in_chunk(path: Path, chunk_path: Path, height: u32) -> Result<usize, VmapError> {
    check_chunk_path(chunk_path, height)?;

    let chunk_rank = path::rank(chunk_path);
    let path_rank = path::rank(path);

    if path_rank <= chunk_rank
        || path_rank > chunk_rank + height
        || !path::is_descendant(path, chunk_path)
    {
        return Err(VmapError::invalid(format!(
            "path {path} is not inside the chunk rooted at {chunk_path} with height {height}"
        )));
    }

    let mut first = path::left_child(chunk_path);
    let mut level_size = 2_u64;
    let mut index = 0_u64;

    while path::rank(first) < path_rank {
        index += level_size;
        level_size <<= 1;
        first = path::left_child(first);
    }

    let index = usize::try_from(index + (path - first))
        .map_err(|_| VmapError::invalid("chunk index does not fit in usize"))?;

    if index >= chunk_size(height) {
        return Err(VmapError::invalid(format!(
            "index {index} exceeds chunk size {}",
            chunk_size(height)
        )));
    }

    Ok(index)
}

/// Path stored at `index` within the chunk rooted at `chunk_path`.
pub fn path_in_chunk(chunk_path: Path, index: usize, height: u32) -> Result<Path, VmapError> {
    check_chunk_path(chunk_path, height)?;

    if index >= chunk_size(height) {
        return Err(VmapError::invalid(format!(
            "index {index} is out of range for a chunk of height {height}"
        )));
    }

    let mut first = path::left_child(chunk_path);
    let mut level_size = 2_usize;
    let mut remaining = index;

    while remaining >= level_size {
        remaining -= level_size;
        level_size <<= 1;
        first = path::left_child(first);
    }

    Ok(first + remaining as u64)
}

/// Hashes of one sub-tree of the virtual tree.
///
/// Slots at different indices may be written from different threads by
/// splitting the buffer with [`HashChunk::slots_mut`]; one slot is only ever
/// written through a single `&mut` borrow. `Clone` is a deep copy of the
/// buffer, used when a newer view diverges from the chunk it shares.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HashChunk {
    path: Path,
    height: u32,
    hash_data: Box<[u8]>,
}

impl HashChunk {
    /// Creates a zero-filled chunk rooted at `path`.
    pub fn new(path: Path, height: u32) -> Result<Self, VmapError> {
        check_chunk_path(path, height)?;

        if path::rank(path) + height > MAX_RANK {
            return Err(VmapError::invalid(format!(
                "chunk rooted at {path} with height {height} reaches past rank {MAX_RANK}"
            )));
        }

        Ok(Self {
            path,
            height,
            hash_data: vec![0; DIGEST_LENGTH * chunk_size(height)].into_boxed_slice(),
        })
    }

    /// Builds a chunk from existing hash bytes.
    pub fn from_parts(path: Path, height: u32, hash_data: Vec<u8>) -> Result<Self, VmapError> {
        let mut chunk = Self::new(path, height)?;

        if hash_data.len() != chunk.hash_data.len() {
            return Err(VmapError::invalid(format!(
                "hash data of a height {height} chunk must be {} bytes, got {}",
                chunk.hash_data.len(),
                hash_data.len()
            )));
        }

        chunk.hash_data = hash_data.into_boxed_slice();

        Ok(chunk)
    }

    /// Root path of the chunk.
    #[must_use]
    pub const fn path(&self) -> Path {
        self.path
    }

    /// Number of ranks covered.
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Id of this chunk.
    pub fn id(&self) -> Result<ChunkId, VmapError> {
        path_to_chunk_id(self.path, self.height)
    }

    /// Number of hash slots.
    #[must_use]
    pub const fn size(&self) -> usize {
        chunk_size(self.height)
    }

    /// Raw hash bytes, slot after slot.
    #[must_use]
    pub fn hash_data(&self) -> &[u8] {
        &self.hash_data
    }

    /// Whether `path` is stored in this chunk.
    #[must_use]
    pub fn contains(&self, path: Path) -> bool {
        path_index_in_chunk(path, self.path, self.height).is_ok()
    }

    fn slot_range(index: usize) -> Result<Range<usize>, VmapError> {
        index
            .checked_mul(DIGEST_LENGTH)
            .and_then(|start| Some(start..start.checked_add(DIGEST_LENGTH)?))
            .ok_or_else(|| VmapError::invalid(format!("hash index {index} is out of range")))
    }

    fn slot(&self, index: usize) -> Result<&[u8], VmapError> {
        self.hash_data
            .get(Self::slot_range(index)?)
            .ok_or_else(|| VmapError::invalid(format!("hash index {index} is out of range")))
    }

    /// Reads the hash at slot `index`.
    pub fn hash_at_index(&self, index: usize) -> Result<Hash, VmapError> {
        let mut hash = NULL_HASH;
        hash.copy_from_slice(self.slot(index)?);
        Ok(hash)
    }

    /// Writes the hash at slot `index`.
    pub fn set_hash_at_index(&mut self, index: usize, hash: &Hash) -> Result<(), VmapError> {
        let slot = self
            .hash_data
            .get_mut(Self::slot_range(index)?)
            .ok_or_else(|| VmapError::invalid(format!("hash index {index} is out of range")))?;

        slot.copy_from_slice(hash);

        Ok(())
    }

    /// Reads the hash of `path`.
    pub fn hash_at_path(&self, path: Path) -> Result<Hash, VmapError> {
        self.hash_at_index(path_index_in_chunk(path, self.path, self.height)?)
    }

    /// Writes the hash of `path`.
    pub fn set_hash_at_path(&mut self, path: Path, hash: &Hash) -> Result<(), VmapError> {
        let index = path_index_in_chunk(path, self.path, self.height)?;
        self.set_hash_at_index(index, hash)
    }

    /// Serializes the chunk, see [`codec::encode`].
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        codec::encode(self)
    }

    /// Parses a chunk, see [`codec::decode`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, VmapError> {
        codec::decode(bytes)
    }

    /// Splits the buffer into one mutable slice per slot, in index order.
    pub fn slots_mut(&mut self) -> ChunksExactMut<'_, u8> {
        self.hash_data.chunks_exact_mut(DIGEST_LENGTH)
    }
}
