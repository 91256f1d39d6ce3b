//! Chunk index: maps chunk ids to cached chunks and their persisted records.

#[cfg(test)]
#[path = "tests/index.rs"]
mod tests;

use core::fmt;
use core::num::NonZeroUsize;
use std::collections::BTreeMap;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::chunk::{self, ChunkId, Hash, HashChunk};
use crate::error::VmapError;
use crate::path::{self, Path};

/// Persistent home of serialized chunks.
///
/// Records are opaque byte blobs produced by [`HashChunk::to_bytes`].
pub trait ChunkBackend: Send + Sync + fmt::Debug {
    /// Reads the record of `chunk_id`, if one was stored.
    fn load(&self, chunk_id: ChunkId) -> Result<Option<Vec<u8>>, VmapError>;

    /// Stores (or replaces) the record of `chunk_id`.
    fn store(&self, chunk_id: ChunkId, record: Vec<u8>) -> Result<(), VmapError>;

    /// Drops the record of `chunk_id`.
    fn remove(&self, chunk_id: ChunkId) -> Result<(), VmapError>;

    /// Ids of all stored records, ascending.
    fn chunk_ids(&self) -> Result<Vec<ChunkId>, VmapError>;
}

/// Backend keeping records in memory.
#[derive(Debug, Default)]
pub struct InMemoryChunkBackend {
    records: RwLock<BTreeMap<ChunkId, Vec<u8>>>,
}

impl InMemoryChunkBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl ChunkBackend for InMemoryChunkBackend {
    fn load(&self, chunk_id: ChunkId) -> Result<Option<Vec<u8>>, VmapError> {
        Ok(self.records.read().get(&chunk_id).cloned())
    }

    fn store(&self, chunk_id: ChunkId, record: Vec<u8>) -> Result<(), VmapError> {
        let _previous = self.records.write().insert(chunk_id, record);
        Ok(())
    }

    fn remove(&self, chunk_id: ChunkId) -> Result<(), VmapError> {
        let _previous = self.records.write().remove(&chunk_id);
        Ok(())
    }

    fn chunk_ids(&self) -> Result<Vec<ChunkId>, VmapError> {
        Ok(self.records.read().keys().copied().collect())
    }
}

/// Location of a path's hash.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ChunkCoordinates {
    /// Root path of the owning chunk.
    pub chunk_path: Path,
    /// Id of the owning chunk.
    pub chunk_id: ChunkId,
}

#[derive(Debug)]
struct CachedChunk {
    chunk: HashChunk,
    dirty: bool,
}

/// Largest chunk id a tree whose last leaf sits at `last_leaf_path` uses.
///
/// The tree occupies every path up to `last_leaf_path`, so besides the chunk
/// of the last leaf the right end of the rank above can hold a chunk with a
/// larger id.
pub fn max_chunk_id_for(last_leaf_path: Path, height: u32) -> Result<ChunkId, VmapError> {
    let last_rank = path::rank(last_leaf_path);
    let mut max = chunk::path_to_chunk_id(chunk::chunk_path_for(last_leaf_path, height)?, height)?;

    if last_rank >= 2 {
        let rank_above_end = path::first_path_in_rank(last_rank) - 1;
        let above = chunk::path_to_chunk_id(chunk::chunk_path_for(rank_above_end, height)?, height)?;
        max = max.max(above);
    }

    Ok(max)
}

/// Translates paths into chunk coordinates and owns the chunk cache.
///
/// Chunks are created lazily on first [`resolve`](Self::resolve), loaded
/// from the backend when a record exists, and written back by
/// [`flush`](Self::flush) or when evicted.
pub struct VirtualIndex {
    height: u32,
    backend: Arc<dyn ChunkBackend>,
    cache: LruCache<ChunkId, CachedChunk>,
    max_chunk_id: Option<ChunkId>,
}

impl fmt::Debug for VirtualIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualIndex")
            .field("height", &self.height)
            .field("cached", &self.cache.len())
            .field("max_chunk_id", &self.max_chunk_id)
            .finish_non_exhaustive()
    }
}

impl VirtualIndex {
    pub fn new(
        height: u32,
        max_cached_chunks: usize,
        backend: Arc<dyn ChunkBackend>,
    ) -> Result<Self, VmapError> {
        // validates the height
        let _root = HashChunk::new(path::ROOT_PATH, height)?;

        let capacity = NonZeroUsize::new(max_cached_chunks)
            .ok_or_else(|| VmapError::invalid("the chunk cache must hold at least one chunk"))?;

        Ok(Self {
            height,
            backend,
            cache: LruCache::new(capacity),
            max_chunk_id: None,
        })
    }

    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Largest chunk id currently in range, `None` for an empty tree.
    #[must_use]
    pub const fn max_chunk_id(&self) -> Option<ChunkId> {
        self.max_chunk_id
    }

    /// Number of chunks held in memory.
    #[must_use]
    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    /// Computes the chunk holding the hash of `path`.
    pub fn chunk_for(&self, path: Path) -> Result<ChunkCoordinates, VmapError> {
        let chunk_path = chunk::chunk_path_for(path, self.height)?;

        Ok(ChunkCoordinates {
            chunk_path,
            chunk_id: chunk::path_to_chunk_id(chunk_path, self.height)?,
        })
    }

    /// Resizes the valid id range to the tree ending at `last_leaf_path`.
    ///
    /// Chunks beyond the new range are dropped from the cache and the backend.
    pub fn set_last_leaf_path(&mut self, last_leaf_path: Option<Path>) -> Result<(), VmapError> {
        let max = last_leaf_path
            .map(|last| max_chunk_id_for(last, self.height))
            .transpose()?;

        let out_of_range = |id: ChunkId| max.map_or(true, |max| id > max);

        let cached: Vec<_> = self
            .cache
            .iter()
            .map(|(id, _)| *id)
            .filter(|id| out_of_range(*id))
            .collect();
        for chunk_id in cached {
            let _dropped = self.cache.pop(&chunk_id);
        }

        for chunk_id in self.backend.chunk_ids()? {
            if out_of_range(chunk_id) {
                self.backend.remove(chunk_id)?;
            }
        }

        if max != self.max_chunk_id {
            debug!(?max, previous = ?self.max_chunk_id, "Chunk id range changed");
        }

        self.max_chunk_id = max;

        Ok(())
    }

    fn check_range(&self, chunk_id: ChunkId) -> Result<(), VmapError> {
        match self.max_chunk_id {
            Some(max) if chunk_id <= max => Ok(()),
            max => Err(VmapError::invalid(format!(
                "chunk id {chunk_id} is outside the tree (max chunk id {max:?})"
            ))),
        }
    }

    fn load(&self, chunk_id: ChunkId) -> Result<Option<HashChunk>, VmapError> {
        let Some(record) = self.backend.load(chunk_id)? else {
            return Ok(None);
        };

        let chunk = HashChunk::from_bytes(&record)?;

        if chunk.id()? != chunk_id {
            return Err(VmapError::Backend(format!(
                "record stored under chunk id {chunk_id} holds chunk {}",
                chunk.id()?
            )));
        }

        Ok(Some(chunk))
    }

    /// Returns the chunk `chunk_id` for writing, creating it zero-filled when
    /// neither the cache nor the backend has it. The chunk is marked dirty.
    pub fn resolve(&mut self, chunk_id: ChunkId) -> Result<&mut HashChunk, VmapError> {
        self.check_range(chunk_id)?;

        if !self.cache.contains(&chunk_id) {
            let chunk = match self.load(chunk_id)? {
                Some(chunk) => chunk,
                None => {
                    trace!(chunk_id, "Allocating chunk");
                    HashChunk::new(chunk::chunk_id_to_chunk_path(chunk_id, self.height)?, self.height)?
                }
            };

            self.make_room()?;

            let _previous = self.cache.put(chunk_id, CachedChunk { chunk, dirty: false });
        }

        let entry = self
            .cache
            .get_mut(&chunk_id)
            .ok_or_else(|| VmapError::illegal(format!("chunk {chunk_id} vanished from the cache")))?;

        entry.dirty = true;

        Ok(&mut entry.chunk)
    }

    /// Replaces chunk `chunk_id` wholesale.
    pub fn insert(&mut self, chunk: HashChunk) -> Result<(), VmapError> {
        if chunk.height() != self.height {
            return Err(VmapError::invalid(format!(
                "chunk height {} does not match index height {}",
                chunk.height(),
                self.height
            )));
        }

        let chunk_id = chunk.id()?;
        *self.resolve(chunk_id)? = chunk;

        Ok(())
    }

    /// Reads chunk `chunk_id` without caching it.
    pub fn get(&self, chunk_id: ChunkId) -> Result<Option<HashChunk>, VmapError> {
        if self.check_range(chunk_id).is_err() {
            return Ok(None);
        }

        if let Some(entry) = self.cache.peek(&chunk_id) {
            return Ok(Some(entry.chunk.clone()));
        }

        self.load(chunk_id)
    }

    /// Reads the stored hash of `path`, if its chunk exists.
    pub fn hash_at(&self, path: Path) -> Result<Option<Hash>, VmapError> {
        let coordinates = self.chunk_for(path)?;

        if self.check_range(coordinates.chunk_id).is_err() {
            return Ok(None);
        }

        if let Some(entry) = self.cache.peek(&coordinates.chunk_id) {
            return entry.chunk.hash_at_path(path).map(Some);
        }

        self.load(coordinates.chunk_id)?
            .map(|chunk| chunk.hash_at_path(path))
            .transpose()
    }

    /// Writes chunk `chunk_id` to the backend if it changed since the last flush.
    pub fn flush(&mut self, chunk_id: ChunkId) -> Result<(), VmapError> {
        let Some(entry) = self.cache.peek_mut(&chunk_id) else {
            return Ok(());
        };

        if entry.dirty {
            self.backend.store(chunk_id, entry.chunk.to_bytes())?;
            entry.dirty = false;
        }

        Ok(())
    }

    /// Flushes every dirty chunk, returning how many were written.
    pub fn flush_all(&mut self) -> Result<usize, VmapError> {
        let dirty: Vec<_> = self
            .cache
            .iter()
            .filter_map(|(id, entry)| entry.dirty.then_some(*id))
            .collect();

        for chunk_id in &dirty {
            self.flush(*chunk_id)?;
        }

        Ok(dirty.len())
    }

    /// Flushes chunk `chunk_id` and drops it from memory.
    pub fn evict(&mut self, chunk_id: ChunkId) -> Result<(), VmapError> {
        self.flush(chunk_id)?;
        let _evicted = self.cache.pop(&chunk_id);
        Ok(())
    }

    /// Evicts least recently used chunks until one more fits, writing back
    /// the dirty ones.
    fn make_room(&mut self) -> Result<(), VmapError> {
        while self.cache.len() >= self.cache.cap().get() {
            let Some((oldest, entry)) = self.cache.pop_lru() else {
                break;
            };

            trace!(chunk_id = oldest, dirty = entry.dirty, "Evicting least recently used chunk");

            if entry.dirty {
                if let Err(err) = self.backend.store(oldest, entry.chunk.to_bytes()) {
                    let _restored = self.cache.push(oldest, entry);
                    return Err(err);
                }
            }
        }

        Ok(())
    }
}
