//! Key-value map over a dense, left-filled virtual merkle tree.
//!
//! A [`VirtualMap`] is one view of a lineage. Only the newest view is
//! mutable; [`VirtualMap::copy`] freezes the receiver and hands back a new
//! mutable view that shares everything with it until written. Frozen views
//! are hashed with [`VirtualMap::hash`], and once released they are folded
//! into the committed base by [`VirtualMap::merge_released`].
//!
//! With `n` leaves the tree occupies every path up to the last leaf:
//!
//! | leaves | first leaf | last leaf |
//! |--------|------------|-----------|
//! | 0      | -          | -         |
//! | 1      | 1          | 1         |
//! | n ≥ 2  | n - 1      | 2n - 2    |

mod layer;

#[cfg(test)]
#[path = "tests/map.rs"]
mod tests;

use core::fmt;
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::chunk::Hash;
use crate::config::VirtualMapConfig;
use crate::error::VmapError;
use crate::index::{ChunkBackend, InMemoryChunkBackend, VirtualIndex};
use crate::path::{Path, ROOT_PATH};
use layer::{Base, Layer};

/// A key-value pair stored at a leaf path.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LeafRecord {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Inclusive range of leaf paths.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LeafRange {
    pub first: Path,
    pub last: Path,
}

impl LeafRange {
    const fn single() -> Self {
        Self { first: 1, last: 1 }
    }

    /// Range of a tree holding `leaves` leaves.
    #[must_use]
    pub const fn for_leaf_count(leaves: u64) -> Option<Self> {
        match leaves {
            0 => None,
            1 => Some(Self::single()),
            n => Some(Self {
                first: n - 1,
                last: 2 * n - 2,
            }),
        }
    }

    /// Number of leaves.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.last - self.first + 1
    }

    #[must_use]
    pub const fn contains(&self, path: Path) -> bool {
        self.first <= path && path <= self.last
    }
}

/// Lifecycle of a view.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ViewState {
    /// Accepts `put` and `remove`.
    Mutable,
    /// Frozen by `copy()`, root hash not computed yet.
    ImmutablePendingHash,
    /// Frozen with a computed root hash.
    Hashed,
    /// Hashed with every reservation released.
    Destroyed,
}

type Lineage = Arc<Mutex<VecDeque<Arc<Layer>>>>;

/// One view of a virtual map lineage.
pub struct VirtualMap {
    layer: Arc<Layer>,
    lineage: Lineage,
}

impl fmt::Debug for VirtualMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualMap")
            .field("version", &self.layer.version())
            .field("state", &self.state())
            .field("range", &self.layer.range())
            .finish_non_exhaustive()
    }
}

impl VirtualMap {
    /// Creates an empty map whose chunks are persisted in `backend`.
    pub fn new(config: &VirtualMapConfig, backend: Arc<dyn ChunkBackend>) -> Result<Self, VmapError> {
        let index = VirtualIndex::new(config.chunk_height, config.max_cached_chunks, backend)?;
        let base = Arc::new(RwLock::new(Base::new(index)));
        let layer = Arc::new(Layer::new(0, None, base, None));

        debug!(
            chunk_height = config.chunk_height,
            max_cached_chunks = config.max_cached_chunks,
            "Created virtual map"
        );

        Ok(Self {
            lineage: Arc::new(Mutex::new(VecDeque::from([Arc::clone(&layer)]))),
            layer,
        })
    }

    /// Creates an empty map backed by memory only.
    pub fn in_memory(config: &VirtualMapConfig) -> Result<Self, VmapError> {
        Self::new(config, Arc::new(InMemoryChunkBackend::new()))
    }

    /// Version of this view; each `copy()` increments it.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.layer.version()
    }

    #[must_use]
    pub fn state(&self) -> ViewState {
        self.layer.status.lock().state
    }

    /// Version of the newest view merged into the committed base.
    #[must_use]
    pub fn committed_version(&self) -> Option<u64> {
        self.layer.base().read().version()
    }

    /// Root hash of the committed base.
    #[must_use]
    pub fn committed_root_hash(&self) -> Hash {
        self.layer.base().read().root_hash()
    }

    /// Chunks held in memory by the committed index.
    #[must_use]
    pub fn cached_chunks(&self) -> usize {
        self.layer.base().read().index().cached()
    }

    fn ensure_readable(&self) -> Result<(), VmapError> {
        if self.layer.status.lock().reservations == 0 {
            return Err(VmapError::illegal(format!(
                "view {} has been released",
                self.layer.version()
            )));
        }

        Ok(())
    }

    /// Number of leaves.
    pub fn len(&self) -> Result<u64, VmapError> {
        self.ensure_readable()?;
        Ok(self.layer.range().map_or(0, |range| range.len()))
    }

    pub fn is_empty(&self) -> Result<bool, VmapError> {
        Ok(self.len()? == 0)
    }

    pub fn first_leaf_path(&self) -> Result<Option<Path>, VmapError> {
        self.ensure_readable()?;
        Ok(self.layer.range().map(|range| range.first))
    }

    pub fn last_leaf_path(&self) -> Result<Option<Path>, VmapError> {
        self.ensure_readable()?;
        Ok(self.layer.range().map(|range| range.last))
    }

    /// Path of the leaf holding `key`.
    pub fn path_of(&self, key: &[u8]) -> Result<Option<Path>, VmapError> {
        self.ensure_readable()?;
        Ok(self.layer.key_path(key))
    }

    pub fn contains_key(&self, key: &[u8]) -> Result<bool, VmapError> {
        Ok(self.path_of(key)?.is_some())
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, VmapError> {
        let Some(path) = self.path_of(key)? else {
            return Ok(None);
        };

        let record = self
            .layer
            .leaf(path)
            .ok_or_else(|| VmapError::illegal(format!("key index points at empty path {path}")))?;

        Ok(Some(record.value))
    }

    /// Leaf stored at `path`.
    pub fn leaf(&self, path: Path) -> Result<Option<LeafRecord>, VmapError> {
        self.ensure_readable()?;

        match self.layer.range() {
            Some(range) if range.contains(path) => Ok(self.layer.leaf(path)),
            _ => Ok(None),
        }
    }

    /// Every leaf in path order.
    pub fn leaves(&self) -> Result<Vec<(Path, LeafRecord)>, VmapError> {
        self.ensure_readable()?;

        let Some(range) = self.layer.range() else {
            return Ok(Vec::new());
        };

        (range.first..=range.last)
            .map(|path| {
                self.layer
                    .leaf(path)
                    .map(|record| (path, record))
                    .ok_or_else(|| VmapError::illegal(format!("leaf range has a gap at path {path}")))
            })
            .collect()
    }

    fn ensure_mutable(&self, state: ViewState) -> Result<(), VmapError> {
        if state != ViewState::Mutable {
            return Err(VmapError::illegal(format!(
                "view {} is {state:?} and cannot be modified",
                self.layer.version()
            )));
        }

        Ok(())
    }

    /// Inserts or overwrites `key`, returning the previous value.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<Option<Vec<u8>>, VmapError> {
        let status = self.layer.status.lock();
        self.ensure_mutable(status.state)?;

        let mut delta = self.layer.leaves_mut();
        let record = LeafRecord { key, value };

        if let Some(path) = self.layer.key_path_in(&delta, &record.key) {
            let previous = self.layer.leaf_in(&delta, path)?;
            delta.put_leaf(path, record);
            return Ok(Some(previous.value));
        }

        let path = self.layer.grow(&mut delta, record)?;

        debug!(version = self.layer.version(), path, "Added leaf");

        Ok(None)
    }

    /// Removes `key`, returning its value.
    pub fn remove(&self, key: &[u8]) -> Result<Option<Vec<u8>>, VmapError> {
        let status = self.layer.status.lock();
        self.ensure_mutable(status.state)?;

        let mut delta = self.layer.leaves_mut();

        let Some(path) = self.layer.key_path_in(&delta, key) else {
            return Ok(None);
        };

        let removed = self.layer.shrink(&mut delta, path)?;

        debug!(version = self.layer.version(), path, "Removed leaf");

        Ok(Some(removed.value))
    }

    /// Freezes this view and returns the new mutable view of the lineage.
    pub fn copy(&self) -> Result<Self, VmapError> {
        let mut status = self.layer.status.lock();
        self.ensure_mutable(status.state)?;

        status.state = ViewState::ImmutablePendingHash;

        let layer = Arc::new(Layer::new(
            self.layer.version() + 1,
            Some(Arc::clone(&self.layer)),
            Arc::clone(self.layer.base()),
            self.layer.range(),
        ));

        self.lineage.lock().push_back(Arc::clone(&layer));

        debug!(from = self.layer.version(), to = layer.version(), "Copied view");

        Ok(Self {
            layer,
            lineage: Arc::clone(&self.lineage),
        })
    }

    /// Hashes this view, and any older view not hashed yet, returning the
    /// root hash. Hashing an already hashed view returns the stored hash.
    pub fn hash(&self) -> Result<Hash, VmapError> {
        self.layer.hash()
    }

    /// Root hash of a hashed view.
    ///
    /// Fails with [`VmapError::NotHashedYet`] until [`hash`](Self::hash) has
    /// run; it never blocks.
    pub fn root_hash(&self) -> Result<Hash, VmapError> {
        self.layer.root_hash().ok_or(VmapError::NotHashedYet {
            version: self.layer.version(),
        })
    }

    /// Hash of `path` in a hashed view. Path 0 is the root.
    pub fn hash_at(&self, path: Path) -> Result<Hash, VmapError> {
        self.ensure_readable()?;
        let root_hash = self.root_hash()?;

        if path == ROOT_PATH {
            return Ok(root_hash);
        }

        match self.layer.range() {
            Some(range) if path <= range.last => self.layer.hash_of(path),
            _ => Err(VmapError::invalid(format!("path {path} is not part of the tree"))),
        }
    }

    /// Adds a reservation, keeping the view alive.
    pub fn reserve(&self) -> Result<u32, VmapError> {
        let mut status = self.layer.status.lock();

        if status.reservations == 0 {
            return Err(VmapError::illegal(format!(
                "view {} has been released",
                self.layer.version()
            )));
        }

        status.reservations += 1;

        Ok(status.reservations)
    }

    /// Drops a reservation. Releasing the last one seals a mutable view and
    /// destroys a hashed one; the layer is merged by
    /// [`merge_released`](Self::merge_released).
    pub fn release(&self) -> Result<ViewState, VmapError> {
        let mut status = self.layer.status.lock();

        if status.reservations == 0 {
            return Err(VmapError::illegal(format!(
                "view {} has already been released",
                self.layer.version()
            )));
        }

        status.reservations -= 1;

        if status.reservations == 0 {
            status.state = match status.state {
                ViewState::Mutable | ViewState::ImmutablePendingHash => ViewState::ImmutablePendingHash,
                ViewState::Hashed | ViewState::Destroyed => ViewState::Destroyed,
            };

            debug!(version = self.layer.version(), state = ?status.state, "Released view");
        }

        Ok(status.state)
    }

    /// Folds the oldest released views into the committed base, hashing them
    /// first when needed, and persists their chunks. Stops at the first view
    /// that still holds a reservation. Returns the number of merged views.
    pub fn merge_released(&self) -> Result<usize, VmapError> {
        let mut lineage = self.lineage.lock();
        let mut merged = 0;

        while let Some(oldest) = lineage.front().cloned() {
            if oldest.status.lock().reservations > 0 {
                break;
            }

            let _root_hash = oldest.hash()?;
            oldest.merge_into_base()?;

            let _merged = lineage.pop_front();
            if let Some(next) = lineage.front() {
                next.detach();
            }

            merged += 1;
        }

        if merged > 0 {
            info!(
                merged,
                committed = ?self.committed_version(),
                root_hash = %hex(&self.committed_root_hash()),
                "Merged released views"
            );
        }

        Ok(merged)
    }
}

fn hex(hash: &Hash) -> String {
    hash.iter().map(|byte| format!("{byte:02x}")).collect()
}
