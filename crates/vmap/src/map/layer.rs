//! Copy-on-write layers of a virtual map lineage.
//!
//! Every view owns one layer: a shadow of the leaf and hash changes made
//! while it was the mutable view, stacked over its parent layer. Lookups walk
//! from the newest layer towards the committed [`Base`], which owns the
//! [`VirtualIndex`].

use core::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use rayon::prelude::*;
use tracing::{debug, trace};

use crate::chunk::{self, ChunkId, Hash, HashChunk, NULL_HASH};
use crate::error::VmapError;
use crate::hasher::{internal_hash, leaf_hash};
use crate::index::VirtualIndex;
use crate::path::{self, Path, ROOT_PATH};

use super::{LeafRange, LeafRecord, ViewState};

#[derive(Clone, Debug)]
pub(super) enum Change<T> {
    Put(T),
    Delete,
}

impl<T: Clone> Change<T> {
    fn value(&self) -> Option<T> {
        match self {
            Self::Put(value) => Some(value.clone()),
            Self::Delete => None,
        }
    }
}

/// State committed from merged layers.
#[derive(Debug)]
pub(super) struct Base {
    leaves: BTreeMap<Path, LeafRecord>,
    keys: HashMap<Vec<u8>, Path>,
    index: VirtualIndex,
    range: Option<LeafRange>,
    root_hash: Hash,
    version: Option<u64>,
}

impl Base {
    pub(super) fn new(index: VirtualIndex) -> Self {
        Self {
            leaves: BTreeMap::new(),
            keys: HashMap::new(),
            index,
            range: None,
            root_hash: NULL_HASH,
            version: None,
        }
    }

    pub(super) const fn version(&self) -> Option<u64> {
        self.version
    }

    pub(super) const fn root_hash(&self) -> Hash {
        self.root_hash
    }

    pub(super) const fn index(&self) -> &VirtualIndex {
        &self.index
    }
}

#[derive(Debug, Default)]
pub(super) struct LeafDelta {
    leaves: HashMap<Path, Change<LeafRecord>>,
    keys: HashMap<Vec<u8>, Change<Path>>,
    pub(super) range: Option<LeafRange>,
    dirty: BTreeSet<Path>,
}

impl LeafDelta {
    pub(super) fn put_leaf(&mut self, path: Path, record: LeafRecord) {
        let _previous = self.keys.insert(record.key.clone(), Change::Put(path));
        let _previous = self.leaves.insert(path, Change::Put(record));
        let _new = self.dirty.insert(path);
    }

    fn delete_leaf(&mut self, path: Path) {
        let _previous = self.leaves.insert(path, Change::Delete);
    }

    fn delete_key(&mut self, key: Vec<u8>) {
        let _previous = self.keys.insert(key, Change::Delete);
    }
}

#[derive(Debug, Default)]
struct HashDelta {
    chunks: HashMap<ChunkId, HashChunk>,
    root_hash: Option<Hash>,
}

#[derive(Debug)]
pub(super) struct Status {
    pub(super) state: ViewState,
    pub(super) reservations: u32,
}

#[derive(Debug)]
pub(super) struct Layer {
    version: u64,
    height: u32,
    parent: RwLock<Option<Arc<Layer>>>,
    base: Arc<RwLock<Base>>,
    leaves: RwLock<LeafDelta>,
    hashes: RwLock<HashDelta>,
    pub(super) status: Mutex<Status>,
    hashing: Mutex<()>,
}

impl Layer {
    pub(super) fn new(
        version: u64,
        parent: Option<Arc<Self>>,
        base: Arc<RwLock<Base>>,
        range: Option<LeafRange>,
    ) -> Self {
        let height = base.read().index.height();

        Self {
            version,
            height,
            parent: RwLock::new(parent),
            base,
            leaves: RwLock::new(LeafDelta {
                range,
                ..LeafDelta::default()
            }),
            hashes: RwLock::new(HashDelta::default()),
            status: Mutex::new(Status {
                state: ViewState::Mutable,
                reservations: 1,
            }),
            hashing: Mutex::new(()),
        }
    }

    pub(super) const fn version(&self) -> u64 {
        self.version
    }

    pub(super) fn base(&self) -> &Arc<RwLock<Base>> {
        &self.base
    }

    pub(super) fn parent(&self) -> Option<Arc<Self>> {
        self.parent.read().clone()
    }

    pub(super) fn detach(&self) {
        *self.parent.write() = None;
    }

    pub(super) fn range(&self) -> Option<LeafRange> {
        self.leaves.read().range
    }

    pub(super) fn root_hash(&self) -> Option<Hash> {
        self.hashes.read().root_hash
    }

    /// Walks the ancestors of this layer, then the base.
    fn find_below<T>(
        &self,
        mut lookup: impl FnMut(&Self) -> Option<T>,
        base: impl FnOnce(&Base) -> T,
    ) -> T {
        let mut current = self.parent();

        while let Some(layer) = current {
            if let Some(found) = lookup(layer.as_ref()) {
                return found;
            }
            current = layer.parent();
        }

        base(&self.base.read())
    }

    fn find<T>(&self, mut lookup: impl FnMut(&Self) -> Option<T>, base: impl FnOnce(&Base) -> T) -> T {
        match lookup(self) {
            Some(found) => found,
            None => self.find_below(lookup, base),
        }
    }

    fn key_path_below(&self, key: &[u8]) -> Option<Path> {
        self.find_below(
            |layer| layer.leaves.read().keys.get(key).map(Change::value),
            |base| base.keys.get(key).copied(),
        )
    }

    fn leaf_below(&self, path: Path) -> Option<LeafRecord> {
        self.find_below(
            |layer| layer.leaves.read().leaves.get(&path).map(Change::value),
            |base| base.leaves.get(&path).cloned(),
        )
    }

    pub(super) fn key_path(&self, key: &[u8]) -> Option<Path> {
        let own = self.leaves.read().keys.get(key).map(Change::value);
        own.unwrap_or_else(|| self.key_path_below(key))
    }

    pub(super) fn leaf(&self, path: Path) -> Option<LeafRecord> {
        let own = self.leaves.read().leaves.get(&path).map(Change::value);
        own.unwrap_or_else(|| self.leaf_below(path))
    }

    /// Key lookup for the mutable layer while it holds its own write lock.
    pub(super) fn key_path_in(&self, delta: &LeafDelta, key: &[u8]) -> Option<Path> {
        match delta.keys.get(key) {
            Some(change) => change.value(),
            None => self.key_path_below(key),
        }
    }

    pub(super) fn leaf_in(&self, delta: &LeafDelta, path: Path) -> Result<LeafRecord, VmapError> {
        let record = match delta.leaves.get(&path) {
            Some(change) => change.value(),
            None => self.leaf_below(path),
        };

        record.ok_or_else(|| VmapError::illegal(format!("no leaf stored at path {path}")))
    }

    pub(super) fn leaves_mut(&self) -> RwLockWriteGuard<'_, LeafDelta> {
        self.leaves.write()
    }

    /// Inserts a leaf for a key that is not in the map yet, growing the tree
    /// by one leaf. Returns the path of the new leaf.
    pub(super) fn grow(&self, delta: &mut LeafDelta, record: LeafRecord) -> Result<Path, VmapError> {
        let (path, range) = match delta.range {
            None => (1, LeafRange::single()),
            Some(range) if range.len() == 1 => (
                2,
                LeafRange {
                    first: 1,
                    last: 2,
                },
            ),
            Some(range) => {
                let first = range.first;
                let moved = self.leaf_in(delta, first)?;

                delta.delete_leaf(first);
                delta.put_leaf(path::left_child(first), moved);

                (
                    path::right_child(first),
                    LeafRange {
                        first: first + 1,
                        last: range.last + 2,
                    },
                )
            }
        };

        delta.put_leaf(path, record);
        delta.range = Some(range);

        Ok(path)
    }

    /// Removes the leaf at `path`, keeping the tree dense: the last leaf
    /// takes its place, then the sibling of the vacated last slot is lifted
    /// into their parent.
    pub(super) fn shrink(&self, delta: &mut LeafDelta, path: Path) -> Result<LeafRecord, VmapError> {
        let range = delta
            .range
            .ok_or_else(|| VmapError::illegal("removing from an empty tree"))?;

        let removed = self.leaf_in(delta, path)?;
        delta.delete_key(removed.key.clone());

        let last = range.last;

        if path != last {
            let moved = self.leaf_in(delta, last)?;
            delta.put_leaf(path, moved);
        }
        delta.delete_leaf(last);

        delta.range = match range.len() {
            1 => None,
            2 => Some(LeafRange::single()),
            _ => {
                let sibling = last - 1;
                let parent = path::parent(last)
                    .ok_or_else(|| VmapError::illegal("the last leaf cannot be the root"))?;

                let lifted = self.leaf_in(delta, sibling)?;
                delta.delete_leaf(sibling);
                delta.put_leaf(parent, lifted);

                Some(LeafRange {
                    first: parent,
                    last: sibling - 1,
                })
            }
        };

        Ok(removed)
    }

    fn chunk_id(&self, path: Path) -> Result<ChunkId, VmapError> {
        chunk::path_to_chunk_id(chunk::chunk_path_for(path, self.height)?, self.height)
    }

    /// Hash of a non-root path as seen by this layer.
    pub(super) fn hash_of(&self, path: Path) -> Result<Hash, VmapError> {
        let chunk_id = self.chunk_id(path)?;

        self.find(
            |layer| {
                layer
                    .hashes
                    .read()
                    .chunks
                    .get(&chunk_id)
                    .map(|chunk| chunk.hash_at_path(path))
            },
            |base| base.index.hash_at(path).map(|hash| hash.unwrap_or(NULL_HASH)),
        )
    }

    /// Copy of the newest version of a chunk, or a fresh one.
    fn chunk_for_write(&self, chunk_id: ChunkId) -> Result<HashChunk, VmapError> {
        let found = self.find(
            |layer| layer.hashes.read().chunks.get(&chunk_id).cloned().map(|chunk| Ok(Some(chunk))),
            |base| base.index.get(chunk_id),
        )?;

        match found {
            Some(chunk) => Ok(chunk),
            None => HashChunk::new(
                chunk::chunk_id_to_chunk_path(chunk_id, self.height)?,
                self.height,
            ),
        }
    }

    fn child_hash(
        &self,
        chunk: &HashChunk,
        finished: &HashMap<ChunkId, HashChunk>,
        child: Path,
    ) -> Result<Hash, VmapError> {
        if chunk.contains(child) {
            return chunk.hash_at_path(child);
        }

        match finished.get(&self.chunk_id(child)?) {
            Some(child_chunk) => child_chunk.hash_at_path(child),
            None => self.hash_of(child),
        }
    }

    /// Recomputes the hashes of every dirty path and its ancestors.
    ///
    /// Older layers are hashed first. Chunks are processed a chunk level at a
    /// time, deepest level first, with the chunks of one level hashed in
    /// parallel; each task owns its chunk and only reads chunks of deeper,
    /// already finished levels.
    pub(super) fn hash(self: &Arc<Self>) -> Result<Hash, VmapError> {
        let _hashing = self.hashing.lock();

        if let Some(root_hash) = self.root_hash() {
            return Ok(root_hash);
        }

        if self.status.lock().state == ViewState::Mutable {
            return Err(VmapError::illegal(format!(
                "view {} is still mutable and cannot be hashed",
                self.version
            )));
        }

        if let Some(parent) = self.parent() {
            let _parent_root = parent.hash()?;
        }

        let (range, dirty) = {
            let leaves = self.leaves.read();
            (leaves.range, leaves.dirty.clone())
        };

        let mut finished = HashMap::new();

        let root_hash = match range {
            None => NULL_HASH,
            Some(range) => {
                self.hash_chunks(range, &dirty, &mut finished)?;

                let left = self.child_hash_at_root(&finished, path::left_child(ROOT_PATH))?;
                let right = path::right_child(ROOT_PATH);
                let right = if right <= range.last {
                    Some(self.child_hash_at_root(&finished, right)?)
                } else {
                    None
                };

                internal_hash(&left, right.as_ref())
            }
        };

        debug!(
            version = self.version,
            dirty = dirty.len(),
            chunks = finished.len(),
            "Hashed view"
        );

        {
            let mut hashes = self.hashes.write();
            hashes.chunks = finished;
            hashes.root_hash = Some(root_hash);
        }

        let mut status = self.status.lock();
        status.state = if status.reservations == 0 {
            ViewState::Destroyed
        } else {
            ViewState::Hashed
        };

        Ok(root_hash)
    }

    fn child_hash_at_root(
        &self,
        finished: &HashMap<ChunkId, HashChunk>,
        child: Path,
    ) -> Result<Hash, VmapError> {
        match finished.get(&self.chunk_id(child)?) {
            Some(chunk) => chunk.hash_at_path(child),
            None => self.hash_of(child),
        }
    }

    fn hash_chunks(
        &self,
        range: LeafRange,
        dirty: &BTreeSet<Path>,
        finished: &mut HashMap<ChunkId, HashChunk>,
    ) -> Result<(), VmapError> {
        let mut touched = BTreeSet::new();

        for &dirty_path in dirty.iter().filter(|p| **p != ROOT_PATH && **p <= range.last) {
            let mut current = dirty_path;
            while current != ROOT_PATH && touched.insert(current) {
                current = path::parent(current).unwrap_or(ROOT_PATH);
            }
        }

        let leaf_paths: Vec<_> = touched.iter().copied().filter(|p| *p >= range.first).collect();

        let leaf_hashes: HashMap<Path, Hash> = leaf_paths
            .into_par_iter()
            .map(|leaf_path| {
                let record = self
                    .leaf(leaf_path)
                    .ok_or_else(|| VmapError::illegal(format!("no leaf stored at path {leaf_path}")))?;
                Ok((leaf_path, leaf_hash(&record.key, &record.value)))
            })
            .collect::<Result<_, VmapError>>()?;

        let mut levels: BTreeMap<u32, BTreeMap<ChunkId, Vec<Path>>> = BTreeMap::new();

        for &touched_path in &touched {
            let chunk_path = chunk::chunk_path_for(touched_path, self.height)?;
            levels
                .entry(path::rank(chunk_path) / self.height)
                .or_default()
                .entry(chunk::path_to_chunk_id(chunk_path, self.height)?)
                .or_default()
                .push(touched_path);
        }

        for (level, chunks) in levels.into_iter().rev() {
            let jobs = chunks
                .into_iter()
                .map(|(chunk_id, paths)| Ok((self.chunk_for_write(chunk_id)?, paths)))
                .collect::<Result<Vec<_>, VmapError>>()?;

            trace!(version = self.version, level, chunks = jobs.len(), "Hashing chunk level");

            let finished_below: &HashMap<_, _> = finished;

            let done = jobs
                .into_par_iter()
                .map(|(mut chunk, mut paths)| {
                    // deeper paths have larger numbers
                    paths.sort_unstable_by_key(|p| Reverse(*p));

                    for node in paths {
                        let hash = if node >= range.first {
                            *leaf_hashes.get(&node).ok_or_else(|| {
                                VmapError::illegal(format!("leaf {node} was not hashed"))
                            })?
                        } else {
                            let left = self.child_hash(&chunk, finished_below, path::left_child(node))?;
                            let right = path::right_child(node);
                            let right = if right <= range.last {
                                Some(self.child_hash(&chunk, finished_below, right)?)
                            } else {
                                None
                            };
                            internal_hash(&left, right.as_ref())
                        };

                        chunk.set_hash_at_path(node, &hash)?;
                    }

                    Ok(chunk)
                })
                .collect::<Result<Vec<_>, VmapError>>()?;

            for chunk in done {
                let _previous = finished.insert(chunk.id()?, chunk);
            }
        }

        Ok(())
    }

    /// Folds this layer into the base and persists its chunks.
    pub(super) fn merge_into_base(&self) -> Result<(), VmapError> {
        let leaves = self.leaves.read();
        let hashes = self.hashes.read();

        let root_hash = hashes.root_hash.ok_or(VmapError::NotHashedYet {
            version: self.version,
        })?;

        let mut base = self.base.write();

        for (leaf_path, change) in &leaves.leaves {
            match change {
                Change::Put(record) => {
                    let _previous = base.leaves.insert(*leaf_path, record.clone());
                }
                Change::Delete => {
                    let _previous = base.leaves.remove(leaf_path);
                }
            }
        }

        for (key, change) in &leaves.keys {
            match change {
                Change::Put(leaf_path) => {
                    let _previous = base.keys.insert(key.clone(), *leaf_path);
                }
                Change::Delete => {
                    let _previous = base.keys.remove(key);
                }
            }
        }

        base.range = leaves.range;
        base.index.set_last_leaf_path(leaves.range.map(|range| range.last))?;

        for chunk in hashes.chunks.values() {
            base.index.insert(chunk.clone())?;
        }

        let flushed = base.index.flush_all()?;

        base.root_hash = root_hash;
        base.version = Some(self.version);

        debug!(
            version = self.version,
            leaves = base.leaves.len(),
            flushed,
            "Merged view into base"
        );

        Ok(())
    }
}
