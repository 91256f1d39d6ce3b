//! Locally produced blocks waiting to be streamed.

use core::fmt::Debug;
use std::collections::BTreeMap;

use parking_lot::RwLock;

/// Source of the blocks a connection streams.
pub trait BlockBuffer: Send + Sync + Debug {
    /// Highest block number produced so far.
    fn last_produced_block(&self) -> Option<u64>;

    /// Whether the state needed to stream `block` is still held locally.
    fn has_block_state(&self, block: u64) -> bool;

    /// Items of a complete block.
    fn block(&self, block: u64) -> Option<Vec<Vec<u8>>>;

    /// Marks every block up to and including `block` as persisted by a block node.
    fn acknowledge(&self, block: u64);

    /// Lowest held block that no block node acknowledged yet.
    fn earliest_unacknowledged(&self) -> Option<u64>;
}

#[derive(Debug)]
struct BufferedBlock {
    items: Vec<Vec<u8>>,
    acknowledged: bool,
}

/// [`BlockBuffer`] that keeps every pushed block in memory.
#[derive(Debug, Default)]
pub struct InMemoryBlockBuffer {
    blocks: RwLock<BTreeMap<u64, BufferedBlock>>,
}

impl InMemoryBlockBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_block(&self, block: u64, items: Vec<Vec<u8>>) {
        let _previous = self.blocks.write().insert(
            block,
            BufferedBlock {
                items,
                acknowledged: false,
            },
        );
    }

    /// Drops acknowledged blocks below `block`.
    pub fn prune_before(&self, block: u64) -> usize {
        let mut blocks = self.blocks.write();
        let before = blocks.len();
        blocks.retain(|number, buffered| *number >= block || !buffered.acknowledged);
        before - blocks.len()
    }

    #[must_use]
    pub fn is_acknowledged(&self, block: u64) -> bool {
        self.blocks
            .read()
            .get(&block)
            .is_some_and(|buffered| buffered.acknowledged)
    }
}

impl BlockBuffer for InMemoryBlockBuffer {
    fn last_produced_block(&self) -> Option<u64> {
        self.blocks.read().last_key_value().map(|(number, _)| *number)
    }

    fn has_block_state(&self, block: u64) -> bool {
        self.blocks.read().contains_key(&block)
    }

    fn block(&self, block: u64) -> Option<Vec<Vec<u8>>> {
        self.blocks
            .read()
            .get(&block)
            .map(|buffered| buffered.items.clone())
    }

    fn acknowledge(&self, block: u64) {
        for (_, buffered) in self.blocks.write().range_mut(..=block) {
            buffered.acknowledged = true;
        }
    }

    fn earliest_unacknowledged(&self) -> Option<u64> {
        self.blocks
            .read()
            .iter()
            .find(|(_, buffered)| !buffered.acknowledged)
            .map(|(number, _)| *number)
    }
}
