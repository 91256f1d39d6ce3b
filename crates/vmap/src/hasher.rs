//! Digests of leaves and internal nodes.
//!
//! Leaf and internal digests are domain separated by a one byte prefix so a
//! leaf can never be passed off as an internal node.

use sha2::{Digest, Sha256};

use crate::chunk::{Hash, NULL_HASH};

const LEAF_PREFIX: u8 = 0x00;
const INTERNAL_PREFIX: u8 = 0x01;

/// Digest of a leaf record.
#[must_use]
pub fn leaf_hash(key: &[u8], value: &[u8]) -> Hash {
    let key_len = u32::try_from(key.len()).unwrap_or(u32::MAX);

    let mut hasher = Sha256::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update(key_len.to_be_bytes());
    hasher.update(key);
    hasher.update(value);
    hasher.finalize().into()
}

/// Digest of an internal node. A missing right child hashes as [`NULL_HASH`].
#[must_use]
pub fn internal_hash(left: &Hash, right: Option<&Hash>) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([INTERNAL_PREFIX]);
    hasher.update(left);
    hasher.update(right.unwrap_or(&NULL_HASH));
    hasher.finalize().into()
}
