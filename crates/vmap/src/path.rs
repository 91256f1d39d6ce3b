//! Path arithmetic over the breadth-first numbering of a binary tree.
//!
//! ```text
//!                 0
//!           1           2
//!        3     4     5     6
//!       7 8   9 10 11 12 13 14
//! ```
//!
//! Every function here is pure and total over paths that fit in 63 bits.

/// A node position in the virtual tree.
pub type Path = u64;

/// The root path.
pub const ROOT_PATH: Path = 0;

/// Largest rank a 63-bit path can reach.
pub const MAX_RANK: u32 = 62;

/// Returns the left child of `path`.
#[must_use]
pub const fn left_child(path: Path) -> Path {
    (path << 1) + 1
}

/// Returns the right child of `path`.
#[must_use]
pub const fn right_child(path: Path) -> Path {
    (path << 1) + 2
}

/// Returns the parent of `path`, or `None` for the root.
#[must_use]
pub const fn parent(path: Path) -> Option<Path> {
    if path == ROOT_PATH {
        None
    } else {
        Some((path - 1) >> 1)
    }
}

/// Returns the depth of `path`; the root has rank 0.
#[must_use]
pub const fn rank(path: Path) -> u32 {
    Path::BITS - 1 - (path + 1).leading_zeros()
}

/// Whether `path` is the left child of its parent. The root is not.
#[must_use]
pub const fn is_left(path: Path) -> bool {
    (path & 1) == 1
}

/// Returns the other child of the parent of `path`.
#[must_use]
pub const fn sibling(path: Path) -> Option<Path> {
    if path == ROOT_PATH {
        None
    } else if is_left(path) {
        Some(path + 1)
    } else {
        Some(path - 1)
    }
}

/// Descends `levels` times to the left, giving the first path at rank
/// `rank(path) + levels` below `path`.
#[must_use]
pub const fn left_grand_child(path: Path, levels: u32) -> Path {
    ((path + 1) << levels) - 1
}

/// Returns the first (leftmost) path at `rank`.
#[must_use]
pub const fn first_path_in_rank(rank: u32) -> Path {
    (1 << rank) - 1
}

/// Returns the path at position `index` within `rank`.
#[must_use]
pub const fn path_at(rank: u32, index: u64) -> Path {
    first_path_in_rank(rank) + index
}

/// Position of `path` within its rank, counting from the left.
#[must_use]
pub const fn index_in_rank(path: Path) -> u64 {
    path - first_path_in_rank(rank(path))
}

/// Walks `levels` steps up from `path`.
#[must_use]
pub const fn ancestor(path: Path, levels: u32) -> Path {
    ((path + 1) >> levels) - 1
}

/// Whether `path` is `ancestor` itself or lies in the sub-tree below it.
#[must_use]
pub const fn is_descendant(path: Path, ancestor_path: Path) -> bool {
    let path_rank = rank(path);
    let ancestor_rank = rank(ancestor_path);

    path_rank >= ancestor_rank && ancestor(path, path_rank - ancestor_rank) == ancestor_path
}
