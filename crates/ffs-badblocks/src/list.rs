//! Ordered, duplicate-free set of bad block numbers.

use ffs_types::BlockNumber;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::collections::btree_set;

/// In-memory bad-block list.
///
/// Iteration is ascending, so persisting the same set twice always writes
/// the same block map. Dropping the list releases its storage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BadBlockList {
    blocks: BTreeSet<BlockNumber>,
}

impl BadBlockList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `block`. Returns `false` if it was already present.
    ///
    /// Callers filter out `BlockNumber::NONE` before inserting.
    pub fn insert(&mut self, block: BlockNumber) -> bool {
        self.blocks.insert(block)
    }

    #[must_use]
    pub fn contains(&self, block: BlockNumber) -> bool {
        self.blocks.contains(&block)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Ascending iteration; call again to restart.
    pub fn iter(&self) -> impl Iterator<Item = BlockNumber> + '_ {
        self.blocks.iter().copied()
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<BlockNumber> {
        self.iter().collect()
    }
}

impl FromIterator<BlockNumber> for BadBlockList {
    fn from_iter<I: IntoIterator<Item = BlockNumber>>(iter: I) -> Self {
        Self {
            blocks: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a BadBlockList {
    type Item = BlockNumber;
    type IntoIter = std::iter::Copied<btree_set::Iter<'a, BlockNumber>>;

    fn into_iter(self) -> Self::IntoIter {
        self.blocks.iter().copied()
    }
}
