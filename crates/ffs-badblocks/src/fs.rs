//! Metadata-layer boundary.
//!
//! The reconciler never touches bitmaps or the inode's block map directly;
//! it goes through [`BadBlockFs`]. The handle is borrowed mutably for the
//! whole run, so no other mutator can interleave.

use crate::list::BadBlockList;
use ffs_error::Result;
use ffs_types::{BlockNumber, BlockRange};
use serde::Serialize;

/// Verdict returned by a bad-block inode visitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockVisit {
    Unchanged,
    /// The visitor rewrote the slot; the metadata layer must persist it.
    Changed,
}

/// Bitmap delta applied by [`BadBlockFs::update_bad_block_inode`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BadBlockDelta {
    /// Blocks newly claimed by the inode and marked used.
    pub added: Vec<BlockNumber>,
    /// Blocks no longer claimed, returned to the free pool.
    pub removed: Vec<BlockNumber>,
}

impl BadBlockDelta {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Operations the reconciler needs from a filesystem handle.
pub trait BadBlockFs {
    /// Device identifier passed to the external scanner.
    fn device_name(&self) -> &str;

    /// `[first_data_block, blocks_count)` from the superblock.
    fn block_range(&self) -> BlockRange;

    /// Load the block bitmaps so later updates can adjust them.
    fn read_bitmaps(&mut self) -> Result<()>;

    /// Visit every non-zero slot of the bad-block inode's block map.
    ///
    /// A visitor may overwrite the slot (typically with `BlockNumber::NONE`)
    /// and return [`BlockVisit::Changed`]; the handle then rewrites that entry.
    fn iterate_bad_block_inode(
        &mut self,
        visit: &mut dyn FnMut(&mut BlockNumber) -> BlockVisit,
    ) -> Result<()>;

    /// Current set of blocks claimed by the bad-block inode.
    fn read_bad_block_inode(&self) -> Result<BadBlockList>;

    /// Make the inode claim exactly `list`, freeing blocks that left the set
    /// and marking newly added ones used. Blocks outside the delta are left
    /// alone.
    fn update_bad_block_inode(&mut self, list: &BadBlockList) -> Result<BadBlockDelta>;
}
