#![forbid(unsafe_code)]
//! Block bitmap and free-block accounting.
//!
//! ## Design
//!
//! The allocator state is layered:
//!
//! 1. **Bitmap**: raw bit manipulation on per-group block bitmaps.
//! 2. **GroupStats**: per-group free counts.
//! 3. **BlockBitmap**: the whole filesystem's bitmaps plus the
//!    superblock-level free count, kept in step on every transition.
//!
//! Bit `i` of group `g`'s bitmap describes block
//! `first_data_block + g * blocks_per_group + i`.

use ffs_error::{FfsError, Result};
use ffs_types::{BlockNumber, GroupNumber, block_to_group, group_first_block};
use serde::{Deserialize, Serialize};
use tracing::trace;

// ── Bitmap operations ───────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << bit_idx;
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] &= !(1 << bit_idx);
    }
}

/// Count free (zero) bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_count_free(bitmap: &[u8], count: u32) -> u32 {
    let full_bytes = (count / 8) as usize;
    let remainder = count % 8;
    let mut free = 0u32;

    for &byte in bitmap.iter().take(full_bytes) {
        free += byte.count_zeros();
    }

    if remainder > 0 && full_bytes < bitmap.len() {
        let byte = bitmap[full_bytes];
        for bit in 0..remainder {
            if (byte >> bit) & 1 == 0 {
                free += 1;
            }
        }
    }

    free
}

// ── Group stats ─────────────────────────────────────────────────────────────

/// Per-group free-block count, mirrored from the group descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupStats {
    pub group: GroupNumber,
    pub free_blocks: u32,
}

// ── Filesystem geometry ─────────────────────────────────────────────────────

/// Cached filesystem geometry needed by the bitmap layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsGeometry {
    pub blocks_per_group: u32,
    pub total_blocks: u64,
    pub first_data_block: u32,
    pub group_count: u32,
}

impl FsGeometry {
    /// Derive geometry from superblock fields, rejecting shapes the bitmap
    /// layer cannot describe.
    pub fn new(blocks_per_group: u32, total_blocks: u64, first_data_block: u32) -> Result<Self> {
        if blocks_per_group == 0 || blocks_per_group % 8 != 0 {
            return Err(FfsError::InvalidGeometry(format!(
                "blocks_per_group={blocks_per_group} (must be a non-zero multiple of 8)"
            )));
        }
        if total_blocks <= u64::from(first_data_block) {
            return Err(FfsError::InvalidGeometry(format!(
                "blocks_count={total_blocks} leaves no data blocks after first_data_block={first_data_block}"
            )));
        }
        let data_blocks = total_blocks - u64::from(first_data_block);
        let group_count = u32::try_from(data_blocks.div_ceil(u64::from(blocks_per_group)))
            .map_err(|_| {
                FfsError::InvalidGeometry(format!("group count overflows u32: {total_blocks}"))
            })?;
        Ok(Self {
            blocks_per_group,
            total_blocks,
            first_data_block,
            group_count,
        })
    }

    /// Number of blocks in a specific group (last group may be shorter).
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn blocks_in_group(&self, group: GroupNumber) -> u32 {
        let group_start = u64::from(self.first_data_block)
            + u64::from(group.0) * u64::from(self.blocks_per_group);
        let remaining = self.total_blocks.saturating_sub(group_start);
        if remaining >= u64::from(self.blocks_per_group) {
            self.blocks_per_group
        } else {
            remaining as u32
        }
    }

    /// Bitmap length in bytes for one group.
    #[must_use]
    pub fn bitmap_bytes(&self) -> usize {
        (self.blocks_per_group / 8) as usize
    }

    /// Absolute block number for a relative block within a group.
    #[must_use]
    pub fn group_block_to_absolute(&self, group: GroupNumber, rel_block: u32) -> BlockNumber {
        let first = group_first_block(group, self.blocks_per_group, self.first_data_block)
            .unwrap_or(BlockNumber(u64::MAX));
        BlockNumber(first.0.saturating_add(u64::from(rel_block)))
    }

    /// Convert absolute block to (group, relative_block), or `None` when the
    /// block lies outside `[first_data_block, total_blocks)`.
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn absolute_to_group_block(&self, block: BlockNumber) -> Option<(GroupNumber, u32)> {
        if block.0 < u64::from(self.first_data_block) || block.0 >= self.total_blocks {
            return None;
        }
        let group = block_to_group(block, self.blocks_per_group, self.first_data_block);
        let rel = (block.0 - u64::from(self.first_data_block)) % u64::from(self.blocks_per_group);
        Some((group, rel as u32))
    }
}

// ── Whole-filesystem bitmap ─────────────────────────────────────────────────

/// Block bitmaps for every group, with per-group and total free counts.
///
/// Invariant: `free_blocks == sum(groups[*].free_blocks)` and each group's
/// count equals the zero bits in its bitmap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockBitmap {
    geometry: FsGeometry,
    bitmaps: Vec<Vec<u8>>,
    groups: Vec<GroupStats>,
    free_blocks: u64,
}

impl BlockBitmap {
    /// Fresh bitmap with every data block free.
    ///
    /// Bits past the end of a short last group are set, the way mke2fs pads
    /// them, so they never count as free.
    #[must_use]
    pub fn new(geometry: FsGeometry) -> Self {
        let mut bitmaps = Vec::with_capacity(geometry.group_count as usize);
        let mut groups = Vec::with_capacity(geometry.group_count as usize);
        let mut free_blocks = 0_u64;
        for g in 0..geometry.group_count {
            let group = GroupNumber(g);
            let in_group = geometry.blocks_in_group(group);
            let mut bitmap = vec![0_u8; geometry.bitmap_bytes()];
            for pad in in_group..geometry.blocks_per_group {
                bitmap_set(&mut bitmap, pad);
            }
            bitmaps.push(bitmap);
            groups.push(GroupStats {
                group,
                free_blocks: in_group,
            });
            free_blocks += u64::from(in_group);
        }
        Self {
            geometry,
            bitmaps,
            groups,
            free_blocks,
        }
    }

    /// Rebuild from persisted parts and verify the free-count invariant.
    pub fn from_parts(
        geometry: FsGeometry,
        bitmaps: Vec<Vec<u8>>,
        groups: Vec<GroupStats>,
        free_blocks: u64,
    ) -> Result<Self> {
        if bitmaps.len() != geometry.group_count as usize
            || groups.len() != geometry.group_count as usize
        {
            return Err(FfsError::Format(format!(
                "expected {} groups, found {} bitmaps and {} descriptors",
                geometry.group_count,
                bitmaps.len(),
                groups.len()
            )));
        }
        let mut total = 0_u64;
        for (idx, (bitmap, stats)) in bitmaps.iter().zip(&groups).enumerate() {
            if bitmap.len() != geometry.bitmap_bytes() {
                return Err(FfsError::Format(format!(
                    "group {idx}: bitmap is {} bytes, expected {}",
                    bitmap.len(),
                    geometry.bitmap_bytes()
                )));
            }
            let counted = bitmap_count_free(bitmap, geometry.blocks_per_group);
            if counted != stats.free_blocks {
                return Err(FfsError::Corruption {
                    block: geometry.group_block_to_absolute(stats.group, 0).0,
                    detail: format!(
                        "group {} free count {} disagrees with bitmap ({counted})",
                        stats.group, stats.free_blocks
                    ),
                });
            }
            total += u64::from(counted);
        }
        if total != free_blocks {
            return Err(FfsError::Corruption {
                block: 0,
                detail: format!("superblock free count {free_blocks} disagrees with groups ({total})"),
            });
        }
        Ok(Self {
            geometry,
            bitmaps,
            groups,
            free_blocks,
        })
    }

    #[must_use]
    pub fn geometry(&self) -> &FsGeometry {
        &self.geometry
    }

    #[must_use]
    pub fn groups(&self) -> &[GroupStats] {
        &self.groups
    }

    #[must_use]
    pub fn bitmaps(&self) -> &[Vec<u8>] {
        &self.bitmaps
    }

    /// Superblock-level free block count.
    #[must_use]
    pub fn free_blocks(&self) -> u64 {
        self.free_blocks
    }

    fn locate(&self, block: BlockNumber) -> Result<(usize, u32)> {
        self.geometry
            .absolute_to_group_block(block)
            .map(|(group, rel)| (group.0 as usize, rel))
            .ok_or_else(|| FfsError::Corruption {
                block: block.0,
                detail: format!(
                    "block outside data range [{}, {})",
                    self.geometry.first_data_block, self.geometry.total_blocks
                ),
            })
    }

    /// Whether `block` is marked in use.
    pub fn is_used(&self, block: BlockNumber) -> Result<bool> {
        let (gidx, rel) = self.locate(block)?;
        Ok(bitmap_get(&self.bitmaps[gidx], rel))
    }

    /// Mark `block` in use. Returns `true` if the bit changed (and the free
    /// counts dropped by one).
    pub fn mark_used(&mut self, block: BlockNumber) -> Result<bool> {
        let (gidx, rel) = self.locate(block)?;
        if bitmap_get(&self.bitmaps[gidx], rel) {
            return Ok(false);
        }
        bitmap_set(&mut self.bitmaps[gidx], rel);
        self.groups[gidx].free_blocks -= 1;
        self.free_blocks -= 1;
        trace!(block = block.0, group = gidx, "block marked used");
        Ok(true)
    }

    /// Mark `block` free. Returns `true` if the bit changed (and the free
    /// counts rose by one).
    pub fn mark_free(&mut self, block: BlockNumber) -> Result<bool> {
        let (gidx, rel) = self.locate(block)?;
        if !bitmap_get(&self.bitmaps[gidx], rel) {
            return Ok(false);
        }
        bitmap_clear(&mut self.bitmaps[gidx], rel);
        self.groups[gidx].free_blocks += 1;
        self.free_blocks += 1;
        trace!(block = block.0, group = gidx, "block marked free");
        Ok(true)
    }
}
