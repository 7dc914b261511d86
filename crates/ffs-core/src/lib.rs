#![forbid(unsafe_code)]
//! Filesystem metadata handle.
//!
//! [`Filesystem`] owns the superblock summary, the per-group block bitmaps,
//! and the bad-block inode's block map, and implements
//! [`ffs_badblocks::BadBlockFs`] over them. State is persisted as a JSON
//! metadata image, replaced atomically (temp file + rename) on
//! [`Filesystem::flush`].
//!
//! Bitmaps are validated lazily in [`BadBlockFs::read_bitmaps`], the same
//! point at which e2fsprogs reads them, so a handle can be opened to list
//! bad blocks even when its bitmaps are inconsistent.

use ffs_alloc::{BlockBitmap, FsGeometry, GroupStats};
use ffs_badblocks::{BadBlockDelta, BadBlockFs, BadBlockList, BlockVisit};
use ffs_error::{FfsError, Result};
use ffs_types::{BlockNumber, BlockRange, BlockSize, InodeNumber};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Format tag written into every metadata image.
pub const IMAGE_FORMAT: &str = "ffs-metadata/v1";

/// Parameters for a fresh image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSpec {
    pub device_name: String,
    pub block_size: u32,
    pub blocks_count: u64,
    pub first_data_block: u32,
    pub blocks_per_group: u32,
}

impl Default for ImageSpec {
    fn default() -> Self {
        Self {
            device_name: String::new(),
            block_size: 1024,
            blocks_count: 8192,
            first_data_block: 1,
            blocks_per_group: 8192,
        }
    }
}

/// On-disk layout of the metadata image.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ImageFile {
    format: String,
    device_name: String,
    block_size: BlockSize,
    blocks_count: u64,
    first_data_block: u32,
    blocks_per_group: u32,
    free_blocks_count: u64,
    groups: Vec<GroupStats>,
    block_bitmaps: Vec<Vec<u8>>,
    bad_block_map: Vec<BlockNumber>,
}

/// Open filesystem handle.
#[derive(Debug)]
pub struct Filesystem {
    path: Option<PathBuf>,
    read_only: bool,
    device_name: String,
    block_size: BlockSize,
    geometry: FsGeometry,
    /// Persisted bitmap parts, consumed by `read_bitmaps`.
    raw_bitmaps: Option<(Vec<Vec<u8>>, Vec<GroupStats>, u64)>,
    bitmap: Option<BlockBitmap>,
    bad_block_map: Vec<BlockNumber>,
    dirty: bool,
}

impl Filesystem {
    /// Build a fresh in-memory filesystem with every data block free and an
    /// empty bad-block inode.
    pub fn new(spec: &ImageSpec) -> Result<Self> {
        let block_size =
            BlockSize::new(spec.block_size).map_err(|e| FfsError::InvalidGeometry(e.to_string()))?;
        let geometry =
            FsGeometry::new(spec.blocks_per_group, spec.blocks_count, spec.first_data_block)?;
        let bitmap = BlockBitmap::new(geometry.clone());
        Ok(Self {
            path: None,
            read_only: false,
            device_name: spec.device_name.clone(),
            block_size,
            geometry,
            raw_bitmaps: None,
            bitmap: Some(bitmap),
            bad_block_map: Vec::new(),
            dirty: true,
        })
    }

    /// Create a fresh image at `path` and write it out.
    pub fn create(path: impl AsRef<Path>, spec: &ImageSpec) -> Result<Self> {
        let mut fs = Self::new(spec)?;
        fs.path = Some(path.as_ref().to_path_buf());
        fs.flush()?;
        info!(
            path = %path.as_ref().display(),
            blocks = spec.blocks_count,
            groups = fs.geometry.group_count,
            "metadata image created"
        );
        Ok(fs)
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_mode(path.as_ref(), false)
    }

    /// Open without write access; `flush` with pending changes fails.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_mode(path.as_ref(), true)
    }

    fn open_with_mode(path: &Path, read_only: bool) -> Result<Self> {
        let file = File::open(path)?;
        let image: ImageFile = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| FfsError::Format(format!("{}: {e}", path.display())))?;
        if image.format != IMAGE_FORMAT {
            return Err(FfsError::Format(format!(
                "{}: unsupported image format {:?} (expected {IMAGE_FORMAT})",
                path.display(),
                image.format
            )));
        }
        let geometry = FsGeometry::new(
            image.blocks_per_group,
            image.blocks_count,
            image.first_data_block,
        )?;
        debug!(
            path = %path.display(),
            blocks = image.blocks_count,
            bad_blocks = image.bad_block_map.len(),
            read_only,
            "metadata image opened"
        );
        Ok(Self {
            path: Some(path.to_path_buf()),
            read_only,
            device_name: image.device_name,
            block_size: image.block_size,
            geometry,
            raw_bitmaps: Some((image.block_bitmaps, image.groups, image.free_blocks_count)),
            bitmap: None,
            bad_block_map: image.bad_block_map,
            dirty: false,
        })
    }

    #[must_use]
    pub fn block_size(&self) -> BlockSize {
        self.block_size
    }

    #[must_use]
    pub fn geometry(&self) -> &FsGeometry {
        &self.geometry
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Superblock free-block count.
    #[must_use]
    pub fn free_blocks(&self) -> u64 {
        match (&self.bitmap, &self.raw_bitmaps) {
            (Some(bitmap), _) => bitmap.free_blocks(),
            (None, Some((_, _, free))) => *free,
            (None, None) => 0,
        }
    }

    /// Blocks currently claimed by the bad-block inode, ascending.
    #[must_use]
    pub fn bad_blocks(&self) -> Vec<BlockNumber> {
        let set: BTreeSet<_> = self
            .bad_block_map
            .iter()
            .copied()
            .filter(|b| !b.is_none())
            .collect();
        set.into_iter().collect()
    }

    /// Raw slots of the bad-block inode's block map, holes included.
    #[must_use]
    pub fn bad_block_map(&self) -> &[BlockNumber] {
        &self.bad_block_map
    }

    /// Overwrite the inode's block map without touching the bitmaps.
    ///
    /// Used to load fixtures and to reproduce damaged inodes.
    pub fn set_bad_block_map_raw(&mut self, slots: Vec<BlockNumber>) {
        self.bad_block_map = slots;
        self.dirty = true;
    }

    fn bitmap_mut(&mut self) -> Result<&mut BlockBitmap> {
        self.bitmap
            .as_mut()
            .ok_or_else(|| FfsError::Format("block bitmap not loaded".into()))
    }

    /// Mark `block` in use, as a regular file allocation would.
    pub fn allocate_block(&mut self, block: BlockNumber) -> Result<bool> {
        let changed = self.bitmap_mut()?.mark_used(block)?;
        self.dirty |= changed;
        Ok(changed)
    }

    /// Whether `block` is marked in use. Requires loaded bitmaps.
    pub fn is_block_used(&self, block: BlockNumber) -> Result<bool> {
        self.bitmap
            .as_ref()
            .ok_or_else(|| FfsError::Format("block bitmap not loaded".into()))?
            .is_used(block)
    }

    fn to_image(&self) -> ImageFile {
        let (block_bitmaps, groups, free_blocks_count) = match (&self.bitmap, &self.raw_bitmaps) {
            (Some(bitmap), _) => (
                bitmap.bitmaps().to_vec(),
                bitmap.groups().to_vec(),
                bitmap.free_blocks(),
            ),
            (None, Some((bitmaps, groups, free))) => (bitmaps.clone(), groups.clone(), *free),
            (None, None) => (Vec::new(), Vec::new(), 0),
        };
        ImageFile {
            format: IMAGE_FORMAT.to_owned(),
            device_name: self.device_name.clone(),
            block_size: self.block_size,
            blocks_count: self.geometry.total_blocks,
            first_data_block: self.geometry.first_data_block,
            blocks_per_group: self.geometry.blocks_per_group,
            free_blocks_count,
            groups,
            block_bitmaps,
            bad_block_map: self.bad_block_map.clone(),
        }
    }

    /// Write pending changes to the image path, atomically.
    ///
    /// No-op for a clean handle or one without a backing path.
    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        if self.read_only {
            return Err(FfsError::ReadOnly);
        }
        let Some(path) = self.path.clone() else {
            return Ok(());
        };

        let image = self.to_image();
        let temp_path = temp_path_for(&path);
        {
            let file = File::create(&temp_path)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, &image)
                .map_err(|e| FfsError::Format(format!("image encode error: {e}")))?;
            writer.write_all(b"\n")?;
            writer
                .into_inner()
                .map_err(|e| FfsError::Format(format!("image write error: {e}")))?
                .sync_all()?;
        }
        fs::rename(&temp_path, &path)?;

        self.dirty = false;
        debug!(path = %path.display(), "metadata image flushed");
        Ok(())
    }
}

/// `<image>.tmp` next to the image, whatever extension the image already has.
fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

impl BadBlockFs for Filesystem {
    fn device_name(&self) -> &str {
        &self.device_name
    }

    fn block_range(&self) -> BlockRange {
        BlockRange::new(
            u64::from(self.geometry.first_data_block),
            self.geometry.total_blocks,
        )
    }

    fn read_bitmaps(&mut self) -> Result<()> {
        if self.bitmap.is_some() {
            return Ok(());
        }
        let Some((bitmaps, groups, free)) = self.raw_bitmaps.take() else {
            return Err(FfsError::Format("image has no block bitmaps".into()));
        };
        match BlockBitmap::from_parts(self.geometry.clone(), bitmaps.clone(), groups.clone(), free)
        {
            Ok(bitmap) => {
                self.bitmap = Some(bitmap);
                Ok(())
            }
            Err(err) => {
                self.raw_bitmaps = Some((bitmaps, groups, free));
                Err(err)
            }
        }
    }

    fn iterate_bad_block_inode(
        &mut self,
        visit: &mut dyn FnMut(&mut BlockNumber) -> BlockVisit,
    ) -> Result<()> {
        let mut changed = 0_usize;
        for slot in &mut self.bad_block_map {
            if slot.is_none() {
                continue;
            }
            if visit(slot) == BlockVisit::Changed {
                changed += 1;
            }
        }
        if changed > 0 {
            self.dirty = true;
            debug!(
                inode = %InodeNumber::BAD_BLOCKS,
                changed,
                "bad-block inode entries rewritten"
            );
        }
        Ok(())
    }

    fn read_bad_block_inode(&self) -> Result<BadBlockList> {
        Ok(self
            .bad_block_map
            .iter()
            .copied()
            .filter(|b| !b.is_none())
            .collect())
    }

    fn update_bad_block_inode(&mut self, list: &BadBlockList) -> Result<BadBlockDelta> {
        if self.read_only {
            return Err(FfsError::ReadOnly);
        }
        let range = self.block_range();
        if let Some(block) = list.iter().find(|b| b.is_none() || !range.is_valid(*b)) {
            return Err(FfsError::Corruption {
                block: block.0,
                detail: format!("bad-block list entry outside data range {range}"),
            });
        }

        let old: BTreeSet<BlockNumber> = self
            .bad_block_map
            .iter()
            .copied()
            .filter(|b| !b.is_none())
            .collect();
        let delta = BadBlockDelta {
            added: list.iter().filter(|b| !old.contains(b)).collect(),
            removed: old.iter().copied().filter(|b| !list.contains(*b)).collect(),
        };

        // Apply to a copy so a failure leaves the handle untouched.
        let mut bitmap = self
            .bitmap
            .clone()
            .ok_or_else(|| FfsError::Format("block bitmap not loaded".into()))?;
        for &block in &delta.removed {
            if !range.is_valid(block) {
                debug!(block = block.0, "dropping out-of-range entry without freeing");
                continue;
            }
            bitmap.mark_free(block)?;
        }
        for &block in &delta.added {
            if !bitmap.mark_used(block)? {
                warn!(
                    block = block.0,
                    "block already in use; now also claimed by the bad-block inode"
                );
            }
        }

        let new_map = list.to_vec();
        if delta.is_empty() && new_map == self.bad_block_map {
            return Ok(delta);
        }
        self.bitmap = Some(bitmap);
        self.bad_block_map = new_map;
        self.dirty = true;
        Ok(delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ImageSpec {
        ImageSpec {
            device_name: "/dev/test0".into(),
            block_size: 1024,
            blocks_count: 1000,
            first_data_block: 1,
            blocks_per_group: 256,
        }
    }

    fn list(blocks: &[u64]) -> BadBlockList {
        blocks.iter().copied().map(BlockNumber).collect()
    }

    #[test]
    fn fresh_filesystem_geometry() {
        let fs = Filesystem::new(&spec()).unwrap();
        assert_eq!(fs.block_range(), BlockRange::new(1, 1000));
        assert_eq!(fs.geometry().group_count, 4);
        assert_eq!(fs.free_blocks(), 999);
        assert!(fs.bad_blocks().is_empty());
        assert_eq!(fs.device_name(), "/dev/test0");
    }

    #[test]
    fn rejects_bad_spec() {
        let bad_size = ImageSpec {
            block_size: 3000,
            ..spec()
        };
        assert!(matches!(
            Filesystem::new(&bad_size).unwrap_err(),
            FfsError::InvalidGeometry(_)
        ));
        let no_data = ImageSpec {
            blocks_count: 1,
            ..spec()
        };
        assert!(Filesystem::new(&no_data).is_err());
    }

    #[test]
    fn update_marks_added_and_frees_removed() {
        let mut fs = Filesystem::new(&spec()).unwrap();
        let delta = fs.update_bad_block_inode(&list(&[5, 10])).unwrap();
        assert_eq!(delta.added, vec![BlockNumber(5), BlockNumber(10)]);
        assert_eq!(fs.free_blocks(), 997);

        let delta = fs.update_bad_block_inode(&list(&[10, 20])).unwrap();
        assert_eq!(delta.added, vec![BlockNumber(20)]);
        assert_eq!(delta.removed, vec![BlockNumber(5)]);
        assert_eq!(fs.free_blocks(), 997);
        assert!(!fs.is_block_used(BlockNumber(5)).unwrap());
        assert!(fs.is_block_used(BlockNumber(20)).unwrap());
        assert_eq!(fs.bad_blocks(), vec![BlockNumber(10), BlockNumber(20)]);
    }

    #[test]
    fn update_leaves_unrelated_allocations_alone() {
        let mut fs = Filesystem::new(&spec()).unwrap();
        fs.allocate_block(BlockNumber(300)).unwrap();
        fs.update_bad_block_inode(&list(&[7])).unwrap();
        fs.update_bad_block_inode(&list(&[])).unwrap();
        assert!(fs.is_block_used(BlockNumber(300)).unwrap());
        assert!(!fs.is_block_used(BlockNumber(7)).unwrap());
        assert_eq!(fs.free_blocks(), 998);
    }

    #[test]
    fn claiming_an_allocated_block_does_not_double_count() {
        let mut fs = Filesystem::new(&spec()).unwrap();
        fs.allocate_block(BlockNumber(42)).unwrap();
        let delta = fs.update_bad_block_inode(&list(&[42])).unwrap();
        assert_eq!(delta.added, vec![BlockNumber(42)]);
        assert_eq!(fs.free_blocks(), 998);
    }

    #[test]
    fn update_rejects_out_of_range_list_without_side_effects() {
        let mut fs = Filesystem::new(&spec()).unwrap();
        fs.update_bad_block_inode(&list(&[5])).unwrap();
        let err = fs.update_bad_block_inode(&list(&[6, 1000])).unwrap_err();
        assert!(matches!(err, FfsError::Corruption { block: 1000, .. }));
        assert_eq!(fs.bad_blocks(), vec![BlockNumber(5)]);
        assert!(!fs.is_block_used(BlockNumber(6)).unwrap());
        assert_eq!(fs.free_blocks(), 998);
    }

    #[test]
    fn update_requires_loaded_bitmaps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fs.json");
        Filesystem::create(&path, &spec()).unwrap();

        let mut fs = Filesystem::open(&path).unwrap();
        let err = fs.update_bad_block_inode(&list(&[5])).unwrap_err();
        assert!(matches!(err, FfsError::Format(_)));
        fs.read_bitmaps().unwrap();
        fs.update_bad_block_inode(&list(&[5])).unwrap();
    }

    #[test]
    fn iterate_skips_holes_and_marks_dirty_on_change() {
        let mut fs = Filesystem::new(&spec()).unwrap();
        fs.set_bad_block_map_raw(vec![BlockNumber(0), BlockNumber(9), BlockNumber(5000)]);
        fs.dirty = false;

        let mut seen = Vec::new();
        fs.iterate_bad_block_inode(&mut |slot: &mut BlockNumber| {
            seen.push(slot.0);
            BlockVisit::Unchanged
        })
        .unwrap();
        assert_eq!(seen, vec![9, 5000]);
        assert!(!fs.is_dirty());

        fs.iterate_bad_block_inode(&mut |slot: &mut BlockNumber| {
            if slot.0 == 5000 {
                *slot = BlockNumber::NONE;
                return BlockVisit::Changed;
            }
            BlockVisit::Unchanged
        })
        .unwrap();
        assert!(fs.is_dirty());
        assert_eq!(fs.bad_blocks(), vec![BlockNumber(9)]);
    }

    #[test]
    fn flush_and_reopen_round_trips_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fs.json");
        let mut fs = Filesystem::create(&path, &spec()).unwrap();
        fs.update_bad_block_inode(&list(&[3, 700])).unwrap();
        fs.flush().unwrap();
        assert!(!dir.path().join("fs.json.tmp").exists());

        let mut reopened = Filesystem::open(&path).unwrap();
        assert_eq!(reopened.bad_blocks(), vec![BlockNumber(3), BlockNumber(700)]);
        assert_eq!(reopened.free_blocks(), 997);
        reopened.read_bitmaps().unwrap();
        assert!(reopened.is_block_used(BlockNumber(700)).unwrap());
    }

    #[test]
    fn temp_file_never_aliases_the_image_or_its_neighbours() {
        assert_eq!(
            temp_path_for(Path::new("/img/fs.json")),
            PathBuf::from("/img/fs.json.tmp")
        );
        assert_eq!(
            temp_path_for(Path::new("/img/scratch.tmp")),
            PathBuf::from("/img/scratch.tmp.tmp")
        );

        let dir = tempfile::tempdir().unwrap();
        let neighbour = dir.path().join("fs.tmp");
        fs::write(&neighbour, "keep me").unwrap();
        let image = dir.path().join("fs.json");
        let mut handle = Filesystem::create(&image, &spec()).unwrap();
        handle.update_bad_block_inode(&list(&[8])).unwrap();
        handle.flush().unwrap();
        assert_eq!(fs::read_to_string(&neighbour).unwrap(), "keep me");

        let tmp_named = dir.path().join("scratch.tmp");
        let mut handle = Filesystem::create(&tmp_named, &spec()).unwrap();
        handle.update_bad_block_inode(&list(&[9])).unwrap();
        handle.flush().unwrap();
        assert!(tmp_named.exists());
        assert_eq!(
            Filesystem::open(&tmp_named).unwrap().bad_blocks(),
            vec![BlockNumber(9)]
        );
    }

    #[test]
    fn read_only_handle_refuses_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fs.json");
        Filesystem::create(&path, &spec()).unwrap();

        let mut fs = Filesystem::open_read_only(&path).unwrap();
        fs.read_bitmaps().unwrap();
        assert!(matches!(
            fs.update_bad_block_inode(&list(&[5])).unwrap_err(),
            FfsError::ReadOnly
        ));
        fs.set_bad_block_map_raw(vec![BlockNumber(5)]);
        assert!(matches!(fs.flush().unwrap_err(), FfsError::ReadOnly));
    }

    #[test]
    fn inconsistent_bitmap_is_reported_by_read_bitmaps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fs.json");
        Filesystem::create(&path, &spec()).unwrap();

        let mut image: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        image["free_blocks_count"] = serde_json::json!(12);
        fs::write(&path, serde_json::to_string(&image).unwrap()).unwrap();

        let mut fs = Filesystem::open(&path).unwrap();
        assert_eq!(fs.bad_blocks(), Vec::<BlockNumber>::new());
        let err = fs.read_bitmaps().unwrap_err();
        assert!(matches!(err, FfsError::Corruption { .. }));
        // A failed load can be retried and fails the same way.
        assert!(fs.read_bitmaps().is_err());
    }

    #[test]
    fn unknown_format_tag_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fs.json");
        Filesystem::create(&path, &spec()).unwrap();
        let text = fs::read_to_string(&path).unwrap().replace(IMAGE_FORMAT, "other/v9");
        fs::write(&path, text).unwrap();
        assert!(matches!(
            Filesystem::open(&path).unwrap_err(),
            FfsError::Format(_)
        ));
    }
}
