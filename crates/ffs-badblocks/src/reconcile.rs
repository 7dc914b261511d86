//! Reconciliation state machine.
//!
//! ```text
//! Start → SanityChecked → (Loaded | EmptyBase) → Ingested → Persisted
//!    \__________________________________________________________/
//!                         any fatal error → Failed
//! ```
//!
//! Every stage either completes or aborts the run; there is no retry and no
//! partial success. Blocks the inode claims outside the data range are
//! cleared during the sanity pass regardless of mode.

use crate::fs::{BadBlockDelta, BadBlockFs, BlockVisit};
use crate::ingest::{CandidateSource, IngestStats, InvalidBlockHandler, ManifestFile};
use crate::list::BadBlockList;
use crate::scan::{ScanOptions, ScanSource};
use ffs_error::{FfsError, Result};
use ffs_types::BlockNumber;
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::fmt;
use std::path::Path;
use tracing::{debug, info, info_span, warn};

/// Whether new candidates are merged with, or substituted for, the
/// blocks the inode already claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconcileMode {
    Append,
    Replace,
}

impl ReconcileMode {
    /// `replace == true` selects [`ReconcileMode::Replace`].
    #[must_use]
    pub fn from_replace_flag(replace: bool) -> Self {
        if replace { Self::Replace } else { Self::Append }
    }
}

impl fmt::Display for ReconcileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Append => write!(f, "append"),
            Self::Replace => write!(f, "replace"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Start,
    SanityChecked,
    Loaded,
    EmptyBase,
    Ingested,
    Persisted,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Start => "start",
            Self::SanityChecked => "sanity_checked",
            Self::Loaded => "loaded",
            Self::EmptyBase => "empty_base",
            Self::Ingested => "ingested",
            Self::Persisted => "persisted",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Summary of a completed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub mode: ReconcileMode,
    pub source: String,
    /// Scanner command line, present only for a verbose scan.
    pub echoed_command: Option<String>,
    /// Out-of-range blocks the sanity pass removed from the inode.
    pub cleared: Vec<BlockNumber>,
    /// Size of the starting list (zero in replace mode).
    pub base_blocks: usize,
    pub ingest: IngestStats,
    /// Exactly the set the inode claims after the run, ascending.
    pub persisted: Vec<BlockNumber>,
    pub delta: BadBlockDelta,
}

/// One reconciliation over a borrowed filesystem handle.
pub struct Reconciler<'fs, F: BadBlockFs + ?Sized> {
    fs: &'fs mut F,
    mode: ReconcileMode,
    stage: Stage,
}

impl<'fs, F: BadBlockFs + ?Sized> Reconciler<'fs, F> {
    pub fn new(fs: &'fs mut F, mode: ReconcileMode) -> Self {
        Self {
            fs,
            mode,
            stage: Stage::Start,
        }
    }

    #[must_use]
    pub fn stage(&self) -> Stage {
        self.stage
    }

    fn advance(&mut self, next: Stage) {
        debug!(from = %self.stage, to = %next, "reconcile stage");
        self.stage = next;
    }

    fn fail(&mut self, err: FfsError, what: &'static str) -> FfsError {
        debug!(stage = %self.stage, error = %err, "{what}");
        self.stage = Stage::Failed;
        err.in_stage(what)
    }

    /// Clear every block the inode claims outside the data range.
    ///
    /// Returns the cleared blocks. On an already-clean inode this changes
    /// nothing and logs nothing.
    pub fn sanity_check(&mut self) -> Result<Vec<BlockNumber>> {
        if let Err(err) = self.fs.read_bitmaps() {
            return Err(self.fail(err, "while reading block bitmaps"));
        }

        let range = self.fs.block_range();
        let mut cleared = Vec::new();
        let visited = self.fs.iterate_bad_block_inode(&mut |slot: &mut BlockNumber| {
            if slot.is_none() || range.is_valid(*slot) {
                return BlockVisit::Unchanged;
            }
            warn!(
                block = slot.0,
                "Warning: illegal block {slot} found in bad block inode. Cleared."
            );
            cleared.push(*slot);
            *slot = BlockNumber::NONE;
            BlockVisit::Changed
        });
        if let Err(err) = visited {
            return Err(self.fail(err, "while sanity checking the bad blocks inode"));
        }

        self.advance(Stage::SanityChecked);
        Ok(cleared)
    }

    fn load_base(&mut self) -> Result<BadBlockList> {
        match self.mode {
            ReconcileMode::Append => match self.fs.read_bad_block_inode() {
                Ok(list) => {
                    self.advance(Stage::Loaded);
                    Ok(list)
                }
                Err(err) => Err(self.fail(err, "while reading the bad blocks inode")),
            },
            ReconcileMode::Replace => {
                self.advance(Stage::EmptyBase);
                Ok(BadBlockList::new())
            }
        }
    }

    /// Drive every stage in order and release the list at the end.
    pub fn run(
        mut self,
        source: &mut dyn CandidateSource,
        handler: &mut dyn InvalidBlockHandler,
    ) -> Result<ReconcileReport> {
        let label = source.label();
        let echoed_command = source.echoed_command();
        let span = info_span!("reconcile", mode = %self.mode, source = %label);
        let _guard = span.enter();

        let cleared = self.sanity_check()?;
        let mut list = self.load_base()?;
        let base_blocks = list.len();

        let range = self.fs.block_range();
        let ingest = match source.ingest(range, &mut list, handler) {
            Ok(stats) => stats,
            Err(err) => return Err(self.fail(err, "while reading in list of bad blocks")),
        };
        self.advance(Stage::Ingested);

        let delta = match self.fs.update_bad_block_inode(&list) {
            Ok(delta) => delta,
            Err(err) => return Err(self.fail(err, "while updating bad block inode")),
        };
        self.advance(Stage::Persisted);

        let persisted = list.to_vec();
        drop(list);

        info!(
            cleared = cleared.len(),
            inserted = ingest.inserted,
            invalid = ingest.invalid,
            total = persisted.len(),
            added = delta.added.len(),
            removed = delta.removed.len(),
            "bad-block inode updated"
        );

        Ok(ReconcileReport {
            mode: self.mode,
            source: label,
            echoed_command,
            cleared,
            base_blocks,
            ingest,
            persisted,
            delta,
        })
    }
}

// ── Entry points ────────────────────────────────────────────────────────────

/// Load candidates from a manifest file, appending to or replacing the
/// existing bad-block set.
pub fn read_bad_blocks_file<F: BadBlockFs + ?Sized>(
    fs: &mut F,
    path: impl AsRef<Path>,
    mode: ReconcileMode,
    handler: &mut dyn InvalidBlockHandler,
) -> Result<ReconcileReport> {
    let mut source = ManifestFile::new(path.as_ref());
    Reconciler::new(fs, mode).run(&mut source, handler)
}

/// Run the external scanner over the filesystem's device and append what
/// it reports.
pub fn test_disk<F: BadBlockFs + ?Sized>(
    fs: &mut F,
    options: &ScanOptions,
    handler: &mut dyn InvalidBlockHandler,
) -> Result<ReconcileReport> {
    let blocks_count = fs.block_range().blocks_count;
    let mut source = ScanSource::new(options, OsStr::new(fs.device_name()), blocks_count);
    Reconciler::new(fs, ReconcileMode::Append).run(&mut source, handler)
}
