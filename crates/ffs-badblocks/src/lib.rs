#![forbid(unsafe_code)]
//! Bad-block inode reconciliation.
//!
//! Merges (or replaces) the blocks claimed by the filesystem's bad-block
//! inode with candidates from a text manifest or from the output of an
//! external `badblocks` scan, drops anything outside the data-block range,
//! and hands the result to the metadata layer to persist.
//!
//! ## Layers
//!
//! 1. [`BadBlockList`]: ordered set of block numbers.
//! 2. [`ingest`]: line-oriented parser feeding a list from any `BufRead`.
//! 3. [`scan`]: spawns the scanner and exposes its stdout as a `BufRead`.
//! 4. [`BadBlockFs`]: the metadata-layer boundary (bitmaps, inode map).
//! 5. [`Reconciler`]: the linear state machine tying the above together,
//!    with the two entry points [`read_bad_blocks_file`] and [`test_disk`].
//!
//! Everything is synchronous. Fatal conditions come back as
//! [`ffs_error::FfsError`]; per-record problems go to an
//! [`InvalidBlockHandler`] and never stop a run.

pub mod fs;
pub mod ingest;
pub mod list;
pub mod reconcile;
pub mod scan;

pub use fs::{BadBlockDelta, BadBlockFs, BlockVisit};
pub use ingest::{
    CandidateSource, IngestStats, InvalidBlockHandler, InvalidEntry, LogInvalidBlocks,
    ManifestFile, ReaderSource, Record, ingest_records, parse_record,
};
pub use list::BadBlockList;
pub use reconcile::{
    ReconcileMode, ReconcileReport, Reconciler, Stage, read_bad_blocks_file, test_disk,
};
pub use scan::{DEFAULT_SCAN_PROGRAM, ScanCommand, ScanOptions, ScanProcess, ScanSource};
