//! Line-oriented candidate ingestion.
//!
//! A manifest file and the stdout of the scanner share one grammar: one
//! record per line, the leading decimal token is the block number, and
//! anything after the digits is ignored. The ingestor only sees a
//! [`BufRead`], so every source goes through the same code path.

use crate::list::BadBlockList;
use ffs_error::{FfsError, Result};
use ffs_types::{BlockNumber, BlockRange};
use serde::Serialize;
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use tracing::{debug, warn};

// ── Records ─────────────────────────────────────────────────────────────────

/// One classified input line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Record {
    /// Empty or whitespace-only line.
    Blank,
    /// Leading decimal token.
    Block(BlockNumber),
    /// No leading digits, or the value does not fit in 64 bits.
    Unparsable,
}

/// Classify a raw line (with or without its trailing newline).
///
/// A single `+` may precede the digits; a `-` may not.
#[must_use]
pub fn parse_record(line: &[u8]) -> Record {
    let mut trimmed = line.trim_ascii_start();
    if trimmed.is_empty() {
        return Record::Blank;
    }
    if let Some(unsigned) = trimmed.strip_prefix(b"+") {
        trimmed = unsigned;
    }
    let digits = trimmed.iter().take_while(|b| b.is_ascii_digit()).count();
    if digits == 0 {
        return Record::Unparsable;
    }
    let mut value = 0_u64;
    for &byte in &trimmed[..digits] {
        let Some(next) = value
            .checked_mul(10)
            .and_then(|v| v.checked_add(u64::from(byte - b'0')))
        else {
            return Record::Unparsable;
        };
        value = next;
    }
    Record::Block(BlockNumber(value))
}

// ── Invalid-entry reporting ─────────────────────────────────────────────────

/// A record that was dropped during ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InvalidEntry {
    Unparsable {
        /// Label of the manifest or scanner the line came from.
        source: String,
        /// 1-based line number within the source.
        record: u64,
        text: String,
    },
    OutOfRange {
        source: String,
        record: u64,
        block: BlockNumber,
        range: BlockRange,
    },
}

impl InvalidEntry {
    #[must_use]
    pub fn source(&self) -> &str {
        match self {
            Self::Unparsable { source, .. } | Self::OutOfRange { source, .. } => source,
        }
    }

    #[must_use]
    pub fn record(&self) -> u64 {
        match self {
            Self::Unparsable { record, .. } | Self::OutOfRange { record, .. } => *record,
        }
    }
}

impl fmt::Display for InvalidEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unparsable { record, text, .. } => {
                write!(f, "Bad block record {record} ({text:?}) unparsable; ignored.")
            }
            Self::OutOfRange { block, .. } => {
                write!(f, "Bad block {block} out of range; ignored.")
            }
        }
    }
}

/// Observer for dropped records. Reporting only; it cannot stop ingestion.
pub trait InvalidBlockHandler {
    fn invalid_block(&mut self, entry: &InvalidEntry);
}

impl<F: FnMut(&InvalidEntry)> InvalidBlockHandler for F {
    fn invalid_block(&mut self, entry: &InvalidEntry) {
        self(entry);
    }
}

/// Default handler: one `warn!` per dropped record.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogInvalidBlocks;

impl InvalidBlockHandler for LogInvalidBlocks {
    fn invalid_block(&mut self, entry: &InvalidEntry) {
        warn!(source = entry.source(), record = entry.record(), "{entry}");
    }
}

// ── Ingestion ───────────────────────────────────────────────────────────────

/// Per-source ingestion counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    /// Lines read, blank ones included.
    pub records: u64,
    /// Blocks that were new to the list.
    pub inserted: u64,
    /// Valid blocks already present in the list.
    pub duplicates: u64,
    /// Records handed to the invalid-block handler.
    pub invalid: u64,
    /// Records naming block 0.
    pub sentinels: u64,
    pub blank: u64,
}

/// Read every line of `reader` into `list`.
///
/// Only an I/O failure on the reader itself is an error; bad records go to
/// `handler` and ingestion carries on.
pub fn ingest_records<R: BufRead + ?Sized>(
    reader: &mut R,
    label: &str,
    range: BlockRange,
    list: &mut BadBlockList,
    handler: &mut dyn InvalidBlockHandler,
) -> Result<IngestStats> {
    let mut stats = IngestStats::default();
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = reader
            .read_until(b'\n', &mut line)
            .map_err(|err| FfsError::source_unavailable(format!("read {label}"), err))?;
        if read == 0 {
            break;
        }
        stats.records += 1;
        let record = stats.records;

        let entry = match parse_record(&line) {
            Record::Blank => {
                stats.blank += 1;
                continue;
            }
            Record::Block(block) if block.is_none() => {
                stats.sentinels += 1;
                continue;
            }
            Record::Block(block) if range.is_valid(block) => {
                if list.insert(block) {
                    stats.inserted += 1;
                } else {
                    stats.duplicates += 1;
                }
                continue;
            }
            Record::Block(block) => InvalidEntry::OutOfRange {
                source: label.to_owned(),
                record,
                block,
                range,
            },
            Record::Unparsable => InvalidEntry::Unparsable {
                source: label.to_owned(),
                record,
                text: String::from_utf8_lossy(&line).trim().to_owned(),
            },
        };
        stats.invalid += 1;
        debug!(source = label, record, ?entry, "dropping candidate");
        handler.invalid_block(&entry);
    }
    debug!(source = label, ?stats, "ingestion complete");
    Ok(stats)
}

// ── Sources ─────────────────────────────────────────────────────────────────

/// Something that can feed candidate blocks into a list.
///
/// Sources open lazily inside [`CandidateSource::ingest`], so a manifest that
/// cannot be opened is only noticed after the inode has been sanity-checked.
pub trait CandidateSource {
    /// Human-readable name used in logs, errors, and reports.
    fn label(&self) -> String;

    /// Command line announced before the source runs, if the caller asked
    /// for it to be echoed.
    fn echoed_command(&self) -> Option<String> {
        None
    }

    fn ingest(
        &mut self,
        range: BlockRange,
        list: &mut BadBlockList,
        handler: &mut dyn InvalidBlockHandler,
    ) -> Result<IngestStats>;
}

/// User-supplied manifest file.
#[derive(Debug, Clone)]
pub struct ManifestFile {
    path: PathBuf,
}

impl ManifestFile {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CandidateSource for ManifestFile {
    fn label(&self) -> String {
        self.path.display().to_string()
    }

    fn ingest(
        &mut self,
        range: BlockRange,
        list: &mut BadBlockList,
        handler: &mut dyn InvalidBlockHandler,
    ) -> Result<IngestStats> {
        let label = self.label();
        let file = File::open(&self.path).map_err(|err| {
            FfsError::source_unavailable(format!("while trying to open {label}"), err)
        })?;
        ingest_records(&mut BufReader::new(file), &label, range, list, handler)
    }
}

/// Any in-memory or already-open reader.
#[derive(Debug)]
pub struct ReaderSource<R> {
    label: String,
    reader: R,
}

impl<R: BufRead> ReaderSource<R> {
    pub fn new(label: impl Into<String>, reader: R) -> Self {
        Self {
            label: label.into(),
            reader,
        }
    }
}

impl<R: BufRead> CandidateSource for ReaderSource<R> {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn ingest(
        &mut self,
        range: BlockRange,
        list: &mut BadBlockList,
        handler: &mut dyn InvalidBlockHandler,
    ) -> Result<IngestStats> {
        ingest_records(&mut self.reader, &self.label, range, list, handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Cursor, Read};

    const RANGE: BlockRange = BlockRange::new(1, 1000);

    fn ingest_str(text: &str, list: &mut BadBlockList) -> (IngestStats, Vec<InvalidEntry>) {
        let mut seen = Vec::new();
        let stats = ingest_records(
            &mut Cursor::new(text.as_bytes()),
            "test",
            RANGE,
            list,
            &mut |entry: &InvalidEntry| seen.push(entry.clone()),
        )
        .expect("in-memory ingestion cannot fail");
        (stats, seen)
    }

    #[test]
    fn parse_record_grammar() {
        assert_eq!(parse_record(b"42\n"), Record::Block(BlockNumber(42)));
        assert_eq!(parse_record(b"  42 extra columns\n"), Record::Block(BlockNumber(42)));
        assert_eq!(parse_record(b"17abc"), Record::Block(BlockNumber(17)));
        assert_eq!(parse_record(b"\t7\r\n"), Record::Block(BlockNumber(7)));
        assert_eq!(parse_record(b"0\n"), Record::Block(BlockNumber(0)));
        assert_eq!(parse_record(b"\n"), Record::Blank);
        assert_eq!(parse_record(b"   \r\n"), Record::Blank);
        assert_eq!(parse_record(b""), Record::Blank);
        assert_eq!(parse_record(b"abc\n"), Record::Unparsable);
        assert_eq!(parse_record(b"+9\n"), Record::Block(BlockNumber(9)));
        assert_eq!(parse_record(b"  +12 x"), Record::Block(BlockNumber(12)));
        assert_eq!(parse_record(b"+\n"), Record::Unparsable);
        assert_eq!(parse_record(b"++3\n"), Record::Unparsable);
        assert_eq!(parse_record(b"+ 3\n"), Record::Unparsable);
        assert_eq!(parse_record(b"-5\n"), Record::Unparsable);
        assert_eq!(parse_record(b"\xff\xfe\n"), Record::Unparsable);
        assert_eq!(
            parse_record(b"18446744073709551615"),
            Record::Block(BlockNumber(u64::MAX))
        );
        assert_eq!(parse_record(b"18446744073709551616"), Record::Unparsable);
    }

    #[test]
    fn sentinel_is_skipped_without_callback() {
        let mut list = BadBlockList::new();
        let (stats, seen) = ingest_str("0\n999\n1000\n", &mut list);
        assert_eq!(list.to_vec(), vec![BlockNumber(999)]);
        assert_eq!(stats.sentinels, 1);
        assert_eq!(stats.inserted, 1);
        assert_eq!(
            seen,
            vec![InvalidEntry::OutOfRange {
                source: "test".to_owned(),
                record: 3,
                block: BlockNumber(1000),
                range: RANGE,
            }]
        );
    }

    #[test]
    fn invalid_count_matches_callbacks() {
        // n = 7 lines, k = 3 invalid.
        let text = "5\nbogus\n1000\n20\n5\n4096\n30 trailing\n";
        let mut list = BadBlockList::new();
        let (stats, seen) = ingest_str(text, &mut list);

        assert_eq!(stats.records, 7);
        assert_eq!(stats.invalid, 3);
        assert_eq!(seen.len(), 3);
        assert_eq!(stats.inserted + stats.duplicates, 7 - 3);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(list.to_vec(), vec![BlockNumber(5), BlockNumber(20), BlockNumber(30)]);
        assert_eq!(seen.iter().map(InvalidEntry::record).collect::<Vec<_>>(), vec![2, 3, 6]);
        assert!(matches!(&seen[0], InvalidEntry::Unparsable { text, .. } if text == "bogus"));
    }

    #[test]
    fn below_first_data_block_is_rejected() {
        let range = BlockRange::new(10, 20);
        let mut list = BadBlockList::new();
        let mut calls = 0;
        let stats = ingest_records(
            &mut Cursor::new(b"9\n10\n19\n20\n".as_slice()),
            "test",
            range,
            &mut list,
            &mut |_: &InvalidEntry| calls += 1,
        )
        .unwrap();
        assert_eq!(calls, 2);
        assert_eq!(stats.invalid, 2);
        assert_eq!(list.to_vec(), vec![BlockNumber(10), BlockNumber(19)]);
    }

    #[test]
    fn blank_lines_and_missing_trailing_newline() {
        let mut list = BadBlockList::new();
        let (stats, seen) = ingest_str("\n  \n12", &mut list);
        assert!(seen.is_empty());
        assert_eq!(stats.blank, 2);
        assert_eq!(list.to_vec(), vec![BlockNumber(12)]);
    }

    #[test]
    fn ingestion_appends_to_existing_list() {
        let mut list: BadBlockList = [BlockNumber(5)].into_iter().collect();
        let (stats, _) = ingest_str("5\n6\n", &mut list);
        assert_eq!(stats.inserted, 1);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(list.len(), 2);
    }

    struct FailingReader;

    impl Read for FailingReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::other("device went away"))
        }
    }

    #[test]
    fn reader_failure_is_source_unavailable() {
        let mut list = BadBlockList::new();
        let err = ingest_records(
            &mut io::BufReader::new(FailingReader),
            "flaky",
            RANGE,
            &mut list,
            &mut LogInvalidBlocks,
        )
        .unwrap_err();
        assert!(matches!(err, FfsError::SourceUnavailable { .. }));
        assert!(err.to_string().starts_with("read flaky"));
    }

    #[test]
    fn manifest_file_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bb.txt");
        std::fs::write(&path, "10\n20\n10\n").unwrap();

        let mut source = ManifestFile::new(&path);
        let mut list = BadBlockList::new();
        let stats = source.ingest(RANGE, &mut list, &mut LogInvalidBlocks).unwrap();
        assert_eq!(stats.inserted, 2);
        assert_eq!(list.to_vec(), vec![BlockNumber(10), BlockNumber(20)]);
    }

    #[test]
    fn missing_manifest_is_source_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = ManifestFile::new(dir.path().join("absent.txt"));
        let err = source
            .ingest(RANGE, &mut BadBlockList::new(), &mut LogInvalidBlocks)
            .unwrap_err();
        assert!(matches!(
            &err,
            FfsError::SourceUnavailable { error, .. } if error.kind() == io::ErrorKind::NotFound
        ));
    }

    #[test]
    fn signed_manifest_lines() {
        let mut list = BadBlockList::new();
        let (stats, seen) = ingest_str("+9\n-4\n+0\n", &mut list);
        assert_eq!(list.to_vec(), vec![BlockNumber(9)]);
        assert_eq!(stats.sentinels, 1);
        assert_eq!(seen.len(), 1);
        assert!(matches!(&seen[0], InvalidEntry::Unparsable { text, .. } if text == "-4"));
    }

    #[test]
    fn rejected_entries_name_their_source() {
        let mut list = BadBlockList::new();
        let mut seen = Vec::new();
        let mut source =
            ReaderSource::new("scan of /dev/sdz", Cursor::new(b"junk\n5000\n".to_vec()));
        source
            .ingest(RANGE, &mut list, &mut |entry: &InvalidEntry| seen.push(entry.clone()))
            .unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|entry| entry.source() == "scan of /dev/sdz"));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bb.txt");
        std::fs::write(&path, "abc\n").unwrap();
        let mut seen = Vec::new();
        ManifestFile::new(&path)
            .ingest(RANGE, &mut list, &mut |entry: &InvalidEntry| seen.push(entry.clone()))
            .unwrap();
        assert_eq!(seen[0].source(), path.display().to_string());
    }

    #[test]
    fn display_matches_legacy_wording() {
        let entry = InvalidEntry::OutOfRange {
            source: "bb.txt".to_owned(),
            record: 1,
            block: BlockNumber(1050),
            range: RANGE,
        };
        assert_eq!(entry.to_string(), "Bad block 1050 out of range; ignored.");
    }
}
