#![forbid(unsafe_code)]
//! Error types for the bad-block tooling.
//!
//! # Error Taxonomy
//!
//! | Condition | Handling | Type |
//! |-----------|----------|------|
//! | One manifest/scan record unparsable or out of range | reported, skipped | `InvalidEntry` (ffs-badblocks, not an error) |
//! | Out-of-range block already in the bad-block inode | cleared, warned | not an error |
//! | Manifest cannot be opened/read, scanner cannot be launched | fatal | `FfsError::SourceUnavailable` |
//! | Metadata layer failure (bitmap load, inode iterate/load/update) | fatal | `Corruption` / `Format` / `InvalidGeometry` / `Io` / `ReadOnly` |
//!
//! Fatal errors raised while a reconciliation is running are wrapped in
//! `FfsError::Reconcile` so the caller can tell which stage gave up. Nothing
//! in the libraries terminates the process; the binary decides exit status.
//!
//! ## errno Mapping
//!
//! Every `FfsError` variant maps to exactly one POSIX errno via [`FfsError::to_errno`].
//! The mapping is exhaustive (no wildcard arms) so adding a new variant is a
//! compile error until its errno is assigned.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error, else `EIO` |
//! | `SourceUnavailable` | raw OS error, else `EIO` |
//! | `Corruption` | `EIO` |
//! | `Format` | `EINVAL` |
//! | `InvalidGeometry` | `EINVAL` |
//! | `ReadOnly` | `EROFS` |
//! | `Reconcile` | errno of the wrapped error |
//!
//! ## Design Constraints
//!
//! - `ffs-error` MUST NOT depend on `ffs-types` (no cyclic deps); type-level
//!   validation errors arrive here as strings.
//! - All string payloads are owned (`String`).

use thiserror::Error;

/// Unified error type for all bad-block operations.
#[derive(Debug, Error)]
pub enum FfsError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A candidate source (manifest file or scanner process) could not be
    /// opened, launched, or read.
    #[error("{what}: {error}")]
    SourceUnavailable {
        what: String,
        #[source]
        error: std::io::Error,
    },

    /// On-disk metadata corruption detected at a known block.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// Invalid metadata image (wrong format, inconsistent snapshot).
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Filesystem geometry is invalid or out of the supported range.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// A write was attempted on a handle opened read-only.
    #[error("read-only filesystem")]
    ReadOnly,

    /// A fatal error raised by one stage of a reconciliation run.
    #[error("{stage}: {source}")]
    Reconcile {
        stage: &'static str,
        source: Box<FfsError>,
    },
}

impl FfsError {
    /// Wrap this error with the reconciliation stage that produced it.
    #[must_use]
    pub fn in_stage(self, stage: &'static str) -> Self {
        Self::Reconcile {
            stage,
            source: Box::new(self),
        }
    }

    /// Build a `SourceUnavailable` error for `what`.
    #[must_use]
    pub fn source_unavailable(what: impl Into<String>, error: std::io::Error) -> Self {
        Self::SourceUnavailable {
            what: what.into(),
            error,
        }
    }

    /// Strip any `Reconcile` wrappers and return the underlying error.
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::Reconcile { source, .. } => source.root(),
            other => other,
        }
    }

    /// Convert this error into a POSIX errno.
    ///
    /// Every variant has an explicit arm.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) | Self::SourceUnavailable { error: err, .. } => {
                err.raw_os_error().unwrap_or(libc::EIO)
            }
            Self::Corruption { .. } => libc::EIO,
            Self::Format(_) | Self::InvalidGeometry(_) => libc::EINVAL,
            Self::ReadOnly => libc::EROFS,
            Self::Reconcile { source, .. } => source.to_errno(),
        }
    }
}

/// Result alias using `FfsError`.
pub type Result<T> = std::result::Result<T, FfsError>;
