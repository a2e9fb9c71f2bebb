use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failure to open, create, or validate a backing file and its mapping.
///
/// Raised by the segment constructors only; a successfully opened segment
/// never produces this error again.
#[derive(Debug, Error)]
pub enum OpenError {
    #[error("failed to open segment file {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("segment file {path:?} is too small ({len} bytes, need at least {min})")]
    TooSmall { path: PathBuf, len: usize, min: usize },

    #[error("segment file {path:?} has bad magic")]
    BadMagic { path: PathBuf },

    #[error("segment file {path:?} has format version {found}, expected {expected}")]
    VersionMismatch {
        path: PathBuf,
        found: u16,
        expected: u16,
    },

    #[error("segment file {path:?} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

/// A logically invalid operation on an open segment, or a fatal growth
/// failure.
///
/// The `OutOfMemory` and `SizeOverflow` variants are terminal: the segment
/// could not be grown, and if the failure happened mid-growth the handle no
/// longer holds a mapping (subsequent calls report `Unmapped`).
#[derive(Debug, Error)]
pub enum SegmentError {
    /// An anchor address does not belong to the segment's address range.
    #[error("out of segment address {addr:#x}")]
    OutOfSegment { addr: usize },

    /// A mutating call on a segment opened read-only.
    #[error("segment is read-only")]
    ReadOnly,

    /// The mapping was released by a failed growth and never reestablished.
    #[error("segment mapping was lost by a failed growth")]
    Unmapped,

    /// The backing file could not be grown or remapped.
    #[error("cannot grow segment file {path:?}")]
    OutOfMemory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Doubling the segment would exceed the representable size range.
    #[error("segment size overflow while doubling {prev} bytes")]
    SizeOverflow { prev: usize },

    /// The arena cannot satisfy an internal bookkeeping allocation without
    /// growing, which the current operation must not do.
    #[error("segment exhausted: cannot allocate {requested} bytes")]
    Exhausted { requested: usize },

    /// An anchor name that is empty or contains a NUL byte.
    #[error("invalid anchor name")]
    InvalidName,
}
