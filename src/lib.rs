//! Persistent, file-backed memory segments that grow on demand.
//!
//! A segment maps a backing file into memory, allocates from it with an
//! in-file free list, and keeps every internal reference as an offset from
//! the region base, so the contents survive process restarts and remain
//! valid when the file is grown and remapped. Named anchors stored inside
//! the segment let callers recover their root objects after a fresh
//! mapping without depending on absolute addresses.
//!
//! The entry point is [`Segment`]; see its module docs for the allocation
//! and growth contract. The backing store is pluggable through [`Backing`]:
//! [`FileBacking`] maps real files, and [`test_utils::HeapBacking`] runs
//! the same machinery over in-process buffers for tests.

pub mod arena;
pub mod backing;
pub mod error;
pub mod segment;
pub mod test_utils;

pub(crate) mod layout;

pub use backing::{Backing, FileBacking};
pub use error::{OpenError, SegmentError};
pub use segment::{Alloc, Segment};
