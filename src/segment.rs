//! Persistent mapped segments: open/create lifecycle, grow-on-demand
//! allocation, and named anchors.
//!
//! A [`Segment`] owns at most one live mapping of one backing file and
//! mediates every operation against it. When an allocation does not fit,
//! the segment releases the mapping, doubles the backing file, remaps, and
//! reports [`Alloc::Grown`] instead of a pointer: growth invalidates every
//! pointer and anchor obtained under the previous mapping, so it is
//! surfaced as an explicit outcome for the caller to observe, not absorbed
//! silently. The caller discards its stale pointers, re-fetches anchors,
//! and retries the allocation.
//!
//! # Example
//!
//! ```no_run
//! use mapseg::{Alloc, Segment};
//!
//! let mut seg: Segment = Segment::create_or_open("data.seg", 1 << 20)?;
//! let ptr = match seg.allocate(256)? {
//!     Alloc::Ptr(p) => p,
//!     // The arena was doubled; everything mapped before is stale.
//!     Alloc::Grown { .. } => match seg.allocate(256)? {
//!         Alloc::Ptr(p) => p,
//!         Alloc::Grown { .. } => unreachable!("a grown segment fits the retry"),
//!     },
//! };
//! seg.set_named_address("root", Some(ptr))?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::io;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use crate::arena::Arena;
use crate::backing::{Backing, FileBacking};
use crate::error::{OpenError, SegmentError};
use crate::layout::NULL_OFFSET;

/// Outcome of [`Segment::allocate`].
#[derive(Debug, Clone, Copy)]
pub enum Alloc {
    /// A pointer into the current mapping, valid until the next growth.
    Ptr(NonNull<u8>),
    /// The arena was grown and remapped; pointers and anchor addresses
    /// obtained earlier are stale. Retry the allocation.
    Grown {
        /// Total arena size after growth.
        size: usize,
        /// Free bytes after growth.
        free: usize,
    },
}

/// A persistent memory segment backed by a growable file.
///
/// The mapping slot is exclusively owned: growth resets it before the
/// backing file is resized and reassigns it from the fresh mapping, so an
/// old mapping is never observable once a resize has begun. If growth fails
/// partway the slot stays empty and every subsequent operation reports
/// [`SegmentError::Unmapped`].
pub struct Segment<B: Backing = FileBacking> {
    ident: PathBuf,
    arena: Option<Arena<B>>,
    read_only: bool,
}

impl<B: Backing> Segment<B> {
    /// Open the segment at `path`, creating and formatting it with
    /// `initial_size` bytes if it does not exist yet.
    pub fn create_or_open<P: AsRef<Path>>(path: P, initial_size: usize) -> Result<Self, OpenError> {
        let path = path.as_ref();
        let arena = Arena::create_or_open(path, initial_size)?;
        Ok(Segment {
            ident: path.to_owned(),
            arena: Some(arena),
            read_only: false,
        })
    }

    /// Open an existing segment read-write. Fails if the file is missing or
    /// not a valid segment.
    pub fn open_rw<P: AsRef<Path>>(path: P) -> Result<Self, OpenError> {
        let path = path.as_ref();
        let arena = Arena::open(path, true)?;
        Ok(Segment {
            ident: path.to_owned(),
            arena: Some(arena),
            read_only: false,
        })
    }

    /// Open an existing segment read-only. Mutating operations on the
    /// returned handle fail with [`SegmentError::ReadOnly`].
    pub fn open_ro<P: AsRef<Path>>(path: P) -> Result<Self, OpenError> {
        let path = path.as_ref();
        let arena = Arena::open(path, false)?;
        Ok(Segment {
            ident: path.to_owned(),
            arena: Some(arena),
            read_only: true,
        })
    }

    fn arena(&self) -> Result<&Arena<B>, SegmentError> {
        self.arena.as_ref().ok_or(SegmentError::Unmapped)
    }

    fn arena_mut(&mut self) -> Result<&mut Arena<B>, SegmentError> {
        self.arena.as_mut().ok_or(SegmentError::Unmapped)
    }

    pub fn path(&self) -> &Path {
        &self.ident
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Current total arena size in bytes.
    pub fn size(&self) -> Result<usize, SegmentError> {
        Ok(self.arena()?.total_size())
    }

    /// Current free bytes, bookkeeping overhead excluded.
    pub fn free_space(&self) -> Result<usize, SegmentError> {
        Ok(self.arena()?.free_space())
    }

    /// Whether every byte ever allocated has since been deallocated.
    /// Anchors count: a live directory entry keeps this false.
    pub fn all_memory_deallocated(&self) -> Result<bool, SegmentError> {
        Ok(self.arena()?.all_deallocated())
    }

    /// Whether `ptr` lies inside the current mapping's data area.
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        self.arena.as_ref().is_some_and(|a| a.contains(ptr))
    }

    /// Push written pages back to the backing file.
    pub fn flush(&self) -> io::Result<()> {
        match &self.arena {
            Some(arena) => arena.flush(),
            None => Err(io::Error::other(SegmentError::Unmapped)),
        }
    }

    /// Allocate `size` bytes.
    ///
    /// Returns [`Alloc::Ptr`] on a direct hit. Otherwise the arena is grown
    /// by doubling until the request fits, and [`Alloc::Grown`] tells the
    /// caller to discard stale pointers and retry. Growth failures are
    /// fatal: [`SegmentError::OutOfMemory`] when the file cannot be grown
    /// or remapped, [`SegmentError::SizeOverflow`] when doubling leaves the
    /// representable range. After such a failure the handle holds no
    /// mapping.
    pub fn allocate(&mut self, size: usize) -> Result<Alloc, SegmentError> {
        if self.read_only {
            return Err(SegmentError::ReadOnly);
        }

        let arena = self.arena_mut()?;
        // The free-space guard is load-bearing: the underlying allocation
        // can hand back an apparently valid block for some oversized
        // requests, so never attempt one that the counters cannot cover.
        if arena.free_space() >= size {
            if let Some(ptr) = arena.allocate(size)? {
                return Ok(Alloc::Ptr(ptr));
            }
        }

        let mut prev = arena.total_size();
        loop {
            // The file must not be mapped while it is resized.
            self.arena = None;

            let new_size = prev
                .checked_mul(2)
                .ok_or(SegmentError::SizeOverflow { prev })?;
            B::grow(&self.ident, (new_size - prev) as u64).map_err(|e| {
                SegmentError::OutOfMemory {
                    path: self.ident.clone(),
                    source: e,
                }
            })?;

            // Remapping the grown file should succeed, but is not
            // guaranteed; failure is indistinguishable from failed growth.
            let arena = Arena::<B>::open(&self.ident, true).map_err(|e| {
                SegmentError::OutOfMemory {
                    path: self.ident.clone(),
                    source: io::Error::other(e),
                }
            })?;
            let total = arena.total_size();
            let free = arena.free_space();
            self.arena = Some(arena);

            if free >= size {
                #[cfg(feature = "tracing")]
                tracing::debug!("segment grown to {total} bytes, {free} free");
                return Ok(Alloc::Grown { size: total, free });
            }
            prev = total;
        }
    }

    /// Release a block previously returned by [`Segment::allocate`].
    ///
    /// # Safety
    /// `ptr` must come from an allocation on this segment under the current
    /// mapping and must not have been deallocated already. Stale pointers
    /// from before a growth event are undefined behavior.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<(), SegmentError> {
        if self.read_only {
            return Err(SegmentError::ReadOnly);
        }
        unsafe { self.arena_mut()?.deallocate(ptr) }
    }

    /// Look up the anchor `name`. Returns the address stored under the
    /// current mapping, or None when the anchor is absent or cleared.
    /// Safe in read-only mode.
    pub fn get_named_address(&self, name: &str) -> Option<NonNull<u8>> {
        let arena = self.arena.as_ref()?;
        let off = arena.named_get(name)?;
        if off == NULL_OFFSET {
            return None;
        }
        arena.ptr_at(off)
    }

    /// Create or overwrite the anchor `name`.
    ///
    /// A `Some` address must belong to the current arena, otherwise this
    /// fails with [`SegmentError::OutOfSegment`] and the registry is left
    /// unchanged. `None` stores the cleared sentinel while keeping the
    /// anchor present.
    pub fn set_named_address(
        &mut self,
        name: &str,
        addr: Option<NonNull<u8>>,
    ) -> Result<(), SegmentError> {
        if self.read_only {
            return Err(SegmentError::ReadOnly);
        }
        if name.is_empty() || name.contains('\0') {
            return Err(SegmentError::InvalidName);
        }
        let arena = self.arena_mut()?;
        let off = match addr {
            None => NULL_OFFSET,
            Some(ptr) => arena
                .offset_of(ptr)
                .ok_or(SegmentError::OutOfSegment {
                    addr: ptr.as_ptr() as usize,
                })?,
        };
        arena.named_set(name, off)
    }

    /// Remove the anchor `name` entirely; returns whether it existed.
    /// Clearing a nonexistent name is not an error.
    pub fn clear_named_address(&mut self, name: &str) -> Result<bool, SegmentError> {
        if self.read_only {
            return Err(SegmentError::ReadOnly);
        }
        self.arena_mut()?.named_remove(name)
    }
}
