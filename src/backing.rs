//! Backing stores for segment regions.
//!
//! [`Backing`] is the narrow capability surface the arena needs from the
//! bytes underneath it: create a zero-filled region under a path identity,
//! reopen it, grow the *unmapped* identity, and expose the mapped range.
//! The production implementation is [`FileBacking`] over `memmap2`; the
//! [`crate::test_utils`] module provides a heap-backed substitute so the
//! growth and anchor logic can be exercised without touching a filesystem.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

use memmap2::{Mmap, MmapMut};

/// A byte region with file-like identity and an out-of-mapping grow
/// operation.
///
/// Contract: the region base is at least 8-byte aligned, and `grow` is only
/// called while no mapping of the identity exists in this process.
pub trait Backing: Sized {
    /// Create a zero-filled region of `size` bytes. Fails with
    /// `AlreadyExists` if the identity is taken.
    fn create(ident: &Path, size: usize) -> io::Result<Self>;

    /// Map an existing region. Fails with `NotFound` if absent.
    fn open(ident: &Path, writable: bool) -> io::Result<Self>;

    /// Extend the backing by `delta` bytes without mapping it.
    fn grow(ident: &Path, delta: u64) -> io::Result<()>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn base(&self) -> *const u8;

    /// Base pointer for writes; `None` when the region is read-only.
    fn base_mut(&mut self) -> Option<*mut u8>;

    fn is_writable(&self) -> bool;

    /// Push written pages back to the backing store.
    fn flush(&self) -> io::Result<()>;
}

#[derive(Debug)]
enum Map {
    Rw(MmapMut),
    Ro(Mmap),
}

/// Memory-mapped file region.
#[derive(Debug)]
pub struct FileBacking {
    // The file handle is kept for the lifetime of the mapping.
    _file: File,
    map: Map,
}

impl Backing for FileBacking {
    fn create(ident: &Path, size: usize) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(ident)?;
        file.set_len(size as u64)?;
        // Safety: we hold the only handle to a freshly created file; the
        // caller serializes writers per the single-writer model.
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(FileBacking {
            _file: file,
            map: Map::Rw(map),
        })
    }

    fn open(ident: &Path, writable: bool) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(writable).open(ident)?;
        // Safety: mapping a file another process could mutate is inherently
        // unchecked; the single-writer model delegates that to the caller.
        let map = if writable {
            Map::Rw(unsafe { MmapMut::map_mut(&file)? })
        } else {
            Map::Ro(unsafe { Mmap::map(&file)? })
        };
        Ok(FileBacking { _file: file, map })
    }

    fn grow(ident: &Path, delta: u64) -> io::Result<()> {
        let file = OpenOptions::new().read(true).write(true).open(ident)?;
        let len = file.metadata()?.len();
        let new_len = len
            .checked_add(delta)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "file size overflow"))?;
        file.set_len(new_len)
    }

    fn len(&self) -> usize {
        match &self.map {
            Map::Rw(m) => m.len(),
            Map::Ro(m) => m.len(),
        }
    }

    fn base(&self) -> *const u8 {
        match &self.map {
            Map::Rw(m) => m.as_ptr(),
            Map::Ro(m) => m.as_ptr(),
        }
    }

    fn base_mut(&mut self) -> Option<*mut u8> {
        match &mut self.map {
            Map::Rw(m) => Some(m.as_mut_ptr()),
            Map::Ro(_) => None,
        }
    }

    fn is_writable(&self) -> bool {
        matches!(self.map, Map::Rw(_))
    }

    fn flush(&self) -> io::Result<()> {
        match &self.map {
            Map::Rw(m) => m.flush(),
            Map::Ro(_) => Ok(()),
        }
    }
}
