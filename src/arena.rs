//! The managed arena: free-list allocation and the anchor directory over a
//! single backing region.
//!
//! An [`Arena`] owns one mapped region and interprets it according to the
//! format in [`crate::layout`]: a header, an address-ordered free list with
//! first-fit allocation and coalescing on free, and a linked directory of
//! named anchor entries allocated from the same free list. Everything the
//! arena stores is an offset from the region base, never an absolute
//! address, so a region can be unmapped, grown, and remapped (possibly at a
//! different base, in a different process) without invalidating its
//! contents.

use std::io;
use std::path::Path;
use std::ptr::{self, NonNull};

use crate::backing::Backing;
use crate::error::{OpenError, SegmentError};
use crate::layout::{
    ALIGNMENT, FORMAT_VERSION, FreeNode, HEADER_SIZE, Header, MAGIC, MIN_BLOCK, MIN_SEGMENT_SIZE,
    NULL_OFFSET, TAG_SIZE, align_down, block_size_for,
};

// Anchor directory entry, stored as a regular allocated block:
// [next: u64][addr: u64][name_len: u64][name bytes...]
const ENTRY_NEXT: usize = 0;
const ENTRY_ADDR: usize = 8;
const ENTRY_LEN: usize = 16;
const ENTRY_NAME: usize = 24;

/// A formatted backing region: the arena primitive the segment layer builds
/// on.
#[derive(Debug)]
pub struct Arena<B: Backing> {
    backing: B,
}

unsafe fn read_u64(base: *const u8, off: usize) -> u64 {
    unsafe { ptr::read(base.add(off) as *const u64) }
}

unsafe fn write_u64(base: *mut u8, off: usize, v: u64) {
    unsafe { ptr::write(base.add(off) as *mut u64, v) }
}

unsafe fn read_node(base: *const u8, off: usize) -> FreeNode {
    unsafe { ptr::read(base.add(off) as *const FreeNode) }
}

unsafe fn write_node(base: *mut u8, off: usize, node: FreeNode) {
    unsafe { ptr::write(base.add(off) as *mut FreeNode, node) }
}

unsafe fn header<'a>(base: *const u8) -> &'a Header {
    unsafe { &*(base as *const Header) }
}

/// Point `prev` (a free block, or the header when 0) at `target`.
unsafe fn set_link(base: *mut u8, prev: usize, target: u64) {
    unsafe {
        if prev == 0 {
            (*(base as *mut Header)).free_head = target;
        } else {
            write_u64(base, prev + TAG_SIZE, target);
        }
    }
}

unsafe fn on_alloc(base: *mut u8, size: u64) {
    unsafe {
        let hdr = &mut *(base as *mut Header);
        hdr.free_bytes -= size;
        hdr.live_bytes += size;
    }
}

unsafe fn on_free(base: *mut u8, size: u64) {
    unsafe {
        let hdr = &mut *(base as *mut Header);
        hdr.free_bytes += size;
        hdr.live_bytes -= size;
    }
}

/// Insert block `[off, off + size)` into the address-ordered free list,
/// coalescing with adjacent free neighbours. Counters are the caller's job.
unsafe fn insert_free(base: *mut u8, off: usize, size: usize) {
    unsafe {
        let mut prev = 0usize;
        let mut cur = header(base).free_head as usize;
        while cur != 0 && cur < off {
            prev = cur;
            cur = read_node(base, cur).next as usize;
        }

        let mut merged_size = size;
        let mut next_link = cur as u64;
        if cur != 0 && off + size == cur {
            let n = read_node(base, cur);
            merged_size += n.size as usize;
            next_link = n.next;
        }

        if prev != 0 {
            let p = read_node(base, prev);
            if prev + p.size as usize == off {
                write_node(
                    base,
                    prev,
                    FreeNode {
                        size: (p.size as usize + merged_size) as u64,
                        next: next_link,
                    },
                );
                return;
            }
        }

        write_node(
            base,
            off,
            FreeNode {
                size: merged_size as u64,
                next: next_link,
            },
        );
        set_link(base, prev, off as u64);
    }
}

impl<B: Backing> Arena<B> {
    /// Open `ident` if it exists, otherwise create it with `initial_size`
    /// bytes and format it: header plus one free block spanning the rest.
    pub fn create_or_open(ident: &Path, initial_size: usize) -> Result<Self, OpenError> {
        if initial_size < MIN_SEGMENT_SIZE {
            return Err(OpenError::TooSmall {
                path: ident.to_owned(),
                len: initial_size,
                min: MIN_SEGMENT_SIZE,
            });
        }
        match B::create(ident, initial_size) {
            Ok(mut backing) => {
                let len = backing.len();
                let Some(base) = backing.base_mut() else {
                    return Err(OpenError::Io {
                        path: ident.to_owned(),
                        source: io::Error::new(
                            io::ErrorKind::PermissionDenied,
                            "created region is not writable",
                        ),
                    });
                };
                let data_end = align_down(len, ALIGNMENT);
                let free = (data_end - HEADER_SIZE) as u64;
                unsafe {
                    ptr::write(
                        base as *mut Header,
                        Header {
                            magic: MAGIC,
                            version: FORMAT_VERSION,
                            reserved: 0,
                            total_size: len as u64,
                            free_bytes: free,
                            live_bytes: 0,
                            free_head: HEADER_SIZE as u64,
                            dir_head: NULL_OFFSET,
                        },
                    );
                    write_node(
                        base,
                        HEADER_SIZE,
                        FreeNode {
                            size: free,
                            next: NULL_OFFSET,
                        },
                    );
                }
                Ok(Arena { backing })
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Self::open(ident, true),
            Err(e) => Err(OpenError::Io {
                path: ident.to_owned(),
                source: e,
            }),
        }
    }

    /// Map an existing region and validate its header. A writable open that
    /// finds the file larger than the recorded arena size absorbs the tail
    /// into the free list; this is how a remap after growth picks up the new
    /// space.
    pub fn open(ident: &Path, writable: bool) -> Result<Self, OpenError> {
        let backing = B::open(ident, writable).map_err(|e| OpenError::Io {
            path: ident.to_owned(),
            source: e,
        })?;
        let len = backing.len();
        if len < MIN_SEGMENT_SIZE {
            return Err(OpenError::TooSmall {
                path: ident.to_owned(),
                len,
                min: MIN_SEGMENT_SIZE,
            });
        }

        let hdr = unsafe { header(backing.base()) };
        if hdr.magic != MAGIC {
            return Err(OpenError::BadMagic {
                path: ident.to_owned(),
            });
        }
        if hdr.version != FORMAT_VERSION {
            return Err(OpenError::VersionMismatch {
                path: ident.to_owned(),
                found: hdr.version,
                expected: FORMAT_VERSION,
            });
        }
        let corrupt = |reason: &str| OpenError::Corrupt {
            path: ident.to_owned(),
            reason: reason.to_owned(),
        };
        let total =
            usize::try_from(hdr.total_size).map_err(|_| corrupt("arena size out of range"))?;
        if total < MIN_SEGMENT_SIZE || total > len {
            return Err(corrupt("recorded size inconsistent with file"));
        }
        let data = (align_down(total, ALIGNMENT) - HEADER_SIZE) as u64;
        if hdr.free_bytes + hdr.live_bytes != data {
            return Err(corrupt("allocation counters do not cover the data area"));
        }

        let mut arena = Arena { backing };
        if writable && len > total {
            arena.absorb_tail(total, len);
        }
        Ok(arena)
    }

    /// Fold file bytes beyond the recorded arena size into the free list.
    fn absorb_tail(&mut self, old_total: usize, new_len: usize) {
        let Some(base) = self.backing.base_mut() else {
            return;
        };
        let old_end = align_down(old_total, ALIGNMENT);
        let new_end = align_down(new_len, ALIGNMENT);
        let tail = new_end - old_end;
        // A tail below the minimum block stays unrecorded until a later
        // growth makes it usable.
        if tail < MIN_BLOCK {
            return;
        }
        unsafe {
            insert_free(base, old_end, tail);
            let hdr = &mut *(base as *mut Header);
            hdr.free_bytes += tail as u64;
            hdr.total_size = new_len as u64;
        }
        #[cfg(feature = "tracing")]
        tracing::debug!("absorbed {tail} grown bytes, arena now {new_len} bytes");
    }

    /// Extend the backing under `ident` by `delta` bytes. The identity must
    /// not be mapped while this runs.
    pub fn grow_backing(ident: &Path, delta: u64) -> io::Result<()> {
        B::grow(ident, delta)
    }

    pub fn total_size(&self) -> usize {
        unsafe { header(self.backing.base()).total_size as usize }
    }

    pub fn free_space(&self) -> usize {
        unsafe { header(self.backing.base()).free_bytes as usize }
    }

    /// Whether every allocated block, anchor directory entries included, has
    /// been released.
    pub fn all_deallocated(&self) -> bool {
        unsafe { header(self.backing.base()).live_bytes == 0 }
    }

    pub fn is_writable(&self) -> bool {
        self.backing.is_writable()
    }

    pub fn flush(&self) -> io::Result<()> {
        self.backing.flush()
    }

    /// Address-membership test for the data area under the current mapping.
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        let addr = ptr.as_ptr() as usize;
        let base = self.backing.base() as usize;
        addr >= base + HEADER_SIZE && addr < base + self.total_size()
    }

    /// Arena-relative offset of `ptr`, or None if it is not in the data
    /// area.
    pub fn offset_of(&self, ptr: NonNull<u8>) -> Option<u64> {
        if self.contains(ptr) {
            Some((ptr.as_ptr() as usize - self.backing.base() as usize) as u64)
        } else {
            None
        }
    }

    /// Pointer under the current mapping for a stored offset. None for the
    /// null sentinel and for offsets outside the data area.
    pub fn ptr_at(&self, off: u64) -> Option<NonNull<u8>> {
        let off = usize::try_from(off).ok()?;
        if off < HEADER_SIZE || off >= self.total_size() {
            return None;
        }
        // Safety: base is non-null and off is in the mapped range.
        Some(unsafe { NonNull::new_unchecked(self.backing.base().add(off) as *mut u8) })
    }

    /// First-fit allocation. `Ok(None)` means no free block fits; the
    /// segment layer turns that into a growth cycle.
    pub fn allocate(&mut self, size: usize) -> Result<Option<NonNull<u8>>, SegmentError> {
        let Some(base) = self.backing.base_mut() else {
            return Err(SegmentError::ReadOnly);
        };
        let Some(need) = block_size_for(size) else {
            return Ok(None);
        };
        unsafe {
            let mut prev = 0usize;
            let mut cur = header(base).free_head as usize;
            while cur != 0 {
                let node = read_node(base, cur);
                let bsize = node.size as usize;
                if bsize >= need {
                    let taken = if bsize - need >= MIN_BLOCK {
                        // Split: the remainder keeps the list position.
                        let rest = cur + need;
                        write_node(
                            base,
                            rest,
                            FreeNode {
                                size: (bsize - need) as u64,
                                next: node.next,
                            },
                        );
                        set_link(base, prev, rest as u64);
                        need
                    } else {
                        set_link(base, prev, node.next);
                        bsize
                    };
                    write_u64(base, cur, taken as u64);
                    on_alloc(base, taken as u64);
                    #[cfg(feature = "tracing")]
                    tracing::debug!("allocate {size} bytes at offset {cur}");
                    return Ok(Some(NonNull::new_unchecked(base.add(cur + TAG_SIZE))));
                }
                prev = cur;
                cur = node.next as usize;
            }
        }
        Ok(None)
    }

    /// Release a block back to the free list.
    ///
    /// # Safety
    /// `ptr` must have been returned by [`Arena::allocate`] on this arena
    /// under the current mapping and not deallocated since.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<(), SegmentError> {
        let Some(base) = self.backing.base_mut() else {
            return Err(SegmentError::ReadOnly);
        };
        unsafe {
            let off = ptr.as_ptr() as usize - base as usize - TAG_SIZE;
            let size = read_u64(base, off);
            insert_free(base, off, size as usize);
            on_free(base, size);
            #[cfg(feature = "tracing")]
            tracing::debug!("deallocate {size} bytes at offset {off}");
        }
        Ok(())
    }

    /// Walk the anchor directory. Returns (predecessor entry, entry)
    /// offsets, 0 standing for the list head / absence.
    fn named_find(&self, name: &[u8]) -> (usize, usize) {
        let base = self.backing.base();
        unsafe {
            let mut prev = 0usize;
            let mut cur = header(base).dir_head as usize;
            while cur != 0 {
                let len = read_u64(base, cur + ENTRY_LEN) as usize;
                let stored = std::slice::from_raw_parts(base.add(cur + ENTRY_NAME), len);
                if stored == name {
                    return (prev, cur);
                }
                prev = cur;
                cur = read_u64(base, cur + ENTRY_NEXT) as usize;
            }
            (prev, 0)
        }
    }

    /// Stored address offset for `name`; None when no such anchor exists.
    /// The stored offset may itself be the null sentinel.
    pub fn named_get(&self, name: &str) -> Option<u64> {
        let (_, entry) = self.named_find(name.as_bytes());
        if entry == 0 {
            return None;
        }
        Some(unsafe { read_u64(self.backing.base(), entry + ENTRY_ADDR) })
    }

    /// Create or overwrite the anchor `name`, storing `target` (an arena
    /// offset, or the null sentinel).
    pub fn named_set(&mut self, name: &str, target: u64) -> Result<(), SegmentError> {
        if !self.backing.is_writable() {
            return Err(SegmentError::ReadOnly);
        }
        let (_, entry) = self.named_find(name.as_bytes());
        if entry != 0 {
            let Some(base) = self.backing.base_mut() else {
                return Err(SegmentError::ReadOnly);
            };
            // Safety: named_find returned a live directory entry.
            unsafe { write_u64(base, entry + ENTRY_ADDR, target) };
            return Ok(());
        }

        // New entries must not trigger growth: growing here would invalidate
        // the very address the caller is trying to anchor.
        let requested = ENTRY_NAME + name.len();
        let Some(slot) = self.allocate(requested)? else {
            return Err(SegmentError::Exhausted { requested });
        };
        let Some(base) = self.backing.base_mut() else {
            return Err(SegmentError::ReadOnly);
        };
        unsafe {
            let off = slot.as_ptr() as usize - base as usize;
            write_u64(base, off + ENTRY_NEXT, header(base).dir_head);
            write_u64(base, off + ENTRY_ADDR, target);
            write_u64(base, off + ENTRY_LEN, name.len() as u64);
            ptr::copy_nonoverlapping(name.as_ptr(), base.add(off + ENTRY_NAME), name.len());
            (*(base as *mut Header)).dir_head = off as u64;
        }
        Ok(())
    }

    /// Remove the anchor `name` entirely; returns whether it existed.
    pub fn named_remove(&mut self, name: &str) -> Result<bool, SegmentError> {
        if !self.backing.is_writable() {
            return Err(SegmentError::ReadOnly);
        }
        let (prev, entry) = self.named_find(name.as_bytes());
        if entry == 0 {
            return Ok(false);
        }
        let Some(base) = self.backing.base_mut() else {
            return Err(SegmentError::ReadOnly);
        };
        unsafe {
            let next = read_u64(base, entry + ENTRY_NEXT);
            if prev == 0 {
                (*(base as *mut Header)).dir_head = next;
            } else {
                write_u64(base, prev + ENTRY_NEXT, next);
            }
            let ptr = NonNull::new_unchecked(base.add(entry));
            self.deallocate(ptr)?;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{HeapBacking, unique_ident};

    fn heap_arena(tag: &str, size: usize) -> (std::path::PathBuf, Arena<HeapBacking>) {
        let ident = unique_ident(tag);
        let arena = Arena::<HeapBacking>::create_or_open(&ident, size).unwrap();
        (ident, arena)
    }

    #[test]
    fn fresh_arena_has_one_free_block() {
        let (_, arena) = heap_arena("fresh", 1024);
        assert_eq!(arena.total_size(), 1024);
        assert_eq!(arena.free_space(), 1024 - HEADER_SIZE);
        assert!(arena.all_deallocated());
    }

    #[test]
    fn too_small_initial_size_is_rejected() {
        let ident = unique_ident("tiny");
        let err = Arena::<HeapBacking>::create_or_open(&ident, 32).unwrap_err();
        assert!(matches!(err, OpenError::TooSmall { .. }));
    }

    #[test]
    fn allocate_and_free_restores_counters() {
        let (_, mut arena) = heap_arena("counters", 1024);
        let initial_free = arena.free_space();

        let a = arena.allocate(100).unwrap().unwrap();
        let b = arena.allocate(50).unwrap().unwrap();
        let c = arena.allocate(200).unwrap().unwrap();
        assert!(!arena.all_deallocated());
        assert!(arena.contains(a) && arena.contains(b) && arena.contains(c));

        // Free out of order so both coalescing directions run.
        unsafe {
            arena.deallocate(b).unwrap();
            arena.deallocate(c).unwrap();
            arena.deallocate(a).unwrap();
        }
        assert!(arena.all_deallocated());
        assert_eq!(arena.free_space(), initial_free);

        // The list must have coalesced back into one spanning block.
        let whole = arena.allocate(initial_free - TAG_SIZE).unwrap();
        assert!(whole.is_some());
    }

    #[test]
    fn allocation_failure_leaves_state_intact() {
        let (_, mut arena) = heap_arena("nofit", 256);
        let free_before = arena.free_space();
        assert!(arena.allocate(free_before * 2).unwrap().is_none());
        assert_eq!(arena.free_space(), free_before);
    }

    #[test]
    fn zero_size_allocation_is_a_real_block() {
        let (_, mut arena) = heap_arena("zero", 256);
        let p = arena.allocate(0).unwrap().unwrap();
        assert!(arena.contains(p));
        assert!(!arena.all_deallocated());
        unsafe { arena.deallocate(p).unwrap() };
        assert!(arena.all_deallocated());
    }

    #[test]
    fn first_fit_reuses_freed_block() {
        let (_, mut arena) = heap_arena("reuse", 1024);
        let a = arena.allocate(100).unwrap().unwrap();
        let _b = arena.allocate(100).unwrap().unwrap();
        unsafe { arena.deallocate(a).unwrap() };
        let c = arena.allocate(100).unwrap().unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn named_roundtrip_and_remove() {
        let (_, mut arena) = heap_arena("named", 1024);
        assert_eq!(arena.named_get("root"), None);

        arena.named_set("root", 256).unwrap();
        arena.named_set("aux", NULL_OFFSET).unwrap();
        assert_eq!(arena.named_get("root"), Some(256));
        assert_eq!(arena.named_get("aux"), Some(NULL_OFFSET));

        arena.named_set("root", 512).unwrap();
        assert_eq!(arena.named_get("root"), Some(512));

        assert!(arena.named_remove("root").unwrap());
        assert_eq!(arena.named_get("root"), None);
        assert!(!arena.named_remove("root").unwrap());
        assert!(arena.named_remove("aux").unwrap());
        assert!(arena.all_deallocated());
    }

    #[test]
    fn named_entries_survive_reopen() {
        let ident = unique_ident("persist");
        {
            let mut arena = Arena::<HeapBacking>::create_or_open(&ident, 1024).unwrap();
            arena.named_set("root", 264).unwrap();
        }
        let arena = Arena::<HeapBacking>::open(&ident, false).unwrap();
        assert_eq!(arena.named_get("root"), Some(264));
    }

    #[test]
    fn read_only_arena_rejects_mutation() {
        let ident = unique_ident("ro");
        drop(Arena::<HeapBacking>::create_or_open(&ident, 1024).unwrap());

        let mut arena = Arena::<HeapBacking>::open(&ident, false).unwrap();
        assert!(matches!(arena.allocate(10), Err(SegmentError::ReadOnly)));
        assert!(matches!(
            arena.named_set("x", NULL_OFFSET),
            Err(SegmentError::ReadOnly)
        ));
        assert!(matches!(
            arena.named_remove("x"),
            Err(SegmentError::ReadOnly)
        ));
    }

    #[test]
    fn writable_open_absorbs_grown_tail() {
        let ident = unique_ident("absorb");
        drop(Arena::<HeapBacking>::create_or_open(&ident, 256).unwrap());
        Arena::<HeapBacking>::grow_backing(&ident, 256).unwrap();

        // A read-only open sees the recorded size, not the grown file.
        let ro = Arena::<HeapBacking>::open(&ident, false).unwrap();
        assert_eq!(ro.total_size(), 256);
        drop(ro);

        let rw = Arena::<HeapBacking>::open(&ident, true).unwrap();
        assert_eq!(rw.total_size(), 512);
        assert_eq!(rw.free_space(), 512 - HEADER_SIZE);
    }

    #[test]
    fn garbage_region_is_rejected() {
        let ident = unique_ident("garbage");
        {
            let mut backing = HeapBacking::create(&ident, 128).unwrap();
            let base = backing.base_mut().unwrap();
            unsafe { ptr::write_bytes(base, 0x5A, 128) };
        }
        let err = Arena::<HeapBacking>::open(&ident, true).unwrap_err();
        assert!(matches!(err, OpenError::BadMagic { .. }));
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let ident = unique_ident("version");
        drop(Arena::<HeapBacking>::create_or_open(&ident, 256).unwrap());
        {
            let mut backing = HeapBacking::open(&ident, true).unwrap();
            let base = backing.base_mut().unwrap();
            // The version field sits right after the 4-byte magic.
            unsafe { ptr::write(base.add(4) as *mut u16, FORMAT_VERSION + 1) };
        }
        let err = Arena::<HeapBacking>::open(&ident, true).unwrap_err();
        assert!(
            matches!(err, OpenError::VersionMismatch { found, .. } if found == FORMAT_VERSION + 1)
        );
    }
}
