//! Heap-backed segment store - available to downstream crates for testing.
//!
//! [`HeapBacking`] implements [`Backing`] over a process-global registry of
//! named byte buffers, so the whole segment stack (growth loop included) can
//! be exercised without touching a filesystem. A buffer keeps its identity
//! across unmap/grow/remap exactly like a file would: dropping a writable
//! backing writes the bytes back to the registry, and `grow` extends the
//! registry entry while nothing is mapped.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

use crate::backing::Backing;

fn registry() -> &'static Mutex<HashMap<PathBuf, Vec<u8>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<PathBuf, Vec<u8>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// A registry identity no other test is using.
pub fn unique_ident(tag: &str) -> PathBuf {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    PathBuf::from(format!("heap:{tag}:{n}"))
}

/// In-memory [`Backing`] with file-like identity semantics.
///
/// The buffer is a `Vec<u64>` so the region base carries the 8-byte
/// alignment the trait contract demands.
#[derive(Debug)]
pub struct HeapBacking {
    ident: PathBuf,
    buf: Vec<u64>,
    len: usize,
    writable: bool,
}

impl HeapBacking {
    fn with_bytes(ident: &Path, bytes: &[u8], writable: bool) -> Self {
        let mut buf = vec![0u64; bytes.len().div_ceil(8)];
        // Safety: buf covers at least bytes.len() bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), buf.as_mut_ptr() as *mut u8, bytes.len());
        }
        HeapBacking {
            ident: ident.to_owned(),
            buf,
            len: bytes.len(),
            writable,
        }
    }

    fn write_back(&self) {
        let bytes = unsafe { std::slice::from_raw_parts(self.buf.as_ptr() as *const u8, self.len) };
        let mut reg = registry().lock().unwrap();
        let entry = reg.entry(self.ident.clone()).or_default();
        if entry.len() < self.len {
            entry.resize(self.len, 0);
        }
        // Never truncate: the entry may have grown since this was mapped.
        entry[..self.len].copy_from_slice(bytes);
    }
}

impl Backing for HeapBacking {
    fn create(ident: &Path, size: usize) -> io::Result<Self> {
        let mut reg = registry().lock().unwrap();
        if reg.contains_key(ident) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "heap region already exists",
            ));
        }
        reg.insert(ident.to_owned(), vec![0; size]);
        drop(reg);
        Ok(HeapBacking::with_bytes(ident, &vec![0; size], true))
    }

    fn open(ident: &Path, writable: bool) -> io::Result<Self> {
        let reg = registry().lock().unwrap();
        let bytes = reg
            .get(ident)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "heap region not found"))?;
        Ok(HeapBacking::with_bytes(ident, bytes, writable))
    }

    fn grow(ident: &Path, delta: u64) -> io::Result<()> {
        let mut reg = registry().lock().unwrap();
        let entry = reg
            .get_mut(ident)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "heap region not found"))?;
        let new_len = entry.len() + delta as usize;
        entry.resize(new_len, 0);
        Ok(())
    }

    fn len(&self) -> usize {
        self.len
    }

    fn base(&self) -> *const u8 {
        self.buf.as_ptr() as *const u8
    }

    fn base_mut(&mut self) -> Option<*mut u8> {
        if self.writable {
            Some(self.buf.as_mut_ptr() as *mut u8)
        } else {
            None
        }
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn flush(&self) -> io::Result<()> {
        if self.writable {
            self.write_back();
        }
        Ok(())
    }
}

impl Drop for HeapBacking {
    fn drop(&mut self) {
        if self.writable {
            self.write_back();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_survives_unmap_and_grow() {
        let ident = unique_ident("backing");
        {
            let mut backing = HeapBacking::create(&ident, 64).unwrap();
            unsafe { *backing.base_mut().unwrap().add(9) = 7 };
        }
        HeapBacking::grow(&ident, 64).unwrap();

        let reopened = HeapBacking::open(&ident, false).unwrap();
        assert_eq!(reopened.len(), 128);
        unsafe {
            assert_eq!(*reopened.base().add(9), 7);
            assert_eq!(*reopened.base().add(100), 0);
        }
    }

    #[test]
    fn create_twice_fails() {
        let ident = unique_ident("dup");
        let _first = HeapBacking::create(&ident, 64).unwrap();
        let err = HeapBacking::create(&ident, 64).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }

    #[test]
    fn open_missing_fails() {
        let err = HeapBacking::open(Path::new("heap:never-created"), true).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn read_only_handle_has_no_mut_base() {
        let ident = unique_ident("romut");
        drop(HeapBacking::create(&ident, 64).unwrap());
        let mut ro = HeapBacking::open(&ident, false).unwrap();
        assert!(ro.base_mut().is_none());
        assert!(!ro.is_writable());
    }
}
