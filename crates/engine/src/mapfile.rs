//! Mapped file manager: owns the descriptor and the shared memory mapping.
//!
//! A `MapFile` is immutable once built; growth and catch-up produce a *new*
//! `MapFile` over the same descriptor and the caller swaps it in. Readers
//! that still hold the old `MapFile` (through an `Arc`) keep a valid view of
//! every byte that existed when it was mapped — the file only ever grows,
//! and a repack's rename keeps the old inode alive for as long as someone
//! holds it open.
//!
//! Byte ranges handed out by [`MapFile::bytes`] stay valid until the holder
//! performs an operation that may swap the mapping (store, commit, lock
//! release, close); the transaction layer encodes that contract in borrow
//! lifetimes. Pointer slots are mutated in place, so they are accessed
//! exclusively through the aligned atomic loads and stores below.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use memmap2::{Mmap, MmapMut, MmapOptions};

use crate::error::{badformat, Error, Result};

/// Files grow in 16 KiB steps.
const GROWTH_ALIGN: u64 = 16 * 1024;

/// Rounds a requested size up per the growth policy: 125% of the need,
/// rounded to the next 16 KiB boundary.
pub(crate) fn growth_size(needed: u64) -> u64 {
    let padded = needed + needed / 4;
    (padded + GROWTH_ALIGN - 1) & !(GROWTH_ALIGN - 1)
}

enum MapKind {
    /// Nothing mapped yet (zero-length file awaiting initialisation).
    Empty,
    Ro(#[allow(dead_code)] Mmap),
    Rw(#[allow(dead_code)] MmapMut),
}

/// One mapping of one database file.
pub(crate) struct MapFile {
    file: File,
    map: MapKind,
    ptr: *mut u8,
    len: u64,
    writable: bool,
    sync: bool,
    dev: u64,
    ino: u64,
}

// All mutation goes through aligned atomics or happens in append space the
// writer owns under the exclusive data lock.
unsafe impl Send for MapFile {}
unsafe impl Sync for MapFile {}

impl MapFile {
    /// Opens (optionally creating) the file at `path` and maps its current
    /// contents.
    pub(crate) fn open(path: &Path, writable: bool, create: bool, sync: bool) -> Result<MapFile> {
        let file = match OpenOptions::new()
            .read(true)
            .write(writable)
            .create(create && writable)
            .open(path)
        {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(Error::NotFound),
            Err(e) => return Err(e.into()),
        };
        Self::from_file(file, writable, sync)
    }

    /// Maps an already-open descriptor.
    pub(crate) fn from_file(file: File, writable: bool, sync: bool) -> Result<MapFile> {
        let meta = file.metadata()?;
        let len = meta.len();
        let (map, ptr) = Self::map_fd(&file, len, writable)?;
        Ok(MapFile {
            file,
            map,
            ptr,
            len,
            writable,
            sync,
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }

    fn map_fd(file: &File, len: u64, writable: bool) -> Result<(MapKind, *mut u8)> {
        if len == 0 {
            return Ok((MapKind::Empty, std::ptr::null_mut()));
        }
        if writable {
            let mut m = unsafe { MmapOptions::new().len(len as usize).map_mut(file)? };
            let ptr = m.as_mut_ptr();
            Ok((MapKind::Rw(m), ptr))
        } else {
            let m = unsafe { MmapOptions::new().len(len as usize).map(file)? };
            let ptr = m.as_ptr() as *mut u8;
            Ok((MapKind::Ro(m), ptr))
        }
    }

    /// Extends the file so that at least `needed` bytes exist, and returns a
    /// fresh mapping over the same descriptor. Only the writer, under the
    /// exclusive data lock, may call this.
    pub(crate) fn grow(&self, needed: u64) -> Result<MapFile> {
        debug_assert!(self.writable);
        let new_len = growth_size(needed);
        self.file.set_len(new_len)?;
        tracing::debug!(new_len, needed, "extended database file");
        let file = self.file.try_clone()?;
        Self::from_file(file, self.writable, self.sync)
    }

    /// Remaps the same descriptor at its current length, picking up growth
    /// performed by another process.
    pub(crate) fn catch_up(&self) -> Result<MapFile> {
        let file = self.file.try_clone()?;
        Self::from_file(file, self.writable, self.sync)
    }

    pub(crate) fn len(&self) -> u64 {
        self.len
    }

    pub(crate) fn file(&self) -> &File {
        &self.file
    }

    /// Identity of the mapped inode, for detecting a repack's rename.
    pub(crate) fn identity(&self) -> (u64, u64) {
        (self.dev, self.ino)
    }

    /// Identity of whatever currently lives at `path`.
    pub(crate) fn path_identity(path: &Path) -> Result<(u64, u64)> {
        let meta = std::fs::metadata(path)?;
        Ok((meta.dev(), meta.ino()))
    }

    /// The whole mapping as a byte slice.
    pub(crate) fn as_slice(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.ptr, self.len as usize) }
    }

    fn check(&self, offset: u64, len: u64) -> Result<()> {
        if offset.checked_add(len).map_or(true, |end| end > self.len) {
            return Err(badformat!(
                "range {offset}+{len} outside mapping of {} bytes",
                self.len
            ));
        }
        Ok(())
    }

    /// A bounds-checked byte range.
    pub(crate) fn bytes(&self, offset: u64, len: u64) -> Result<&[u8]> {
        self.check(offset, len)?;
        Ok(unsafe { std::slice::from_raw_parts(self.ptr.add(offset as usize), len as usize) })
    }

    /// Atomic load of an aligned u64 (pointer slots).
    pub(crate) fn load_u64(&self, offset: u64) -> Result<u64> {
        self.check(offset, 8)?;
        debug_assert_eq!(offset % 8, 0);
        let p = unsafe { self.ptr.add(offset as usize) } as *const AtomicU64;
        Ok(unsafe { &*p }.load(Ordering::Acquire))
    }

    /// Atomic store of an aligned u64. This is the only way committed bytes
    /// are ever modified in place.
    pub(crate) fn store_u64(&self, offset: u64, value: u64) -> Result<()> {
        self.require_writable()?;
        self.check(offset, 8)?;
        debug_assert_eq!(offset % 8, 0);
        let p = unsafe { self.ptr.add(offset as usize) } as *const AtomicU64;
        unsafe { &*p }.store(value, Ordering::Release);
        Ok(())
    }

    /// Atomic store of an aligned u32 (head checksum rewrites).
    pub(crate) fn store_u32(&self, offset: u64, value: u32) -> Result<()> {
        self.require_writable()?;
        self.check(offset, 4)?;
        debug_assert_eq!(offset % 4, 0);
        let p = unsafe { self.ptr.add(offset as usize) } as *const AtomicU32;
        unsafe { &*p }.store(value, Ordering::Release);
        Ok(())
    }

    /// Copies `data` into the mapping. Reserved for append space and the
    /// header, with the exclusive data lock held.
    pub(crate) fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.require_writable()?;
        self.check(offset, data.len() as u64)?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.add(offset as usize), data.len());
        }
        Ok(())
    }

    fn require_writable(&self) -> Result<()> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    /// Synchronously flushes a byte range, unless the file was opened with
    /// `no_sync`.
    pub(crate) fn flush_range(&self, offset: u64, len: u64) -> Result<()> {
        if self.sync {
            self.flush_range_always(offset, len)?;
        }
        Ok(())
    }

    /// Flushes regardless of the `no_sync` setting (explicit `sync` calls).
    pub(crate) fn flush_range_always(&self, offset: u64, len: u64) -> Result<()> {
        if let MapKind::Rw(m) = &self.map {
            m.flush_range(offset as usize, len as usize)?;
        }
        Ok(())
    }

    pub(crate) fn flush_all(&self) -> Result<()> {
        if self.sync {
            if let MapKind::Rw(m) = &self.map {
                m.flush()?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for MapFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapFile")
            .field("len", &self.len)
            .field("writable", &self.writable)
            .field("ino", &self.ino)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn growth_policy() {
        // 125% of the need, rounded up to 16 KiB
        assert_eq!(growth_size(1), 16 * 1024);
        assert_eq!(growth_size(16 * 1024), 32 * 1024);
        assert_eq!(growth_size(100_000), 128 * 1024);
    }

    #[test]
    fn write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.db");
        let f = MapFile::open(&path, true, true, true).unwrap();
        assert_eq!(f.len(), 0);
        let f = f.grow(400).unwrap();
        assert_eq!(f.len(), 16 * 1024);
        f.write_bytes(96, b"hello mapping").unwrap();
        f.store_u64(0, 0xfeed).unwrap();
        assert_eq!(f.bytes(96, 13).unwrap(), b"hello mapping");
        assert_eq!(f.load_u64(0).unwrap(), 0xfeed);
        f.flush_all().unwrap();

        // a second mapping of the same file sees the bytes
        let g = MapFile::open(&path, false, false, true).unwrap();
        assert_eq!(g.bytes(96, 13).unwrap(), b"hello mapping");
        assert!(g.store_u64(0, 1).is_err());
        assert_eq!(g.identity(), f.identity());
    }

    #[test]
    fn bounds_are_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.db");
        let f = MapFile::open(&path, true, true, true).unwrap().grow(1).unwrap();
        assert!(f.bytes(16 * 1024 - 4, 8).is_err());
        assert!(f.load_u64(16 * 1024).is_err());
        assert!(f.bytes(u64::MAX, 8).is_err());
    }

    #[test]
    fn missing_file_is_notfound() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.db");
        assert!(matches!(
            MapFile::open(&path, false, false, true),
            Err(Error::NotFound)
        ));
    }
}
