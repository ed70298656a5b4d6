//! Shared file mapping
//!
//! Producers, the tailer and the controller all map the same file range
//! (header, control table, level regions). Producers and the controller
//! map it read-write, the tailer read-only. Every cross-process handoff
//! goes through the atomics handed out here; bulk bytes are copied with
//! plain memory copies and validated by the record stamp protocol.

use std::fs::File;
use std::sync::atomic::{AtomicU32, AtomicU64};

use memmap2::{Mmap, MmapMut, MmapOptions};

use crate::error::{QtError, Result};

/// Owns the mapping; only the raw pointer in `SharedMap` is used
#[allow(dead_code)]
enum Mapping {
    ReadWrite(MmapMut),
    ReadOnly(Mmap),
}

/// A fixed-length shared mapping of a trace file
pub struct SharedMap {
    ptr: *mut u8,
    len: usize,
    writable: bool,
    _mapping: Mapping,
}

// SAFETY: the mapping is never remapped or resized while `SharedMap` is
// alive. All concurrent mutation happens through atomics or through byte
// ranges that the ring protocol hands to exactly one writer at a time.
unsafe impl Send for SharedMap {}
unsafe impl Sync for SharedMap {}

impl SharedMap {
    /// Map the first `len` bytes of `file` for reading and writing
    pub fn map_rw(file: &File, len: usize) -> Result<Self> {
        // SAFETY: the file was sized to at least `len` before mapping and
        // trace files are never truncated while in use.
        let mut map = unsafe { MmapOptions::new().len(len).map_mut(file)? };
        let ptr = map.as_mut_ptr();
        Ok(Self {
            ptr,
            len,
            writable: true,
            _mapping: Mapping::ReadWrite(map),
        })
    }

    /// Map the first `len` bytes of `file` read-only
    pub fn map_ro(file: &File, len: usize) -> Result<Self> {
        // SAFETY: same fixed-length file; this view never writes.
        let map = unsafe { MmapOptions::new().len(len).map(file)? };
        let ptr = map.as_ptr() as *mut u8;
        Ok(Self {
            ptr,
            len,
            writable: false,
            _mapping: Mapping::ReadOnly(map),
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    fn check(&self, off: usize, n: usize, align: usize) -> Result<()> {
        if off % align != 0 || off.checked_add(n).map_or(true, |end| end > self.len) {
            return Err(QtError::InternalError {
                reason: format!("mapping access {}+{} out of bounds ({})", off, n, self.len),
            });
        }
        Ok(())
    }

    /// Atomic view of the 8 bytes at `off`
    pub fn atomic_u64(&self, off: usize) -> Result<&AtomicU64> {
        self.check(off, 8, 8)?;
        // SAFETY: in bounds and 8-byte aligned (the mapping is page aligned).
        Ok(unsafe { &*(self.ptr.add(off) as *const AtomicU64) })
    }

    /// Atomic view of the 4 bytes at `off`
    pub fn atomic_u32(&self, off: usize) -> Result<&AtomicU32> {
        self.check(off, 4, 4)?;
        // SAFETY: in bounds and 4-byte aligned.
        Ok(unsafe { &*(self.ptr.add(off) as *const AtomicU32) })
    }

    /// Copy bytes out of the mapping
    pub fn read(&self, off: usize, dst: &mut [u8]) -> Result<()> {
        self.check(off, dst.len(), 1)?;
        // SAFETY: in bounds; concurrent writers may race with this copy,
        // which the caller detects through the stamp/cursor recheck.
        unsafe { std::ptr::copy_nonoverlapping(self.ptr.add(off), dst.as_mut_ptr(), dst.len()) };
        Ok(())
    }

    /// Copy bytes into the mapping
    pub fn write(&self, off: usize, src: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(QtError::InternalError {
                reason: "write through a read-only mapping".to_string(),
            });
        }
        self.check(off, src.len(), 1)?;
        // SAFETY: in bounds of a writable mapping; the range was reserved
        // for this writer by the ring cursor.
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.add(off), src.len()) };
        Ok(())
    }
}
