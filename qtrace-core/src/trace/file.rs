//! Trace file lifecycle: create, open, map
//!
//! A `TraceFile` couples the shared mapping (header, control table, level
//! regions) with an append handle for the catalog that grows past the
//! mapped range.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::error::{QtError, Result};
use crate::format::{
    FileHeader, CONTROL_OFF, HEADER_FIXED_LEN, NUM_LEVELS, OFF_ARCHIVE_INDEX, OFF_NEXT_MSG_ID,
};
use crate::ring::{LevelRef, SharedMap};

/// How an existing file is mapped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

/// An open, mapped trace file
pub struct TraceFile {
    path: PathBuf,
    header: FileHeader,
    map: SharedMap,
    catalog: File,
}

/// Holds the cross-process catalog lock until dropped
pub struct CatalogLock<'a> {
    file: Option<&'a File>,
}

impl Drop for CatalogLock<'_> {
    fn drop(&mut self) {
        if let Some(file) = self.file {
            // SAFETY: plain flock on a descriptor we own.
            unsafe {
                libc::flock(file.as_raw_fd(), libc::LOCK_UN);
            }
        }
    }
}

impl TraceFile {
    /// Create a new trace file at `path`, replacing any existing one
    ///
    /// Space for the whole mapping is allocated up front, so a full disk
    /// fails here rather than faulting later; the partial file is removed.
    pub fn create(path: &Path, header: FileHeader) -> Result<Self> {
        let shown = path.display().to_string();
        let fail = |reason: String| QtError::InitializationFailed {
            path: shown.clone(),
            reason,
        };

        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .mode(0o644)
            .open(path)
            .map_err(|e| fail(e.to_string()))?;

        let len = header.mapped_len();
        // SAFETY: posix_fallocate on an open descriptor with a valid range.
        let rc = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, len as libc::off_t) };
        if rc != 0 {
            drop(file);
            let _ = std::fs::remove_file(path);
            return Err(fail(std::io::Error::from_raw_os_error(rc).to_string()));
        }

        let map = SharedMap::map_rw(&file, len).map_err(|e| {
            let _ = std::fs::remove_file(path);
            fail(e.to_string())
        })?;
        map.write(0, &header.encode())?;

        let catalog = OpenOptions::new()
            .read(true)
            .append(true)
            .open(path)
            .map_err(|e| fail(e.to_string()))?;

        tracing::debug!(path = %shown, bytes = len, "created trace file");
        let trace_file = Self {
            path: path.to_path_buf(),
            header,
            map,
            catalog,
        };
        trace_file.check_levels()?;
        Ok(trace_file)
    }

    /// Open an existing trace file
    pub fn open(path: &Path, access: Access) -> Result<Self> {
        let shown = path.display().to_string();
        let file = match access {
            Access::ReadOnly => File::open(path)?,
            Access::ReadWrite => OpenOptions::new().read(true).write(true).open(path)?,
        };

        let actual = file.metadata()?.len();
        let mut fixed = [0u8; HEADER_FIXED_LEN];
        if actual < HEADER_FIXED_LEN as u64 {
            return Err(QtError::TruncatedFile {
                path: shown,
                expected: HEADER_FIXED_LEN as u64,
                actual,
            });
        }
        std::os::unix::fs::FileExt::read_exact_at(&file, &mut fixed, 0)?;
        let header = FileHeader::decode(&fixed, &shown)?;
        if actual < header.catalog_offset {
            return Err(QtError::TruncatedFile {
                path: shown,
                expected: header.catalog_offset,
                actual,
            });
        }

        let map = match access {
            Access::ReadOnly => SharedMap::map_ro(&file, header.mapped_len())?,
            Access::ReadWrite => SharedMap::map_rw(&file, header.mapped_len())?,
        };
        let catalog = match access {
            Access::ReadOnly => file,
            Access::ReadWrite => OpenOptions::new().read(true).append(true).open(path)?,
        };

        let trace_file = Self {
            path: path.to_path_buf(),
            header,
            map,
            catalog,
        };
        trace_file.check_levels()?;
        Ok(trace_file)
    }

    fn check_levels(&self) -> Result<()> {
        for level in 0..NUM_LEVELS {
            if self.header.level(level).capacity == 0 {
                return Err(QtError::BadMagic {
                    path: self.path.display().to_string(),
                });
            }
            self.level(level)?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    /// View of one level
    pub fn level(&self, level: usize) -> Result<LevelRef<'_>> {
        if level >= NUM_LEVELS {
            return Err(QtError::InvalidLevel { level: level as u8 });
        }
        LevelRef::new(&self.map, self.header.level(level), level as u8)
    }

    fn control_word(&self, id: u32) -> Result<&AtomicU32> {
        self.map.atomic_u32(self.header.control_offset(id))
    }

    /// Append counter of the control entry for `id`
    pub fn counter(&self, id: u32) -> Result<&AtomicU64> {
        self.map.atomic_u64(self.header.control_offset(id) + 8)
    }

    /// Whether message `id` is enabled; re-read on every append
    pub fn is_enabled(&self, id: u32) -> bool {
        self.control_word(id)
            .map(|w| w.load(Ordering::Acquire) & CONTROL_OFF == 0)
            .unwrap_or(false)
    }

    /// Flip the enabled bit; returns the previous state
    pub fn set_enabled(&self, id: u32, enabled: bool) -> Result<bool> {
        let word = self.control_word(id)?;
        let previous = if enabled {
            word.fetch_and(!CONTROL_OFF, Ordering::AcqRel)
        } else {
            word.fetch_or(CONTROL_OFF, Ordering::AcqRel)
        };
        Ok(previous & CONTROL_OFF == 0)
    }

    /// Zero every append counter
    pub fn clear_counters(&self) -> Result<()> {
        for slot in 0..self.header.num_msg_counters {
            self.counter(slot)?.store(0, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Next free message id
    pub fn next_msg_id(&self) -> u32 {
        self.map
            .atomic_u32(OFF_NEXT_MSG_ID)
            .map(|a| a.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Claim a fresh message id
    pub fn allocate_id(&self) -> Result<u32> {
        Ok(self
            .map
            .atomic_u32(OFF_NEXT_MSG_ID)?
            .fetch_add(1, Ordering::AcqRel))
    }

    /// Make sure ids up to `id` are never handed out again
    pub fn reserve_id(&self, id: u32) -> Result<()> {
        self.map
            .atomic_u32(OFF_NEXT_MSG_ID)?
            .fetch_max(id.saturating_add(1), Ordering::AcqRel);
        Ok(())
    }

    /// Forever-log archive index recorded in the header
    pub fn archive_index(&self) -> u32 {
        self.map
            .atomic_u32(OFF_ARCHIVE_INDEX)
            .map(|a| a.load(Ordering::Acquire))
            .unwrap_or(self.header.archive_index)
    }

    pub(crate) fn set_archive_index(&self, index: u32) -> Result<()> {
        self.map
            .atomic_u32(OFF_ARCHIVE_INDEX)?
            .store(index, Ordering::Release);
        Ok(())
    }

    /// Handle for reading (and, when writable, appending) catalog entries
    pub fn catalog_file(&self) -> &File {
        &self.catalog
    }

    /// Append one catalog entry with a single write
    pub fn append_catalog(&self, entry: &[u8]) -> Result<()> {
        use std::io::Write;
        let mut handle = &self.catalog;
        handle.write_all(entry)?;
        Ok(())
    }

    /// Take the cross-process registration lock
    ///
    /// If `flock` is unavailable the lock degrades to the in-process mutex.
    pub fn lock_catalog(&self) -> CatalogLock<'_> {
        // SAFETY: plain flock on a descriptor we own.
        let rc = unsafe { libc::flock(self.catalog.as_raw_fd(), libc::LOCK_EX) };
        if rc != 0 {
            tracing::debug!(path = %self.path.display(), "flock failed; relying on in-process lock");
            return CatalogLock { file: None };
        }
        CatalogLock {
            file: Some(&self.catalog),
        }
    }

    /// `(device, inode)` of the open file
    pub fn identity(&self) -> Result<(u64, u64)> {
        let meta = self.catalog.metadata()?;
        Ok((meta.dev(), meta.ino()))
    }
}

/// Move `<path>` to `<path>.1`, keeping the first `.1` as `.2`
///
/// `.1` only moves to `.2` when no `.2` exists yet, so the oldest log of a
/// restart loop survives.
pub fn rotate_existing(path: &Path) {
    let with_suffix = |n: u32| {
        let mut s = path.as_os_str().to_owned();
        s.push(format!(".{}", n));
        PathBuf::from(s)
    };
    let older = with_suffix(1);
    let oldest = with_suffix(2);
    if !oldest.exists() {
        let _ = std::fs::rename(&older, &oldest);
    }
    let _ = std::fs::rename(path, &older);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ClockOrigin;

    fn header() -> FileHeader {
        FileHeader::new([1; NUM_LEVELS], 24, 8, ClockOrigin::now(), 0)
    }

    #[test]
    fn test_create_then_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.qt");
        let created = TraceFile::create(&path, header()).unwrap();
        assert_eq!(created.allocate_id().unwrap(), 0);
        assert_eq!(created.allocate_id().unwrap(), 1);

        let opened = TraceFile::open(&path, Access::ReadOnly).unwrap();
        assert_eq!(opened.header(), created.header());
        assert_eq!(opened.next_msg_id(), 2);
        assert_eq!(created.identity().unwrap(), opened.identity().unwrap());
    }

    #[test]
    fn test_enable_bits_and_aliasing() {
        let dir = tempfile::tempdir().unwrap();
        let file = TraceFile::create(&dir.path().join("t.qt"), header()).unwrap();
        assert!(file.is_enabled(3));
        assert!(file.set_enabled(3, false).unwrap());
        assert!(!file.is_enabled(3));
        // 8 control entries: 11 shares with 3
        assert!(!file.is_enabled(11));
        assert!(!file.set_enabled(3, false).unwrap());
        file.set_enabled(3, true).unwrap();
        assert!(file.is_enabled(11));
    }

    #[test]
    fn test_open_rejects_non_trace_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk");
        std::fs::write(&path, vec![7u8; 4096]).unwrap();
        assert!(matches!(
            TraceFile::open(&path, Access::ReadOnly),
            Err(QtError::BadMagic { .. })
        ));
    }

    #[test]
    fn test_rotate_existing_keeps_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.qt");
        std::fs::write(&path, "first").unwrap();
        rotate_existing(&path);
        std::fs::write(&path, "second").unwrap();
        rotate_existing(&path);
        std::fs::write(&path, "third").unwrap();
        rotate_existing(&path);

        let read = |suffix: &str| {
            std::fs::read_to_string(dir.path().join(format!("r.qt{}", suffix))).unwrap()
        };
        assert_eq!(read(".2"), "first");
        assert_eq!(read(".1"), "third");
        assert!(!path.exists());
    }
}
