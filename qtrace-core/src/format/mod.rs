//! Trace file binary format
//!
//! ```text
//! ┌──────────────────────────┐ 0
//! │ FileHeader (128 bytes)   │  magic, version, sizes, origin, next id
//! ├──────────────────────────┤ 128
//! │ control table            │  num_msg_counters × { flags u32, count u64 }
//! ├──────────────────────────┤ header_len
//! │ level 0 region           │  usable area │ 256-byte bookkeeping
//! ├──────────────────────────┤
//! │ ...                      │
//! ├──────────────────────────┤
//! │ level 9 region           │
//! ├──────────────────────────┤ catalog_offset (end of the shared mapping)
//! │ catalog entries ...      │  appended, never mapped
//! └──────────────────────────┘
//! ```
//!
//! All integers are little-endian. Everything up to `catalog_offset` is
//! mapped shared by producers, the tailer and the controller.

pub mod record;
pub mod value;

pub use record::{RecordHeader, RECORD_ALIGN, RECORD_HEADER_LEN};
pub use value::{ArgFormat, FormatSlot, TypeClass, TypeCode, Value, MAX_DYNAMIC_ARGS};

use crate::clock::ClockOrigin;
use crate::error::{QtError, Result};

/// Number of severity levels
pub const NUM_LEVELS: usize = 10;

/// File magic, "QTRACE" followed by two format bytes
pub const MAGIC: u64 = u64::from_le_bytes(*b"QTRACE\x00\x01");

/// Current format version
pub const FORMAT_VERSION: u32 = 1;

/// Fixed part of the header
pub const HEADER_FIXED_LEN: usize = 128;

/// Bookkeeping slice at the end of every level region
pub const LEVEL_TRAILER_LEN: usize = 256;

/// Size of one control table entry
pub const CONTROL_ENTRY_LEN: usize = 16;

/// Control flag: message disabled
pub const CONTROL_OFF: u32 = 1 << 31;

/// Header flag: a forever log archives this file
pub const FLAG_FOREVER: u32 = 1 << 0;
/// Header flag: this file is a forever-log archive
pub const FLAG_ARCHIVE: u32 = 1 << 1;
/// Header flag: producer configured as multithreaded
pub const FLAG_MULTITHREADED: u32 = 1 << 2;

// Header field offsets
pub(crate) const OFF_MAGIC: usize = 0;
pub(crate) const OFF_VERSION: usize = 8;
pub(crate) const OFF_HEADER_LEN: usize = 12;
pub(crate) const OFF_SIZES: usize = 16;
pub(crate) const OFF_MAX_STRING_LEN: usize = 56;
pub(crate) const OFF_NUM_COUNTERS: usize = 60;
pub(crate) const OFF_MONO_ORIGIN: usize = 64;
pub(crate) const OFF_UTC_ORIGIN: usize = 72;
pub(crate) const OFF_NEXT_MSG_ID: usize = 80;
pub(crate) const OFF_FLAGS: usize = 84;
pub(crate) const OFF_CATALOG: usize = 88;
pub(crate) const OFF_ARCHIVE_INDEX: usize = 96;
pub(crate) const OFF_PID: usize = 100;

// Level bookkeeping offsets, relative to the start of the trailer slice
pub(crate) const TRAILER_RESERVE: usize = 0;
pub(crate) const TRAILER_ARCHIVED: usize = 8;
pub(crate) const TRAILER_COMMITS: usize = 16;

/// Round `n` up to a multiple of `align` (a power of two)
pub const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Decoded trace file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub version: u32,
    pub header_len: u32,
    pub sizes_kb: [u32; NUM_LEVELS],
    pub max_string_len: u32,
    pub num_msg_counters: u32,
    pub origin: ClockOrigin,
    pub flags: u32,
    pub catalog_offset: u64,
    pub archive_index: u32,
    pub pid: u32,
}

/// Placement of one level inside the mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelGeometry {
    /// Offset of the usable area
    pub offset: usize,
    /// Usable bytes (region size minus the bookkeeping slice)
    pub capacity: usize,
}

impl LevelGeometry {
    /// Offset of the bookkeeping slice
    pub fn trailer(&self) -> usize {
        self.offset + self.capacity
    }
}

impl FileHeader {
    /// Header for a new file
    pub fn new(
        sizes_kb: [u32; NUM_LEVELS],
        max_string_len: u32,
        num_msg_counters: u32,
        origin: ClockOrigin,
        flags: u32,
    ) -> Self {
        let num_msg_counters = num_msg_counters.max(1);
        let header_len =
            align_up(HEADER_FIXED_LEN + num_msg_counters as usize * CONTROL_ENTRY_LEN, 64);
        let levels_len: u64 = sizes_kb.iter().map(|&kb| kb as u64 * 1024).sum();
        Self {
            version: FORMAT_VERSION,
            header_len: header_len as u32,
            sizes_kb,
            max_string_len,
            num_msg_counters,
            origin,
            flags,
            catalog_offset: header_len as u64 + levels_len,
            archive_index: 0,
            pid: std::process::id(),
        }
    }

    /// Serialize the fixed header; the next message id starts at zero
    pub fn encode(&self) -> [u8; HEADER_FIXED_LEN] {
        let mut buf = [0u8; HEADER_FIXED_LEN];
        put_u64(&mut buf, OFF_MAGIC, MAGIC);
        put_u32(&mut buf, OFF_VERSION, self.version);
        put_u32(&mut buf, OFF_HEADER_LEN, self.header_len);
        for (i, kb) in self.sizes_kb.iter().enumerate() {
            put_u32(&mut buf, OFF_SIZES + i * 4, *kb);
        }
        put_u32(&mut buf, OFF_MAX_STRING_LEN, self.max_string_len);
        put_u32(&mut buf, OFF_NUM_COUNTERS, self.num_msg_counters);
        put_u64(&mut buf, OFF_MONO_ORIGIN, self.origin.mono_ns);
        put_u64(&mut buf, OFF_UTC_ORIGIN, self.origin.utc_ns as u64);
        put_u32(&mut buf, OFF_NEXT_MSG_ID, 0);
        put_u32(&mut buf, OFF_FLAGS, self.flags);
        put_u64(&mut buf, OFF_CATALOG, self.catalog_offset);
        put_u32(&mut buf, OFF_ARCHIVE_INDEX, self.archive_index);
        put_u32(&mut buf, OFF_PID, self.pid);
        buf
    }

    /// Parse and validate a header
    pub fn decode(buf: &[u8], path: &str) -> Result<Self> {
        if buf.len() < HEADER_FIXED_LEN {
            return Err(QtError::TruncatedFile {
                path: path.to_string(),
                expected: HEADER_FIXED_LEN as u64,
                actual: buf.len() as u64,
            });
        }
        if get_u64(buf, OFF_MAGIC) != MAGIC {
            return Err(QtError::BadMagic {
                path: path.to_string(),
            });
        }
        let version = get_u32(buf, OFF_VERSION);
        if version != FORMAT_VERSION {
            return Err(QtError::UnsupportedVersion {
                path: path.to_string(),
                version,
            });
        }

        let mut sizes_kb = [0u32; NUM_LEVELS];
        for (i, kb) in sizes_kb.iter_mut().enumerate() {
            *kb = get_u32(buf, OFF_SIZES + i * 4);
        }

        let header = Self {
            version,
            header_len: get_u32(buf, OFF_HEADER_LEN),
            sizes_kb,
            max_string_len: get_u32(buf, OFF_MAX_STRING_LEN),
            num_msg_counters: get_u32(buf, OFF_NUM_COUNTERS),
            origin: ClockOrigin {
                mono_ns: get_u64(buf, OFF_MONO_ORIGIN),
                utc_ns: get_u64(buf, OFF_UTC_ORIGIN) as i64,
            },
            flags: get_u32(buf, OFF_FLAGS),
            catalog_offset: get_u64(buf, OFF_CATALOG),
            archive_index: get_u32(buf, OFF_ARCHIVE_INDEX),
            pid: get_u32(buf, OFF_PID),
        };

        let levels_len: u64 = sizes_kb.iter().map(|&kb| kb as u64 * 1024).sum();
        let consistent = header.num_msg_counters > 0
            && sizes_kb.iter().all(|&kb| kb > 0)
            && header.header_len as usize
                >= HEADER_FIXED_LEN + header.num_msg_counters as usize * CONTROL_ENTRY_LEN
            && header.catalog_offset == header.header_len as u64 + levels_len;
        if !consistent {
            return Err(QtError::BadMagic {
                path: path.to_string(),
            });
        }
        Ok(header)
    }

    /// Length of the shared mapping
    pub fn mapped_len(&self) -> usize {
        self.catalog_offset as usize
    }

    /// Where level `level` lives
    pub fn level(&self, level: usize) -> LevelGeometry {
        let before: usize = self.sizes_kb[..level]
            .iter()
            .map(|&kb| kb as usize * 1024)
            .sum();
        let size = self.sizes_kb[level] as usize * 1024;
        LevelGeometry {
            offset: self.header_len as usize + before,
            capacity: size.saturating_sub(LEVEL_TRAILER_LEN),
        }
    }

    /// Offset of the control entry that governs message `id`
    ///
    /// Ids beyond the table size share entries (`id % num_msg_counters`).
    pub fn control_offset(&self, id: u32) -> usize {
        HEADER_FIXED_LEN + (id % self.num_msg_counters) as usize * CONTROL_ENTRY_LEN
    }

    pub fn is_archive(&self) -> bool {
        self.flags & FLAG_ARCHIVE != 0
    }

    /// The owning writer archives each level before it wraps
    pub fn is_forever(&self) -> bool {
        self.flags & FLAG_FOREVER != 0
    }
}

pub(crate) fn put_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn get_u16(buf: &[u8], off: usize) -> u16 {
    let mut b = [0u8; 2];
    b.copy_from_slice(&buf[off..off + 2]);
    u16::from_le_bytes(b)
}

pub(crate) fn get_u32(buf: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[off..off + 4]);
    u32::from_le_bytes(b)
}

pub(crate) fn get_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FileHeader {
        FileHeader::new(
            [1, 2, 3, 4, 5, 6, 7, 8, 9, 10],
            24,
            512,
            ClockOrigin {
                mono_ns: 10,
                utc_ns: 20,
            },
            FLAG_FOREVER,
        )
    }

    #[test]
    fn test_header_decode_matches() {
        let header = sample();
        let bytes = header.encode();
        let parsed = FileHeader::decode(&bytes, "t.qt").unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = sample().encode();
        bytes[0] ^= 0xff;
        assert!(matches!(
            FileHeader::decode(&bytes, "t.qt"),
            Err(QtError::BadMagic { .. })
        ));
    }

    #[test]
    fn test_level_geometry() {
        let header = sample();
        let l0 = header.level(0);
        let l1 = header.level(1);
        assert_eq!(l0.offset, header.header_len as usize);
        assert_eq!(l0.capacity, 1024 - LEVEL_TRAILER_LEN);
        assert_eq!(l1.offset, l0.offset + 1024);
        assert_eq!(l0.trailer() % 8, 0);
        let last = header.level(9);
        assert_eq!(last.trailer() + LEVEL_TRAILER_LEN, header.mapped_len());
    }

    #[test]
    fn test_control_entries_alias() {
        let header = sample();
        assert_eq!(header.control_offset(3), header.control_offset(515));
        assert_ne!(header.control_offset(3), header.control_offset(4));
    }
}
