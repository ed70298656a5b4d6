//! Per-level ring buffers
//!
//! Each severity level owns one fixed-capacity region of the shared
//! mapping. Positions are logical byte offsets that only grow; the
//! physical offset is `pos % capacity` and the lap (generation) is
//! `pos / capacity`.
//!
//! ```text
//! writer:  reserve (CAS on cursor) ──► write header+payload ──► store stamp (release)
//! reader:  load stamp (acquire) ──► copy record ──► recheck cursor ──► accept
//! ```
//!
//! Reservation never blocks and never splits a record across the end of
//! the region: a record that does not fit is preceded by a pad marker and
//! starts at offset 0 of the next lap.

mod map;
mod reader;
mod writer;

pub use map::SharedMap;
pub use reader::Slot;
pub use writer::{place, Reservation};

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;
use crate::format::{LevelGeometry, TRAILER_ARCHIVED, TRAILER_COMMITS, TRAILER_RESERVE};

/// View of one level inside a [`SharedMap`]
#[derive(Clone, Copy)]
pub struct LevelRef<'a> {
    map: &'a SharedMap,
    geometry: LevelGeometry,
    level: u8,
    reserve: &'a AtomicU64,
    archived: &'a AtomicU64,
    commits: &'a AtomicU64,
}

impl<'a> LevelRef<'a> {
    pub fn new(map: &'a SharedMap, geometry: LevelGeometry, level: u8) -> Result<Self> {
        let trailer = geometry.trailer();
        Ok(Self {
            map,
            geometry,
            level,
            reserve: map.atomic_u64(trailer + TRAILER_RESERVE)?,
            archived: map.atomic_u64(trailer + TRAILER_ARCHIVED)?,
            commits: map.atomic_u64(trailer + TRAILER_COMMITS)?,
        })
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    /// Usable bytes per lap
    pub fn capacity(&self) -> usize {
        self.geometry.capacity
    }

    /// Next position to be reserved
    pub fn cursor(&self) -> u64 {
        self.reserve.load(Ordering::Acquire)
    }

    /// Lap currently being written
    pub fn generation(&self) -> u64 {
        self.cursor() / self.geometry.capacity.max(1) as u64
    }

    /// Records below this position live in forever-log archives
    pub fn archived(&self) -> u64 {
        self.archived.load(Ordering::Acquire)
    }

    pub(crate) fn set_archived(&self, pos: u64) {
        self.archived.fetch_max(pos, Ordering::AcqRel);
    }

    /// Number of records committed since creation
    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    fn physical(&self, pos: u64) -> usize {
        self.geometry.offset + (pos % self.geometry.capacity as u64) as usize
    }
}
