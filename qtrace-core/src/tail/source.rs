//! One trace file opened for reading
//!
//! A source keeps a read cursor per level and the file's catalog. Draining
//! a level walks forward from the cursor with the lock-free reader and
//! hands back raw records; decoding happens later so records whose
//! descriptor is not visible yet can wait for it. The newest decoded entry
//! of each level is held here until it is old enough to print, so long
//! string continuations read on a later poll still join onto it.

use std::collections::VecDeque;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::Entry;
use crate::catalog::{CatalogReader, Descriptor};
use crate::clock::ClockOrigin;
use crate::error::Result;
use crate::format::{FileHeader, RECORD_ALIGN, NUM_LEVELS};
use crate::ring::Slot;
use crate::trace::{Access, TraceFile};

/// Polls a record may stay reserved-but-unpublished before it is skipped
pub const STALL_LIMIT: u32 = 100;

/// A record copied out of a level, not yet decoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub level: u8,
    pub pos: u64,
    pub tsc: u64,
    pub msg_id: u32,
    pub null_mask: u16,
    pub payload: Vec<u8>,
}

/// Trouble found while draining a level
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Problem {
    /// Record stamp matched but the record is unusable
    Corruption {
        level: u8,
        msg_id: Option<u32>,
        reason: String,
    },
    /// The writer lapped the reader; `[from, to)` was lost
    Overrun { level: u8, from: u64, to: u64 },
}

/// What happened to the path a source was opened from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathState {
    Unchanged,
    Deleted,
    Replaced,
}

/// A trace file being read
pub struct TraceSource {
    path: PathBuf,
    name: String,
    file: TraceFile,
    catalog: CatalogReader,
    identity: (u64, u64),
    cursors: [u64; NUM_LEVELS],
    stalls: [u32; NUM_LEVELS],
    backlog: [VecDeque<RawRecord>; NUM_LEVELS],
    unknown_polls: [u32; NUM_LEVELS],
    held: [Option<Entry>; NUM_LEVELS],
}

impl TraceSource {
    /// Open `path` read-only, positioned at the oldest record of each level
    pub fn open(path: &Path) -> Result<Self> {
        let file = TraceFile::open(path, Access::ReadOnly)?;
        let mut catalog = CatalogReader::new(file.header().catalog_offset);
        catalog.refresh(file.catalog_file())?;

        let mut cursors = [0u64; NUM_LEVELS];
        for (level, cursor) in cursors.iter_mut().enumerate() {
            let ring = file.level(level)?;
            *cursor = ring.oldest(ring.archived())?;
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let identity = file.identity()?;
        tracing::debug!(path = %path.display(), descriptors = catalog.len(), "opened trace source");

        Ok(Self {
            path: path.to_path_buf(),
            name,
            file,
            catalog,
            identity,
            cursors,
            stalls: [0; NUM_LEVELS],
            backlog: Default::default(),
            unknown_polls: [0; NUM_LEVELS],
            held: Default::default(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name shown in multi-file output
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn header(&self) -> &FileHeader {
        self.file.header()
    }

    pub fn origin(&self) -> &ClockOrigin {
        &self.file.header().origin
    }

    /// Descriptor for `id`, rereading the catalog once if it is not known
    pub fn descriptor(&mut self, id: u32) -> Option<Arc<Descriptor>> {
        if self.catalog.get(id).is_none() {
            if let Err(e) = self.catalog.refresh(self.file.catalog_file()) {
                tracing::warn!(path = %self.path.display(), error = %e, "catalog reread failed");
            }
        }
        self.catalog.get(id).cloned()
    }

    /// Whether the path still names the file this source has open
    pub fn path_state(&self) -> PathState {
        match std::fs::metadata(&self.path) {
            Ok(meta) if (meta.dev(), meta.ino()) == self.identity => PathState::Unchanged,
            Ok(_) => PathState::Replaced,
            Err(_) => PathState::Deleted,
        }
    }

    /// Copy records from the level cursor up to the writer into the backlog
    ///
    /// With `wait_pending` an unpublished record stops the drain so the
    /// next call picks it up; a record stuck for [`STALL_LIMIT`] calls is
    /// skipped. Without it, unpublished records are skipped immediately.
    pub fn drain(&mut self, level: usize, wait_pending: bool, problems: &mut Vec<Problem>) -> Result<()> {
        let ring = self.file.level(level)?;
        let mut pos = self.cursors[level];

        loop {
            match ring.read_slot(pos)? {
                Slot::Record {
                    pos: at,
                    header,
                    payload,
                    next,
                } => {
                    self.backlog[level].push_back(RawRecord {
                        level: level as u8,
                        pos: at,
                        tsc: header.tsc,
                        msg_id: header.msg_id,
                        null_mask: header.null_mask,
                        payload,
                    });
                    self.stalls[level] = 0;
                    pos = next;
                }
                Slot::Pad { next } => pos = next,
                Slot::End => break,
                Slot::Pending => {
                    if wait_pending {
                        self.stalls[level] += 1;
                        if self.stalls[level] < STALL_LIMIT {
                            break;
                        }
                        tracing::debug!(level, pos, "skipping stalled record");
                    }
                    self.stalls[level] = 0;
                    match ring.scan_forward(pos + RECORD_ALIGN as u64, ring.cursor())? {
                        Some(next) => pos = next,
                        None if wait_pending => break,
                        None => {
                            pos = ring.cursor();
                            break;
                        }
                    }
                }
                Slot::Overwritten => {
                    let resume = ring.oldest(ring.archived().max(pos))?;
                    problems.push(Problem::Overrun {
                        level: level as u8,
                        from: pos,
                        to: resume,
                    });
                    pos = resume;
                }
                Slot::Corrupt {
                    msg_id, reason, ..
                } => {
                    problems.push(Problem::Corruption {
                        level: level as u8,
                        msg_id,
                        reason,
                    });
                    pos = ring
                        .scan_forward(pos + RECORD_ALIGN as u64, ring.cursor())?
                        .unwrap_or_else(|| ring.cursor());
                }
            }
        }
        self.cursors[level] = pos;
        Ok(())
    }

    /// Raw records waiting to be decoded for `level`
    pub fn backlog_mut(&mut self, level: usize) -> &mut VecDeque<RawRecord> {
        &mut self.backlog[level]
    }

    /// Polls the front of `level`'s backlog has waited for its descriptor
    pub(crate) fn unknown_polls_mut(&mut self, level: usize) -> &mut u32 {
        &mut self.unknown_polls[level]
    }

    /// Newest decoded entry of `level` not yet handed out
    pub(crate) fn held_mut(&mut self, level: usize) -> &mut Option<Entry> {
        &mut self.held[level]
    }

    /// Hand out held entries stamped at or before `horizon`
    pub(crate) fn release_held(&mut self, horizon: u64, out: &mut Vec<Entry>) {
        for slot in &mut self.held {
            if slot.as_ref().is_some_and(|entry| entry.tsc <= horizon) {
                out.extend(slot.take());
            }
        }
    }

    /// Read cursor of `level`
    pub fn cursor(&self, level: usize) -> u64 {
        self.cursors[level]
    }
}
