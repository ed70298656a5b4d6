//! Forever-log roller
//!
//! Before a reservation would overwrite records that have not been
//! archived, those records are copied (original timestamp, id and
//! payload) into a standalone archive trace file `<base>.<index>`.
//!
//! ```text
//!             live level (capacity C)
//!   archived ─────────────┐        cursor ─┐
//!   ... ─────── [ archived records ][ live records ][next] ...
//!                                          └─ end - C must be <= archived
//!
//!   copy [archived, end - C) ──► <base>.<index>   (same level, same ids)
//!                                 rotate to <index + 1> before any level wraps
//! ```
//!
//! Every record therefore lives in exactly one place: an archive (below the
//! archived cursor) or the live file (at or above it).

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crossbeam::utils::Backoff;

use crate::catalog::{encode_entry, CatalogClient};
use crate::clock;
use crate::config::ForeverConfig;
use crate::error::{QtError, Result};
use crate::format::{FileHeader, RecordHeader, FLAG_ARCHIVE};
use crate::ring::{place, LevelRef, Reservation, Slot};
use crate::trace::TraceFile;

/// Spins spent on a record another process reserved but has not published
const PENDING_SPIN_LIMIT: u32 = 4096;

/// Archives records of one live trace file
pub struct ForeverLog {
    base: PathBuf,
    state: Mutex<RollerState>,
}

struct RollerState {
    index: u32,
    archive: Option<Archive>,
    /// Set after a failure so the warning is logged once per archive index
    failed_index: Option<u32>,
}

struct Archive {
    file: TraceFile,
    copied: HashSet<u32>,
}

/// Archive path for `base` and `index`
pub fn archive_path(base: &Path, index: u32) -> PathBuf {
    let mut s = base.as_os_str().to_owned();
    s.push(format!(".{}", index));
    PathBuf::from(s)
}

/// Existing `<base>.<n>` files, ordered by `n`
pub fn existing_archives(base: &Path) -> Vec<(u32, PathBuf)> {
    let pattern = format!(
        "{}.*",
        glob::Pattern::escape(&base.to_string_lossy())
    );
    let mut found: Vec<(u32, PathBuf)> = match glob::glob(&pattern) {
        Ok(paths) => paths
            .filter_map(|entry| entry.ok())
            .filter_map(|path| {
                let name = path.file_name()?.to_str()?;
                let index = name.rsplit('.').next()?.parse::<u32>().ok()?;
                Some((index, path))
            })
            .collect(),
        Err(e) => {
            tracing::warn!(pattern = %pattern, error = %e, "bad archive pattern");
            Vec::new()
        }
    };
    found.sort_by_key(|(index, _)| *index);
    found
}

impl ForeverLog {
    pub fn new(config: &ForeverConfig, live: &TraceFile) -> Result<Self> {
        let index = match config.start_index {
            Some(index) => index,
            None => existing_archives(&config.path)
                .last()
                .map(|(index, _)| index + 1)
                .unwrap_or(0),
        };
        live.set_archive_index(index)?;
        tracing::debug!(base = %config.path.display(), index, "forever log enabled");
        Ok(Self {
            base: config.path.clone(),
            state: Mutex::new(RollerState {
                index,
                archive: None,
                failed_index: None,
            }),
        })
    }

    /// Reserve `len` bytes in `level`, archiving what the reservation will
    /// overwrite, then run `write` on the reservation
    ///
    /// Writes to the same live file are serialized; `write` runs under the
    /// roller lock so no record of this process is in flight while the
    /// next reservation archives.
    pub fn append<F>(
        &self,
        live: &TraceFile,
        catalog: &CatalogClient,
        level: &LevelRef<'_>,
        len: usize,
        write: F,
    ) -> Result<()>
    where
        F: FnOnce(&Reservation) -> Result<()>,
    {
        let mut state = self.state.lock().map_err(|_| QtError::InternalError {
            reason: "forever log lock poisoned".to_string(),
        })?;

        let cap = level.capacity() as u64;
        let backoff = Backoff::new();
        let reservation = loop {
            let cursor = level.cursor();
            let (_, end) = place(cursor, len, level.capacity());
            let must_keep = end.saturating_sub(cap);
            if level.archived() < must_keep {
                self.archive_through(&mut state, live, catalog, level, must_keep)?;
            }
            // Writers that attached without a roller can still move the cursor.
            match level.try_reserve_at(cursor, len, clock::tsc()) {
                Some(reservation) => break reservation,
                None => backoff.spin(),
            }
        };
        write(&reservation)
    }

    fn archive_through(
        &self,
        state: &mut RollerState,
        live: &TraceFile,
        catalog: &CatalogClient,
        level: &LevelRef<'_>,
        target: u64,
    ) -> Result<()> {
        let mut pos = level.archived();
        while pos < target {
            match level.read_slot(pos)? {
                Slot::Record {
                    header,
                    payload,
                    next,
                    ..
                } => {
                    if let Err(e) = self.copy(state, live, catalog, level.level(), &header, &payload)
                    {
                        if state.failed_index != Some(state.index) {
                            tracing::warn!(
                                base = %self.base.display(),
                                index = state.index,
                                error = %e,
                                "forever log archive failed; records will be lost"
                            );
                            state.failed_index = Some(state.index);
                        }
                    }
                    pos = next;
                }
                Slot::Pad { next } => pos = next,
                Slot::End => break,
                Slot::Pending => {
                    if !wait_published(level, pos) {
                        tracing::warn!(level = level.level(), pos, "skipping unpublished record");
                        pos = level
                            .scan_forward(pos + 8, level.cursor())?
                            .unwrap_or(target);
                    }
                }
                Slot::Overwritten => {
                    tracing::warn!(level = level.level(), pos, "records overwritten before archiving");
                    pos = level.oldest(pos)?;
                }
                Slot::Corrupt { reason, .. } => {
                    tracing::warn!(level = level.level(), pos, reason = %reason, "corrupt record not archived");
                    pos = level
                        .scan_forward(pos + 8, level.cursor())?
                        .unwrap_or(target);
                }
            }
        }
        level.set_archived(pos);
        Ok(())
    }

    fn copy(
        &self,
        state: &mut RollerState,
        live: &TraceFile,
        catalog: &CatalogClient,
        level: u8,
        header: &RecordHeader,
        payload: &[u8],
    ) -> Result<()> {
        if state.archive.is_none() && state.failed_index == Some(state.index) {
            return Err(QtError::InitializationFailed {
                path: archive_path(&self.base, state.index).display().to_string(),
                reason: "archive unavailable".to_string(),
            });
        }
        let len = header.record_len();
        let wraps = match &state.archive {
            Some(archive) => {
                let target = archive.file.level(level as usize)?;
                place(target.cursor(), len, target.capacity()).1 > target.capacity() as u64
            }
            None => false,
        };
        if wraps {
            state.archive = None;
            state.index += 1;
            live.set_archive_index(state.index)?;
        }
        if state.archive.is_none() {
            state.archive = Some(self.open_archive(live, state.index)?);
        }
        let archive = state.archive.as_mut().ok_or_else(|| QtError::InternalError {
            reason: "archive missing after open".to_string(),
        })?;

        if archive.copied.insert(header.msg_id) {
            match catalog.descriptor(live, header.msg_id) {
                Some(desc) => {
                    archive.file.reserve_id(desc.id)?;
                    archive.file.append_catalog(&encode_entry(&desc))?;
                }
                None => tracing::warn!(id = header.msg_id, "archiving record with unknown message id"),
            }
        }

        let target = archive.file.level(level as usize)?;
        let reservation = target
            .try_reserve_at(target.cursor(), len, header.tsc)
            .ok_or_else(|| QtError::InternalError {
                reason: "archive cursor moved concurrently".to_string(),
            })?;
        target.commit(&reservation, header.msg_id, header.null_mask, payload)
    }

    fn open_archive(&self, live: &TraceFile, index: u32) -> Result<Archive> {
        let source = live.header();
        let mut header = FileHeader::new(
            source.sizes_kb,
            source.max_string_len,
            source.num_msg_counters,
            source.origin,
            FLAG_ARCHIVE,
        );
        header.archive_index = index;
        let path = archive_path(&self.base, index);
        let file = TraceFile::create(&path, header)?;
        tracing::debug!(path = %path.display(), "opened forever log archive");
        Ok(Archive {
            file,
            copied: HashSet::new(),
        })
    }
}

fn wait_published(level: &LevelRef<'_>, pos: u64) -> bool {
    let backoff = Backoff::new();
    for _ in 0..PENDING_SPIN_LIMIT {
        match level.read_slot(pos) {
            Ok(Slot::Pending) => backoff.snooze(),
            _ => return true,
        }
    }
    false
}
