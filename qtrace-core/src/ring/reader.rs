//! Read side of a level
//!
//! Readers never lock. A record is accepted only when its stamp matches
//! its logical position and, after copying, the reservation cursor shows
//! that no writer has come around to overwrite it.

use std::sync::atomic::{fence, Ordering};

use super::LevelRef;
use crate::error::Result;
use crate::format::record::{
    pad_stamp, record_stamp, REC_MSG_ID, REC_NULL_MASK, REC_PAYLOAD_LEN, REC_TSC,
};
use crate::format::{get_u16, get_u32, get_u64, RecordHeader, RECORD_ALIGN, RECORD_HEADER_LEN};

/// What a reader finds at a logical position
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot {
    /// A committed record
    Record {
        pos: u64,
        header: RecordHeader,
        payload: Vec<u8>,
        next: u64,
    },
    /// Skipped lap tail; continue at `next`
    Pad { next: u64 },
    /// Reserved but not yet published (write in flight)
    Pending,
    /// Nothing reserved at or beyond this position yet
    End,
    /// A writer lapped this position before it could be read
    Overwritten,
    /// Stamp matched but the header is inconsistent
    Corrupt {
        pos: u64,
        msg_id: Option<u32>,
        reason: String,
    },
}

impl<'a> LevelRef<'a> {
    fn stamp_at(&self, pos: u64) -> Result<u64> {
        Ok(self
            .map
            .atomic_u64(self.physical(pos))?
            .load(Ordering::Acquire))
    }

    fn lapped(&self, pos: u64) -> bool {
        self.reserve.load(Ordering::Relaxed) > pos + self.geometry.capacity as u64
    }

    /// Read whatever lives at `pos`
    pub fn read_slot(&self, pos: u64) -> Result<Slot> {
        let cap = self.geometry.capacity as u64;
        let cursor = self.cursor();
        if pos >= cursor {
            return Ok(Slot::End);
        }
        if cursor > pos + cap {
            return Ok(Slot::Overwritten);
        }

        let off = pos % cap;
        let stamp = self.stamp_at(pos)?;
        if stamp == pad_stamp(pos) {
            fence(Ordering::Acquire);
            if self.lapped(pos) {
                return Ok(Slot::Overwritten);
            }
            return Ok(Slot::Pad {
                next: pos + (cap - off),
            });
        }
        if stamp != record_stamp(pos) {
            return Ok(if self.lapped(pos) {
                Slot::Overwritten
            } else {
                Slot::Pending
            });
        }

        if off + RECORD_HEADER_LEN as u64 > cap {
            return Ok(Slot::Corrupt {
                pos,
                msg_id: None,
                reason: "record header crosses the end of the buffer".to_string(),
            });
        }
        let base = self.physical(pos);
        let mut fixed = [0u8; RECORD_HEADER_LEN];
        self.map.read(base, &mut fixed)?;
        let header = RecordHeader {
            tsc: get_u64(&fixed, REC_TSC),
            msg_id: get_u32(&fixed, REC_MSG_ID),
            payload_len: get_u16(&fixed, REC_PAYLOAD_LEN),
            null_mask: get_u16(&fixed, REC_NULL_MASK),
        };
        let len = header.record_len() as u64;
        if off + len > cap {
            fence(Ordering::Acquire);
            if self.lapped(pos) {
                return Ok(Slot::Overwritten);
            }
            return Ok(Slot::Corrupt {
                pos,
                msg_id: Some(header.msg_id),
                reason: format!(
                    "record length {} crosses the end of the buffer at offset {}",
                    len, off
                ),
            });
        }

        let mut payload = vec![0u8; header.payload_len as usize];
        self.map.read(base + RECORD_HEADER_LEN, &mut payload)?;

        fence(Ordering::Acquire);
        if self.lapped(pos) || self.stamp_at(pos)? != record_stamp(pos) {
            return Ok(Slot::Overwritten);
        }

        Ok(Slot::Record {
            pos,
            header,
            payload,
            next: pos + len,
        })
    }

    /// Next position in `[from, limit)` carrying a record or pad stamp
    pub fn scan_forward(&self, from: u64, limit: u64) -> Result<Option<u64>> {
        let mut pos = crate::format::align_up(from as usize, RECORD_ALIGN) as u64;
        while pos < limit {
            let stamp = self.stamp_at(pos)?;
            if stamp == record_stamp(pos) || stamp == pad_stamp(pos) {
                return Ok(Some(pos));
            }
            pos += RECORD_ALIGN as u64;
        }
        Ok(None)
    }

    /// Position of the oldest intact record at or above `floor`
    ///
    /// `floor` must be a record boundary (0 or the archived cursor). When
    /// the writer has lapped past it, the oldest record is found by
    /// scanning the last lap for a matching stamp.
    pub fn oldest(&self, floor: u64) -> Result<u64> {
        let cursor = self.cursor();
        let lap_start = cursor.saturating_sub(self.geometry.capacity as u64);
        if lap_start <= floor {
            return Ok(floor.min(cursor));
        }
        Ok(self.scan_forward(lap_start, cursor)?.unwrap_or(cursor))
    }

    /// Every visible record from the oldest to the cursor
    ///
    /// In-flight records are skipped, not waited for. Corrupt entries are
    /// returned as `Slot::Corrupt` and scanning resumes after them.
    pub fn snapshot(&self) -> Result<(Vec<Slot>, u64)> {
        let floor = self.archived();
        let mut pos = self.oldest(floor)?;
        let mut out = Vec::new();

        loop {
            match self.read_slot(pos)? {
                slot @ Slot::Record { .. } => {
                    if let Slot::Record { next, .. } = &slot {
                        pos = *next;
                    }
                    out.push(slot);
                }
                Slot::Pad { next } => pos = next,
                Slot::End => break,
                Slot::Overwritten => pos = self.oldest(self.archived().max(pos))?,
                Slot::Pending => match self.scan_forward(pos + RECORD_ALIGN as u64, self.cursor())? {
                    Some(next) => pos = next,
                    None => break,
                },
                corrupt @ Slot::Corrupt { .. } => {
                    out.push(corrupt);
                    match self.scan_forward(pos + RECORD_ALIGN as u64, self.cursor())? {
                        Some(next) => pos = next,
                        None => break,
                    }
                }
            }
        }
        Ok((out, pos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ClockOrigin;
    use crate::format::record::record_len;
    use crate::format::{FileHeader, NUM_LEVELS};
    use crate::trace::TraceFile;

    fn file(dir: &std::path::Path) -> TraceFile {
        let header = FileHeader::new([1; NUM_LEVELS], 24, 8, ClockOrigin::now(), 0);
        TraceFile::create(&dir.join("ring.qt"), header).unwrap()
    }

    fn append(level: &LevelRef<'_>, id: u32, payload: &[u8]) {
        let res = level.reserve(record_len(payload.len()));
        level.commit(&res, id, 0, payload).unwrap();
    }

    fn ids(slots: &[Slot]) -> Vec<u32> {
        slots
            .iter()
            .filter_map(|s| match s {
                Slot::Record { header, .. } => Some(header.msg_id),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_snapshot_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let file = file(dir.path());
        let level = file.level(2).unwrap();
        for id in 0..5 {
            append(&level, id, &id.to_le_bytes());
        }

        let (slots, end) = level.snapshot().unwrap();
        assert_eq!(ids(&slots), vec![0, 1, 2, 3, 4]);
        assert_eq!(end, level.cursor());
        assert_eq!(level.read_slot(end).unwrap(), Slot::End);
    }

    #[test]
    fn test_wrap_keeps_newest_records() {
        let dir = tempfile::tempdir().unwrap();
        let file = file(dir.path());
        let level = file.level(0).unwrap();
        // 40-byte records: 19 per 768-byte lap, the 20th pads to the next lap
        for id in 0..50 {
            append(&level, id, &[id as u8; 16]);
        }
        assert!(level.generation() >= 2);
        assert_eq!(level.read_slot(0).unwrap(), Slot::Overwritten);

        let (slots, _) = level.snapshot().unwrap();
        let seen = ids(&slots);
        assert_eq!(*seen.last().unwrap(), 49);
        for pair in seen.windows(2) {
            assert_eq!(pair[1], pair[0] + 1);
        }
        assert!(seen.len() <= 19);
    }

    #[test]
    fn test_reserved_but_uncommitted_is_pending() {
        let dir = tempfile::tempdir().unwrap();
        let file = file(dir.path());
        let level = file.level(1).unwrap();
        append(&level, 1, &[]);
        let stalled = level.reserve(record_len(0));
        append(&level, 2, &[]);

        assert_eq!(level.read_slot(stalled.pos).unwrap(), Slot::Pending);
        let (slots, _) = level.snapshot().unwrap();
        assert_eq!(ids(&slots), vec![1, 2]);
    }
}
