//! Write side of a level: lock-free reservation and commit

use std::sync::atomic::Ordering;

use crossbeam::utils::Backoff;

use super::LevelRef;
use crate::clock;
use crate::error::Result;
use crate::format::record::{
    pad_stamp, record_stamp, REC_MSG_ID, REC_NULL_MASK, REC_PAYLOAD_LEN, REC_TSC,
};
use crate::format::{put_u16, put_u32, put_u64, RecordHeader, RECORD_HEADER_LEN};

/// A reserved byte range in a level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    /// Where the record starts
    pub pos: u64,
    /// One past the record
    pub end: u64,
    /// Timestamp taken inside the winning reservation attempt
    pub tsc: u64,
    /// Start of the skipped lap tail, when the record moved to the next lap
    pub pad: Option<u64>,
}

/// Place a record of `len` bytes at cursor `pos` in a level of `capacity`
///
/// Returns `(start, end)`. When the record does not fit before the end of
/// the current lap it moves to the start of the next one.
pub fn place(pos: u64, len: usize, capacity: usize) -> (u64, u64) {
    let cap = capacity as u64;
    let off = pos % cap;
    if off + len as u64 <= cap {
        (pos, pos + len as u64)
    } else {
        let start = pos + (cap - off);
        (start, start + len as u64)
    }
}

impl<'a> LevelRef<'a> {
    /// Reserve `len` bytes (a record length, at most the capacity)
    ///
    /// The timestamp is sampled inside the CAS loop, so timestamps are
    /// non-decreasing in position order within a level.
    pub fn reserve(&self, len: usize) -> Reservation {
        let backoff = Backoff::new();
        let mut current = self.reserve.load(Ordering::Relaxed);
        loop {
            let tsc = clock::tsc();
            let (start, end) = place(current, len, self.geometry.capacity);
            match self.reserve.compare_exchange_weak(
                current,
                end,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    return Reservation {
                        pos: start,
                        end,
                        tsc,
                        pad: (start != current).then_some(current),
                    }
                }
                Err(actual) => {
                    current = actual;
                    backoff.spin();
                }
            }
        }
    }

    /// Reserve only if the cursor still equals `expected`
    ///
    /// Used by the forever log, which archives the bytes a reservation
    /// will overwrite before making it.
    pub fn try_reserve_at(&self, expected: u64, len: usize, tsc: u64) -> Option<Reservation> {
        let (start, end) = place(expected, len, self.geometry.capacity);
        self.reserve
            .compare_exchange(expected, end, Ordering::AcqRel, Ordering::Relaxed)
            .ok()
            .map(|_| Reservation {
                pos: start,
                end,
                tsc,
                pad: (start != expected).then_some(expected),
            })
    }

    /// Write a record into its reservation and publish it
    pub fn commit(
        &self,
        reservation: &Reservation,
        msg_id: u32,
        null_mask: u16,
        payload: &[u8],
    ) -> Result<()> {
        if let Some(pad) = reservation.pad {
            self.map
                .atomic_u64(self.physical(pad))?
                .store(pad_stamp(pad), Ordering::Release);
        }

        let header = RecordHeader {
            tsc: reservation.tsc,
            msg_id,
            payload_len: payload.len() as u16,
            null_mask,
        };
        let mut fixed = [0u8; RECORD_HEADER_LEN];
        put_u64(&mut fixed, REC_TSC, header.tsc);
        put_u32(&mut fixed, REC_MSG_ID, header.msg_id);
        put_u16(&mut fixed, REC_PAYLOAD_LEN, header.payload_len);
        put_u16(&mut fixed, REC_NULL_MASK, header.null_mask);

        let base = self.physical(reservation.pos);
        // The stamp word is published last, separately.
        self.map.write(base + 8, &fixed[8..])?;
        self.map.write(base + RECORD_HEADER_LEN, payload)?;
        self.map
            .atomic_u64(base)?
            .store(record_stamp(reservation.pos), Ordering::Release);
        self.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
