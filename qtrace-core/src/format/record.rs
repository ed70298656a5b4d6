//! Record layout inside a level
//!
//! ```text
//! 0        8        16       20    22    24
//! ┌────────┬────────┬────────┬─────┬─────┬──────────────┬─────┐
//! │ stamp  │ tsc    │ msg id │ len │ nul │ payload      │ pad │
//! └────────┴────────┴────────┴─────┴─────┴──────────────┴─────┘
//! ```
//!
//! Records are 8-byte aligned. The stamp is a function of the record's
//! logical position and is stored last (release); a reader that sees the
//! right stamp for a position sees the whole record. Stale bytes from an
//! earlier lap carry a different position and never match.

/// Bytes before the payload
pub const RECORD_HEADER_LEN: usize = 24;

/// Record alignment
pub const RECORD_ALIGN: usize = 8;

const RECORD_TAG: u64 = 0x5154_5243_0000_0000;
const PAD_TAG: u64 = 0x5154_5041_0000_0000;

pub(crate) const REC_TSC: usize = 8;
pub(crate) const REC_MSG_ID: usize = 16;
pub(crate) const REC_PAYLOAD_LEN: usize = 20;
pub(crate) const REC_NULL_MASK: usize = 22;

/// Stamp of a committed record at logical position `pos`
pub const fn record_stamp(pos: u64) -> u64 {
    pos ^ RECORD_TAG
}

/// Stamp of a pad marker at `pos`; the pad runs to the end of the lap
pub const fn pad_stamp(pos: u64) -> u64 {
    pos ^ PAD_TAG
}

/// Total aligned length of a record with `payload_len` payload bytes
pub const fn record_len(payload_len: usize) -> usize {
    super::align_up(RECORD_HEADER_LEN + payload_len, RECORD_ALIGN)
}

/// Fixed header fields of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub tsc: u64,
    pub msg_id: u32,
    pub payload_len: u16,
    pub null_mask: u16,
}

impl RecordHeader {
    /// Aligned length of the whole record
    pub fn record_len(&self) -> usize {
        record_len(self.payload_len as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_len_alignment() {
        assert_eq!(record_len(0), 24);
        assert_eq!(record_len(1), 32);
        assert_eq!(record_len(8), 32);
        assert_eq!(record_len(9), 40);
    }

    #[test]
    fn test_stamps_are_position_specific() {
        assert_ne!(record_stamp(0), record_stamp(768));
        assert_ne!(record_stamp(64), pad_stamp(64));
    }
}
