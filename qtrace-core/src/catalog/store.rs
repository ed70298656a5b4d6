//! On-disk catalog entries
//!
//! Entries are appended after the level regions, one `write` per entry:
//!
//! ```text
//! u32 body_len │ u32 id │ u32 line │ u32 flags │ str file │ str text │ str format │ u32 END
//! ```
//!
//! where `str` is a u16 length followed by UTF-8 bytes and `body_len`
//! counts everything after itself. A reader that finds fewer than
//! `body_len` bytes stops and retries later; a complete entry with a bad
//! end marker is corruption.

use std::collections::HashMap;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::Arc;

use super::{CallSite, Descriptor};
use crate::error::{QtError, Result};
use crate::format::{get_u16, get_u32, ArgFormat};

const ENTRY_END: u32 = 0x4543_5451;
/// Largest entry body a reader accepts
pub const MAX_ENTRY_LEN: usize = 64 * 1024;
/// Body bytes besides the three strings
const ENTRY_FIXED_LEN: usize = 12 + 3 * 2 + 4;

/// Shorten `desc.text` so the encoded entry stays within [`MAX_ENTRY_LEN`]
///
/// The text is cut on a character boundary and never ends in half of a
/// `%%` escape. The file name and argument format are identity and are
/// never cut; if they alone overflow the limit the message is refused.
pub fn fit_entry(desc: &mut Descriptor) -> Result<()> {
    let fixed = ENTRY_FIXED_LEN + desc.file.len() + desc.format.to_string().len();
    if fixed > MAX_ENTRY_LEN {
        return Err(QtError::CatalogEntryTooLarge {
            site: format!("{}:{}", desc.file, desc.line),
            len: fixed + desc.text.len(),
            limit: MAX_ENTRY_LEN,
        });
    }

    let room = (MAX_ENTRY_LEN - fixed).min(u16::MAX as usize);
    if desc.text.len() > room {
        let original = desc.text.len();
        desc.text.truncate(clip(&desc.text, room).len());
        let percents = desc.text.bytes().rev().take_while(|&b| b == b'%').count();
        if percents % 2 == 1 {
            desc.text.pop();
        }
        tracing::debug!(
            file = %desc.file,
            line = desc.line,
            original,
            kept = desc.text.len(),
            "shortened message text to fit the catalog"
        );
    }
    Ok(())
}

/// Longest prefix of `s` within `max` bytes that ends on a char boundary
fn clip(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    &s[..cut]
}

/// Serialize one catalog entry
///
/// Callers registering new messages run [`fit_entry`] first; strings are
/// clipped here only so the length prefixes can never wrap.
pub fn encode_entry(desc: &Descriptor) -> Vec<u8> {
    let format = desc.format.to_string();
    let mut body = Vec::with_capacity(32 + desc.file.len() + desc.text.len() + format.len());
    body.extend_from_slice(&desc.id.to_le_bytes());
    body.extend_from_slice(&desc.line.to_le_bytes());
    body.extend_from_slice(&desc.flags.to_le_bytes());
    for s in [desc.file.as_str(), desc.text.as_str(), format.as_str()] {
        let bytes = clip(s, u16::MAX as usize).as_bytes();
        body.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
        body.extend_from_slice(bytes);
    }
    body.extend_from_slice(&ENTRY_END.to_le_bytes());

    let mut entry = Vec::with_capacity(4 + body.len());
    entry.extend_from_slice(&(body.len() as u32).to_le_bytes());
    entry.extend_from_slice(&body);
    entry
}

/// Incremental reader of a file's catalog
#[derive(Debug, Default)]
pub struct CatalogReader {
    next_offset: u64,
    by_id: HashMap<u32, Arc<Descriptor>>,
    order: Vec<u32>,
}

impl CatalogReader {
    /// Reader starting at the file's catalog offset
    pub fn new(catalog_offset: u64) -> Self {
        Self {
            next_offset: catalog_offset,
            by_id: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Read entries appended since the last refresh; returns how many
    pub fn refresh(&mut self, file: &File) -> Result<usize> {
        let end = file.metadata()?.len();
        if end <= self.next_offset {
            return Ok(0);
        }
        let mut buf = vec![0u8; (end - self.next_offset) as usize];
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read_at(&mut buf[filled..], self.next_offset + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);

        let mut added = 0;
        let mut pos = 0usize;
        while pos + 4 <= buf.len() {
            let body_len = get_u32(&buf, pos) as usize;
            let offset = self.next_offset + pos as u64;
            if body_len > MAX_ENTRY_LEN {
                return Err(QtError::CatalogEntry {
                    offset,
                    reason: format!("entry length {} is implausible", body_len),
                });
            }
            if pos + 4 + body_len > buf.len() {
                break;
            }
            let desc = parse_body(&buf[pos + 4..pos + 4 + body_len], offset)?;
            pos += 4 + body_len;
            self.insert(desc);
            added += 1;
        }
        self.next_offset += pos as u64;
        Ok(added)
    }

    /// Record a descriptor directly (used for archives built in memory)
    pub fn insert(&mut self, desc: Descriptor) {
        let id = desc.id;
        if self.by_id.insert(id, Arc::new(desc)).is_none() {
            self.order.push(id);
        }
    }

    pub fn get(&self, id: u32) -> Option<&Arc<Descriptor>> {
        self.by_id.get(&id)
    }

    /// Descriptor registered for a call site, if any
    pub fn find_site(&self, site: &CallSite) -> Option<&Arc<Descriptor>> {
        self.order
            .iter()
            .filter_map(|id| self.by_id.get(id))
            .find(|d| d.matches_site(site))
    }

    /// Descriptors in registration order
    pub fn descriptors(&self) -> impl Iterator<Item = &Arc<Descriptor>> {
        self.order.iter().filter_map(|id| self.by_id.get(id))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

fn parse_body(body: &[u8], offset: u64) -> Result<Descriptor> {
    let bad = |reason: &str| QtError::CatalogEntry {
        offset,
        reason: reason.to_string(),
    };
    if body.len() < 12 + 6 + 4 {
        return Err(bad("entry too short"));
    }
    if get_u32(body, body.len() - 4) != ENTRY_END {
        return Err(bad("missing end marker"));
    }

    let id = get_u32(body, 0);
    let line = get_u32(body, 4);
    let flags = get_u32(body, 8);
    let mut pos = 12;
    let mut strings = Vec::with_capacity(3);
    for _ in 0..3 {
        if pos + 2 > body.len() - 4 {
            return Err(bad("string header past end of entry"));
        }
        let n = get_u16(body, pos) as usize;
        pos += 2;
        let bytes = body
            .get(pos..pos + n)
            .filter(|_| pos + n <= body.len() - 4)
            .ok_or_else(|| bad("string past end of entry"))?;
        strings.push(String::from_utf8_lossy(bytes).into_owned());
        pos += n;
    }
    if pos != body.len() - 4 {
        return Err(bad("trailing bytes in entry"));
    }

    let format_text = strings.pop().unwrap_or_default();
    let text = strings.pop().unwrap_or_default();
    let file = strings.pop().unwrap_or_default();
    let format = ArgFormat::parse(&format_text)
        .ok_or_else(|| bad(&format!("unknown argument format '{}'", format_text)))?;

    Ok(Descriptor {
        id,
        file,
        line,
        text,
        format,
        flags,
    })
}
