//! Message Catalog
//!
//! Maps a call-site fingerprint to a registered [`Descriptor`]. The id is
//! the join key between records in the ring buffers and the catalog
//! entries appended to the end of the trace file.
//!
//! ```text
//! qtrace!(...) ──► CatalogClient (cache hit) ──────────────► descriptor
//!                       │ miss
//!                       ▼
//!                 registration mutex + flock(file)
//!                       │
//!                       ├─► reread on-disk catalog (another process?)
//!                       └─► allocate id (atomic header counter)
//!                           append entry to file
//! ```
//!
//! A call site is identified by its source file, line and kind. Two call
//! sites that share a file and line (for example macro expansions on the
//! same line) therefore share a descriptor; the first registration wins
//! and later calls must present compatible argument types.

mod client;
mod store;

pub use client::CatalogClient;
pub use store::{encode_entry, fit_entry, CatalogReader, MAX_ENTRY_LEN};

use std::borrow::Cow;
use std::fmt;

use crate::format::ArgFormat;

/// Descriptor flag: record continues the previous record of the same call site
pub const DESC_CONTINUATION: u32 = 1 << 0;

/// Kind of call site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SiteKind {
    /// An ordinary trace statement
    Message,
    /// Continuation chunk of a long string traced at the same location
    Continuation,
}

/// Stable call-site fingerprint
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallSite {
    pub file: Cow<'static, str>,
    pub line: u32,
    pub kind: SiteKind,
}

impl CallSite {
    /// Fingerprint for a source location, normally `file!()`/`line!()`
    pub const fn new(file: &'static str, line: u32) -> Self {
        Self {
            file: Cow::Borrowed(file),
            line,
            kind: SiteKind::Message,
        }
    }

    /// Fingerprint for a location only known at runtime
    pub fn dynamic(file: impl Into<String>, line: u32) -> Self {
        Self {
            file: Cow::Owned(file.into()),
            line,
            kind: SiteKind::Message,
        }
    }

    /// The continuation site paired with this one
    pub fn continuation(&self) -> Self {
        Self {
            file: self.file.clone(),
            line: self.line,
            kind: SiteKind::Continuation,
        }
    }

    fn flags(&self) -> u32 {
        match self.kind {
            SiteKind::Message => 0,
            SiteKind::Continuation => DESC_CONTINUATION,
        }
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// A registered message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    /// Unique within a trace file
    pub id: u32,
    /// Source file of the call site
    pub file: String,
    /// Source line of the call site
    pub line: u32,
    /// Literal text with one placeholder per dynamic argument
    pub text: String,
    /// Type codes of the dynamic arguments
    pub format: ArgFormat,
    /// `DESC_*` flags
    pub flags: u32,
}

impl Descriptor {
    pub fn is_continuation(&self) -> bool {
        self.flags & DESC_CONTINUATION != 0
    }

    /// `file:line`
    pub fn location(&self) -> String {
        format!("{}:{}", self.file, self.line)
    }

    /// Whether this descriptor was registered for `site`
    pub fn matches_site(&self, site: &CallSite) -> bool {
        self.line == site.line && self.file == site.file && self.flags == site.flags()
    }
}
