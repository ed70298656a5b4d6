//! Producer side: trace files and the `Tracer` handle
//!
//! ```text
//! qtrace!(t, 9, "rx", var(n))
//!   │
//!   ├─ CatalogClient::lookup_or_create(site)   first hit only: register
//!   ├─ enabled bit (control table)             off: no-op, still "success"
//!   ├─ coerce to registered types              mismatch: Err (only error)
//!   ├─ encode payload (strings capped)         too large: dropped
//!   └─ reserve + commit in level 9             forever log: archive first
//! ```
//!
//! A `Tracer` that failed to initialize is inert: every call returns
//! `Ok(false)` and nothing touches the disk.

mod args;
mod file;
mod forever;

pub use args::{hex, plugin, var, TraceArg};
pub use file::{rotate_existing, Access, CatalogLock, TraceFile};
pub use forever::{archive_path, existing_archives, ForeverLog};

use std::path::Path;
use std::sync::atomic::Ordering;

use crate::catalog::{CallSite, CatalogClient};
use crate::clock::ClockOrigin;
use crate::config::TraceConfig;
use crate::error::{QtError, Result};
use crate::format::{
    record::record_len, FileHeader, Value, FLAG_FOREVER, FLAG_MULTITHREADED, NUM_LEVELS,
};

/// Most records a long string is split into
pub const LONG_STRING_MAX_CHUNKS: usize = 3;

/// Producer handle for one trace file
///
/// `Tracer` is `Sync`; share it between threads by reference or `Arc`.
#[derive(Default)]
pub struct Tracer {
    active: Option<Active>,
}

impl std::fmt::Debug for Tracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracer")
            .field("active", &self.active.is_some())
            .finish_non_exhaustive()
    }
}

struct Active {
    file: TraceFile,
    catalog: CatalogClient,
    forever: Option<ForeverLog>,
    max_string_len: usize,
}

impl Tracer {
    /// A handle that drops every record
    pub fn inert() -> Self {
        Self { active: None }
    }

    /// Create the trace file described by `config`
    ///
    /// Failure is logged and yields an inert handle; check [`is_active`].
    ///
    /// [`is_active`]: Tracer::is_active
    pub fn initialize(config: &TraceConfig) -> Self {
        match Self::try_initialize(config) {
            Ok(tracer) => tracer,
            Err(e) => {
                tracing::warn!(error = %e, "tracing disabled");
                Self::inert()
            }
        }
    }

    /// Like [`initialize`](Tracer::initialize) but returns the failure
    pub fn try_initialize(config: &TraceConfig) -> Result<Self> {
        let path = config.resolve_path()?;
        // A forever log numbers its archives after the live path.
        if config.rotate_existing && config.forever.is_none() {
            rotate_existing(&path);
        }

        let mut flags = 0;
        if config.forever.is_some() {
            flags |= FLAG_FOREVER;
        }
        if config.multithreaded {
            flags |= FLAG_MULTITHREADED;
        }
        let max_string_len = config.effective_max_string_len();
        let header = FileHeader::new(
            config.sizes.as_array(),
            max_string_len as u32,
            config.num_msg_counters,
            ClockOrigin::now(),
            flags,
        );

        let file = TraceFile::create(&path, header)?;
        let forever = match &config.forever {
            Some(forever) => Some(ForeverLog::new(forever, &file)?),
            None => None,
        };
        tracing::debug!(path = %path.display(), "tracing initialized");

        Ok(Self {
            active: Some(Active {
                catalog: CatalogClient::new(file.header().catalog_offset),
                file,
                forever,
                max_string_len,
            }),
        })
    }

    /// Append to a trace file another process created
    pub fn attach(path: &Path) -> Result<Self> {
        let file = TraceFile::open(path, Access::ReadWrite)?;
        let reason = if file.header().is_archive() {
            Some("forever log archives are read-only")
        } else if file.header().is_forever() {
            // Only the owning writer runs the roller; a second writer
            // would let levels wrap before they are archived.
            Some("file is archived by its owning writer's forever log")
        } else {
            None
        };
        if let Some(reason) = reason {
            return Err(QtError::InitializationFailed {
                path: path.display().to_string(),
                reason: reason.to_string(),
            });
        }
        let max_string_len = file.header().max_string_len as usize;
        Ok(Self {
            active: Some(Active {
                catalog: CatalogClient::new(file.header().catalog_offset),
                file,
                forever: None,
                max_string_len,
            }),
        })
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// The open trace file, if any
    pub fn file(&self) -> Option<&TraceFile> {
        self.active.as_ref().map(|a| &a.file)
    }

    /// Append one record at `level`
    ///
    /// Returns `Ok(true)` when the record was written or the message is
    /// disabled, `Ok(false)` when it was dropped (inert handle, bad level,
    /// oversized record, I/O trouble) and `Err` only when a dynamic
    /// argument does not match the type registered for its slot.
    pub fn trace(&self, level: u8, site: CallSite, args: &[TraceArg]) -> Result<bool> {
        let Some(active) = &self.active else {
            return Ok(false);
        };
        if level as usize >= NUM_LEVELS {
            tracing::debug!(level, "dropping record with invalid level");
            return Ok(false);
        }

        let desc = match active
            .catalog
            .lookup_or_create(&active.file, &site, || args::template(args))
        {
            Ok(desc) => desc,
            Err(e) => {
                tracing::warn!(site = %site, error = %e, "message registration failed");
                return Ok(false);
            }
        };
        if !active.file.is_enabled(desc.id) {
            return Ok(true);
        }

        let presented = args::dynamic_values(args);
        let null = Value::Null;
        let mut values = Vec::with_capacity(desc.format.len());
        for (slot, format) in desc.format.slots().iter().enumerate() {
            let value = presented.get(slot).copied().unwrap_or(&null);
            match value.coerce(format.code) {
                Some(v) => values.push(v),
                None => {
                    return Err(QtError::ArgTypeMismatch {
                        message_id: desc.id,
                        slot,
                        registered: format.code.as_char(),
                        presented: value.registration_code().as_char(),
                    })
                }
            }
        }

        let mut payload = Vec::with_capacity(64);
        let null_mask = desc
            .format
            .encode(&values, active.max_string_len, &mut payload);
        Ok(active.append(level, desc.id, null_mask, &payload))
    }

    /// Trace `text` in up to [`LONG_STRING_MAX_CHUNKS`] records
    ///
    /// The first record carries `label` and the first chunk; the rest are
    /// continuation records the tailer joins onto it.
    pub fn trace_long_string(
        &self,
        level: u8,
        site: CallSite,
        label: &'static str,
        text: &str,
    ) -> Result<bool> {
        let Some(active) = &self.active else {
            return Ok(false);
        };
        let chunks = split_chunks(text, active.max_string_len, LONG_STRING_MAX_CHUNKS);
        let continuation = site.continuation();

        let mut written = true;
        for (i, chunk) in chunks.into_iter().enumerate() {
            let ok = if i == 0 {
                let mut first = Vec::with_capacity(2);
                if !label.is_empty() {
                    first.push(TraceArg::from(label));
                }
                first.push(var(chunk));
                self.trace(level, site.clone(), &first)?
            } else {
                self.trace(
                    level,
                    continuation.clone(),
                    &[TraceArg::from("..."), var(chunk)],
                )?
            };
            written &= ok;
        }
        Ok(written)
    }

    /// Release the trace file and forget cached call sites
    pub fn close(&mut self) {
        if let Some(active) = self.active.take() {
            active.catalog.reset();
            tracing::debug!(path = %active.file.path().display(), "tracing closed");
        }
    }
}

impl Active {
    fn append(&self, level: u8, msg_id: u32, null_mask: u16, payload: &[u8]) -> bool {
        let ring = match self.file.level(level as usize) {
            Ok(ring) => ring,
            Err(e) => {
                tracing::warn!(level, error = %e, "level unavailable");
                return false;
            }
        };
        let len = record_len(payload.len());
        if len > ring.capacity() || payload.len() > u16::MAX as usize {
            tracing::debug!(
                "{}",
                QtError::RecordTooLarge {
                    level,
                    len,
                    capacity: ring.capacity()
                }
            );
            return false;
        }

        let committed = match &self.forever {
            Some(forever) => forever.append(&self.file, &self.catalog, &ring, len, |res| {
                ring.commit(res, msg_id, null_mask, payload)
            }),
            None => {
                let res = ring.reserve(len);
                ring.commit(&res, msg_id, null_mask, payload)
            }
        };
        match committed {
            Ok(()) => {
                if let Ok(counter) = self.file.counter(msg_id) {
                    counter.fetch_add(1, Ordering::Relaxed);
                }
                true
            }
            Err(e) => {
                tracing::warn!(level, error = %e, "record dropped");
                false
            }
        }
    }
}

/// Split `text` into at most `max_chunks` pieces of at most `chunk_len`
/// bytes, on character boundaries
fn split_chunks(text: &str, chunk_len: usize, max_chunks: usize) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut rest = text;
    while chunks.len() < max_chunks {
        if rest.len() <= chunk_len {
            chunks.push(rest);
            break;
        }
        let mut cut = chunk_len;
        while cut > 0 && !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        if cut == 0 {
            break;
        }
        chunks.push(&rest[..cut]);
        rest = &rest[cut..];
    }
    chunks
}

/// Trace a message at the current source location
///
/// ```rust,no_run
/// use qtrace_core::{qtrace, Tracer, TraceConfig};
/// use qtrace_core::trace::{hex, var};
///
/// let tracer = Tracer::initialize(&TraceConfig::new("/tmp/demo.qt"));
/// let _ = qtrace!(tracer, 9, "rx", var(42u16), "flags", hex(0x1fu32));
/// ```
#[macro_export]
macro_rules! qtrace {
    ($tracer:expr, $level:expr $(, $arg:expr)* $(,)?) => {
        $tracer.trace(
            $level,
            $crate::catalog::CallSite::new(file!(), line!()),
            &[$($crate::trace::TraceArg::from($arg)),*],
        )
    };
}
