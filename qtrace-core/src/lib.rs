//! # QTrace Core - low-overhead ring-buffer tracing
//!
//! A producer appends compact binary records to a memory-mapped trace file;
//! decoding to text happens out of band, in another process, whenever
//! someone wants to look.
//!
//! - **Message catalog**: each call site is registered once and gets a
//!   message id; records carry only the id, a timestamp and the dynamic
//!   argument values
//! - **Ring buffer store**: ten fixed-capacity levels per file, appended
//!   lock-free by any number of threads and processes
//! - **Forever log**: optional archives `<path>.<n>` keep records a level
//!   is about to overwrite
//! - **Tailer** (`qttail`): decodes one or more files in timestamp order,
//!   once or following live
//! - **Controller** (`qtctl`): lists messages and turns them on or off in
//!   a running process
//!
//! ## Core Principle
//!
//! > Tracing never stops the program it traces.
//!
//! A trace file that cannot be created leaves the handle inert; a record
//! that does not fit is dropped. The only error a call site ever sees is an
//! argument whose type contradicts the one registered for that site.
//!
//! ## Example
//!
//! ```rust
//! use qtrace_core::trace::var;
//! use qtrace_core::tail::{Formatters, TailOptions, Tailer};
//! use qtrace_core::{qtrace, SizeSpec, TraceConfig, Tracer};
//!
//! let dir = tempfile::tempdir().unwrap();
//! let config = TraceConfig::new(dir.path().join("demo.qt")).with_sizes(SizeSpec::uniform(4));
//! let tracer = Tracer::initialize(&config);
//! assert!(tracer.is_active());
//!
//! for i in 0..3u32 {
//!     qtrace!(tracer, 9, "request", var(i), "done").unwrap();
//! }
//!
//! let path = tracer.file().unwrap().path().to_path_buf();
//! let mut tailer = Tailer::open(&[path], TailOptions::cat(), Formatters::new()).unwrap();
//! let mut out = Vec::new();
//! tailer.cat(&mut out, &mut std::io::sink()).unwrap();
//! let text = String::from_utf8(out).unwrap();
//! assert!(text.lines().last().unwrap().ends_with("\"request 2 done\""));
//! ```

pub mod catalog;
pub mod clock;
pub mod config;
pub mod control;
pub mod error;
pub mod format;
pub mod ring;
pub mod tail;
pub mod trace;

// Re-export main types
pub use catalog::{CallSite, Descriptor};
pub use config::{ForeverConfig, SizeSpec, TraceConfig};
pub use control::{ControlEntry, Controller, Selector};
pub use error::{ErrorCategory, QtError, Result};
pub use format::{ArgFormat, TypeCode, Value, NUM_LEVELS};
pub use tail::{LevelFilter, TailOptions, Tailer};
pub use trace::{TraceArg, TraceFile, Tracer};

pub use format::FORMAT_VERSION;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tail::Formatters;
    use crate::trace::var;

    #[test]
    fn test_full_workflow() {
        let dir = tempfile::tempdir().unwrap();
        let config = TraceConfig::new(dir.path().join("wf.qt")).with_sizes(SizeSpec::uniform(2));
        let tracer = Tracer::try_initialize(&config).unwrap();
        let path = tracer.file().unwrap().path().to_path_buf();

        let open = |fd: i32| qtrace!(tracer, 5, "open fd", var(fd)).unwrap();
        open(3);
        qtrace!(tracer, 5, "read", var(512u64), "bytes").unwrap();

        // Turn the first message off and trace it again
        let mut ctl = Controller::open(&path).unwrap();
        let changed = ctl
            .set_enabled(&Selector::parse(None, Some("^open")).unwrap(), false)
            .unwrap();
        assert_eq!(changed.len(), 1);
        open(4);
        open(5);

        let mut tailer = Tailer::open(&[path], TailOptions::cat(), Formatters::new()).unwrap();
        let mut out = Vec::new();
        let mut err = Vec::new();
        assert_eq!(tailer.cat(&mut out, &mut err).unwrap(), 0);
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().count(), 2, "{}", text);
        assert!(text.contains("\"open fd 3\""));
        assert!(text.contains("\"read 512 bytes\""));
        assert!(!text.contains("open fd 4"));
    }

    #[test]
    fn test_type_mismatch_is_the_only_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = TraceConfig::new(dir.path().join("mm.qt"));
        let tracer = Tracer::try_initialize(&config).unwrap();
        let site = CallSite::new("mm.rs", 7);
        assert!(tracer.trace(1, site.clone(), &[var(1i64)]).unwrap());
        let err = tracer.trace(1, site, &[var("text")]).unwrap_err();
        assert_eq!(err.error_code(), "ARG_TYPE_MISMATCH");
    }
}
