//! Tailer: decode trace files to text
//!
//! ```text
//!   file A ─► TraceSource ─┐  drain levels      decode against the
//!   file B ─► TraceSource ─┼─► raw records ──► file's catalog ──► Entry
//!   ...                    ┘                                       │
//!                                 cat: sort all, print ◄───────────┤
//!                      follow: heap ordered by (tsc, file), print ◄┘
//!                              once older than the holdback horizon
//! ```
//!
//! Records are ordered by timestamp across levels and files; ties go to
//! the file given first on the command line.

mod follow;
pub mod formatter;
pub mod render;
pub mod source;

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use follow::FollowState;
pub use formatter::{FormatterKind, FormatterPlugin, Formatters, QT_FORMATTER_DIR_ENV};
pub use render::{render_message, Columns, CorruptionReport, Entry, LinePrinter};
pub use source::{PathState, Problem, RawRecord, TraceSource};

use crate::clock::ClockOrigin;
use crate::config::QUICKTRACEDIR_ENV;
use crate::error::{QtError, Result};
use crate::format::{Value, NUM_LEVELS};
use crate::trace::{existing_archives, Access, TraceFile};

/// Levels selected for output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelFilter([bool; NUM_LEVELS]);

impl Default for LevelFilter {
    fn default() -> Self {
        Self::all()
    }
}

impl LevelFilter {
    pub fn all() -> Self {
        Self([true; NUM_LEVELS])
    }

    /// Parse a list of levels and ranges such as `0-3,9`
    pub fn parse(spec: &str) -> Result<Self> {
        let invalid = |reason: &str| QtError::InvalidLevelFilter {
            spec: spec.to_string(),
            reason: reason.to_string(),
        };
        let level = |s: &str| -> Result<usize> {
            s.trim()
                .parse::<usize>()
                .ok()
                .filter(|l| *l < NUM_LEVELS)
                .ok_or_else(|| invalid("invalid log level, must be 0..9"))
        };

        let mut selected = [false; NUM_LEVELS];
        for part in spec.split(',').filter(|p| !p.trim().is_empty()) {
            match part.split_once('-') {
                Some((start, end)) => {
                    let (start, end) = (level(start)?, level(end)?);
                    if start >= end {
                        return Err(invalid("start log level must be less than end log level"));
                    }
                    selected[start..=end].iter_mut().for_each(|s| *s = true);
                }
                None => selected[level(part)?] = true,
            }
        }
        if !selected.contains(&true) {
            return Err(invalid("no log levels selected"));
        }
        Ok(Self(selected))
    }

    pub fn contains(&self, level: usize) -> bool {
        self.0.get(level).copied().unwrap_or(false)
    }

    pub fn levels(&self) -> impl Iterator<Item = usize> + '_ {
        (0..NUM_LEVELS).filter(|l| self.0[*l])
    }
}

/// Tailer settings
#[derive(Debug, Clone)]
pub struct TailOptions {
    /// Keep polling for new records after the initial dump
    pub follow: bool,
    /// Print `--- opened`/`--- deleted` lifecycle lines
    pub notices: bool,
    pub show_tsc: bool,
    pub show_location: bool,
    pub levels: LevelFilter,
    /// Read `<file>.<n>` forever-log archives before each file
    pub archives: bool,
    /// How long follow mode holds a record back waiting for older ones
    pub holdback: Duration,
    /// Polls a record with an unknown message id waits for its descriptor
    pub unknown_id_patience: u32,
}

impl Default for TailOptions {
    fn default() -> Self {
        Self {
            follow: true,
            notices: false,
            show_tsc: false,
            show_location: false,
            levels: LevelFilter::all(),
            archives: false,
            holdback: Duration::from_millis(100),
            unknown_id_patience: 50,
        }
    }
}

impl TailOptions {
    /// Dump what is present and stop
    pub fn cat() -> Self {
        Self {
            follow: false,
            ..Self::default()
        }
    }

    pub fn with_notices(mut self, notices: bool) -> Self {
        self.notices = notices;
        self
    }

    pub fn with_tsc(mut self, show: bool) -> Self {
        self.show_tsc = show;
        self
    }

    pub fn with_location(mut self, show: bool) -> Self {
        self.show_location = show;
        self
    }

    pub fn with_levels(mut self, levels: LevelFilter) -> Self {
        self.levels = levels;
        self
    }

    pub fn with_archives(mut self, archives: bool) -> Self {
        self.archives = archives;
        self
    }

    pub fn with_holdback(mut self, holdback: Duration) -> Self {
        self.holdback = holdback;
        self
    }
}

/// Resolve a file argument, falling back to `QUICKTRACEDIR` for relative
/// paths that do not exist in the working directory
pub fn resolve_input(path: &Path) -> PathBuf {
    if path.exists() || path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::var_os(QUICKTRACEDIR_ENV) {
        Some(dir) => {
            let candidate = Path::new(&dir).join(path);
            if candidate.exists() {
                candidate
            } else {
                path.to_path_buf()
            }
        }
        None => path.to_path_buf(),
    }
}

/// File arguments in reading order, with archives ahead of their live file
/// when `archives` is set
pub fn expand_paths(files: &[PathBuf], archives: bool) -> Vec<PathBuf> {
    let mut paths = Vec::with_capacity(files.len());
    for file in files {
        let file = resolve_input(file);
        if archives {
            for (index, archive) in existing_archives(&file) {
                match TraceFile::open(&archive, Access::ReadOnly) {
                    Ok(f) if f.header().is_archive() => paths.push(archive),
                    Ok(_) => tracing::debug!(path = %archive.display(), index, "not a forever-log archive"),
                    Err(e) => tracing::debug!(path = %archive.display(), error = %e, "skipping archive"),
                }
            }
        }
        paths.push(file);
    }
    paths
}

/// Where a tailed path stands
enum Tracking {
    Live(Box<TraceSource>),
    /// Replaced on disk; the new file could not be opened yet
    Waiting,
    Gone,
}

struct Tracked {
    path: PathBuf,
    name: String,
    origin: ClockOrigin,
    state: Tracking,
}

/// Decodes one or more trace files
pub struct Tailer {
    options: TailOptions,
    formatters: Formatters,
    tracked: Vec<Tracked>,
    printer: LinePrinter,
    pending: BinaryHeap<Reverse<Entry>>,
    corruptions: usize,
}

impl Tailer {
    /// Open every path; any path that cannot be opened is an error
    pub fn open(paths: &[PathBuf], options: TailOptions, formatters: Formatters) -> Result<Self> {
        let mut tracked = Vec::with_capacity(paths.len());
        for path in paths {
            let source = TraceSource::open(path)?;
            tracked.push(Tracked {
                path: path.clone(),
                name: source.name().to_string(),
                origin: *source.origin(),
                state: Tracking::Live(Box::new(source)),
            });
        }
        let columns = Columns {
            tsc: options.show_tsc,
            file_name: tracked.len() > 1,
            location: options.show_location,
        };
        Ok(Self {
            options,
            formatters,
            tracked,
            printer: LinePrinter::new(columns),
            pending: BinaryHeap::new(),
            corruptions: 0,
        })
    }

    pub fn options(&self) -> &TailOptions {
        &self.options
    }

    /// Corrupt records reported so far
    pub fn corruptions(&self) -> usize {
        self.corruptions
    }

    /// Print every record currently present, oldest first
    ///
    /// Returns the number of corrupt records reported on `err`.
    pub fn cat<W: Write, E: Write>(&mut self, out: &mut W, err: &mut E) -> Result<usize> {
        let mut entries = Vec::new();
        for idx in 0..self.tracked.len() {
            self.collect(idx, true, &mut entries, err)?;
        }
        entries.sort();
        for entry in &entries {
            self.print(entry, out)?;
        }
        out.flush().map_err(output_closed)?;
        Ok(self.corruptions)
    }

    /// Drain and decode the selected levels of one tracked file
    ///
    /// `final_pass` skips unpublished records and gives up on unknown ids
    /// at once; it is used by cat mode and for files that went away.
    fn collect<E: Write>(
        &mut self,
        idx: usize,
        final_pass: bool,
        entries: &mut Vec<Entry>,
        err: &mut E,
    ) -> Result<()> {
        let patience = if final_pass {
            0
        } else {
            self.options.unknown_id_patience
        };
        let levels: Vec<usize> = self.options.levels.levels().collect();
        let tracked = &mut self.tracked[idx];
        let Tracking::Live(source) = &mut tracked.state else {
            return Ok(());
        };

        let mut problems = Vec::new();
        let mut reports = Vec::new();
        for level in levels {
            source.drain(level, !final_pass, &mut problems)?;
            decode_level(
                idx,
                source,
                level,
                patience,
                &self.formatters,
                entries,
                &mut reports,
            );
            if final_pass {
                entries.extend(source.held_mut(level).take());
            }
        }

        for problem in problems {
            match problem {
                Problem::Corruption {
                    level,
                    msg_id,
                    reason,
                } => {
                    let desc = msg_id.and_then(|id| source.descriptor(id));
                    reports.push(CorruptionReport {
                        file: tracked.name.clone(),
                        level,
                        msg_id,
                        message: desc.as_ref().map(|d| d.text.clone()),
                        format: desc.as_ref().map(|d| d.format.to_string()),
                        reason,
                    });
                }
                Problem::Overrun { level, from, to } => {
                    writeln!(
                        err,
                        "--- overrun in {} level {}: {} bytes lost",
                        tracked.name,
                        level,
                        to.saturating_sub(from)
                    )
                    .map_err(output_closed)?;
                }
            }
        }
        for report in &reports {
            report.write_to(err).map_err(output_closed)?;
        }
        self.corruptions += reports.len();
        Ok(())
    }

    fn print<W: Write>(&mut self, entry: &Entry, out: &mut W) -> Result<()> {
        let tracked = &self.tracked[entry.source];
        self.printer
            .write_line(out, entry, &tracked.origin, &tracked.name)
            .map_err(output_closed)
    }

    fn notice<E: Write>(&self, err: &mut E, what: &str, path: &Path) -> Result<()> {
        if self.options.notices {
            writeln!(err, "--- {} {}", what, path.display()).map_err(output_closed)?;
        }
        Ok(())
    }
}

/// Decode the front of `level`'s backlog into `entries`
///
/// A record whose id is not in the catalog yet stays queued for up to
/// `patience` calls, then is reported as corrupt. Continuation records are
/// joined onto the entry before them when it came from the same call site;
/// that entry may have been decoded on an earlier call, so the newest entry
/// of the level stays held in `source` rather than going into `entries`.
fn decode_level(
    idx: usize,
    source: &mut TraceSource,
    level: usize,
    patience: u32,
    formatters: &Formatters,
    entries: &mut Vec<Entry>,
    reports: &mut Vec<CorruptionReport>,
) {
    let mut held = source.held_mut(level).take();
    loop {
        let Some(msg_id) = source.backlog_mut(level).front().map(|r| r.msg_id) else {
            break;
        };
        let desc = match source.descriptor(msg_id) {
            Some(desc) => desc,
            None => {
                let polls = source.unknown_polls_mut(level);
                if *polls < patience {
                    *polls += 1;
                    break;
                }
                *polls = 0;
                if let Some(raw) = source.backlog_mut(level).pop_front() {
                    reports.push(CorruptionReport {
                        file: source.name().to_string(),
                        level: raw.level,
                        msg_id: Some(raw.msg_id),
                        message: None,
                        format: None,
                        reason: QtError::UnknownMessage { id: raw.msg_id }.to_string(),
                    });
                }
                continue;
            }
        };
        *source.unknown_polls_mut(level) = 0;
        let Some(raw) = source.backlog_mut(level).pop_front() else {
            break;
        };

        let values = match desc.format.decode(raw.null_mask, &raw.payload) {
            Ok(values) => values,
            Err(reason) => {
                reports.push(CorruptionReport {
                    file: source.name().to_string(),
                    level: raw.level,
                    msg_id: Some(raw.msg_id),
                    message: Some(desc.text.clone()),
                    format: Some(desc.format.to_string()),
                    reason,
                });
                continue;
            }
        };

        if desc.is_continuation() {
            let chunk = match values.last() {
                Some(Value::Str(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            };
            if let Some(prev) = held
                .as_mut()
                .filter(|prev| prev.file == desc.file && prev.line == desc.line)
            {
                prev.message.push_str(&chunk);
                continue;
            }
        }

        let entry = Entry {
            tsc: raw.tsc,
            source: idx,
            level: raw.level,
            pos: raw.pos,
            file: desc.file.clone(),
            line: desc.line,
            message: render_message(&desc, &values, formatters),
        };
        entries.extend(held.replace(entry));
    }
    *source.held_mut(level) = held;
}

fn output_closed(e: std::io::Error) -> QtError {
    QtError::OutputClosed {
        reason: e.to_string(),
    }
}
