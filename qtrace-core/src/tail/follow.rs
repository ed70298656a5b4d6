//! Follow mode
//!
//! Each poll drains every live file into a heap ordered by `(tsc, file)`.
//! Entries are printed once they are older than the holdback horizon, so a
//! record committed slightly late by a slower writer still comes out in
//! timestamp order. A file whose path disappears is drained one last time;
//! a path that now names a different file is drained and then reopened.

use std::cmp::Reverse;
use std::io::Write;

use super::{output_closed, Tailer, Tracked, Tracking, TraceSource};
use crate::clock;
use crate::error::Result;
use crate::tail::source::PathState;

/// Outcome of one follow poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowState {
    /// At least one file may still produce records
    Running,
    /// Every file was deleted and everything was printed
    Finished,
}

impl Tailer {
    /// Drain all files once and print what is ready
    pub fn poll_once<W: Write, E: Write>(&mut self, out: &mut W, err: &mut E) -> Result<FollowState> {
        let mut entries = Vec::new();
        for idx in 0..self.tracked.len() {
            self.poll_tracked(idx, &mut entries, err)?;
        }

        let all_gone = self
            .tracked
            .iter()
            .all(|t| matches!(t.state, Tracking::Gone));
        let horizon = if all_gone {
            u64::MAX
        } else {
            clock::tsc().saturating_sub(self.options.holdback.as_nanos() as u64)
        };
        self.release_held(horizon, &mut entries);
        self.pending.extend(entries.into_iter().map(Reverse));

        while let Some(Reverse(entry)) = self.pending.peek() {
            if entry.tsc > horizon {
                break;
            }
            if let Some(Reverse(entry)) = self.pending.pop() {
                self.print(&entry, out)?;
            }
        }
        out.flush().map_err(output_closed)?;
        err.flush().map_err(output_closed)?;

        if all_gone && self.pending.is_empty() {
            Ok(FollowState::Finished)
        } else {
            Ok(FollowState::Running)
        }
    }

    /// Print everything still held back, regardless of the horizon
    pub fn flush_pending<W: Write>(&mut self, out: &mut W) -> Result<()> {
        let mut entries = Vec::new();
        self.release_held(u64::MAX, &mut entries);
        self.pending.extend(entries.into_iter().map(Reverse));
        while let Some(Reverse(entry)) = self.pending.pop() {
            self.print(&entry, out)?;
        }
        out.flush().map_err(output_closed)
    }

    fn release_held(&mut self, horizon: u64, entries: &mut Vec<super::Entry>) {
        for tracked in &mut self.tracked {
            if let Tracking::Live(source) = &mut tracked.state {
                source.release_held(horizon, entries);
            }
        }
    }

    fn poll_tracked<E: Write>(
        &mut self,
        idx: usize,
        entries: &mut Vec<super::Entry>,
        err: &mut E,
    ) -> Result<()> {
        let path_state = match &self.tracked[idx].state {
            Tracking::Gone => return Ok(()),
            Tracking::Waiting => {
                self.reopen(idx, err, "opened")?;
                return Ok(());
            }
            Tracking::Live(source) => source.path_state(),
        };

        match path_state {
            PathState::Unchanged => self.collect(idx, false, entries, err),
            PathState::Deleted => {
                self.collect(idx, true, entries, err)?;
                let path = self.tracked[idx].path.clone();
                tracing::debug!(path = %path.display(), "trace file deleted");
                self.tracked[idx].state = Tracking::Gone;
                self.notice(err, "deleted", &path)
            }
            PathState::Replaced => {
                self.collect(idx, true, entries, err)?;
                self.tracked[idx].state = Tracking::Waiting;
                self.reopen(idx, err, "re-opened")
            }
        }
    }

    fn reopen<E: Write>(&mut self, idx: usize, err: &mut E, what: &str) -> Result<()> {
        let path = self.tracked[idx].path.clone();
        match TraceSource::open(&path) {
            Ok(source) => {
                let tracked: &mut Tracked = &mut self.tracked[idx];
                tracked.origin = *source.origin();
                tracked.state = Tracking::Live(Box::new(source));
                tracing::debug!(path = %path.display(), "trace file reopened");
                self.notice(err, what, &path)
            }
            Err(e) => {
                if !path.exists() {
                    self.tracked[idx].state = Tracking::Gone;
                    return self.notice(err, "deleted", &path);
                }
                tracing::debug!(path = %path.display(), error = %e, "replacement not readable yet");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use super::*;
    use crate::catalog::CallSite;
    use crate::config::{SizeSpec, TraceConfig};
    use crate::tail::{Formatters, TailOptions};
    use crate::trace::{var, Tracer};

    fn follower(paths: &[PathBuf]) -> Tailer {
        let options = TailOptions::default()
            .with_holdback(Duration::ZERO)
            .with_notices(true);
        Tailer::open(paths, options, Formatters::new()).unwrap()
    }

    #[test]
    fn test_follow_picks_up_new_records() {
        let dir = tempfile::tempdir().unwrap();
        let config = TraceConfig::new(dir.path().join("f.qt")).with_sizes(SizeSpec::uniform(2));
        let t = Tracer::try_initialize(&config).unwrap();
        let path = t.file().unwrap().path().to_path_buf();
        let mut tailer = follower(&[path.clone()]);

        let mut out = Vec::new();
        let mut err = Vec::new();
        assert_eq!(tailer.poll_once(&mut out, &mut err).unwrap(), FollowState::Running);
        assert!(out.is_empty());

        for i in 0..5i32 {
            t.trace(4, CallSite::new("f.rs", 1), &["n".into(), var(i)]).unwrap();
        }
        tailer.poll_once(&mut out, &mut err).unwrap();
        let text = String::from_utf8(out.clone()).unwrap();
        assert_eq!(text.lines().count(), 5, "{}", text);
        assert!(text.lines().last().unwrap().ends_with("\"n 4\""));

        out.clear();
        tailer.poll_once(&mut out, &mut err).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_follow_finishes_when_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let config = TraceConfig::new(dir.path().join("d.qt")).with_sizes(SizeSpec::uniform(2));
        let mut t = Tracer::try_initialize(&config).unwrap();
        let path = t.file().unwrap().path().to_path_buf();
        let mut tailer = follower(&[path.clone()]);

        t.trace(0, CallSite::new("d.rs", 1), &["last words".into()]).unwrap();
        t.close();
        std::fs::remove_file(&path).unwrap();

        let mut out = Vec::new();
        let mut err = Vec::new();
        assert_eq!(tailer.poll_once(&mut out, &mut err).unwrap(), FollowState::Finished);
        assert!(String::from_utf8(out).unwrap().contains("\"last words\""));
        assert!(String::from_utf8(err).unwrap().contains("--- deleted"));
    }

    #[test]
    fn test_follow_reopens_replaced_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.qt");
        let config = TraceConfig::new(&path)
            .with_sizes(SizeSpec::uniform(2))
            .with_rotate_existing(false);
        let mut first = Tracer::try_initialize(&config).unwrap();
        let mut tailer = follower(&[path.clone()]);
        first.trace(0, CallSite::new("r.rs", 1), &["old".into()]).unwrap();
        first.close();

        std::fs::remove_file(&path).unwrap();
        let second = Tracer::try_initialize(&config).unwrap();
        second.trace(0, CallSite::new("r.rs", 2), &["new".into()]).unwrap();

        let mut out = Vec::new();
        let mut err = Vec::new();
        tailer.poll_once(&mut out, &mut err).unwrap();
        tailer.poll_once(&mut out, &mut err).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("\"old\""));
        assert!(text.contains("\"new\""));
        assert!(String::from_utf8(err).unwrap().contains("--- re-opened"));
    }

    #[test]
    fn test_follow_joins_continuation_read_on_later_poll() {
        let dir = tempfile::tempdir().unwrap();
        let config = TraceConfig::new(dir.path().join("j.qt")).with_sizes(SizeSpec::uniform(2));
        let t = Tracer::try_initialize(&config).unwrap();
        let path = t.file().unwrap().path().to_path_buf();
        let options = TailOptions::default().with_holdback(Duration::from_secs(60));
        let mut tailer = Tailer::open(&[path], options, Formatters::new()).unwrap();
        let site = CallSite::new("j.rs", 5);

        let mut out = Vec::new();
        let mut err = Vec::new();
        t.trace(3, site.clone(), &["body".into(), var("abcdefgh")]).unwrap();
        tailer.poll_once(&mut out, &mut err).unwrap();
        assert!(out.is_empty());

        t.trace(3, site.continuation(), &["...".into(), var("ijkl")]).unwrap();
        t.trace(3, CallSite::new("j.rs", 6), &["next".into()]).unwrap();
        tailer.poll_once(&mut out, &mut err).unwrap();
        tailer.flush_pending(&mut out).unwrap();

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2, "{}", text);
        assert!(lines[0].ends_with("\"body abcdefghijkl\""), "{}", text);
        assert!(lines[1].ends_with("\"next\""));
    }
}
