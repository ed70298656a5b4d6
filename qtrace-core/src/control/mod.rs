//! Controller: enable, disable and inspect messages of a live trace file
//!
//! The enabled bit and append counter of a message live in the control
//! table in the file header, indexed by `id % num_msg_counters`. Writers
//! read the bit on every append, so a change applies to the next call in
//! every process that has the file mapped.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::Ordering;

use regex::Regex;

use crate::catalog::{CatalogReader, Descriptor};
use crate::error::{QtError, Result};
use crate::trace::{Access, TraceFile};

/// Which messages an operation applies to
#[derive(Debug, Clone)]
pub enum Selector {
    /// One message id
    Id(u32),
    /// Messages whose text or source file matches
    Pattern(Regex),
    All,
}

impl Selector {
    /// Build a selector from exactly one of an id or a regular expression
    pub fn parse(id: Option<u32>, pattern: Option<&str>) -> Result<Self> {
        match (id, pattern) {
            (Some(id), None) => Ok(Selector::Id(id)),
            (None, Some(pattern)) => Ok(Selector::Pattern(Regex::new(pattern)?)),
            (Some(_), Some(_)) => Err(QtError::InvalidSelector {
                reason: "give either a message id or a regular expression, not both".to_string(),
            }),
            (None, None) => Err(QtError::InvalidSelector {
                reason: "a message id or a regular expression is required".to_string(),
            }),
        }
    }

    pub fn matches(&self, desc: &Descriptor) -> bool {
        match self {
            Selector::Id(id) => desc.id == *id,
            Selector::Pattern(re) => re.is_match(&desc.text) || re.is_match(&desc.file),
            Selector::All => true,
        }
    }
}

/// One message as the controller sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlEntry {
    pub id: u32,
    pub enabled: bool,
    pub count: u64,
    pub file: String,
    pub line: u32,
    pub text: String,
    pub format: String,
}

impl ControlEntry {
    /// `<id> <on |off> <file>:<line> <text> <formats>`, optionally with the
    /// append counter
    pub fn show_line(&self, counts: bool) -> String {
        let mut line = format!(
            "{} {} {}:{} {} {}",
            self.id,
            if self.enabled { "on " } else { "off" },
            self.file,
            self.line,
            self.text,
            self.format
        );
        if counts {
            line.push_str(&format!(" {}", self.count));
        }
        line
    }
}

/// Opens a trace file for control operations
pub struct Controller {
    file: TraceFile,
    catalog: CatalogReader,
}

impl Controller {
    pub fn open(path: &Path) -> Result<Self> {
        let file = TraceFile::open(path, Access::ReadWrite)?;
        let mut catalog = CatalogReader::new(file.header().catalog_offset);
        catalog.refresh(file.catalog_file())?;
        tracing::debug!(path = %path.display(), messages = catalog.len(), "controller attached");
        Ok(Self { file, catalog })
    }

    pub fn file(&self) -> &TraceFile {
        &self.file
    }

    /// All registered messages, in registration order
    pub fn entries(&mut self) -> Result<Vec<ControlEntry>> {
        self.catalog.refresh(self.file.catalog_file())?;
        self.catalog
            .descriptors()
            .map(|desc| self.entry(desc))
            .collect()
    }

    fn entry(&self, desc: &Descriptor) -> Result<ControlEntry> {
        Ok(ControlEntry {
            id: desc.id,
            enabled: self.file.is_enabled(desc.id),
            count: self.file.counter(desc.id)?.load(Ordering::Relaxed),
            file: desc.file.clone(),
            line: desc.line,
            text: desc.text.clone(),
            format: desc.format.to_string(),
        })
    }

    /// Turn the selected messages on or off; returns those whose state
    /// changed
    ///
    /// Continuation records of a selected call site follow it. Turning a
    /// message off twice is not an error.
    pub fn set_enabled(&mut self, selector: &Selector, enabled: bool) -> Result<Vec<ControlEntry>> {
        self.catalog.refresh(self.file.catalog_file())?;
        let selected = self.selected_ids(selector);
        if let Selector::Id(id) = selector {
            if selected.is_empty() {
                return Err(QtError::UnknownMessage { id: *id });
            }
        }

        let mut changed = Vec::new();
        for id in selected {
            let was_enabled = self.file.set_enabled(id, enabled)?;
            if was_enabled != enabled {
                if let Some(desc) = self.catalog.get(id) {
                    changed.push(self.entry(desc)?);
                }
            }
        }
        tracing::debug!(enabled, changed = changed.len(), "control bits updated");
        Ok(changed)
    }

    fn selected_ids(&self, selector: &Selector) -> BTreeSet<u32> {
        let picked: Vec<&Descriptor> = self
            .catalog
            .descriptors()
            .map(|d| d.as_ref())
            .filter(|d| selector.matches(d))
            .collect();
        let mut ids: BTreeSet<u32> = picked.iter().map(|d| d.id).collect();
        for desc in self.catalog.descriptors() {
            if desc.is_continuation()
                && picked
                    .iter()
                    .any(|p| !p.is_continuation() && p.file == desc.file && p.line == desc.line)
            {
                ids.insert(desc.id);
            }
        }
        ids
    }

    /// Other registered ids whose control entry is shared with `id`
    pub fn shared_with(&self, id: u32) -> Vec<u32> {
        let slots = self.file.header().num_msg_counters.max(1);
        self.catalog
            .descriptors()
            .map(|d| d.id)
            .filter(|other| *other != id && other % slots == id % slots)
            .collect()
    }

    /// Zero every append counter
    pub fn clear_counters(&self) -> Result<()> {
        self.file.clear_counters()
    }
}
