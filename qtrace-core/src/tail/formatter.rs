//! Formatter plugins
//!
//! An argument registered as `code@name` is rendered by the plugin called
//! `name`. Plugins are JSON descriptors in the directory named by
//! `QT_FORMATTER_DIR`, one per `*.json` file:
//!
//! ```json
//! { "name": "errno", "kind": "enum", "values": { "2": "ENOENT", "13": "EACCES" } }
//! { "name": "perms", "kind": "flags", "bits": { "0": "read", "1": "write" } }
//! { "name": "addr",  "kind": "ipv4" }
//! { "name": "mask",  "kind": "hex", "width": 8 }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{QtError, Result};
use crate::format::Value;

/// Environment variable naming the plugin directory
pub const QT_FORMATTER_DIR_ENV: &str = "QT_FORMATTER_DIR";

/// How a plugin renders a value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FormatterKind {
    /// `0x`-prefixed hexadecimal, optionally zero padded to `width` digits
    Hex {
        #[serde(default)]
        width: Option<usize>,
    },
    /// Dotted quad of a 32-bit value, most significant byte first
    Ipv4,
    /// Lookup table keyed by the decimal value; unmatched values print as
    /// `default` or the number
    Enum {
        values: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<String>,
    },
    /// Names of the set bits (keyed by bit index), joined by `separator`
    Flags {
        bits: BTreeMap<String, String>,
        #[serde(default = "default_separator")]
        separator: String,
    },
}

fn default_separator() -> String {
    "|".to_string()
}

/// One plugin descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatterPlugin {
    pub name: String,
    #[serde(flatten)]
    pub kind: FormatterKind,
}

impl FormatterPlugin {
    /// Render `value`; `None` when the plugin does not apply to it
    pub fn render(&self, value: &Value) -> Option<String> {
        let n = value.as_u64()?;
        Some(match &self.kind {
            FormatterKind::Hex { width: Some(w) } => format!("0x{:0width$x}", n, width = *w),
            FormatterKind::Hex { width: None } => format!("0x{:x}", n),
            FormatterKind::Ipv4 => {
                let ip = n as u32;
                format!(
                    "{}.{}.{}.{}",
                    ip >> 24,
                    (ip >> 16) & 0xff,
                    (ip >> 8) & 0xff,
                    ip & 0xff
                )
            }
            FormatterKind::Enum { values, default } => match values.get(&n.to_string()) {
                Some(name) => name.clone(),
                None => default.clone().unwrap_or_else(|| n.to_string()),
            },
            FormatterKind::Flags { bits, separator } => {
                let mut names = Vec::new();
                let mut unknown = n;
                let mut named: Vec<(u32, &String)> = bits
                    .iter()
                    .filter_map(|(bit, name)| Some((bit.parse::<u32>().ok()?, name)))
                    .filter(|(bit, _)| *bit < 64)
                    .collect();
                named.sort_by_key(|(bit, _)| *bit);
                for (bit, name) in named {
                    if n & (1 << bit) != 0 {
                        names.push(name.clone());
                        unknown &= !(1 << bit);
                    }
                }
                if unknown != 0 {
                    names.push(format!("0x{:x}", unknown));
                }
                if names.is_empty() {
                    "0".to_string()
                } else {
                    names.join(separator)
                }
            }
        })
    }
}

/// Plugins by name
#[derive(Debug, Clone, Default)]
pub struct Formatters {
    plugins: HashMap<String, FormatterPlugin>,
}

impl Formatters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the directory named by `QT_FORMATTER_DIR`, if set
    ///
    /// Unreadable descriptors are logged and skipped.
    pub fn from_env() -> Self {
        let mut formatters = Self::new();
        if let Some(dir) = std::env::var_os(QT_FORMATTER_DIR_ENV) {
            if let Err(e) = formatters.load_dir(Path::new(&dir)) {
                tracing::warn!(error = %e, "formatter plugins unavailable");
            }
        }
        formatters
    }

    /// Load every `*.json` descriptor in `dir`; returns how many loaded
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize> {
        let entries = fs::read_dir(dir).map_err(|e| QtError::FormatterPlugin {
            path: dir.display().to_string(),
            reason: e.to_string(),
        })?;

        let mut loaded = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match self.load_file(&path) {
                Ok(_) => loaded += 1,
                Err(e) => tracing::warn!(error = %e, "skipping formatter plugin"),
            }
        }
        Ok(loaded)
    }

    /// Load one descriptor file; returns the plugin name
    pub fn load_file(&mut self, path: &Path) -> Result<String> {
        let content = fs::read_to_string(path).map_err(|e| QtError::FormatterPlugin {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let plugin: FormatterPlugin =
            serde_json::from_str(&content).map_err(|e| QtError::FormatterPlugin {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        let name = plugin.name.clone();
        tracing::debug!(name = %name, path = %path.display(), "loaded formatter plugin");
        self.insert(plugin);
        Ok(name)
    }

    pub fn insert(&mut self, plugin: FormatterPlugin) {
        self.plugins.insert(plugin.name.clone(), plugin);
    }

    pub fn get(&self, name: &str) -> Option<&FormatterPlugin> {
        self.plugins.get(name)
    }

    /// Render `value` with plugin `name`, if it exists and applies
    pub fn render(&self, name: &str, value: &Value) -> Option<String> {
        self.get(name)?.render(value)
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}
