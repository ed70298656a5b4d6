//! Producer configuration
//!
//! A [`TraceConfig`] carries everything needed to create a trace file:
//! the output path (with an optional `%d` process-id template), the
//! per-level [`SizeSpec`], the string cap, the number of message control
//! entries and the optional forever log.
//!
//! ```rust
//! use qtrace_core::config::{SizeSpec, TraceConfig};
//!
//! let config = TraceConfig::new("/tmp/agent-%d.qt")
//!     .with_sizes("1,1,1,1,1,1,1,1,1,1".parse::<SizeSpec>().unwrap())
//!     .with_max_string_len(40);
//! assert_eq!(config.sizes.level_kb(9), 1);
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{QtError, Result};
use crate::format::NUM_LEVELS;

/// Default size of every level, in KB
pub const DEFAULT_LEVEL_KB: u32 = 8;

/// Largest size a single level may have, in KB
pub const MAX_LEVEL_KB: u32 = 16 * 1024;

/// Largest total size of all levels, in KB
pub const MAX_TOTAL_KB: u32 = 32 * 1024;

/// Default cap on traced string length
pub const DEFAULT_MAX_STRING_LEN: usize = 24;

/// Absolute ceiling on traced string length
pub const MAX_STRING_LEN_CEILING: usize = 80;

/// Smallest accepted string cap
pub const MIN_STRING_LEN: usize = 4;

/// Default number of message control entries
pub const DEFAULT_NUM_MSG_COUNTERS: u32 = 512;

/// Environment variable naming the default trace file
pub const QTFILE_ENV: &str = "QTFILE";

/// Environment variable naming the default trace directory
pub const QUICKTRACEDIR_ENV: &str = "QUICKTRACEDIR";

/// Directory used when `QUICKTRACEDIR` is unset
pub const DEFAULT_TRACE_DIR: &str = ".qt";

/// Per-level ring buffer sizes in KB
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeSpec {
    kb: [u32; NUM_LEVELS],
}

impl Default for SizeSpec {
    fn default() -> Self {
        Self {
            kb: [DEFAULT_LEVEL_KB; NUM_LEVELS],
        }
    }
}

impl SizeSpec {
    /// Build a spec from explicit sizes, applying the size limits
    pub fn new(kb: [u32; NUM_LEVELS]) -> Self {
        Self {
            kb: Self::normalize(kb),
        }
    }

    /// Every level the same size
    pub fn uniform(kb: u32) -> Self {
        Self::new([kb; NUM_LEVELS])
    }

    /// Parse up to ten KB sizes separated by commas and/or spaces
    ///
    /// Missing trailing levels keep the default size.
    pub fn parse(spec: &str) -> Result<Self> {
        let mut kb = [DEFAULT_LEVEL_KB; NUM_LEVELS];
        let tokens: Vec<&str> = spec
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|t| !t.is_empty())
            .collect();

        if tokens.len() > NUM_LEVELS {
            return Err(QtError::InvalidSizeSpec {
                spec: spec.to_string(),
                reason: format!("{} sizes given, at most {} allowed", tokens.len(), NUM_LEVELS),
            });
        }

        for (slot, token) in kb.iter_mut().zip(&tokens) {
            *slot = token.parse::<u32>().map_err(|e| QtError::InvalidSizeSpec {
                spec: spec.to_string(),
                reason: format!("'{}': {}", token, e),
            })?;
        }

        Ok(Self::new(kb))
    }

    /// Size of one level in KB
    pub fn level_kb(&self, level: usize) -> u32 {
        self.kb[level]
    }

    /// All level sizes in KB
    pub fn as_array(&self) -> [u32; NUM_LEVELS] {
        self.kb
    }

    /// Total size of all levels in KB
    pub fn total_kb(&self) -> u32 {
        self.kb.iter().sum()
    }

    fn normalize(mut kb: [u32; NUM_LEVELS]) -> [u32; NUM_LEVELS] {
        for size in kb.iter_mut() {
            *size = (*size).clamp(1, MAX_LEVEL_KB);
        }

        let total: u64 = kb.iter().map(|&k| k as u64).sum();
        if total > MAX_TOTAL_KB as u64 {
            // Zero-size levels are not supported, so the scaled total may
            // land a few KB above the cap.
            for size in kb.iter_mut() {
                let scaled = (*size as u64 * MAX_TOTAL_KB as u64) / total;
                *size = scaled.max(1) as u32;
            }
        }
        kb
    }
}

impl FromStr for SizeSpec {
    type Err = QtError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Forever-log settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeverConfig {
    /// Base path; archives are written to `<path>.<index>`
    pub path: PathBuf,
    /// First archive index. `None` resumes after the highest existing archive.
    pub start_index: Option<u32>,
}

impl ForeverConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            start_index: None,
        }
    }

    pub fn with_start_index(mut self, index: u32) -> Self {
        self.start_index = Some(index);
        self
    }
}

/// Configuration for creating a trace file
#[derive(Debug, Clone)]
pub struct TraceConfig {
    /// Output path; `%d` is replaced by the process id
    pub path: PathBuf,

    /// Per-level sizes
    pub sizes: SizeSpec,

    /// Requested cap on traced string length
    pub max_string_len: usize,

    /// Number of message control entries (enabled bit + counter)
    pub num_msg_counters: u32,

    /// Optional forever log
    pub forever: Option<ForeverConfig>,

    /// Producer runs several threads; forces `QUICKTRACEDIR` resolution
    pub multithreaded: bool,

    /// Move an existing file to `.1` (and `.1` to `.2`) before creating
    pub rotate_existing: bool,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("qtrace.qt"),
            sizes: SizeSpec::default(),
            max_string_len: DEFAULT_MAX_STRING_LEN,
            num_msg_counters: DEFAULT_NUM_MSG_COUNTERS,
            forever: None,
            multithreaded: false,
            rotate_existing: true,
        }
    }
}

impl TraceConfig {
    /// Create a config for the given path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Create a config whose path comes from `QTFILE`, if set
    pub fn from_env() -> Self {
        match std::env::var_os(QTFILE_ENV) {
            Some(path) if !path.is_empty() => Self::new(PathBuf::from(path)),
            _ => Self::default(),
        }
    }

    pub fn with_sizes(mut self, sizes: SizeSpec) -> Self {
        self.sizes = sizes;
        self
    }

    pub fn with_max_string_len(mut self, len: usize) -> Self {
        self.max_string_len = len;
        self
    }

    pub fn with_num_msg_counters(mut self, n: u32) -> Self {
        self.num_msg_counters = n.max(1);
        self
    }

    pub fn with_forever(mut self, forever: ForeverConfig) -> Self {
        self.forever = Some(forever);
        self
    }

    pub fn with_multithreaded(mut self, multithreaded: bool) -> Self {
        self.multithreaded = multithreaded;
        self
    }

    pub fn with_rotate_existing(mut self, rotate: bool) -> Self {
        self.rotate_existing = rotate;
        self
    }

    /// String cap actually used, clamped to `[MIN_STRING_LEN, 80]`
    pub fn effective_max_string_len(&self) -> usize {
        self.max_string_len
            .clamp(MIN_STRING_LEN, MAX_STRING_LEN_CEILING)
    }

    /// Resolve the output path for the current process
    pub fn resolve_path(&self) -> Result<PathBuf> {
        let trace_dir = std::env::var_os(QUICKTRACEDIR_ENV).map(PathBuf::from);
        resolve_trace_path(
            &self.path,
            std::process::id(),
            self.multithreaded,
            trace_dir.as_deref(),
        )
    }
}

/// Resolve a configured trace path
///
/// `%d` is replaced with `pid`. Paths beginning with `/`, `./` or `../`
/// are kept as given unless `multithreaded` is set; everything else is
/// placed under `trace_dir`, or under `.qt` (created on demand).
pub fn resolve_trace_path(
    raw: &Path,
    pid: u32,
    multithreaded: bool,
    trace_dir: Option<&Path>,
) -> Result<PathBuf> {
    let text = raw.to_string_lossy();
    if text.is_empty() {
        return Err(QtError::InvalidPath {
            path: String::new(),
            reason: "empty path".to_string(),
        });
    }
    let expanded = text.replace("%d", &pid.to_string());

    let anchored = expanded.starts_with('/')
        || expanded.starts_with("./")
        || expanded.starts_with("../");
    if anchored && !multithreaded {
        return Ok(PathBuf::from(expanded));
    }

    let dir = match trace_dir {
        Some(dir) => dir.to_path_buf(),
        None => {
            let dir = PathBuf::from(DEFAULT_TRACE_DIR);
            if !dir.exists() {
                std::fs::create_dir_all(&dir).map_err(|e| QtError::InvalidPath {
                    path: expanded.clone(),
                    reason: format!("cannot create {}: {}", DEFAULT_TRACE_DIR, e),
                })?;
            }
            dir
        }
    };

    let name = Path::new(&expanded);
    match name.file_name() {
        Some(file) if anchored => Ok(dir.join(file)),
        Some(_) => Ok(dir.join(name)),
        None => Err(QtError::InvalidPath {
            path: expanded.clone(),
            reason: "path has no file name".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_spec_parse() {
        let spec = SizeSpec::parse("1,2, 3 4").unwrap();
        assert_eq!(spec.as_array(), [1, 2, 3, 4, 8, 8, 8, 8, 8, 8]);

        let ones: SizeSpec = "1,1,1,1,1,1,1,1,1,1".parse().unwrap();
        assert_eq!(ones, SizeSpec::uniform(1));
    }

    #[test]
    fn test_size_spec_zero_becomes_one() {
        let spec = SizeSpec::parse("0,0").unwrap();
        assert_eq!(spec.level_kb(0), 1);
        assert_eq!(spec.level_kb(1), 1);
    }

    #[test]
    fn test_size_spec_limits() {
        let spec = SizeSpec::uniform(20_000);
        assert!(spec.as_array().iter().all(|&k| k <= MAX_LEVEL_KB));
        assert!(spec.total_kb() <= MAX_TOTAL_KB + NUM_LEVELS as u32);
    }

    #[test]
    fn test_size_spec_rejects_garbage() {
        assert!(SizeSpec::parse("1,x").is_err());
        assert!(SizeSpec::parse("1,1,1,1,1,1,1,1,1,1,1").is_err());
        assert!(SizeSpec::parse("").is_ok());
    }

    #[test]
    fn test_max_string_len_clamp() {
        assert_eq!(TraceConfig::default().effective_max_string_len(), 24);
        assert_eq!(
            TraceConfig::default().with_max_string_len(200).effective_max_string_len(),
            80
        );
        assert_eq!(
            TraceConfig::default().with_max_string_len(0).effective_max_string_len(),
            MIN_STRING_LEN
        );
    }

    #[test]
    fn test_resolve_absolute_with_pid() {
        let path = resolve_trace_path(Path::new("/tmp/agent-%d.qt"), 42, false, None).unwrap();
        assert_eq!(path, PathBuf::from("/tmp/agent-42.qt"));
    }

    #[test]
    fn test_resolve_relative_uses_trace_dir() {
        let dir = Path::new("/var/qt");
        let path = resolve_trace_path(Path::new("agent.qt"), 1, false, Some(dir)).unwrap();
        assert_eq!(path, PathBuf::from("/var/qt/agent.qt"));

        let kept = resolve_trace_path(Path::new("./agent.qt"), 1, false, Some(dir)).unwrap();
        assert_eq!(kept, PathBuf::from("./agent.qt"));

        let threaded = TraceConfig::new("./agent.qt").with_multithreaded(true);
        let forced =
            resolve_trace_path(&threaded.path, 1, threaded.multithreaded, Some(dir)).unwrap();
        assert_eq!(forced, PathBuf::from("/var/qt/agent.qt"));
    }

    #[test]
    fn test_resolve_empty_path_fails() {
        assert!(resolve_trace_path(Path::new(""), 1, false, None).is_err());
    }
}
