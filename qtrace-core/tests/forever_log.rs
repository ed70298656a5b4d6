//! Forever-log archives
//!
//! Records a level is about to overwrite are copied to `<path>.<n>`; the
//! archives plus the live file must hold every record exactly once.

use std::path::{Path, PathBuf};

use qtrace_core::tail::{expand_paths, Formatters, TailOptions, Tailer};
use qtrace_core::trace::{existing_archives, var, Access};
use qtrace_core::{qtrace, ForeverConfig, SizeSpec, TraceConfig, TraceFile, Tracer};

fn cat(paths: &[PathBuf]) -> (Vec<String>, usize) {
    let mut tailer = Tailer::open(paths, TailOptions::cat(), Formatters::new())
        .expect("Failed to open trace files");
    let mut out = Vec::new();
    let mut err = Vec::new();
    let corrupt = tailer.cat(&mut out, &mut err).expect("cat failed");
    assert!(err.is_empty(), "{}", String::from_utf8_lossy(&err));
    let lines = String::from_utf8(out)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect();
    (lines, corrupt)
}

/// The sequence number of a `rec <n> <n:08>` line
fn seq(line: &str) -> u64 {
    let start = line.find("\"rec ").expect("rec line") + 5;
    let rest = &line[start..];
    rest[..rest.find(' ').unwrap()].parse().unwrap()
}

fn forever_tracer(path: &Path) -> Tracer {
    let config = TraceConfig::new(path)
        .with_sizes(SizeSpec::parse("1,1,1,1,1,1,1,1,1,1").unwrap())
        .with_forever(ForeverConfig::new(path));
    Tracer::try_initialize(&config).expect("Failed to create trace file")
}

/// Append records with a 17-byte payload: a u64 and an 8-character string
fn write_records(t: &Tracer, level: u8, range: std::ops::Range<u64>) {
    let emit = |i: u64| qtrace!(t, level, "rec", var(i), var(format!("{:08}", i))).unwrap();
    for i in range {
        assert!(emit(i));
    }
}

#[test]
fn test_hundred_records_survive_wraps() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fl.qt");
    let t = forever_tracer(&path);
    write_records(&t, 9, 0..100);

    // The live level holds far fewer than 100 records
    let (live_only, _) = cat(&[path.clone()]);
    assert!(live_only.len() < 100);

    let paths = expand_paths(&[path], true);
    assert!(paths.len() > 2, "expected several archives: {:?}", paths);
    let (lines, corrupt) = cat(&paths);
    assert_eq!(corrupt, 0);
    let values: Vec<u64> = lines.iter().map(|l| seq(l)).collect();
    assert_eq!(values, (0..100).collect::<Vec<_>>());
    assert!(lines[42].ends_with("\"rec 42 00000042\""));
}

#[test]
fn test_archives_are_disjoint_and_ordered() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fl.qt");
    let t = forever_tracer(&path);
    write_records(&t, 9, 0..150);

    let mut all = Vec::new();
    for (index, archive) in existing_archives(&path) {
        let file = TraceFile::open(&archive, Access::ReadOnly).unwrap();
        assert!(file.header().is_archive());
        assert_eq!(file.header().archive_index, index);

        let (lines, corrupt) = cat(&[archive]);
        assert_eq!(corrupt, 0);
        assert!(!lines.is_empty());
        all.extend(lines.iter().map(|l| seq(l)));
    }
    let (live, _) = cat(&[path]);
    all.extend(live.iter().map(|l| seq(l)));
    assert_eq!(all, (0..150).collect::<Vec<_>>());
}

#[test]
fn test_levels_archive_independently() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fl.qt");
    let t = forever_tracer(&path);
    for i in 0..60 {
        write_records(&t, 0, i..i + 1);
        write_records(&t, 7, 1000 + i..1001 + i);
    }

    let (lines, corrupt) = cat(&expand_paths(&[path], true));
    assert_eq!(corrupt, 0);
    assert_eq!(lines.len(), 120);
    let low: Vec<u64> = lines.iter().map(|l| seq(l)).filter(|v| *v < 1000).collect();
    let high: Vec<u64> = lines.iter().map(|l| seq(l)).filter(|v| *v >= 1000).collect();
    assert_eq!(low, (0..60).collect::<Vec<_>>());
    assert_eq!(high, (1000..1060).collect::<Vec<_>>());
}

#[test]
fn test_index_resumes_after_existing_archives() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fl.qt");
    let mut first = forever_tracer(&path);
    write_records(&first, 9, 0..60);
    first.close();

    let highest = existing_archives(&path).last().map(|(i, _)| *i).unwrap();
    let second = forever_tracer(&path);
    assert_eq!(second.file().unwrap().archive_index(), highest + 1);
}

#[test]
fn test_explicit_start_index() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fl.qt");
    let config = TraceConfig::new(&path)
        .with_sizes(SizeSpec::uniform(1))
        .with_forever(ForeverConfig::new(&path).with_start_index(10));
    let t = Tracer::try_initialize(&config).unwrap();
    write_records(&t, 9, 0..40);

    let indexes: Vec<u32> = existing_archives(&path).into_iter().map(|(i, _)| i).collect();
    assert_eq!(indexes.first(), Some(&10));
}

#[test]
fn test_attach_refuses_forever_logged_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fl.qt");
    let owner = forever_tracer(&path);
    write_records(&owner, 9, 0..5);

    let err = Tracer::attach(&path).unwrap_err();
    assert_eq!(err.error_code(), "INITIALIZATION_FAILED");
    assert!(err.to_string().contains("forever log"), "{}", err);

    // Archives are refused as well
    write_records(&owner, 9, 5..60);
    let (_, archive) = existing_archives(&path).into_iter().next().unwrap();
    assert!(Tracer::attach(&archive).is_err());

    // The owner keeps writing and archiving
    write_records(&owner, 9, 60..80);
    let (lines, corrupt) = cat(&expand_paths(&[path], true));
    assert_eq!(corrupt, 0);
    assert_eq!(lines.len(), 80);
}
