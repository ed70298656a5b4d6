//! Producer to tailer round trips
//!
//! Each test writes through a `Tracer` and reads the file back with the
//! tailer in cat mode.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use qtrace_core::tail::{Formatters, TailOptions, Tailer};
use qtrace_core::trace::{hex, var};
use qtrace_core::{qtrace, CallSite, Controller, SizeSpec, TraceConfig, Tracer};

fn cat(paths: &[PathBuf]) -> (Vec<String>, String, usize) {
    let mut tailer = Tailer::open(paths, TailOptions::cat(), Formatters::new())
        .expect("Failed to open trace files");
    let mut out = Vec::new();
    let mut err = Vec::new();
    let corrupt = tailer.cat(&mut out, &mut err).expect("cat failed");
    let lines = String::from_utf8(out)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect();
    (lines, String::from_utf8(err).unwrap(), corrupt)
}

/// Message text of an output line
fn message(line: &str) -> &str {
    let start = line.find('"').expect("line has a message");
    &line[start + 1..line.len() - 1]
}

fn live_path(tracer: &Tracer) -> PathBuf {
    tracer.file().unwrap().path().to_path_buf()
}

fn tracer(dir: &Path, name: &str, sizes: SizeSpec) -> Tracer {
    let config = TraceConfig::new(dir.join(name)).with_sizes(sizes);
    Tracer::try_initialize(&config).expect("Failed to create trace file")
}

#[test]
fn test_every_type_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let t = tracer(dir.path(), "types.qt", SizeSpec::uniform(4));

    qtrace!(
        t, 4,
        "u8", var(1u8),
        "u16", var(2u16),
        "i32", var(-3i32),
        "i64", var(-4i64),
        "u64", var(5u64),
        "bool", var(true),
        "f32", var(1.5f32),
        "f64", var(2.0f64),
        "char", var('x'),
        "str", var("eth0"),
        "hex", hex(255u32),
        "none", var(None::<i32>)
    )
    .unwrap();

    let (lines, err, corrupt) = cat(&[live_path(&t)]);
    assert_eq!(corrupt, 0, "{}", err);
    assert_eq!(lines.len(), 1);
    assert_eq!(
        message(&lines[0]),
        "u8 1 u16 2 i32 -3 i64 -4 u64 5 bool True f32 1.5 f64 2.0 char x str eth0 hex ff none None"
    );
}

#[test]
fn test_line_layout() {
    let dir = tempfile::tempdir().unwrap();
    let t = tracer(dir.path(), "layout.qt", SizeSpec::uniform(4));
    t.trace(7, CallSite::new("src/net.rs", 42), &["hello".into()])
        .unwrap();

    let (lines, _, _) = cat(&[live_path(&t)]);
    let fields: Vec<&str> = lines[0].splitn(5, ' ').collect();
    // 2024-01-31 12:00:00.123456 7 +0 "hello"
    assert_eq!(fields[0].len(), 10);
    assert_eq!(fields[1].len(), 15);
    assert_eq!(fields[2], "7");
    assert_eq!(fields[3], "+0");
    assert_eq!(fields[4], "\"hello\"");
}

#[test]
fn test_wrap_keeps_stream_decodable() {
    let dir = tempfile::tempdir().unwrap();
    let t = tracer(dir.path(), "wrap.qt", SizeSpec::uniform(1));
    let write = |i: u64| qtrace!(t, 3, "seq", var(i)).unwrap();
    for i in 0..200u64 {
        assert!(write(i));
    }

    let (lines, err, corrupt) = cat(&[live_path(&t)]);
    assert_eq!(corrupt, 0, "{}", err);
    assert!(!lines.is_empty());
    let values: Vec<u64> = lines
        .iter()
        .map(|l| message(l).trim_start_matches("seq ").parse().unwrap())
        .collect();
    assert_eq!(*values.last().unwrap(), 199);
    for pair in values.windows(2) {
        assert_eq!(pair[1], pair[0] + 1, "gap or duplicate in {:?}", values);
    }
}

#[test]
fn test_truncation_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let config = TraceConfig::new(dir.path().join("trunc.qt"))
        .with_sizes(SizeSpec::uniform(4))
        .with_max_string_len(80);
    let t = Tracer::try_initialize(&config).unwrap();
    let emit = |s: &str| qtrace!(t, 0, var(s.to_string())).unwrap();

    let exact: String = "a".repeat(79) + "b";
    let over: String = "c".repeat(80) + "d";
    emit(&exact);
    emit(&over);

    let (lines, _, _) = cat(&[live_path(&t)]);
    assert_eq!(message(&lines[0]), exact);
    assert_eq!(message(&lines[1]), "c".repeat(80));
    assert_ne!(message(&lines[1]).len(), over.len());
}

#[test]
fn test_short_cap_truncates() {
    let dir = tempfile::tempdir().unwrap();
    let config = TraceConfig::new(dir.path().join("cap.qt"))
        .with_sizes(SizeSpec::uniform(4))
        .with_max_string_len(6);
    let t = Tracer::try_initialize(&config).unwrap();
    qtrace!(t, 0, "name", var("abcdefghij")).unwrap();

    let (lines, _, _) = cat(&[live_path(&t)]);
    assert_eq!(message(&lines[0]), "name abcdef");
}

#[test]
fn test_threads_lose_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let t = tracer(dir.path(), "threads.qt", SizeSpec::uniform(64));
    let per_thread = 200u64;

    std::thread::scope(|s| {
        for worker in 0..4u8 {
            let t = &t;
            s.spawn(move || {
                for i in 0..per_thread {
                    qtrace!(t, 0, "worker", var(worker), "n", var(i)).unwrap();
                }
            });
        }
    });

    let (lines, err, corrupt) = cat(&[live_path(&t)]);
    assert_eq!(corrupt, 0, "{}", err);
    assert_eq!(lines.len(), 4 * per_thread as usize);
    let unique: HashSet<&str> = lines.iter().map(|l| message(l)).collect();
    assert_eq!(unique.len(), lines.len());

    let file = t.file().unwrap();
    assert_eq!(file.level(0).unwrap().commits(), 4 * per_thread);
}

#[test]
fn test_inert_on_bad_path() {
    let t = Tracer::initialize(&TraceConfig::new("/nonexistent/qtrace/dir/x.qt"));
    assert!(!t.is_active());
    assert!(!qtrace!(t, 0, "dropped", var(1i32)).unwrap());
    assert!(!t
        .trace_long_string(0, CallSite::new("x.rs", 1), "s", "long")
        .unwrap());
}

#[test]
fn test_type_mismatch_leaves_file_intact() {
    let dir = tempfile::tempdir().unwrap();
    let t = tracer(dir.path(), "mismatch.qt", SizeSpec::uniform(4));
    let site = CallSite::new("m.rs", 3);

    assert!(t.trace(2, site.clone(), &["n".into(), var(1i64)]).unwrap());
    let err = t
        .trace(2, site.clone(), &["n".into(), var(false)])
        .unwrap_err();
    assert!(err.to_string().contains("'q'"), "{}", err);
    // Integers of another width are converted to the registered one
    assert!(t.trace(2, site, &["n".into(), var(7u8)]).unwrap());

    let (lines, _, corrupt) = cat(&[live_path(&t)]);
    assert_eq!(corrupt, 0);
    let messages: Vec<&str> = lines.iter().map(|l| message(l)).collect();
    assert_eq!(messages, vec!["n 1", "n 7"]);
}

#[test]
fn test_missing_and_extra_arguments() {
    let dir = tempfile::tempdir().unwrap();
    let t = tracer(dir.path(), "arity.qt", SizeSpec::uniform(4));
    let site = CallSite::new("a.rs", 9);

    t.trace(1, site.clone(), &["a".into(), var(1i32), "b".into(), var(2i32)])
        .unwrap();
    // Fewer values than registered: the rest print as None
    t.trace(1, site.clone(), &["a".into(), var(5i32)]).unwrap();
    // More values than registered: the extra ones are dropped
    t.trace(1, site, &["a".into(), var(6i32), "b".into(), var(7i32), var(8i32)])
        .unwrap();

    let (lines, _, _) = cat(&[live_path(&t)]);
    assert_eq!(message(&lines[0]), "a 1 b 2");
    assert_eq!(message(&lines[1]), "a 5 b None");
    assert_eq!(message(&lines[2]), "a 6 b 7");
}

#[test]
fn test_long_string_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let config = TraceConfig::new(dir.path().join("long.qt"))
        .with_sizes(SizeSpec::uniform(4))
        .with_max_string_len(80);
    let t = Tracer::try_initialize(&config).unwrap();
    let site = CallSite::new("long.rs", 1);

    let text: String = (0..240).map(|i| (b'a' + (i % 26) as u8) as char).collect();
    assert!(t.trace_long_string(6, site.clone(), "body", &text).unwrap());
    let longer = text.clone() + "tail that is dropped";
    assert!(t.trace_long_string(6, site, "body", &longer).unwrap());

    let (lines, _, corrupt) = cat(&[live_path(&t)]);
    assert_eq!(corrupt, 0);
    assert_eq!(lines.len(), 2);
    assert_eq!(message(&lines[0]), format!("body {}", text));
    assert_eq!(message(&lines[1]), format!("body {}", text));
}

#[test]
fn test_oversized_message_text_keeps_catalog_readable() {
    let dir = tempfile::tempdir().unwrap();
    let t = tracer(dir.path(), "wide.qt", SizeSpec::uniform(4));
    let wide = "é".repeat(40_000);

    assert!(t.trace(3, CallSite::new("w.rs", 1), &["before".into()]).unwrap());
    assert!(t.trace(3, CallSite::new("w.rs", 2), &[wide.clone().into()]).unwrap());
    assert!(t
        .trace(3, CallSite::new("w.rs", 3), &["after".into(), var(9i32)])
        .unwrap());

    let (lines, err, corrupt) = cat(&[live_path(&t)]);
    assert_eq!(corrupt, 0);
    assert!(err.is_empty(), "{}", err);
    assert_eq!(lines.len(), 3);
    assert_eq!(message(&lines[0]), "before");
    let kept = message(&lines[1]);
    assert!(!kept.is_empty() && kept.len() < wide.len());
    assert!(kept.chars().all(|c| c == 'é'));
    assert_eq!(message(&lines[2]), "after 9");

    let mut ctl = Controller::open(&live_path(&t)).unwrap();
    assert_eq!(ctl.entries().unwrap().len(), 3);
}

#[test]
fn test_attached_writer_reuses_descriptors() {
    let dir = tempfile::tempdir().unwrap();
    let first = tracer(dir.path(), "shared.qt", SizeSpec::uniform(4));
    let path = live_path(&first);
    let site = CallSite::new("shared.rs", 11);
    first.trace(0, site.clone(), &["hit".into(), var(1i32)]).unwrap();

    let second = Tracer::attach(&path).unwrap();
    second.trace(0, site, &["hit".into(), var(2i32)]).unwrap();
    second
        .trace(0, CallSite::new("other.rs", 1), &["other".into()])
        .unwrap();

    let mut ctl = Controller::open(&path).unwrap();
    let entries = ctl.entries().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].count, 2);

    let (lines, _, _) = cat(&[path]);
    let messages: Vec<&str> = lines.iter().map(|l| message(l)).collect();
    assert_eq!(messages, vec!["hit 1", "hit 2", "other"]);
}

#[test]
fn test_disabled_message_disappears_until_enabled() {
    let dir = tempfile::tempdir().unwrap();
    let t = tracer(dir.path(), "toggle.qt", SizeSpec::uniform(4));
    let path = live_path(&t);
    let noisy = |i: i32| qtrace!(t, 2, "noisy", var(i)).unwrap();
    let quiet = |i: i32| qtrace!(t, 2, "quiet", var(i)).unwrap();

    noisy(0);
    quiet(0);
    let mut ctl = Controller::open(&path).unwrap();
    ctl.set_enabled(&qtrace_core::Selector::parse(None, Some("noisy")).unwrap(), false)
        .unwrap();
    noisy(1);
    quiet(1);
    ctl.set_enabled(&qtrace_core::Selector::parse(None, Some("noisy")).unwrap(), true)
        .unwrap();
    noisy(2);

    let (lines, _, corrupt) = cat(&[path]);
    assert_eq!(corrupt, 0);
    let messages: Vec<&str> = lines.iter().map(|l| message(l)).collect();
    assert_eq!(messages, vec!["noisy 0", "quiet 0", "quiet 1", "noisy 2"]);
}
