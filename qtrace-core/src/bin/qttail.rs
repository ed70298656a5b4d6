//! qttail - decode QTrace files
//!
//! Prints the records of one or more trace files in timestamp order, then
//! keeps following them until every file is deleted.
//!
//! Usage:
//!     qttail -c app.qt                 dump and exit
//!     qttail app.qt worker.qt          follow both files
//!     qttail -x -l 0-3,9 --tsc app.qt  follow with lifecycle notices
//!     qttail -c -a app.qt              include forever-log archives

use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use qtrace_core::tail::{expand_paths, FollowState, Formatters, LevelFilter, TailOptions, Tailer};
use qtrace_core::QtError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Milliseconds follow mode waits on stdout between polls
const POLL_INTERVAL_MS: i32 = 50;

#[derive(Parser, Debug)]
#[command(name = "qttail")]
#[command(about = "Decode and follow QTrace files")]
#[command(version)]
struct Args {
    /// Trace files; relative names are also looked up in $QUICKTRACEDIR
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Print what is in the files and exit
    #[arg(short = 'c', long = "cat")]
    cat: bool,

    /// Follow, printing `--- opened`/`--- deleted` notices on stderr
    #[arg(short = 'x', long = "follow", conflicts_with = "cat")]
    follow: bool,

    /// Show the raw timestamp of each record
    #[arg(long)]
    tsc: bool,

    /// Show the source location of each message
    #[arg(short = 'f', long = "file-line")]
    location: bool,

    /// Levels to print, e.g. `0-3,9`
    #[arg(short = 'l', long = "levels", value_parser = parse_levels)]
    levels: Option<LevelFilter>,

    /// Read `<file>.<n>` forever-log archives before each file
    #[arg(short = 'a', long = "archives")]
    archives: bool,
}

fn parse_levels(s: &str) -> Result<LevelFilter, String> {
    LevelFilter::parse(s).map_err(|e| e.to_string())
}

fn main() {
    let args = Args::parse();

    // Diagnostics go to stderr; stdout carries decoded records only
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "qtrace_core=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let options = TailOptions {
        follow: !args.cat,
        notices: args.follow,
        show_tsc: args.tsc,
        show_location: args.location,
        levels: args.levels.unwrap_or_default(),
        archives: args.archives,
        ..TailOptions::default()
    };

    let paths = expand_paths(&args.files, options.archives);
    let mut tailer = match Tailer::open(&paths, options, Formatters::from_env()) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("qttail: {}", e);
            std::process::exit(1);
        }
    };

    let stdout = io::stdout();
    let stderr = io::stderr();
    let mut out = stdout.lock();
    let mut err = stderr.lock();

    if !tailer.options().follow {
        match tailer.cat(&mut out, &mut err) {
            Ok(0) => std::process::exit(0),
            Ok(_) => std::process::exit(1),
            Err(e) => fail(e),
        }
    }

    if tailer.options().notices {
        for path in &paths {
            let _ = writeln!(err, "--- opened {}", path.display());
        }
    }

    loop {
        match tailer.poll_once(&mut out, &mut err) {
            Ok(FollowState::Finished) => std::process::exit(0),
            Ok(FollowState::Running) => {}
            Err(e) => fail(e),
        }
        if !wait_for_stdout(Duration::from_millis(POLL_INTERVAL_MS as u64)) {
            hang_up();
        }
    }
}

/// Sleep up to `timeout`, returning early with `false` if stdout was closed
fn wait_for_stdout(timeout: Duration) -> bool {
    let mut fds = [libc::pollfd {
        fd: libc::STDOUT_FILENO,
        events: 0,
        revents: 0,
    }];
    // SAFETY: one valid pollfd; POLLERR and POLLHUP are reported even with
    // no requested events.
    let rc = unsafe { libc::poll(fds.as_mut_ptr(), 1, timeout.as_millis() as libc::c_int) };
    if rc < 0 {
        std::thread::sleep(timeout);
        return true;
    }
    fds[0].revents & (libc::POLLERR | libc::POLLHUP) == 0
}

/// Exit the way a terminal hang-up would: by SIGHUP, or with status 1 when
/// SIGHUP is ignored
fn hang_up() -> ! {
    // SAFETY: raising a signal on ourselves.
    unsafe {
        libc::raise(libc::SIGHUP);
    }
    std::process::exit(1);
}

fn fail(e: QtError) -> ! {
    match e {
        QtError::OutputClosed { .. } => hang_up(),
        other => {
            eprintln!("qttail: {}", other);
            std::process::exit(1);
        }
    }
}
