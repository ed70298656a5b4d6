//! qtctl - control messages of a live QTrace file
//!
//! Usage:
//!     qtctl show app.qt                list messages
//!     qtctl show --counts app.qt       ... with append counters
//!     qtctl off -m 12 app.qt           turn message 12 off
//!     qtctl on -r '^rx' app.qt         turn matching messages on
//!     qtctl clear app.qt               reset append counters

use std::path::{Path, PathBuf};

use clap::{Args as ClapArgs, Parser, Subcommand};
use qtrace_core::tail::resolve_input;
use qtrace_core::{Controller, Result, Selector};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "qtctl")]
#[command(about = "Inspect and toggle messages of QTrace files")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List registered messages
    Show {
        /// Append each message's counter
        #[arg(long)]
        counts: bool,

        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Turn messages on
    On(Toggle),
    /// Turn messages off
    Off(Toggle),
    /// Reset all append counters
    Clear {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

#[derive(ClapArgs, Debug)]
struct Toggle {
    /// Message id
    #[arg(short = 'm', long = "id", conflicts_with = "regex")]
    id: Option<u32>,

    /// Regular expression matched against message text and source file
    #[arg(short = 'r', long = "regex")]
    regex: Option<String>,

    #[arg(required = true)]
    files: Vec<PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "qtrace_core=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let result = match cli.command {
        Command::Show { counts, files } => for_each_file(&files, |path| show(path, counts)),
        Command::On(toggle) => run_toggle(&toggle, true),
        Command::Off(toggle) => run_toggle(&toggle, false),
        Command::Clear { files } => for_each_file(&files, |path| Controller::open(path)?.clear_counters()),
    };

    if let Err(e) = result {
        eprintln!("qtctl: {}", e);
        std::process::exit(1);
    }
}

fn for_each_file<F>(files: &[PathBuf], mut f: F) -> Result<()>
where
    F: FnMut(&Path) -> Result<()>,
{
    let many = files.len() > 1;
    for file in files {
        let path = resolve_input(file);
        if many {
            println!("{}:", path.display());
        }
        f(&path)?;
    }
    Ok(())
}

fn show(path: &Path, counts: bool) -> Result<()> {
    let mut ctl = Controller::open(path)?;
    for entry in ctl.entries()? {
        println!("{}", entry.show_line(counts));
    }
    Ok(())
}

fn run_toggle(toggle: &Toggle, enabled: bool) -> Result<()> {
    let selector = Selector::parse(toggle.id, toggle.regex.as_deref())?;
    for_each_file(&toggle.files, |path| {
        let mut ctl = Controller::open(path)?;
        for entry in ctl.set_enabled(&selector, enabled)? {
            println!("{}", entry.show_line(false));
            let shared = ctl.shared_with(entry.id);
            if !shared.is_empty() {
                eprintln!(
                    "qtctl: message {} shares its control entry with {:?}",
                    entry.id, shared
                );
            }
        }
        Ok(())
    })
}
