//
// Main entry point for the pg_rewind executable
//
use std::process::exit;

use camino::Utf8PathBuf;
use clap::error::ErrorKind;
use clap::{ArgGroup, Parser};

use pg_rewind::{rewind, RewindConf};

const ABOUT: &str = "\
pg_rewind resynchronizes a cluster with another copy of the cluster. The
target data directory is modified in place to match a source that was
promoted from a common ancestor, so that it can be restarted as a standby
without taking a new base backup.";

#[derive(Parser)]
#[command(name = "pg_rewind", version, about = ABOUT, long_about = None)]
#[command(group(
    ArgGroup::new("source")
        .required(true)
        .args(["source_pgdata", "source_server"]),
))]
struct Args {
    /// Existing data directory to modify.
    #[arg(short = 'D', long, value_name = "DIRECTORY")]
    target_pgdata: Utf8PathBuf,

    /// Source data directory to sync with.
    #[arg(long, value_name = "DIRECTORY")]
    source_pgdata: Option<Utf8PathBuf>,

    /// Source server to sync with.
    #[arg(long, value_name = "CONNSTR")]
    source_server: Option<String>,

    /// Stop before modifying anything.
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Write a lot of progress messages.
    #[arg(short = 'v', long)]
    verbose: bool,
}

fn main() {
    // Usage problems are exit code 1; --help and --version are successes.
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            print!("{}", e);
            exit(0);
        }
        Err(e) => {
            eprint!("{}", e);
            exit(1);
        }
    };

    if let Err(e) = utils::logging::init(args.verbose) {
        eprintln!("pg_rewind: {:#}", e);
        exit(1);
    }

    let conf = RewindConf {
        datadir_target: args.target_pgdata,
        datadir_source: args.source_pgdata,
        connstr_source: args.source_server,
        dry_run: args.dry_run,
        verbose: args.verbose,
    };

    if let Err(e) = rewind::run(&conf) {
        eprintln!("pg_rewind: {:#}", e);
        exit(error_exit_code(&e));
    }
}

/// File I/O problems exit with 2, everything else with 1.
fn error_exit_code(e: &anyhow::Error) -> i32 {
    if e.chain().any(|cause| cause.is::<std::io::Error>()) {
        2
    } else {
        1
    }
}
