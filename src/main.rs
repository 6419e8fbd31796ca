//! Binary entry point for the `ktally` command-line tool.
//!
//! Dispatches the `count` / `histo` / `dump` subcommands, installs the
//! logging subscriber (stderr by default, a file when `--log` is given) and
//! maps failures to a nonzero exit code.

use std::fs::File;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ktally::cli::{Cli, Command, CountArgs};
use ktally::counter::KmerCounter;
use ktally::mem::MemBudget;
use ktally::{dump, histo};

/// Installs the global subscriber. `RUST_LOG` overrides the default `info`
/// filter; a log file target disables ANSI colors.
fn init_logging(log_file: Option<&str>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match log_file {
        Some(path) => {
            let file = match File::create(path) {
                Ok(file) => file,
                Err(_) => {
                    eprintln!("Open log file error: {path}");
                    std::process::exit(1);
                }
            };
            builder.with_ansi(false).with_writer(Arc::new(file)).init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
}

fn run_count(args: CountArgs) -> i32 {
    let config = match args.resolve() {
        Ok(config) => config,
        Err(e) => {
            error!("{e:#}");
            return 1;
        }
    };

    let start_time = Instant::now();

    let budget = MemBudget::new(config.mem_limit);
    let mut counter = KmerCounter::new(&budget, config);
    counter.work();
    drop(counter);

    budget.log_usage();
    info!("Count running time: {}s", start_time.elapsed().as_secs());

    0
}

fn main() {
    let cli = Cli::parse();

    let exit_code = match cli.command {
        Command::Count(args) => {
            init_logging(args.log.as_deref());
            run_count(args)
        }
        Command::Histo(args) => {
            init_logging(None);
            match histo::run(&args.result, &args.out) {
                Ok(()) => 0,
                Err(e) => {
                    error!("{e:#}");
                    1
                }
            }
        }
        Command::Dump(args) => {
            init_logging(None);
            match dump::run(&args.result, &args.out) {
                Ok(()) => 0,
                Err(e) => {
                    error!("{e:#}");
                    1
                }
            }
        }
    };

    std::process::exit(exit_code);
}
