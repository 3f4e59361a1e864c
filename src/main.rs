// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use parsnap::config;
use parsnap::pass::{self, Mode};
use parsnap::progress;
use parsnap::result::Result;
use parsnap::scan;
use parsnap::state::{Options, State};

#[derive(Parser)]
#[command(name = "parsnap", version, about = "Snapshot parity for disk arrays")]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long = "conf", default_value = "/etc/parsnap.toml")]
    conf: String,
    /// Accept tracked files that shrank to zero size
    #[arg(long)]
    force_zero: bool,
    /// Accept disks whose tracked files all disappeared
    #[arg(long)]
    force_empty: bool,
    #[arg(short, long)]
    verbose: bool,
    /// Emit machine readable scan events on stderr
    #[arg(long)]
    gui: bool,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Report the differences between the disks and the stored state
    Diff,
    /// Bring the parity up to date with the disks
    Sync,
    /// Verify block hashes and parity
    Check {
        #[command(flatten)]
        range: Range,
    },
    /// Rebuild broken blocks from parity
    Fix {
        #[command(flatten)]
        range: Range,
    },
    /// Read everything back without verifying or writing
    Dry {
        #[command(flatten)]
        range: Range,
    },
}

#[derive(clap::Args)]
struct Range {
    /// First parity block to process
    #[arg(short = 's', long = "start", default_value_t = 0)]
    start: u32,
    /// Number of parity blocks to process, 0 for all
    #[arg(short = 't', long = "count", default_value_t = 0)]
    count: u32,
}

fn run(args: Args) -> Result<()> {
    let config = config::read(&args.conf)?;
    let opts = Options {
        force_zero: args.force_zero,
        force_empty: args.force_empty,
        verbose: args.verbose,
        gui: args.gui,
    };
    let mut state = State::new(config, opts);
    state.load()?;

    match args.cmd {
        Cmd::Diff => {
            scan::scan(&mut state, true)?;
        }
        Cmd::Sync => {
            scan::scan(&mut state, false)?;
            let synced = pass::run(&mut state, Mode::Sync, 0, 0);
            // The scan result and any freshly covered columns
            // are worth keeping even if the pass failed.
            if state.need_write {
                state.save()?;
            }
            synced?;
        }
        Cmd::Check { range } => {
            pass::run(&mut state, Mode::Check, range.start, range.count)?;
        }
        Cmd::Fix { range } => {
            pass::run(&mut state, Mode::Fix, range.start, range.count)?;
        }
        Cmd::Dry { range } => {
            pass::run(&mut state, Mode::Dry, range.start, range.count)?;
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();
    progress::install_sigint();

    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
