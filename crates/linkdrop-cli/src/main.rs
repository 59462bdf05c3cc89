//! Linkdrop CLI - resumable, checksum-verified peer-to-peer file transfer
//!
//! One peer listens, the other connects and offers files. Transfers are
//! chunked, verified end to end with CRC32, and resume from a partial file
//! left behind by an interrupted run.
//!
//! ## Quick Start
//!
//! ```bash
//! # On the receiving machine
//! linkdrop receive --output ~/Downloads
//!
//! # On the sending machine
//! linkdrop send ./video.mp4 --to 192.168.1.20
//! ```

#![allow(clippy::doc_markdown)]
#![allow(clippy::uninlined_format_args)]

use anyhow::Result;
use clap::Parser;

mod commands;
pub mod ui;

use commands::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    match cli.command {
        Command::Send(args) => commands::send::run(args).await,
        Command::Receive(args) => commands::receive::run(args).await,
        Command::History(args) => commands::history::run(&args),
        Command::Config(args) => commands::config::run(&args),
    }
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let default = if verbose {
        "info,linkdrop=debug,linkdrop_core=debug"
    } else {
        "warn,linkdrop=info,linkdrop_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .init();
}
