//! CLI command definitions and handlers.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use linkdrop_core::config::Config;
use linkdrop_core::history::{HistoryEntry, HistoryStore};
use linkdrop_core::transfer::TransferSummary;

pub mod config;
pub mod history;
pub mod receive;
pub mod send;

/// Load configuration with graceful fallback to defaults.
///
/// Every command goes through this. A missing or unreadable config file
/// falls back to defaults with a warning.
pub fn load_config() -> Config {
    Config::load().unwrap_or_else(|e| {
        tracing::warn!("Using default configuration: {e}");
        Config::default()
    })
}

/// Append a terminal transfer to the persistent history.
///
/// Failures are logged, never fatal.
pub fn record_history(config: &Config, peer: &str, summary: &TransferSummary) {
    if !config.history.enabled {
        return;
    }

    match HistoryStore::load_with_config(config.history.clone()) {
        Ok(mut store) => {
            if let Err(e) = store.add(HistoryEntry::new(peer, summary.clone())) {
                tracing::warn!("Failed to record history: {e}");
            }
        }
        Err(e) => tracing::warn!("Failed to open history: {e}"),
    }
}

/// Print the hint attached to a core error, if any.
pub fn print_suggestion(err: &linkdrop_core::Error) {
    if let Some(suggestion) = err.suggestion() {
        eprintln!();
        eprintln!("Suggestion:");
        for line in suggestion.lines() {
            eprintln!("  {}", line.trim());
        }
    }
}

/// Linkdrop - resumable peer-to-peer file transfer
#[derive(Parser)]
#[command(name = "linkdrop")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Detailed logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand)]
pub enum Command {
    /// Send files to a listening peer
    Send(SendArgs),

    /// Listen for a peer and receive its files
    Receive(ReceiveArgs),

    /// View transfer history
    History(HistoryArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

/// Arguments for the send command
#[derive(Parser)]
pub struct SendArgs {
    /// Files to send
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// Peer address: IP, IP:PORT, [IPv6] or [IPv6]:PORT
    #[arg(short, long)]
    pub to: String,

    /// Minimal output
    #[arg(short, long)]
    pub quiet: bool,
}

/// Arguments for the receive command
#[derive(Parser)]
pub struct ReceiveArgs {
    /// Port to listen on
    #[arg(short, long, default_value_t = linkdrop_core::DEFAULT_TCP_PORT)]
    pub port: u16,

    /// Output directory for received files
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Accumulate files in memory and write them out on completion
    /// (no resume)
    #[arg(long)]
    pub memory: bool,

    /// Minimal output
    #[arg(short, long)]
    pub quiet: bool,
}

/// Arguments for the history command
#[derive(Parser)]
pub struct HistoryArgs {
    /// Show at most this many entries
    #[arg(short = 'n', long)]
    pub limit: Option<usize>,

    /// Clear history
    #[arg(long)]
    pub clear: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the config command
#[derive(Parser)]
pub struct ConfigArgs {
    /// Config subcommand
    #[command(subcommand)]
    pub action: ConfigAction,
}

/// Config subcommands
#[derive(Subcommand)]
pub enum ConfigAction {
    /// Show the configuration file path
    Path,

    /// Show the effective configuration
    Show,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_args_parse() {
        let cli = Cli::try_parse_from(["linkdrop", "send", "a.txt", "b.txt", "--to", "10.0.0.2:9000"])
            .expect("parse");
        match cli.command {
            Command::Send(args) => {
                assert_eq!(args.paths.len(), 2);
                assert_eq!(args.to, "10.0.0.2:9000");
            }
            _ => panic!("expected send"),
        }
    }

    #[test]
    fn test_receive_defaults() {
        let cli = Cli::try_parse_from(["linkdrop", "-v", "receive"]).expect("parse");
        assert!(cli.verbose);
        match cli.command {
            Command::Receive(args) => {
                assert_eq!(args.port, linkdrop_core::DEFAULT_TCP_PORT);
                assert!(!args.memory);
                assert!(args.output.is_none());
            }
            _ => panic!("expected receive"),
        }
    }

    #[test]
    fn test_send_requires_target() {
        assert!(Cli::try_parse_from(["linkdrop", "send", "a.txt"]).is_err());
    }
}
