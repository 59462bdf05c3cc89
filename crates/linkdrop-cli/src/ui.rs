//! Terminal output helpers for the Linkdrop CLI.

use std::io::{self, Write};

use linkdrop_core::storage::format_size;
use linkdrop_core::transfer::{TransferInfo, TransferStatus, TransferSummary};

/// A single carriage-return progress line.
///
/// Only one transfer is drawn at a time; switching to another transfer
/// starts a new line.
#[derive(Debug, Default)]
pub struct ProgressLine {
    quiet: bool,
    active: Option<String>,
}

impl ProgressLine {
    /// Create a progress line. A quiet line prints nothing.
    #[must_use]
    pub const fn new(quiet: bool) -> Self {
        Self {
            quiet,
            active: None,
        }
    }

    /// Redraw the line for `info`.
    pub fn update(&mut self, info: &TransferInfo) {
        if self.quiet {
            return;
        }

        if self.active.as_deref() != Some(info.id.as_str()) {
            if self.active.is_some() {
                println!();
            }
            self.active = Some(info.id.as_str().to_string());
        }

        print!("\r{}    ", progress_text(info));
        let _ = io::stdout().flush();
    }

    /// Print the final status for `summary`, ending its progress line.
    pub fn finish(&mut self, summary: &TransferSummary) {
        if self.quiet {
            return;
        }

        if self.active.take().is_some() {
            println!();
        }
        println!("{}", summary_text(summary));
    }
}

/// `  [ 42.00%] name - 1.2 MB/s`
#[must_use]
pub fn progress_text(info: &TransferInfo) -> String {
    format!(
        "  [{:>6.2}%] {} - {}/s",
        info.progress() * 100.0,
        info.name,
        format_size(info.throughput_bps)
    )
}

/// One-line outcome of a finished transfer.
#[must_use]
pub fn summary_text(summary: &TransferSummary) -> String {
    let mut line = match summary.status {
        TransferStatus::Completed => format!(
            "  {} {} ({}) - verified",
            summary.direction,
            summary.name,
            format_size(summary.size)
        ),
        TransferStatus::ChecksumMismatch => format!(
            "  {} failed verification: {:#010x} != {:#010x}",
            summary.name,
            summary.local_crc32.unwrap_or_default(),
            summary.remote_crc32.unwrap_or_default()
        ),
        TransferStatus::Canceled => format!(
            "  {} canceled: {}",
            summary.name,
            summary.reason.as_deref().unwrap_or("no reason given")
        ),
        TransferStatus::InProgress => format!("  {} in progress", summary.name),
    };

    if summary.resumed_from > 0 && summary.status == TransferStatus::Completed {
        line.push_str(&format!(", resumed at {}", format_size(summary.resumed_from)));
    }
    if let Some(path) = &summary.saved_to {
        line.push_str(&format!("\n    saved to {}", path.display()));
    }
    line
}

/// Print the banner shown at the top of interactive commands.
pub fn banner(quiet: bool) {
    if quiet {
        return;
    }
    println!();
    println!("Linkdrop v{}", linkdrop_core::VERSION);
    println!("{}", "-".repeat(37));
    println!();
}
