//! History command implementation.

use anyhow::{Context, Result};

use linkdrop_core::history::{HistoryEntry, HistoryStore};
use linkdrop_core::storage::format_size;

use super::HistoryArgs;

/// Run the history command.
pub fn run(args: &HistoryArgs) -> Result<()> {
    let config = super::load_config();
    let mut store =
        HistoryStore::load_with_config(config.history).context("Failed to load history")?;

    if args.clear {
        store.clear().context("Failed to clear history")?;
        println!("History cleared.");
        return Ok(());
    }

    let entries = store.list(args.limit);

    if args.json {
        println!("{}", serde_json::to_string_pretty(entries)?);
        return Ok(());
    }

    println!();
    println!("Recent Transfers:");
    println!("{}", "─".repeat(78));
    println!(
        "  {:16}  {:8}  {:24}  {:10}  {:18}",
        "Date", "Dir", "File", "Size", "Status"
    );
    println!("{}", "─".repeat(78));

    if entries.is_empty() {
        println!("  (no transfer history)");
    }
    for entry in entries {
        println!("{}", format_row(entry));
    }

    println!("{}", "─".repeat(78));
    Ok(())
}

fn format_row(entry: &HistoryEntry) -> String {
    let summary = &entry.summary;
    format!(
        "  {:16}  {:8}  {:24}  {:10}  {:18}",
        entry.formatted_timestamp(),
        summary.direction.to_string(),
        truncate(&summary.name, 24),
        format_size(summary.size),
        summary.status.to_string()
    )
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let kept: String = text.chars().take(width.saturating_sub(3)).collect();
    format!("{kept}...")
}
