//! Send command implementation.
//!
//! Connects to a listening peer and offers each file in turn. Transfers run
//! concurrently; the command returns once every one of them has finished.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use linkdrop_core::channel::tcp;
use linkdrop_core::events::SessionEvent;
use linkdrop_core::session::{Session, SessionConfig};
use linkdrop_core::storage::{format_size, MemoryOnlyProvider};
use linkdrop_core::transfer::TransferId;

use super::SendArgs;
use crate::ui::{self, ProgressLine};

/// Run the send command.
#[allow(clippy::too_many_lines)]
pub async fn run(args: SendArgs) -> Result<()> {
    let config = super::load_config();
    let addr = tcp::parse_host_address(&args.to).context("Invalid peer address")?;

    ui::banner(args.quiet);
    if !args.quiet {
        println!("  Connecting to {addr}...");
    }

    let link = tcp::connect(
        addr,
        config.transfer.buffered_amount_low,
        config.connection.connect_timeout,
    )
    .await
    .inspect_err(super::print_suggestion)
    .with_context(|| format!("Failed to connect to {addr}"))?;

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let session = Session::spawn(
        link,
        SessionConfig::from(&config),
        Arc::new(MemoryOnlyProvider),
        events_tx,
    );
    session.consumer_ready().await?;
    session
        .wait_connected()
        .await
        .inspect_err(super::print_suggestion)
        .context("Peer did not connect")?;

    if !args.quiet {
        println!("  Connected.");
        println!();
    }

    let mut pending: HashSet<TransferId> = HashSet::new();
    for path in &args.paths {
        let id = session
            .send_file(path)
            .await
            .with_context(|| format!("Failed to offer {}", path.display()))?;
        if !args.quiet {
            let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or_default();
            println!("  Offering {} ({})", path.display(), format_size(size));
        }
        pending.insert(id);
    }

    let peer = addr.to_string();
    let mut progress = ProgressLine::new(args.quiet);
    let mut failures = 0usize;

    while !pending.is_empty() {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    SessionEvent::Progress { info, .. } => progress.update(&info),
                    SessionEvent::TransferFinished(summary) => {
                        progress.finish(&summary);
                        super::record_history(&config, &peer, &summary);
                        if let Err(e) = summary.outcome() {
                            tracing::debug!("{e}");
                            super::print_suggestion(&e);
                            failures += 1;
                        }
                        pending.remove(&summary.id);
                    }
                    SessionEvent::ConnectionChanged { to, .. } => {
                        tracing::debug!(state = %to, "Connection changed");
                    }
                    SessionEvent::Chat(text) => {
                        if !args.quiet {
                            println!("  peer: {text}");
                        }
                    }
                    SessionEvent::OfferReceived(info) => {
                        tracing::info!(name = %info.name, "Peer offered a file; send mode discards it");
                    }
                    SessionEvent::ArtifactReady { .. } => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                if !args.quiet {
                    println!();
                    println!("  Cancelling...");
                }
                for id in &pending {
                    session.cancel(id, "canceled by sender").await?;
                }
            }
        }
    }

    // Transfers left pending here were cut off by a closed session.
    failures += pending.len();

    if let Err(e) = session.shutdown().await {
        tracing::debug!("Session already stopped: {e}");
    }

    if failures > 0 {
        anyhow::bail!("{failures} of {} transfers did not complete", args.paths.len());
    }

    if !args.quiet {
        println!();
        println!("  All transfers complete!");
        println!();
    }
    Ok(())
}
