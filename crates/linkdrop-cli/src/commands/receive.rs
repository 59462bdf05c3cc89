//! Receive command implementation.
//!
//! Listens for one peer and accepts every file it offers until the peer
//! disconnects. Files already partially present in the output directory
//! resume where they left off.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use linkdrop_core::channel::tcp;
use linkdrop_core::config::Config;
use linkdrop_core::connection::ConnectionState;
use linkdrop_core::events::SessionEvent;
use linkdrop_core::session::{Session, SessionConfig};
use linkdrop_core::storage::{
    format_size, sanitize_path, DirectorySinkProvider, MemoryOnlyProvider, SinkProvider,
};

use super::ReceiveArgs;
use crate::ui::{self, ProgressLine};

struct Receiver<'a> {
    config: &'a Config,
    peer: String,
    output: PathBuf,
    quiet: bool,
    progress: ProgressLine,
    received: usize,
    failed: usize,
}

impl Receiver<'_> {
    /// Handle one event. Returns `true` once the peer has gone away.
    async fn handle(&mut self, event: SessionEvent) -> bool {
        match event {
            SessionEvent::OfferReceived(info) => {
                if !self.quiet {
                    println!("  Receiving {} ({})", info.name, format_size(info.size));
                    if info.transferred_bytes > 0 {
                        println!(
                            "    resuming at {}",
                            format_size(info.transferred_bytes)
                        );
                    }
                }
            }
            SessionEvent::Progress { info, .. } => self.progress.update(&info),
            SessionEvent::ArtifactReady { name, data, .. } => {
                if let Err(e) = save_artifact(&self.output, &name, &data).await {
                    tracing::error!("Failed to save {name}: {e:#}");
                }
            }
            SessionEvent::TransferFinished(summary) => {
                self.progress.finish(&summary);
                super::record_history(self.config, &self.peer, &summary);
                match summary.outcome() {
                    Ok(()) => self.received += 1,
                    Err(e) => {
                        tracing::debug!("{e}");
                        self.failed += 1;
                    }
                }
            }
            SessionEvent::Chat(text) => {
                if !self.quiet {
                    println!("  peer: {text}");
                }
            }
            SessionEvent::ConnectionChanged { to, .. } => {
                tracing::debug!(state = %to, "Connection changed");
                return matches!(to, ConnectionState::Disconnected | ConnectionState::Failed);
            }
        }
        false
    }
}

/// Run the receive command.
pub async fn run(args: ReceiveArgs) -> Result<()> {
    let config = super::load_config();
    let output = args.output.clone().unwrap_or_else(|| config.download_dir());

    let provider: Arc<dyn SinkProvider> = if args.memory {
        Arc::new(MemoryOnlyProvider)
    } else {
        Arc::new(DirectorySinkProvider::new(&output))
    };

    let listener = TcpListener::bind(("0.0.0.0", args.port))
        .await
        .with_context(|| format!("Failed to listen on port {}", args.port))?;

    ui::banner(args.quiet);
    if !args.quiet {
        println!("  Listening on port {}", args.port);
        println!("  Saving to {}", output.display());
        println!();
    }

    let (link, peer) = tokio::select! {
        accepted = tcp::accept(&listener, config.transfer.buffered_amount_low) => accepted?,
        _ = tokio::signal::ctrl_c() => {
            if !args.quiet {
                println!("  Stopped.");
            }
            return Ok(());
        }
    };
    drop(listener);

    if !args.quiet {
        println!("  Connected to {peer}");
        println!();
    }

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let session = Session::spawn(link, SessionConfig::from(&config), provider, events_tx);
    session.consumer_ready().await?;

    let mut receiver = Receiver {
        config: &config,
        peer: peer.to_string(),
        output,
        quiet: args.quiet,
        progress: ProgressLine::new(args.quiet),
        received: 0,
        failed: 0,
    };

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if receiver.handle(event).await {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    // Shutdown cancels whatever is still live; its summaries are queued by
    // the time the reply arrives.
    if let Err(e) = session.shutdown().await {
        tracing::debug!("Session already stopped: {e}");
    }
    while let Ok(event) = events.try_recv() {
        receiver.handle(event).await;
    }

    if !args.quiet {
        println!();
        println!(
            "  {} received, {} failed",
            receiver.received, receiver.failed
        );
        println!();
    }

    if receiver.failed > 0 {
        anyhow::bail!("{} transfers did not complete", receiver.failed);
    }
    Ok(())
}

/// Write an in-memory artifact into `dir`, refusing names that escape it.
async fn save_artifact(dir: &Path, name: &str, data: &[u8]) -> Result<PathBuf> {
    let path = sanitize_path(dir, Path::new(name))
        .with_context(|| format!("'{name}' escapes the output directory"))?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&path, data)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    tracing::info!(path = %path.display(), "Saved received file");
    Ok(path)
}
