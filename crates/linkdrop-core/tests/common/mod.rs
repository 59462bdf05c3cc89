//! Common test utilities for `Linkdrop` integration tests.
//!
//! This module provides shared functionality for integration tests.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use linkdrop_core::channel::memory::MemoryLink;
use linkdrop_core::channel::WireMessage;
use linkdrop_core::events::SessionEvent;
use linkdrop_core::protocol::{classify_text, decode_chunk, ControlMessage, InboundText};
use linkdrop_core::session::{Session, SessionConfig, SessionHandle};
use linkdrop_core::storage::SinkProvider;
use linkdrop_core::transfer::{TransferId, TransferSummary};
use tokio::sync::mpsc;

/// Upper bound for any single wait in these tests.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Create a temporary directory for test files.
///
/// The directory will be automatically cleaned up when the returned
/// `TempDir` is dropped.
pub fn create_temp_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("Failed to create temp directory")
}

/// Create a test file with the given content.
pub fn create_test_file(dir: &std::path::Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("Failed to create parent directories");
    }
    std::fs::write(&path, content).expect("Failed to write test file");
    path
}

/// Generate random bytes for testing.
pub fn random_bytes(size: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut bytes = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Session config with a given chunk size and a short accept timeout.
pub fn config(chunk_size: u32) -> SessionConfig {
    let mut config = SessionConfig::default();
    config.transfer.chunk_size = chunk_size;
    config.transfer.accept_timeout = Duration::from_millis(500);
    config
}

/// Two connected sessions: A sends, B receives.
pub struct Pair {
    pub sender: SessionHandle,
    pub sender_events: mpsc::UnboundedReceiver<SessionEvent>,
    pub receiver: SessionHandle,
    pub receiver_events: mpsc::UnboundedReceiver<SessionEvent>,
}

/// Spawn both sessions over `link` and wait until both are connected.
pub async fn connect_pair(
    link: MemoryLink,
    sender_config: SessionConfig,
    sender_provider: Arc<dyn SinkProvider>,
    receiver_provider: Arc<dyn SinkProvider>,
) -> Pair {
    let (a, b) = link.connect();

    let (sender_tx, sender_events) = mpsc::unbounded_channel();
    let (receiver_tx, receiver_events) = mpsc::unbounded_channel();

    let sender = Session::spawn(a, sender_config, sender_provider, sender_tx);
    let receiver = Session::spawn(b, SessionConfig::default(), receiver_provider, receiver_tx);

    sender.consumer_ready().await.expect("sender ready");
    receiver.consumer_ready().await.expect("receiver ready");
    sender.wait_connected().await.expect("sender connected");
    receiver.wait_connected().await.expect("receiver connected");

    Pair {
        sender,
        sender_events,
        receiver,
        receiver_events,
    }
}

/// Wait for the summary of `id`, collecting every event seen on the way.
pub async fn wait_finished(
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    id: &TransferId,
) -> (TransferSummary, Vec<SessionEvent>) {
    let mut seen = Vec::new();
    let summary = tokio::time::timeout(TEST_TIMEOUT, async {
        loop {
            let event = events.recv().await.expect("session event");
            if let SessionEvent::TransferFinished(summary) = &event {
                if &summary.id == id {
                    return summary.clone();
                }
            }
            seen.push(event);
        }
    })
    .await
    .expect("transfer did not finish in time");
    (summary, seen)
}

/// Wait for the first summary of any transfer.
pub async fn wait_any_finished(
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
) -> (TransferSummary, Vec<SessionEvent>) {
    let mut seen = Vec::new();
    let summary = tokio::time::timeout(TEST_TIMEOUT, async {
        loop {
            let event = events.recv().await.expect("session event");
            if let SessionEvent::TransferFinished(summary) = event {
                return summary;
            }
            seen.push(event);
        }
    })
    .await
    .expect("transfer did not finish in time");
    (summary, seen)
}

/// Record of everything an interceptor saw.
#[derive(Debug, Default)]
pub struct Wiretap {
    pub chunks: Vec<(u32, usize)>,
    pub controls: Vec<ControlMessage>,
}

impl Wiretap {
    /// Chunk sequence numbers, in wire order.
    pub fn seqs(&self) -> Vec<u32> {
        self.chunks.iter().map(|(seq, _)| *seq).collect()
    }

    /// Chunk payload lengths, in wire order.
    pub fn payload_lengths(&self) -> Vec<usize> {
        self.chunks.iter().map(|(_, len)| *len).collect()
    }

    /// Control messages of one kind.
    pub fn count(&self, kind: &str) -> usize {
        self.controls.iter().filter(|m| m.kind() == kind).count()
    }
}

/// Record `message` into `tap`.
pub fn record(tap: &Arc<Mutex<Wiretap>>, message: &WireMessage) {
    let mut tap = tap.lock().expect("wiretap lock");
    match message {
        WireMessage::Binary(bytes) => {
            if let Ok(packet) = decode_chunk(bytes) {
                tap.chunks.push((packet.seq, packet.payload.len()));
            }
        }
        WireMessage::Text(text) => {
            if let InboundText::Control(control) = classify_text(text) {
                tap.controls.push(control);
            }
        }
    }
}
