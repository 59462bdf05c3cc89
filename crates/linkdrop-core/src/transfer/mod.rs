//! File transfer engine for Linkdrop.
//!
//! This module holds the per-transfer data model shared by both pipelines:
//!
//! - [`sender`]: streams chunks for an outgoing transfer and answers NACKs
//! - [`receiver`]: enforces ordering, verifies chunks and writes the sink
//! - [`coordinator`]: the id → pipeline registry and control dispatch
//!
//! ## Transfer Protocol
//!
//! - Default chunk size: 64 KiB, fixed for the lifetime of a transfer
//! - One active pipeline per id on each peer
//! - Checksum: CRC32 per chunk, running CRC32 over the whole file
//! - Completion is implicit: the receiver counts bytes and acknowledges

pub mod coordinator;
pub mod receiver;
pub mod sender;

pub use coordinator::{CoordinatorSettings, TransferCoordinator};

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{Error, Result};

/// Length of the random suffix in generated transfer ids.
const ID_SUFFIX_LEN: usize = 8;

const ID_SUFFIX_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Opaque transfer identifier, unique per direction per session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(String);

impl TransferId {
    /// Generate a fresh id from the current time plus a random suffix.
    #[must_use]
    pub fn generate() -> Self {
        use rand::Rng;

        let mut rng = rand::thread_rng();
        let suffix: String = (0..ID_SUFFIX_LEN)
            .map(|_| {
                let idx = rng.gen_range(0..ID_SUFFIX_CHARSET.len());
                ID_SUFFIX_CHARSET[idx] as char
            })
            .collect();

        Self(format!("{}-{suffix}", Utc::now().timestamp_millis()))
    }

    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TransferId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for TransferId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    /// This peer is sending
    Sending,
    /// This peer is receiving
    Receiving,
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sending => write!(f, "Sent"),
            Self::Receiving => write!(f, "Received"),
        }
    }
}

/// Transfer status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    /// Bytes are still flowing
    InProgress,
    /// All bytes arrived and checksums agree
    Completed,
    /// All bytes arrived but the end-to-end checksums differ
    ChecksumMismatch,
    /// Cancelled locally, by the peer, or by a closed channel
    Canceled,
}

impl TransferStatus {
    /// Whether the transfer has reached a terminal status.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InProgress => write!(f, "In progress"),
            Self::Completed => write!(f, "Completed"),
            Self::ChecksumMismatch => write!(f, "Checksum mismatch"),
            Self::Canceled => write!(f, "Canceled"),
        }
    }
}

/// Live view of one transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferInfo {
    /// Transfer id
    pub id: TransferId,
    /// File name
    pub name: String,
    /// Total size in bytes
    pub size: u64,
    /// Bytes per chunk
    pub chunk_size: u32,
    /// Which side of the transfer this peer is on
    pub direction: TransferDirection,
    /// Current status
    pub status: TransferStatus,
    /// Bytes sent or received so far, including resumed bytes
    pub transferred_bytes: u64,
    /// Most recent throughput sample in bytes per second
    pub throughput_bps: u64,
}

impl TransferInfo {
    /// Create the view for a transfer that has just been registered.
    #[must_use]
    pub fn new(
        id: TransferId,
        name: impl Into<String>,
        size: u64,
        chunk_size: u32,
        direction: TransferDirection,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            size,
            chunk_size,
            direction,
            status: TransferStatus::InProgress,
            transferred_bytes: 0,
            throughput_bps: 0,
        }
    }

    /// Fraction of the file transferred, clamped to `[0, 1]`.
    ///
    /// An empty file counts as fully transferred.
    #[must_use]
    pub fn progress(&self) -> f64 {
        if self.size == 0 {
            return 1.0;
        }
        (self.transferred_bytes as f64 / self.size as f64).clamp(0.0, 1.0)
    }

    /// Number of chunk packets a full transfer of this file emits.
    #[must_use]
    pub fn chunk_count(&self) -> u64 {
        chunk_count(self.size, self.chunk_size)
    }

    /// Record a new byte count. Never moves backwards.
    pub fn advance_to(&mut self, bytes: u64, throughput_bps: u64) {
        if bytes > self.transferred_bytes {
            self.transferred_bytes = bytes;
        }
        self.throughput_bps = throughput_bps;
    }
}

/// Number of chunks needed for `size` bytes: `ceil(size / chunk_size)`.
#[must_use]
pub fn chunk_count(size: u64, chunk_size: u32) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    size.div_ceil(u64::from(chunk_size))
}

/// Byte range `(offset, len)` covered by chunk `seq`.
///
/// Returns `None` when `seq` lies past the end of the file.
#[must_use]
pub fn chunk_range(seq: u32, chunk_size: u32, size: u64) -> Option<(u64, usize)> {
    if chunk_size == 0 {
        return None;
    }
    let offset = u64::from(seq) * u64::from(chunk_size);
    if offset >= size {
        return None;
    }
    let len = (size - offset).min(u64::from(chunk_size));
    usize::try_from(len).ok().map(|len| (offset, len))
}

/// Round a resume offset down to a chunk boundary.
///
/// Offsets past the end of the file restart from zero.
#[must_use]
pub fn align_resume_offset(offset: u64, chunk_size: u32, size: u64) -> u64 {
    if chunk_size == 0 || offset > size {
        return 0;
    }
    offset - offset % u64::from(chunk_size)
}

/// Instantaneous throughput from successive byte counts.
///
/// Each sample is `(Δbytes · 1000) / max(1, Δms)`.
#[derive(Debug, Clone)]
pub struct RateMeter {
    last_measure_time: Instant,
    last_measured_bytes: u64,
    rate_bps: u64,
}

impl RateMeter {
    /// Start measuring from `bytes` at the current instant.
    #[must_use]
    pub fn new(bytes: u64) -> Self {
        Self::starting_at(Instant::now(), bytes)
    }

    /// Start measuring from `bytes` at `now`.
    #[must_use]
    pub const fn starting_at(now: Instant, bytes: u64) -> Self {
        Self {
            last_measure_time: now,
            last_measured_bytes: bytes,
            rate_bps: 0,
        }
    }

    /// Take a sample at the current instant.
    pub fn sample(&mut self, bytes: u64) -> u64 {
        self.sample_at(Instant::now(), bytes)
    }

    /// Take a sample at `now` and return the throughput in bytes per second.
    pub fn sample_at(&mut self, now: Instant, bytes: u64) -> u64 {
        let elapsed_ms = now.duration_since(self.last_measure_time).as_millis();
        let elapsed_ms = u64::try_from(elapsed_ms).unwrap_or(u64::MAX).max(1);
        let delta = bytes.saturating_sub(self.last_measured_bytes);

        self.rate_bps = delta.saturating_mul(1000) / elapsed_ms;
        self.last_measure_time = now;
        self.last_measured_bytes = bytes;
        self.rate_bps
    }

    /// The most recent sample.
    #[must_use]
    pub const fn rate_bps(&self) -> u64 {
        self.rate_bps
    }
}

/// Record of a transfer that reached a terminal status.
///
/// Kept after the live state is released so it can be shown in history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSummary {
    /// Transfer id
    pub id: TransferId,
    /// File name
    pub name: String,
    /// Total size in bytes
    pub size: u64,
    /// Which side of the transfer this peer was on
    pub direction: TransferDirection,
    /// Terminal status
    pub status: TransferStatus,
    /// Bytes transferred when the transfer ended
    pub transferred_bytes: u64,
    /// Offset the transfer resumed from (0 for a fresh transfer)
    pub resumed_from: u64,
    /// This peer's finalized running CRC32, when computed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_crc32: Option<u32>,
    /// The peer's finalized running CRC32, when reported
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_crc32: Option<u32>,
    /// Where the received file was written, if on disk
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saved_to: Option<PathBuf>,
    /// Cancellation reason, if canceled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// When the transfer ended
    pub finished_at: DateTime<Utc>,
}

impl TransferSummary {
    /// Summarize `info` with a terminal `status`.
    #[must_use]
    pub fn from_info(info: &TransferInfo, status: TransferStatus) -> Self {
        Self {
            id: info.id.clone(),
            name: info.name.clone(),
            size: info.size,
            direction: info.direction,
            status,
            transferred_bytes: info.transferred_bytes,
            resumed_from: 0,
            local_crc32: None,
            remote_crc32: None,
            saved_to: None,
            reason: None,
            finished_at: Utc::now(),
        }
    }

    /// Set the resume offset.
    #[must_use]
    pub const fn with_resumed_from(mut self, offset: u64) -> Self {
        self.resumed_from = offset;
        self
    }

    /// Set the checksums seen at completion.
    #[must_use]
    pub const fn with_checksums(mut self, local: Option<u32>, remote: Option<u32>) -> Self {
        self.local_crc32 = local;
        self.remote_crc32 = remote;
        self
    }

    /// Set the on-disk destination.
    #[must_use]
    pub fn with_saved_to(mut self, path: Option<PathBuf>) -> Self {
        self.saved_to = path;
        self
    }

    /// Set the cancellation reason.
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// The failure this summary records, if any.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChecksumMismatch`] or [`Error::TransferCancelled`]
    /// for the matching terminal status.
    pub fn outcome(&self) -> Result<()> {
        match self.status {
            TransferStatus::Completed | TransferStatus::InProgress => Ok(()),
            TransferStatus::ChecksumMismatch => Err(Error::ChecksumMismatch {
                id: self.id.clone(),
                local: self.local_crc32.unwrap_or_default(),
                remote: self.remote_crc32.unwrap_or_default(),
            }),
            TransferStatus::Canceled => Err(Error::TransferCancelled {
                id: self.id.clone(),
                reason: self.reason.clone().unwrap_or_default(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn summary(status: TransferStatus) -> TransferSummary {
        let info = TransferInfo::new(
            TransferId::from("t-9"),
            "a.bin",
            10,
            4,
            TransferDirection::Sending,
        );
        TransferSummary::from_info(&info, status)
    }

    #[test]
    fn test_summary_outcome() {
        assert!(summary(TransferStatus::Completed).outcome().is_ok());

        let mismatch = summary(TransferStatus::ChecksumMismatch)
            .with_checksums(Some(7), Some(9))
            .outcome();
        assert!(matches!(
            mismatch,
            Err(Error::ChecksumMismatch { local: 7, remote: 9, .. })
        ));

        let canceled = summary(TransferStatus::Canceled)
            .with_reason("user")
            .outcome();
        match canceled {
            Err(Error::TransferCancelled { id, reason }) => {
                assert_eq!(id.as_str(), "t-9");
                assert_eq!(reason, "user");
            }
            other => panic!("expected TransferCancelled, got {other:?}"),
        }
    }

    #[test]
    fn test_generated_ids_are_distinct() {
        let a = TransferId::generate();
        let b = TransferId::generate();
        assert_ne!(a, b);

        let (millis, suffix) = a.as_str().split_once('-').expect("timestamp-suffix");
        assert!(millis.parse::<i64>().is_ok());
        assert_eq!(suffix.len(), ID_SUFFIX_LEN);
    }

    #[test]
    fn test_chunk_math_for_reference_file() {
        let size = 200_000;
        let chunk_size = 65_536;

        assert_eq!(chunk_count(size, chunk_size), 4);

        let lens: Vec<usize> = (0..4)
            .map(|seq| chunk_range(seq, chunk_size, size).expect("in range").1)
            .collect();
        assert_eq!(lens, vec![65_536, 65_536, 65_536, 3_392]);
        assert_eq!(chunk_range(4, chunk_size, size), None);
        assert_eq!(chunk_range(1, chunk_size, size), Some((65_536, 65_536)));
    }

    #[test]
    fn test_chunk_count_edges() {
        assert_eq!(chunk_count(0, 1024), 0);
        assert_eq!(chunk_count(1024, 1024), 1);
        assert_eq!(chunk_count(1025, 1024), 2);
        assert_eq!(chunk_count(10, 0), 0);
    }

    #[test]
    fn test_align_resume_offset() {
        assert_eq!(align_resume_offset(65_536, 65_536, 200_000), 65_536);
        assert_eq!(align_resume_offset(70_000, 65_536, 200_000), 65_536);
        assert_eq!(align_resume_offset(200_000, 65_536, 200_000), 196_608);
        assert_eq!(align_resume_offset(300_000, 65_536, 200_000), 0);
        assert_eq!(align_resume_offset(10, 0, 200_000), 0);
    }

    #[test]
    fn test_progress_is_clamped() {
        let mut info = TransferInfo::new(
            TransferId::from("t"),
            "a.bin",
            100,
            10,
            TransferDirection::Receiving,
        );
        assert!((info.progress() - 0.0).abs() < f64::EPSILON);

        info.advance_to(50, 0);
        assert!((info.progress() - 0.5).abs() < f64::EPSILON);

        info.advance_to(40, 0);
        assert_eq!(info.transferred_bytes, 50);

        info.advance_to(150, 0);
        assert!((info.progress() - 1.0).abs() < f64::EPSILON);

        let empty = TransferInfo::new(
            TransferId::from("e"),
            "empty",
            0,
            10,
            TransferDirection::Sending,
        );
        assert!((empty.progress() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_rate_meter() {
        let start = Instant::now();
        let mut meter = RateMeter::starting_at(start, 0);

        let rate = meter.sample_at(start + Duration::from_millis(500), 1_000_000);
        assert_eq!(rate, 2_000_000);

        // Same instant: Δms is clamped to 1
        let rate = meter.sample_at(start + Duration::from_millis(500), 1_000_100);
        assert_eq!(rate, 100_000);
        assert_eq!(meter.rate_bps(), 100_000);
    }

    #[test]
    fn test_status_terminal() {
        assert!(!TransferStatus::InProgress.is_terminal());
        assert!(TransferStatus::Completed.is_terminal());
        assert!(TransferStatus::ChecksumMismatch.is_terminal());
        assert!(TransferStatus::Canceled.is_terminal());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&TransferStatus::ChecksumMismatch).expect("serialize");
        assert_eq!(json, "\"checksum_mismatch\"");
    }
}
