//! Receive pipeline.
//!
//! Unlike the sender, a receive pipeline is not a task: it is plain state
//! driven by the session's dispatch loop, one chunk at a time.
//!
//! Ordering is enforced, never repaired. A chunk is written only when its
//! `seq` is the next one expected, its payload matches its CRC32 and its
//! length matches the chunk layout. Anything else is either dropped or
//! answered with a NACK, with at most one NACK outstanding at a time.

use crate::checksum::RunningCrc32;
use crate::error::Result;
use crate::protocol::ChunkPacket;
use crate::storage::{MemorySink, Sink, SinkOutcome, SinkProvider};

use super::{align_resume_offset, chunk_range, RateMeter, TransferDirection, TransferId, TransferInfo};

/// What the coordinator should do after a chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkOutcome {
    /// The chunk was written and state advanced
    pub advanced: bool,
    /// Ask the sender for this chunk
    pub nack: Option<u32>,
    /// Every byte has arrived
    pub complete: bool,
}

/// State of one incoming transfer.
#[derive(Debug)]
pub struct ReceivePipeline {
    info: TransferInfo,
    expected_seq: u32,
    sink: Sink,
    crc: RunningCrc32,
    rate: RateMeter,
    start_offset: u64,
    outstanding_nack: Option<u32>,
    max_seen_seq: Option<u32>,
}

impl ReceivePipeline {
    /// Register an offer and pick a destination.
    ///
    /// A resumable sink with an existing partial file resumes from the
    /// largest chunk boundary not past it. When no resumable sink is
    /// available the pipeline accumulates in memory from offset zero.
    pub async fn open(
        id: TransferId,
        name: &str,
        size: u64,
        chunk_size: u32,
        provider: &dyn SinkProvider,
    ) -> Self {
        let info = TransferInfo::new(id, name, size, chunk_size, TransferDirection::Receiving);

        let acquired = match provider.acquire(name, size) {
            Ok(Some(mut file)) => {
                let existing = file.existing_size();
                let offset = align_resume_offset(existing, chunk_size, size);
                match file.resume_at(offset).await {
                    Ok(crc) => Some((Sink::File(file), offset, crc)),
                    Err(e) => {
                        tracing::warn!(
                            transfer_id = %info.id,
                            "Could not prepare partial file, falling back to memory: {e}"
                        );
                        None
                    }
                }
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(
                    transfer_id = %info.id,
                    "Resumable destination unavailable, falling back to memory: {e}"
                );
                None
            }
        };

        let (sink, start_offset, crc) = acquired.unwrap_or_else(|| {
            (
                Sink::Memory(MemorySink::with_capacity(size)),
                0,
                RunningCrc32::new(),
            )
        });

        if start_offset > 0 {
            tracing::info!(
                transfer_id = %info.id,
                start_offset,
                "Resuming from partial file"
            );
        }

        let expected_seq = u32::try_from(start_offset / u64::from(chunk_size.max(1))).unwrap_or(u32::MAX);
        let mut info = info;
        info.transferred_bytes = start_offset;

        Self {
            info,
            expected_seq,
            sink,
            crc,
            rate: RateMeter::new(start_offset),
            start_offset,
            outstanding_nack: None,
            max_seen_seq: None,
        }
    }

    /// Offset to announce in `file-accept`.
    #[must_use]
    pub const fn start_offset(&self) -> u64 {
        self.start_offset
    }

    /// Live view of the transfer.
    #[must_use]
    pub const fn info(&self) -> &TransferInfo {
        &self.info
    }

    /// Next sequence number this pipeline will accept.
    #[must_use]
    pub const fn expected_seq(&self) -> u32 {
        self.expected_seq
    }

    /// Whether bytes accumulate in memory.
    #[must_use]
    pub const fn is_memory(&self) -> bool {
        self.sink.is_memory()
    }

    /// Whether every byte has arrived.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.info.transferred_bytes >= self.info.size
    }

    /// Finalized running CRC32 over everything received so far.
    #[must_use]
    pub const fn receiver_crc32(&self) -> u32 {
        self.crc.finalize()
    }

    /// Process one chunk addressed to this transfer.
    ///
    /// # Errors
    ///
    /// Returns an error only if writing to the sink fails.
    pub async fn on_chunk(&mut self, packet: ChunkPacket) -> Result<ChunkOutcome> {
        let seq = packet.seq;
        self.max_seen_seq = Some(self.max_seen_seq.map_or(seq, |m| m.max(seq)));

        if seq < self.expected_seq {
            tracing::debug!(transfer_id = %self.info.id, seq, expected = self.expected_seq, "Dropping duplicate chunk");
            return Ok(ChunkOutcome::default());
        }

        if seq > self.expected_seq {
            return Ok(self.request(self.expected_seq, "gap before chunk"));
        }

        let expected_len = chunk_range(seq, self.info.chunk_size, self.info.size).map(|(_, len)| len);
        if !packet.is_intact() || expected_len != Some(packet.payload.len()) {
            self.outstanding_nack = None;
            return Ok(self.request(seq, "corrupt chunk"));
        }

        self.sink.write(&packet.payload).await?;
        self.crc.update(&packet.payload);
        self.expected_seq += 1;

        let received = self.info.transferred_bytes + packet.payload.len() as u64;
        let throughput = self.rate.sample(received);
        self.info.advance_to(received, throughput);

        if self.outstanding_nack == Some(seq) {
            self.outstanding_nack = None;
        }

        let mut outcome = ChunkOutcome {
            advanced: true,
            nack: None,
            complete: self.is_complete(),
        };

        if !outcome.complete && self.max_seen_seq.is_some_and(|m| m >= self.expected_seq) {
            outcome.nack = self.request(self.expected_seq, "chunks dropped while recovering").nack;
        }

        Ok(outcome)
    }

    /// NACK `seq` unless a NACK for it is already outstanding.
    fn request(&mut self, seq: u32, why: &'static str) -> ChunkOutcome {
        if self.outstanding_nack == Some(seq) {
            return ChunkOutcome::default();
        }
        self.outstanding_nack = Some(seq);
        tracing::debug!(transfer_id = %self.info.id, seq, reason = why, "Requesting retransmission");
        ChunkOutcome {
            nack: Some(seq),
            ..ChunkOutcome::default()
        }
    }

    /// Close the sink and hand back the result with the final view.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink cannot be flushed.
    pub async fn finish(self) -> Result<(TransferInfo, SinkOutcome)> {
        let outcome = self.sink.close().await?;
        Ok((self.info, outcome))
    }

    /// Release the sink without materializing anything.
    pub async fn abort(self) -> TransferInfo {
        self.sink.discard().await;
        self.info
    }
}
