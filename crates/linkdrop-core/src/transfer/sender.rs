//! Send pipeline.
//!
//! Each started outgoing transfer runs as its own task. The task owns the
//! source stream, the running CRC32 and the rate meter; the coordinator
//! talks to it only through [`SenderCommand`]s and a cancellation token,
//! and hears back through [`PipelineEvent`]s.
//!
//! The task suspends in exactly two places, both cancelable: waiting for
//! the channel's buffered amount to drain and waiting for the next read.

use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{chunk_range, RateMeter, TransferId};
use crate::channel::Channel;
use crate::checksum::RunningCrc32;
use crate::error::Error;
use crate::protocol::encode_chunk;
use crate::storage::{SourceReader, TransferSource};

/// Instructions from the coordinator to a running send task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderCommand {
    /// Retransmit one chunk
    Nack(u32),
    /// The receiver has everything; compare checksums
    CompleteAck(u32),
}

/// How a send task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Both running checksums agree
    Verified {
        /// The shared checksum
        crc32: u32,
    },
    /// The receiver's checksum differs from ours
    Mismatch {
        /// Sender's checksum
        local: u32,
        /// Receiver's checksum
        remote: u32,
    },
    /// The task could not continue
    Aborted(String),
}

/// Reports from pipeline tasks and timers back to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// The accept timer for an offer fired
    AcceptTimeout(TransferId),
    /// More bytes of a transfer went out
    SendProgress {
        /// Transfer id
        id: TransferId,
        /// Stream offset reached
        bytes: u64,
        /// Throughput sample in bytes per second
        throughput_bps: u64,
    },
    /// A send task finished on its own
    SendFinished {
        /// Transfer id
        id: TransferId,
        /// Result
        outcome: SendOutcome,
    },
}

/// Handle the coordinator keeps for a running send task.
#[derive(Debug)]
pub struct SendTaskHandle {
    commands: mpsc::UnboundedSender<SenderCommand>,
    cancel: CancellationToken,
}

impl SendTaskHandle {
    /// Forward a command. Lost silently if the task already ended.
    pub fn command(&self, command: SenderCommand) {
        let _ = self.commands.send(command);
    }

    /// Stop the task before it emits another chunk.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Everything a send task needs.
#[derive(Debug)]
pub struct SendTask {
    id: TransferId,
    source: Arc<dyn TransferSource>,
    size: u64,
    chunk_size: u32,
    start_offset: u64,
    channel: Channel,
    events: mpsc::UnboundedSender<PipelineEvent>,
}

impl SendTask {
    /// Describe a send task starting at `start_offset`.
    ///
    /// `start_offset` must already be aligned to `chunk_size`.
    #[must_use]
    pub fn new(
        id: TransferId,
        source: Arc<dyn TransferSource>,
        chunk_size: u32,
        start_offset: u64,
        channel: Channel,
        events: mpsc::UnboundedSender<PipelineEvent>,
    ) -> Self {
        let size = source.size();
        Self {
            id,
            source,
            size,
            chunk_size,
            start_offset,
            channel,
            events,
        }
    }

    /// Spawn the task and return its handle.
    pub fn spawn(self) -> SendTaskHandle {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let runner = SendRunner {
            crc: RunningCrc32::new(),
            offset: 0,
            seq: 0,
            rate: RateMeter::new(self.start_offset),
            commands,
            cancel: cancel.clone(),
            task: self,
        };
        tokio::spawn(runner.run());

        SendTaskHandle {
            commands: commands_tx,
            cancel,
        }
    }
}

/// Why a send stage stopped early.
enum Stop {
    Cancelled,
    Failed(Error),
}

impl From<Error> for Stop {
    fn from(e: Error) -> Self {
        Self::Failed(e)
    }
}

impl From<std::io::Error> for Stop {
    fn from(e: std::io::Error) -> Self {
        Self::Failed(Error::Io(e))
    }
}

struct SendRunner {
    task: SendTask,
    crc: RunningCrc32,
    offset: u64,
    seq: u32,
    rate: RateMeter,
    commands: mpsc::UnboundedReceiver<SenderCommand>,
    cancel: CancellationToken,
}

impl SendRunner {
    async fn run(mut self) {
        let id = self.task.id.clone();

        let outcome = match self.drive().await {
            Ok(outcome) => outcome,
            Err(Stop::Cancelled) => {
                tracing::debug!(transfer_id = %id, "Send task cancelled");
                return;
            }
            Err(Stop::Failed(Error::ChannelClosed)) => {
                tracing::debug!(transfer_id = %id, "Channel closed under send task");
                return;
            }
            Err(Stop::Failed(e)) => {
                tracing::warn!(transfer_id = %id, "Send task failed: {e}");
                SendOutcome::Aborted(e.to_string())
            }
        };

        let _ = self
            .task
            .events
            .send(PipelineEvent::SendFinished { id, outcome });
    }

    async fn drive(&mut self) -> std::result::Result<SendOutcome, Stop> {
        let mut reader = self.task.source.open_stream()?;

        self.skip_to_start(&mut reader).await?;

        tracing::info!(
            transfer_id = %self.task.id,
            start_offset = self.offset,
            first_seq = self.seq,
            "Streaming chunks"
        );

        let mut buf = vec![0u8; self.task.chunk_size as usize];
        loop {
            while let Ok(command) = self.commands.try_recv() {
                match command {
                    SenderCommand::Nack(seq) => self.retransmit(seq).await?,
                    SenderCommand::CompleteAck(remote) => {
                        tracing::debug!(
                            transfer_id = %self.task.id,
                            offset = self.offset,
                            "Completion acknowledged before stream end"
                        );
                        self.fold_remainder(&mut reader, &mut buf).await?;
                        return Ok(self.verdict(remote));
                    }
                }
            }

            let n = self.read_chunk(&mut reader, &mut buf).await?;
            if n == 0 {
                break;
            }

            self.wait_buffer().await?;
            self.task
                .channel
                .send_binary(encode_chunk(&self.task.id, self.seq, &buf[..n]))?;

            self.crc.update(&buf[..n]);
            self.offset += n as u64;
            self.seq += 1;

            let throughput_bps = self.rate.sample(self.offset);
            let _ = self.task.events.send(PipelineEvent::SendProgress {
                id: self.task.id.clone(),
                bytes: self.offset,
                throughput_bps,
            });
        }

        tracing::debug!(
            transfer_id = %self.task.id,
            chunks = self.seq,
            bytes = self.offset,
            "Stream exhausted; awaiting acknowledgement"
        );

        loop {
            let command = tokio::select! {
                () = self.cancel.cancelled() => return Err(Stop::Cancelled),
                command = self.commands.recv() => command,
            };
            match command {
                Some(SenderCommand::Nack(seq)) => self.retransmit(seq).await?,
                Some(SenderCommand::CompleteAck(remote)) => return Ok(self.verdict(remote)),
                None => return Err(Stop::Cancelled),
            }
        }
    }

    /// Skip `start_offset` bytes of the stream, folding them into the CRC
    /// so the final checksum still covers the whole file.
    async fn skip_to_start(&mut self, reader: &mut SourceReader) -> std::result::Result<(), Stop> {
        let target = self.task.start_offset;
        if target == 0 {
            return Ok(());
        }

        let mut buf = vec![0u8; self.task.chunk_size as usize];
        while self.offset < target {
            let want = usize::try_from(target - self.offset)
                .unwrap_or(usize::MAX)
                .min(buf.len());
            let n = tokio::select! {
                () = self.cancel.cancelled() => return Err(Stop::Cancelled),
                n = reader.read(&mut buf[..want]) => n?,
            };
            if n == 0 {
                return Err(Stop::Failed(Error::InvalidInput(format!(
                    "source ended at {} before resume offset {target}",
                    self.offset
                ))));
            }
            self.crc.update(&buf[..n]);
            self.offset += n as u64;
        }

        self.seq = u32::try_from(target / u64::from(self.task.chunk_size))
            .map_err(|_| Error::InvalidInput(format!("resume offset {target} is out of range")))?;
        Ok(())
    }

    /// Fill `buf` up to one chunk, or less at end of stream.
    async fn read_chunk(
        &self,
        reader: &mut SourceReader,
        buf: &mut [u8],
    ) -> std::result::Result<usize, Stop> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = tokio::select! {
                () = self.cancel.cancelled() => return Err(Stop::Cancelled),
                n = reader.read(&mut buf[filled..]) => n?,
            };
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    async fn wait_buffer(&self) -> std::result::Result<(), Stop> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(Stop::Cancelled),
            ready = self.task.channel.wait_buffered_low() => ready?,
        }
        if self.cancel.is_cancelled() {
            return Err(Stop::Cancelled);
        }
        Ok(())
    }

    /// Re-read chunk `seq` from the source independently of the stream
    /// cursor and send it again.
    async fn retransmit(&mut self, seq: u32) -> std::result::Result<(), Stop> {
        let Some((offset, len)) = chunk_range(seq, self.task.chunk_size, self.task.size) else {
            tracing::warn!(transfer_id = %self.task.id, seq, "NACK for a chunk past the end of the file");
            return Ok(());
        };

        let mut payload = vec![0u8; len];
        let mut reader = self.task.source.open_range(offset, len as u64)?;
        tokio::select! {
            () = self.cancel.cancelled() => return Err(Stop::Cancelled),
            read = reader.read_exact(&mut payload) => { read?; }
        }

        self.wait_buffer().await?;
        self.task
            .channel
            .send_binary(encode_chunk(&self.task.id, seq, &payload))?;

        tracing::debug!(transfer_id = %self.task.id, seq, bytes = len, "Retransmitted chunk");
        Ok(())
    }

    /// Fold the unsent rest of the stream into the CRC.
    async fn fold_remainder(
        &mut self,
        reader: &mut SourceReader,
        buf: &mut [u8],
    ) -> std::result::Result<(), Stop> {
        loop {
            let n = self.read_chunk(reader, buf).await?;
            if n == 0 {
                return Ok(());
            }
            self.crc.update(&buf[..n]);
            self.offset += n as u64;
        }
    }

    fn verdict(&self, remote: u32) -> SendOutcome {
        let local = self.crc.finalize();
        if local == remote {
            tracing::info!(
                transfer_id = %self.task.id,
                crc32 = local,
                "End-to-end checksum verified"
            );
            SendOutcome::Verified { crc32: local }
        } else {
            tracing::warn!(
                transfer_id = %self.task.id,
                local,
                remote,
                "End-to-end checksum mismatch"
            );
            SendOutcome::Mismatch { local, remote }
        }
    }
}
