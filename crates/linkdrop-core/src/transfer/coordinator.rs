//! Transfer coordinator.
//!
//! A single-owner registry from transfer id to pipeline state. Every
//! inbound control message, chunk packet and pipeline report for every
//! transfer goes through one `&mut self` method here, called from the
//! session's dispatch loop, so the registry needs no locking.
//!
//! At most one pipeline exists per id on this peer. A terminal transfer is
//! removed from the registry and survives only as a [`TransferSummary`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::receiver::ReceivePipeline;
use super::sender::{PipelineEvent, SendOutcome, SendTask, SendTaskHandle, SenderCommand};
use super::{
    align_resume_offset, TransferDirection, TransferId, TransferInfo, TransferStatus,
    TransferSummary,
};
use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::events::{EventDispatcher, SessionEvent};
use crate::protocol::{decode_chunk, ControlMessage};
use crate::storage::{SinkOutcome, SinkProvider, TransferSource};

/// Reason recorded for transfers torn down by a closed channel.
pub const CHANNEL_CLOSED_REASON: &str = "channel closed";

/// Tunables for the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Chunk size announced in new offers
    pub chunk_size: u32,
    /// How long an offer waits for `file-accept` before sending anyway
    pub accept_timeout: Duration,
    /// Terminal transfers kept in memory
    pub history_limit: usize,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            chunk_size: crate::DEFAULT_CHUNK_SIZE,
            accept_timeout: crate::DEFAULT_ACCEPT_TIMEOUT,
            history_limit: 100,
        }
    }
}

#[derive(Debug)]
struct SendSlot {
    info: TransferInfo,
    source: Arc<dyn TransferSource>,
    started: bool,
    resumed_from: u64,
    task: Option<SendTaskHandle>,
    timer: Option<JoinHandle<()>>,
}

#[derive(Debug)]
enum Slot {
    Sending(SendSlot),
    Receiving(ReceivePipeline),
}

impl Slot {
    const fn info(&self) -> &TransferInfo {
        match self {
            Self::Sending(slot) => &slot.info,
            Self::Receiving(pipeline) => pipeline.info(),
        }
    }
}

/// The id → pipeline registry.
#[derive(Debug)]
pub struct TransferCoordinator {
    slots: HashMap<TransferId, Slot>,
    channel: Channel,
    provider: Arc<dyn SinkProvider>,
    settings: CoordinatorSettings,
    pipeline_tx: mpsc::UnboundedSender<PipelineEvent>,
    history: VecDeque<TransferSummary>,
}

impl TransferCoordinator {
    /// Create a coordinator sending over `channel`.
    ///
    /// Send tasks and accept timers report on `pipeline_tx`; the owner must
    /// feed those reports back through [`TransferCoordinator::on_pipeline`].
    #[must_use]
    pub fn new(
        channel: Channel,
        provider: Arc<dyn SinkProvider>,
        settings: CoordinatorSettings,
        pipeline_tx: mpsc::UnboundedSender<PipelineEvent>,
    ) -> Self {
        Self {
            slots: HashMap::new(),
            channel,
            provider,
            settings,
            pipeline_tx,
            history: VecDeque::new(),
        }
    }

    /// Live transfers, in no particular order.
    #[must_use]
    pub fn active(&self) -> Vec<TransferInfo> {
        self.slots.values().map(|slot| slot.info().clone()).collect()
    }

    /// Whether `id` has a live pipeline.
    #[must_use]
    pub fn is_active(&self, id: &TransferId) -> bool {
        self.slots.contains_key(id)
    }

    /// Terminal transfers, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<TransferSummary> {
        self.history.iter().cloned().collect()
    }

    /// Announce `source` to the peer and arm the accept timer.
    ///
    /// # Errors
    ///
    /// Returns an error if the offer cannot be sent.
    pub fn offer(&mut self, source: Arc<dyn TransferSource>) -> Result<TransferId> {
        let mut id = TransferId::generate();
        while self.slots.contains_key(&id) {
            id = TransferId::generate();
        }

        let chunk_size = self.settings.chunk_size;
        let info = TransferInfo::new(
            id.clone(),
            source.name(),
            source.size(),
            chunk_size,
            TransferDirection::Sending,
        );

        self.send_control(&ControlMessage::FileOffer {
            id: id.clone(),
            name: info.name.clone(),
            size: info.size,
            chunk_size,
        })?;

        let timer = {
            let id = id.clone();
            let tx = self.pipeline_tx.clone();
            let wait = self.settings.accept_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(wait).await;
                let _ = tx.send(PipelineEvent::AcceptTimeout(id));
            })
        };

        tracing::info!(
            transfer_id = %id,
            name = %info.name,
            size = info.size,
            chunk_size,
            "Offered file"
        );

        self.slots.insert(
            id.clone(),
            Slot::Sending(SendSlot {
                info,
                source,
                started: false,
                resumed_from: 0,
                task: None,
                timer: Some(timer),
            }),
        );

        Ok(id)
    }

    /// Dispatch an inbound control message.
    pub async fn on_control(&mut self, message: ControlMessage, events: &mut EventDispatcher) {
        tracing::debug!(kind = message.kind(), transfer_id = %message.transfer_id(), "Control message");

        match message {
            ControlMessage::FileOffer {
                id,
                name,
                size,
                chunk_size,
            } => self.on_offer(id, &name, size, chunk_size, events).await,
            ControlMessage::FileAccept { id, start_offset } => self.on_accept(&id, start_offset),
            ControlMessage::ChunkNack { id, seq } => {
                self.forward(&id, SenderCommand::Nack(seq));
            }
            ControlMessage::FileCompleteAck { id, receiver_crc32 } => {
                self.forward(&id, SenderCommand::CompleteAck(receiver_crc32));
            }
            ControlMessage::FileCancel { id, reason } => {
                if let Some(slot) = self.slots.remove(&id) {
                    tracing::info!(transfer_id = %id, %reason, "Peer cancelled transfer");
                    self.teardown(slot, &reason, events).await;
                } else {
                    tracing::debug!(transfer_id = %id, "Cancel for inactive transfer");
                }
            }
        }
    }

    /// Dispatch an inbound binary frame.
    ///
    /// Undecodable frames and chunks for unknown transfers are dropped.
    pub async fn on_binary(&mut self, bytes: &[u8], events: &mut EventDispatcher) {
        let packet = match decode_chunk(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::debug!(len = bytes.len(), "Dropping undecodable binary frame: {e}");
                return;
            }
        };

        let id = packet.id.clone();
        let result = match self.slots.get_mut(&id) {
            Some(Slot::Receiving(pipeline)) => pipeline
                .on_chunk(packet)
                .await
                .map(|outcome| (outcome, pipeline.info().clone())),
            _ => {
                tracing::debug!(transfer_id = %id, seq = packet.seq, "Dropping chunk for inactive transfer");
                return;
            }
        };

        match result {
            Ok((outcome, info)) => {
                if let Some(seq) = outcome.nack {
                    if let Err(e) = self.send_control(&ControlMessage::ChunkNack {
                        id: id.clone(),
                        seq,
                    }) {
                        tracing::debug!(transfer_id = %id, "Could not send NACK: {e}");
                    }
                }
                if outcome.advanced {
                    let progress = info.progress();
                    events.emit(SessionEvent::Progress { info, progress });
                }
                if outcome.complete {
                    if let Some(Slot::Receiving(pipeline)) = self.slots.remove(&id) {
                        self.finish_receive(pipeline, events).await;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(transfer_id = %id, "Failed to write chunk: {e}");
                let reason = format!("receiver write failed: {e}");
                let _ = self.cancel(&id, &reason, events).await;
            }
        }
    }

    /// Dispatch a report from a send task or accept timer.
    pub async fn on_pipeline(&mut self, event: PipelineEvent, events: &mut EventDispatcher) {
        match event {
            PipelineEvent::AcceptTimeout(id) => {
                let channel = &self.channel;
                let tx = &self.pipeline_tx;
                if let Some(Slot::Sending(slot)) = self.slots.get_mut(&id) {
                    if !slot.started {
                        tracing::warn!(
                            transfer_id = %id,
                            timeout_ms = self.settings.accept_timeout.as_millis(),
                            "No file-accept received; sending from the start"
                        );
                        start_send(&id, slot, 0, channel, tx);
                    }
                }
            }
            PipelineEvent::SendProgress {
                id,
                bytes,
                throughput_bps,
            } => {
                if let Some(Slot::Sending(slot)) = self.slots.get_mut(&id) {
                    slot.info.advance_to(bytes, throughput_bps);
                    let info = slot.info.clone();
                    let progress = info.progress();
                    events.emit(SessionEvent::Progress { info, progress });
                }
            }
            PipelineEvent::SendFinished { id, outcome } => {
                let Some(Slot::Sending(mut slot)) = self.slots.remove(&id) else {
                    return;
                };
                if let Some(timer) = slot.timer.take() {
                    timer.abort();
                }

                let summary = match outcome {
                    SendOutcome::Verified { crc32 } => {
                        slot.info.advance_to(slot.info.size, slot.info.throughput_bps);
                        TransferSummary::from_info(&slot.info, TransferStatus::Completed)
                            .with_checksums(Some(crc32), Some(crc32))
                    }
                    SendOutcome::Mismatch { local, remote } => {
                        slot.info.advance_to(slot.info.size, slot.info.throughput_bps);
                        TransferSummary::from_info(&slot.info, TransferStatus::ChecksumMismatch)
                            .with_checksums(Some(local), Some(remote))
                    }
                    SendOutcome::Aborted(reason) => {
                        let _ = self.send_control(&ControlMessage::FileCancel {
                            id: id.clone(),
                            reason: reason.clone(),
                        });
                        TransferSummary::from_info(&slot.info, TransferStatus::Canceled)
                            .with_reason(reason)
                    }
                };

                self.record(summary.with_resumed_from(slot.resumed_from), events);
            }
        }
    }

    /// Cancel a live transfer in either direction.
    ///
    /// Notifies the peer with `file-cancel` and tears down local state.
    /// Returns `false`, doing nothing, if `id` is not live.
    pub async fn cancel(
        &mut self,
        id: &TransferId,
        reason: &str,
        events: &mut EventDispatcher,
    ) -> bool {
        let Some(slot) = self.slots.remove(id) else {
            tracing::debug!(transfer_id = %id, "Cancel for inactive transfer");
            return false;
        };

        if let Err(e) = self.send_control(&ControlMessage::FileCancel {
            id: id.clone(),
            reason: reason.to_string(),
        }) {
            tracing::debug!(transfer_id = %id, "Could not notify peer of cancel: {e}");
        }

        tracing::info!(transfer_id = %id, %reason, "Cancelled transfer");
        self.teardown(slot, reason, events).await;
        true
    }

    /// Tear down every live transfer after the channel closed.
    ///
    /// The peer is not notified; partial files stay on disk for resume.
    pub async fn on_channel_closed(&mut self, events: &mut EventDispatcher) {
        let ids: Vec<TransferId> = self.slots.keys().cloned().collect();
        if !ids.is_empty() {
            tracing::warn!(count = ids.len(), "Channel closed with transfers in flight");
        }
        for id in ids {
            if let Some(slot) = self.slots.remove(&id) {
                self.teardown(slot, CHANNEL_CLOSED_REASON, events).await;
            }
        }
    }

    async fn on_offer(
        &mut self,
        id: TransferId,
        name: &str,
        size: u64,
        chunk_size: u32,
        events: &mut EventDispatcher,
    ) {
        if self.slots.contains_key(&id) {
            tracing::warn!("{}", Error::DuplicateTransfer(id));
            return;
        }

        if chunk_size == 0 {
            tracing::warn!(transfer_id = %id, "Rejecting offer with zero chunk size");
            let _ = self.send_control(&ControlMessage::FileCancel {
                id,
                reason: "invalid chunk size".to_string(),
            });
            return;
        }

        let pipeline =
            ReceivePipeline::open(id.clone(), name, size, chunk_size, self.provider.as_ref()).await;

        tracing::info!(
            transfer_id = %id,
            %name,
            size,
            chunk_size,
            start_offset = pipeline.start_offset(),
            memory = pipeline.is_memory(),
            "Accepting offer"
        );
        events.emit(SessionEvent::OfferReceived(pipeline.info().clone()));

        if let Err(e) = self.send_control(&ControlMessage::FileAccept {
            id: id.clone(),
            start_offset: pipeline.start_offset(),
        }) {
            tracing::debug!(transfer_id = %id, "Could not send file-accept: {e}");
        }

        if pipeline.is_complete() {
            self.finish_receive(pipeline, events).await;
        } else {
            self.slots.insert(id, Slot::Receiving(pipeline));
        }
    }

    fn on_accept(&mut self, id: &TransferId, start_offset: u64) {
        let channel = &self.channel;
        let tx = &self.pipeline_tx;
        match self.slots.get_mut(id) {
            Some(Slot::Sending(slot)) if !slot.started => {
                start_send(id, slot, start_offset, channel, tx);
            }
            Some(Slot::Sending(_)) => {
                tracing::debug!(transfer_id = %id, "file-accept after sending started; ignoring");
            }
            _ => tracing::debug!(transfer_id = %id, "file-accept for unknown outgoing transfer"),
        }
    }

    fn forward(&self, id: &TransferId, command: SenderCommand) {
        match self.slots.get(id) {
            Some(Slot::Sending(SendSlot {
                task: Some(task), ..
            })) => task.command(command),
            Some(Slot::Sending(_)) => {
                tracing::warn!(transfer_id = %id, ?command, "Command for a transfer that has not started");
            }
            _ => tracing::debug!(transfer_id = %id, ?command, "Command for unknown outgoing transfer"),
        }
    }

    async fn finish_receive(&mut self, pipeline: ReceivePipeline, events: &mut EventDispatcher) {
        let crc = pipeline.receiver_crc32();
        let resumed_from = pipeline.start_offset();
        let snapshot = pipeline.info().clone();
        let id = snapshot.id.clone();

        match pipeline.finish().await {
            Ok((info, outcome)) => {
                if let Err(e) = self.send_control(&ControlMessage::FileCompleteAck {
                    id: id.clone(),
                    receiver_crc32: crc,
                }) {
                    tracing::debug!(transfer_id = %id, "Could not send file-complete-ack: {e}");
                }

                let saved_to = match outcome {
                    SinkOutcome::Saved(path) => Some(path),
                    SinkOutcome::Artifact(data) => {
                        events.emit(SessionEvent::ArtifactReady {
                            id: id.clone(),
                            name: info.name.clone(),
                            data,
                        });
                        None
                    }
                };

                tracing::info!(transfer_id = %id, crc32 = crc, "Transfer received");
                let summary = TransferSummary::from_info(&info, TransferStatus::Completed)
                    .with_resumed_from(resumed_from)
                    .with_checksums(Some(crc), None)
                    .with_saved_to(saved_to);
                self.record(summary, events);
            }
            Err(e) => {
                tracing::warn!(transfer_id = %id, "Failed to close sink: {e}");
                let reason = format!("receiver could not finalize file: {e}");
                let _ = self.send_control(&ControlMessage::FileCancel {
                    id: id.clone(),
                    reason: reason.clone(),
                });
                let summary = TransferSummary::from_info(&snapshot, TransferStatus::Canceled)
                    .with_resumed_from(resumed_from)
                    .with_reason(reason);
                self.record(summary, events);
            }
        }
    }

    async fn teardown(&mut self, slot: Slot, reason: &str, events: &mut EventDispatcher) {
        let (info, resumed_from) = match slot {
            Slot::Sending(slot) => {
                if let Some(task) = &slot.task {
                    task.cancel();
                }
                if let Some(timer) = slot.timer {
                    timer.abort();
                }
                (slot.info, slot.resumed_from)
            }
            Slot::Receiving(pipeline) => {
                let resumed_from = pipeline.start_offset();
                (pipeline.abort().await, resumed_from)
            }
        };

        let summary = TransferSummary::from_info(&info, TransferStatus::Canceled)
            .with_resumed_from(resumed_from)
            .with_reason(reason);
        self.record(summary, events);
    }

    fn record(&mut self, summary: TransferSummary, events: &mut EventDispatcher) {
        tracing::debug!(transfer_id = %summary.id, status = %summary.status, "Transfer finished");

        if self.settings.history_limit > 0 {
            while self.history.len() >= self.settings.history_limit {
                self.history.pop_front();
            }
            self.history.push_back(summary.clone());
        }
        events.emit(SessionEvent::TransferFinished(summary));
    }

    fn send_control(&self, message: &ControlMessage) -> Result<()> {
        self.channel.send_text(message.encode()?)
    }
}

/// Start the send task for `slot`, exactly once.
fn start_send(
    id: &TransferId,
    slot: &mut SendSlot,
    requested_offset: u64,
    channel: &Channel,
    tx: &mpsc::UnboundedSender<PipelineEvent>,
) {
    slot.started = true;
    if let Some(timer) = slot.timer.take() {
        timer.abort();
    }

    let offset = align_resume_offset(requested_offset, slot.info.chunk_size, slot.info.size);
    if offset != requested_offset {
        tracing::warn!(
            transfer_id = %id,
            requested_offset,
            offset,
            "Adjusted resume offset to a chunk boundary"
        );
    }

    slot.resumed_from = offset;
    slot.info.advance_to(offset, 0);
    slot.task = Some(
        SendTask::new(
            id.clone(),
            Arc::clone(&slot.source),
            slot.info.chunk_size,
            offset,
            channel.clone(),
            tx.clone(),
        )
        .spawn(),
    );

    tracing::info!(transfer_id = %id, start_offset = offset, "Sending started");
}
