//! Session events and their delivery.
//!
//! The consumer registers an [`EventSink`] when the session is built.
//! Events produced before the consumer says it is ready wait in a bounded
//! queue and are flushed in arrival order by
//! [`EventDispatcher::consumer_ready`].

use std::collections::VecDeque;

use tokio::sync::mpsc;

use crate::connection::ConnectionState;
use crate::transfer::{TransferId, TransferInfo, TransferSummary};

/// Something the session wants the consumer to know about.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The externally visible connection state changed
    ConnectionChanged {
        /// Previous state
        from: ConnectionState,
        /// New state
        to: ConnectionState,
    },
    /// The peer offered a file; acceptance is automatic
    OfferReceived(TransferInfo),
    /// Bytes moved on a transfer
    Progress {
        /// Transfer snapshot after the update
        info: TransferInfo,
        /// `info.progress()` at the time of the event
        progress: f64,
    },
    /// A transfer reached a terminal status
    TransferFinished(TransferSummary),
    /// A file received into memory is ready to be saved by the consumer
    ArtifactReady {
        /// Transfer id
        id: TransferId,
        /// Offered file name
        name: String,
        /// File contents
        data: Vec<u8>,
    },
    /// A plain text message from the peer
    Chat(String),
}

/// Receives session events.
pub trait EventSink: Send {
    /// Handle one event.
    fn deliver(&mut self, event: SessionEvent);
}

impl EventSink for mpsc::UnboundedSender<SessionEvent> {
    fn deliver(&mut self, event: SessionEvent) {
        if self.send(event).is_err() {
            tracing::debug!("Event consumer has gone away");
        }
    }
}

impl EventSink for Box<dyn EventSink> {
    fn deliver(&mut self, event: SessionEvent) {
        (**self).deliver(event);
    }
}

/// Queue-until-ready front end for an [`EventSink`].
pub struct EventDispatcher {
    sink: Box<dyn EventSink>,
    pending: VecDeque<SessionEvent>,
    capacity: usize,
    ready: bool,
    dropped: u64,
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("pending", &self.pending.len())
            .field("capacity", &self.capacity)
            .field("ready", &self.ready)
            .field("dropped", &self.dropped)
            .finish_non_exhaustive()
    }
}

impl EventDispatcher {
    /// Wrap `sink`, holding at most `capacity` events until ready.
    #[must_use]
    pub fn new(sink: impl EventSink + 'static, capacity: usize) -> Self {
        Self {
            sink: Box::new(sink),
            pending: VecDeque::new(),
            capacity: capacity.max(1),
            ready: false,
            dropped: 0,
        }
    }

    /// Deliver now if the consumer is ready, otherwise queue.
    ///
    /// A full queue drops its oldest event to make room.
    pub fn emit(&mut self, event: SessionEvent) {
        if self.ready {
            self.sink.deliver(event);
            return;
        }

        if self.pending.len() >= self.capacity {
            self.pending.pop_front();
            self.dropped += 1;
            tracing::warn!(
                capacity = self.capacity,
                dropped = self.dropped,
                "Event queue full; dropping oldest event"
            );
        }
        self.pending.push_back(event);
    }

    /// Mark the consumer ready and flush queued events in arrival order.
    ///
    /// Returns the number of events flushed. Calling it again is harmless.
    pub fn consumer_ready(&mut self) -> usize {
        self.ready = true;
        let flushed = self.pending.len();
        while let Some(event) = self.pending.pop_front() {
            self.sink.deliver(event);
        }
        if flushed > 0 {
            tracing::debug!(flushed, "Flushed pending events");
        }
        flushed
    }

    /// Whether the consumer has signalled readiness.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        self.ready
    }

    /// Number of queued events.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Number of events lost to overflow.
    #[must_use]
    pub const fn dropped(&self) -> u64 {
        self.dropped
    }
}
