//! Ordered, message-based channel between two peers.
//!
//! A [`Link`] is one peer's end of an established channel:
//!
//! - [`Channel`] is the cloneable outbound handle. Every send is accounted in
//!   [`Channel::buffered_amount`] until the transport driver has handed the
//!   message on, which is what senders wait on for backpressure.
//! - `events` yields [`ChannelEvent`]s in arrival order.
//!
//! Transport drivers ([`memory`], [`tcp`]) own the other side: they drain
//! [`Outbound`], release the accounted bytes, and feed inbound messages.

pub mod memory;
pub mod tcp;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
pub use crate::protocol::WireMessage;

/// Something that happened on the inbound side of a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The channel is open and may carry messages
    Open,
    /// A message arrived
    Message(WireMessage),
    /// The channel closed; no further events follow
    Closed,
}

/// One peer's end of an established channel.
#[derive(Debug)]
pub struct Link {
    /// Outbound handle
    pub channel: Channel,
    /// Inbound events in arrival order
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

#[derive(Debug)]
struct Shared {
    buffered: AtomicUsize,
    low_threshold: usize,
    low: Notify,
    closed: CancellationToken,
}

/// Cloneable outbound handle with buffered-amount accounting.
#[derive(Debug, Clone)]
pub struct Channel {
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<WireMessage>,
}

impl Channel {
    /// Create a channel and the driver end of its outbound queue.
    #[must_use]
    pub fn new(low_threshold: usize) -> (Self, Outbound) {
        Self::with_close_token(low_threshold, CancellationToken::new())
    }

    /// Create a channel whose closed state is shared through `closed`.
    #[must_use]
    pub fn with_close_token(low_threshold: usize, closed: CancellationToken) -> (Self, Outbound) {
        let shared = Arc::new(Shared {
            buffered: AtomicUsize::new(0),
            low_threshold,
            low: Notify::new(),
            closed,
        });
        let (tx, rx) = mpsc::unbounded_channel();

        (
            Self {
                shared: Arc::clone(&shared),
                tx,
            },
            Outbound { shared, rx },
        )
    }

    /// Queue a message. Never blocks; callers wanting flow control wait on
    /// [`Channel::wait_buffered_low`] first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelClosed`] if the channel has closed.
    pub fn send(&self, message: WireMessage) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }

        let len = message.len();
        self.shared.buffered.fetch_add(len, Ordering::AcqRel);
        if self.tx.send(message).is_err() {
            self.shared.buffered.fetch_sub(len, Ordering::AcqRel);
            return Err(Error::ChannelClosed);
        }
        Ok(())
    }

    /// Queue a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelClosed`] if the channel has closed.
    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(WireMessage::Text(text.into()))
    }

    /// Queue a binary frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelClosed`] if the channel has closed.
    pub fn send_binary(&self, bytes: Vec<u8>) -> Result<()> {
        self.send(WireMessage::Binary(bytes))
    }

    /// Bytes queued but not yet handed to the transport.
    #[must_use]
    pub fn buffered_amount(&self) -> usize {
        self.shared.buffered.load(Ordering::Acquire)
    }

    /// The low-water mark senders wait for.
    #[must_use]
    pub fn buffered_amount_low_threshold(&self) -> usize {
        self.shared.low_threshold
    }

    /// Wait until the buffered amount is at or under the low-water mark.
    ///
    /// Resolves immediately when already under it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelClosed`] if the channel closes while waiting.
    pub async fn wait_buffered_low(&self) -> Result<()> {
        loop {
            let notified = self.shared.low.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_closed() {
                return Err(Error::ChannelClosed);
            }
            if self.buffered_amount() <= self.shared.low_threshold {
                return Ok(());
            }

            tracing::debug!(
                buffered = self.buffered_amount(),
                threshold = self.shared.low_threshold,
                "Waiting for channel buffer to drain"
            );

            tokio::select! {
                () = &mut notified => {}
                () = self.shared.closed.cancelled() => return Err(Error::ChannelClosed),
            }
        }
    }

    /// Close the channel. Idempotent.
    pub fn close(&self) {
        self.shared.closed.cancel();
        self.shared.low.notify_waiters();
    }

    /// Whether the channel has closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Resolves once the channel has closed.
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await;
    }
}

/// Driver end of a channel's outbound queue.
#[derive(Debug)]
pub struct Outbound {
    shared: Arc<Shared>,
    rx: mpsc::UnboundedReceiver<WireMessage>,
}

impl Outbound {
    /// Next queued message, or `None` once every [`Channel`] handle is gone.
    ///
    /// The message stays accounted until [`Outbound::release`] is called.
    pub async fn recv(&mut self) -> Option<WireMessage> {
        self.rx.recv().await
    }

    /// Next queued message if one is waiting.
    pub fn try_recv(&mut self) -> Option<WireMessage> {
        self.rx.try_recv().ok()
    }

    /// Release `len` accounted bytes after the transport took a message.
    ///
    /// Fires the low-buffer signal when the amount crosses the threshold
    /// from above.
    pub fn release(&self, len: usize) {
        let previous = self
            .shared
            .buffered
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |b| {
                Some(b.saturating_sub(len))
            })
            .unwrap_or_else(|b| b);
        let current = previous.saturating_sub(len);

        if previous > self.shared.low_threshold && current <= self.shared.low_threshold {
            self.shared.low.notify_waiters();
        }
    }

    /// Close the channel from the driver side.
    pub fn close(&self) {
        self.shared.closed.cancel();
        self.shared.low.notify_waiters();
    }

    /// Resolves once the channel has closed from either side.
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await;
    }
}
