//! In-process channel connecting two sessions.
//!
//! Each direction is driven by its own task that moves messages from one
//! side's outbound queue into the other side's events, releasing the
//! buffered amount as it goes. An optional interceptor per direction can
//! drop or rewrite messages in flight.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Channel, ChannelEvent, Link, Outbound, WireMessage};

/// What an interceptor does with a message in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intercept {
    /// Deliver unchanged
    Deliver,
    /// Silently lose the message
    Drop,
    /// Deliver this message instead
    Replace(WireMessage),
}

/// Hook applied to every message travelling in one direction.
pub type Interceptor = Arc<dyn Fn(&WireMessage) -> Intercept + Send + Sync>;

/// Builder for a connected pair of in-memory [`Link`]s.
#[derive(Clone)]
pub struct MemoryLink {
    low_threshold: usize,
    a_to_b: Option<Interceptor>,
    b_to_a: Option<Interceptor>,
}

impl fmt::Debug for MemoryLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryLink")
            .field("low_threshold", &self.low_threshold)
            .field("a_to_b", &self.a_to_b.is_some())
            .field("b_to_a", &self.b_to_a.is_some())
            .finish()
    }
}

impl MemoryLink {
    /// A link whose channels use `low_threshold` as their low-water mark.
    #[must_use]
    pub fn new(low_threshold: usize) -> Self {
        Self {
            low_threshold,
            a_to_b: None,
            b_to_a: None,
        }
    }

    /// Intercept messages sent by side A.
    #[must_use]
    pub fn with_interceptor_a_to_b<F>(mut self, interceptor: F) -> Self
    where
        F: Fn(&WireMessage) -> Intercept + Send + Sync + 'static,
    {
        self.a_to_b = Some(Arc::new(interceptor));
        self
    }

    /// Intercept messages sent by side B.
    #[must_use]
    pub fn with_interceptor_b_to_a<F>(mut self, interceptor: F) -> Self
    where
        F: Fn(&WireMessage) -> Intercept + Send + Sync + 'static,
    {
        self.b_to_a = Some(Arc::new(interceptor));
        self
    }

    /// Open the link and return both ends, A first.
    ///
    /// Both ends see [`ChannelEvent::Open`] immediately. Closing either
    /// channel closes the whole link. Must be called within a Tokio runtime.
    #[must_use]
    pub fn connect(self) -> (Link, Link) {
        let closed = CancellationToken::new();

        let (channel_a, outbound_a) = Channel::with_close_token(self.low_threshold, closed.clone());
        let (channel_b, outbound_b) = Channel::with_close_token(self.low_threshold, closed.clone());
        let (events_a_tx, events_a) = mpsc::unbounded_channel();
        let (events_b_tx, events_b) = mpsc::unbounded_channel();

        let _ = events_a_tx.send(ChannelEvent::Open);
        let _ = events_b_tx.send(ChannelEvent::Open);

        tokio::spawn(drive(outbound_a, events_b_tx, self.a_to_b, closed.clone()));
        tokio::spawn(drive(outbound_b, events_a_tx, self.b_to_a, closed));

        tracing::debug!("In-memory link connected");

        (
            Link {
                channel: channel_a,
                events: events_a,
            },
            Link {
                channel: channel_b,
                events: events_b,
            },
        )
    }
}

async fn drive(
    mut outbound: Outbound,
    peer_events: mpsc::UnboundedSender<ChannelEvent>,
    interceptor: Option<Interceptor>,
    closed: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = closed.cancelled() => {
                // Messages queued before the close still reach the peer.
                while let Some(message) = outbound.try_recv() {
                    if !forward(&outbound, &peer_events, interceptor.as_ref(), message) {
                        break;
                    }
                }
                break;
            }
            message = outbound.recv() => {
                let Some(message) = message else {
                    closed.cancel();
                    break;
                };
                if !forward(&outbound, &peer_events, interceptor.as_ref(), message) {
                    closed.cancel();
                }
            }
        }
    }

    let _ = peer_events.send(ChannelEvent::Closed);
    tracing::debug!("In-memory link direction closed");
}

/// Deliver one message through the interceptor. Returns `false` once the
/// peer has gone away.
fn forward(
    outbound: &Outbound,
    peer_events: &mpsc::UnboundedSender<ChannelEvent>,
    interceptor: Option<&Interceptor>,
    message: WireMessage,
) -> bool {
    let len = message.len();
    let delivered = match interceptor.map(|f| f(&message)) {
        None | Some(Intercept::Deliver) => Some(message),
        Some(Intercept::Drop) => None,
        Some(Intercept::Replace(replacement)) => Some(replacement),
    };
    outbound.release(len);

    delivered.map_or(true, |message| {
        peer_events.send(ChannelEvent::Message(message)).is_ok()
    })
}
