//! Connection state machine.
//!
//! The negotiation layer and the transport report what happens to them as
//! [`ConnectionSignal`]s; the machine folds those into one visible
//! [`ConnectionState`]. Transfers only run while the state is
//! [`ConnectionState::Connected`].
//!
//! ```text
//! new ─► gathering ─► negotiating ─► connecting ─► connected
//!           ▲                            │              │
//!           │                            ▼              ▼
//!           └──────────────── disconnected / failed ◄───┘
//! ```
//!
//! `connected` is reached as soon as the data channel opens, whether or not
//! the transport reported itself connected first. `disconnected` and
//! `failed` are not terminal: a new gathering cycle starts over.
//!
//! Waiters observe the machine through a [`ConnectionMonitor`], which never
//! blocks longer than the timeout it is given.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::{Error, Result};

/// Externally visible connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    /// Nothing has happened yet
    New,
    /// Local candidates are being gathered
    Gathering,
    /// Offer and answer have been exchanged
    Negotiating,
    /// The transport is establishing connectivity
    Connecting,
    /// The data channel is open
    Connected,
    /// Connectivity was lost
    Disconnected,
    /// Connectivity could not be established
    Failed,
}

impl ConnectionState {
    /// Whether a fresh gathering cycle may start from this state.
    #[must_use]
    pub const fn can_restart(self) -> bool {
        matches!(
            self,
            Self::New | Self::Gathering | Self::Disconnected | Self::Failed
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::New => "new",
            Self::Gathering => "gathering candidates",
            Self::Negotiating => "offer/answer exchanged",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
        };
        f.write_str(text)
    }
}

/// Input to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionSignal {
    /// A new offer/answer cycle began gathering candidates
    GatheringStarted,
    /// A local candidate trickled in
    CandidateGathered(String),
    /// Explicit end-of-candidates marker
    EndOfCandidates,
    /// The gathering state reported completion
    GatheringStateComplete,
    /// Gathering did not complete in time
    GatheringTimedOut,
    /// Local and remote descriptions are both set
    DescriptionsExchanged,
    /// Transport reported `connecting`
    TransportConnecting,
    /// Transport reported `connected`
    TransportConnected,
    /// Transport reported `disconnected`
    TransportDisconnected,
    /// Transport reported `failed`
    TransportFailed,
    /// The data channel opened
    ChannelOpened,
    /// The data channel closed
    ChannelClosed,
    /// A message arrived on the data channel
    MessageReceived,
}

/// Everything the machine tracks, published to monitors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    /// Visible state
    pub state: ConnectionState,
    /// Whether gathering has finished for the current cycle
    pub gathering_complete: bool,
    /// Candidates gathered in the current cycle
    pub candidates: usize,
    /// Whether the transport reported itself connected
    pub transport_connected: bool,
    /// Whether the data channel is open
    pub channel_open: bool,
    /// Whether any message has arrived on the channel
    pub first_message_received: bool,
}

impl Default for ConnectionSnapshot {
    fn default() -> Self {
        Self {
            state: ConnectionState::New,
            gathering_complete: false,
            candidates: 0,
            transport_connected: false,
            channel_open: false,
            first_message_received: false,
        }
    }
}

/// A change of visible state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// State before the signal
    pub from: ConnectionState,
    /// State after the signal
    pub to: ConnectionState,
}

/// Folds connection signals into a visible state.
///
/// Owned by exactly one task; everyone else watches through a
/// [`ConnectionMonitor`].
#[derive(Debug)]
pub struct ConnectionStateMachine {
    snapshot: ConnectionSnapshot,
    candidates: Vec<String>,
    tx: watch::Sender<ConnectionSnapshot>,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateMachine {
    /// A machine in [`ConnectionState::New`].
    #[must_use]
    pub fn new() -> Self {
        let snapshot = ConnectionSnapshot::default();
        let (tx, _) = watch::channel(snapshot.clone());
        Self {
            snapshot,
            candidates: Vec::new(),
            tx,
        }
    }

    /// Current visible state.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.snapshot.state
    }

    /// Current snapshot.
    #[must_use]
    pub const fn snapshot(&self) -> &ConnectionSnapshot {
        &self.snapshot
    }

    /// Whether transfers may run.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.snapshot.state == ConnectionState::Connected
    }

    /// Candidates gathered in the current cycle.
    #[must_use]
    pub fn candidates(&self) -> &[String] {
        &self.candidates
    }

    /// Watch this machine from elsewhere.
    #[must_use]
    pub fn monitor(&self) -> ConnectionMonitor {
        ConnectionMonitor {
            rx: self.tx.subscribe(),
        }
    }

    /// Apply one signal. Returns the visible transition, if any.
    pub fn apply(&mut self, signal: ConnectionSignal) -> Option<Transition> {
        use ConnectionSignal as S;
        use ConnectionState as C;

        let from = self.snapshot.state;
        let mut to = from;
        let snap = &mut self.snapshot;

        match signal {
            S::GatheringStarted => {
                if from.can_restart() {
                    self.candidates.clear();
                    *snap = ConnectionSnapshot {
                        state: C::Gathering,
                        ..ConnectionSnapshot::default()
                    };
                    to = C::Gathering;
                } else {
                    tracing::debug!(state = %from, "Ignoring gathering restart while connection is live");
                }
            }
            S::CandidateGathered(candidate) => {
                if matches!(from, C::Gathering | C::Negotiating) && !snap.gathering_complete {
                    self.candidates.push(candidate);
                    snap.candidates = self.candidates.len();
                }
            }
            S::EndOfCandidates | S::GatheringStateComplete => {
                snap.gathering_complete = true;
            }
            S::GatheringTimedOut => {
                if from == C::Gathering {
                    to = C::Failed;
                }
            }
            S::DescriptionsExchanged => {
                if matches!(from, C::New | C::Gathering) {
                    to = C::Negotiating;
                }
            }
            S::TransportConnecting => {
                if matches!(
                    from,
                    C::New | C::Gathering | C::Negotiating | C::Disconnected
                ) {
                    to = C::Connecting;
                }
            }
            S::TransportConnected => {
                snap.transport_connected = true;
                if snap.channel_open {
                    // Transport recovered under a data channel that never closed.
                    if matches!(from, C::Connecting | C::Disconnected) {
                        to = C::Connected;
                    }
                } else if from != C::Connecting {
                    to = C::Connecting;
                }
            }
            S::TransportDisconnected => {
                snap.transport_connected = false;
                if matches!(from, C::Connecting | C::Connected) {
                    to = C::Disconnected;
                }
            }
            S::TransportFailed => {
                snap.transport_connected = false;
                if from != C::New {
                    to = C::Failed;
                }
            }
            S::ChannelOpened => {
                snap.channel_open = true;
                to = C::Connected;
            }
            S::MessageReceived => {
                snap.first_message_received = true;
                if !snap.channel_open || from == C::Disconnected {
                    snap.channel_open = true;
                    to = C::Connected;
                }
            }
            S::ChannelClosed => {
                snap.channel_open = false;
                if from == C::Connected {
                    to = C::Disconnected;
                }
            }
        }

        self.snapshot.state = to;
        self.tx.send_replace(self.snapshot.clone());

        if from == to {
            None
        } else {
            tracing::info!(%from, %to, "Connection state changed");
            Some(Transition { from, to })
        }
    }
}

/// Read-only view of a [`ConnectionStateMachine`].
#[derive(Debug, Clone)]
pub struct ConnectionMonitor {
    rx: watch::Receiver<ConnectionSnapshot>,
}

impl ConnectionMonitor {
    /// Latest snapshot.
    #[must_use]
    pub fn current(&self) -> ConnectionSnapshot {
        self.rx.borrow().clone()
    }

    /// Latest visible state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.rx.borrow().state
    }

    /// Wait until gathering completes for the current cycle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::GatheringTimeout`] if it has not completed within
    /// `timeout`, or [`Error::SessionClosed`] if the machine is gone.
    pub async fn wait_for_gathering(&mut self, timeout: Duration) -> Result<ConnectionSnapshot> {
        let waited = tokio::time::timeout(timeout, self.rx.wait_for(|s| s.gathering_complete)).await;
        match waited {
            Ok(Ok(snapshot)) => Ok(snapshot.clone()),
            Ok(Err(_)) => Err(Error::SessionClosed),
            Err(_) => {
                tracing::warn!(timeout_ms = duration_ms(timeout), "Candidate gathering timed out");
                Err(Error::GatheringTimeout(duration_ms(timeout)))
            }
        }
    }

    /// Wait until the data channel is open.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectTimeout`] if not connected within `timeout`,
    /// [`Error::NotConnected`] if the connection failed first, or
    /// [`Error::SessionClosed`] if the machine is gone.
    pub async fn wait_connected(&mut self, timeout: Duration) -> Result<()> {
        let waited = tokio::time::timeout(
            timeout,
            self.rx.wait_for(|s| {
                matches!(s.state, ConnectionState::Connected | ConnectionState::Failed)
            }),
        )
        .await;
        match waited {
            Ok(Ok(snapshot)) if snapshot.state == ConnectionState::Connected => Ok(()),
            Ok(Ok(_)) => Err(Error::NotConnected),
            Ok(Err(_)) => Err(Error::SessionClosed),
            Err(_) => Err(Error::ConnectTimeout(duration_ms(timeout))),
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionSignal as S;
    use ConnectionState as C;

    fn drive(machine: &mut ConnectionStateMachine, signals: Vec<ConnectionSignal>) -> Vec<C> {
        signals
            .into_iter()
            .filter_map(|s| machine.apply(s).map(|t| t.to))
            .collect()
    }

    #[test]
    fn test_happy_path() {
        let mut machine = ConnectionStateMachine::new();
        let visited = drive(
            &mut machine,
            vec![
                S::GatheringStarted,
                S::CandidateGathered("host 192.168.1.2".to_string()),
                S::EndOfCandidates,
                S::DescriptionsExchanged,
                S::TransportConnecting,
                S::TransportConnected,
                S::ChannelOpened,
            ],
        );

        assert_eq!(
            visited,
            vec![C::Gathering, C::Negotiating, C::Connecting, C::Connected]
        );
        assert!(machine.is_ready());
        assert_eq!(machine.candidates().len(), 1);
    }

    #[test]
    fn test_channel_open_before_transport_connected() {
        let mut machine = ConnectionStateMachine::new();
        drive(
            &mut machine,
            vec![
                S::GatheringStarted,
                S::DescriptionsExchanged,
                S::TransportConnecting,
                S::ChannelOpened,
            ],
        );
        assert_eq!(machine.state(), C::Connected);

        assert_eq!(machine.apply(S::TransportConnected), None);
        assert_eq!(machine.state(), C::Connected);
        assert!(machine.snapshot().transport_connected);
    }

    #[test]
    fn test_transport_connected_alone_is_not_connected() {
        let mut machine = ConnectionStateMachine::new();
        drive(
            &mut machine,
            vec![
                S::GatheringStarted,
                S::DescriptionsExchanged,
                S::TransportConnected,
            ],
        );
        assert_eq!(machine.state(), C::Connecting);
        assert!(!machine.is_ready());
    }

    #[test]
    fn test_first_message_implies_open() {
        let mut machine = ConnectionStateMachine::new();
        let transition = machine.apply(S::MessageReceived).expect("transition");
        assert_eq!(transition.to, C::Connected);
        assert!(machine.snapshot().first_message_received);
    }

    #[test]
    fn test_disconnect_and_restart() {
        let mut machine = ConnectionStateMachine::new();
        drive(&mut machine, vec![S::GatheringStarted, S::ChannelOpened]);

        assert_eq!(
            machine.apply(S::TransportDisconnected),
            Some(Transition {
                from: C::Connected,
                to: C::Disconnected
            })
        );

        machine.apply(S::GatheringStarted);
        assert_eq!(machine.state(), C::Gathering);
        assert!(!machine.snapshot().channel_open);
        assert!(!machine.snapshot().gathering_complete);
    }

    #[test]
    fn test_transport_recovery_restores_connected_while_channel_open() {
        let mut machine = ConnectionStateMachine::new();
        drive(
            &mut machine,
            vec![
                S::GatheringStarted,
                S::DescriptionsExchanged,
                S::TransportConnecting,
                S::TransportConnected,
                S::ChannelOpened,
                S::TransportDisconnected,
            ],
        );
        assert_eq!(machine.state(), C::Disconnected);
        assert!(machine.snapshot().channel_open);

        assert_eq!(
            machine.apply(S::TransportConnected),
            Some(Transition {
                from: C::Disconnected,
                to: C::Connected
            })
        );
        assert!(machine.is_ready());
    }

    #[test]
    fn test_message_after_transport_blip_restores_connected() {
        let mut machine = ConnectionStateMachine::new();
        drive(
            &mut machine,
            vec![S::ChannelOpened, S::TransportDisconnected, S::MessageReceived],
        );
        assert_eq!(machine.state(), C::Connected);
    }

    #[test]
    fn test_closed_channel_stays_disconnected_on_transport_recovery() {
        let mut machine = ConnectionStateMachine::new();
        drive(
            &mut machine,
            vec![S::ChannelOpened, S::ChannelClosed, S::TransportConnected],
        );
        assert_eq!(machine.state(), C::Connecting);
        assert!(!machine.is_ready());
    }

    #[test]
    fn test_failed_is_not_terminal() {
        let mut machine = ConnectionStateMachine::new();
        drive(
            &mut machine,
            vec![S::GatheringStarted, S::TransportConnecting, S::TransportFailed],
        );
        assert_eq!(machine.state(), C::Failed);

        drive(&mut machine, vec![S::GatheringStarted, S::ChannelOpened]);
        assert_eq!(machine.state(), C::Connected);
    }

    #[test]
    fn test_restart_ignored_while_connected() {
        let mut machine = ConnectionStateMachine::new();
        machine.apply(S::ChannelOpened);
        assert_eq!(machine.apply(S::GatheringStarted), None);
        assert_eq!(machine.state(), C::Connected);
    }

    #[test]
    fn test_channel_close_disconnects() {
        let mut machine = ConnectionStateMachine::new();
        machine.apply(S::ChannelOpened);
        machine.apply(S::ChannelClosed);
        assert_eq!(machine.state(), C::Disconnected);
    }

    #[tokio::test]
    async fn test_wait_for_gathering_completes() {
        let mut machine = ConnectionStateMachine::new();
        let mut monitor = machine.monitor();
        machine.apply(S::GatheringStarted);

        let waiter =
            tokio::spawn(async move { monitor.wait_for_gathering(Duration::from_secs(5)).await });
        tokio::task::yield_now().await;

        machine.apply(S::CandidateGathered("c1".to_string()));
        machine.apply(S::GatheringStateComplete);

        let snapshot = waiter.await.expect("join").expect("gathered");
        assert!(snapshot.gathering_complete);
        assert_eq!(snapshot.candidates, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_gathering_times_out() {
        let mut machine = ConnectionStateMachine::new();
        let mut monitor = machine.monitor();
        machine.apply(S::GatheringStarted);

        let result = monitor.wait_for_gathering(Duration::from_secs(10)).await;
        assert!(matches!(result, Err(Error::GatheringTimeout(10_000))));

        machine.apply(S::GatheringTimedOut);
        assert_eq!(machine.state(), C::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_connected_reports_failure() {
        let mut machine = ConnectionStateMachine::new();
        let mut monitor = machine.monitor();
        machine.apply(S::GatheringStarted);
        machine.apply(S::TransportFailed);

        let result = monitor.wait_connected(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(Error::NotConnected)));
    }
}
