//! The session: one peer's end of a connection.
//!
//! A [`Session`] task owns the connection state machine, the transfer
//! coordinator and the event dispatcher. Channel events, user commands and
//! pipeline reports are consumed from one `select!` loop, so every state
//! change happens in a single ordered dispatch path and none of the owned
//! state needs a lock.
//!
//! Callers talk to the task through a cloneable [`SessionHandle`].
//!
//! ```rust,ignore
//! let (a, b) = MemoryLink::new(DEFAULT_BUFFERED_AMOUNT_LOW).connect();
//! let (tx, mut events) = tokio::sync::mpsc::unbounded_channel();
//! let session = Session::spawn(a, SessionConfig::default(), Arc::new(MemoryOnlyProvider), tx);
//! session.consumer_ready().await?;
//! session.wait_connected().await?;
//! let id = session.send_file("notes.txt").await?;
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::channel::{Channel, ChannelEvent, Link, WireMessage};
use crate::config::Config;
use crate::connection::{
    ConnectionMonitor, ConnectionSignal, ConnectionSnapshot, ConnectionState,
    ConnectionStateMachine,
};
use crate::error::{Error, Result};
use crate::events::{EventDispatcher, EventSink, SessionEvent};
use crate::protocol::{classify_text, InboundText};
use crate::storage::{FileSource, SinkProvider, TransferSource};
use crate::transfer::sender::PipelineEvent;
use crate::transfer::{
    CoordinatorSettings, TransferCoordinator, TransferId, TransferInfo, TransferSummary,
};

/// Reason sent to the peer for transfers cut short by [`SessionHandle::shutdown`].
pub const SHUTDOWN_REASON: &str = "session shut down";

/// Session tunables.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Transfer settings
    pub transfer: CoordinatorSettings,
    /// Default bound for [`SessionHandle::wait_for_gathering`]
    pub gathering_timeout: Duration,
    /// Default bound for [`SessionHandle::wait_connected`]
    pub connect_timeout: Duration,
    /// Events held until the consumer is ready
    pub queue_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            transfer: CoordinatorSettings::default(),
            gathering_timeout: crate::DEFAULT_GATHERING_TIMEOUT,
            connect_timeout: crate::DEFAULT_CONNECT_TIMEOUT,
            queue_capacity: crate::DEFAULT_EVENT_QUEUE_CAPACITY,
        }
    }
}

impl From<&Config> for SessionConfig {
    fn from(config: &Config) -> Self {
        Self {
            transfer: CoordinatorSettings {
                chunk_size: config.transfer.chunk_size,
                accept_timeout: config.transfer.accept_timeout,
                history_limit: config.history.max_entries,
            },
            gathering_timeout: config.connection.gathering_timeout,
            connect_timeout: config.connection.connect_timeout,
            queue_capacity: config.events.queue_capacity,
        }
    }
}

enum Command {
    Offer {
        source: Arc<dyn TransferSource>,
        reply: oneshot::Sender<Result<TransferId>>,
    },
    Cancel {
        id: TransferId,
        reason: String,
        reply: oneshot::Sender<bool>,
    },
    Chat {
        text: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Signal(ConnectionSignal),
    ConsumerReady(oneshot::Sender<usize>),
    Transfers(oneshot::Sender<Vec<TransferInfo>>),
    History(oneshot::Sender<Vec<TransferSummary>>),
    Shutdown(oneshot::Sender<()>),
}

/// The session task.
pub struct Session {
    machine: ConnectionStateMachine,
    coordinator: TransferCoordinator,
    events: EventDispatcher,
    channel: Channel,
    link_closed: bool,
}

impl Session {
    /// Start a session over `link` and return its handle.
    ///
    /// Events go to `sink` once [`SessionHandle::consumer_ready`] is called;
    /// until then they wait in a bounded queue. Must be called within a
    /// Tokio runtime.
    pub fn spawn(
        link: Link,
        config: SessionConfig,
        provider: Arc<dyn SinkProvider>,
        sink: impl EventSink + 'static,
    ) -> SessionHandle {
        let Link {
            channel,
            events: link_events,
        } = link;

        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (pipeline_tx, pipeline_rx) = mpsc::unbounded_channel();

        let machine = ConnectionStateMachine::new();
        let monitor = machine.monitor();

        let session = Self {
            machine,
            coordinator: TransferCoordinator::new(
                channel.clone(),
                provider,
                config.transfer.clone(),
                pipeline_tx,
            ),
            events: EventDispatcher::new(sink, config.queue_capacity),
            channel,
            link_closed: false,
        };

        tokio::spawn(session.run(commands, link_events, pipeline_rx));

        SessionHandle {
            commands: commands_tx,
            monitor,
            gathering_timeout: config.gathering_timeout,
            connect_timeout: config.connect_timeout,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut link_events: mpsc::UnboundedReceiver<ChannelEvent>,
        mut pipeline: mpsc::UnboundedReceiver<PipelineEvent>,
    ) {
        tracing::debug!("Session started");

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown(reply)) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.on_command(command).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                event = link_events.recv(), if !self.link_closed => {
                    self.on_channel_event(event.unwrap_or(ChannelEvent::Closed)).await;
                }
                Some(event) = pipeline.recv() => {
                    self.coordinator.on_pipeline(event, &mut self.events).await;
                }
            }
        }

        tracing::debug!("Session stopped");
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Offer { source, reply } => {
                let result = if self.machine.is_ready() {
                    self.coordinator.offer(source)
                } else {
                    Err(Error::NotConnected)
                };
                let _ = reply.send(result);
            }
            Command::Cancel { id, reason, reply } => {
                let cancelled = self.coordinator.cancel(&id, &reason, &mut self.events).await;
                let _ = reply.send(cancelled);
            }
            Command::Chat { text, reply } => {
                let result = if self.machine.is_ready() {
                    self.channel.send_text(text)
                } else {
                    Err(Error::NotConnected)
                };
                let _ = reply.send(result);
            }
            Command::Signal(signal) => self.apply(signal),
            Command::ConsumerReady(reply) => {
                let _ = reply.send(self.events.consumer_ready());
            }
            Command::Transfers(reply) => {
                let _ = reply.send(self.coordinator.active());
            }
            Command::History(reply) => {
                let _ = reply.send(self.coordinator.history());
            }
            Command::Shutdown(reply) => {
                let _ = reply.send(());
            }
        }
    }

    async fn on_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Open => self.apply(ConnectionSignal::ChannelOpened),
            ChannelEvent::Message(WireMessage::Text(text)) => {
                self.apply(ConnectionSignal::MessageReceived);
                match classify_text(&text) {
                    InboundText::Control(message) => {
                        self.coordinator.on_control(message, &mut self.events).await;
                    }
                    InboundText::Chat(text) => self.events.emit(SessionEvent::Chat(text)),
                }
            }
            ChannelEvent::Message(WireMessage::Binary(bytes)) => {
                self.apply(ConnectionSignal::MessageReceived);
                self.coordinator.on_binary(&bytes, &mut self.events).await;
            }
            ChannelEvent::Closed => {
                self.link_closed = true;
                self.apply(ConnectionSignal::ChannelClosed);
                self.coordinator.on_channel_closed(&mut self.events).await;
            }
        }
    }

    fn apply(&mut self, signal: ConnectionSignal) {
        if let Some(transition) = self.machine.apply(signal) {
            self.events.emit(SessionEvent::ConnectionChanged {
                from: transition.from,
                to: transition.to,
            });
        }
    }

    async fn shutdown(&mut self) {
        for info in self.coordinator.active() {
            self.coordinator
                .cancel(&info.id, SHUTDOWN_REASON, &mut self.events)
                .await;
        }
        self.channel.close();
    }
}

/// Cloneable handle to a running [`Session`].
///
/// Every method fails with [`Error::SessionClosed`] once the session task
/// has stopped.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    monitor: ConnectionMonitor,
    gathering_timeout: Duration,
    connect_timeout: Duration,
}

impl SessionHandle {
    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| Error::SessionClosed)?;
        response.await.map_err(|_| Error::SessionClosed)
    }

    /// Offer the file at `path` to the peer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileNotFound`] or [`Error::InvalidPath`] for a bad
    /// path, [`Error::NotConnected`] unless the connection is `connected`,
    /// or an error if the offer could not be sent.
    pub async fn send_file(&self, path: impl AsRef<Path>) -> Result<TransferId> {
        let source = FileSource::new(path.as_ref())?;
        self.send_source(Arc::new(source)).await
    }

    /// Offer an arbitrary source to the peer.
    ///
    /// Sending starts when the peer accepts, or after the accept timeout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] unless the connection is `connected`,
    /// or an error if the offer could not be sent.
    pub async fn send_source(&self, source: Arc<dyn TransferSource>) -> Result<TransferId> {
        self.request(|reply| Command::Offer { source, reply })
            .await?
    }

    /// Cancel a live transfer in either direction.
    ///
    /// Returns `false` if `id` was not live. Calling it twice is harmless.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionClosed`] if the session has stopped.
    pub async fn cancel(&self, id: &TransferId, reason: impl Into<String>) -> Result<bool> {
        let id = id.clone();
        let reason = reason.into();
        self.request(|reply| Command::Cancel { id, reason, reply })
            .await
    }

    /// Send a plain text message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] unless the connection is `connected`.
    pub async fn send_chat(&self, text: impl Into<String>) -> Result<()> {
        let text = text.into();
        self.request(|reply| Command::Chat { text, reply }).await?
    }

    /// Report a negotiation or transport event.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionClosed`] if the session has stopped.
    pub fn signal(&self, signal: ConnectionSignal) -> Result<()> {
        self.commands
            .send(Command::Signal(signal))
            .map_err(|_| Error::SessionClosed)
    }

    /// Tell the session the event consumer is ready.
    ///
    /// Returns the number of queued events flushed to it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionClosed`] if the session has stopped.
    pub async fn consumer_ready(&self) -> Result<usize> {
        self.request(Command::ConsumerReady).await
    }

    /// Wait for candidate gathering with the configured timeout.
    ///
    /// # Errors
    ///
    /// See [`SessionHandle::wait_for_gathering_within`].
    pub async fn wait_for_gathering(&self) -> Result<ConnectionSnapshot> {
        self.wait_for_gathering_within(self.gathering_timeout).await
    }

    /// Wait until gathering completes or `timeout` elapses.
    ///
    /// On timeout the connection moves to `failed`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::GatheringTimeout`] if gathering did not complete.
    pub async fn wait_for_gathering_within(&self, timeout: Duration) -> Result<ConnectionSnapshot> {
        let mut monitor = self.monitor.clone();
        let result = monitor.wait_for_gathering(timeout).await;
        if matches!(result, Err(Error::GatheringTimeout(_))) {
            let _ = self.signal(ConnectionSignal::GatheringTimedOut);
        }
        result
    }

    /// Wait for the connection to reach `connected` with the configured
    /// timeout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectTimeout`] on timeout or
    /// [`Error::NotConnected`] if the connection failed.
    pub async fn wait_connected(&self) -> Result<()> {
        let mut monitor = self.monitor.clone();
        monitor.wait_connected(self.connect_timeout).await
    }

    /// Latest connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.monitor.state()
    }

    /// Latest connection snapshot.
    #[must_use]
    pub fn connection(&self) -> ConnectionSnapshot {
        self.monitor.current()
    }

    /// Live transfers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionClosed`] if the session has stopped.
    pub async fn transfers(&self) -> Result<Vec<TransferInfo>> {
        self.request(Command::Transfers).await
    }

    /// Terminal transfers of this session, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionClosed`] if the session has stopped.
    pub async fn history(&self) -> Result<Vec<TransferSummary>> {
        self.request(Command::History).await
    }

    /// Cancel live transfers, close the channel and stop the task.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionClosed`] if the session had already stopped.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(Command::Shutdown).await
    }
}
