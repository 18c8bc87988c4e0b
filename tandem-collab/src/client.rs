//! Sync client: drives one [`Session`] over a reconnecting transport.
//!
//! ```text
//!  SyncClient (handle) ── Command ──► driver task ──► Session ──► Transport
//!        ▲                               │   ▲
//!        └──── SyncEvent (bounded) ──────┘   └── Backoff between attempts
//! ```
//!
//! The driver task is the single owner of the session and its document.
//! Application calls travel over an mpsc channel with oneshot replies, so
//! a rejected local edit still reports its error to the caller. Local
//! edits are accepted in every state; while offline they are queued and
//! replayed after the next handshake.
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use tandem_core::{Doc, EngineError, ReplicaId};

use crate::awareness::{ParticipantId, Presence};
use crate::protocol::ProtocolError;
use crate::reconnect::{cancel_pair, Backoff, BackoffConfig, CancelHandle, CancelToken, WaitOutcome};
use crate::session::{Session, SessionConfig, SessionState, SyncEvent};
use crate::transport::{Connector, Transport, TransportError};

/// Command channel depth.
const COMMAND_CAPACITY: usize = 256;
const EVENT_CAPACITY: usize = 256;

/// Random replica id for a new participant. Never the seed replica (0)
/// and never the relay's own id.
pub fn random_replica_id() -> ReplicaId {
    rand::rng().random_range(1..u64::MAX)
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub session: SessionConfig,
    pub backoff: BackoffConfig,
    /// How often the session timers run
    pub tick_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            backoff: BackoffConfig::default(),
            tick_interval: Duration::from_secs(1),
        }
    }
}

/// Errors returned by the client handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The local edit was rejected; the document is unchanged
    Engine(EngineError),
    /// Presence could not be encoded
    Protocol(ProtocolError),
    /// The driver task has stopped
    Closed,
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Engine(e) => write!(f, "{e}"),
            Self::Protocol(e) => write!(f, "{e}"),
            Self::Closed => write!(f, "Sync client closed"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<EngineError> for ClientError {
    fn from(e: EngineError) -> Self {
        ClientError::Engine(e)
    }
}

impl From<ProtocolError> for ClientError {
    fn from(e: ProtocolError) -> Self {
        ClientError::Protocol(e)
    }
}

enum Command {
    Insert {
        position: usize,
        text: String,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Delete {
        position: usize,
        length: usize,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    SetPresence(Vec<u8>),
    Text(oneshot::Sender<String>),
    Participants(oneshot::Sender<Vec<(ParticipantId, Vec<u8>)>>),
    State(oneshot::Sender<SessionState>),
}

/// Handle to a running sync client.
///
/// Dropping the handle cancels the driver; [`disconnect`](Self::disconnect)
/// does the same but waits for the gone marker to go out and returns the
/// final document.
pub struct SyncClient {
    replica: ReplicaId,
    commands: mpsc::Sender<Command>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    cancel: CancelHandle,
    task: Option<JoinHandle<Doc>>,
}

impl SyncClient {
    /// Start the driver task. Must be called inside a tokio runtime.
    pub fn spawn<C: Connector>(connector: C, doc: Doc, config: ClientConfig) -> Self {
        let replica = doc.replica();
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        let (cancel, token) = cancel_pair();

        let session = Session::new(doc, config.session.clone(), Instant::now());
        let driver = Driver {
            session,
            backoff: Backoff::new(config.backoff.clone()),
            commands: command_rx,
            events: event_tx,
            cancel: token,
            tick_interval: config.tick_interval,
        };
        let task = tokio::spawn(driver.run(connector));

        Self {
            replica,
            commands: command_tx,
            event_rx: Some(event_rx),
            cancel,
            task: Some(task),
        }
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).await.map_err(|_| ClientError::Closed)?;
        rx.await.map_err(|_| ClientError::Closed)
    }

    /// Insert `text` at visible character `position`.
    pub async fn insert(&self, position: usize, text: &str) -> Result<(), ClientError> {
        let text = text.to_string();
        self.request(|reply| Command::Insert { position, text, reply }).await??;
        Ok(())
    }

    /// Delete `length` visible characters starting at `position`.
    pub async fn delete(&self, position: usize, length: usize) -> Result<(), ClientError> {
        self.request(|reply| Command::Delete { position, length, reply }).await??;
        Ok(())
    }

    /// Publish our presence (name, color, selection).
    pub async fn set_presence(&self, presence: &Presence) -> Result<(), ClientError> {
        let blob = presence.encode()?;
        self.commands
            .send(Command::SetPresence(blob))
            .await
            .map_err(|_| ClientError::Closed)
    }

    pub async fn text(&self) -> Result<String, ClientError> {
        self.request(Command::Text).await
    }

    /// Live remote participants and their presence blobs.
    pub async fn participants(&self) -> Result<Vec<(ParticipantId, Vec<u8>)>, ClientError> {
        self.request(Command::Participants).await
    }

    pub async fn state(&self) -> Result<SessionState, ClientError> {
        self.request(Command::State).await
    }

    /// Leave: cancels any pending backoff, sends the gone marker if
    /// connected, and returns the final document.
    pub async fn disconnect(mut self) -> Result<Doc, ClientError> {
        self.cancel.cancel();
        match self.task.take() {
            Some(task) => task.await.map_err(|_| ClientError::Closed),
            None => Err(ClientError::Closed),
        }
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// How a connected phase ended.
enum Phase {
    Lost,
    Cancelled,
}

struct Driver {
    session: Session,
    backoff: Backoff,
    commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<SyncEvent>,
    cancel: CancelToken,
    tick_interval: Duration,
}

impl Driver {
    async fn run<C: Connector>(mut self, mut connector: C) -> Doc {
        loop {
            self.session.redial();
            self.dispatch();
            let Some(result) = self.connect_phase(&mut connector).await else {
                break;
            };
            match result {
                Ok(mut transport) => {
                    log::info!("Replica {} connected", self.session.doc().replica());
                    self.session.connect(Instant::now());
                    match self.connected_phase(&mut transport).await {
                        Phase::Lost => transport.close().await,
                        Phase::Cancelled => {
                            self.session.disconnect();
                            for frame in self.session.drain_outbound() {
                                if transport.send(frame).await.is_err() {
                                    break;
                                }
                            }
                            transport.close().await;
                            break;
                        }
                    }
                }
                Err(e) => {
                    log::warn!("Replica {} connect failed: {e}", self.session.doc().replica());
                    self.session.connection_lost();
                }
            }
            self.dispatch();

            if !self.backoff_phase().await {
                break;
            }
        }

        self.session.disconnect();
        // Nothing to send the gone marker on outside a connection
        self.session.drain_outbound();
        self.dispatch();
        log::info!("Replica {} sync client stopped", self.session.doc().replica());
        self.session.into_doc()
    }

    /// `None` when cancelled. Commands are served while connecting.
    async fn connect_phase<C: Connector>(
        &mut self,
        connector: &mut C,
    ) -> Option<Result<C::Transport, TransportError>> {
        let attempt = connector.connect();
        tokio::pin!(attempt);
        loop {
            tokio::select! {
                result = &mut attempt => return Some(result),
                Some(command) = self.commands.recv() => {
                    handle_command(&mut self.session, command);
                    self.dispatch();
                }
                _ = self.cancel.cancelled() => return None,
            }
        }
    }

    async fn connected_phase<T: Transport>(&mut self, transport: &mut T) -> Phase {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            for frame in self.session.drain_outbound() {
                if let Err(e) = transport.send(frame).await {
                    log::warn!("Send failed: {e}");
                    self.session.connection_lost();
                    break;
                }
            }
            self.dispatch();
            if self.session.state() == SessionState::Reconnecting {
                return Phase::Lost;
            }

            tokio::select! {
                incoming = transport.recv() => match incoming {
                    Ok(Some(bytes)) => self.session.receive(&bytes, Instant::now()),
                    Ok(None) => {
                        log::info!("Peer closed the connection");
                        self.session.connection_lost();
                    }
                    Err(e) => {
                        log::warn!("Receive failed: {e}");
                        self.session.connection_lost();
                    }
                },
                Some(command) = self.commands.recv() => handle_command(&mut self.session, command),
                _ = ticker.tick() => self.session.tick(Instant::now()),
                _ = self.cancel.cancelled() => return Phase::Cancelled,
            }
        }
    }

    /// Sleep before the next attempt. False when cancelled.
    async fn backoff_phase(&mut self) -> bool {
        let Driver { session, backoff, commands, events, cancel, .. } = self;
        let wait = backoff.wait(cancel);
        tokio::pin!(wait);
        loop {
            tokio::select! {
                outcome = &mut wait => return matches!(outcome, WaitOutcome::Elapsed(_)),
                Some(command) = commands.recv() => {
                    handle_command(session, command);
                    for event in session.drain_events() {
                        emit(events, event);
                    }
                }
            }
        }
    }

    fn dispatch(&mut self) {
        for event in self.session.drain_events() {
            if event == SyncEvent::StateChanged(SessionState::Synced) {
                self.backoff.reset();
            }
            emit(&self.events, event);
        }
    }
}

/// Hand an event to the application without ever blocking the driver.
fn emit(events: &mpsc::Sender<SyncEvent>, event: SyncEvent) {
    match events.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(event)) => {
            log::warn!("Event channel full, dropping {event:?}");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            log::trace!("Event receiver gone");
        }
    }
}

fn handle_command(session: &mut Session, command: Command) {
    match command {
        Command::Insert { position, text, reply } => {
            let _ = reply.send(session.insert(position, &text));
        }
        Command::Delete { position, length, reply } => {
            let _ = reply.send(session.delete(position, length));
        }
        Command::SetPresence(blob) => session.set_local_presence(blob),
        Command::Text(reply) => {
            let _ = reply.send(session.text());
        }
        Command::Participants(reply) => {
            let _ = reply.send(session.awareness().participants());
        }
        Command::State(reply) => {
            let _ = reply.send(session.state());
        }
    }
}
