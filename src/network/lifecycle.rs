//! Connection lifecycle shared by every protocol manager
//!
//! A [`Session`] is one attempt at a connection: it is created by `connect`,
//! shared between the manager and the background read loop, and never goes
//! back to `connecting` once it has left it. A new `connect` makes a new
//! session.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorPayload, ManagerError};
use crate::messages::{Direction, EventPayload, ManagerEvent, Message, MessageBody};
use crate::models::{ConnectOptions, OutboundPayload, Protocol};
use crate::network::registry::Registry;

/// Where managers push their events; drained by the forwarder
pub type EventSink = mpsc::UnboundedSender<ManagerEvent>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Error,
}

impl ConnectionStatus {
    pub fn can_transition(self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnecting)
                | (Connecting, Error)
                | (Connected, Disconnecting)
                | (Connected, Error)
                | (Disconnecting, Disconnected)
        )
    }

    /// Nothing more will happen in this session
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionStatus::Disconnected | ConnectionStatus::Error)
    }
}

/// Snapshot of a connection as reported by `status`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub protocol: Protocol,
    pub url: String,
    pub status: ConnectionStatus,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Protocol detail settled during the handshake, e.g. the WebSocket subprotocol
    pub negotiated: Option<String>,
}

impl ConnectionInfo {
    pub fn absent(protocol: Protocol) -> Self {
        ConnectionInfo {
            protocol,
            url: String::new(),
            status: ConnectionStatus::Disconnected,
            connected_at: None,
            last_error: None,
            negotiated: None,
        }
    }
}

#[derive(Debug)]
pub struct Session {
    id: String,
    info: Mutex<ConnectionInfo>,
    /// Cleared on disconnect or terminal error; traffic events stop with it
    live: AtomicBool,
    seq: AtomicU64,
    cancel: CancellationToken,
    events: EventSink,
}

impl Session {
    pub fn new(id: &str, protocol: Protocol, url: &str, events: EventSink) -> Arc<Self> {
        let mut info = ConnectionInfo::absent(protocol);
        info.url = url.to_string();
        Arc::new(Session {
            id: id.to_string(),
            info: Mutex::new(info),
            live: AtomicBool::new(true),
            seq: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            events,
        })
    }

    fn info_guard(&self) -> MutexGuard<'_, ConnectionInfo> {
        self.info.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn info(&self) -> ConnectionInfo {
        self.info_guard().clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.info_guard().status
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn set_negotiated(&self, detail: Option<String>) {
        self.info_guard().negotiated = detail;
    }

    /// Move to `next` if the state machine allows it
    pub fn transition(&self, next: ConnectionStatus) -> bool {
        let mut info = self.info_guard();
        if !info.status.can_transition(next) {
            tracing::debug!(id = %self.id, from = ?info.status, to = ?next, "Ignoring transition");
            return false;
        }
        tracing::debug!(id = %self.id, protocol = %info.protocol, from = ?info.status, to = ?next, "Status change");
        info.status = next;
        if next == ConnectionStatus::Connected {
            info.connected_at = Some(Utc::now());
        }
        true
    }

    /// Build the next message for this connection
    pub fn message(&self, direction: Direction, body: MessageBody) -> Message {
        Message {
            direction,
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            timestamp: Utc::now(),
            body,
        }
    }

    /// Emit a traffic event; dropped once the session is no longer live
    pub fn emit(&self, payload: EventPayload) {
        if self.is_live() {
            let _ = self.events.send(ManagerEvent::new(self.id.clone(), payload));
        }
    }

    pub fn emit_message(&self, direction: Direction, body: MessageBody) {
        if self.is_live() {
            let message = self.message(direction, body);
            self.emit(EventPayload::Message(message));
        }
    }

    fn emit_unchecked(&self, payload: EventPayload) {
        let _ = self.events.send(ManagerEvent::new(self.id.clone(), payload));
    }

    /// Synthetic lifecycle message from the relay itself. Still delivered while
    /// a local disconnect is winding down.
    pub fn emit_marker(&self, body: MessageBody) {
        let message = self.message(Direction::System, body);
        self.emit_unchecked(EventPayload::Message(message));
    }

    /// Terminal failure. Emits `error` unless the session is already winding down or over.
    pub fn fail(&self, err: &ManagerError) -> bool {
        if !self.transition(ConnectionStatus::Error) {
            return false;
        }
        self.info_guard().last_error = Some(err.to_string());
        tracing::warn!(id = %self.id, error = %err, "Connection failed");
        self.emit_unchecked(EventPayload::Error(ErrorPayload::from(err)));
        self.live.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        true
    }

    /// Local disconnect, phase one: stop traffic and enter `disconnecting`
    pub fn begin_disconnect(&self) -> bool {
        self.live.store(false, Ordering::SeqCst);
        let started = self.transition(ConnectionStatus::Disconnecting);
        self.cancel.cancel();
        started
    }

    /// Local disconnect, phase two
    pub fn finish_disconnect(&self, reason: Option<String>) {
        if self.transition(ConnectionStatus::Disconnected) {
            self.emit_unchecked(EventPayload::Disconnected { reason });
        }
    }

    /// The remote end closed; runs both disconnect phases at once
    pub fn close_remote(&self, reason: Option<String>) -> bool {
        if !self.begin_disconnect() {
            return false;
        }
        self.finish_disconnect(reason);
        true
    }
}

/// Registry entry for a persistent connection
pub struct Entry<C> {
    pub session: Arc<Session>,
    /// Protocol handle used by `send`; `None` while still connecting
    pub control: Option<C>,
    pub task: Option<JoinHandle<()>>,
}

/// Live connections for one manager, plus the bookkeeping every manager shares
pub struct Connections<C> {
    protocol: Protocol,
    registry: Arc<Registry<Entry<C>>>,
    events: EventSink,
    grace: Duration,
}

impl<C> Clone for Connections<C> {
    fn clone(&self) -> Self {
        Connections {
            protocol: self.protocol,
            registry: Arc::clone(&self.registry),
            events: self.events.clone(),
            grace: self.grace,
        }
    }
}

impl<C: Clone + Send + 'static> Connections<C> {
    pub fn new(protocol: Protocol, events: EventSink, grace: Duration) -> Self {
        Connections {
            protocol,
            registry: Arc::new(Registry::new()),
            events,
            grace,
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Claim the id and start a session in `connecting`.
    /// A dead entry left behind by a failed session may be replaced.
    pub fn reserve(&self, id: &str, url: &str) -> Result<Arc<Session>, ManagerError> {
        let session = Session::new(id, self.protocol, url, self.events.clone());
        let entry = Entry {
            session: Arc::clone(&session),
            control: None,
            task: None,
        };
        self.registry
            .register_with(id, entry, |old| old.session.status().is_terminal())?;
        session.transition(ConnectionStatus::Connecting);
        Ok(session)
    }

    /// Mark the session connected, store its control handle and start its read loop.
    /// If the session was disconnected meanwhile, the loop is never started.
    pub fn attach<F>(&self, session: &Arc<Session>, control: C, spawn: F) -> bool
    where
        F: FnOnce() -> JoinHandle<()>,
    {
        let mut start = Some((control, spawn));
        let attached = self
            .registry
            .with(session.id(), |entry| {
                if !Arc::ptr_eq(&entry.session, session)
                    || !session.transition(ConnectionStatus::Connected)
                {
                    return false;
                }
                if let Some((control, spawn)) = start.take() {
                    entry.control = Some(control);
                    entry.task = Some(spawn());
                }
                true
            })
            .unwrap_or(false);

        if !attached {
            session.cancel_token().cancel();
        }
        attached
    }

    /// Control handle of a connected session
    pub fn control(&self, id: &str) -> Result<(Arc<Session>, C), ManagerError> {
        self.registry
            .with(id, |entry| {
                let connected = entry.session.status() == ConnectionStatus::Connected;
                match (&entry.control, connected) {
                    (Some(control), true) => Some((Arc::clone(&entry.session), control.clone())),
                    _ => None,
                }
            })
            .flatten()
            .ok_or_else(|| ManagerError::ConnectionNotFound(id.to_string()))
    }

    pub fn info(&self, id: &str) -> ConnectionInfo {
        self.registry
            .with(id, |entry| entry.session.info())
            .unwrap_or_else(|| ConnectionInfo::absent(self.protocol))
    }

    /// Remove the entry and start disconnecting it.
    /// Returns `None` when there was nothing live to disconnect.
    pub fn detach(&self, id: &str) -> Option<Entry<C>> {
        let entry = self.registry.remove(id)?;
        if entry.session.begin_disconnect() {
            Some(entry)
        } else {
            None
        }
    }

    /// Detach everything, used at shutdown
    pub fn detach_all(&self) -> Vec<Entry<C>> {
        self.registry
            .remove_all()
            .into_iter()
            .filter_map(|(_, entry)| entry.session.begin_disconnect().then_some(entry))
            .collect()
    }

    /// Wait for the read loop to stop, then report `disconnected`
    pub async fn finish(&self, entry: Entry<C>, reason: Option<String>) {
        let Entry { session, task, .. } = entry;
        if let Some(mut task) = task {
            if tokio::time::timeout(self.grace, &mut task).await.is_err() {
                tracing::warn!(id = %session.id(), "Read loop did not stop in time, aborting");
                task.abort();
            }
        }
        session.finish_disconnect(reason);
    }

    /// The remote end went away on its own
    pub fn closed_by_remote(&self, session: &Arc<Session>, reason: Option<String>) {
        self.registry
            .remove_if(session.id(), |entry| Arc::ptr_eq(&entry.session, session));
        session.close_remote(reason);
    }

    /// Terminal error; the entry stays behind so `status` can report it
    pub fn fail(&self, session: &Arc<Session>, err: &ManagerError) {
        if session.fail(err) {
            self.registry.with(session.id(), |entry| {
                if Arc::ptr_eq(&entry.session, session) {
                    entry.control = None;
                    entry.task = None;
                }
            });
        }
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }
}

/// One lifecycle interface over every protocol
#[async_trait]
pub trait ConnectionManager: Send + Sync {
    fn protocol(&self) -> Protocol;

    async fn connect(&self, id: &str, options: ConnectOptions) -> Result<(), ManagerError>;

    async fn send(&self, id: &str, payload: OutboundPayload) -> Result<(), ManagerError>;

    /// No-op for ids without a live connection
    async fn disconnect(&self, id: &str);

    fn status(&self, id: &str) -> ConnectionInfo;

    /// Close every live connection before returning
    async fn shutdown(&self);
}
