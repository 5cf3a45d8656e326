//! SessionConnectionManager - owns the live link to one interview room.
//!
//! Architecture follows a reactor pattern:
//! - The manager opens a transport and spawns a driver task per link
//! - The driver consumes transport events and the connect deadline, and
//!   applies them to the link record under a short, never-awaited lock
//! - `connect()` waits on a oneshot that the first of join / error /
//!   deadline resolves; the sender is taken out of the record, so a second
//!   outcome finds nothing to resolve
//!
//! Lock order is manager slot, then link record. The driver never holds
//! the record while it touches the slot.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::error::{Result, SessionError, TransportError};
use crate::heartbeat::Heartbeat;
use crate::message::{OutboundMessage, RoomEvent};
use crate::policy::{Endpoint, ReconnectPolicy, SessionSettings};
use crate::state::ConnectionState;
use crate::transport::{Transport, TransportEvent, TransportFactory, TransportLink};

const ROOM_EVENT_CAPACITY: usize = 256;

/// Mutable part of a link. Only touched with `Link::record` held.
struct LinkRecord {
    room_id: String,
    state: ConnectionState,
    retry_count: u32,
    /// Some iff `state == Connected`
    heartbeat: Option<Heartbeat>,
    pending: Option<oneshot::Sender<Result<Connection>>>,
    /// Membership does not survive a transport-level handshake
    needs_join: bool,
    backlog: VecDeque<OutboundMessage>,
    last_pong: Option<DateTime<Utc>>,
    /// Torn down; ignore anything that still arrives
    closed: bool,
}

/// One transport plus everything the manager tracks about it.
struct Link {
    id: Uuid,
    name: String,
    transport: Arc<dyn Transport>,
    settings: SessionSettings,
    reconnect_budget: u32,
    record: Mutex<LinkRecord>,
    room_events: broadcast::Sender<RoomEvent>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
}

/// What the driver does after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    /// The link is finished; release the slot
    Detach,
}

impl Link {
    fn new(
        room_id: &str,
        transport: Arc<dyn Transport>,
        settings: SessionSettings,
        reconnect_budget: u32,
        state_tx: Arc<watch::Sender<ConnectionState>>,
    ) -> Self {
        let id = Uuid::new_v4();
        let (room_events, _) = broadcast::channel(ROOM_EVENT_CAPACITY);
        Self {
            id,
            name: format!("link-{}", &id.simple().to_string()[..8]),
            transport,
            settings,
            reconnect_budget,
            record: Mutex::new(LinkRecord {
                room_id: room_id.to_string(),
                state: ConnectionState::Idle,
                retry_count: 0,
                heartbeat: None,
                pending: None,
                needs_join: true,
                backlog: VecDeque::new(),
                last_pong: None,
                closed: false,
            }),
            room_events,
            state_tx,
        }
    }

    /// Move to `next`, keeping the heartbeat armed exactly while connected.
    fn enter(&self, rec: &mut LinkRecord, next: ConnectionState) {
        if rec.closed {
            return;
        }

        if next != ConnectionState::Connected {
            if let Some(heartbeat) = rec.heartbeat.take() {
                heartbeat.disarm();
            }
        }

        let prev = rec.state;
        rec.state = next;

        if next == ConnectionState::Connected && rec.heartbeat.is_none() {
            rec.heartbeat = Some(Heartbeat::arm(
                self.name.clone(),
                self.transport.clone(),
                self.settings.heartbeat_interval,
            ));
        }

        if prev != next {
            info!("{}: {} -> {} (room {})", self.name, prev, next, rec.room_id);
        }
        self.state_tx.send_replace(next);
    }

    /// Send the join message, then whatever queued up behind it.
    fn join(&self, rec: &mut LinkRecord) -> Result<(), TransportError> {
        self.transport.emit(OutboundMessage::join(rec.room_id.clone()))?;
        rec.needs_join = false;
        debug!("{}: joined room {}", self.name, rec.room_id);

        while let Some(message) = rec.backlog.pop_front() {
            if let Err(e) = self.transport.emit(message.clone()) {
                warn!("{}: failed to flush {}: {}", self.name, message.name(), e);
                rec.backlog.push_front(message);
                return Err(e);
            }
        }
        Ok(())
    }

    fn resolve(&self, rec: &mut LinkRecord, result: Result<Connection>) {
        if let Some(pending) = rec.pending.take() {
            // The caller may have given up waiting
            let _ = pending.send(result);
        }
    }

    /// Handshake done: join, arm the heartbeat, answer the caller.
    fn on_connected(self: &Arc<Self>, rec: &mut LinkRecord) {
        if rec.needs_join {
            if let Err(e) = self.join(rec) {
                warn!("{}: join failed: {}", self.name, e);
            }
        }
        rec.retry_count = 0;
        self.enter(rec, ConnectionState::Connected);
        self.resolve(rec, Ok(Connection { link: self.clone() }));
    }

    fn handle_event(self: &Arc<Self>, event: TransportEvent) -> (Flow, Option<SessionError>) {
        let mut rec = self.record.lock();
        if rec.closed {
            return (Flow::Detach, None);
        }

        match event {
            TransportEvent::Connect => {
                if rec.state == ConnectionState::Connected && !rec.needs_join {
                    trace!("{}: duplicate connect", self.name);
                } else {
                    self.on_connected(&mut rec);
                }
            }
            TransportEvent::ConnectError(reason) => {
                warn!("{}: connection failed: {}", self.name, reason);
                if rec.pending.is_some() {
                    let err = match reason {
                        TransportError::HandshakeTimeout(_) => SessionError::ConnectionTimeout {
                            room_id: rec.room_id.clone(),
                            timeout: self.settings.connect_timeout,
                        },
                        other => SessionError::from(other),
                    };
                    self.resolve(&mut rec, Err(err.clone()));
                    self.enter(&mut rec, ConnectionState::Failed);
                    return (Flow::Continue, Some(err));
                }
            }
            TransportEvent::Disconnect(reason) => {
                warn!("{}: disconnected: {}", self.name, reason);
                rec.needs_join = true;

                if reason.is_voluntary() {
                    self.resolve(&mut rec, Err(SessionError::Cancelled("transport closed")));
                    self.enter(&mut rec, ConnectionState::Idle);
                    return (Flow::Detach, None);
                }

                // A link that never connected, or already failed, stays put
                if rec.state == ConnectionState::Connected {
                    self.enter(&mut rec, ConnectionState::Reconnecting);
                }
                if reason.needs_resume_request() {
                    debug!("{}: asking transport to resume after server kick", self.name);
                    self.transport.reconnect();
                }
            }
            TransportEvent::ReconnectAttempt(attempt) => {
                debug!("{}: reconnection attempt {}", self.name, attempt);
                rec.retry_count = attempt;
                if rec.state == ConnectionState::Connected {
                    self.enter(&mut rec, ConnectionState::Reconnecting);
                }
            }
            TransportEvent::ReconnectError(reason) => {
                debug!(
                    "{}: reconnection attempt {} failed: {}",
                    self.name, rec.retry_count, reason
                );
            }
            TransportEvent::Reconnect(attempts) => {
                info!("{}: reconnected after {} attempts", self.name, attempts);
                if rec.state != ConnectionState::Connected || rec.needs_join {
                    self.on_connected(&mut rec);
                }
            }
            TransportEvent::ReconnectFailed => {
                error!(
                    "{}: reconnection failed after {} attempts",
                    self.name, self.reconnect_budget
                );
                let err = SessionError::ReconnectExhausted {
                    attempts: self.reconnect_budget,
                };
                self.resolve(&mut rec, Err(err.clone()));
                self.enter(&mut rec, ConnectionState::Failed);
                return (Flow::Detach, Some(err));
            }
            TransportEvent::Message { event, payload } => {
                let event = RoomEvent::new(event, payload);
                if event.is_pong() {
                    rec.last_pong = Some(event.received_at);
                }
                trace!("{}: room event {}", self.name, event.name);
                // No subscribers is fine
                let _ = self.room_events.send(event);
            }
        }

        (Flow::Continue, None)
    }

    /// The connect deadline passed. Soft: the handshake keeps going.
    fn on_deadline(self: &Arc<Self>) -> Option<SessionError> {
        let mut rec = self.record.lock();
        if rec.closed || rec.pending.is_none() {
            return None;
        }

        // A connect event may be racing the deadline
        if self.transport.is_connected() {
            debug!("{}: connected as the deadline fired", self.name);
            self.on_connected(&mut rec);
            return None;
        }

        let err = SessionError::ConnectionTimeout {
            room_id: rec.room_id.clone(),
            timeout: self.settings.connect_timeout,
        };
        warn!("{}: {}", self.name, err);
        self.resolve(&mut rec, Err(err.clone()));
        self.enter(&mut rec, ConnectionState::Failed);
        Some(err)
    }

    /// The event stream ended without a voluntary close.
    fn on_transport_gone(&self) -> SessionError {
        let mut rec = self.record.lock();
        let err = SessionError::from(TransportError::Closed);
        if !rec.closed {
            warn!("{}: transport event stream ended", self.name);
            self.resolve(&mut rec, Err(err.clone()));
            self.enter(&mut rec, ConnectionState::Failed);
        }
        err
    }

    /// Release everything: heartbeat first, then the transport, then the
    /// record.
    ///
    /// With `to_idle` unset the last state (e.g. Failed) stays visible.
    fn shut(&self, reason: &'static str, to_idle: bool) {
        let mut rec = self.record.lock();
        if rec.closed {
            return;
        }

        if let Some(heartbeat) = rec.heartbeat.take() {
            heartbeat.disarm();
        }
        self.transport.close();

        self.resolve(&mut rec, Err(SessionError::Cancelled(reason)));
        rec.backlog.clear();
        if to_idle {
            self.enter(&mut rec, ConnectionState::Idle);
        }
        rec.closed = true;
    }
}

/// A handle to the room link. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    link: Arc<Link>,
}

impl Connection {
    pub fn id(&self) -> Uuid {
        self.link.id
    }

    pub fn room_id(&self) -> String {
        self.link.record.lock().room_id.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.link.record.lock().state
    }

    /// Reconnection attempts since the link was last connected.
    pub fn retry_count(&self) -> u32 {
        self.link.record.lock().retry_count
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected && self.link.transport.is_connected()
    }

    /// When the server last answered a heartbeat.
    pub fn last_pong(&self) -> Option<DateTime<Utc>> {
        self.link.record.lock().last_pong
    }

    /// Send a named event into the room.
    ///
    /// While the link is resuming, messages wait in order and go out right
    /// after the join message on the next handshake.
    pub fn send(&self, event: &str, payload: Value) -> Result<()> {
        let message = OutboundMessage::event(event, payload);
        let mut rec = self.link.record.lock();
        if rec.closed {
            return Err(SessionError::NotConnected);
        }

        match rec.state {
            ConnectionState::Connected if !rec.needs_join => {
                self.link.transport.emit(message)?;
                Ok(())
            }
            ConnectionState::Connected
            | ConnectionState::Connecting
            | ConnectionState::Reconnecting => {
                if rec.backlog.len() >= self.link.settings.backlog_limit {
                    return Err(SessionError::BacklogFull(rec.backlog.len()));
                }
                debug!("{}: holding {} until joined", self.link.name, event);
                rec.backlog.push_back(message);
                Ok(())
            }
            ConnectionState::Idle | ConnectionState::Failed => Err(SessionError::NotConnected),
        }
    }

    /// Events the server pushes into the room, from now on.
    pub fn events(&self) -> impl Stream<Item = RoomEvent> + Send + 'static {
        BroadcastStream::new(self.link.room_events.subscribe()).filter_map(|event| event.ok())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rec = self.link.record.lock();
        f.debug_struct("Connection")
            .field("id", &self.link.id)
            .field("room_id", &rec.room_id)
            .field("state", &rec.state)
            .field("retry_count", &rec.retry_count)
            .finish()
    }
}

/// The active link and the task driving it.
struct ActiveLink {
    link: Arc<Link>,
    cancel: CancellationToken,
    driver: JoinHandle<()>,
}

impl ActiveLink {
    fn teardown(self, reason: &'static str) {
        self.cancel.cancel();
        self.driver.abort();
        self.link.shut(reason, true);
    }
}

struct Shared {
    active: Mutex<Option<ActiveLink>>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    last_error: Mutex<Option<SessionError>>,
}

impl Shared {
    fn record_error(&self, err: SessionError) {
        *self.last_error.lock() = Some(err);
    }

    /// Called by a driver whose link is finished.
    fn detach(&self, link_id: Uuid) {
        let finished = {
            let mut active = self.active.lock();
            match active.as_ref() {
                Some(current) if current.link.id == link_id => active.take(),
                _ => None,
            }
        };
        if let Some(finished) = finished {
            // We are the driver; don't abort ourselves
            finished.link.shut("link finished", false);
        }
    }
}

/// Owns the lifecycle of one realtime connection to an interview room:
/// connect, join, heartbeat, resume after drops, and teardown.
///
/// One manager per room view. Dropping the manager disconnects.
pub struct SessionConnectionManager {
    factory: Arc<dyn TransportFactory>,
    endpoint: Endpoint,
    policy: ReconnectPolicy,
    settings: SessionSettings,
    shared: Arc<Shared>,
}

impl SessionConnectionManager {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        endpoint: Endpoint,
        policy: ReconnectPolicy,
        settings: SessionSettings,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        Self {
            factory,
            endpoint,
            policy,
            settings,
            shared: Arc::new(Shared {
                active: Mutex::new(None),
                state_tx: Arc::new(state_tx),
                last_error: Mutex::new(None),
            }),
        }
    }

    pub fn from_config(factory: Arc<dyn TransportFactory>, config: &parleyconf::ParleyConfig) -> Self {
        Self::new(
            factory,
            Endpoint::from_config(config),
            ReconnectPolicy::from_config(config),
            SessionSettings::from_config(config),
        )
    }

    /// Produce a joined connection to `room_id`.
    ///
    /// If a link is already connected, the join message is re-sent on it
    /// and the same link is returned. Otherwise any previous link is
    /// released and a fresh transport is opened; the result arrives when
    /// the handshake completes, fails, or the connect deadline passes.
    pub async fn connect(&self, room_id: &str) -> Result<Connection> {
        if room_id.trim().is_empty() {
            return Err(SessionError::InvalidRoomId);
        }

        let outcome = {
            let mut active = self.shared.active.lock();

            if let Some(current) = active.as_ref() {
                let mut rec = current.link.record.lock();
                if rec.state == ConnectionState::Connected {
                    info!("{}: reusing connected link for room {}", current.link.name, room_id);
                    rec.room_id = room_id.to_string();
                    current.link.join(&mut rec)?;
                    return Ok(Connection {
                        link: current.link.clone(),
                    });
                }
            }

            if let Some(previous) = active.take() {
                debug!("{}: releasing previous link", previous.link.name);
                previous.teardown("superseded by a new connect");
            }

            let TransportLink { transport, events } =
                match self.factory.open(&self.endpoint, &self.policy) {
                    Ok(link) => link,
                    Err(e) => {
                        warn!("failed to open transport to {}: {}", self.endpoint, e);
                        let err = SessionError::from(e);
                        self.shared.record_error(err.clone());
                        self.shared.state_tx.send_replace(ConnectionState::Failed);
                        return Err(err);
                    }
                };

            let link = Arc::new(Link::new(
                room_id,
                transport,
                self.settings.clone(),
                self.policy.attempts,
                self.shared.state_tx.clone(),
            ));
            info!("{}: connecting to {} for room {}", link.name, self.endpoint, room_id);

            let (tx, rx) = oneshot::channel();
            {
                let mut rec = link.record.lock();
                rec.pending = Some(tx);
                link.enter(&mut rec, ConnectionState::Connecting);
            }

            let cancel = CancellationToken::new();
            let driver = tokio::spawn(drive(
                link.clone(),
                events,
                cancel.clone(),
                Arc::downgrade(&self.shared),
                self.settings.connect_timeout,
            ));
            *active = Some(ActiveLink {
                link,
                cancel,
                driver,
            });
            rx
        };

        match outcome.await {
            Ok(result) => result,
            Err(_) => Err(SessionError::Cancelled("link dropped")),
        }
    }

    /// Tear the link down: heartbeat, then transport, then state.
    /// Idempotent.
    pub fn disconnect(&self) {
        let previous = self.shared.active.lock().take();
        if let Some(previous) = previous {
            info!("{}: disconnecting", previous.link.name);
            previous.teardown("disconnected");
        }
    }

    /// The current link, if it is connected or resuming. Never touches
    /// the network.
    pub fn get_active_connection(&self) -> Option<Connection> {
        let active = self.shared.active.lock();
        let current = active.as_ref()?;
        let live = current.link.record.lock().state.is_live();
        live.then(|| Connection {
            link: current.link.clone(),
        })
    }

    /// State of the current link (Idle when there is none).
    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// The most recent failure, including ones no caller was waiting on.
    pub fn last_error(&self) -> Option<SessionError> {
        self.shared.last_error.lock().clone()
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

impl Drop for SessionConnectionManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Driver task: feeds transport events and the connect deadline into the
/// link until it is cancelled or finished.
async fn drive(
    link: Arc<Link>,
    mut events: mpsc::Receiver<TransportEvent>,
    cancel: CancellationToken,
    shared: Weak<Shared>,
    connect_timeout: Duration,
) {
    let deadline = tokio::time::sleep(connect_timeout);
    tokio::pin!(deadline);
    let mut deadline_armed = true;

    debug!("{}: driver started", link.name);

    loop {
        tokio::select! {
            // Events before the deadline, so a connect in the same tick wins
            biased;

            _ = cancel.cancelled() => break,

            event = events.recv() => {
                let (flow, failure) = match event {
                    Some(event) => link.handle_event(event),
                    None => (Flow::Detach, Some(link.on_transport_gone())),
                };

                if let Some(shared) = shared.upgrade() {
                    if let Some(err) = failure {
                        shared.record_error(err);
                    }
                    if flow == Flow::Detach {
                        shared.detach(link.id);
                    }
                }
                if flow == Flow::Detach {
                    break;
                }
            }

            _ = &mut deadline, if deadline_armed => {
                deadline_armed = false;
                if let Some(err) = link.on_deadline() {
                    if let Some(shared) = shared.upgrade() {
                        shared.record_error(err);
                    }
                }
            }
        }
    }

    debug!("{}: driver exiting", link.name);
}
