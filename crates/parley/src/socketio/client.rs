//! Socket.IO client transport over a WebSocket.
//!
//! One driver task per transport owns the socket. It performs the
//! Engine.IO and Socket.IO handshakes, answers server pings, watches for
//! silence, and runs the reconnection loop described by the
//! [`ReconnectPolicy`] it was opened with. The handle only talks to the
//! driver through a command channel and an atomic connected flag.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

use super::packet::{EnginePacket, Handshake, SocketPacket, DEFAULT_NAMESPACE};
use crate::error::TransportError;
use crate::message::OutboundMessage;
use crate::policy::{Endpoint, ReconnectPolicy};
use crate::transport::{DisconnectReason, Transport, TransportEvent, TransportFactory, TransportLink};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Depth of the event and command channels.
const CHANNEL_DEPTH: usize = 256;
/// Frames held while the socket is down; older ones are dropped first.
const OFFLINE_BUFFER: usize = 1024;

/// Build the WebSocket URL for an endpoint.
///
/// `http://host:5000` + `/socket.io` becomes
/// `ws://host:5000/socket.io/?EIO=4&transport=websocket`.
pub fn websocket_url(endpoint: &Endpoint) -> Result<Url, TransportError> {
    let invalid = |reason: String| TransportError::InvalidEndpoint {
        url: endpoint.to_string(),
        reason,
    };

    let mut url = Url::parse(&endpoint.base_url).map_err(|e| invalid(e.to_string()))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(invalid(format!("unsupported scheme {:?}", other))),
    };
    url.set_scheme(scheme)
        .map_err(|_| invalid(format!("cannot switch to {}", scheme)))?;

    let base_path = url.path().trim_end_matches('/').to_string();
    let path = endpoint.path.trim_matches('/');
    if path.is_empty() {
        url.set_path(&format!("{}/", base_path));
    } else {
        url.set_path(&format!("{}/{}/", base_path, path));
    }
    url.set_query(Some("EIO=4&transport=websocket"));
    url.set_fragment(None);
    Ok(url)
}

/// Opens [`SocketIoTransport`]s.
#[derive(Debug, Clone, Default)]
pub struct SocketIoFactory;

impl SocketIoFactory {
    pub fn new() -> Self {
        Self
    }
}

impl TransportFactory for SocketIoFactory {
    fn open(
        &self,
        endpoint: &Endpoint,
        policy: &ReconnectPolicy,
    ) -> Result<TransportLink, TransportError> {
        let url = websocket_url(endpoint)?;
        let (transport, events) = SocketIoTransport::spawn(url, policy.clone());
        Ok(TransportLink {
            transport: Arc::new(transport),
            events,
        })
    }
}

enum Command {
    Send(String),
    Reconnect,
    Close,
}

/// Handle to a running Socket.IO connection.
pub struct SocketIoTransport {
    url: Url,
    commands: mpsc::Sender<Command>,
    connected: Arc<AtomicBool>,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl SocketIoTransport {
    /// Start the driver task. The first handshake begins immediately.
    pub fn spawn(url: Url, policy: ReconnectPolicy) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (command_tx, command_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_DEPTH);
        let connected = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        let driver = Driver {
            url: url.clone(),
            policy,
            commands: command_rx,
            events: event_tx,
            connected: connected.clone(),
            cancel: cancel.clone(),
            offline: VecDeque::new(),
            rng: SmallRng::from_entropy(),
        };
        tokio::spawn(driver.run());

        let transport = Self {
            url,
            commands: command_tx,
            connected,
            closed: AtomicBool::new(false),
            cancel,
        };
        (transport, event_rx)
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl Transport for SocketIoTransport {
    fn emit(&self, message: OutboundMessage) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let frame = SocketPacket::event(message.name(), message.payload()).to_frame();
        self.commands.try_send(Command::Send(frame)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                TransportError::Other("outbound queue is full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn reconnect(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if self.commands.try_send(Command::Reconnect).is_err() {
            warn!("{}: could not request reconnection", self.url);
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // A queued Close may never be read while a handshake is in
        // flight; cancellation reaches the driver wherever it is.
        let _ = self.commands.try_send(Command::Close);
        self.cancel.cancel();
    }
}

impl Drop for SocketIoTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// How a connected session ended.
enum SessionEnd {
    Lost(DisconnectReason),
    Closed,
    /// Nobody is listening for events anymore
    Abandoned,
}

/// How waiting (for a delay or a resume request) ended.
enum Wait {
    Proceed,
    Stop,
}

struct Driver {
    url: Url,
    policy: ReconnectPolicy,
    commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<TransportEvent>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
    offline: VecDeque<String>,
    rng: SmallRng,
}

impl Driver {
    async fn run(mut self) {
        // 0 while making the first connection, n during reconnect attempt n
        let mut attempt: u32 = 0;

        loop {
            if attempt > 0 {
                if !self.notify(TransportEvent::ReconnectAttempt(attempt)).await {
                    break;
                }
                let delay = self.policy.delay_for_attempt(attempt, &mut self.rng);
                debug!("{}: reconnect attempt {} in {:?}", self.url, attempt, delay);
                if let Wait::Stop = self.pause(delay).await {
                    break;
                }
            }

            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => break,
                outcome = tokio::time::timeout(self.policy.timeout, handshake(&self.url)) => outcome,
            };

            let failure = match outcome {
                Ok(Ok((ws, hs))) => {
                    info!("{}: connected (sid {})", self.url, hs.sid);
                    self.connected.store(true, Ordering::SeqCst);
                    if !self.notify(TransportEvent::Connect).await {
                        break;
                    }
                    if attempt > 0 && !self.notify(TransportEvent::Reconnect(attempt)).await {
                        break;
                    }
                    attempt = 0;

                    let end = self.session(ws, &hs).await;
                    self.connected.store(false, Ordering::SeqCst);

                    match end {
                        SessionEnd::Closed => {
                            let _ = self
                                .events
                                .send(TransportEvent::Disconnect(DisconnectReason::ClientDisconnect))
                                .await;
                            break;
                        }
                        SessionEnd::Abandoned => break,
                        SessionEnd::Lost(reason) => {
                            info!("{}: disconnected ({})", self.url, reason);
                            let resume_requested = reason.needs_resume_request();
                            if !self.notify(TransportEvent::Disconnect(reason)).await {
                                break;
                            }
                            if resume_requested {
                                if let Wait::Stop = self.await_resume().await {
                                    break;
                                }
                            } else if !self.policy.enabled {
                                break;
                            }
                            attempt = 1;
                            continue;
                        }
                    }
                }
                Ok(Err(e)) => e,
                Err(_) => TransportError::HandshakeTimeout(self.policy.timeout),
            };

            warn!("{}: connect failed: {}", self.url, failure);
            let event = if attempt == 0 {
                TransportEvent::ConnectError(failure)
            } else {
                TransportEvent::ReconnectError(failure)
            };
            if !self.notify(event).await {
                break;
            }

            if !self.policy.enabled {
                break;
            }
            if attempt >= self.policy.attempts {
                warn!("{}: giving up after {} attempts", self.url, attempt);
                let _ = self.notify(TransportEvent::ReconnectFailed).await;
                break;
            }
            attempt += 1;
        }

        self.connected.store(false, Ordering::SeqCst);
        debug!("{}: driver stopped", self.url);
    }

    /// Pump one connected socket until it goes away.
    async fn session(&mut self, ws: WsStream, hs: &Handshake) -> SessionEnd {
        let (mut sink, mut source): (WsSink, WsSource) = ws.split();
        let silence = Duration::from_millis(hs.ping_interval + hs.ping_timeout);
        let watchdog = tokio::time::sleep(silence);
        tokio::pin!(watchdog);

        while let Some(frame) = self.offline.pop_front() {
            if let Err(e) = sink.send(Message::Text(frame.into())).await {
                debug!("{}: flush failed: {}", self.url, e);
                return SessionEnd::Lost(DisconnectReason::TransportError);
            }
        }

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    goodbye(&mut sink).await;
                    return SessionEnd::Closed;
                }

                command = self.commands.recv() => match command {
                    Some(Command::Send(frame)) => {
                        trace!("{}: -> {}", self.url, frame);
                        if let Err(e) = sink.send(Message::Text(frame.into())).await {
                            debug!("{}: send failed: {}", self.url, e);
                            return SessionEnd::Lost(DisconnectReason::TransportError);
                        }
                    }
                    Some(Command::Reconnect) => {}
                    Some(Command::Close) | None => {
                        goodbye(&mut sink).await;
                        return SessionEnd::Closed;
                    }
                },

                frame = source.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        match self.on_frame(text.as_str(), &mut sink).await {
                            Ok(Some(end)) => return end,
                            Ok(None) => {}
                            Err(()) => return SessionEnd::Lost(DisconnectReason::ParseError),
                        }
                        // Any server traffic proves liveness
                        watchdog.as_mut().reset(Instant::now() + silence);
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return SessionEnd::Lost(DisconnectReason::TransportClose);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("{}: socket error: {}", self.url, e);
                        return SessionEnd::Lost(DisconnectReason::TransportError);
                    }
                },

                _ = &mut watchdog => {
                    warn!("{}: no ping from server within {:?}", self.url, silence);
                    let _ = sink.close().await;
                    return SessionEnd::Lost(DisconnectReason::PingTimeout);
                }
            }
        }
    }

    /// Handle one inbound frame. `Err` means it could not be decoded.
    async fn on_frame(&mut self, text: &str, sink: &mut WsSink) -> Result<Option<SessionEnd>, ()> {
        trace!("{}: <- {}", self.url, text);
        let packet = EnginePacket::decode(text).map_err(|e| warn!("{}: bad frame: {}", self.url, e))?;

        match packet {
            EnginePacket::Ping(data) => {
                let pong = EnginePacket::Pong(data).encode();
                if sink.send(Message::Text(pong.into())).await.is_err() {
                    return Ok(Some(SessionEnd::Lost(DisconnectReason::TransportError)));
                }
            }
            EnginePacket::Close => {
                return Ok(Some(SessionEnd::Lost(DisconnectReason::TransportClose)));
            }
            EnginePacket::Message(body) => {
                let packet =
                    SocketPacket::decode(&body).map_err(|e| warn!("{}: bad packet: {}", self.url, e))?;
                if packet.namespace() != DEFAULT_NAMESPACE {
                    trace!("{}: ignoring packet for namespace {}", self.url, packet.namespace());
                    return Ok(None);
                }
                match packet {
                    SocketPacket::Event { name, args, .. } => {
                        let event = TransportEvent::Message {
                            event: name,
                            payload: SocketPacket::payload_of(args),
                        };
                        if !self.notify(event).await {
                            return Ok(Some(SessionEnd::Abandoned));
                        }
                    }
                    SocketPacket::Disconnect { .. } => {
                        return Ok(Some(SessionEnd::Lost(DisconnectReason::ServerDisconnect)));
                    }
                    SocketPacket::ConnectError { data, .. } => {
                        warn!("{}: server rejected namespace: {}", self.url, data);
                    }
                    SocketPacket::Connect { .. } | SocketPacket::Ack { .. } => {}
                }
            }
            EnginePacket::Open(_) | EnginePacket::Pong(_) | EnginePacket::Upgrade | EnginePacket::Noop => {}
        }
        Ok(None)
    }

    /// Sleep before a reconnect attempt, still honoring close requests.
    async fn pause(&mut self, delay: Duration) -> Wait {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Wait::Stop,
                _ = &mut sleep => return Wait::Proceed,
                command = self.commands.recv() => {
                    if let Wait::Stop = self.offline_command(command) {
                        return Wait::Stop;
                    }
                }
            }
        }
    }

    /// After a server kick, stay down until asked to resume.
    async fn await_resume(&mut self) -> Wait {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Wait::Stop,
                command = self.commands.recv() => match command {
                    Some(Command::Reconnect) => return Wait::Proceed,
                    other => {
                        if let Wait::Stop = self.offline_command(other) {
                            return Wait::Stop;
                        }
                    }
                },
            }
        }
    }

    fn offline_command(&mut self, command: Option<Command>) -> Wait {
        match command {
            Some(Command::Send(frame)) => {
                if self.offline.len() >= OFFLINE_BUFFER {
                    self.offline.pop_front();
                    warn!("{}: offline buffer full, dropping oldest frame", self.url);
                }
                self.offline.push_back(frame);
                Wait::Proceed
            }
            Some(Command::Reconnect) => Wait::Proceed,
            Some(Command::Close) | None => Wait::Stop,
        }
    }

    async fn notify(&self, event: TransportEvent) -> bool {
        self.events.send(event).await.is_ok()
    }
}

/// Leave the namespace and close the Engine.IO session.
async fn goodbye(sink: &mut WsSink) {
    let _ = sink.send(Message::Text(SocketPacket::disconnect().to_frame().into())).await;
    let _ = sink.send(Message::Text(EnginePacket::Close.encode().into())).await;
    let _ = sink.close().await;
}

/// Open the socket and complete both handshakes.
async fn handshake(url: &Url) -> Result<(WsStream, Handshake), TransportError> {
    let (mut ws, _) = connect_async(url.as_str())
        .await
        .map_err(|e| TransportError::Handshake(e.to_string()))?;

    let mut open: Option<Handshake> = None;
    while let Some(frame) = ws.next().await {
        let text = match frame.map_err(|e| TransportError::Handshake(e.to_string()))? {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let packet =
            EnginePacket::decode(text.as_str()).map_err(|e| TransportError::Handshake(e.to_string()))?;

        match packet {
            EnginePacket::Open(hs) => {
                ws.send(Message::Text(SocketPacket::connect().to_frame().into()))
                    .await
                    .map_err(|e| TransportError::Handshake(e.to_string()))?;
                open = Some(hs);
            }
            EnginePacket::Ping(data) => {
                ws.send(Message::Text(EnginePacket::Pong(data).encode().into()))
                    .await
                    .map_err(|e| TransportError::Handshake(e.to_string()))?;
            }
            EnginePacket::Message(body) => {
                let packet =
                    SocketPacket::decode(&body).map_err(|e| TransportError::Handshake(e.to_string()))?;
                if packet.namespace() != DEFAULT_NAMESPACE {
                    continue;
                }
                match packet {
                    SocketPacket::Connect { .. } => {
                        return match open {
                            Some(hs) => Ok((ws, hs)),
                            None => Err(TransportError::Handshake(
                                "namespace ack before open packet".to_string(),
                            )),
                        };
                    }
                    SocketPacket::ConnectError { data, .. } => {
                        let message = data
                            .get("message")
                            .and_then(|m| m.as_str())
                            .map(str::to_string)
                            .unwrap_or_else(|| data.to_string());
                        return Err(TransportError::Handshake(message));
                    }
                    _ => continue,
                }
            }
            EnginePacket::Close => break,
            _ => continue,
        }
    }

    Err(TransportError::Handshake("socket closed during handshake".to_string()))
}
