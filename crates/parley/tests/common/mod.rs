//! Scripted in-memory transport for driving the session manager by hand.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use parley::{
    Endpoint, OutboundMessage, ReconnectPolicy, SessionConnectionManager, SessionSettings,
    Transport, TransportError, TransportEvent, TransportFactory, TransportLink,
};
use tokio::sync::mpsc;

/// Records everything the manager does to it.
#[derive(Default)]
pub struct MockTransport {
    pub connected: AtomicBool,
    pub emitted: Mutex<Vec<OutboundMessage>>,
    pub closes: AtomicUsize,
    pub reconnects: AtomicUsize,
}

impl MockTransport {
    pub fn joins(&self) -> Vec<String> {
        self.emitted
            .lock()
            .iter()
            .filter_map(|m| match m {
                OutboundMessage::Join { room_id } => Some(room_id.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn pings(&self) -> usize {
        self.emitted
            .lock()
            .iter()
            .filter(|m| matches!(m, OutboundMessage::Ping { .. }))
            .count()
    }

    pub fn names(&self) -> Vec<String> {
        self.emitted.lock().iter().map(|m| m.name().to_string()).collect()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn reconnects(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }
}

impl Transport for MockTransport {
    fn emit(&self, message: OutboundMessage) -> Result<(), TransportError> {
        if self.closes() > 0 {
            return Err(TransportError::Closed);
        }
        self.emitted.lock().push(message);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// One opened transport and the script that feeds its events.
#[derive(Clone)]
pub struct Script {
    pub transport: Arc<MockTransport>,
    pub events: mpsc::Sender<TransportEvent>,
}

impl Script {
    pub async fn push(&self, event: TransportEvent) {
        self.events.send(event).await.expect("manager stopped listening");
        settle().await;
    }

    /// Complete the handshake.
    pub async fn establish(&self) {
        self.transport.connected.store(true, Ordering::SeqCst);
        self.push(TransportEvent::Connect).await;
    }

    pub async fn drop_link(&self, event: TransportEvent) {
        self.transport.connected.store(false, Ordering::SeqCst);
        self.push(event).await;
    }
}

#[derive(Default)]
pub struct MockFactory {
    opened: Mutex<Vec<Script>>,
    /// Opens that happened while an earlier transport was still unclosed
    opened_while_live: AtomicUsize,
    pub fail_open: AtomicBool,
}

impl MockFactory {
    pub fn opens(&self) -> usize {
        self.opened.lock().len()
    }

    pub fn open_while_live(&self) -> usize {
        self.opened_while_live.load(Ordering::SeqCst)
    }

    pub fn last(&self) -> Script {
        self.opened.lock().last().cloned().expect("no transport opened")
    }
}

impl TransportFactory for MockFactory {
    fn open(
        &self,
        endpoint: &Endpoint,
        _policy: &ReconnectPolicy,
    ) -> Result<TransportLink, TransportError> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(TransportError::InvalidEndpoint {
                url: endpoint.to_string(),
                reason: "refused by test".into(),
            });
        }

        let mut opened = self.opened.lock();
        if opened.iter().any(|script| script.transport.closes() == 0) {
            self.opened_while_live.fetch_add(1, Ordering::SeqCst);
        }

        let transport = Arc::new(MockTransport::default());
        let (tx, rx) = mpsc::channel(64);
        opened.push(Script {
            transport: transport.clone(),
            events: tx,
        });
        Ok(TransportLink {
            transport,
            events: rx,
        })
    }
}

pub fn manager(factory: &Arc<MockFactory>) -> Arc<SessionConnectionManager> {
    Arc::new(SessionConnectionManager::new(
        factory.clone(),
        Endpoint::new("http://localhost:5000", "/socket.io"),
        ReconnectPolicy::default(),
        SessionSettings::default(),
    ))
}

/// Let spawned tasks catch up. Under a paused clock this costs no real time.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
