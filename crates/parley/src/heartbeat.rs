//! Keep-alive pings for a connected room link.
//!
//! The server drops idle realtime connections, so while a link is connected
//! a ping goes out every interval. The first ping fires one full interval
//! after arming.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::message::OutboundMessage;
use crate::transport::Transport;

/// A running heartbeat. Dropping it stops the pings.
///
/// Stopping takes the same lock a tick holds while it sends, so once
/// [`Heartbeat::disarm`] (or drop) returns no ping can reach the transport,
/// not even one that was already in flight on another worker thread.
pub struct Heartbeat {
    live: Arc<Mutex<bool>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Heartbeat {
    /// Start pinging through `transport` every `interval`.
    pub fn arm(name: String, transport: Arc<dyn Transport>, interval: Duration) -> Self {
        let live = Arc::new(Mutex::new(true));
        let cancel = CancellationToken::new();

        let task_live = live.clone();
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            debug!("{}: heartbeat armed (interval: {:?})", name, interval);

            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if !beat(&name, &task_live, transport.as_ref()) {
                            break;
                        }
                    }
                }
            }

            debug!("{}: heartbeat stopped", name);
        });

        Self { live, cancel, task }
    }

    /// Stop pinging. No ping is sent after this returns.
    pub fn disarm(self) {
        drop(self);
    }

    fn stop(&self) {
        *self.live.lock() = false;
        self.cancel.cancel();
        self.task.abort();
    }
}

/// One tick. Returns false once the heartbeat has been stopped.
fn beat(name: &str, live: &Mutex<bool>, transport: &dyn Transport) -> bool {
    let live = live.lock();
    if !*live {
        return false;
    }
    if !transport.is_connected() {
        debug!("{}: transport down, skipping heartbeat", name);
        return true;
    }
    match transport.emit(OutboundMessage::ping_now()) {
        Ok(()) => trace!("{}: heartbeat sent", name),
        Err(e) => warn!("{}: heartbeat send failed: {}", name, e),
    }
    true
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop();
    }
}
