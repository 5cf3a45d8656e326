//! Session manager lifecycle against a scripted transport.
//!
//! All tests run on a paused clock, so the 20s connect deadline and the
//! 15s heartbeat cost nothing.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{manager, settle, MockFactory};
use parley::{
    ConnectionState, DisconnectReason, ErrorKind, OutboundMessage, SessionError, TransportError,
    TransportEvent,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::time::Instant;
use tokio_stream::StreamExt;

#[tokio::test(start_paused = true)]
async fn connect_joins_once_and_starts_heartbeat() {
    let factory = Arc::new(MockFactory::default());
    let manager = manager(&factory);

    let pending = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect("room-1").await }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(manager.state(), ConnectionState::Connecting);
    let script = factory.last();
    script.establish().await;

    let connection = pending.await.unwrap().unwrap();
    assert_eq!(connection.room_id(), "room-1");
    assert_eq!(connection.state(), ConnectionState::Connected);
    assert!(connection.is_connected());
    assert_eq!(script.transport.joins(), vec!["room-1".to_string()]);

    // First ping one interval after the join
    tokio::time::sleep(Duration::from_millis(14_900)).await;
    assert_eq!(script.transport.pings(), 0);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(script.transport.pings(), 1);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(script.transport.pings(), 3);
    assert_eq!(script.transport.joins().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn connect_reuses_connected_link() {
    let factory = Arc::new(MockFactory::default());
    let manager = manager(&factory);

    let pending = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect("room-1").await }
    });
    settle().await;
    let script = factory.last();
    script.establish().await;
    let first = pending.await.unwrap().unwrap();

    let second = manager.connect("room-2").await.unwrap();
    assert_eq!(first.id(), second.id());
    assert_eq!(factory.opens(), 1);
    assert_eq!(
        script.transport.joins(),
        vec!["room-1".to_string(), "room-2".to_string()]
    );
    assert_eq!(second.room_id(), "room-2");
}

#[tokio::test(start_paused = true)]
async fn silent_transport_times_out_after_twenty_seconds() {
    let factory = Arc::new(MockFactory::default());
    let manager = manager(&factory);

    let started = Instant::now();
    let err = manager.connect("room-1").await.unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(
        err,
        SessionError::ConnectionTimeout {
            room_id: "room-1".into(),
            timeout: Duration::from_secs(20),
        }
    );
    assert_eq!(err.kind(), ErrorKind::ConnectionTimeout);
    assert!(elapsed >= Duration::from_secs(20), "resolved after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(21), "resolved after {:?}", elapsed);
    assert_eq!(manager.state(), ConnectionState::Failed);
    assert!(manager.get_active_connection().is_none());
    assert_eq!(manager.last_error(), Some(err));
}

#[tokio::test(start_paused = true)]
async fn connect_racing_the_deadline_resolves_once() {
    let factory = Arc::new(MockFactory::default());
    let manager = manager(&factory);

    let pending = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect("room-1").await }
    });
    settle().await;
    let script = factory.last();

    // Handshake done on the wire, but the event arrives after the deadline
    script.transport.connected.store(true, Ordering::SeqCst);
    let connection = pending.await.unwrap().unwrap();
    assert_eq!(connection.state(), ConnectionState::Connected);

    script.push(TransportEvent::Connect).await;
    assert_eq!(script.transport.joins(), vec!["room-1".to_string()]);
    assert_eq!(manager.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn late_connect_after_timeout_becomes_active() {
    let factory = Arc::new(MockFactory::default());
    let manager = manager(&factory);

    let err = manager.connect("room-1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionTimeout);

    let script = factory.last();
    script.establish().await;

    let active = manager.get_active_connection().expect("late link is active");
    assert_eq!(active.state(), ConnectionState::Connected);
    assert_eq!(script.transport.joins(), vec!["room-1".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn first_handshake_failure_is_a_transport_error() {
    let factory = Arc::new(MockFactory::default());
    let manager = manager(&factory);

    let pending = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect("room-1").await }
    });
    settle().await;
    factory
        .last()
        .push(TransportEvent::ConnectError(TransportError::Handshake(
            "connection refused".into(),
        )))
        .await;

    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(
        err,
        SessionError::Transport(TransportError::Handshake("connection refused".into()))
    );
    assert_eq!(manager.state(), ConnectionState::Failed);
}

#[tokio::test(start_paused = true)]
async fn transport_handshake_timeout_is_a_connection_timeout() {
    let factory = Arc::new(MockFactory::default());
    let manager = manager(&factory);

    let pending = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect("room-1").await }
    });
    settle().await;
    factory
        .last()
        .push(TransportEvent::ConnectError(TransportError::HandshakeTimeout(
            Duration::from_secs(20),
        )))
        .await;

    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(
        err,
        SessionError::ConnectionTimeout {
            room_id: "room-1".into(),
            timeout: Duration::from_secs(20),
        }
    );
    assert_eq!(manager.state(), ConnectionState::Failed);
}

#[tokio::test(start_paused = true)]
async fn connect_while_connecting_releases_the_first_transport() {
    let factory = Arc::new(MockFactory::default());
    let manager = manager(&factory);

    let first = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect("room-1").await }
    });
    settle().await;
    let first_script = factory.last();

    let second = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect("room-2").await }
    });
    settle().await;

    assert_eq!(factory.opens(), 2);
    assert_eq!(first_script.transport.closes(), 1);
    assert_eq!(factory.open_while_live(), 0);
    assert_eq!(first.await.unwrap().unwrap_err().kind(), ErrorKind::Cancelled);

    let second_script = factory.last();
    second_script.establish().await;
    let connection = second.await.unwrap().unwrap();
    assert_eq!(connection.room_id(), "room-2");
    assert_eq!(second_script.transport.joins(), vec!["room-2".to_string()]);
    assert!(first_script.transport.joins().is_empty());
}

#[tokio::test(start_paused = true)]
async fn connect_after_failure_releases_the_failed_transport() {
    let factory = Arc::new(MockFactory::default());
    let manager = manager(&factory);

    let err = manager.connect("room-1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionTimeout);
    let failed = factory.last();
    assert_eq!(failed.transport.closes(), 0);

    let pending = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect("room-1").await }
    });
    settle().await;

    assert_eq!(factory.opens(), 2);
    assert_eq!(failed.transport.closes(), 1);
    assert_eq!(factory.open_while_live(), 0);

    factory.last().establish().await;
    pending.await.unwrap().unwrap();
    assert_eq!(manager.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn room_id_is_passed_through_untouched() {
    let factory = Arc::new(MockFactory::default());
    let manager = manager(&factory);

    let pending = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect(" r1 ").await }
    });
    settle().await;
    let script = factory.last();
    script.establish().await;

    let connection = pending.await.unwrap().unwrap();
    assert_eq!(connection.room_id(), " r1 ");
    assert_eq!(script.transport.joins(), vec![" r1 ".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn failing_factory_surfaces_immediately() {
    let factory = Arc::new(MockFactory::default());
    factory.fail_open.store(true, Ordering::SeqCst);
    let manager = manager(&factory);

    let err = manager.connect("room-1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransportError);
    assert_eq!(manager.state(), ConnectionState::Failed);
}

#[tokio::test(start_paused = true)]
async fn empty_room_id_is_rejected_without_opening() {
    let factory = Arc::new(MockFactory::default());
    let manager = manager(&factory);

    assert_eq!(manager.connect("  ").await.unwrap_err(), SessionError::InvalidRoomId);
    assert_eq!(factory.opens(), 0);
    assert_eq!(manager.state(), ConnectionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn disconnect_is_idempotent_and_stops_heartbeat() {
    let factory = Arc::new(MockFactory::default());
    let manager = manager(&factory);

    let pending = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect("room-1").await }
    });
    settle().await;
    let script = factory.last();
    script.establish().await;
    let connection = pending.await.unwrap().unwrap();

    manager.disconnect();
    manager.disconnect();

    assert_eq!(script.transport.closes(), 1);
    assert_eq!(manager.state(), ConnectionState::Idle);
    assert!(manager.get_active_connection().is_none());
    assert_eq!(
        connection.send("answer", json!({})).unwrap_err(),
        SessionError::NotConnected
    );

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(script.transport.pings(), 0);
}

#[tokio::test(start_paused = true)]
async fn disconnect_cancels_pending_connect() {
    let factory = Arc::new(MockFactory::default());
    let manager = manager(&factory);

    let pending = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect("room-1").await }
    });
    settle().await;

    manager.disconnect();
    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(manager.state(), ConnectionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn transport_drop_resumes_and_rejoins() {
    let factory = Arc::new(MockFactory::default());
    let manager = manager(&factory);

    let pending = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect("room-1").await }
    });
    settle().await;
    let script = factory.last();
    script.establish().await;
    let connection = pending.await.unwrap().unwrap();

    script
        .drop_link(TransportEvent::Disconnect(DisconnectReason::TransportClose))
        .await;
    assert_eq!(manager.state(), ConnectionState::Reconnecting);
    assert_eq!(script.transport.closes(), 0);
    assert_eq!(script.transport.reconnects(), 0);
    let active = manager.get_active_connection().expect("resuming link stays active");
    assert_eq!(active.id(), connection.id());

    script.push(TransportEvent::ReconnectAttempt(1)).await;
    script.push(TransportEvent::ReconnectAttempt(2)).await;
    assert_eq!(connection.retry_count(), 2);

    // No heartbeat while down
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(script.transport.pings(), 0);

    script.establish().await;
    script.push(TransportEvent::Reconnect(2)).await;

    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(connection.retry_count(), 0);
    assert_eq!(
        script.transport.joins(),
        vec!["room-1".to_string(), "room-1".to_string()]
    );
    assert_eq!(factory.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn server_kick_asks_transport_to_resume() {
    let factory = Arc::new(MockFactory::default());
    let manager = manager(&factory);

    let pending = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect("room-1").await }
    });
    settle().await;
    let script = factory.last();
    script.establish().await;
    pending.await.unwrap().unwrap();

    script
        .drop_link(TransportEvent::Disconnect(DisconnectReason::ServerDisconnect))
        .await;
    assert_eq!(script.transport.reconnects(), 1);
    assert_eq!(manager.state(), ConnectionState::Reconnecting);
}

#[tokio::test(start_paused = true)]
async fn client_disconnect_does_not_resume() {
    let factory = Arc::new(MockFactory::default());
    let manager = manager(&factory);

    let pending = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect("room-1").await }
    });
    settle().await;
    let script = factory.last();
    script.establish().await;
    pending.await.unwrap().unwrap();

    script
        .drop_link(TransportEvent::Disconnect(DisconnectReason::ClientDisconnect))
        .await;
    assert_eq!(script.transport.reconnects(), 0);
    assert_eq!(manager.state(), ConnectionState::Idle);
    assert!(manager.get_active_connection().is_none());
}

#[tokio::test(start_paused = true)]
async fn exhausted_reconnection_fails_the_link() {
    let factory = Arc::new(MockFactory::default());
    let manager = manager(&factory);
    let mut states = manager.subscribe();

    let pending = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect("room-1").await }
    });
    settle().await;
    let script = factory.last();
    script.establish().await;
    pending.await.unwrap().unwrap();

    script
        .drop_link(TransportEvent::Disconnect(DisconnectReason::PingTimeout))
        .await;
    for attempt in 1..=10 {
        script.push(TransportEvent::ReconnectAttempt(attempt)).await;
        script
            .push(TransportEvent::ReconnectError(TransportError::Handshake(
                "refused".into(),
            )))
            .await;
    }
    script.push(TransportEvent::ReconnectFailed).await;

    assert_eq!(manager.state(), ConnectionState::Failed);
    assert_eq!(*states.borrow_and_update(), ConnectionState::Failed);
    assert!(manager.get_active_connection().is_none());
    assert_eq!(
        manager.last_error(),
        Some(SessionError::ReconnectExhausted { attempts: 10 })
    );
    assert_eq!(script.transport.closes(), 1);

    // A fresh connect starts over on a new transport
    let pending = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect("room-1").await }
    });
    settle().await;
    assert_eq!(factory.opens(), 2);
    factory.last().establish().await;
    pending.await.unwrap().unwrap();
    assert_eq!(manager.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn backlog_flushes_after_join() {
    let factory = Arc::new(MockFactory::default());
    let manager = manager(&factory);

    let pending = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect("room-1").await }
    });
    settle().await;
    let script = factory.last();
    script.establish().await;
    let connection = pending.await.unwrap().unwrap();

    connection.send("startInterview", json!({ "n": 1 })).unwrap();
    script
        .drop_link(TransportEvent::Disconnect(DisconnectReason::TransportClose))
        .await;
    connection.send("finishSpeaking", json!({ "n": 2 })).unwrap();
    connection.send("finishSpeaking", json!({ "n": 3 })).unwrap();
    assert_eq!(
        script.transport.names(),
        vec!["joinInterview", "startInterview"]
    );

    script.establish().await;

    let emitted = script.transport.emitted.lock().clone();
    assert_eq!(
        emitted[2..].to_vec(),
        vec![
            OutboundMessage::join("room-1"),
            OutboundMessage::event("finishSpeaking", json!({ "n": 2 })),
            OutboundMessage::event("finishSpeaking", json!({ "n": 3 })),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn room_events_reach_subscribers() {
    let factory = Arc::new(MockFactory::default());
    let manager = manager(&factory);

    let pending = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect("room-1").await }
    });
    settle().await;
    let script = factory.last();
    script.establish().await;
    let connection = pending.await.unwrap().unwrap();
    let mut events = Box::pin(connection.events());

    assert!(connection.last_pong().is_none());
    script
        .push(TransportEvent::Message {
            event: "question".into(),
            payload: json!({ "text": "Tell me about yourself" }),
        })
        .await;
    script
        .push(TransportEvent::Message {
            event: "pong".into(),
            payload: json!({ "timestamp": 1 }),
        })
        .await;

    let question = events.next().await.unwrap();
    assert_eq!(question.name, "question");
    assert_eq!(question.payload["text"], "Tell me about yourself");
    let pong = events.next().await.unwrap();
    assert!(pong.is_pong());
    assert_eq!(connection.last_pong(), Some(pong.received_at));
}

#[tokio::test(start_paused = true)]
async fn dropping_the_manager_closes_the_transport() {
    let factory = Arc::new(MockFactory::default());
    let manager = manager(&factory);

    let pending = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect("room-1").await }
    });
    settle().await;
    let script = factory.last();
    script.establish().await;
    let connection = pending.await.unwrap().unwrap();

    drop(manager);
    assert_eq!(script.transport.closes(), 1);
    assert_eq!(connection.state(), ConnectionState::Idle);
}
