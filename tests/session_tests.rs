#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! End-to-end session tests over a loopback connector.
//!
//! Every test runs with tokio's clock paused, so listen, ping and pong
//! deadlines and retry delays elapse instantly but in order.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use channel_point_sounds::{
    ChannelPointsError, Connector, Identity, ListenError, QueueMode, Session, SessionConfig,
    SessionEvent, Sound, Transport,
};
use common::{
    mock_connector, pong_json, reconnect_json, redemption_json, response_json, wait_for,
    Connections, MockPlayer, MockServer, PlayerCall, IDENTITY,
};
use tokio::sync::mpsc;
use tokio::time::Instant;

const WAIT: Duration = Duration::from_secs(600);

fn config(mode: QueueMode) -> SessionConfig {
    SessionConfig::new("oauth-token")
        .with_sound("A", Sound::from_percent("a.mp3", 100))
        .with_sound("B", Sound::from_percent("b.mp3", 50))
        .with_sound("C", Sound::from_percent("c.mp3", 25))
        .with_queue_mode(mode)
}

async fn start(
    mode: QueueMode,
) -> (Session, mpsc::Receiver<SessionEvent>, Connections, MockPlayer) {
    let (connector, connections) = mock_connector();
    let player = MockPlayer::default();
    let (session, events) = Session::start(
        &Identity::new(IDENTITY),
        connector,
        player.clone(),
        config(mode),
    )
    .await
    .unwrap();
    (session, events, connections, player)
}

/// Accept the connection and confirm the subscription.
async fn listen(
    connections: &mut Connections,
    events: &mut mpsc::Receiver<SessionEvent>,
) -> MockServer {
    let mut server = connections.accept().await;
    let nonce = server.expect_listen().await;
    server.send(response_json(&nonce, ""));
    wait_for(events, WAIT, |e| *e == SessionEvent::Listening).await;
    server
}

async fn wait_disconnected(events: &mut mpsc::Receiver<SessionEvent>) -> Option<Duration> {
    match wait_for(events, WAIT, |e| matches!(e, SessionEvent::Disconnected { .. })).await {
        SessionEvent::Disconnected { retry_in } => retry_in,
        _ => unreachable!(),
    }
}

fn assert_about(actual: Duration, expected: Duration, tolerance: Duration) {
    assert!(
        actual + tolerance >= expected && actual <= expected + tolerance,
        "expected ~{expected:?}, got {actual:?}"
    );
}

fn assert_jittered(delay: Duration, base: Duration) {
    let low = base.mul_f64(0.9);
    let high = base.mul_f64(1.1);
    assert!(
        delay >= low && delay <= high,
        "{delay:?} outside {low:?}..={high:?}"
    );
}

// ════════════════════════════════════════════════════════════════════
// Connection lifecycle
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn listen_is_sent_and_confirmed() {
    let (mut session, mut events, mut connections, _player) = start(QueueMode::Sequential).await;

    assert_eq!(events.recv().await, Some(SessionEvent::Connecting));
    let mut server = connections.accept().await;
    assert_eq!(events.recv().await, Some(SessionEvent::Connected));

    let listen = server.recv_json().await;
    assert_eq!(listen["type"], "LISTEN");
    assert_eq!(listen["data"]["auth_token"], "oauth-token");
    assert_eq!(
        listen["data"]["topics"],
        serde_json::json!([format!("channel-points-channel-v1.{IDENTITY}")])
    );

    let nonce = listen["nonce"].as_str().unwrap().to_string();
    server.send(response_json(&nonce, ""));
    assert_eq!(events.recv().await, Some(SessionEvent::Listening));

    // The listen deadline was cancelled: nothing happens for well past 10 s.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(events.try_recv().is_err());
    assert_eq!(connections.attempts(), 1);

    session.shutdown().await;
    assert!(server.client_closed());
}

#[tokio::test(start_paused = true)]
async fn rejected_listen_stops_for_good() {
    let (_session, mut events, mut connections, _player) = start(QueueMode::Sequential).await;

    let mut server = connections.accept().await;
    let nonce = server.expect_listen().await;
    server.send(response_json(&nonce, "ERR_BADAUTH"));

    assert_eq!(
        wait_for(&mut events, WAIT, |e| matches!(e, SessionEvent::ListenFailed { .. })).await,
        SessionEvent::ListenFailed {
            error: ListenError::BadAuth
        }
    );
    assert_eq!(wait_disconnected(&mut events).await, None);
    assert!(server.client_closed());

    // Nothing left to do: the loop exits and the event channel closes.
    assert_eq!(events.recv().await, None);

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert_eq!(connections.attempts(), 1);
    assert!(connections.try_accept().is_none());
}

#[tokio::test(start_paused = true)]
async fn missing_response_forces_close_and_retry() {
    let (mut session, mut events, mut connections, _player) = start(QueueMode::Sequential).await;

    let mut server = connections.accept().await;
    server.expect_listen().await;
    let opened = Instant::now();

    let retry_in = wait_disconnected(&mut events).await.unwrap();
    assert_about(opened.elapsed(), Duration::from_secs(10), Duration::from_millis(50));
    assert_jittered(retry_in, Duration::from_secs(1));
    assert!(server.client_closed());

    let closed = Instant::now();
    let mut server = connections.accept().await;
    assert_about(closed.elapsed(), retry_in, Duration::from_millis(50));
    server.expect_listen().await;
    assert_eq!(connections.attempts(), 2);

    session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn response_for_another_nonce_is_ignored() {
    let (mut session, mut events, mut connections, _player) = start(QueueMode::Sequential).await;

    let mut server = connections.accept().await;
    server.expect_listen().await;
    server.send(response_json("some-other-request", ""));

    // No confirmation: the listen deadline still fires.
    let event = wait_for(&mut events, WAIT, |e| {
        matches!(e, SessionEvent::Listening | SessionEvent::Disconnected { .. })
    })
    .await;
    assert!(matches!(event, SessionEvent::Disconnected { retry_in: Some(_) }));

    session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn missing_pong_forces_close_and_retry() {
    let (mut session, mut events, mut connections, _player) = start(QueueMode::Sequential).await;
    let mut server = listen(&mut connections, &mut events).await;

    let ping = server.recv_json().await;
    assert_eq!(ping["type"], "PING");
    let pinged = Instant::now();

    let retry_in = wait_disconnected(&mut events).await.unwrap();
    assert_about(pinged.elapsed(), Duration::from_secs(10), Duration::from_millis(50));
    // The successful open reset the backoff.
    assert_jittered(retry_in, Duration::from_secs(1));

    let mut server = connections.accept().await;
    server.expect_listen().await;

    session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn pong_keeps_connection_alive() {
    let (mut session, mut events, mut connections, _player) = start(QueueMode::Sequential).await;
    let mut server = listen(&mut connections, &mut events).await;
    let listening = Instant::now();

    let ping = server.recv_json().await;
    assert_eq!(ping["type"], "PING");
    let first_ping = listening.elapsed();
    assert_jittered(first_ping, Duration::from_secs(270));
    server.send(pong_json());

    let ping = server.recv_json().await;
    assert_eq!(ping["type"], "PING");
    server.send(pong_json());

    assert!(events.try_recv().is_err());
    assert_eq!(connections.attempts(), 1);

    session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn reconnect_frame_reopens_and_resubscribes() {
    let (mut session, mut events, mut connections, _player) = start(QueueMode::Sequential).await;
    let server = listen(&mut connections, &mut events).await;

    server.send(reconnect_json());
    let retry_in = wait_disconnected(&mut events).await;
    assert!(retry_in.is_some());
    assert!(server.client_closed());

    let mut server = listen(&mut connections, &mut events).await;
    assert_eq!(connections.attempts(), 2);
    server.hang_up();
    assert!(wait_disconnected(&mut events).await.is_some());

    session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn hang_up_after_open_retries_from_min_delay() {
    let (mut session, mut events, mut connections, _player) = start(QueueMode::Sequential).await;

    for _ in 0..5 {
        let mut server = connections.accept().await;
        server.hang_up();
        // Each open resets the backoff.
        assert_jittered(
            wait_disconnected(&mut events).await.unwrap(),
            Duration::from_secs(1),
        );
    }

    session.shutdown().await;
}

struct Refusing;

#[async_trait]
impl Connector for Refusing {
    async fn connect(&self) -> Result<Box<dyn Transport>, ChannelPointsError> {
        Err(ChannelPointsError::Connect("connection refused".into()))
    }
}

/// Accepts every frame but never yields one, and never finishes closing.
struct Unresponsive;

#[async_trait]
impl Transport for Unresponsive {
    async fn send(&mut self, _message: String) -> Result<(), ChannelPointsError> {
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, ChannelPointsError>> {
        std::future::pending().await
    }

    async fn close(&mut self) -> Result<(), ChannelPointsError> {
        std::future::pending().await
    }
}

#[derive(Clone, Default)]
struct UnresponsiveConnector {
    attempts: Arc<AtomicUsize>,
}

#[async_trait]
impl Connector for UnresponsiveConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, ChannelPointsError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(Unresponsive))
    }
}

#[tokio::test(start_paused = true)]
async fn stuck_close_does_not_stall_reconnects() {
    let connector = UnresponsiveConnector::default();
    let (mut session, mut events) = Session::start(
        &Identity::new(IDENTITY),
        connector.clone(),
        MockPlayer::default(),
        config(QueueMode::Sequential),
    )
    .await
    .unwrap();

    let opened = Instant::now();
    let retry_in = wait_disconnected(&mut events).await;
    assert!(retry_in.is_some());
    assert_about(opened.elapsed(), Duration::from_secs(10), Duration::from_millis(50));

    // The listen deadline keeps firing on every new connection.
    wait_for(&mut events, Duration::from_secs(60), |e| *e == SessionEvent::Connected).await;
    assert!(wait_disconnected(&mut events).await.is_some());
    assert!(connector.attempts.load(Ordering::SeqCst) >= 2);

    session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failed_connects_back_off_up_to_the_cap() {
    let (mut session, mut events) = Session::start(
        &Identity::new(IDENTITY),
        Refusing,
        MockPlayer::default(),
        config(QueueMode::Sequential),
    )
    .await
    .unwrap();

    for base in [1, 2, 4, 8, 16, 32, 60, 60] {
        let delay = wait_disconnected(&mut events).await.unwrap();
        assert_jittered(delay, Duration::from_secs(base));
    }

    session.shutdown().await;
}

// ════════════════════════════════════════════════════════════════════
// Redemptions and playback
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn sequential_redemptions_play_in_order() {
    let (mut session, mut events, mut connections, player) = start(QueueMode::Sequential).await;
    let server = listen(&mut connections, &mut events).await;

    for title in ["A", "B", "C"] {
        server.send(redemption_json(title));
    }
    wait_for(&mut events, WAIT, |e| {
        matches!(e, SessionEvent::SoundQueued { path, .. } if path.ends_with("c.mp3"))
    })
    .await;
    assert_eq!(
        player.calls(),
        vec![
            PlayerCall::Play(Sound::from_percent("a.mp3", 100)),
            PlayerCall::Prepare(Sound::from_percent("b.mp3", 50)),
            PlayerCall::Prepare(Sound::from_percent("c.mp3", 25)),
        ]
    );

    player.finish("a.mp3");
    wait_for(&mut events, WAIT, |e| {
        matches!(e, SessionEvent::SoundPlaying { path, .. } if path.ends_with("b.mp3"))
    })
    .await;

    player.fail("b.mp3", "cannot decode");
    wait_for(&mut events, WAIT, |e| {
        matches!(e, SessionEvent::SoundPlaying { path, .. } if path.ends_with("c.mp3"))
    })
    .await;

    assert_eq!(player.played(), vec!["a.mp3", "b.mp3", "c.mp3"]);
    session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn concurrent_redemptions_play_immediately() {
    let (mut session, mut events, mut connections, player) = start(QueueMode::Concurrent).await;
    let server = listen(&mut connections, &mut events).await;

    for title in ["A", "B", "C"] {
        server.send(redemption_json(title));
    }
    wait_for(&mut events, WAIT, |e| {
        matches!(e, SessionEvent::SoundPlaying { path, .. } if path.ends_with("c.mp3"))
    })
    .await;

    assert_eq!(player.played(), vec!["a.mp3", "b.mp3", "c.mp3"]);
    assert!(player
        .calls()
        .iter()
        .all(|call| matches!(call, PlayerCall::Play(_))));

    session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn playback_continues_across_reconnects() {
    let (mut session, mut events, mut connections, player) = start(QueueMode::Sequential).await;
    let mut server = listen(&mut connections, &mut events).await;

    server.send(redemption_json("A"));
    server.send(redemption_json("B"));
    wait_for(&mut events, WAIT, |e| matches!(e, SessionEvent::SoundQueued { .. })).await;

    server.hang_up();
    wait_disconnected(&mut events).await;

    player.finish("a.mp3");
    wait_for(&mut events, WAIT, |e| {
        matches!(e, SessionEvent::SoundPlaying { path, .. } if path.ends_with("b.mp3"))
    })
    .await;

    listen(&mut connections, &mut events).await;
    session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unconfigured_reward_is_reported() {
    let (mut session, mut events, mut connections, player) = start(QueueMode::Sequential).await;
    let server = listen(&mut connections, &mut events).await;

    server.send(redemption_json("Hydrate"));
    assert_eq!(
        wait_for(&mut events, WAIT, |e| matches!(e, SessionEvent::NoSoundConfigured { .. })).await,
        SessionEvent::NoSoundConfigured {
            title: "Hydrate".into()
        }
    );
    assert!(player.calls().is_empty());

    session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn garbage_frames_do_not_disturb_the_session() {
    let (mut session, mut events, mut connections, player) = start(QueueMode::Sequential).await;
    let server = listen(&mut connections, &mut events).await;

    server.send("not json at all");
    server.send(r#"{"type":"SOMETHING_NEW"}"#);
    server.send(r#"{"type":"MESSAGE","data":{"topic":"channel-points-channel-v1.12345","message":"{oops"}}"#);
    server.send(redemption_json("A"));

    wait_for(&mut events, WAIT, |e| matches!(e, SessionEvent::SoundPlaying { .. })).await;
    assert_eq!(player.played(), vec!["a.mp3"]);
    assert_eq!(connections.attempts(), 1);

    session.shutdown().await;
}
