#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test utilities for channel-point-sounds integration tests.
//!
//! Provides a loopback [`MockConnector`] whose server halves are handed to the
//! test as connections are opened, a [`MockPlayer`] whose completions are
//! driven by the test, and builders for server frame JSON.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use channel_point_sounds::playback::ItemId;
use channel_point_sounds::{
    ChannelPointsError, Connector, PlaybackReporter, Player, SessionEvent, Sound, Transport,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;

// ── MockConnector ───────────────────────────────────────────────────

/// Client half of a loopback connection.
pub struct MockTransport {
    to_server: mpsc::UnboundedSender<String>,
    from_server: mpsc::UnboundedReceiver<String>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, message: String) -> Result<(), ChannelPointsError> {
        self.to_server
            .send(message)
            .map_err(|e| ChannelPointsError::TransportSend(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, ChannelPointsError>> {
        self.from_server.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), ChannelPointsError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Server half of a loopback connection.
pub struct MockServer {
    rx: mpsc::UnboundedReceiver<String>,
    tx: Option<mpsc::UnboundedSender<String>>,
    closed: Arc<AtomicBool>,
}

impl MockServer {
    /// Next frame the client sent, parsed.
    pub async fn recv_json(&mut self) -> Value {
        let raw = self.rx.recv().await.expect("client hung up");
        serde_json::from_str(&raw).expect("client sent invalid JSON")
    }

    /// Read the `LISTEN` frame and return its nonce.
    pub async fn expect_listen(&mut self) -> String {
        let listen = self.recv_json().await;
        assert_eq!(listen["type"], "LISTEN");
        listen["nonce"].as_str().expect("LISTEN without nonce").to_string()
    }

    pub fn send(&self, raw: impl Into<String>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(raw.into());
        }
    }

    /// Close the server side; the client's `recv` yields `None`.
    pub fn hang_up(&mut self) {
        self.tx = None;
    }

    /// Whether the client closed its half.
    pub fn client_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Opens loopback connections and hands each server half to the test.
#[derive(Clone)]
pub struct MockConnector {
    servers: mpsc::UnboundedSender<MockServer>,
    attempts: Arc<AtomicUsize>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, ChannelPointsError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, client_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        self.servers
            .send(MockServer {
                rx: server_rx,
                tx: Some(server_tx),
                closed: Arc::clone(&closed),
            })
            .map_err(|e| ChannelPointsError::Connect(e.to_string()))?;
        Ok(Box::new(MockTransport {
            to_server: client_tx,
            from_server: client_rx,
            closed,
        }))
    }
}

/// Test-side handle of a [`MockConnector`].
pub struct Connections {
    servers: mpsc::UnboundedReceiver<MockServer>,
    attempts: Arc<AtomicUsize>,
}

impl Connections {
    /// Wait for the next connection attempt.
    pub async fn accept(&mut self) -> MockServer {
        self.servers.recv().await.expect("connector dropped")
    }

    pub fn try_accept(&mut self) -> Option<MockServer> {
        self.servers.try_recv().ok()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

pub fn mock_connector() -> (MockConnector, Connections) {
    let (tx, rx) = mpsc::unbounded_channel();
    let attempts = Arc::new(AtomicUsize::new(0));
    (
        MockConnector {
            servers: tx,
            attempts: Arc::clone(&attempts),
        },
        Connections {
            servers: rx,
            attempts,
        },
    )
}

// ── MockPlayer ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum PlayerCall {
    Prepare(Sound),
    Play(Sound),
}

#[derive(Default)]
struct PlayerLog {
    calls: Vec<PlayerCall>,
    reporters: Vec<(ItemId, Sound, PlaybackReporter)>,
}

/// Records every call; the test decides when items finish or fail.
#[derive(Clone, Default)]
pub struct MockPlayer {
    log: Arc<StdMutex<PlayerLog>>,
}

impl MockPlayer {
    pub fn calls(&self) -> Vec<PlayerCall> {
        self.log.lock().unwrap().calls.clone()
    }

    /// Paths passed to `play`, in order.
    pub fn played(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                PlayerCall::Play(sound) => Some(sound.path.display().to_string()),
                PlayerCall::Prepare(_) => None,
            })
            .collect()
    }

    fn reporter_for(&self, path: &str) -> (ItemId, PlaybackReporter) {
        let log = self.log.lock().unwrap();
        log.reporters
            .iter()
            .rev()
            .find(|(_, sound, _)| sound.path.display().to_string() == path)
            .map(|(id, _, reporter)| (*id, reporter.clone()))
            .unwrap_or_else(|| panic!("{path} was never handed to the player"))
    }

    pub fn finish(&self, path: &str) {
        let (id, reporter) = self.reporter_for(path);
        reporter.finished(id);
    }

    pub fn fail(&self, path: &str, reason: &str) {
        let (id, reporter) = self.reporter_for(path);
        reporter.failed(id, reason);
    }
}

impl Player for MockPlayer {
    fn prepare(&mut self, id: ItemId, sound: &Sound, reporter: PlaybackReporter) {
        let mut log = self.log.lock().unwrap();
        log.calls.push(PlayerCall::Prepare(sound.clone()));
        log.reporters.push((id, sound.clone(), reporter));
    }

    fn play(&mut self, id: ItemId, sound: &Sound, reporter: PlaybackReporter) {
        let mut log = self.log.lock().unwrap();
        log.calls.push(PlayerCall::Play(sound.clone()));
        log.reporters.push((id, sound.clone(), reporter));
    }
}

// ── Event helpers ───────────────────────────────────────────────────

/// Receive events until one matches `pred`, failing after `within`.
pub async fn wait_for<F>(
    events: &mut mpsc::Receiver<SessionEvent>,
    within: Duration,
    mut pred: F,
) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    tokio::time::timeout(within, async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

// ── JSON helper functions ───────────────────────────────────────────

pub const IDENTITY: &str = "12345";

pub fn response_json(nonce: &str, error: &str) -> String {
    json!({ "type": "RESPONSE", "nonce": nonce, "error": error }).to_string()
}

pub fn pong_json() -> String {
    json!({ "type": "PONG" }).to_string()
}

pub fn reconnect_json() -> String {
    json!({ "type": "RECONNECT" }).to_string()
}

/// A `MESSAGE` frame carrying a `reward-redeemed` event for `title`.
pub fn redemption_json(title: &str) -> String {
    let message = json!({
        "type": "reward-redeemed",
        "data": {
            "timestamp": "2024-01-01T00:00:00Z",
            "redemption": {
                "id": "redemption-1",
                "user": { "id": "777", "login": "viewer", "display_name": "Viewer" },
                "channel_id": IDENTITY,
                "reward": { "id": "reward-1", "title": title, "cost": 100 },
                "user_input": null,
                "status": "UNFULFILLED"
            }
        }
    });
    json!({
        "type": "MESSAGE",
        "data": {
            "topic": format!("channel-points-channel-v1.{IDENTITY}"),
            "message": message.to_string()
        }
    })
    .to_string()
}
