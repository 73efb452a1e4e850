//! # Loopback Session Example
//!
//! Runs a full session against an in-process fake server. Shows how to
//! implement [`Transport`] and [`Connector`] yourself, which is useful for:
//!
//! - **Testing**: exercise redemption handling without a real server
//! - **Custom backends**: adapt any I/O layer that carries JSON text frames
//!
//! The player only logs, so no audio device is needed.
//!
//! ## Running
//!
//! ```sh
//! cargo run --example loopback_session
//! ```

use async_trait::async_trait;
use channel_point_sounds::playback::ItemId;
use channel_point_sounds::{
    ChannelPointsError, Connector, Identity, PlaybackReporter, Player, Session, SessionConfig,
    SessionEvent, Sound, Transport,
};
use tokio::sync::mpsc;

// ─────────────────────────────────────────────────────────────────────
// Step 1: A channel-based loopback transport
// ─────────────────────────────────────────────────────────────────────

/// Client half: handed to the session by [`LoopbackConnector`].
pub struct LoopbackTransport {
    tx: mpsc::UnboundedSender<String>,
    rx: mpsc::UnboundedReceiver<String>,
}

/// Server half: read what the client sent and answer as the server would.
pub struct LoopbackServer {
    pub rx: mpsc::UnboundedReceiver<String>,
    pub tx: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&mut self, message: String) -> Result<(), ChannelPointsError> {
        self.tx
            .send(message)
            .map_err(|e| ChannelPointsError::TransportSend(e.to_string()))
    }

    /// Cancel-safe because `mpsc::UnboundedReceiver::recv` is.
    async fn recv(&mut self) -> Option<Result<String, ChannelPointsError>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), ChannelPointsError> {
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────
// Step 2: A connector that opens one loopback pair per attempt
// ─────────────────────────────────────────────────────────────────────

pub struct LoopbackConnector {
    servers: mpsc::UnboundedSender<LoopbackServer>,
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, ChannelPointsError> {
        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, client_rx) = mpsc::unbounded_channel();
        self.servers
            .send(LoopbackServer {
                rx: server_rx,
                tx: server_tx,
            })
            .map_err(|e| ChannelPointsError::Connect(e.to_string()))?;
        Ok(Box::new(LoopbackTransport {
            tx: client_tx,
            rx: client_rx,
        }))
    }
}

// ─────────────────────────────────────────────────────────────────────
// Step 3: A player that pretends to play
// ─────────────────────────────────────────────────────────────────────

struct LogPlayer;

impl Player for LogPlayer {
    fn prepare(&mut self, id: ItemId, sound: &Sound, _reporter: PlaybackReporter) {
        tracing::info!("[player] buffering #{id} {}", sound.path.display());
    }

    fn play(&mut self, id: ItemId, sound: &Sound, reporter: PlaybackReporter) {
        tracing::info!(
            "[player] playing #{id} {} at {:.0}%",
            sound.path.display(),
            sound.volume * 100.0
        );
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            reporter.finished(id);
        });
    }
}

// ─────────────────────────────────────────────────────────────────────
// Step 4: Wire the session to the fake server
// ─────────────────────────────────────────────────────────────────────

fn redemption(channel_id: &str, title: &str) -> String {
    let message = serde_json::json!({
        "type": "reward-redeemed",
        "data": { "redemption": { "reward": { "title": title } } }
    });
    serde_json::json!({
        "type": "MESSAGE",
        "data": {
            "topic": format!("channel-points-channel-v1.{channel_id}"),
            "message": message.to_string()
        }
    })
    .to_string()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let (servers_tx, mut servers_rx) = mpsc::unbounded_channel();
    let connector = LoopbackConnector { servers: servers_tx };
    let config = SessionConfig::new("demo-token")
        .with_sound("Airhorn", Sound::from_percent("sounds/airhorn.mp3", 80))
        .with_sound("Bonk", Sound::from_percent("sounds/bonk.wav", 100));

    let (mut session, mut event_rx) =
        Session::start(&Identity::new("1234"), connector, LogPlayer, config).await?;

    // ── Fake server: confirm the subscription ───────────────────────
    let Some(mut server) = servers_rx.recv().await else {
        return Err("session never connected".into());
    };
    let Some(listen) = server.rx.recv().await else {
        return Err("client closed before sending LISTEN".into());
    };
    tracing::info!("Server received: {listen}");
    let listen: serde_json::Value = serde_json::from_str(&listen)?;
    let response = serde_json::json!({
        "type": "RESPONSE",
        "nonce": listen["nonce"],
        "error": ""
    });
    server.tx.send(response.to_string())?;

    // ── Redeem a few rewards once listening ─────────────────────────
    let mut finished = 0;
    while let Some(event) = event_rx.recv().await {
        match &event {
            SessionEvent::Listening => {
                for title in ["Airhorn", "Hydrate", "Bonk"] {
                    server.tx.send(redemption("1234", title))?;
                }
            }
            SessionEvent::SoundFinished { path, .. } => {
                tracing::info!("Event: finished {}", path.display());
                finished += 1;
                if finished == 2 {
                    break;
                }
            }
            other => tracing::info!("Event: {other:?}"),
        }
    }

    session.shutdown().await;
    tracing::info!("Done. {finished} sound(s) played.");
    Ok(())
}
