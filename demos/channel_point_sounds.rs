//! # Channel Point Sounds
//!
//! Plays the configured sound whenever a channel-points reward is redeemed.
//!
//! 1. Load a TOML configuration (token, queue mode, reward → sound map)
//! 2. Look up the broadcaster behind the token
//! 3. Keep the PubSub subscription alive and play sounds through `ffplay`
//! 4. Shut down gracefully on Ctrl+C
//!
//! ## Running
//!
//! ```sh
//! cargo run --example channel_point_sounds --features helix,command-player -- sounds.toml
//!
//! # Keep the token out of the file:
//! CHANNEL_POINT_SOUNDS_AUTH_TOKEN=... cargo run --example channel_point_sounds \
//!     --features helix,command-player -- sounds.toml
//! ```

use channel_point_sounds::{CommandPlayer, Config, Session, SessionEvent, WebSocketConnector};

/// Configuration file used when no path is given.
const DEFAULT_CONFIG: &str = "channel_point_sounds.toml";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set `RUST_LOG=debug` for verbose output.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG.to_string());
    let config = Config::load(&path)?;
    let identity = config.helix_identity();
    let config = config.into_session_config();
    tracing::info!("Loaded {} sound(s) from {path}", config.sounds.len());

    let (mut session, mut event_rx) = Session::start(
        &identity,
        WebSocketConnector::default(),
        CommandPlayer::default(),
        config,
    )
    .await?;
    tracing::info!("Listening for redemptions on {}", session.identity().display_name);

    loop {
        tokio::select! {
            event = event_rx.recv() => {
                let Some(event) = event else {
                    tracing::info!("Session ended");
                    break;
                };

                match event {
                    SessionEvent::RewardRedeemed { title } => {
                        tracing::info!("Redeemed: {title}");
                    }
                    SessionEvent::ListenFailed { error } => {
                        tracing::error!("Subscription rejected: {error} ({})", error.description());
                    }
                    SessionEvent::SoundFailed { path, reason, .. } => {
                        tracing::warn!("Could not play {}: {reason}", path.display());
                    }
                    other => tracing::debug!("Event: {other:?}"),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl+C received, shutting down");
                break;
            }
        }
    }

    session.shutdown().await;
    Ok(())
}
