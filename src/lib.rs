//! # Channel Point Sounds
//!
//! Plays a sound whenever a viewer redeems a channel-points reward.
//!
//! The crate keeps one long-lived PubSub subscription alive over any
//! bidirectional text transport, reconnecting with jittered exponential
//! backoff, and feeds redemptions into an ordered playback queue.
//!
//! ## Features
//!
//! - **Transport-agnostic**: implement [`Transport`] and [`Connector`] for any backend
//! - **WebSocket built-in**: the default `transport-websocket` feature provides [`WebSocketConnector`]
//! - **Identity lookup**: the `helix` feature provides `HelixIdentity`
//! - **External player**: the `command-player` feature provides `CommandPlayer`
//! - **Event-driven**: receive typed [`SessionEvent`]s via a channel
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use channel_point_sounds::{Config, HelixIdentity, CommandPlayer, Session, WebSocketConnector};
//!
//! let config = Config::load("sounds.toml")?.into_session_config();
//! let identity = HelixIdentity::new(config.auth_token.clone());
//! let (mut session, mut events) = Session::start(
//!     &identity,
//!     WebSocketConnector::default(),
//!     CommandPlayer::default(),
//!     config,
//! )
//! .await?;
//!
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! session.shutdown().await;
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod error_codes;
pub mod event;
pub mod identity;
pub mod keepalive;
pub mod playback;
#[cfg(feature = "command-player")]
pub mod player;
pub mod protocol;
pub mod retry;
pub mod router;
pub mod session;
pub mod transport;
pub mod transports;

// Re-export primary types for ergonomic imports.
pub use config::Config;
pub use error::ChannelPointsError;
pub use error_codes::ListenError;
pub use event::SessionEvent;
#[cfg(feature = "helix")]
pub use identity::HelixIdentity;
pub use identity::{Identity, IdentityProvider};
pub use keepalive::KeepaliveSettings;
pub use playback::{PlaybackReporter, Player, QueueMode, Sound};
#[cfg(feature = "command-player")]
pub use player::CommandPlayer;
pub use protocol::{ClientFrame, ServerFrame};
pub use retry::RetryPolicy;
pub use session::{Session, SessionConfig};
pub use transport::{Connector, Transport};
#[cfg(feature = "transport-websocket")]
pub use transports::{WebSocketConnector, WebSocketTransport};
