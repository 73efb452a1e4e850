//! Session lifecycle.
//!
//! [`Session`] is a thin handle over one background task that owns the
//! [`ConnectionManager`], the [`EventRouter`] and the [`PlaybackQueue`] and
//! multiplexes every input with a single `tokio::select!`. Nothing is shared
//! with the handle except the shutdown signal, so no state needs a lock.
//!
//! # Example
//!
//! ```rust,ignore
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
//!     if let SessionEvent::RewardRedeemed { title } = event {
//!         println!("{title} redeemed");
//!     }
//! }
//! session.shutdown().await;
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::connection::{ConnectionManager, ConnectionState, Subscription};
use crate::error::Result;
use crate::event::{EventEmitter, SessionEvent};
use crate::identity::{Identity, IdentityProvider};
use crate::keepalive::KeepaliveSettings;
use crate::playback::{PlaybackEvent, PlaybackQueue, PlaybackReporter, Player, QueueMode, Sound};
use crate::retry::RetryPolicy;
use crate::router::{EventRouter, RedemptionHandler};
use crate::transport::Connector;

/// Default capacity of the bounded event channel.
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default timeout for the graceful shutdown.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

// ── Configuration ───────────────────────────────────────────────────

/// Configuration for a [`Session`].
///
/// The only required field is the OAuth token; everything else has a
/// default.
///
/// ```
/// use channel_point_sounds::{QueueMode, SessionConfig, Sound};
/// use std::time::Duration;
///
/// let config = SessionConfig::new("oauth-token")
///     .with_sound("Airhorn", Sound::from_percent("airhorn.mp3", 80))
///     .with_queue_mode(QueueMode::Concurrent)
///     .with_shutdown_timeout(Duration::from_secs(5));
/// assert_eq!(config.sounds.len(), 1);
/// ```
#[derive(Clone)]
pub struct SessionConfig {
    /// OAuth token sent with `LISTEN`.
    pub auth_token: String,
    /// Reward title → sound.
    pub sounds: HashMap<String, Sound>,
    pub queue_mode: QueueMode,
    pub retry: RetryPolicy,
    pub keepalive: KeepaliveSettings,
    /// Capacity of the bounded event channel.
    ///
    /// Events are dropped with a warning when the consumer falls behind.
    /// Defaults to **256**. Values below 1 are clamped to 1.
    pub event_channel_capacity: usize,
    /// How long [`Session::shutdown`] waits for the loop to close the
    /// transport before aborting it. Defaults to **1 second**.
    pub shutdown_timeout: Duration,
}

impl SessionConfig {
    pub fn new(auth_token: impl Into<String>) -> Self {
        Self {
            auth_token: auth_token.into(),
            sounds: HashMap::new(),
            queue_mode: QueueMode::default(),
            retry: RetryPolicy::default(),
            keepalive: KeepaliveSettings::default(),
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    /// Play `sound` whenever the reward titled `title` is redeemed.
    #[must_use]
    pub fn with_sound(mut self, title: impl Into<String>, sound: Sound) -> Self {
        self.sounds.insert(title.into(), sound);
        self
    }

    /// Replace the whole reward → sound map.
    #[must_use]
    pub fn with_sounds(mut self, sounds: HashMap<String, Sound>) -> Self {
        self.sounds = sounds;
        self
    }

    #[must_use]
    pub fn with_queue_mode(mut self, mode: QueueMode) -> Self {
        self.queue_mode = mode;
        self
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_keepalive(mut self, keepalive: KeepaliveSettings) -> Self {
        self.keepalive = keepalive;
        self
    }

    /// Defaults to **256**. Values below 1 are clamped to 1.
    #[must_use]
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity.max(1);
        self
    }

    /// A zero timeout aborts the loop without waiting for it to close the
    /// transport.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut titles: Vec<&String> = self.sounds.keys().collect();
        titles.sort();
        f.debug_struct("SessionConfig")
            .field("auth_token", &"<redacted>")
            .field("sounds", &titles)
            .field("queue_mode", &self.queue_mode)
            .field("retry", &self.retry)
            .field("keepalive", &self.keepalive)
            .field("event_channel_capacity", &self.event_channel_capacity)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish()
    }
}

// ── Session ─────────────────────────────────────────────────────────

/// Handle to a running session.
///
/// Created by [`Session::start`]. Dropping the handle aborts the background
/// task; call [`shutdown`](Self::shutdown) to close the connection cleanly.
pub struct Session {
    identity: Identity,
    task: Option<tokio::task::JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    shutdown_timeout: Duration,
}

impl Session {
    /// Resolve the identity, then spawn the session loop and start the first
    /// connection attempt.
    ///
    /// # Errors
    ///
    /// Identity lookup failures are returned as-is; no connection is
    /// attempted in that case.
    pub async fn start(
        identity: &dyn IdentityProvider,
        connector: impl Connector,
        player: impl Player,
        config: SessionConfig,
    ) -> Result<(Self, mpsc::Receiver<SessionEvent>)> {
        let identity = identity.lookup().await?;
        info!(id = %identity.id, login = %identity.login, "resolved identity");

        let capacity = config.event_channel_capacity.max(1);
        let (event_tx, event_rx) = mpsc::channel(capacity);
        let events = EventEmitter::new(event_tx);

        let router = EventRouter::new(identity.id.clone()).with_topic(
            RedemptionHandler::topic(),
            RedemptionHandler::new(config.sounds, events.clone()),
        );
        let subscription = Subscription {
            auth_token: config.auth_token,
            topics: router.subscription_topics(),
        };
        debug!(topics = ?subscription.topics, "subscription");

        let (reporter, playback_rx) = PlaybackReporter::channel();
        let queue = PlaybackQueue::new(config.queue_mode, Box::new(player), reporter, events.clone());
        let connection = ConnectionManager::new(
            Arc::new(connector),
            subscription,
            config.retry,
            config.keepalive,
            events,
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(session_loop(
            connection,
            router,
            queue,
            playback_rx,
            shutdown_rx,
        ));

        let session = Self {
            identity,
            task: Some(task),
            shutdown_tx: Some(shutdown_tx),
            shutdown_timeout: config.shutdown_timeout,
        };
        Ok((session, event_rx))
    }

    /// The identity this session listens for.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// `true` while the background loop is running.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Close the connection, cancel every timer and stop the loop.
    ///
    /// The event receiver yields `None` once the loop has exited.
    pub async fn shutdown(&mut self) {
        debug!("session shutdown requested");

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(self.shutdown_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!("session loop terminated with join error: {join_err}");
                }
                Err(_) => {
                    warn!("session loop did not exit within timeout; aborting task");
                    task.abort();
                    if let Err(join_err) = task.await {
                        debug!("session loop aborted: {join_err}");
                    }
                }
            }
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("identity", &self.identity.id)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // No executor to drive a graceful close here; abort drops the loop
        // future and with it the transport.
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ── Session loop ────────────────────────────────────────────────────

/// Exits on the shutdown signal, or once the subscription has been rejected,
/// the connection is closed and nothing is left to play.
async fn session_loop(
    mut connection: ConnectionManager,
    router: EventRouter,
    mut queue: PlaybackQueue,
    mut playback_rx: mpsc::UnboundedReceiver<PlaybackEvent>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    debug!("session loop started");
    connection.connect();

    loop {
        if !connection.retry_enabled()
            && connection.state() == ConnectionState::Disconnected
            && queue.is_empty()
        {
            info!("subscription rejected and nothing left to play; stopping");
            break;
        }

        tokio::select! {
            biased;

            _ = &mut shutdown_rx => {
                debug!("shutdown signal received");
                connection.shutdown().await;
                break;
            }

            Some(event) = playback_rx.recv() => queue.handle(event),

            event = connection.next_event() => {
                connection.handle(event, &router, &mut queue).await;
            }
        }
    }

    debug!("session loop exited");
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::error::ChannelPointsError;
    use crate::playback::ItemId;
    use crate::transport::Transport;
    use async_trait::async_trait;

    struct Unreachable;

    #[async_trait]
    impl Connector for Unreachable {
        async fn connect(&self) -> Result<Box<dyn Transport>> {
            Err(ChannelPointsError::Connect("unreachable".into()))
        }
    }

    struct Silent;

    impl Player for Silent {
        fn prepare(&mut self, _id: ItemId, _sound: &Sound, _reporter: PlaybackReporter) {}
        fn play(&mut self, id: ItemId, _sound: &Sound, reporter: PlaybackReporter) {
            reporter.finished(id);
        }
    }

    struct Missing;

    #[async_trait]
    impl IdentityProvider for Missing {
        async fn lookup(&self) -> Result<Identity> {
            Err(ChannelPointsError::IdentityNotFound)
        }
    }

    #[test]
    fn config_defaults() {
        let config = SessionConfig::new("tok");
        assert_eq!(config.event_channel_capacity, 256);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(1));
        assert_eq!(config.queue_mode, QueueMode::Sequential);
        assert!(config.sounds.is_empty());
    }

    #[test]
    fn config_capacity_is_clamped() {
        let config = SessionConfig::new("tok").with_event_channel_capacity(0);
        assert_eq!(config.event_channel_capacity, 1);
    }

    #[test]
    fn config_debug_redacts_token() {
        let rendered = format!("{:?}", SessionConfig::new("super-secret"));
        assert!(!rendered.contains("super-secret"));
    }

    #[tokio::test]
    async fn identity_failure_aborts_start() {
        let result = Session::start(&Missing, Unreachable, Silent, SessionConfig::new("tok")).await;
        assert!(matches!(result, Err(ChannelPointsError::IdentityNotFound)));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_schedules_retry() {
        let (mut session, mut events) = Session::start(
            &Identity::new("1"),
            Unreachable,
            Silent,
            SessionConfig::new("tok"),
        )
        .await
        .unwrap();

        assert_eq!(session.identity().id, "1");
        assert_eq!(events.recv().await, Some(SessionEvent::Connecting));
        match events.recv().await {
            Some(SessionEvent::Disconnected { retry_in: Some(delay) }) => {
                assert!(delay >= Duration::from_millis(900) && delay <= Duration::from_millis(1100));
            }
            other => panic!("expected Disconnected with retry, got {other:?}"),
        }

        session.shutdown().await;
        assert!(!session.is_running());
    }

    #[tokio::test]
    async fn shutdown_closes_event_channel() {
        let (mut session, mut events) = Session::start(
            &Identity::new("1"),
            Unreachable,
            Silent,
            SessionConfig::new("tok"),
        )
        .await
        .unwrap();

        session.shutdown().await;
        while events.recv().await.is_some() {}
    }

    #[tokio::test]
    async fn drop_aborts_loop() {
        let (session, mut events) = Session::start(
            &Identity::new("1"),
            Unreachable,
            Silent,
            SessionConfig::new("tok"),
        )
        .await
        .unwrap();

        drop(session);
        // The aborted task drops every sender, so the receiver drains and ends.
        while events.recv().await.is_some() {}
    }
}
