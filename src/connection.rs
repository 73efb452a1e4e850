//! Connection lifecycle: connect, subscribe, keepalive, and reconnect.
//!
//! [`ConnectionManager`] owns the one live [`Transport`], the keepalive
//! deadlines and the retry timer. It is driven from the session loop in two
//! steps: [`next_event`](ConnectionManager::next_event) waits for whichever
//! source is ready (connect completion, an inbound frame, a deadline, the
//! retry timer) and [`handle`](ConnectionManager::handle) applies it.
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──opened──▶ AwaitingConfirmation ──RESPONSE ok──▶ Listening
//!      ▲                        │                        │   │                             │
//!      └──── closed (retry scheduled unless a RESPONSE error disabled retrying) ◀──────────┘
//! ```
//!
//! Every close, whatever its cause, goes through a single decision point that
//! disarms the keepalive deadlines and schedules at most one retry.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use crate::error::{ChannelPointsError, Result};
use crate::error_codes::ListenError;
use crate::event::{EventEmitter, SessionEvent};
use crate::keepalive::{Deadline, Keepalive, KeepaliveEvent, KeepaliveSettings};
use crate::playback::PlaybackSink;
use crate::protocol::ClientFrame;
use crate::retry::{RetryPolicy, RetryState};
use crate::router::{EventRouter, Routed};
use crate::transport::{Connector, Transport};

type ConnectFuture = Pin<Box<dyn Future<Output = Result<Box<dyn Transport>>> + Send>>;

/// Where the connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    AwaitingConfirmation,
    Listening,
}

/// What to subscribe to after every (re)connect.
#[derive(Clone, PartialEq, Eq)]
pub struct Subscription {
    pub auth_token: String,
    pub topics: Vec<String>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("auth_token", &"<redacted>")
            .field("topics", &self.topics)
            .finish()
    }
}

/// One unit of work for [`ConnectionManager::handle`].
pub enum ConnectionEvent {
    /// The pending connect attempt completed.
    Opened(Result<Box<dyn Transport>>),
    /// The live transport yielded a frame, an error, or closed (`None`).
    Inbound(Option<Result<String>>),
    Keepalive(KeepaliveEvent),
    /// The retry timer fired.
    RetryDue,
}

impl fmt::Debug for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Opened(result) => f
                .debug_tuple("Opened")
                .field(&result.as_ref().map(|_| "<transport>"))
                .finish(),
            Self::Inbound(inbound) => f.debug_tuple("Inbound").field(inbound).finish(),
            Self::Keepalive(event) => f.debug_tuple("Keepalive").field(event).finish(),
            Self::RetryDue => f.write_str("RetryDue"),
        }
    }
}

/// Owns the transport and drives the connection state machine.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    subscription: Subscription,
    state: ConnectionState,
    transport: Option<Box<dyn Transport>>,
    connecting: Option<ConnectFuture>,
    keepalive: Keepalive,
    retry: RetryState,
    retry_timer: Deadline,
    retry_enabled: bool,
    pending_nonce: Option<String>,
    events: EventEmitter,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        subscription: Subscription,
        retry: RetryPolicy,
        keepalive: KeepaliveSettings,
        events: EventEmitter,
    ) -> Self {
        Self {
            connector,
            subscription,
            state: ConnectionState::Disconnected,
            transport: None,
            connecting: None,
            keepalive: Keepalive::new(keepalive),
            retry: RetryState::new(retry),
            retry_timer: Deadline::new(),
            retry_enabled: true,
            pending_nonce: None,
            events,
        }
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// `false` once the server has rejected the subscription.
    pub fn retry_enabled(&self) -> bool {
        self.retry_enabled
    }

    /// The stored (un-jittered) backoff delay.
    pub fn retry_delay(&self) -> Duration {
        self.retry.current()
    }

    /// Time until the scheduled retry, if one is scheduled.
    pub fn retry_in(&self) -> Option<Duration> {
        self.retry_timer.remaining()
    }

    pub fn keepalive(&self) -> &Keepalive {
        &self.keepalive
    }

    // ── Operations ──────────────────────────────────────────────────

    /// Start a connection attempt.
    ///
    /// A no-op while a transport is open or opening, and after the server has
    /// rejected the subscription. Cancels any scheduled retry.
    pub fn connect(&mut self) {
        if self.transport.is_some() || self.connecting.is_some() {
            debug!(state = ?self.state, "connect requested while already connected");
            return;
        }
        if !self.retry_enabled {
            warn!("connect requested after the subscription was rejected; ignoring");
            return;
        }
        self.retry_timer.disarm();

        info!("connecting");
        self.state = ConnectionState::Connecting;
        self.events.emit(SessionEvent::Connecting);

        let connector = Arc::clone(&self.connector);
        self.connecting = Some(Box::pin(async move { connector.connect().await }));
    }

    /// Wait for the next connection event. Cancel-safe.
    ///
    /// Frames are polled before deadlines, so an awaited frame that is ready
    /// in the same tick as its deadline is handled first.
    pub async fn next_event(&mut self) -> ConnectionEvent {
        tokio::select! {
            biased;
            opened = poll_connect(&mut self.connecting) => ConnectionEvent::Opened(opened),
            inbound = recv_frame(&mut self.transport) => ConnectionEvent::Inbound(inbound),
            event = self.keepalive.next() => ConnectionEvent::Keepalive(event),
            () = self.retry_timer.fired() => ConnectionEvent::RetryDue,
        }
    }

    /// Apply one event. Topic handlers reached through `router` submit
    /// playback requests to `sink`.
    pub async fn handle(
        &mut self,
        event: ConnectionEvent,
        router: &EventRouter,
        sink: &mut (dyn PlaybackSink + Send),
    ) {
        match event {
            ConnectionEvent::Opened(Ok(transport)) => {
                self.connecting = None;
                self.on_open(transport).await;
            }
            ConnectionEvent::Opened(Err(e)) => {
                self.connecting = None;
                error!("failed to connect: {e}");
                self.on_closed();
            }
            ConnectionEvent::Inbound(Some(Ok(raw))) => self.on_frame(&raw, router, sink).await,
            ConnectionEvent::Inbound(Some(Err(e))) => {
                // A stream that yielded an error is unusable; its close is
                // what moves the state machine.
                error!("transport error: {e}");
                self.force_close().await;
            }
            ConnectionEvent::Inbound(None) => {
                self.transport = None;
                self.on_closed();
            }
            ConnectionEvent::Keepalive(KeepaliveEvent::ListenDeadline) => {
                warn!("no response to LISTEN in time, closing connection");
                self.force_close().await;
            }
            ConnectionEvent::Keepalive(KeepaliveEvent::PingDue) => self.send_ping().await,
            ConnectionEvent::Keepalive(KeepaliveEvent::PongDeadline) => {
                warn!("no PONG in time, closing connection");
                self.force_close().await;
            }
            ConnectionEvent::RetryDue => self.connect(),
        }
    }

    /// Tear down without scheduling a retry.
    pub async fn shutdown(&mut self) {
        self.retry_timer.disarm();
        self.keepalive.disarm_all();
        self.connecting = None;
        self.pending_nonce = None;
        if let Some(transport) = self.transport.take() {
            self.close_transport(transport).await;
        }
        self.state = ConnectionState::Disconnected;
    }

    // ── Transitions ─────────────────────────────────────────────────

    async fn on_open(&mut self, transport: Box<dyn Transport>) {
        info!("connected");
        self.transport = Some(transport);
        self.state = ConnectionState::AwaitingConfirmation;
        self.retry.reset();
        self.events.emit(SessionEvent::Connected);

        let listen = ClientFrame::listen(
            self.subscription.auth_token.clone(),
            self.subscription.topics.clone(),
        );
        self.pending_nonce = listen.nonce().map(str::to_string);
        self.keepalive.on_open();
        if let Err(e) = self.send(&listen).await {
            error!("failed to send LISTEN: {e}");
            self.force_close().await;
        }
    }

    async fn on_frame(
        &mut self,
        raw: &str,
        router: &EventRouter,
        sink: &mut (dyn PlaybackSink + Send),
    ) {
        trace!("> {raw}");
        match router.route(raw, sink) {
            Routed::Pong => self.keepalive.on_pong(),
            Routed::Reconnect => {
                info!("server requested reconnect");
                self.force_close().await;
            }
            Routed::Response { nonce, error } => self.on_response(nonce, &error).await,
            Routed::Delivered | Routed::Ignored => {}
        }
    }

    async fn on_response(&mut self, nonce: Option<String>, error: &str) {
        if let (Some(nonce), Some(pending)) = (&nonce, &self.pending_nonce) {
            if nonce != pending {
                debug!(%nonce, "ignoring RESPONSE for another request");
                return;
            }
        }
        self.keepalive.on_response();
        self.pending_nonce = None;

        match ListenError::from_response(error) {
            None => {
                info!("listening for notifications");
                self.state = ConnectionState::Listening;
                self.events.emit(SessionEvent::Listening);
            }
            Some(code) => {
                error!(
                    "failed to listen for notifications: {code} ({}); check the configuration and try again",
                    code.description()
                );
                self.retry_enabled = false;
                self.events.emit(SessionEvent::ListenFailed { error: code });
                self.force_close().await;
            }
        }
    }

    async fn send_ping(&mut self) {
        if self.transport.is_none() {
            return;
        }
        self.keepalive.on_ping_sent();
        if let Err(e) = self.send(&ClientFrame::Ping).await {
            error!("failed to send PING: {e}");
            self.force_close().await;
        }
    }

    async fn send(&mut self, frame: &ClientFrame) -> Result<()> {
        let raw = serde_json::to_string(frame)?;
        let transport = self
            .transport
            .as_mut()
            .ok_or(ChannelPointsError::TransportClosed)?;
        trace!("< {raw}");
        tokio::time::timeout(self.keepalive.settings().io_timeout, transport.send(raw))
            .await
            .map_err(|_| ChannelPointsError::Timeout)?
    }

    /// Drop the live transport (if any) into the close path, then close it.
    ///
    /// The retry is scheduled before the transport's own `close` runs, so a
    /// close that stalls cannot hold back the reconnect.
    async fn force_close(&mut self) {
        let transport = self.transport.take();
        self.on_closed();
        if let Some(transport) = transport {
            self.close_transport(transport).await;
        }
    }

    async fn close_transport(&mut self, mut transport: Box<dyn Transport>) {
        let timeout = self.keepalive.settings().io_timeout;
        match tokio::time::timeout(timeout, transport.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("error closing transport: {e}"),
            Err(_) => warn!(
                "transport did not close within {:.1} second(s), dropping it",
                timeout.as_secs_f64()
            ),
        }
    }

    /// The single reconnect decision point.
    fn on_closed(&mut self) {
        self.transport = None;
        self.pending_nonce = None;
        self.keepalive.disarm_all();
        self.state = ConnectionState::Disconnected;

        if self.retry_enabled {
            let delay = self.retry.presented();
            self.retry_timer.arm(delay);
            self.retry.grow();
            info!(
                "connection closed, reconnecting in {:.1} second(s)",
                delay.as_secs_f64()
            );
            self.events.emit(SessionEvent::Disconnected {
                retry_in: Some(delay),
            });
        } else {
            info!("connection closed");
            self.events
                .emit(SessionEvent::Disconnected { retry_in: None });
        }
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state)
            .field("retry_enabled", &self.retry_enabled)
            .field("retry_delay", &self.retry.current())
            .field("retry_scheduled", &self.retry_timer.is_armed())
            .finish()
    }
}

async fn poll_connect(connecting: &mut Option<ConnectFuture>) -> Result<Box<dyn Transport>> {
    match connecting {
        Some(future) => future.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn recv_frame(transport: &mut Option<Box<dyn Transport>>) -> Option<Result<String>> {
    match transport {
        Some(transport) => transport.recv().await,
        None => std::future::pending().await,
    }
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
    use crate::playback::Sound;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc;

    // ── Loopback connector ──────────────────────────────────────────

    struct LoopbackTransport {
        to_server: mpsc::UnboundedSender<String>,
        from_server: mpsc::UnboundedReceiver<String>,
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Transport for LoopbackTransport {
        async fn send(&mut self, message: String) -> Result<()> {
            self.to_server
                .send(message)
                .map_err(|_| ChannelPointsError::TransportClosed)
        }

        async fn recv(&mut self) -> Option<Result<String>> {
            self.from_server.recv().await.map(Ok)
        }

        async fn close(&mut self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Server {
        rx: mpsc::UnboundedReceiver<String>,
        tx: mpsc::UnboundedSender<String>,
        closed: Arc<AtomicBool>,
    }

    impl Server {
        fn recv_frame(&mut self) -> serde_json::Value {
            serde_json::from_str(&self.rx.try_recv().unwrap()).unwrap()
        }
    }

    #[derive(Default)]
    struct LoopbackConnector {
        attempts: AtomicUsize,
        servers: StdMutex<Vec<Server>>,
    }

    #[async_trait]
    impl Connector for LoopbackConnector {
        async fn connect(&self) -> Result<Box<dyn Transport>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let (client_tx, server_rx) = mpsc::unbounded_channel();
            let (server_tx, client_rx) = mpsc::unbounded_channel();
            let closed = Arc::new(AtomicBool::new(false));
            self.servers.lock().unwrap().push(Server {
                rx: server_rx,
                tx: server_tx,
                closed: Arc::clone(&closed),
            });
            Ok(Box::new(LoopbackTransport {
                to_server: client_tx,
                from_server: client_rx,
                closed,
            }))
        }
    }

    struct NullSink;

    impl PlaybackSink for NullSink {
        fn submit(&mut self, _sound: Sound) {}
    }

    fn manager(connector: &Arc<LoopbackConnector>) -> ConnectionManager {
        manager_with(Arc::clone(connector) as Arc<dyn Connector>)
    }

    fn manager_with(connector: Arc<dyn Connector>) -> ConnectionManager {
        ConnectionManager::new(
            connector,
            Subscription {
                auth_token: "token".into(),
                topics: vec!["channel-points-channel-v1.1".into()],
            },
            RetryPolicy::default(),
            KeepaliveSettings::default(),
            EventEmitter::disabled(),
        )
    }

    async fn step(manager: &mut ConnectionManager, router: &EventRouter) {
        let event = manager.next_event().await;
        manager.handle(event, router, &mut NullSink).await;
    }

    fn take_server(connector: &LoopbackConnector) -> Server {
        connector.servers.lock().unwrap().pop().unwrap()
    }

    // ── Misbehaving transports ──────────────────────────────────────

    #[derive(Debug, Default, Clone, Copy)]
    struct Faults {
        stall_send: bool,
        stall_close: bool,
        recv_error: bool,
    }

    /// Never yields a frame on its own; fails or hangs as `faults` say.
    struct FaultyTransport {
        faults: Faults,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Transport for FaultyTransport {
        async fn send(&mut self, _message: String) -> Result<()> {
            if self.faults.stall_send {
                std::future::pending::<()>().await;
            }
            Ok(())
        }

        async fn recv(&mut self) -> Option<Result<String>> {
            if std::mem::take(&mut self.faults.recv_error) {
                return Some(Err(ChannelPointsError::TransportReceive(
                    "connection reset by peer".into(),
                )));
            }
            std::future::pending().await
        }

        async fn close(&mut self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.faults.stall_close {
                std::future::pending::<()>().await;
            }
            Ok(())
        }
    }

    struct FaultyConnector {
        faults: Faults,
        attempts: AtomicUsize,
        closes: Arc<AtomicUsize>,
    }

    impl FaultyConnector {
        fn new(faults: Faults) -> Arc<Self> {
            Arc::new(Self {
                faults,
                attempts: AtomicUsize::new(0),
                closes: Arc::new(AtomicUsize::new(0)),
            })
        }
    }

    #[async_trait]
    impl Connector for FaultyConnector {
        async fn connect(&self) -> Result<Box<dyn Transport>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FaultyTransport {
                faults: self.faults,
                closes: Arc::clone(&self.closes),
            }))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn open_sends_listen_and_arms_deadlines() {
        let connector = Arc::new(LoopbackConnector::default());
        let router = EventRouter::new("1");
        let mut manager = manager(&connector);

        manager.connect();
        assert_eq!(manager.state(), ConnectionState::Connecting);
        step(&mut manager, &router).await;

        assert_eq!(manager.state(), ConnectionState::AwaitingConfirmation);
        assert!(manager.keepalive().listen_armed());
        assert!(manager.keepalive().ping_armed());

        let mut server = take_server(&connector);
        let listen = server.recv_frame();
        assert_eq!(listen["type"], "LISTEN");
        assert_eq!(listen["data"]["auth_token"], "token");
        assert_eq!(listen["data"]["topics"][0], "channel-points-channel-v1.1");
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_idempotent_while_open_or_opening() {
        let connector = Arc::new(LoopbackConnector::default());
        let router = EventRouter::new("1");
        let mut manager = manager(&connector);

        manager.connect();
        manager.connect();
        step(&mut manager, &router).await;
        manager.connect();
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state(), ConnectionState::AwaitingConfirmation);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_response_moves_to_listening() {
        let connector = Arc::new(LoopbackConnector::default());
        let router = EventRouter::new("1");
        let mut manager = manager(&connector);

        manager.connect();
        step(&mut manager, &router).await;
        let mut server = take_server(&connector);
        let nonce = server.recv_frame()["nonce"].as_str().unwrap().to_string();

        server
            .tx
            .send(format!(r#"{{"type":"RESPONSE","nonce":"{nonce}","error":""}}"#))
            .unwrap();
        step(&mut manager, &router).await;

        assert_eq!(manager.state(), ConnectionState::Listening);
        assert!(!manager.keepalive().listen_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn response_for_another_nonce_is_ignored() {
        let connector = Arc::new(LoopbackConnector::default());
        let router = EventRouter::new("1");
        let mut manager = manager(&connector);

        manager.connect();
        step(&mut manager, &router).await;
        let server = take_server(&connector);
        server
            .tx
            .send(r#"{"type":"RESPONSE","nonce":"stale","error":"ERR_BADAUTH"}"#.into())
            .unwrap();
        step(&mut manager, &router).await;

        assert_eq!(manager.state(), ConnectionState::AwaitingConfirmation);
        assert!(manager.retry_enabled());
        assert!(manager.keepalive().listen_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn error_response_disables_retry_for_good() {
        let connector = Arc::new(LoopbackConnector::default());
        let router = EventRouter::new("1");
        let mut manager = manager(&connector);

        manager.connect();
        step(&mut manager, &router).await;
        let server = take_server(&connector);
        server
            .tx
            .send(r#"{"type":"RESPONSE","error":"ERR_BADAUTH"}"#.into())
            .unwrap();
        step(&mut manager, &router).await;

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!manager.retry_enabled());
        assert!(server.closed.load(Ordering::SeqCst));
        assert_eq!(manager.retry_in(), None);

        manager.connect();
        let idle = tokio::time::timeout(Duration::from_secs(3600), manager.next_event()).await;
        assert!(idle.is_err());
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn listen_deadline_forces_one_close_and_one_retry() {
        let connector = Arc::new(LoopbackConnector::default());
        let router = EventRouter::new("1");
        let mut manager = manager(&connector);

        manager.connect();
        step(&mut manager, &router).await;
        let server = take_server(&connector);

        let event = manager.next_event().await;
        assert!(matches!(
            event,
            ConnectionEvent::Keepalive(KeepaliveEvent::ListenDeadline)
        ));
        manager.handle(event, &router, &mut NullSink).await;

        assert!(server.closed.load(Ordering::SeqCst));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!manager.keepalive().ping_armed());
        let retry_in = manager.retry_in().unwrap().as_secs_f64();
        assert!((0.9..=1.1).contains(&retry_in), "retry in {retry_in}");
        assert_eq!(manager.retry_delay(), Duration::from_secs(2));

        let event = manager.next_event().await;
        assert!(matches!(event, ConnectionEvent::RetryDue));
        manager.handle(event, &router, &mut NullSink).await;
        step(&mut manager, &router).await;
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(manager.retry_delay(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_close_does_not_hold_back_the_retry() {
        let connector = FaultyConnector::new(Faults {
            stall_close: true,
            ..Faults::default()
        });
        let router = EventRouter::new("1");
        let mut manager = manager_with(Arc::clone(&connector) as Arc<dyn Connector>);

        manager.connect();
        step(&mut manager, &router).await;
        let event = manager.next_event().await;
        assert!(matches!(
            event,
            ConnectionEvent::Keepalive(KeepaliveEvent::ListenDeadline)
        ));

        let closing = tokio::time::Instant::now();
        manager.handle(event, &router, &mut NullSink).await;
        let io_timeout = KeepaliveSettings::default().io_timeout;
        let elapsed = closing.elapsed();
        assert!(
            elapsed >= io_timeout && elapsed <= io_timeout + Duration::from_millis(5),
            "closing took {elapsed:?}"
        );
        assert_eq!(connector.closes.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.retry_in().is_some());
        assert_eq!(manager.retry_delay(), Duration::from_secs(2));

        let event = manager.next_event().await;
        assert!(matches!(event, ConnectionEvent::RetryDue));
        manager.handle(event, &router, &mut NullSink).await;
        step(&mut manager, &router).await;
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(manager.state(), ConnectionState::AwaitingConfirmation);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_listen_send_times_out_and_retries() {
        let connector = FaultyConnector::new(Faults {
            stall_send: true,
            ..Faults::default()
        });
        let router = EventRouter::new("1");
        let mut manager = manager_with(Arc::clone(&connector) as Arc<dyn Connector>);

        manager.connect();
        step(&mut manager, &router).await;

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(connector.closes.load(Ordering::SeqCst), 1);
        assert!(!manager.keepalive().listen_armed());
        assert!(manager.retry_in().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn receive_error_closes_and_schedules_one_retry() {
        let connector = FaultyConnector::new(Faults {
            recv_error: true,
            ..Faults::default()
        });
        let router = EventRouter::new("1");
        let mut manager = manager_with(Arc::clone(&connector) as Arc<dyn Connector>);

        manager.connect();
        step(&mut manager, &router).await;
        let event = manager.next_event().await;
        assert!(matches!(event, ConnectionEvent::Inbound(Some(Err(_)))));
        manager.handle(event, &router, &mut NullSink).await;

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(connector.closes.load(Ordering::SeqCst), 1);
        assert!(!manager.keepalive().ping_armed());
        let retry_in = manager.retry_in().unwrap().as_secs_f64();
        assert!((0.9..=1.1).contains(&retry_in), "retry in {retry_in}");
        // Grown exactly once.
        assert_eq!(manager.retry_delay(), Duration::from_secs(2));

        let event = manager.next_event().await;
        assert!(matches!(event, ConnectionEvent::RetryDue));
        manager.handle(event, &router, &mut NullSink).await;
        step(&mut manager, &router).await;
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn response_arriving_with_listen_deadline_confirms() {
        let connector = Arc::new(LoopbackConnector::default());
        let router = EventRouter::new("1");
        let mut manager = manager(&connector);

        manager.connect();
        step(&mut manager, &router).await;
        let mut server = take_server(&connector);
        let nonce = server.recv_frame()["nonce"].as_str().unwrap().to_string();

        server
            .tx
            .send(format!(r#"{{"type":"RESPONSE","nonce":"{nonce}","error":""}}"#))
            .unwrap();
        tokio::time::advance(KeepaliveSettings::default().listen_timeout).await;
        step(&mut manager, &router).await;

        assert_eq!(manager.state(), ConnectionState::Listening);
        assert!(!manager.keepalive().listen_armed());
        assert_eq!(manager.retry_in(), None);
        assert!(!server.closed.load(Ordering::SeqCst));
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pong_arriving_with_pong_deadline_keeps_listening() {
        let connector = Arc::new(LoopbackConnector::default());
        let router = EventRouter::new("1");
        let mut manager = manager(&connector);

        manager.connect();
        step(&mut manager, &router).await;
        let mut server = take_server(&connector);
        server.recv_frame();
        server
            .tx
            .send(r#"{"type":"RESPONSE","error":""}"#.into())
            .unwrap();
        step(&mut manager, &router).await;
        step(&mut manager, &router).await; // PING
        assert_eq!(server.recv_frame()["type"], "PING");
        assert!(manager.keepalive().pong_armed());

        server.tx.send(r#"{"type":"PONG"}"#.into()).unwrap();
        tokio::time::advance(KeepaliveSettings::default().ping_timeout).await;
        step(&mut manager, &router).await;

        assert_eq!(manager.state(), ConnectionState::Listening);
        assert!(!manager.keepalive().pong_armed());
        assert_eq!(manager.retry_in(), None);
        assert!(!server.closed.load(Ordering::SeqCst));

        // Nothing else is due until the next ping.
        let idle = tokio::time::timeout(Duration::from_secs(60), manager.next_event()).await;
        assert!(idle.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn ping_then_missing_pong_closes() {
        let connector = Arc::new(LoopbackConnector::default());
        let router = EventRouter::new("1");
        let mut manager = manager(&connector);

        manager.connect();
        step(&mut manager, &router).await;
        let mut server = take_server(&connector);
        server.recv_frame();
        server
            .tx
            .send(r#"{"type":"RESPONSE","error":""}"#.into())
            .unwrap();
        step(&mut manager, &router).await;

        let event = manager.next_event().await;
        assert!(matches!(event, ConnectionEvent::Keepalive(KeepaliveEvent::PingDue)));
        manager.handle(event, &router, &mut NullSink).await;
        assert_eq!(server.recv_frame()["type"], "PING");
        assert!(manager.keepalive().pong_armed());

        let event = manager.next_event().await;
        assert!(matches!(
            event,
            ConnectionEvent::Keepalive(KeepaliveEvent::PongDeadline)
        ));
        manager.handle(event, &router, &mut NullSink).await;
        assert!(server.closed.load(Ordering::SeqCst));
        assert!(manager.retry_in().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn pong_disarms_deadline() {
        let connector = Arc::new(LoopbackConnector::default());
        let router = EventRouter::new("1");
        let mut manager = manager(&connector);

        manager.connect();
        step(&mut manager, &router).await;
        let mut server = take_server(&connector);
        server.recv_frame();
        server
            .tx
            .send(r#"{"type":"RESPONSE","error":""}"#.into())
            .unwrap();
        step(&mut manager, &router).await;
        step(&mut manager, &router).await; // PING
        server.recv_frame();

        server.tx.send(r#"{"type":"PONG"}"#.into()).unwrap();
        step(&mut manager, &router).await;
        assert!(!manager.keepalive().pong_armed());
        assert_eq!(manager.state(), ConnectionState::Listening);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_frame_closes_and_schedules_retry() {
        let connector = Arc::new(LoopbackConnector::default());
        let router = EventRouter::new("1");
        let mut manager = manager(&connector);

        manager.connect();
        step(&mut manager, &router).await;
        let server = take_server(&connector);
        server.tx.send(r#"{"type":"RECONNECT"}"#.into()).unwrap();
        step(&mut manager, &router).await;

        assert!(server.closed.load(Ordering::SeqCst));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.retry_in().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_closes_grow_backoff_up_to_max() {
        let connector = Arc::new(LoopbackConnector::default());
        let mut manager = manager(&connector);

        let mut previous = manager.retry_delay();
        for _ in 0..10 {
            manager.on_closed();
            let current = manager.retry_delay();
            assert!(current >= previous);
            assert!(current <= Duration::from_secs(60));
            previous = current;
        }
        assert_eq!(previous, Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn manual_connect_cancels_scheduled_retry() {
        let connector = Arc::new(LoopbackConnector::default());
        let router = EventRouter::new("1");
        let mut manager = manager(&connector);

        manager.connect();
        step(&mut manager, &router).await;
        drop(take_server(&connector));
        step(&mut manager, &router).await; // server went away
        assert!(manager.retry_in().is_some());

        manager.connect();
        assert_eq!(manager.retry_in(), None);
        step(&mut manager, &router).await;
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(manager.state(), ConnectionState::AwaitingConfirmation);
    }
}
