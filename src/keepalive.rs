//! Cancellable deadlines and the keepalive schedule built from them.
//!
//! A [`Deadline`] is either disarmed or armed for one instant. Arming replaces
//! any previous instant, so a deadline never has two pending firings.
//! [`Deadline::fired`] resolves once the instant passes and never resolves
//! while disarmed, which lets it sit in a `tokio::select!` permanently.

use std::time::Duration;

use tokio::time::Instant;

use crate::retry::vary;

/// Default time allowed for the `RESPONSE` to a `LISTEN`.
pub const DEFAULT_LISTEN_TIMEOUT: Duration = Duration::from_secs(10);
/// Default interval between `PING`s.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(270);
/// Default time allowed for the `PONG` to a `PING`.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(10);
/// Default jitter applied to the ping interval.
pub const DEFAULT_PING_VARIANCE: f64 = 0.1;
/// Default bound on a single transport send or close.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(5);

/// A single cancellable scheduled firing.
#[derive(Debug, Default)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm for `after` from now, replacing any pending firing.
    pub fn arm(&mut self, after: Duration) {
        self.at = Some(Instant::now() + after);
    }

    /// Cancel the pending firing. Returns whether one was pending.
    pub fn disarm(&mut self) -> bool {
        self.at.take().is_some()
    }

    pub fn is_armed(&self) -> bool {
        self.at.is_some()
    }

    /// Time left before firing, if armed.
    pub fn remaining(&self) -> Option<Duration> {
        self.at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Resolve when the armed instant passes, disarming the deadline.
    ///
    /// Pending forever while disarmed. Cancel-safe.
    pub async fn fired(&mut self) {
        match self.at {
            Some(at) => {
                tokio::time::sleep_until(at).await;
                self.at = None;
            }
            None => std::future::pending().await,
        }
    }
}

/// Keepalive timings.
#[derive(Debug, Clone, PartialEq)]
pub struct KeepaliveSettings {
    pub listen_timeout: Duration,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub ping_variance: f64,
    /// Upper bound on one transport `send` or `close`. A transport that
    /// stalls past it is treated as dead.
    pub io_timeout: Duration,
}

impl Default for KeepaliveSettings {
    fn default() -> Self {
        Self {
            listen_timeout: DEFAULT_LISTEN_TIMEOUT,
            ping_interval: DEFAULT_PING_INTERVAL,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            ping_variance: DEFAULT_PING_VARIANCE,
            io_timeout: DEFAULT_IO_TIMEOUT,
        }
    }
}

/// Which keepalive deadline fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveEvent {
    /// No `RESPONSE` arrived for the outstanding `LISTEN`.
    ListenDeadline,
    /// Time to send the next `PING`.
    PingDue,
    /// No `PONG` arrived for the last `PING`.
    PongDeadline,
}

/// The three keepalive deadlines tied to one live transport.
#[derive(Debug, Default)]
pub struct Keepalive {
    settings: KeepaliveSettings,
    listen: Deadline,
    ping: Deadline,
    pong: Deadline,
}

impl Keepalive {
    pub fn new(settings: KeepaliveSettings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    pub fn settings(&self) -> &KeepaliveSettings {
        &self.settings
    }

    /// Transport opened and `LISTEN` sent: start the listen deadline and the
    /// ping cadence.
    pub fn on_open(&mut self) {
        self.listen.arm(self.settings.listen_timeout);
        self.schedule_ping();
    }

    /// `RESPONSE` received.
    pub fn on_response(&mut self) {
        self.listen.disarm();
    }

    /// `PING` sent: schedule the next one and wait for the `PONG`.
    pub fn on_ping_sent(&mut self) {
        self.schedule_ping();
        self.pong.arm(self.settings.ping_timeout);
    }

    /// `PONG` received.
    pub fn on_pong(&mut self) {
        self.pong.disarm();
    }

    /// Cancel everything; the transport is gone.
    pub fn disarm_all(&mut self) {
        self.listen.disarm();
        self.ping.disarm();
        self.pong.disarm();
    }

    pub fn listen_armed(&self) -> bool {
        self.listen.is_armed()
    }

    pub fn ping_armed(&self) -> bool {
        self.ping.is_armed()
    }

    pub fn pong_armed(&self) -> bool {
        self.pong.is_armed()
    }

    /// Wait for the next deadline to fire. Pending forever while all three
    /// are disarmed. Cancel-safe.
    pub async fn next(&mut self) -> KeepaliveEvent {
        tokio::select! {
            biased;
            () = self.listen.fired() => KeepaliveEvent::ListenDeadline,
            () = self.pong.fired() => KeepaliveEvent::PongDeadline,
            () = self.ping.fired() => KeepaliveEvent::PingDue,
        }
    }

    fn schedule_ping(&mut self) {
        self.ping
            .arm(vary(self.settings.ping_interval, self.settings.ping_variance));
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

    fn assert_elapsed(start: Instant, expected: Duration) {
        let elapsed = start.elapsed();
        assert!(
            elapsed >= expected && elapsed <= expected + Duration::from_millis(5),
            "elapsed {elapsed:?}, expected {expected:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_fires_after_duration() {
        let mut deadline = Deadline::new();
        let start = Instant::now();
        deadline.arm(Duration::from_secs(3));
        deadline.fired().await;
        assert_elapsed(start, Duration::from_secs(3));
        assert!(!deadline.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_replaces_the_pending_firing() {
        let mut deadline = Deadline::new();
        let start = Instant::now();
        deadline.arm(Duration::from_secs(1));
        deadline.arm(Duration::from_secs(5));
        deadline.fired().await;
        assert_elapsed(start, Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn disarmed_deadline_never_fires() {
        let mut deadline = Deadline::new();
        deadline.arm(Duration::from_secs(1));
        assert!(deadline.disarm());
        assert!(!deadline.disarm());
        let result = tokio::time::timeout(Duration::from_secs(60), deadline.fired()).await;
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn open_arms_listen_and_ping() {
        let mut keepalive = Keepalive::new(KeepaliveSettings::default());
        keepalive.on_open();
        assert!(keepalive.listen_armed());
        assert!(keepalive.ping_armed());
        assert!(!keepalive.pong_armed());

        let start = Instant::now();
        assert_eq!(keepalive.next().await, KeepaliveEvent::ListenDeadline);
        assert_elapsed(start, DEFAULT_LISTEN_TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn ping_cadence_is_jittered_interval() {
        let mut keepalive = Keepalive::new(KeepaliveSettings::default());
        keepalive.on_open();
        keepalive.on_response();

        let start = Instant::now();
        assert_eq!(keepalive.next().await, KeepaliveEvent::PingDue);
        let elapsed = start.elapsed().as_secs_f64();
        assert!((243.0..=297.0).contains(&elapsed), "elapsed {elapsed}");
    }

    #[tokio::test(start_paused = true)]
    async fn pong_deadline_follows_ping() {
        let mut keepalive = Keepalive::new(KeepaliveSettings::default());
        keepalive.on_open();
        keepalive.on_response();
        keepalive.on_ping_sent();
        assert!(keepalive.pong_armed());

        let start = Instant::now();
        assert_eq!(keepalive.next().await, KeepaliveEvent::PongDeadline);
        assert_elapsed(start, DEFAULT_PING_TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_all_silences_everything() {
        let mut keepalive = Keepalive::new(KeepaliveSettings::default());
        keepalive.on_open();
        keepalive.on_ping_sent();
        keepalive.disarm_all();
        let result = tokio::time::timeout(Duration::from_secs(3600), keepalive.next()).await;
        assert!(result.is_err());
    }
}
