//! Inbound frame routing.
//!
//! Frame types form a closed set ([`ServerFrame`]), so they are dispatched
//! with a `match`. Topics are open-ended and registered explicitly as
//! [`TopicHandler`]s. Topic strings arrive suffixed with the subscriber's own
//! id (`"<topic>.<id>"`); the suffix is stripped before lookup so handlers do
//! not need to know whose channel they serve.
//!
//! Control frames (`PONG`, `RECONNECT`, `RESPONSE`) are not acted on here.
//! They are returned as a [`Routed`] value for the connection manager, which
//! owns the state they affect.

use std::collections::HashMap;
use std::fmt;

use tracing::{debug, info, trace, warn};

use crate::error::Result;
use crate::event::{EventEmitter, SessionEvent};
use crate::playback::{PlaybackSink, Sound};
use crate::protocol::{ChannelPointsMessage, MessageData, ServerFrame, CHANNEL_POINTS_TOPIC};

/// Outcome of routing one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    /// A `MESSAGE` was passed to its topic handler.
    Delivered,
    Pong,
    Reconnect,
    Response {
        nonce: Option<String>,
        error: String,
    },
    /// Undecodable, unknown type, or unknown topic.
    Ignored,
}

/// Logic for one topic family.
pub trait TopicHandler: Send + Sync {
    /// Handle the topic-specific document of a `MESSAGE` frame, submitting
    /// playback requests to `sink` when it is actionable.
    ///
    /// # Errors
    ///
    /// Returns an error when `message` cannot be decoded; the router logs it
    /// and moves on.
    fn handle(&self, message: &str, sink: &mut dyn PlaybackSink) -> Result<()>;
}

/// Dispatches inbound frames by type and `MESSAGE` frames by topic.
pub struct EventRouter {
    identity: String,
    topics: HashMap<String, Box<dyn TopicHandler>>,
}

impl EventRouter {
    /// A router for frames addressed to the user `identity`.
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            topics: HashMap::new(),
        }
    }

    /// Register the handler for `topic` (without the identity suffix),
    /// replacing any previous one.
    pub fn register(&mut self, topic: impl Into<String>, handler: Box<dyn TopicHandler>) {
        self.topics.insert(topic.into(), handler);
    }

    /// Builder form of [`register`](Self::register).
    #[must_use]
    pub fn with_topic(mut self, topic: impl Into<String>, handler: impl TopicHandler + 'static) -> Self {
        self.register(topic, Box::new(handler));
        self
    }

    /// The full topic strings to subscribe to.
    pub fn subscription_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .topics
            .keys()
            .map(|topic| format!("{topic}.{}", self.identity))
            .collect();
        topics.sort();
        topics
    }

    /// Remove a trailing `".<identity>"`; other topics are returned verbatim.
    pub fn strip_identity<'a>(&self, topic: &'a str) -> &'a str {
        topic
            .strip_suffix(self.identity.as_str())
            .and_then(|rest| rest.strip_suffix('.'))
            .unwrap_or(topic)
    }

    /// Decode and route one raw inbound frame.
    ///
    /// Frames that are not valid JSON envelopes are logged and ignored.
    pub fn route(&self, raw: &str, sink: &mut dyn PlaybackSink) -> Routed {
        match ServerFrame::parse(raw) {
            Ok(frame) => self.dispatch(frame, sink),
            Err(e) => {
                warn!("failed to decode inbound frame: {e} (raw: {raw})");
                Routed::Ignored
            }
        }
    }

    /// Route an already decoded frame.
    pub fn dispatch(&self, frame: ServerFrame, sink: &mut dyn PlaybackSink) -> Routed {
        match frame {
            ServerFrame::Message { data } => self.deliver(&data, sink),
            ServerFrame::Pong => Routed::Pong,
            ServerFrame::Reconnect => Routed::Reconnect,
            ServerFrame::Response { nonce, error } => Routed::Response {
                nonce: nonce.filter(|n| !n.is_empty()),
                error,
            },
            ServerFrame::Unknown => {
                trace!("ignoring frame of unknown type");
                Routed::Ignored
            }
        }
    }

    fn deliver(&self, data: &MessageData, sink: &mut dyn PlaybackSink) -> Routed {
        let topic = self.strip_identity(&data.topic);
        let Some(handler) = self.topics.get(topic) else {
            debug!(topic = %data.topic, "ignoring message for unhandled topic");
            return Routed::Ignored;
        };
        match handler.handle(&data.message, sink) {
            Ok(()) => Routed::Delivered,
            Err(e) => {
                warn!(topic = %topic, "failed to handle message: {e}");
                Routed::Ignored
            }
        }
    }
}

impl fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut topics: Vec<&String> = self.topics.keys().collect();
        topics.sort();
        f.debug_struct("EventRouter")
            .field("identity", &self.identity)
            .field("topics", &topics)
            .finish()
    }
}

// ── Channel points ──────────────────────────────────────────────────

/// Plays the configured sound for each redeemed reward on
/// [`CHANNEL_POINTS_TOPIC`].
#[derive(Debug, Clone)]
pub struct RedemptionHandler {
    sounds: HashMap<String, Sound>,
    events: EventEmitter,
}

impl RedemptionHandler {
    /// `sounds` maps reward titles to the sound played for them.
    pub fn new(sounds: HashMap<String, Sound>, events: EventEmitter) -> Self {
        Self { sounds, events }
    }

    /// The topic this handler serves.
    pub fn topic() -> &'static str {
        CHANNEL_POINTS_TOPIC
    }
}

impl TopicHandler for RedemptionHandler {
    fn handle(&self, message: &str, sink: &mut dyn PlaybackSink) -> Result<()> {
        let message = ChannelPointsMessage::parse(message)?;
        let Some(redemption) = message.redemption()? else {
            debug!(kind = %message.kind, "ignoring non-redemption channel points message");
            return Ok(());
        };

        let title = redemption.reward.title;
        self.events.emit(SessionEvent::RewardRedeemed {
            title: title.clone(),
        });
        match self.sounds.get(&title) {
            Some(sound) => sink.submit(sound.clone()),
            None => {
                info!("no configured sound for reward \"{title}\"");
                self.events.emit(SessionEvent::NoSoundConfigured { title });
            }
        }
        Ok(())
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
    use serde_json::json;

    #[derive(Default)]
    struct VecSink(Vec<Sound>);

    impl PlaybackSink for VecSink {
        fn submit(&mut self, sound: Sound) {
            self.0.push(sound);
        }
    }

    fn redemption_message(title: &str) -> String {
        json!({
            "type": "reward-redeemed",
            "data": {
                "redemption": {
                    "id": "r-1",
                    "user": { "id": "9", "login": "viewer", "display_name": "Viewer" },
                    "reward": { "id": "w-1", "title": title, "cost": 100 }
                }
            }
        })
        .to_string()
    }

    fn message_frame(topic: &str, message: &str) -> String {
        json!({ "type": "MESSAGE", "data": { "topic": topic, "message": message } }).to_string()
    }

    fn router() -> EventRouter {
        let sounds = HashMap::from([("Airhorn".to_string(), Sound::from_percent("airhorn.mp3", 80))]);
        EventRouter::new("12345").with_topic(
            CHANNEL_POINTS_TOPIC,
            RedemptionHandler::new(sounds, EventEmitter::disabled()),
        )
    }

    #[test]
    fn strips_own_identity_suffix() {
        let router = router();
        assert_eq!(
            router.strip_identity("channel-points-channel-v1.12345"),
            "channel-points-channel-v1"
        );
    }

    #[test]
    fn other_suffixes_are_kept_verbatim() {
        let router = router();
        assert_eq!(
            router.strip_identity("channel-points-channel-v1.99999"),
            "channel-points-channel-v1.99999"
        );
        // Suffix must be preceded by a dot.
        assert_eq!(router.strip_identity("topic12345"), "topic12345");
        assert_eq!(router.strip_identity("plain-topic"), "plain-topic");
    }

    #[test]
    fn redemption_with_configured_sound_is_submitted() {
        let router = router();
        let mut sink = VecSink::default();
        let raw = message_frame(
            "channel-points-channel-v1.12345",
            &redemption_message("Airhorn"),
        );
        assert_eq!(router.route(&raw, &mut sink), Routed::Delivered);
        assert_eq!(sink.0, vec![Sound::from_percent("airhorn.mp3", 80)]);
    }

    #[test]
    fn unsuffixed_topic_is_looked_up_verbatim() {
        let router = router();
        let mut sink = VecSink::default();
        let raw = message_frame("channel-points-channel-v1", &redemption_message("Airhorn"));
        assert_eq!(router.route(&raw, &mut sink), Routed::Delivered);
        assert_eq!(sink.0.len(), 1);
    }

    #[test]
    fn redemption_without_sound_submits_nothing() {
        let router = router();
        let mut sink = VecSink::default();
        let raw = message_frame(
            "channel-points-channel-v1.12345",
            &redemption_message("Hydrate"),
        );
        assert_eq!(router.route(&raw, &mut sink), Routed::Delivered);
        assert!(sink.0.is_empty());
    }

    #[test]
    fn unknown_topic_is_ignored() {
        let router = router();
        let mut sink = VecSink::default();
        let raw = message_frame("whispers.12345", &redemption_message("Airhorn"));
        assert_eq!(router.route(&raw, &mut sink), Routed::Ignored);
        assert!(sink.0.is_empty());
    }

    #[test]
    fn malformed_frames_are_ignored() {
        let router = router();
        let mut sink = VecSink::default();
        assert_eq!(router.route("not json", &mut sink), Routed::Ignored);
        assert_eq!(router.route(r#"{"no_type":1}"#, &mut sink), Routed::Ignored);
        let raw = message_frame("channel-points-channel-v1.12345", "{broken");
        assert_eq!(router.route(&raw, &mut sink), Routed::Ignored);
    }

    #[test]
    fn control_frames_are_classified() {
        let router = router();
        let mut sink = VecSink::default();
        assert_eq!(router.route(r#"{"type":"PONG"}"#, &mut sink), Routed::Pong);
        assert_eq!(
            router.route(r#"{"type":"RECONNECT"}"#, &mut sink),
            Routed::Reconnect
        );
        assert_eq!(
            router.route(r#"{"type":"RESPONSE","nonce":"","error":"ERR_BADAUTH"}"#, &mut sink),
            Routed::Response {
                nonce: None,
                error: "ERR_BADAUTH".into()
            }
        );
        assert_eq!(
            router.route(r#"{"type":"HELLO"}"#, &mut sink),
            Routed::Ignored
        );
    }

    #[test]
    fn subscription_topics_carry_identity() {
        assert_eq!(
            router().subscription_topics(),
            vec!["channel-points-channel-v1.12345".to_string()]
        );
    }
}
