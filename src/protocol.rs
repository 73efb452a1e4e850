//! Wire types for the PubSub notification protocol.
//!
//! Every frame is a JSON object with a `type` discriminator. The client sends
//! `LISTEN` and `PING`; the server sends `MESSAGE`, `PONG`, `RECONNECT` and
//! `RESPONSE`. Frame types the client does not know decode to
//! [`ServerFrame::Unknown`] so that server-side additions are tolerated.
//!
//! `MESSAGE` frames carry a second, string-encoded JSON document whose shape
//! depends on the topic. The channel points shape is modelled by
//! [`ChannelPointsMessage`] and [`Redemption`].

use serde::{Deserialize, Serialize};

/// Topic family for channel point redemptions.
pub const CHANNEL_POINTS_TOPIC: &str = "channel-points-channel-v1";

/// Message kind announcing a redemption on [`CHANNEL_POINTS_TOPIC`].
pub const REWARD_REDEEMED: &str = "reward-redeemed";

// ── Client → server ─────────────────────────────────────────────────

/// Payload of a `LISTEN` frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListenData {
    pub topics: Vec<String>,
    pub auth_token: String,
}

/// Frames sent by the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientFrame {
    /// Subscribe to a set of topics.
    Listen {
        /// Correlates the server's `RESPONSE` with this request.
        #[serde(skip_serializing_if = "Option::is_none")]
        nonce: Option<String>,
        data: ListenData,
    },
    /// Keepalive ping; the server answers with `PONG`.
    Ping,
}

impl ClientFrame {
    /// Build a `LISTEN` frame with a fresh random nonce.
    pub fn listen(auth_token: impl Into<String>, topics: Vec<String>) -> Self {
        Self::Listen {
            nonce: Some(uuid::Uuid::new_v4().to_string()),
            data: ListenData {
                topics,
                auth_token: auth_token.into(),
            },
        }
    }

    /// The nonce carried by this frame, if any.
    pub fn nonce(&self) -> Option<&str> {
        match self {
            Self::Listen { nonce, .. } => nonce.as_deref(),
            Self::Ping => None,
        }
    }
}

// ── Server → client ─────────────────────────────────────────────────

/// Payload of a `MESSAGE` frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageData {
    /// Full topic string, usually `"<topic>.<user id>"`.
    pub topic: String,
    /// Topic-specific JSON document, encoded as a string.
    pub message: String,
}

/// Frames sent by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerFrame {
    /// A notification on a subscribed topic.
    Message { data: MessageData },
    /// Answer to a `PING`.
    Pong,
    /// The server is going away; the client should reconnect.
    Reconnect,
    /// Answer to a `LISTEN`. An empty `error` means success.
    Response {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        nonce: Option<String>,
        #[serde(default)]
        error: String,
    },
    /// Any frame type this client does not handle.
    #[serde(other)]
    Unknown,
}

impl ServerFrame {
    /// Decode one inbound text frame.
    ///
    /// # Errors
    ///
    /// Returns the underlying [`serde_json::Error`] if the text is not a JSON
    /// object with a string `type` field, or if a known frame type is missing
    /// required fields.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

// ── Channel points payload ──────────────────────────────────────────

/// The string-encoded document inside a channel points `MESSAGE`.
///
/// `data` is kept untyped until `kind` says how to read it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelPointsMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// `data` of a [`REWARD_REDEEMED`] message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedemptionData {
    pub redemption: Redemption,
}

/// A single redemption of a custom reward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Redemption {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<RedeemingUser>,
    pub reward: Reward,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_input: Option<String>,
}

/// The viewer who redeemed a reward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedeemingUser {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub login: String,
    #[serde(default)]
    pub display_name: String,
}

/// The reward that was redeemed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reward {
    #[serde(default)]
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub cost: u64,
}

impl ChannelPointsMessage {
    /// Decode the string carried in [`MessageData::message`].
    ///
    /// # Errors
    ///
    /// Returns the underlying [`serde_json::Error`] on malformed input.
    pub fn parse(message: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(message)
    }

    /// Extract the redemption when this is a [`REWARD_REDEEMED`] message.
    ///
    /// Returns `Ok(None)` for other message kinds.
    ///
    /// # Errors
    ///
    /// Returns the underlying [`serde_json::Error`] if a `reward-redeemed`
    /// message does not contain a redemption.
    pub fn redemption(&self) -> Result<Option<Redemption>, serde_json::Error> {
        if self.kind != REWARD_REDEEMED {
            return Ok(None);
        }
        let data = RedemptionData::deserialize(&self.data)?;
        Ok(Some(data.redemption))
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

    #[test]
    fn listen_serializes_with_type_tag_and_nonce() {
        let frame = ClientFrame::listen("tok", vec!["channel-points-channel-v1.42".into()]);
        let value: serde_json::Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "LISTEN");
        assert_eq!(value["data"]["auth_token"], "tok");
        assert_eq!(value["data"]["topics"][0], "channel-points-channel-v1.42");
        assert_eq!(value["nonce"].as_str(), frame.nonce());
    }

    #[test]
    fn listen_nonces_are_fresh() {
        let a = ClientFrame::listen("tok", vec![]);
        let b = ClientFrame::listen("tok", vec![]);
        assert_ne!(a.nonce(), b.nonce());
    }

    #[test]
    fn ping_serializes_to_bare_type() {
        let json = serde_json::to_string(&ClientFrame::Ping).unwrap();
        assert_eq!(json, r#"{"type":"PING"}"#);
    }

    #[test]
    fn unknown_frame_type_is_tolerated() {
        let frame = ServerFrame::parse(r#"{"type":"SOMETHING_NEW","data":{}}"#).unwrap();
        assert_eq!(frame, ServerFrame::Unknown);
    }

    #[test]
    fn response_without_nonce_defaults() {
        let frame = ServerFrame::parse(r#"{"type":"RESPONSE","error":""}"#).unwrap();
        assert_eq!(
            frame,
            ServerFrame::Response {
                nonce: None,
                error: String::new()
            }
        );
    }

    #[test]
    fn non_reward_message_has_no_redemption() {
        let msg = ChannelPointsMessage::parse(r#"{"type":"custom-reward-updated","data":{}}"#)
            .unwrap();
        assert!(msg.redemption().unwrap().is_none());
    }

    #[test]
    fn reward_redeemed_without_redemption_is_an_error() {
        let msg = ChannelPointsMessage::parse(r#"{"type":"reward-redeemed","data":{}}"#).unwrap();
        assert!(msg.redemption().is_err());
    }
}
