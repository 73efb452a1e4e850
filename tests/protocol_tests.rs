#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Protocol decoding tests against fixtures shaped like real server output.

use channel_point_sounds::error_codes::ListenError;
use channel_point_sounds::protocol::{
    ChannelPointsMessage, ClientFrame, ListenData, MessageData, ServerFrame,
    CHANNEL_POINTS_TOPIC, REWARD_REDEEMED,
};
use serde_json::json;

// ════════════════════════════════════════════════════════════════════
// Client frames
// ════════════════════════════════════════════════════════════════════

#[test]
fn listen_frame_matches_wire_format() {
    let frame = ClientFrame::Listen {
        nonce: Some("44h1k13746815ab1r2".into()),
        data: ListenData {
            topics: vec![format!("{CHANNEL_POINTS_TOPIC}.44322889")],
            auth_token: "cfabdegwdoklmawdzdo98xt2fo512y".into(),
        },
    };
    let value: serde_json::Value = serde_json::to_value(&frame).unwrap();
    assert_eq!(
        value,
        json!({
            "type": "LISTEN",
            "nonce": "44h1k13746815ab1r2",
            "data": {
                "topics": ["channel-points-channel-v1.44322889"],
                "auth_token": "cfabdegwdoklmawdzdo98xt2fo512y"
            }
        })
    );
}

#[test]
fn listen_without_nonce_omits_the_field() {
    let frame = ClientFrame::Listen {
        nonce: None,
        data: ListenData {
            topics: vec![],
            auth_token: "t".into(),
        },
    };
    let raw = serde_json::to_string(&frame).unwrap();
    assert!(!raw.contains("nonce"));
}

#[test]
fn generated_nonce_is_a_uuid() {
    let frame = ClientFrame::listen("t", vec!["topic.1".into()]);
    let nonce = frame.nonce().unwrap();
    assert!(uuid::Uuid::parse_str(nonce).is_ok());
}

#[test]
fn ping_frame_matches_wire_format() {
    assert_eq!(
        serde_json::to_string(&ClientFrame::Ping).unwrap(),
        r#"{"type":"PING"}"#
    );
}

// ════════════════════════════════════════════════════════════════════
// Server frames
// ════════════════════════════════════════════════════════════════════

#[test]
fn control_frames_decode() {
    assert_eq!(ServerFrame::parse(r#"{"type":"PONG"}"#).unwrap(), ServerFrame::Pong);
    assert_eq!(
        ServerFrame::parse(r#"{"type":"RECONNECT"}"#).unwrap(),
        ServerFrame::Reconnect
    );
}

#[test]
fn response_frames_decode() {
    assert_eq!(
        ServerFrame::parse(r#"{"type":"RESPONSE","error":"","nonce":"44h1k13746815ab1r2"}"#)
            .unwrap(),
        ServerFrame::Response {
            nonce: Some("44h1k13746815ab1r2".into()),
            error: String::new()
        }
    );
    assert_eq!(
        ServerFrame::parse(r#"{"type":"RESPONSE","error":"ERR_BADAUTH"}"#).unwrap(),
        ServerFrame::Response {
            nonce: None,
            error: "ERR_BADAUTH".into()
        }
    );
}

#[test]
fn unknown_and_malformed_frames() {
    assert_eq!(
        ServerFrame::parse(r#"{"type":"AUTH_REVOKED","data":{}}"#).unwrap(),
        ServerFrame::Unknown
    );
    assert!(ServerFrame::parse("").is_err());
    assert!(ServerFrame::parse("[]").is_err());
    assert!(ServerFrame::parse(r#"{"data":{}}"#).is_err());
    // Known type with missing payload.
    assert!(ServerFrame::parse(r#"{"type":"MESSAGE"}"#).is_err());
}

/// A redemption as delivered on the channel points topic.
const REDEMPTION_FIXTURE: &str = r##"{
  "type": "reward-redeemed",
  "data": {
    "timestamp": "2019-11-12T01:29:34.98329743Z",
    "redemption": {
      "id": "9203c6f0-51b6-4d1d-a9ae-8eafdb0d6d47",
      "user": {
        "id": "30515034",
        "login": "davethecust",
        "display_name": "davethecust"
      },
      "channel_id": "30515034",
      "redeemed_at": "2019-12-11T18:52:53.128421623Z",
      "reward": {
        "id": "6ef17bb2-e5ae-432e-8b3f-5ac4dd774668",
        "channel_id": "30515034",
        "title": "hit a gleesh walk on stream",
        "prompt": "cleanside's finest \n",
        "cost": 10,
        "is_user_input_required": true,
        "is_sub_only": false,
        "image": null,
        "background_color": "#00C7AC",
        "is_enabled": true,
        "is_paused": false,
        "is_in_stock": true,
        "max_per_stream": { "is_enabled": false, "max_per_stream": 0 },
        "should_redemptions_skip_request_queue": true
      },
      "user_input": "yeooo",
      "status": "FULFILLED"
    }
  }
}"##;

#[test]
fn message_frame_carries_string_encoded_document() {
    let raw = json!({
        "type": "MESSAGE",
        "data": {
            "topic": "channel-points-channel-v1.30515034",
            "message": REDEMPTION_FIXTURE
        }
    })
    .to_string();

    let ServerFrame::Message { data } = ServerFrame::parse(&raw).unwrap() else {
        panic!("expected MESSAGE");
    };
    assert_eq!(data.topic, "channel-points-channel-v1.30515034");

    let message = ChannelPointsMessage::parse(&data.message).unwrap();
    assert_eq!(message.kind, REWARD_REDEEMED);
    let redemption = message.redemption().unwrap().unwrap();
    assert_eq!(redemption.reward.title, "hit a gleesh walk on stream");
    assert_eq!(redemption.reward.cost, 10);
    assert_eq!(redemption.user_input.as_deref(), Some("yeooo"));
    assert_eq!(redemption.user.unwrap().login, "davethecust");
}

#[test]
fn message_data_round_trips_through_frame() {
    let frame = ServerFrame::Message {
        data: MessageData {
            topic: "channel-points-channel-v1.1".into(),
            message: "{}".into(),
        },
    };
    let raw = serde_json::to_string(&frame).unwrap();
    assert_eq!(ServerFrame::parse(&raw).unwrap(), frame);
}

#[test]
fn other_channel_points_kinds_are_not_redemptions() {
    let message = ChannelPointsMessage::parse(
        r#"{"type":"custom-reward-updated","data":{"updated_reward":{}}}"#,
    )
    .unwrap();
    assert!(message.redemption().unwrap().is_none());
}

// ════════════════════════════════════════════════════════════════════
// RESPONSE error strings
// ════════════════════════════════════════════════════════════════════

#[test]
fn response_errors_map_to_listen_errors() {
    let cases = [
        ("ERR_BADMESSAGE", ListenError::BadMessage),
        ("ERR_BADAUTH", ListenError::BadAuth),
        ("ERR_SERVER", ListenError::Server),
        ("ERR_BADTOPIC", ListenError::BadTopic),
    ];
    for (raw, expected) in cases {
        let error = ListenError::from_response(raw).unwrap();
        assert_eq!(error, expected);
        assert_eq!(error.as_str(), raw);
        assert!(!error.description().is_empty());
    }
}

#[test]
fn unrecognized_response_error_is_kept_verbatim() {
    assert_eq!(
        ListenError::from_response("ERR_SOMETHING_NEW"),
        Some(ListenError::Other("ERR_SOMETHING_NEW".into()))
    );
    assert_eq!(ListenError::from_response(""), None);
}
