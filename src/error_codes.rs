//! Error codes carried by `RESPONSE` frames.
//!
//! The server answers every `LISTEN` with a `RESPONSE` whose `error` field is
//! an empty string on success or one of a handful of `SCREAMING_SNAKE_CASE`
//! codes on failure. Any non-empty code is fatal for the session.

use std::fmt;

/// Structured failure reasons for a `LISTEN` request.
///
/// Codes the client does not recognise are preserved verbatim in
/// [`ListenError::Other`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenError {
    /// The `LISTEN` frame was malformed.
    BadMessage,
    /// The auth token is invalid or lacks the required scope.
    BadAuth,
    /// The server failed internally.
    Server,
    /// A requested topic is not valid.
    BadTopic,
    /// Any other code sent by the server.
    Other(String),
}

impl ListenError {
    /// Decode the `error` field of a `RESPONSE` frame.
    ///
    /// Returns `None` for the empty string, which signals success.
    pub fn from_response(error: &str) -> Option<Self> {
        let code = match error {
            "" => return None,
            "ERR_BADMESSAGE" => Self::BadMessage,
            "ERR_BADAUTH" => Self::BadAuth,
            "ERR_SERVER" => Self::Server,
            "ERR_BADTOPIC" => Self::BadTopic,
            other => Self::Other(other.to_string()),
        };
        Some(code)
    }

    /// The wire representation of this code.
    pub fn as_str(&self) -> &str {
        match self {
            Self::BadMessage => "ERR_BADMESSAGE",
            Self::BadAuth => "ERR_BADAUTH",
            Self::Server => "ERR_SERVER",
            Self::BadTopic => "ERR_BADTOPIC",
            Self::Other(code) => code,
        }
    }

    /// Returns a human-readable description of this error code.
    pub fn description(&self) -> &'static str {
        match self {
            Self::BadMessage => "The subscription request was rejected as malformed.",
            Self::BadAuth => {
                "The auth token is invalid or does not grant access to channel point redemptions."
            }
            Self::Server => "The notification service reported an internal error.",
            Self::BadTopic => "The subscription topic is not valid for this account.",
            Self::Other(_) => "The notification service rejected the subscription request.",
        }
    }
}

impl fmt::Display for ListenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
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
    fn empty_error_is_success() {
        assert_eq!(ListenError::from_response(""), None);
    }

    #[test]
    fn known_codes_decode() {
        assert_eq!(
            ListenError::from_response("ERR_BADAUTH"),
            Some(ListenError::BadAuth)
        );
        assert_eq!(
            ListenError::from_response("ERR_BADTOPIC"),
            Some(ListenError::BadTopic)
        );
        assert_eq!(
            ListenError::from_response("ERR_BADMESSAGE"),
            Some(ListenError::BadMessage)
        );
        assert_eq!(
            ListenError::from_response("ERR_SERVER"),
            Some(ListenError::Server)
        );
    }

    #[test]
    fn unknown_code_is_preserved() {
        let code = ListenError::from_response("ERR_SOMETHING_NEW").unwrap();
        assert_eq!(code, ListenError::Other("ERR_SOMETHING_NEW".into()));
        assert_eq!(code.to_string(), "ERR_SOMETHING_NEW");
    }

    #[test]
    fn every_code_has_a_description() {
        for code in [
            ListenError::BadMessage,
            ListenError::BadAuth,
            ListenError::Server,
            ListenError::BadTopic,
            ListenError::Other("X".into()),
        ] {
            assert!(!code.description().is_empty());
        }
    }
}
