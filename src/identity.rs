//! Who the session listens for.
//!
//! The subscription topic and the suffix stripped from inbound topics both
//! come from the broadcaster's user id, looked up once at startup. Both
//! failure modes are fatal: without an identity there is nothing to
//! subscribe to.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// The broadcaster whose redemptions are played.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    #[serde(default)]
    pub login: String,
    #[serde(default)]
    pub display_name: String,
}

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            login: String::new(),
            display_name: String::new(),
        }
    }
}

/// Resolves the identity behind the configured credentials.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Look up the identity.
    ///
    /// # Errors
    ///
    /// [`ChannelPointsError::IdentityNotFound`](crate::ChannelPointsError::IdentityNotFound)
    /// when the lookup succeeded but did not yield exactly one user, and
    /// [`ChannelPointsError::IdentityLookup`](crate::ChannelPointsError::IdentityLookup)
    /// when it failed.
    async fn lookup(&self) -> Result<Identity>;
}

/// A fixed identity, for callers that already know the user id.
#[async_trait]
impl IdentityProvider for Identity {
    async fn lookup(&self) -> Result<Identity> {
        Ok(self.clone())
    }
}

#[cfg(feature = "helix")]
pub use helix::{HelixIdentity, DEFAULT_CLIENT_ID, DEFAULT_USERS_ENDPOINT};

#[cfg(feature = "helix")]
mod helix {
    use async_trait::async_trait;
    use serde::Deserialize;
    use tracing::debug;

    use super::{Identity, IdentityProvider};
    use crate::error::{ChannelPointsError, Result};

    /// Users endpoint of the Helix API.
    pub const DEFAULT_USERS_ENDPOINT: &str = "https://api.twitch.tv/helix/users";

    /// Client id sent with identity lookups unless overridden.
    pub const DEFAULT_CLIENT_ID: &str = "5jxy0hrwy2ef5d8e74lpjcn4ygoaaq";

    #[derive(Debug, Deserialize)]
    struct UsersResponse {
        #[serde(default)]
        data: Vec<Identity>,
    }

    /// Looks up the user that owns an OAuth token via `GET /helix/users`.
    #[derive(Debug, Clone)]
    pub struct HelixIdentity {
        client: reqwest::Client,
        endpoint: String,
        auth_token: String,
        client_id: String,
    }

    impl HelixIdentity {
        pub fn new(auth_token: impl Into<String>) -> Self {
            Self {
                client: reqwest::Client::new(),
                endpoint: DEFAULT_USERS_ENDPOINT.to_string(),
                auth_token: auth_token.into(),
                client_id: DEFAULT_CLIENT_ID.to_string(),
            }
        }

        #[must_use]
        pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
            self.client_id = client_id.into();
            self
        }

        #[must_use]
        pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
            self.endpoint = endpoint.into();
            self
        }
    }

    fn lookup_error(e: &reqwest::Error) -> ChannelPointsError {
        ChannelPointsError::IdentityLookup {
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        }
    }

    #[async_trait]
    impl IdentityProvider for HelixIdentity {
        async fn lookup(&self) -> Result<Identity> {
            debug!(endpoint = %self.endpoint, "looking up user");
            let response = self
                .client
                .get(&self.endpoint)
                .bearer_auth(&self.auth_token)
                .header("Client-Id", &self.client_id)
                .send()
                .await
                .map_err(|e| lookup_error(&e))?;

            let status = response.status();
            if !status.is_success() {
                return Err(ChannelPointsError::IdentityLookup {
                    status: Some(status.as_u16()),
                    message: status.canonical_reason().unwrap_or("").to_string(),
                });
            }

            let body: UsersResponse = response.json().await.map_err(|e| lookup_error(&e))?;
            let mut users = body.data.into_iter();
            match (users.next(), users.next()) {
                (Some(user), None) => Ok(user),
                _ => Err(ChannelPointsError::IdentityNotFound),
            }
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
        use httpmock::prelude::*;
        use serde_json::json;

        async fn provider(server: &MockServer) -> HelixIdentity {
            HelixIdentity::new("tok")
                .with_client_id("cid")
                .with_endpoint(server.url("/helix/users"))
        }

        #[tokio::test]
        async fn single_user_is_returned() {
            let server = MockServer::start_async().await;
            let mock = server
                .mock_async(|when, then| {
                    when.method(GET)
                        .path("/helix/users")
                        .header("Authorization", "Bearer tok")
                        .header("Client-Id", "cid");
                    then.status(200).json_body(json!({
                        "data": [{ "id": "12345", "login": "streamer", "display_name": "Streamer" }]
                    }));
                })
                .await;

            let identity = provider(&server).await.lookup().await.unwrap();
            assert_eq!(identity.id, "12345");
            assert_eq!(identity.login, "streamer");
            mock.assert_async().await;
        }

        #[tokio::test]
        async fn empty_result_is_not_found() {
            let server = MockServer::start_async().await;
            server
                .mock_async(|when, then| {
                    when.method(GET).path("/helix/users");
                    then.status(200).json_body(json!({ "data": [] }));
                })
                .await;

            let err = provider(&server).await.lookup().await.unwrap_err();
            assert!(matches!(err, ChannelPointsError::IdentityNotFound));
        }

        #[tokio::test]
        async fn error_status_is_a_lookup_failure() {
            let server = MockServer::start_async().await;
            server
                .mock_async(|when, then| {
                    when.method(GET).path("/helix/users");
                    then.status(401).json_body(json!({ "error": "Unauthorized" }));
                })
                .await;

            let err = provider(&server).await.lookup().await.unwrap_err();
            match err {
                ChannelPointsError::IdentityLookup { status, .. } => assert_eq!(status, Some(401)),
                other => panic!("expected IdentityLookup, got {other:?}"),
            }
        }

        #[tokio::test]
        async fn unreachable_endpoint_is_a_lookup_failure() {
            let err = HelixIdentity::new("tok")
                .with_endpoint("http://127.0.0.1:1/helix/users")
                .lookup()
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                ChannelPointsError::IdentityLookup { status: None, .. }
            ));
        }
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

    #[tokio::test]
    async fn fixed_identity_looks_up_itself() {
        let identity = Identity::new("42");
        assert_eq!(identity.lookup().await.unwrap(), identity);
    }
}
