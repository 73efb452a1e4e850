//! File-based configuration.
//!
//! ```toml
//! auth_token = "oauth-token"
//! queue = true
//!
//! [sounds."Airhorn"]
//! path = "sounds/airhorn.mp3"
//! volume = 80
//! ```
//!
//! [`Config::load`] reads the file and lets the
//! `CHANNEL_POINT_SOUNDS_AUTH_TOKEN` environment variable override the token,
//! so the secret does not have to live on disk.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ChannelPointsError, Result};
#[cfg(feature = "helix")]
use crate::identity::HelixIdentity;
use crate::playback::{QueueMode, Sound};
use crate::session::SessionConfig;

/// Environment variable that overrides [`Config::auth_token`].
pub const AUTH_TOKEN_ENV: &str = "CHANNEL_POINT_SOUNDS_AUTH_TOKEN";

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub auth_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Play one sound at a time (default) or all at once.
    #[serde(default = "default_queue")]
    pub queue: bool,
    /// Reward title → sound.
    #[serde(default)]
    pub sounds: HashMap<String, SoundConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct SoundConfig {
    pub path: PathBuf,
    /// Percent, `0..=100`.
    #[serde(default = "default_volume")]
    pub volume: u8,
}

fn default_queue() -> bool {
    true
}

fn default_volume() -> u8 {
    100
}

impl Config {
    /// Parse a TOML document.
    ///
    /// # Errors
    ///
    /// [`ChannelPointsError::Config`] on syntax or type errors.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| ChannelPointsError::Config(e.to_string()))
    }

    /// Read `path`, apply environment overrides and validate.
    ///
    /// # Errors
    ///
    /// [`ChannelPointsError::Io`] if the file cannot be read and
    /// [`ChannelPointsError::Config`] if it is invalid.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "loading configuration");
        let raw = fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(token) = env::var(AUTH_TOKEN_ENV) {
            if !token.is_empty() {
                self.auth_token = token;
            }
        }
    }

    /// # Errors
    ///
    /// [`ChannelPointsError::Config`] for an empty token or a volume above 100.
    pub fn validate(&self) -> Result<()> {
        if self.auth_token.trim().is_empty() {
            return Err(ChannelPointsError::Config(format!(
                "auth_token is empty; set it in the file or via {AUTH_TOKEN_ENV}"
            )));
        }
        for (title, sound) in &self.sounds {
            if sound.volume > 100 {
                return Err(ChannelPointsError::Config(format!(
                    "volume for \"{title}\" is {}, expected 0..=100",
                    sound.volume
                )));
            }
        }
        Ok(())
    }

    pub fn queue_mode(&self) -> QueueMode {
        QueueMode::from_flag(self.queue)
    }

    /// Reward title → normalized [`Sound`].
    pub fn sounds(&self) -> HashMap<String, Sound> {
        self.sounds
            .iter()
            .map(|(title, sound)| {
                (
                    title.clone(),
                    Sound::from_percent(sound.path.clone(), sound.volume),
                )
            })
            .collect()
    }

    pub fn into_session_config(self) -> SessionConfig {
        let mode = self.queue_mode();
        let sounds = self.sounds();
        SessionConfig::new(self.auth_token)
            .with_sounds(sounds)
            .with_queue_mode(mode)
    }

    /// Helix lookup for the user behind [`auth_token`](Self::auth_token),
    /// sent with [`client_id`](Self::client_id) when one is configured.
    #[cfg(feature = "helix")]
    pub fn helix_identity(&self) -> HelixIdentity {
        let identity = HelixIdentity::new(self.auth_token.clone());
        match &self.client_id {
            Some(client_id) => identity.with_client_id(client_id.clone()),
            None => identity,
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

    const SAMPLE: &str = r#"
auth_token = "abc"

[sounds."Airhorn"]
path = "sounds/airhorn.mp3"
volume = 80

[sounds."Bonk"]
path = "sounds/bonk.wav"
"#;

    #[test]
    fn parses_sample_with_defaults() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.auth_token, "abc");
        assert!(config.queue);
        assert_eq!(config.queue_mode(), QueueMode::Sequential);
        assert_eq!(config.sounds["Airhorn"].volume, 80);
        assert_eq!(config.sounds["Bonk"].volume, 100);
        config.validate().unwrap();
    }

    #[test]
    fn queue_flag_selects_concurrent_mode() {
        let config = Config::from_toml_str("auth_token = \"x\"\nqueue = false\n").unwrap();
        assert_eq!(config.queue_mode(), QueueMode::Concurrent);
    }

    #[test]
    fn sounds_are_normalized() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        let sounds = config.sounds();
        assert_eq!(sounds["Airhorn"], Sound::new("sounds/airhorn.mp3", 0.8));
        assert_eq!(sounds["Bonk"].volume, 1.0);
    }

    #[test]
    fn empty_token_is_rejected() {
        let config = Config::from_toml_str("").unwrap();
        assert!(matches!(
            config.validate(),
            Err(ChannelPointsError::Config(_))
        ));
    }

    #[test]
    fn loud_volume_is_rejected() {
        let config = Config::from_toml_str(
            "auth_token = \"x\"\n[sounds.A]\npath = \"a.mp3\"\nvolume = 150\n",
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn syntax_errors_are_config_errors() {
        assert!(matches!(
            Config::from_toml_str("auth_token = "),
            Err(ChannelPointsError::Config(_))
        ));
    }

    #[test]
    fn load_reads_file() {
        let path = env::temp_dir().join(format!("cps-config-{}.toml", std::process::id()));
        fs::write(&path, SAMPLE).unwrap();
        let config = Config::load(&path).unwrap();
        fs::remove_file(&path).unwrap();
        assert_eq!(config.sounds.len(), 2);
    }

    #[test]
    fn load_reports_missing_file() {
        let err = Config::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ChannelPointsError::Io(_)));
    }

    #[cfg(feature = "helix")]
    #[tokio::test]
    async fn helix_identity_sends_configured_client_id() {
        use crate::identity::IdentityProvider;
        use httpmock::prelude::*;

        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/helix/users")
                    .header("Authorization", "Bearer abc")
                    .header("Client-Id", "my-app");
                then.status(200).json_body(serde_json::json!({
                    "data": [{ "id": "42", "login": "me", "display_name": "Me" }]
                }));
            })
            .await;

        let config =
            Config::from_toml_str("auth_token = \"abc\"\nclient_id = \"my-app\"\n").unwrap();
        let identity = config
            .helix_identity()
            .with_endpoint(server.url("/helix/users"))
            .lookup()
            .await
            .unwrap();
        assert_eq!(identity.id, "42");
        mock.assert_async().await;
    }

    #[test]
    fn converts_into_session_config() {
        let session = Config::from_toml_str(SAMPLE).unwrap().into_session_config();
        assert_eq!(session.auth_token, "abc");
        assert_eq!(session.queue_mode, QueueMode::Sequential);
        assert_eq!(session.sounds.len(), 2);
    }
}
