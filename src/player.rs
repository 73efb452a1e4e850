//! A [`Player`] that shells out to an external audio program.
//!
//! Each sound runs in its own child process; the exit status decides whether
//! the item finished or failed.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::playback::{ItemId, PlaybackReporter, Player, Sound};

/// Program used by [`CommandPlayer::default`].
pub const DEFAULT_PROGRAM: &str = "ffplay";

/// Arguments used by [`CommandPlayer::default`]. `{volume}` is replaced by the
/// volume in percent and `{path}` by the sound's path.
pub const DEFAULT_ARGS: &[&str] = &[
    "-nodisp",
    "-autoexit",
    "-loglevel",
    "error",
    "-volume",
    "{volume}",
    "{path}",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPlayer {
    program: String,
    args: Vec<String>,
}

impl Default for CommandPlayer {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRAM, DEFAULT_ARGS.iter().copied())
    }
}

impl CommandPlayer {
    /// `args` may contain `{volume}` and `{path}` placeholders.
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// The arguments for playing `sound`, placeholders substituted.
    pub fn args_for(&self, sound: &Sound) -> Vec<String> {
        let volume = volume_percent(sound.volume).to_string();
        let path = sound.path.to_string_lossy();
        self.args
            .iter()
            .map(|arg| arg.replace("{volume}", &volume).replace("{path}", &path))
            .collect()
    }
}

fn volume_percent(volume: f32) -> u8 {
    (volume.clamp(0.0, 1.0) * 100.0).round() as u8
}

impl Player for CommandPlayer {
    fn prepare(&mut self, id: ItemId, sound: &Sound, reporter: PlaybackReporter) {
        let path = sound.path.clone();
        tokio::spawn(async move {
            if let Err(e) = check_readable(&path).await {
                reporter.failed(id, format!("cannot load {}: {e}", path.display()));
            }
        });
    }

    fn play(&mut self, id: ItemId, sound: &Sound, reporter: PlaybackReporter) {
        let mut command = Command::new(&self.program);
        command
            .args(self.args_for(sound))
            .stdin(Stdio::null())
            .stdout(Stdio::null());
        let path = sound.path.clone();

        tokio::spawn(async move {
            match command.status().await {
                Ok(status) if status.success() => {
                    debug!(id, path = %path.display(), "player exited");
                    reporter.finished(id);
                }
                Ok(status) => {
                    reporter.failed(id, format!("player exited with {status}"));
                }
                Err(e) => {
                    warn!(id, "failed to spawn player: {e}");
                    reporter.failed(id, format!("failed to spawn player: {e}"));
                }
            }
        });
    }
}

async fn check_readable(path: &Path) -> std::io::Result<()> {
    let metadata = tokio::fs::metadata(path).await?;
    if metadata.is_file() {
        Ok(())
    } else {
        Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "not a regular file",
        ))
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
    use crate::playback::PlaybackEvent;
    use std::time::Duration;

    #[test]
    fn default_args_substitute_placeholders() {
        let player = CommandPlayer::default();
        let args = player.args_for(&Sound::from_percent("sounds/horn.mp3", 80));
        assert_eq!(player.program(), "ffplay");
        assert_eq!(
            args,
            vec!["-nodisp", "-autoexit", "-loglevel", "error", "-volume", "80", "sounds/horn.mp3"]
        );
    }

    #[test]
    fn placeholders_inside_arguments_are_replaced() {
        let player = CommandPlayer::new("mpv", ["--volume={volume}", "{path}"]);
        let args = player.args_for(&Sound::new("a.wav", 0.26));
        assert_eq!(args, vec!["--volume=26", "a.wav"]);
    }

    #[tokio::test]
    async fn prepare_reports_missing_file() {
        let (reporter, mut rx) = PlaybackReporter::channel();
        CommandPlayer::default().prepare(4, &Sound::new("/no/such/sound.mp3", 1.0), reporter);
        match rx.recv().await {
            Some(PlaybackEvent::Failed { id, reason }) => {
                assert_eq!(id, 4);
                assert!(reason.contains("/no/such/sound.mp3"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn prepare_accepts_existing_file() {
        let path = std::env::temp_dir().join(format!("cps-player-{}.wav", std::process::id()));
        std::fs::write(&path, b"RIFF").unwrap();
        let (reporter, mut rx) = PlaybackReporter::channel();
        CommandPlayer::default().prepare(1, &Sound::new(&path, 1.0), reporter);
        // The spawned check drops its reporter without reporting.
        let outcome = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(outcome, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn zero_exit_reports_finished() {
        let (reporter, mut rx) = PlaybackReporter::channel();
        CommandPlayer::new("true", Vec::<String>::new()).play(7, &Sound::new("x", 1.0), reporter);
        assert_eq!(rx.recv().await, Some(PlaybackEvent::Finished(7)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_reports_failed() {
        let (reporter, mut rx) = PlaybackReporter::channel();
        CommandPlayer::new("false", Vec::<String>::new()).play(8, &Sound::new("x", 1.0), reporter);
        assert!(matches!(
            rx.recv().await,
            Some(PlaybackEvent::Failed { id: 8, .. })
        ));
    }

    #[tokio::test]
    async fn missing_program_reports_failed() {
        let (reporter, mut rx) = PlaybackReporter::channel();
        CommandPlayer::new("definitely-not-an-audio-player", ["{path}"]).play(
            9,
            &Sound::new("x", 1.0),
            reporter,
        );
        match rx.recv().await {
            Some(PlaybackEvent::Failed { id, reason }) => {
                assert_eq!(id, 9);
                assert!(reason.contains("spawn"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }
}
