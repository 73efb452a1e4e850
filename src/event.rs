//! Session notifications delivered to the embedding application.
//!
//! Events are informational: the session never waits for them to be read.
//! When the consumer falls behind, [`EventEmitter::emit`] drops the event with
//! a warning instead of stalling the loop.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error_codes::ListenError;
use crate::playback::ItemId;

/// Something observable happened in the session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A connection attempt started.
    Connecting,
    /// The transport opened and `LISTEN` was sent.
    Connected,
    /// The server confirmed the subscription.
    Listening,
    /// The server rejected the subscription. Retrying is now disabled.
    ListenFailed { error: ListenError },
    /// The transport closed. `retry_in` is the jittered delay until the next
    /// attempt, or `None` if retrying is disabled.
    Disconnected { retry_in: Option<Duration> },
    /// A reward redemption arrived.
    RewardRedeemed { title: String },
    /// A redeemed reward has no sound configured.
    NoSoundConfigured { title: String },
    /// A sound is waiting for its turn.
    SoundQueued { id: ItemId, path: PathBuf },
    /// A sound started playing.
    SoundPlaying { id: ItemId, path: PathBuf },
    /// A sound finished playing.
    SoundFinished { id: ItemId, path: PathBuf },
    /// A sound could not be loaded or played.
    SoundFailed {
        id: ItemId,
        path: PathBuf,
        reason: String,
    },
}

/// Non-blocking sender for [`SessionEvent`]s.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: Option<mpsc::Sender<SessionEvent>>,
}

impl EventEmitter {
    pub fn new(tx: mpsc::Sender<SessionEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// An emitter that discards everything.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: SessionEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                warn!("event channel full, dropping event: {dropped:?}");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("event channel closed, receiver dropped");
            }
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
    async fn full_channel_drops_instead_of_blocking() {
        let (tx, mut rx) = mpsc::channel(1);
        let emitter = EventEmitter::new(tx);
        emitter.emit(SessionEvent::Connecting);
        emitter.emit(SessionEvent::Connected);
        assert_eq!(rx.recv().await, Some(SessionEvent::Connecting));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn closed_channel_is_ignored() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        EventEmitter::new(tx).emit(SessionEvent::Listening);
        EventEmitter::disabled().emit(SessionEvent::Listening);
    }
}
