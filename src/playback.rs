//! Ordered playback of redeemed sounds.
//!
//! [`PlaybackQueue`] owns every in-flight [`PlaybackItem`] in arrival order.
//! In [`QueueMode::Sequential`] only the head plays and the rest are
//! pre-buffered; when the head finishes or fails the next one starts. In
//! [`QueueMode::Concurrent`] every item starts as soon as it arrives and the
//! queue only tracks what is still playing.
//!
//! Actual audio output is delegated to a [`Player`]. Players report completion
//! asynchronously through the [`PlaybackReporter`] they are handed, and the
//! session loop feeds those reports back into [`PlaybackQueue::handle`].

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::event::{EventEmitter, SessionEvent};

/// Identifies one queued or playing sound.
pub type ItemId = u64;

/// A sound resource and the volume to play it at.
#[derive(Debug, Clone, PartialEq)]
pub struct Sound {
    pub path: PathBuf,
    /// Normalized volume in `0.0..=1.0`.
    pub volume: f32,
}

impl Sound {
    /// Create a sound, clamping `volume` to `0.0..=1.0`.
    pub fn new(path: impl Into<PathBuf>, volume: f32) -> Self {
        Self {
            path: path.into(),
            volume: if volume.is_nan() {
                1.0
            } else {
                volume.clamp(0.0, 1.0)
            },
        }
    }

    /// Create a sound from a volume percentage (`0..=100`).
    pub fn from_percent(path: impl Into<PathBuf>, percent: u8) -> Self {
        Self::new(path, f32::from(percent) / 100.0)
    }
}

/// Playback lifecycle of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    Queued,
    Playing,
    Finished,
    Failed,
}

/// One entry in the queue.
#[derive(Debug, Clone)]
pub struct PlaybackItem {
    pub id: ItemId,
    pub sound: Sound,
    pub state: ItemState,
}

/// How the queue schedules playback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueMode {
    /// One sound at a time, in arrival order.
    #[default]
    Sequential,
    /// Every sound starts immediately.
    Concurrent,
}

impl QueueMode {
    /// `true` selects [`QueueMode::Sequential`].
    pub fn from_flag(sequential: bool) -> Self {
        if sequential {
            Self::Sequential
        } else {
            Self::Concurrent
        }
    }
}

/// Terminal outcome reported by a [`Player`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    Finished(ItemId),
    Failed { id: ItemId, reason: String },
}

/// Handle a [`Player`] uses to report how an item ended.
///
/// Reports after the session has stopped are dropped silently.
#[derive(Debug, Clone)]
pub struct PlaybackReporter {
    tx: mpsc::UnboundedSender<PlaybackEvent>,
}

impl PlaybackReporter {
    /// Create a reporter and the receiver its reports arrive on.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PlaybackEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn finished(&self, id: ItemId) {
        let _ = self.tx.send(PlaybackEvent::Finished(id));
    }

    pub fn failed(&self, id: ItemId, reason: impl Into<String>) {
        let _ = self.tx.send(PlaybackEvent::Failed {
            id,
            reason: reason.into(),
        });
    }
}

/// Audio output collaborator.
///
/// Both methods must return promptly; long-running work belongs in a spawned
/// task that eventually calls [`PlaybackReporter::finished`] or
/// [`PlaybackReporter::failed`] exactly once for items passed to
/// [`play`](Player::play).
pub trait Player: Send + 'static {
    /// Load `sound` ahead of time without starting it. A player may report an
    /// early failure here, which removes the item from the queue.
    fn prepare(&mut self, id: ItemId, sound: &Sound, reporter: PlaybackReporter);

    /// Start playing `sound` now.
    fn play(&mut self, id: ItemId, sound: &Sound, reporter: PlaybackReporter);
}

/// Accepts playback requests from topic handlers.
pub trait PlaybackSink {
    /// Submit a sound for playback.
    fn submit(&mut self, sound: Sound);
}

/// The ordered playback queue.
pub struct PlaybackQueue {
    mode: QueueMode,
    items: VecDeque<PlaybackItem>,
    player: Box<dyn Player>,
    reporter: PlaybackReporter,
    next_id: ItemId,
    events: EventEmitter,
}

impl PlaybackQueue {
    pub fn new(
        mode: QueueMode,
        player: Box<dyn Player>,
        reporter: PlaybackReporter,
        events: EventEmitter,
    ) -> Self {
        Self {
            mode,
            items: VecDeque::new(),
            player,
            reporter,
            next_id: 0,
            events,
        }
    }

    pub fn mode(&self) -> QueueMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Items in arrival order.
    pub fn items(&self) -> impl Iterator<Item = &PlaybackItem> {
        self.items.iter()
    }

    pub fn state_of(&self, id: ItemId) -> Option<ItemState> {
        self.items.iter().find(|item| item.id == id).map(|item| item.state)
    }

    /// Append a sound. It starts immediately in concurrent mode or when the
    /// queue was empty; otherwise it is pre-buffered and waits its turn.
    pub fn enqueue(&mut self, sound: Sound) -> ItemId {
        let id = self.next_id;
        self.next_id += 1;

        let starts_now = self.mode == QueueMode::Concurrent || self.items.is_empty();
        let state = if starts_now {
            ItemState::Playing
        } else {
            ItemState::Queued
        };
        self.items.push_back(PlaybackItem {
            id,
            sound: sound.clone(),
            state,
        });

        if starts_now {
            info!(id, path = %sound.path.display(), "playing sound");
            self.events.emit(SessionEvent::SoundPlaying {
                id,
                path: sound.path.clone(),
            });
            self.player.play(id, &sound, self.reporter.clone());
        } else {
            info!(id, path = %sound.path.display(), "queued sound to play");
            self.events.emit(SessionEvent::SoundQueued {
                id,
                path: sound.path.clone(),
            });
            self.player.prepare(id, &sound, self.reporter.clone());
        }
        id
    }

    /// Apply a report from the player.
    pub fn handle(&mut self, event: PlaybackEvent) {
        match event {
            PlaybackEvent::Finished(id) => self.on_finished(id),
            PlaybackEvent::Failed { id, reason } => self.on_failed(id, &reason),
        }
    }

    /// The item ended normally.
    pub fn on_finished(&mut self, id: ItemId) {
        if let Some(item) = self.complete(id, ItemState::Finished) {
            info!(id, path = %item.sound.path.display(), "finished playing sound");
            self.events.emit(SessionEvent::SoundFinished {
                id,
                path: item.sound.path,
            });
        }
    }

    /// The item could not be loaded or played. The queue advances exactly as
    /// it would on completion.
    pub fn on_failed(&mut self, id: ItemId, reason: &str) {
        if let Some(item) = self.complete(id, ItemState::Failed) {
            warn!(id, path = %item.sound.path.display(), %reason, "failed to play sound");
            self.events.emit(SessionEvent::SoundFailed {
                id,
                path: item.sound.path,
                reason: reason.to_string(),
            });
        }
    }

    /// Remove `id` and, in sequential mode, start the new head if the removed
    /// item was the head. Both happen before control returns to the loop.
    fn complete(&mut self, id: ItemId, outcome: ItemState) -> Option<PlaybackItem> {
        let Some(index) = self.items.iter().position(|item| item.id == id) else {
            debug!(id, "ignoring report for an item no longer in the queue");
            return None;
        };
        let mut item = self.items.remove(index)?;
        item.state = outcome;

        if self.mode == QueueMode::Sequential && index == 0 {
            self.start_head();
        }
        Some(item)
    }

    fn start_head(&mut self) {
        let Some(head) = self.items.front_mut() else {
            return;
        };
        if head.state != ItemState::Queued {
            return;
        }
        head.state = ItemState::Playing;
        let id = head.id;
        let sound = head.sound.clone();

        info!(id, path = %sound.path.display(), "playing sound");
        self.events.emit(SessionEvent::SoundPlaying {
            id,
            path: sound.path.clone(),
        });
        self.player.play(id, &sound, self.reporter.clone());
    }
}

impl PlaybackSink for PlaybackQueue {
    fn submit(&mut self, sound: Sound) {
        self.enqueue(sound);
    }
}

impl fmt::Debug for PlaybackQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackQueue")
            .field("mode", &self.mode)
            .field("items", &self.items)
            .finish()
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
    use std::sync::{Arc, Mutex as StdMutex};

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Prepare(ItemId),
        Play(ItemId),
    }

    /// Records calls; completion is driven by the test.
    struct RecordingPlayer {
        calls: Arc<StdMutex<Vec<Call>>>,
    }

    impl Player for RecordingPlayer {
        fn prepare(&mut self, id: ItemId, _sound: &Sound, _reporter: PlaybackReporter) {
            self.calls.lock().unwrap().push(Call::Prepare(id));
        }

        fn play(&mut self, id: ItemId, _sound: &Sound, _reporter: PlaybackReporter) {
            self.calls.lock().unwrap().push(Call::Play(id));
        }
    }

    fn queue(mode: QueueMode) -> (PlaybackQueue, Arc<StdMutex<Vec<Call>>>) {
        let calls = Arc::new(StdMutex::new(Vec::new()));
        let player = RecordingPlayer {
            calls: Arc::clone(&calls),
        };
        let (reporter, _rx) = PlaybackReporter::channel();
        let queue = PlaybackQueue::new(mode, Box::new(player), reporter, EventEmitter::disabled());
        (queue, calls)
    }

    fn sound(name: &str) -> Sound {
        Sound::from_percent(format!("{name}.mp3"), 50)
    }

    /// At most one item plays and it is the head.
    fn assert_sequential_invariant(queue: &PlaybackQueue) {
        let playing: Vec<_> = queue
            .items()
            .enumerate()
            .filter(|(_, item)| item.state == ItemState::Playing)
            .map(|(index, _)| index)
            .collect();
        assert!(playing.is_empty() || playing == vec![0], "playing at {playing:?}");
        if !queue.is_empty() {
            assert_eq!(queue.items().next().unwrap().state, ItemState::Playing);
        }
    }

    #[test]
    fn sequential_plays_first_and_prepares_the_rest() {
        let (mut queue, calls) = queue(QueueMode::Sequential);
        let a = queue.enqueue(sound("a"));
        let b = queue.enqueue(sound("b"));
        let c = queue.enqueue(sound("c"));

        assert_eq!(
            *calls.lock().unwrap(),
            vec![Call::Play(a), Call::Prepare(b), Call::Prepare(c)]
        );
        assert_eq!(queue.state_of(a), Some(ItemState::Playing));
        assert_eq!(queue.state_of(b), Some(ItemState::Queued));
        assert_sequential_invariant(&queue);
    }

    #[test]
    fn sequential_advances_on_finish_and_on_failure() {
        let (mut queue, calls) = queue(QueueMode::Sequential);
        let a = queue.enqueue(sound("a"));
        let b = queue.enqueue(sound("b"));
        let c = queue.enqueue(sound("c"));

        queue.on_finished(a);
        assert_eq!(queue.state_of(b), Some(ItemState::Playing));
        assert_sequential_invariant(&queue);

        queue.on_failed(b, "decode error");
        assert_eq!(queue.state_of(c), Some(ItemState::Playing));
        assert_sequential_invariant(&queue);

        queue.handle(PlaybackEvent::Finished(c));
        assert!(queue.is_empty());
        assert_eq!(
            calls.lock().unwrap().iter().filter(|c| matches!(c, Call::Play(_))).count(),
            3
        );
    }

    #[test]
    fn failure_of_a_queued_item_does_not_start_anything() {
        let (mut queue, calls) = queue(QueueMode::Sequential);
        let a = queue.enqueue(sound("a"));
        let b = queue.enqueue(sound("b"));
        let c = queue.enqueue(sound("c"));

        queue.on_failed(b, "missing file");
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.state_of(a), Some(ItemState::Playing));
        assert_eq!(queue.state_of(c), Some(ItemState::Queued));
        assert_sequential_invariant(&queue);

        queue.on_finished(a);
        assert_eq!(queue.state_of(c), Some(ItemState::Playing));
        assert_eq!(calls.lock().unwrap().last(), Some(&Call::Play(c)));
    }

    #[test]
    fn empty_queue_starts_next_arrival_immediately() {
        let (mut queue, _calls) = queue(QueueMode::Sequential);
        let a = queue.enqueue(sound("a"));
        queue.on_finished(a);
        let b = queue.enqueue(sound("b"));
        assert_eq!(queue.state_of(b), Some(ItemState::Playing));
    }

    #[test]
    fn duplicate_and_unknown_reports_are_ignored() {
        let (mut queue, calls) = queue(QueueMode::Sequential);
        let a = queue.enqueue(sound("a"));
        let b = queue.enqueue(sound("b"));
        queue.on_finished(a);
        queue.on_finished(a);
        queue.on_failed(999, "nope");
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.state_of(b), Some(ItemState::Playing));
        assert_eq!(
            calls.lock().unwrap().iter().filter(|c| **c == Call::Play(b)).count(),
            1
        );
    }

    #[test]
    fn invariant_holds_for_interleaved_operations() {
        let (mut queue, _calls) = queue(QueueMode::Sequential);
        let mut ids = Vec::new();
        for round in 0..30u64 {
            ids.push(queue.enqueue(sound(&format!("s{round}"))));
            if round % 3 == 0 {
                let head = queue.items().next().map(|item| item.id);
                if let Some(head) = head {
                    queue.on_finished(head);
                }
            }
            if round % 5 == 0 {
                if let Some(last) = queue.items().last().map(|item| item.id) {
                    queue.on_failed(last, "boom");
                }
            }
            assert_sequential_invariant(&queue);
        }
    }

    #[test]
    fn concurrent_plays_everything_immediately() {
        let (mut queue, calls) = queue(QueueMode::Concurrent);
        let a = queue.enqueue(sound("a"));
        let b = queue.enqueue(sound("b"));
        let c = queue.enqueue(sound("c"));

        assert_eq!(
            *calls.lock().unwrap(),
            vec![Call::Play(a), Call::Play(b), Call::Play(c)]
        );
        assert!(queue.items().all(|item| item.state == ItemState::Playing));

        queue.on_finished(a);
        assert_eq!(calls.lock().unwrap().len(), 3);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn sound_volume_is_normalized() {
        assert_eq!(Sound::from_percent("x", 50).volume, 0.5);
        assert_eq!(Sound::new("x", 3.0).volume, 1.0);
        assert_eq!(Sound::new("x", -1.0).volume, 0.0);
    }

    #[tokio::test]
    async fn reporter_delivers_events_in_order() {
        let (reporter, mut rx) = PlaybackReporter::channel();
        reporter.finished(1);
        reporter.failed(2, "bad");
        assert_eq!(rx.recv().await, Some(PlaybackEvent::Finished(1)));
        assert_eq!(
            rx.recv().await,
            Some(PlaybackEvent::Failed {
                id: 2,
                reason: "bad".into()
            })
        );
    }
}
