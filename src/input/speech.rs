//! Presentation state machine for speech input
//!
//! The four states drive presentation only (which icon the microphone
//! button shows); they have no effect on the acquisition engine itself.
//! The tracker performs no I/O and has no timers: it only remembers the
//! last state shown, and replays it whenever a presentation surface is
//! (re)attached.

/// Visible state of a speech input source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechState {
    /// A model download is required before listening can start
    RequiresDownload,
    /// The model is being downloaded, extracted, or loaded
    Loading,
    /// Ready and waiting for a trigger
    Idle,
    /// A listening session is active
    Listening,
}

/// Presentation surface for [`SpeechState`] changes.
///
/// Observers must not call back into the input source from within a
/// notification; user-triggered operations arrive through the source's
/// own entry points.
pub trait SpeechStateObserver: Send {
    /// The visible state changed (or was replayed on attach)
    fn on_state_changed(&mut self, state: SpeechState);
}

/// Remembers the last state shown and forwards changes to the single
/// attached observer.
pub struct StateTracker {
    current: SpeechState,
    observer: Option<Box<dyn SpeechStateObserver>>,
}

impl StateTracker {
    /// Create a tracker in the initial [`SpeechState::Idle`] state
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: SpeechState::Idle,
            observer: None,
        }
    }

    /// Attach, replace or detach the observer. A newly attached observer
    /// immediately receives the current state.
    pub fn set_observer(&mut self, observer: Option<Box<dyn SpeechStateObserver>>) {
        self.observer = observer;
        let current = self.current;
        if let Some(observer) = self.observer.as_mut() {
            observer.on_state_changed(current);
        }
    }

    /// Record and forward a state change
    pub fn show(&mut self, state: SpeechState) {
        tracing::debug!(?state, "speech input state");
        self.current = state;
        if let Some(observer) = self.observer.as_mut() {
            observer.on_state_changed(state);
        }
    }

    /// The last state shown
    #[must_use]
    pub fn current(&self) -> SpeechState {
        self.current
    }

    /// Detach the observer and return to the initial state
    pub fn reset(&mut self) {
        self.observer = None;
        self.current = SpeechState::Idle;
    }
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}
