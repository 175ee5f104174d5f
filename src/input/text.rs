//! Typed input source
//!
//! The keyboard-driven acquisition strategy: the surrounding UI calls
//! [`TextInputSource::submit`] with whatever the user typed, and the
//! session terminates with input-received or no-input accordingly.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use super::{InputListener, InputSource, ListenerSlot};

/// Input source fed by a text entry field.
pub struct TextInputSource {
    listener: ListenerSlot,
    active: AtomicBool,
}

impl TextInputSource {
    /// Create an idle text input source
    #[must_use]
    pub fn new() -> Self {
        Self {
            listener: ListenerSlot::new(),
            active: AtomicBool::new(false),
        }
    }

    /// Submit a line of typed input, ending the current attempt.
    ///
    /// Empty text counts as no input, mirroring a user dismissing the
    /// entry field without typing anything.
    pub fn submit(&self, text: &str) {
        self.active.store(false, Ordering::SeqCst);
        if text.is_empty() {
            self.listener.notify_no_input_received();
        } else {
            self.listener.notify_input_received(vec![text.to_string()]);
        }
    }
}

impl Default for TextInputSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InputSource for TextInputSource {
    fn set_listener(&self, listener: Box<dyn InputListener>) {
        self.listener.set(listener);
    }

    fn clear_listener(&self) {
        self.listener.clear();
    }

    async fn load(&self) {
        // nothing to prepare
    }

    async fn try_to_get_input(&self, _manual: bool) {
        self.active.store(true, Ordering::SeqCst);
        self.listener.notify_trying_to_get_input();
    }

    async fn cancel_getting_input(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            self.listener.notify_no_input_received();
        }
    }

    async fn cleanup(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.listener.clear();
    }
}
