//! Input acquisition
//!
//! Every way of getting a command from the user — typed or spoken —
//! implements the same contract: a new attempt begins with
//! trying-to-get-input, zero or more partial notifications may follow,
//! and exactly one terminal notification ends it (input received, no
//! input, or error).

pub mod speech;
pub mod text;
pub mod voice;

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::Error;

/// Observer for one input source.
///
/// Registration is single-slot: setting a listener replaces the previous
/// one. Listeners must tolerate repeated partial notifications before the
/// terminal one, and must not call back into the source from within a
/// notification.
pub trait InputListener: Send {
    /// The source started trying to get some input
    fn on_trying_to_get_input(&mut self);

    /// The user provided some partial input (e.g. while still talking)
    fn on_partial_input(&mut self, input: &str);

    /// Input was received; candidates are ordered best-first
    fn on_input_received(&mut self, input: Vec<String>);

    /// The user seemed to want to provide input, but none arrived
    fn on_no_input_received(&mut self);

    /// Something went wrong while getting input or processing it
    fn on_error(&mut self, error: &Error);
}

/// The single swappable listener slot shared by all input sources.
pub(crate) struct ListenerSlot {
    listener: Mutex<Option<Box<dyn InputListener>>>,
}

impl ListenerSlot {
    pub(crate) fn new() -> Self {
        Self {
            listener: Mutex::new(None),
        }
    }

    pub(crate) fn set(&self, listener: Box<dyn InputListener>) {
        *self.lock() = Some(listener);
    }

    pub(crate) fn clear(&self) {
        *self.lock() = None;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Box<dyn InputListener>>> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with(&self, f: impl FnOnce(&mut dyn InputListener)) {
        if let Some(listener) = self.lock().as_mut() {
            f(listener.as_mut());
        }
    }

    pub(crate) fn notify_trying_to_get_input(&self) {
        tracing::debug!("trying to get input");
        self.with(|listener| listener.on_trying_to_get_input());
    }

    pub(crate) fn notify_partial_input(&self, input: &str) {
        tracing::debug!(input, "partial input from user");
        self.with(|listener| listener.on_partial_input(input));
    }

    pub(crate) fn notify_input_received(&self, input: Vec<String>) {
        tracing::info!(?input, "input from user");
        self.with(|listener| listener.on_input_received(input));
    }

    pub(crate) fn notify_no_input_received(&self) {
        tracing::debug!("no input from user");
        self.with(|listener| listener.on_no_input_received());
    }

    pub(crate) fn notify_error(&self, error: &Error) {
        tracing::warn!(error = %error, "input error");
        self.with(|listener| listener.on_error(error));
    }
}

/// An input acquisition strategy.
///
/// Errors never cross these operations: outcomes are observed only
/// through the registered [`InputListener`].
#[async_trait]
pub trait InputSource: Send + Sync {
    /// Register (or replace) the listener
    fn set_listener(&self, listener: Box<dyn InputListener>);

    /// Detach the listener
    fn clear_listener(&self);

    /// Prepare the source. Heavy work runs off the calling task.
    async fn load(&self);

    /// Start trying to get input. `manual` records whether the user
    /// explicitly triggered the source (e.g. pressed a button), which
    /// gates actions with side effects like model downloads.
    async fn try_to_get_input(&self, manual: bool);

    /// Stop an in-flight attempt. Idempotent.
    async fn cancel_getting_input(&self);

    /// Tear the source down: detaches the listener and releases any
    /// owned session or hardware resource. Idempotent.
    async fn cleanup(&self);
}
