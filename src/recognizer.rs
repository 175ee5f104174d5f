//! Recognition engine seam
//!
//! The engine itself is an external collaborator: it owns the OS-level
//! microphone and audio resources and is constructed from a model
//! directory and a sample rate. This module defines the boundary the
//! lifecycle drives and the payload parsing shared by implementations.

use std::path::Path;

use serde::Deserialize;
use tokio::sync::mpsc;

use crate::Result;

/// Constructor failure message that identifies a busy or missing microphone.
///
/// Factories report this exact message (in an [`crate::Error::Engine`])
/// when recorder initialization fails, so the lifecycle can surface a
/// distinct error to the presentation layer.
pub const MICROPHONE_BUSY_MESSAGE: &str =
    "failed to initialize recorder: microphone might be already in use";

/// Events delivered by a recognizer during a streaming session.
///
/// `Partial` and `Final` carry the engine-specific JSON payload; see
/// [`parse_partial`] and [`parse_alternatives`].
#[derive(Debug, Clone)]
pub enum RecognitionEvent {
    /// Intermediate hypothesis while the user is still talking
    Partial(String),
    /// End-of-utterance result with one or more alternatives
    Final(String),
    /// The engine gave up waiting for speech
    Timeout,
    /// The engine failed mid-session
    Error(String),
}

/// A live recognition engine instance.
///
/// Exclusively owned by the lifecycle that created it; it must be
/// [`shutdown`](Self::shutdown) explicitly before the owning session ends
/// and before another instance is created.
pub trait SpeechRecognizer: Send + Sync {
    /// Begin a streaming session. Events flow into `events` until a
    /// final result, timeout or error ends the utterance.
    ///
    /// # Errors
    ///
    /// Returns an error if the session cannot be started.
    fn start_listening(&self, events: mpsc::UnboundedSender<RecognitionEvent>) -> Result<()>;

    /// Stop the in-flight session. Safe to call when not listening.
    fn stop(&self);

    /// Release the engine and its audio resources.
    fn shutdown(&self);
}

/// Constructs recognizer instances from a model directory.
///
/// Construction may block (model loading, recorder setup) and is always
/// run off the foreground context by the lifecycle.
pub trait RecognizerFactory: Send + Sync {
    /// Build a recognizer for the model at `model_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Engine`] carrying
    /// [`MICROPHONE_BUSY_MESSAGE`] when the recorder cannot be opened,
    /// or any other error when the model cannot be loaded.
    fn create(&self, model_dir: &Path, sample_rate: f32) -> Result<Box<dyn SpeechRecognizer>>;
}

#[derive(Deserialize)]
struct PartialPayload {
    #[serde(default)]
    partial: String,
}

#[derive(Deserialize)]
struct FinalPayload {
    #[serde(default)]
    alternatives: Vec<Alternative>,
}

#[derive(Deserialize)]
struct Alternative {
    #[serde(default)]
    text: String,
}

/// Extract the transcript from a partial-result payload, if any.
#[must_use]
pub fn parse_partial(payload: &str) -> Option<String> {
    match serde_json::from_str::<PartialPayload>(payload) {
        Ok(parsed) if !parsed.partial.is_empty() => Some(parsed.partial),
        Ok(_) => None,
        Err(e) => {
            tracing::debug!(error = %e, "malformed partial payload");
            None
        }
    }
}

/// Extract all non-empty transcript alternatives from a final-result
/// payload, in engine-reported order.
#[must_use]
pub fn parse_alternatives(payload: &str) -> Vec<String> {
    match serde_json::from_str::<FinalPayload>(payload) {
        Ok(parsed) => parsed
            .alternatives
            .into_iter()
            .map(|a| a.text)
            .filter(|text| !text.is_empty())
            .collect(),
        Err(e) => {
            tracing::debug!(error = %e, "malformed final payload");
            Vec::new()
        }
    }
}
