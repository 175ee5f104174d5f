//! Hark - spoken-input acquisition and matching engine
//!
//! The front half of a voice assistant: turning raw acoustic or typed
//! input into transcript candidates ready for command matching.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │              Presentation surface                 │
//! │   mic button │ text entry │ state notifications  │
//! └───────────────────────┬──────────────────────────┘
//!                         │
//! ┌───────────────────────▼──────────────────────────┐
//! │               Input acquisition                   │
//! │   VoiceInputSource │ TextInputSource │ listener   │
//! └───────────────────────┬──────────────────────────┘
//!                         │
//! ┌───────────────────────▼──────────────────────────┐
//! │     Model provisioning │ recognition engine       │
//! │   download │ extract │ persist │ start/stop       │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! Recognized text is matched against command patterns with the
//! [`matching`] primitives; [`locale`] picks both the model to download
//! and the pattern set to match against.

pub mod config;
pub mod error;
pub mod input;
pub mod locale;
pub mod matching;
pub mod provision;
pub mod recognizer;

pub use config::{Config, ModelConfig};
pub use error::{Error, Result};
pub use input::speech::{SpeechState, SpeechStateObserver};
pub use input::text::TextInputSource;
pub use input::voice::VoiceInputSource;
pub use input::{InputListener, InputSource};
pub use locale::{Locale, LocaleResolutionResult, resolve_supported_locale};
pub use provision::{
    DownloadHandle, DownloadId, DownloadRegistry, HttpDownloadRegistry, JsonFileStore,
    KeyValueStore, MemoryStore, ModelProvisioningEngine, ProvisionEvent, ProvisionOutcome,
    delete_model,
};
pub use recognizer::{RecognitionEvent, RecognizerFactory, SpeechRecognizer};
