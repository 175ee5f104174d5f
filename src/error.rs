//! Error types for the hark front end

use thiserror::Error;

/// Result type alias for hark operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while acquiring or matching input
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// No requested locale (or any of its fallbacks) matches a supported tag
    #[error("unsupported locale: {0}")]
    UnsupportedLocale(String),

    /// Recognizer construction failed because the microphone is busy or missing
    #[error("microphone unavailable: {0}")]
    MicrophoneUnavailable(String),

    /// Download never produced a resolvable content type, or the transfer failed
    #[error("transport failure: {0}")]
    Transport(String),

    /// Model archive extraction failed
    #[error("extraction failed: {0}")]
    Extraction(String),

    /// An archive entry would land outside the model directory
    #[error("archive entry escapes the model directory: {0}")]
    PathTraversal(String),

    /// Opaque failure surfaced by the recognition engine
    #[error("recognition engine error: {0}")]
    Engine(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Archive error
    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
}
