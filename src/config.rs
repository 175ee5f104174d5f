//! Configuration management for the hark front end

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::Result;

/// File name of the downloaded model archive inside the data directory
const ARCHIVE_FILENAME: &str = "model.zip";

/// Top-level configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for the model and persisted state
    pub data_dir: PathBuf,

    /// Model acquisition settings
    pub model: ModelConfig,
}

/// Model acquisition settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Sub-path whose existence marks the model as usable
    pub readiness_marker: String,

    /// Sample rate the recognizer is constructed with
    pub sample_rate: f32,

    /// How many transcript alternatives the recognizer should report
    pub max_alternatives: u32,

    /// Locales to resolve a model for, best first. Falls back across the
    /// list the same way command-pattern selection does.
    pub preferred_locales: Vec<String>,

    /// Locale tag -> model archive URL
    pub sources: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            model: ModelConfig::default(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            readiness_marker: "ivector".to_string(),
            sample_rate: 44100.0,
            max_alternatives: 5,
            preferred_locales: vec!["en-US".to_string()],
            sources: default_sources(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Directory the extracted model lives in
    #[must_use]
    pub fn model_dir(&self) -> PathBuf {
        self.data_dir.join("model")
    }

    /// Destination the model archive is downloaded to
    #[must_use]
    pub fn archive_path(&self) -> PathBuf {
        self.data_dir.join(ARCHIVE_FILENAME)
    }

    /// File backing the persisted key-value store
    #[must_use]
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("state.json")
    }
}

/// Default data directory, `~/.local/share/hark` on Linux
fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("dev", "hark", "hark")
        .map_or_else(|| PathBuf::from(".hark"), |dirs| dirs.data_dir().to_path_buf())
}

/// Small models for every supported locale
fn default_sources() -> BTreeMap<String, String> {
    [
        (
            "en",
            "https://alphacephei.com/vosk/models/vosk-model-small-en-us-0.15.zip",
        ),
        (
            "en-in",
            "https://alphacephei.com/vosk/models/vosk-model-small-en-in-0.4.zip",
        ),
        (
            "fr",
            "https://alphacephei.com/vosk/models/vosk-model-small-fr-0.22.zip",
        ),
    ]
    .into_iter()
    .map(|(tag, url)| (tag.to_string(), url.to_string()))
    .collect()
}
