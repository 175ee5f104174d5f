//! Shared test utilities

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use hark_frontend::provision::{
    DownloadCompletion, DownloadId, DownloadRegistry, DownloadState, DownloadStatus,
};
use hark_frontend::{Error, InputListener, Result, SpeechState, SpeechStateObserver};

/// What a listener observed, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observed {
    Trying,
    Partial(String),
    Input(Vec<String>),
    NoInput,
    Error(String),
}

/// Test listener that records every notification
#[derive(Clone, Default)]
pub struct RecordingListener {
    observed: Arc<Mutex<Vec<Observed>>>,
}

impl RecordingListener {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn observed(&self) -> Vec<Observed> {
        self.observed.lock().unwrap().clone()
    }

    pub fn count(&self, matcher: impl Fn(&Observed) -> bool) -> usize {
        self.observed.lock().unwrap().iter().filter(|o| matcher(o)).count()
    }
}

impl InputListener for RecordingListener {
    fn on_trying_to_get_input(&mut self) {
        self.observed.lock().unwrap().push(Observed::Trying);
    }

    fn on_partial_input(&mut self, input: &str) {
        self.observed
            .lock()
            .unwrap()
            .push(Observed::Partial(input.to_string()));
    }

    fn on_input_received(&mut self, input: Vec<String>) {
        self.observed.lock().unwrap().push(Observed::Input(input));
    }

    fn on_no_input_received(&mut self) {
        self.observed.lock().unwrap().push(Observed::NoInput);
    }

    fn on_error(&mut self, error: &Error) {
        self.observed
            .lock()
            .unwrap()
            .push(Observed::Error(error.to_string()));
    }
}

/// Test observer that records every presentation state it is shown
#[derive(Clone, Default)]
pub struct RecordingObserver {
    states: Arc<Mutex<Vec<SpeechState>>>,
}

impl RecordingObserver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn states(&self) -> Vec<SpeechState> {
        self.states.lock().unwrap().clone()
    }
}

impl SpeechStateObserver for RecordingObserver {
    fn on_state_changed(&mut self, state: SpeechState) {
        self.states.lock().unwrap().push(state);
    }
}

/// Registry that serves a canned payload: an enqueue writes the payload
/// to the destination, marks the download complete and broadcasts its
/// completion, like a system download service fulfilling the transfer.
pub struct CannedRegistry {
    next_id: AtomicU64,
    enqueued: Mutex<Vec<String>>,
    statuses: Mutex<HashMap<DownloadId, DownloadStatus>>,
    completions: broadcast::Sender<DownloadCompletion>,
    payload: Vec<u8>,
    content_type: Option<String>,
}

impl CannedRegistry {
    #[must_use]
    pub fn new(payload: Vec<u8>, content_type: Option<&str>) -> Self {
        let (completions, _) = broadcast::channel(16);
        Self {
            next_id: AtomicU64::new(1),
            enqueued: Mutex::new(Vec::new()),
            statuses: Mutex::new(HashMap::new()),
            completions,
            payload,
            content_type: content_type.map(ToString::to_string),
        }
    }

    #[must_use]
    pub fn enqueue_count(&self) -> usize {
        self.enqueued.lock().unwrap().len()
    }
}

#[async_trait]
impl DownloadRegistry for CannedRegistry {
    async fn enqueue(&self, url: &str, destination: &Path) -> Result<DownloadId> {
        let id = DownloadId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.enqueued.lock().unwrap().push(url.to_string());

        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(destination, &self.payload)?;

        self.statuses.lock().unwrap().insert(
            id,
            DownloadStatus {
                state: DownloadState::Completed,
                content_type: self.content_type.clone(),
            },
        );

        let completions = self.completions.clone();
        tokio::spawn(async move {
            let _ = completions.send(DownloadCompletion { id });
        });

        Ok(id)
    }

    async fn query(&self, id: DownloadId) -> Result<Option<DownloadStatus>> {
        Ok(self.statuses.lock().unwrap().get(&id).cloned())
    }

    async fn remove(&self, id: DownloadId) -> Result<()> {
        self.statuses.lock().unwrap().remove(&id);
        Ok(())
    }

    fn completions(&self) -> broadcast::Receiver<DownloadCompletion> {
        self.completions.subscribe()
    }
}

/// Zip archive bytes shaped like a real model: one top-level directory
/// with the marker and config underneath
#[must_use]
pub fn model_archive() -> Vec<u8> {
    let mut writer = zip_writer();
    let options = zip::write::SimpleFileOptions::default();

    writer.add_directory("test-model-0.1/", options).unwrap();
    writer.add_directory("test-model-0.1/ivector/", options).unwrap();
    writer
        .start_file("test-model-0.1/ivector/final.dubm", options)
        .unwrap();
    writer.write_all(b"weights").unwrap();
    writer
        .start_file("test-model-0.1/conf/model.conf", options)
        .unwrap();
    writer.write_all(b"beam=10").unwrap();

    writer.finish().unwrap().into_inner()
}

fn zip_writer() -> zip::ZipWriter<std::io::Cursor<Vec<u8>>> {
    zip::ZipWriter::new(std::io::Cursor::new(Vec::new()))
}

/// Poll `condition` until it holds or a generous timeout elapses
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}
