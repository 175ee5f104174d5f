//! Model provisioning
//!
//! Guarantees a usable model directory exists before recognition starts,
//! downloading and extracting it if necessary. At most one download is
//! in flight per engine instance; the handle for it is persisted so a
//! process restart can recover or discard it.

mod extract;
mod registry;
mod store;

pub use extract::extract_archive;
pub use registry::{
    DownloadCompletion, DownloadId, DownloadRegistry, DownloadState, DownloadStatus,
    HttpDownloadRegistry,
};
pub use store::{JsonFileStore, KeyValueStore, MemoryStore};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use crate::config::Config;
use crate::locale::{self, Locale};
use crate::{Error, Result};

/// Storage key for the persisted download handle
pub const HANDLE_KEY: &str = "model.download";

/// The persisted record of the single in-flight model download
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadHandle {
    /// Registry-assigned id
    pub id: DownloadId,
    /// Supported tag the model was selected for
    pub locale: String,
}

/// Outcome of a provisioning request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// The model is already on disk
    Ready,
    /// A download was enqueued
    Started,
    /// A download is already in flight
    AlreadyDownloading,
    /// A download is needed but was not started, because the request did
    /// not come from explicit user intent
    DownloadRequired,
}

/// Events delivered to the owning lifecycle
#[derive(Debug)]
pub enum ProvisionEvent {
    /// Download and extraction finished; the model directory is usable
    ModelReady,
    /// Provisioning failed; retrying provisioning recovers
    Failed(Error),
}

/// Download-and-extract engine for the recognition model.
///
/// Engine state is the reconciliation of the durable handle record and a
/// live registry query, performed on every provisioning decision — the
/// two can never silently diverge. Only one engine instance should act
/// on a given model directory per running process.
pub struct ModelProvisioningEngine {
    registry: Arc<dyn DownloadRegistry>,
    store: Arc<dyn KeyValueStore>,
    model_dir: PathBuf,
    archive_path: PathBuf,
    readiness_marker: String,
    sources: BTreeMap<String, String>,
    requested_locales: Vec<Locale>,
    current: Mutex<Option<DownloadHandle>>,
    /// Serializes provisioning decisions, so a completion that races an
    /// enqueue always observes the persisted handle
    decision: tokio::sync::Mutex<()>,
    events: mpsc::UnboundedSender<ProvisionEvent>,
    watcher: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ModelProvisioningEngine {
    /// Create an engine and subscribe it to registry completions.
    ///
    /// The returned receiver delivers [`ProvisionEvent`]s to the owning
    /// lifecycle. Must be called within a tokio runtime.
    pub fn new(
        registry: Arc<dyn DownloadRegistry>,
        store: Arc<dyn KeyValueStore>,
        config: &Config,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ProvisionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let completions = registry.completions();
        let engine = Arc::new(Self {
            registry,
            store,
            model_dir: config.model_dir(),
            archive_path: config.archive_path(),
            readiness_marker: config.model.readiness_marker.clone(),
            sources: config.model.sources.clone(),
            requested_locales: config
                .model
                .preferred_locales
                .iter()
                .map(|tag| Locale::parse(tag))
                .collect(),
            current: Mutex::new(None),
            decision: tokio::sync::Mutex::new(()),
            events: events_tx,
            watcher: Mutex::new(None),
        });

        let watcher = tokio::spawn(Self::watch_completions(
            Arc::downgrade(&engine),
            completions,
        ));
        *engine.lock_watcher() = Some(watcher);

        (engine, events_rx)
    }

    async fn watch_completions(
        engine: std::sync::Weak<Self>,
        mut completions: broadcast::Receiver<DownloadCompletion>,
    ) {
        loop {
            match completions.recv().await {
                Ok(completion) => {
                    let Some(engine) = engine.upgrade() else { break };
                    engine.handle_completion(completion).await;
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "dropped download completions");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    fn lock_current(&self) -> MutexGuard<'_, Option<DownloadHandle>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_watcher(&self) -> MutexGuard<'_, Option<tokio::task::JoinHandle<()>>> {
        self.watcher.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Directory the extracted model lives in
    #[must_use]
    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    /// Whether a usable model is on disk.
    ///
    /// Readiness is the existence of the marker sub-path and nothing
    /// else; it never touches the network. A failed extraction that got
    /// past the marker can leave a partial model that still passes this
    /// check — deleting the model and re-provisioning recovers.
    #[must_use]
    pub fn model_ready(&self) -> bool {
        self.model_dir.join(&self.readiness_marker).exists()
    }

    /// Reconcile the durable handle record with the live registry.
    ///
    /// A persisted handle the registry does not know about (e.g. from a
    /// previous process run) is discarded; otherwise the in-memory
    /// handle is brought in line with the persisted one.
    async fn reconciled_handle(&self) -> Option<DownloadHandle> {
        let persisted = self
            .store
            .get(HANDLE_KEY)
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "cannot read persisted download handle");
                None
            })
            .and_then(|raw| serde_json::from_str::<DownloadHandle>(&raw).ok());

        let Some(handle) = persisted else {
            *self.lock_current() = None;
            return None;
        };

        match self.registry.query(handle.id).await {
            Ok(Some(_)) => {
                *self.lock_current() = Some(handle.clone());
                Some(handle)
            }
            Ok(None) => {
                tracing::debug!(id = %handle.id, "stale download handle discarded");
                if let Err(e) = self.store.remove(HANDLE_KEY) {
                    tracing::warn!(error = %e, "cannot clear stale download handle");
                }
                *self.lock_current() = None;
                None
            }
            Err(e) => {
                // cannot tell; treat the download as still in flight
                tracing::warn!(id = %handle.id, error = %e, "registry query failed");
                *self.lock_current() = Some(handle.clone());
                Some(handle)
            }
        }
    }

    /// Make the model available, downloading it if the caller has
    /// explicit user intent to do so.
    ///
    /// With `manual == false` a missing model is reported as
    /// [`ProvisionOutcome::DownloadRequired`] and no download starts:
    /// downloads are never triggered without explicit intent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedLocale`] when no preferred locale
    /// maps to a model source, or an error when the download cannot be
    /// enqueued or the handle cannot be persisted.
    pub async fn request_provisioning(&self, manual: bool) -> Result<ProvisionOutcome> {
        let _decision = self.decision.lock().await;

        if self.model_ready() {
            let _ = self.events.send(ProvisionEvent::ModelReady);
            return Ok(ProvisionOutcome::Ready);
        }

        if let Some(handle) = self.reconciled_handle().await {
            tracing::debug!(id = %handle.id, "model already being downloaded");
            return Ok(ProvisionOutcome::AlreadyDownloading);
        }

        if !manual {
            tracing::debug!("model missing, waiting for explicit download intent");
            return Ok(ProvisionOutcome::DownloadRequired);
        }

        let tags: Vec<&str> = self.sources.keys().map(String::as_str).collect();
        let resolution = locale::resolve_supported_locale(&self.requested_locales, &tags)?;
        let url = self
            .sources
            .get(&resolution.supported_tag)
            .cloned()
            .ok_or_else(|| {
                Error::Config(format!("no source for locale {}", resolution.supported_tag))
            })?;

        let id = self.registry.enqueue(&url, &self.archive_path).await?;
        let handle = DownloadHandle {
            id,
            locale: resolution.supported_tag,
        };
        self.store.put(HANDLE_KEY, &serde_json::to_string(&handle)?)?;
        *self.lock_current() = Some(handle.clone());

        tracing::info!(id = %id, locale = %handle.locale, "model download started");
        Ok(ProvisionOutcome::Started)
    }

    /// React to a registry completion notification.
    async fn handle_completion(&self, completion: DownloadCompletion) {
        let _decision = self.decision.lock().await;

        let Some(handle) = self.reconciled_handle().await else {
            tracing::debug!(id = %completion.id, "completion with no tracked download ignored");
            return;
        };

        // stale or foreign ids are ignored; the subscription stays active
        if completion.id != handle.id {
            tracing::debug!(id = %completion.id, tracked = %handle.id, "foreign download id ignored");
            return;
        }

        let status = match self.registry.query(handle.id).await {
            Ok(status) => status,
            Err(e) => {
                self.fail(&handle, Error::Transport(format!("registry query failed: {e}")))
                    .await;
                return;
            }
        };

        // a finished download without a resolvable content type is a
        // transport failure, not an extraction failure
        if status.and_then(|s| s.content_type).is_none() {
            self.fail(
                &handle,
                Error::Transport("download finished without a content type".to_string()),
            )
            .await;
            return;
        }

        tracing::info!(id = %handle.id, "model downloaded, extracting");
        let archive_path = self.archive_path.clone();
        let model_dir = self.model_dir.clone();
        let extraction =
            tokio::task::spawn_blocking(move || extract::extract_archive(&archive_path, &model_dir))
                .await
                .unwrap_or_else(|e| Err(Error::Extraction(format!("extraction task failed: {e}"))));

        match extraction {
            Ok(()) => {
                self.clear_handle(&handle).await;
                tracing::info!(locale = %handle.locale, "model ready");
                let _ = self.events.send(ProvisionEvent::ModelReady);
            }
            Err(e) => {
                tracing::warn!(error = %e, "model extraction failed");
                self.fail(&handle, e).await;
            }
        }
    }

    /// Drop the download record everywhere: registry, store, memory.
    async fn clear_handle(&self, handle: &DownloadHandle) {
        if let Err(e) = self.registry.remove(handle.id).await {
            tracing::debug!(id = %handle.id, error = %e, "cannot remove download record");
        }
        if let Err(e) = self.store.remove(HANDLE_KEY) {
            tracing::warn!(error = %e, "cannot clear persisted download handle");
        }
        *self.lock_current() = None;
    }

    async fn fail(&self, handle: &DownloadHandle, error: Error) {
        self.clear_handle(handle).await;
        let _ = self.events.send(ProvisionEvent::Failed(error));
    }

    /// Cancel any in-flight download, clear the persisted handle and
    /// unsubscribe the completion watcher. Idempotent.
    pub async fn cleanup(&self) {
        if let Some(watcher) = self.lock_watcher().take() {
            watcher.abort();
        }

        let _decision = self.decision.lock().await;
        let handle = self.lock_current().clone().or_else(|| {
            self.store
                .get(HANDLE_KEY)
                .ok()
                .flatten()
                .and_then(|raw| serde_json::from_str(&raw).ok())
        });
        if let Some(handle) = handle {
            self.clear_handle(&handle).await;
        }
    }
}

/// Delete the model: cancel any persisted download and remove the model
/// directory recursively. Works without an active engine instance.
///
/// # Errors
///
/// Returns an error if the persisted handle cannot be read or the model
/// directory cannot be removed.
pub async fn delete_model(
    registry: &dyn DownloadRegistry,
    store: &dyn KeyValueStore,
    model_dir: &Path,
) -> Result<()> {
    if let Some(raw) = store.get(HANDLE_KEY)? {
        if let Ok(handle) = serde_json::from_str::<DownloadHandle>(&raw) {
            if let Err(e) = registry.remove(handle.id).await {
                tracing::debug!(id = %handle.id, error = %e, "cannot remove download record");
            }
        }
        store.remove(HANDLE_KEY)?;
    }

    match std::fs::remove_dir_all(model_dir) {
        Ok(()) => {
            tracing::info!(path = %model_dir.display(), "model deleted");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Io(e)),
    }
}
