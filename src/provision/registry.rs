//! Download registry seam and HTTP implementation
//!
//! The registry models a system download service: enqueue a transfer,
//! query its status, remove it, and hear about completion through a
//! broadcast notification carrying the download id. Completion fires for
//! failed transfers too; consumers distinguish the two by querying the
//! status and its content type.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;

use crate::{Error, Result};

/// Opaque identifier a registry assigns to an enqueued download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DownloadId(pub u64);

impl fmt::Display for DownloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Broadcast when a download finishes, successfully or not
#[derive(Debug, Clone)]
pub struct DownloadCompletion {
    /// Id of the finished download
    pub id: DownloadId,
}

/// Coarse transfer state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    /// Transfer still in flight
    Running,
    /// Transfer finished and the destination file is complete
    Completed,
    /// Transfer failed; the destination file may be partial
    Failed,
}

/// Status reported for a tracked download
#[derive(Debug, Clone)]
pub struct DownloadStatus {
    /// Transfer state
    pub state: DownloadState,
    /// Content type reported by the remote, once known. Absence on a
    /// finished download indicates a transport-level failure.
    pub content_type: Option<String>,
}

/// System download registry seam
#[async_trait]
pub trait DownloadRegistry: Send + Sync {
    /// Start a transfer of `url` to `destination` and return its id
    ///
    /// # Errors
    ///
    /// Returns an error if the transfer cannot be enqueued.
    async fn enqueue(&self, url: &str, destination: &Path) -> Result<DownloadId>;

    /// Status of a tracked download, or `None` for an unknown id
    /// (e.g. one persisted by a previous process run)
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be queried.
    async fn query(&self, id: DownloadId) -> Result<Option<DownloadStatus>>;

    /// Cancel and forget a download, removing its destination file.
    /// Removing an unknown id is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the destination file cannot be removed.
    async fn remove(&self, id: DownloadId) -> Result<()>;

    /// Subscribe to completion notifications
    fn completions(&self) -> broadcast::Receiver<DownloadCompletion>;
}

struct Entry {
    status: DownloadStatus,
    destination: PathBuf,
    task: Option<tokio::task::AbortHandle>,
}

struct RegistryInner {
    client: reqwest::Client,
    next_id: AtomicU64,
    entries: Mutex<HashMap<DownloadId, Entry>>,
    completions: broadcast::Sender<DownloadCompletion>,
}

impl RegistryInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<DownloadId, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn transfer(&self, url: &str, destination: &Path) -> Result<Option<String>> {
        let response = self.client.get(url).send().await?.error_for_status()?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(ToString::to_string);

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(destination).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;

        Ok(content_type)
    }
}

/// In-process download registry transferring over HTTP.
///
/// Registry state is in-memory only: after a process restart every
/// previously issued id is unknown, which is exactly what persisted
/// handles are reconciled against.
pub struct HttpDownloadRegistry {
    inner: Arc<RegistryInner>,
}

impl HttpDownloadRegistry {
    /// Create a registry with a default HTTP client
    #[must_use]
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    /// Create a registry using the given HTTP client
    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        let (completions, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(RegistryInner {
                client,
                next_id: AtomicU64::new(1),
                entries: Mutex::new(HashMap::new()),
                completions,
            }),
        }
    }
}

impl Default for HttpDownloadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DownloadRegistry for HttpDownloadRegistry {
    async fn enqueue(&self, url: &str, destination: &Path) -> Result<DownloadId> {
        let id = DownloadId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        self.inner.lock().insert(
            id,
            Entry {
                status: DownloadStatus {
                    state: DownloadState::Running,
                    content_type: None,
                },
                destination: destination.to_path_buf(),
                task: None,
            },
        );

        tracing::info!(id = %id, url, destination = %destination.display(), "download enqueued");

        let inner = Arc::clone(&self.inner);
        let url = url.to_string();
        let destination = destination.to_path_buf();
        let handle = tokio::spawn(async move {
            let outcome = inner.transfer(&url, &destination).await;

            let known = {
                let mut entries = inner.lock();
                entries.get_mut(&id).map(|entry| {
                    entry.status = match outcome {
                        Ok(content_type) => DownloadStatus {
                            state: DownloadState::Completed,
                            content_type,
                        },
                        Err(ref e) => {
                            tracing::warn!(id = %id, error = %e, "download failed");
                            DownloadStatus {
                                state: DownloadState::Failed,
                                content_type: None,
                            }
                        }
                    };
                    entry.status.state
                })
            };

            // cancelled downloads (entry removed) do not signal completion
            if let Some(state) = known {
                tracing::debug!(id = %id, ?state, "download finished");
                let _ = inner.completions.send(DownloadCompletion { id });
            }
        });

        if let Some(entry) = self.inner.lock().get_mut(&id) {
            entry.task = Some(handle.abort_handle());
        }

        Ok(id)
    }

    async fn query(&self, id: DownloadId) -> Result<Option<DownloadStatus>> {
        Ok(self.inner.lock().get(&id).map(|entry| entry.status.clone()))
    }

    async fn remove(&self, id: DownloadId) -> Result<()> {
        let removed = self.inner.lock().remove(&id);
        let Some(entry) = removed else {
            return Ok(());
        };

        if let Some(task) = entry.task {
            task.abort();
        }

        match tokio::fs::remove_file(&entry.destination).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::Io(e)),
        }

        tracing::debug!(id = %id, "download removed");
        Ok(())
    }

    fn completions(&self) -> broadcast::Receiver<DownloadCompletion> {
        self.inner.completions.subscribe()
    }
}
