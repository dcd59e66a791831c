// Registry of in-flight background downloads.
//
// The single source of truth both for "at most one fetch per id" and for the
// evictor's do-not-delete list. Check-and-insert, eviction decisions and
// removal all happen under the one mutex.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    Downloading,
    Complete,
    Failed,
}

/// Latest progress of one download, published after every chunk hits the disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    pub written: u64,
    pub state: DownloadState,
}

pub type ProgressSender = Arc<watch::Sender<DownloadProgress>>;
pub type ProgressReceiver = watch::Receiver<DownloadProgress>;

pub struct ActiveDownload {
    pub started_at: Instant,
    pub declared_size: u64,
    progress: ProgressSender,
}

impl ActiveDownload {
    pub fn new(declared_size: u64) -> Self {
        let (tx, _rx) = watch::channel(DownloadProgress {
            written: 0,
            state: DownloadState::Downloading,
        });
        Self {
            started_at: Instant::now(),
            declared_size,
            progress: Arc::new(tx),
        }
    }

    pub fn subscribe(&self) -> ProgressReceiver {
        self.progress.subscribe()
    }

    pub fn sender(&self) -> ProgressSender {
        Arc::clone(&self.progress)
    }
}

pub type ActiveMap = HashMap<String, ActiveDownload>;

#[derive(Clone, Default)]
pub struct ActiveDownloads {
    inner: Arc<Mutex<ActiveMap>>,
}

impl ActiveDownloads {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold the registry lock. Keep critical sections short and never await
    /// while holding the guard.
    pub fn lock(&self) -> MutexGuard<'_, ActiveMap> {
        self.inner.lock()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().contains_key(id)
    }

    pub fn subscribe(&self, id: &str) -> Option<ProgressReceiver> {
        self.inner.lock().get(id).map(ActiveDownload::subscribe)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Readers currently subscribed to the download of `id`.
    pub fn waiters(&self, id: &str) -> usize {
        self.inner
            .lock()
            .get(id)
            .map(|entry| entry.progress.receiver_count())
            .unwrap_or(0)
    }

    pub fn remove(&self, id: &str) -> Option<ActiveDownload> {
        self.inner.lock().remove(id)
    }
}
