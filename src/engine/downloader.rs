// Download coordinator: at most one background fetch per object, appended to its cache file.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::active::{
    ActiveDownload, ActiveDownloads, DownloadState, ProgressReceiver, ProgressSender,
};
use super::evictor::Evictor;
use super::stats::StatsCollector;
use super::store::CacheStore;
use crate::error::{CacheError, CacheResult};
use crate::source::traits::{ObjectMeta, RemoteSource};

/// What a caller of [`Downloader::ensure_downloading`] can rely on.
#[derive(Debug)]
pub enum DownloadTicket {
    /// The object is fully on disk; no fetch was started.
    Complete,
    /// A fetch is writing the object; `started` is true when this call started it.
    InFlight {
        progress: ProgressReceiver,
        started: bool,
    },
}

pub struct Downloader {
    source: Arc<dyn RemoteSource>,
    store: CacheStore,
    active: ActiveDownloads,
    evictor: Arc<Evictor>,
    stats: Arc<StatsCollector>,
    shutdown_token: CancellationToken,
}

impl Downloader {
    pub fn new(
        source: Arc<dyn RemoteSource>,
        store: CacheStore,
        active: ActiveDownloads,
        evictor: Arc<Evictor>,
        stats: Arc<StatsCollector>,
    ) -> Self {
        Self {
            source,
            store,
            active,
            evictor,
            stats,
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Cancel all in-flight fetches and refuse new ones. Partial files are removed.
    pub fn shutdown(&self) {
        self.shutdown_token.cancel();
    }

    pub fn active(&self) -> &ActiveDownloads {
        &self.active
    }

    /// Idempotent: make sure `id` is either complete on disk or being fetched.
    ///
    /// A complete object is touched and reported as such. Otherwise an eviction
    /// sweep runs, the id is registered, and a background fetch from offset 0
    /// starts. Registration and the sweep share one critical section, so a
    /// concurrent caller for the same id subscribes to this fetch and the evictor
    /// never sees the new file as idle.
    pub async fn ensure_downloading(
        &self,
        id: &str,
        meta: &ObjectMeta,
    ) -> CacheResult<DownloadTicket> {
        if self.shutdown_token.is_cancelled() {
            return Err(CacheError::RemoteUnavailable("shutting down".into()));
        }

        let (progress, sender) = {
            let mut active = self.active.lock();
            if let Some(entry) = active.get(id) {
                return Ok(DownloadTicket::InFlight {
                    progress: entry.subscribe(),
                    started: false,
                });
            }

            if let Some(stat) = self.store.stat_object(id)? {
                if stat.bytes_on_disk == meta.size {
                    self.store.touch(id)?;
                    debug!("cache hit id={} bytes={}", id, stat.bytes_on_disk);
                    return Ok(DownloadTicket::Complete);
                }
            }

            let entry = ActiveDownload::new(meta.size);
            let progress = entry.subscribe();
            let sender = entry.sender();
            active.insert(id.to_string(), entry);
            self.evictor.reclaim_locked(&active);
            (progress, sender)
        };

        let file = match self.store.open_for_write(id).await {
            Ok(file) => file,
            Err(e) => {
                warn!("cannot open cache file for {}: {}", id, e);
                Self::abandon(id, &self.store, &self.active, &sender);
                self.stats.record_download_finished(false);
                return Err(e);
            }
        };

        self.stats.record_download_started();
        info!("download started id={} size={}", id, meta.size);

        let id = id.to_string();
        let expected = meta.size;
        let source = Arc::clone(&self.source);
        let store = self.store.clone();
        let active = self.active.clone();
        let stats = Arc::clone(&self.stats);
        let shutdown_token = self.shutdown_token.clone();

        tokio::spawn(async move {
            let result = tokio::select! {
                r = Self::copy_stream(&id, expected, source, file, &sender, &stats) => r,
                _ = shutdown_token.cancelled() => {
                    Err(CacheError::RemoteUnavailable("download cancelled by shutdown".into()))
                }
            };

            match result {
                Ok(written) => {
                    active.remove(&id);
                    sender.send_modify(|p| {
                        p.written = written;
                        p.state = DownloadState::Complete;
                    });
                    stats.record_download_finished(true);
                    info!("download complete id={} bytes={}", id, written);
                }
                Err(e) => {
                    warn!("download failed id={}: {}", id, e);
                    Self::abandon(&id, &store, &active, &sender);
                    stats.record_download_finished(false);
                }
            }
        });

        Ok(DownloadTicket::InFlight {
            progress,
            started: true,
        })
    }

    /// Append the remote stream to `file`, publishing progress after every chunk
    /// is on disk. Fails if the stream carries more or fewer bytes than declared.
    async fn copy_stream(
        id: &str,
        expected: u64,
        source: Arc<dyn RemoteSource>,
        mut file: File,
        sender: &ProgressSender,
        stats: &StatsCollector,
    ) -> CacheResult<u64> {
        let mut stream = source.fetch_stream(id, 0).await?;
        let mut written = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if chunk.is_empty() {
                continue;
            }
            let len = chunk.len() as u64;
            if written + len > expected {
                return Err(CacheError::PartialDownload {
                    expected,
                    written: written + len,
                });
            }

            file.write_all(&chunk).await?;
            // Readers trust the file length, so the bytes must be written through
            // before progress is announced.
            file.flush().await?;
            written += len;
            stats.record_downloaded(len);
            sender.send_modify(|p| p.written = written);
        }

        if written != expected {
            return Err(CacheError::PartialDownload { expected, written });
        }
        Ok(written)
    }

    /// Failure cleanup: the partial file goes before the registry entry, so a
    /// fresh attempt can never have its new file deleted by this one.
    fn abandon(id: &str, store: &CacheStore, active: &ActiveDownloads, sender: &ProgressSender) {
        if let Err(e) = store.delete(id) {
            warn!("cannot remove partial file for {}: {}", id, e);
        }
        active.remove(id);
        sender.send_modify(|p| p.state = DownloadState::Failed);
    }
}
