// Progressive stream server: serves byte windows of an object while it is still downloading.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::active::{ActiveDownloads, DownloadState};
use super::downloader::{DownloadTicket, Downloader};
use super::evictor::Evictor;
use super::stats::{StatsCollector, StatsSnapshot};
use super::store::{validate_id, CacheStore};
use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::source::traits::{ObjectMeta, RemoteSource};

/// Pieces buffered between the file reader and the HTTP body.
const CHANNEL_DEPTH: usize = 4;

/// Reopen attempts when the cache file is replaced underneath a reader.
const MAX_REOPEN_ATTEMPTS: u32 = 3;

/// Remote metadata entries kept before unreferenced ones are dropped.
const METADATA_MEMO_CAPACITY: usize = 1024;

/// A requested byte range, as carried by an HTTP `Range` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// `bytes=start-end` or `bytes=start-`; `end_inclusive` is clipped to the object.
    StartEnd {
        start: u64,
        end_inclusive: Option<u64>,
    },
    /// `bytes=-len`: the last `len` bytes.
    Suffix { len: u64 },
}

impl ByteRange {
    /// Clip to `[0, size-1]`, returning inclusive `(start, end)`.
    pub fn resolve(self, size: u64) -> CacheResult<(u64, u64)> {
        let unsatisfiable = CacheError::RangeNotSatisfiable { size };
        if size == 0 {
            return Err(unsatisfiable);
        }
        match self {
            ByteRange::StartEnd {
                start,
                end_inclusive,
            } => {
                if start >= size {
                    return Err(unsatisfiable);
                }
                let end = end_inclusive.unwrap_or(size - 1).min(size - 1);
                if end < start {
                    return Err(unsatisfiable);
                }
                Ok((start, end))
            }
            ByteRange::Suffix { len } => {
                if len == 0 {
                    return Err(unsatisfiable);
                }
                Ok((size.saturating_sub(len), size - 1))
            }
        }
    }
}

/// An accepted read: headers are known, bytes arrive on `body`.
#[derive(Debug)]
pub struct StreamResponse {
    pub meta: ObjectMeta,
    pub start: u64,
    /// Number of bytes `body` will yield.
    pub len: u64,
    /// True when answering a range request.
    pub partial: bool,
    pub body: mpsc::Receiver<CacheResult<Bytes>>,
}

impl StreamResponse {
    /// `Content-Range` value, e.g. `bytes 0-1023/4096`.
    pub fn content_range(&self) -> String {
        format!(
            "bytes {}-{}/{}",
            self.start,
            self.start + self.len.saturating_sub(1),
            self.meta.size
        )
    }
}

/// Remote metadata by id, so repeated reads skip the remote lookup.
///
/// Bounded: when full, entries whose object is neither on disk nor downloading
/// are dropped, and if that frees nothing the memo starts over.
struct MetadataMemo {
    entries: HashMap<String, ObjectMeta>,
    capacity: usize,
}

impl MetadataMemo {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity,
        }
    }

    fn get(&self, id: &str) -> Option<ObjectMeta> {
        self.entries.get(id).cloned()
    }

    fn insert(&mut self, id: String, meta: ObjectMeta, keep: impl Fn(&str) -> bool) {
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&id) {
            self.entries.retain(|id, _| keep(id.as_str()));
            if self.entries.len() >= self.capacity {
                self.entries.clear();
            }
        }
        self.entries.insert(id, meta);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// How long the cache file has gone without growing, for one fetch attempt.
struct StallClock {
    last_seen: u64,
    last_growth: Instant,
}

impl StallClock {
    fn new() -> Self {
        Self {
            last_seen: 0,
            last_growth: Instant::now(),
        }
    }

    /// Record the current length and return the time since it last grew.
    fn observe(&mut self, on_disk: u64) -> Duration {
        if on_disk > self.last_seen {
            self.last_seen = on_disk;
            self.last_growth = Instant::now();
        }
        self.last_growth.elapsed()
    }
}

pub struct Streamer {
    config: CacheConfig,
    store: CacheStore,
    source: Arc<dyn RemoteSource>,
    downloader: Arc<Downloader>,
    evictor: Arc<Evictor>,
    stats: Arc<StatsCollector>,
    metadata: RwLock<MetadataMemo>,
}

impl Streamer {
    /// Wire the cache store, registry, evictor and coordinator for `config`.
    pub fn new(config: CacheConfig, source: Arc<dyn RemoteSource>) -> CacheResult<Self> {
        config.validate()?;
        let store = CacheStore::new(&config.cache_dir)?;
        let active = ActiveDownloads::new();
        let stats = Arc::new(StatsCollector::new());
        let evictor = Arc::new(Evictor::new(
            store.clone(),
            active.clone(),
            config.budget_bytes,
            stats.clone(),
        ));
        let downloader = Arc::new(Downloader::new(
            source.clone(),
            store.clone(),
            active,
            evictor.clone(),
            stats.clone(),
        ));

        Ok(Self {
            config,
            store,
            source,
            downloader,
            evictor,
            stats,
            metadata: RwLock::new(MetadataMemo::new(METADATA_MEMO_CAPACITY)),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn downloader(&self) -> &Arc<Downloader> {
        &self.downloader
    }

    pub fn evictor(&self) -> &Arc<Evictor> {
        &self.evictor
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot(self.downloader.active().len())
    }

    /// Size and type of `id`, asking the remote store only the first time.
    pub async fn metadata(&self, id: &str) -> CacheResult<ObjectMeta> {
        validate_id(id)?;
        let cached = self.metadata.read().get(id);
        if let Some(meta) = cached {
            return Ok(meta);
        }
        let meta = self.source.fetch_metadata(id).await?;
        debug!("metadata id={} size={} type={}", id, meta.size, meta.content_type);
        let active = self.downloader.active();
        self.metadata.write().insert(id.to_string(), meta.clone(), |id| {
            active.contains(id) || matches!(self.store.stat_object(id), Ok(Some(_)))
        });
        Ok(meta)
    }

    /// Start serving `id`, optionally restricted to `range`.
    ///
    /// Returns once the readiness threshold is on disk: the start buffer
    /// (`min(size * min_buffer_fraction, max_start_wait_bytes)`) or the first
    /// requested byte, whichever is further. The body then follows the download
    /// and never reads past the bytes confirmed on disk.
    pub async fn open(
        self: &Arc<Self>,
        id: &str,
        range: Option<ByteRange>,
    ) -> CacheResult<StreamResponse> {
        let t0 = Instant::now();
        let meta = self.metadata(id).await?;
        let size = meta.size;

        let (start, end, partial) = match range {
            Some(range) => {
                let (start, end) = range.resolve(size)?;
                (start, end, true)
            }
            None if size == 0 => {
                let (_tx, body) = mpsc::channel(1);
                return Ok(StreamResponse {
                    meta,
                    start: 0,
                    len: 0,
                    partial: false,
                    body,
                });
            }
            None => (0, size - 1, false),
        };

        let threshold = self.config.start_buffer_bytes(size).max(start + 1).min(size);
        let cache_hit = self.wait_for_bytes(id, &meta, threshold).await?;
        self.stats.record_request(cache_hit);

        debug!(
            "stream ready id={} range=[{}, {}] threshold={} hit={} waited_ms={}",
            id,
            start,
            end,
            threshold,
            cache_hit,
            t0.elapsed().as_millis()
        );

        let (tx, body) = mpsc::channel(CHANNEL_DEPTH);
        let streamer = Arc::clone(self);
        let pump_id = id.to_string();
        let pump_meta = meta.clone();
        tokio::spawn(async move {
            streamer.pump(pump_id, pump_meta, start, end, tx).await;
        });

        Ok(StreamResponse {
            meta,
            start,
            len: end - start + 1,
            partial,
            body,
        })
    }

    /// Wait until at least `needed` bytes of `id` are on disk.
    ///
    /// Wakes on every progress notification from the fetch, with a poll tick as
    /// fallback. Fails with `Timeout` when the file stops growing for
    /// `readiness_timeout`, and with `RemoteUnavailable` when the fetch fails. If
    /// the object is neither active nor big enough (evicted, or a previous fetch
    /// ended) a new fetch is requested. Returns whether the object was already
    /// complete on the first check.
    pub async fn wait_for_bytes(
        &self,
        id: &str,
        meta: &ObjectMeta,
        needed: u64,
    ) -> CacheResult<bool> {
        let timeout = self.config.readiness_timeout;
        let poll = self.config.readiness_poll_interval;
        let mut first_check = true;

        loop {
            let ticket = self.downloader.ensure_downloading(id, meta).await?;
            let mut progress = match ticket {
                DownloadTicket::Complete => return Ok(first_check),
                DownloadTicket::InFlight { progress, .. } => progress,
            };
            first_check = false;
            // A new ticket may be a fetch restarted from zero.
            let mut stall = StallClock::new();

            loop {
                let on_disk = self.store.bytes_on_disk(id)?;
                if on_disk >= needed {
                    return Ok(false);
                }

                let state = progress.borrow_and_update().state;
                match state {
                    DownloadState::Downloading => {}
                    // Ended since we subscribed; re-check through the coordinator.
                    DownloadState::Complete => break,
                    DownloadState::Failed => {
                        return Err(CacheError::RemoteUnavailable(format!(
                            "download of {} failed",
                            id
                        )));
                    }
                }

                let waited = stall.observe(on_disk);
                if waited >= timeout {
                    warn!(
                        "readiness wait stalled id={} on_disk={} needed={}",
                        id, on_disk, needed
                    );
                    return Err(CacheError::Timeout {
                        id: id.to_string(),
                        waited,
                    });
                }

                let tick = poll.min(timeout - waited);
                tokio::select! {
                    changed = progress.changed() => {
                        let state = progress.borrow().state;
                        if changed.is_err() && state == DownloadState::Downloading {
                            // Fetch task went away without a final state.
                            break;
                        }
                    }
                    _ = tokio::time::sleep(tick) => {}
                }
            }
        }
    }

    /// Copy `[start, end]` of the cache file into `tx`, waiting for the download
    /// whenever the window runs past the bytes on disk. A dropped receiver is a
    /// client disconnect and ends the copy quietly.
    async fn pump(
        &self,
        id: String,
        meta: ObjectMeta,
        start: u64,
        end: u64,
        tx: mpsc::Sender<CacheResult<Bytes>>,
    ) {
        let chunk = self.config.read_chunk_bytes as u64;
        let mut pos = start;
        let mut file: Option<File> = None;
        let mut reopen_attempts = 0u32;
        let mut sent = 0u64;

        while pos <= end {
            let mut available = match self.store.bytes_on_disk(&id) {
                Ok(n) => n,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };
            if available <= pos {
                let ready = tokio::select! {
                    r = self.wait_for_bytes(&id, &meta, pos + 1) => r,
                    _ = tx.closed() => {
                        debug!("client disconnected id={} waiting at offset {}", id, pos);
                        return;
                    }
                };
                if let Err(e) = ready {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
                // Whatever a complete ticket promised, re-read the length.
                available = match self.store.bytes_on_disk(&id) {
                    Ok(n) => n,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                };
                if available <= pos {
                    continue;
                }
            }

            if file.is_none() {
                match self.store.open_for_read(&id, pos).await {
                    Ok(f) => file = Some(f),
                    Err(CacheError::Io(e))
                        if e.kind() == io::ErrorKind::NotFound
                            && reopen_attempts < MAX_REOPEN_ATTEMPTS =>
                    {
                        reopen_attempts += 1;
                        continue;
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                }
            }
            let Some(reader) = file.as_mut() else {
                continue;
            };

            let to_read = (available.min(end + 1) - pos).min(chunk) as usize;
            let mut buf = vec![0u8; to_read];
            match reader.read_exact(&mut buf).await {
                Ok(_) => {}
                // The file was replaced by a fresh fetch after we opened it.
                Err(e)
                    if e.kind() == io::ErrorKind::UnexpectedEof
                        && reopen_attempts < MAX_REOPEN_ATTEMPTS =>
                {
                    reopen_attempts += 1;
                    file = None;
                    continue;
                }
                Err(e) => {
                    let _ = tx.send(Err(e.into())).await;
                    return;
                }
            }

            pos += to_read as u64;
            sent += to_read as u64;
            self.stats.record_served(to_read as u64);
            if tx.send(Ok(Bytes::from(buf))).await.is_err() {
                debug!("client disconnected id={} at offset {}", id, pos);
                return;
            }
        }

        if let Err(e) = self.store.touch(&id) {
            debug!("touch after serve failed id={}: {}", id, e);
        }
        debug!("served id={} range=[{}, {}] bytes={}", id, start, end, sent);
    }

    /// Stop background fetches.
    pub fn shutdown(&self) {
        self.downloader.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_start_end() {
        let r = ByteRange::StartEnd {
            start: 10,
            end_inclusive: Some(19),
        };
        assert_eq!(r.resolve(100).unwrap(), (10, 19));
    }

    #[test]
    fn test_resolve_clips_end() {
        let r = ByteRange::StartEnd {
            start: 90,
            end_inclusive: Some(1000),
        };
        assert_eq!(r.resolve(100).unwrap(), (90, 99));

        let open = ByteRange::StartEnd {
            start: 5,
            end_inclusive: None,
        };
        assert_eq!(open.resolve(100).unwrap(), (5, 99));
    }

    #[test]
    fn test_resolve_suffix() {
        assert_eq!(ByteRange::Suffix { len: 10 }.resolve(100).unwrap(), (90, 99));
        assert_eq!(ByteRange::Suffix { len: 500 }.resolve(100).unwrap(), (0, 99));
    }

    fn meta(size: u64) -> ObjectMeta {
        ObjectMeta {
            size,
            content_type: "video/mp4".into(),
        }
    }

    #[test]
    fn test_metadata_memo_drops_unreferenced_when_full() {
        let mut memo = MetadataMemo::new(2);
        memo.insert("a".into(), meta(1), |_| true);
        memo.insert("b".into(), meta(2), |_| true);
        memo.insert("c".into(), meta(3), |id| id == "b");

        assert_eq!(memo.len(), 2);
        assert!(memo.get("a").is_none());
        assert_eq!(memo.get("b"), Some(meta(2)));
        assert_eq!(memo.get("c"), Some(meta(3)));

        // Nothing to drop: start over rather than grow.
        memo.insert("d".into(), meta(4), |_| true);
        assert_eq!(memo.len(), 1);
        assert_eq!(memo.get("d"), Some(meta(4)));

        // Refreshing a known id never prunes.
        memo.insert("d".into(), meta(5), |_| false);
        assert_eq!(memo.get("d"), Some(meta(5)));
    }

    #[test]
    fn test_stall_clock_counts_growth_from_zero() {
        let mut clock = StallClock::new();
        std::thread::sleep(Duration::from_millis(20));
        assert!(clock.observe(0) >= Duration::from_millis(20));
        assert!(clock.observe(10) < Duration::from_millis(20));
        std::thread::sleep(Duration::from_millis(20));
        assert!(clock.observe(5) >= Duration::from_millis(20));
    }

    #[test]
    fn test_resolve_unsatisfiable() {
        let past_end = ByteRange::StartEnd {
            start: 100,
            end_inclusive: None,
        };
        assert!(matches!(
            past_end.resolve(100),
            Err(CacheError::RangeNotSatisfiable { size: 100 })
        ));

        let inverted = ByteRange::StartEnd {
            start: 50,
            end_inclusive: Some(10),
        };
        assert!(inverted.resolve(100).is_err());
        assert!(ByteRange::Suffix { len: 0 }.resolve(100).is_err());
        assert!(ByteRange::Suffix { len: 1 }.resolve(0).is_err());
    }
}
