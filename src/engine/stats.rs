// Live statistics: fetch/serve throughput, cache hit counts, download and eviction tallies.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

struct StatsSample {
    at: Instant,
    download_bytes: u64,
    serve_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub download_bps: u64,
    pub serve_bps: u64,
    pub downloaded_bytes: u64,
    pub served_bytes: u64,
    pub active_downloads: usize,
    pub downloads_started: u64,
    pub downloads_completed: u64,
    pub downloads_failed: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub evicted_objects: u64,
    pub evicted_bytes: u64,
}

pub struct StatsCollector {
    downloaded: AtomicU64,
    served: AtomicU64,
    downloads_started: AtomicU64,
    downloads_completed: AtomicU64,
    downloads_failed: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    evicted_objects: AtomicU64,
    evicted_bytes: AtomicU64,
    last_sample: Mutex<StatsSample>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            downloaded: AtomicU64::new(0),
            served: AtomicU64::new(0),
            downloads_started: AtomicU64::new(0),
            downloads_completed: AtomicU64::new(0),
            downloads_failed: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            evicted_objects: AtomicU64::new(0),
            evicted_bytes: AtomicU64::new(0),
            last_sample: Mutex::new(StatsSample {
                at: Instant::now(),
                download_bytes: 0,
                serve_bytes: 0,
            }),
        }
    }

    pub fn record_downloaded(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_served(&self, bytes: u64) {
        self.served.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_download_started(&self) {
        self.downloads_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_download_finished(&self, ok: bool) {
        if ok {
            self.downloads_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.downloads_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record whether a read request found its object complete on disk.
    pub fn record_request(&self, cache_hit: bool) {
        if cache_hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_evicted(&self, bytes: u64) {
        self.evicted_objects.fetch_add(1, Ordering::Relaxed);
        self.evicted_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self, active_downloads: usize) -> StatsSnapshot {
        let now = Instant::now();
        let current_download = self.downloaded.load(Ordering::Relaxed);
        let current_serve = self.served.load(Ordering::Relaxed);

        // Throughput is measured over the interval since the previous snapshot.
        let (download_bps, serve_bps) = {
            let mut last = self.last_sample.lock();
            let secs = now.duration_since(last.at).as_secs_f64();
            let rates = if secs > 0.1 {
                (
                    per_second(current_download - last.download_bytes, secs),
                    per_second(current_serve - last.serve_bytes, secs),
                )
            } else {
                (0, 0)
            };
            *last = StatsSample {
                at: now,
                download_bytes: current_download,
                serve_bytes: current_serve,
            };
            rates
        };

        StatsSnapshot {
            download_bps,
            serve_bps,
            downloaded_bytes: current_download,
            served_bytes: current_serve,
            active_downloads,
            downloads_started: self.downloads_started.load(Ordering::Relaxed),
            downloads_completed: self.downloads_completed.load(Ordering::Relaxed),
            downloads_failed: self.downloads_failed.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            evicted_objects: self.evicted_objects.load(Ordering::Relaxed),
            evicted_bytes: self.evicted_bytes.load(Ordering::Relaxed),
        }
    }

    pub fn total_downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }
}

fn per_second(bytes: u64, secs: f64) -> u64 {
    (bytes as f64 / secs) as u64
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}
