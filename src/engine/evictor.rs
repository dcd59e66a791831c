// Size-budget enforcement: least-recently-accessed idle objects go first.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::active::{ActiveDownloads, ActiveMap};
use super::stats::StatsCollector;
use super::store::CacheStore;
use crate::error::CacheError;

/// Outcome of one eviction sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub total_before: u64,
    pub total_after: u64,
    /// Evicted ids, oldest access first.
    pub evicted: Vec<String>,
}

pub struct Evictor {
    store: CacheStore,
    active: ActiveDownloads,
    budget_bytes: u64,
    stats: Arc<StatsCollector>,
}

impl Evictor {
    pub fn new(
        store: CacheStore,
        active: ActiveDownloads,
        budget_bytes: u64,
        stats: Arc<StatsCollector>,
    ) -> Self {
        Self {
            store,
            active,
            budget_bytes,
            stats,
        }
    }

    /// Run one sweep, holding the registry lock for its whole duration.
    pub fn reclaim(&self) -> EvictionReport {
        let active = self.active.lock();
        self.reclaim_locked(&active)
    }

    /// Sweep for a caller that already holds the registry lock. Ids present in
    /// `active` are never deleted, whatever their age.
    pub fn reclaim_locked(&self, active: &ActiveMap) -> EvictionReport {
        let objects = match self.store.list_objects() {
            Ok(objects) => objects,
            Err(e) => {
                warn!("eviction scan of {} failed: {}", self.store.dir().display(), e);
                return EvictionReport::default();
            }
        };

        let mut total: u64 = objects.iter().map(|(_, stat)| stat.bytes_on_disk).sum();
        let mut report = EvictionReport {
            total_before: total,
            total_after: total,
            evicted: Vec::new(),
        };
        if total <= self.budget_bytes {
            return report;
        }

        let mut candidates: Vec<_> = objects
            .into_iter()
            .filter(|(id, _)| !active.contains_key(id))
            .collect();
        candidates.sort_by(|(a_id, a), (b_id, b)| {
            a.last_access.cmp(&b.last_access).then_with(|| a_id.cmp(b_id))
        });

        for (id, stat) in candidates {
            if total <= self.budget_bytes {
                break;
            }
            match self.store.delete(&id) {
                Ok(()) => {
                    total = total.saturating_sub(stat.bytes_on_disk);
                    self.stats.record_evicted(stat.bytes_on_disk);
                    debug!("evicted id={} bytes={}", id, stat.bytes_on_disk);
                    report.evicted.push(id);
                }
                Err(source) => {
                    warn!("{}", CacheError::Eviction { id, source });
                }
            }
        }

        report.total_after = total;
        if total > self.budget_bytes {
            warn!(
                "cache still over budget after sweep: total={} budget={} active={}",
                total,
                self.budget_bytes,
                active.len()
            );
        }
        info!(
            "eviction sweep: {} -> {} bytes, {} objects evicted",
            report.total_before,
            report.total_after,
            report.evicted.len()
        );
        report
    }

    /// Sweep on a fixed interval until `shutdown` fires. Each sweep runs on the
    /// blocking pool.
    pub fn spawn_periodic(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // Directory scans and unlinks block; keep them off the workers.
                        let evictor = Arc::clone(&self);
                        let sweep = tokio::task::spawn_blocking(move || evictor.reclaim());
                        if let Err(e) = sweep.await {
                            warn!("eviction sweep panicked: {}", e);
                        }
                    }
                    _ = shutdown.cancelled() => {
                        debug!("periodic eviction stopped");
                        return;
                    }
                }
            }
        })
    }
}
