// In-memory remote store for exercising the cache without a network.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use stream_cache_proxy::config::CacheConfig;
use stream_cache_proxy::error::{CacheError, CacheResult};
use stream_cache_proxy::source::traits::{ByteStream, ObjectMeta, RemoteSource};

/// Deterministic test content.
pub fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub fn test_config(dir: &std::path::Path) -> CacheConfig {
    CacheConfig {
        cache_dir: dir.to_path_buf(),
        budget_bytes: 1024 * 1024 * 1024,
        min_buffer_fraction: 0.10,
        max_start_wait_bytes: 1024 * 1024 * 1024,
        readiness_poll_interval: Duration::from_millis(10),
        readiness_timeout: Duration::from_secs(5),
        read_chunk_bytes: 16,
        source_url_template: "http://unused/{id}".to_string(),
        ..CacheConfig::default()
    }
}

pub struct FakeSource {
    objects: Mutex<HashMap<String, Bytes>>,
    /// Fail the stream once this many bytes have been emitted.
    fail_at: Mutex<HashMap<String, u64>>,
    chunk_size: usize,
    /// When set, each chunk waits for one permit.
    gate: Option<Arc<Semaphore>>,
    forbidden: bool,
    fetches: AtomicUsize,
    metadata_calls: AtomicUsize,
}

impl FakeSource {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            fail_at: Mutex::new(HashMap::new()),
            chunk_size,
            gate: None,
            forbidden: false,
            fetches: AtomicUsize::new(0),
            metadata_calls: AtomicUsize::new(0),
        }
    }

    /// Chunks are only emitted as permits are released with [`FakeSource::release`].
    pub fn gated(chunk_size: usize) -> Self {
        Self {
            gate: Some(Arc::new(Semaphore::new(0))),
            ..Self::new(chunk_size)
        }
    }

    pub fn forbidden() -> Self {
        Self {
            forbidden: true,
            ..Self::new(16)
        }
    }

    pub fn insert(&self, id: &str, data: Vec<u8>) {
        self.objects.lock().insert(id.to_string(), Bytes::from(data));
    }

    pub fn fail_after(&self, id: &str, bytes: u64) {
        self.fail_at.lock().insert(id.to_string(), bytes);
    }

    pub fn clear_failure(&self, id: &str) {
        self.fail_at.lock().remove(id);
    }

    pub fn release(&self, chunks: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(chunks);
        }
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn metadata_calls(&self) -> usize {
        self.metadata_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteSource for FakeSource {
    async fn fetch_metadata(&self, id: &str) -> CacheResult<ObjectMeta> {
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        if self.forbidden {
            return Err(CacheError::RemoteForbidden(403));
        }
        let objects = self.objects.lock();
        let data = objects
            .get(id)
            .ok_or_else(|| CacheError::RemoteUnavailable(format!("no object {}", id)))?;
        Ok(ObjectMeta {
            size: data.len() as u64,
            content_type: "video/mp4".to_string(),
        })
    }

    async fn fetch_stream(&self, id: &str, from_byte: u64) -> CacheResult<ByteStream> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let data = self
            .objects
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| CacheError::RemoteUnavailable(format!("no object {}", id)))?;
        let fail_at = self.fail_at.lock().get(id).copied();
        let chunk_size = self.chunk_size;
        let gate = self.gate.clone();

        let stream = futures_util::stream::unfold(
            (from_byte as usize, false),
            move |(pos, failed)| {
                let data = data.clone();
                let gate = gate.clone();
                async move {
                    if failed || pos >= data.len() {
                        return None;
                    }
                    if let Some(gate) = gate {
                        gate.acquire().await.ok()?.forget();
                    }
                    if let Some(k) = fail_at {
                        if pos as u64 >= k {
                            let err = CacheError::RemoteUnavailable("connection reset".into());
                            return Some((Err(err), (pos, true)));
                        }
                    }
                    let mut end = (pos + chunk_size).min(data.len());
                    if let Some(k) = fail_at {
                        end = end.min(k as usize);
                    }
                    Some((Ok(data.slice(pos..end)), (end, false)))
                }
            },
        );
        Ok(stream.boxed())
    }
}
