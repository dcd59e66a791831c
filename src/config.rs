use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{CacheError, CacheResult};

/// Env var naming an optional TOML config file.
pub const CONFIG_PATH_ENV: &str = "STREAM_CACHE_CONFIG";

/// Placeholder substituted with the object id in the source URL template.
pub const ID_PLACEHOLDER: &str = "{id}";

/// Public Drive download endpoint used when no template is configured.
pub const DEFAULT_SOURCE_URL_TEMPLATE: &str =
    "https://drive.google.com/uc?export=download&id={id}";

/// Size of each read from a cache file while streaming a response (256 KB).
pub const DEFAULT_READ_CHUNK_BYTES: usize = 256 * 1024;

/// Top-level configuration for the cache proxy.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub listen_addr: SocketAddr,
    /// Directory holding one `.cache` file per object.
    pub cache_dir: PathBuf,
    /// Total on-disk size the evictor tries to stay under.
    pub budget_bytes: u64,
    /// Fraction of the object that must be on disk before streaming starts.
    pub min_buffer_fraction: f64,
    /// Upper bound on the start buffer, whatever the object size.
    pub max_start_wait_bytes: u64,
    pub eviction_interval: Duration,
    pub readiness_poll_interval: Duration,
    /// Longest a reader waits without the file growing before giving up.
    pub readiness_timeout: Duration,
    pub read_chunk_bytes: usize,
    /// Reject requests that carry no Range header with 400.
    pub require_range: bool,
    /// Treat a missing Range header as `bytes=0-`.
    pub default_open_range: bool,
    pub source_url_template: String,
    /// Content type reported when the remote only says `application/octet-stream`.
    pub fallback_content_type: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            cache_dir: env::temp_dir().join("stream-cache"),
            budget_bytes: 10 * 1024 * 1024 * 1024, // 10 GB
            min_buffer_fraction: 0.05,
            max_start_wait_bytes: 16 * 1024 * 1024, // 16 MB
            eviction_interval: Duration::from_secs(60),
            readiness_poll_interval: Duration::from_millis(250),
            readiness_timeout: Duration::from_secs(30),
            read_chunk_bytes: DEFAULT_READ_CHUNK_BYTES,
            require_range: false,
            default_open_range: false,
            source_url_template: DEFAULT_SOURCE_URL_TEMPLATE.to_string(),
            fallback_content_type: "video/mp4".to_string(),
        }
    }
}

/// On-disk representation; durations are in milliseconds.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    listen_addr: Option<SocketAddr>,
    cache_dir: Option<PathBuf>,
    budget_bytes: Option<u64>,
    min_buffer_fraction: Option<f64>,
    max_start_wait_bytes: Option<u64>,
    eviction_interval_ms: Option<u64>,
    readiness_poll_interval_ms: Option<u64>,
    readiness_timeout_ms: Option<u64>,
    read_chunk_bytes: Option<usize>,
    require_range: Option<bool>,
    default_open_range: Option<bool>,
    source_url_template: Option<String>,
    fallback_content_type: Option<String>,
}

impl CacheConfig {
    /// Defaults, then the file named by `STREAM_CACHE_CONFIG`, then env overrides.
    pub fn load() -> CacheResult<Self> {
        let mut cfg = Self::default();
        if let Ok(path) = env::var(CONFIG_PATH_ENV) {
            cfg = cfg.merge_file(Path::new(&path))?;
        }
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse a TOML document on top of `self`.
    pub fn merge_toml(mut self, raw: &str) -> CacheResult<Self> {
        let file: FileConfig =
            toml::from_str(raw).map_err(|e| CacheError::Config(e.to_string()))?;

        if let Some(v) = file.listen_addr {
            self.listen_addr = v;
        }
        if let Some(v) = file.cache_dir {
            self.cache_dir = v;
        }
        if let Some(v) = file.budget_bytes {
            self.budget_bytes = v;
        }
        if let Some(v) = file.min_buffer_fraction {
            self.min_buffer_fraction = v;
        }
        if let Some(v) = file.max_start_wait_bytes {
            self.max_start_wait_bytes = v;
        }
        if let Some(v) = file.eviction_interval_ms {
            self.eviction_interval = Duration::from_millis(v);
        }
        if let Some(v) = file.readiness_poll_interval_ms {
            self.readiness_poll_interval = Duration::from_millis(v);
        }
        if let Some(v) = file.readiness_timeout_ms {
            self.readiness_timeout = Duration::from_millis(v);
        }
        if let Some(v) = file.read_chunk_bytes {
            self.read_chunk_bytes = v;
        }
        if let Some(v) = file.require_range {
            self.require_range = v;
        }
        if let Some(v) = file.default_open_range {
            self.default_open_range = v;
        }
        if let Some(v) = file.source_url_template {
            self.source_url_template = v;
        }
        if let Some(v) = file.fallback_content_type {
            self.fallback_content_type = v;
        }
        Ok(self)
    }

    fn merge_file(self, path: &Path) -> CacheResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CacheError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        self.merge_toml(&raw)
    }

    fn apply_env(&mut self) -> CacheResult<()> {
        if let Some(port) = env_parse::<u16>("PORT")? {
            self.listen_addr.set_port(port);
        }
        if let Ok(dir) = env::var("STREAM_CACHE_DIR") {
            self.cache_dir = PathBuf::from(dir);
        }
        if let Some(v) = env_parse("STREAM_CACHE_BUDGET_BYTES")? {
            self.budget_bytes = v;
        }
        if let Some(v) = env_parse("STREAM_CACHE_MIN_BUFFER_FRACTION")? {
            self.min_buffer_fraction = v;
        }
        if let Some(v) = env_parse("STREAM_CACHE_MAX_START_WAIT_BYTES")? {
            self.max_start_wait_bytes = v;
        }
        if let Some(ms) = env_parse("STREAM_CACHE_READINESS_TIMEOUT_MS")? {
            self.readiness_timeout = Duration::from_millis(ms);
        }
        if let Ok(template) = env::var("STREAM_CACHE_SOURCE_URL") {
            self.source_url_template = template;
        }
        Ok(())
    }

    pub fn validate(&self) -> CacheResult<()> {
        if self.budget_bytes == 0 {
            return Err(CacheError::Config("budget_bytes must be > 0".into()));
        }
        if !(self.min_buffer_fraction > 0.0 && self.min_buffer_fraction <= 1.0) {
            return Err(CacheError::Config(format!(
                "min_buffer_fraction {} outside (0, 1]",
                self.min_buffer_fraction
            )));
        }
        if self.eviction_interval.is_zero()
            || self.readiness_poll_interval.is_zero()
            || self.readiness_timeout.is_zero()
        {
            return Err(CacheError::Config("intervals must be non-zero".into()));
        }
        if self.read_chunk_bytes == 0 {
            return Err(CacheError::Config("read_chunk_bytes must be > 0".into()));
        }
        if !self.source_url_template.contains(ID_PLACEHOLDER) {
            return Err(CacheError::Config(format!(
                "source_url_template must contain {}",
                ID_PLACEHOLDER
            )));
        }
        Ok(())
    }

    /// Bytes that must be on disk before a read starting at offset 0 may begin.
    pub fn start_buffer_bytes(&self, declared_size: u64) -> u64 {
        let by_fraction = (declared_size as f64 * self.min_buffer_fraction).ceil() as u64;
        by_fraction.min(self.max_start_wait_bytes).min(declared_size)
    }
}

fn env_parse<T: FromStr>(key: &str) -> CacheResult<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| CacheError::Config(format!("{}={:?}: {}", key, raw, e))),
        Err(_) => Ok(None),
    }
}
