// Error taxonomy for the progressive cache and its HTTP surface.

use std::io;
use std::time::Duration;

use axum::http::StatusCode;

pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Metadata lookup or stream fetch against the remote store failed.
    #[error("remote store unavailable: {0}")]
    RemoteUnavailable(String),

    /// The remote store refused access; the status is propagated verbatim.
    #[error("remote store refused access: HTTP {0}")]
    RemoteForbidden(u16),

    /// The fetch stream ended with a byte count different from the declared size.
    #[error("partial download: expected {expected} bytes, wrote {written}")]
    PartialDownload { expected: u64, written: u64 },

    /// Deleting a cache file during an eviction sweep failed.
    #[error("eviction of {id} failed: {source}")]
    Eviction {
        id: String,
        #[source]
        source: io::Error,
    },

    /// No new bytes reached the disk within the readiness timeout.
    #[error("timed out after {waited:?} waiting for {id}")]
    Timeout { id: String, waited: Duration },

    #[error("range not satisfiable for object of {size} bytes")]
    RangeNotSatisfiable { size: u64 },

    #[error("invalid object id")]
    InvalidId,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CacheError {
    /// HTTP status reported to the caller for this failure.
    pub fn status_code(&self) -> StatusCode {
        match self {
            CacheError::RemoteForbidden(status) => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::FORBIDDEN)
            }
            CacheError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            CacheError::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            CacheError::InvalidId => StatusCode::BAD_REQUEST,
            CacheError::RemoteUnavailable(_)
            | CacheError::PartialDownload { .. }
            | CacheError::Eviction { .. }
            | CacheError::Config(_)
            | CacheError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<reqwest::Error> for CacheError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) if status.as_u16() == 401 || status.as_u16() == 403 => {
                CacheError::RemoteForbidden(status.as_u16())
            }
            _ => CacheError::RemoteUnavailable(e.to_string()),
        }
    }
}
