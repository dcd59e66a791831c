use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;

use crate::error::CacheResult;

/// Size and type of a remote object, as reported when a fetch starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub size: u64,
    pub content_type: String,
}

pub type ByteStream = BoxStream<'static, CacheResult<Bytes>>;

/// The remote blob store the cache fronts. Implementations authenticate themselves.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    async fn fetch_metadata(&self, id: &str) -> CacheResult<ObjectMeta>;
    async fn fetch_stream(&self, id: &str, from_byte: u64) -> CacheResult<ByteStream>;
}
