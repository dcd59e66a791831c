// Cache engine: object store, download coordination, eviction and progressive reads.

pub mod active;
pub mod downloader;
pub mod evictor;
pub mod stats;
pub mod store;
pub mod streamer;
