// Progressive disk cache in front of a slow remote blob store.

pub mod config;
pub mod engine;
pub mod error;
pub mod server;
pub mod source;
