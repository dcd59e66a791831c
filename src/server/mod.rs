// HTTP surface for the progressive cache.

pub mod handler;
