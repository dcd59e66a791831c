// Remote store abstraction and its HTTP implementation.

pub mod http_source;
pub mod traits;
