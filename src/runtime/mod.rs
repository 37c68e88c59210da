//! Runtime adapters: loop threads and the optional async surface.

pub mod handle;
#[cfg(feature = "tokio-runtime")]
pub mod tokio_bridge;

pub use handle::IteratorHandle;
