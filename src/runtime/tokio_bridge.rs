//! Async adapters over the blocking engine entry points.
//!
//! The engine itself is synchronous; these helpers move its blocking work
//! onto tokio's blocking thread pool so async services can drive drains
//! without stalling the runtime.

use std::sync::Arc;

use crate::core::iterator::RecordIterator;
use crate::core::record::IterableRecord;
use crate::infra::record_store::RecordStore;

/// Drain a pump-mode engine to completion on the blocking thread pool.
///
/// Resolves when the store has no more due records for the engine's field.
///
/// # Errors
///
/// Fails when the blocking task is cancelled or panics.
pub async fn drain<T, S>(iterator: Arc<RecordIterator<T, S>>) -> anyhow::Result<()>
where
    T: IterableRecord,
    S: RecordStore<T>,
{
    tokio::task::spawn_blocking(move || iterator.process())
        .await
        .map_err(|err| anyhow::anyhow!("drain task failed: {err}"))
}
