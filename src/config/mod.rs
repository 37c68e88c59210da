//! Configuration models for engines and worker pools.

pub mod engine;

pub use engine::{EngineConfig, IteratorConfig, WorkerPoolConfig};

/// Load a `.env` file into the process environment if one is present.
/// Missing files are fine; explicit environment variables win.
pub fn load_env() {
    let _ = dotenvy::dotenv();
}
