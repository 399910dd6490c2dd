//! Worker pool: bounded-concurrency task execution.
//!
//! - `execute` runs one task (attempts, backoff, terminal write)
//! - `pool` claims runnable tasks up to `max_concurrent` and supervises them

pub mod execute;
pub mod pool;

pub use execute::{retry_delay, run_task};
pub use pool::{WorkerPool, spawn_worker_pool};
