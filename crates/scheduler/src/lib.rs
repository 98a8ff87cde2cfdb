//! Distributes a batch of tasks across a pool of local worker processes.
//!
//! [`Controller`] spawns one worker per core ([`pool`]), connects to all of
//! them, hands pending tasks to idle workers and reacts to each completion
//! with another scheduling pass. The first remote failure aborts the batch.

pub mod controller;
pub mod error;
pub mod pool;

pub use controller::{Controller, ControllerState, RunReport};
pub use error::SchedulerError;
pub use pool::{
    detect_core_count, resolve_pool_size, ProcessSpawner, SpawnedWorker, Spawner, WorkerExit,
    WorkerHandle, WorkerPool, WorkerStatus,
};
