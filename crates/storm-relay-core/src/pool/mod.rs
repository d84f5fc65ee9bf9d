//! Bounded pool of OS worker threads for blocking generation jobs.
//!
//! - [`manager`] - Admission control, job submission and graceful shutdown.
//! - [`worker`] - The loop each worker thread runs.
//! - [`request`] - Messages exchanged between the pool and its workers.

pub mod manager;
pub mod request;
pub mod worker;

pub use manager::WorkerPool;
pub use request::RunJob;
