//! Internal work request types sent to worker threads.
//!
//! This module defines the [`WorkRequest`] enum used to communicate between the
//! worker pool and individual worker threads, and the [`RunLease`] that keeps a
//! run's admission slot occupied until its worker lets go of it.

use crate::{
    Result, channel::ProgressSender, generator::ArticleGenerator, store::MemoryStore,
};
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use tokio::sync::{OwnedSemaphorePermit, oneshot};

/// A message sent from the pool to a worker.
///
/// - [`WorkRequest::Run`] executes one generation job.
/// - [`WorkRequest::Shutdown`] gracefully terminates the worker.
pub enum WorkRequest {
    Run(Box<RunJob>),
    Shutdown { response: oneshot::Sender<()> },
}

/// Everything a worker needs to execute one run.
///
/// The store, the progress sender and the lease are owned by the job, so they
/// are dropped on the worker thread as soon as the job finishes, whatever its
/// outcome.
pub struct RunJob {
    pub topic: String,
    pub generator: Arc<dyn ArticleGenerator>,
    pub store: MemoryStore,
    pub progress: ProgressSender,
    pub outcome: oneshot::Sender<Result<String>>,
    /// Fired when a worker begins executing the job; starts the run deadline.
    pub started: oneshot::Sender<()>,
    pub span: tracing::Span,
    pub lease: RunLease,
}

/// Holds one admission slot of the pool and counts towards its active runs.
#[derive(Debug)]
pub struct RunLease {
    _permit: OwnedSemaphorePermit,
    active: Arc<AtomicUsize>,
}

impl RunLease {
    pub(crate) fn new(permit: OwnedSemaphorePermit, active: Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::AcqRel);
        Self {
            _permit: permit,
            active,
        }
    }
}

impl Drop for RunLease {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}
