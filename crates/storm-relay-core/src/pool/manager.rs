//! Worker pool for blocking generation jobs.
//!
//! This module defines the [`WorkerPool`] struct, which owns a fixed set of OS
//! threads that execute [`RunJob`]s. All workers pull from one bounded FIFO
//! queue, so a job waits only until *any* worker is free.
//!
//! Admission is decided up front by a semaphore with `num_workers +
//! queue_capacity` permits: a run either gets a slot immediately or the caller
//! receives [`Error::ServerBusy`]. Nothing ever waits for admission, and the
//! queue can never overflow because it is sized to the admission limit.
//!
//! Shutdown is coordinated via a shared [`CancellationToken`]; every run gets
//! a child token, so cancelling the pool cancels all runs cooperatively.

use super::{
    request::{RunJob, RunLease, WorkRequest},
    worker::worker_loop,
};
use crate::{Error, Result};
use core::time::Duration;
use parking_lot::Mutex;
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
};
use tokio::{
    sync::{Semaphore, TryAcquireError, mpsc, oneshot},
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;

/// How long each worker gets to acknowledge a shutdown request.
const WORKER_ACK_TIMEOUT: Duration = Duration::from_secs(3);

/// A fixed set of worker threads behind a bounded FIFO queue.
pub struct WorkerPool {
    queue: mpsc::Sender<WorkRequest>,
    admission: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    accepting: AtomicBool,
    num_workers: usize,
    capacity: usize,
    shutdown_token: CancellationToken,
    shutdown_timeout: Duration,
}

impl WorkerPool {
    /// Spawns `num_workers` threads sharing a queue of `queue_capacity`
    /// waiting runs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if `num_workers` is zero or a worker thread
    /// cannot be spawned.
    pub fn new(
        num_workers: usize,
        queue_capacity: usize,
        shutdown_timeout: Duration,
    ) -> Result<Self> {
        if num_workers == 0 {
            return Err(Error::Internal(
                "worker pool needs at least one worker".to_string(),
            ));
        }

        let capacity = num_workers + queue_capacity;
        // Extra room for one shutdown message per worker on top of the
        // admitted runs.
        let (tx, rx) = mpsc::channel(capacity + num_workers);
        let rx = Arc::new(Mutex::new(rx));

        for worker_id in 0..num_workers {
            let rx = Arc::clone(&rx);
            thread::Builder::new()
                .name(format!("storm-worker-{worker_id}"))
                .spawn(move || worker_loop(worker_id, &rx))
                .map_err(|e| Error::Internal(format!("failed to spawn worker {worker_id}: {e}")))?;
        }

        Ok(Self {
            queue: tx,
            admission: Arc::new(Semaphore::new(capacity)),
            active: Arc::new(AtomicUsize::new(0)),
            accepting: AtomicBool::new(true),
            num_workers,
            capacity,
            shutdown_token: CancellationToken::new(),
            shutdown_timeout,
        })
    }

    /// Claims one run slot without waiting.
    ///
    /// # Errors
    ///
    /// - [`Error::ServerBusy`] when every worker is busy and the queue is full.
    /// - [`Error::ServiceShutdown`] once [`WorkerPool::shutdown`] has begun.
    pub fn try_admit(&self) -> Result<RunLease> {
        if !self.is_accepting() {
            return Err(Error::ServiceShutdown);
        }

        match Arc::clone(&self.admission).try_acquire_owned() {
            Ok(permit) => Ok(RunLease::new(permit, Arc::clone(&self.active))),
            Err(TryAcquireError::NoPermits) => Err(Error::ServerBusy {
                capacity: self.capacity,
            }),
            Err(TryAcquireError::Closed) => Err(Error::ServiceShutdown),
        }
    }

    /// A cancellation token for one run, cancelled when the pool shuts down.
    #[must_use]
    pub fn run_token(&self) -> CancellationToken {
        self.shutdown_token.child_token()
    }

    /// Queues an admitted job for the next free worker.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelError`] if the queue is closed (all workers
    /// exited). The job, and with it its lease, is dropped.
    pub fn submit(&self, job: RunJob) -> Result<()> {
        self.queue
            .try_send(WorkRequest::Run(Box::new(job)))
            .map_err(|e| Error::ChannelError {
                context: format!("worker queue rejected run: {e}"),
            })
    }

    /// Runs admitted and not yet released by their worker.
    #[must_use]
    pub fn active_runs(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Maximum number of runs admitted at once (workers plus queue).
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Gracefully shuts down all workers in the pool.
    ///
    /// - Refuses new runs.
    /// - Waits (up to the configured shutdown timeout) for active runs to
    ///   finish.
    /// - Cancels every remaining run's token.
    /// - Sends a [`WorkRequest::Shutdown`] per worker and waits (up to 3
    ///   seconds per worker) for the acknowledgements.
    ///
    /// Workers that are stuck inside a job that ignores cancellation keep
    /// running until the job returns; their acknowledgement is then missed.
    ///
    /// # Errors
    ///
    /// Currently infallible; failures are logged.
    pub async fn shutdown(&self) -> Result<()> {
        // === Phase 0: Stop accepting new runs ===
        tracing::info!(event = "pool_shutdown", "Refusing new runs");
        self.accepting.store(false, Ordering::Release);
        self.admission.close();

        // === Phase 1: Wait for active runs to drain ===
        tracing::info!(
            event = "pool_shutdown",
            "Draining active runs ({} active)",
            self.active_runs()
        );
        let drained = timeout(self.shutdown_timeout, async {
            while self.active_runs() > 0 {
                sleep(Duration::from_millis(100)).await;
            }
        })
        .await;

        match drained {
            Ok(()) => tracing::debug!("All active runs drained"),
            Err(_) => tracing::warn!(
                "Graceful drain timed out ({} runs still active)",
                self.active_runs()
            ),
        }

        // === Phase 2: Cancel any remaining work ===
        tracing::debug!("Cancelling remaining runs via shutdown token");
        self.shutdown_token.cancel();

        // === Phase 3: Notify workers to shut down ===
        let mut acks = Vec::with_capacity(self.num_workers);
        for i in 0..self.num_workers {
            let (tx, rx) = oneshot::channel();
            match timeout(
                WORKER_ACK_TIMEOUT,
                self.queue.send(WorkRequest::Shutdown { response: tx }),
            )
            .await
            {
                Ok(Ok(())) => acks.push((i, rx)),
                Ok(Err(e)) => tracing::error!("Failed to send shutdown to worker {i}: {e}"),
                Err(_) => tracing::error!("Timed out queueing shutdown for worker {i}"),
            }
        }

        let waits = acks.into_iter().map(|(i, rx)| async move {
            match timeout(WORKER_ACK_TIMEOUT, rx).await {
                Ok(Ok(())) => tracing::trace!("Shutdown request {i} acknowledged"),
                Ok(Err(e)) => tracing::error!("Shutdown request {i} dropped: {e}"),
                Err(_) => tracing::warn!("Shutdown request {i} timed out"),
            }
        });
        futures::future::join_all(waits).await;

        tracing::info!(event = "pool_shutdown", "Worker pool shutdown complete");
        Ok(())
    }
}
