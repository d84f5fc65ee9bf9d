use super::request::WorkRequest;
use crate::runner::processor::execute_job;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Thread body of one pool worker.
///
/// Workers share a single queue: whichever worker is idle takes the next
/// [`WorkRequest`]. The lock is held only while waiting for a message, never
/// while a job runs, so one long job does not starve the other workers.
///
/// # Request Types
///
/// - [`WorkRequest::Run`] - Executes one generation job via [`execute_job`].
/// - [`WorkRequest::Shutdown`] - Acknowledges and stops the worker.
///
/// The loop also ends when every sender of the queue has been dropped.
pub fn worker_loop(worker_id: usize, rx: &Arc<Mutex<mpsc::Receiver<WorkRequest>>>) {
    tracing::trace!("Worker {worker_id} started");

    loop {
        let work = rx.lock().blocking_recv();
        match work {
            Some(WorkRequest::Run(job)) => execute_job(worker_id, *job),
            Some(WorkRequest::Shutdown { response }) => {
                tracing::debug!("Worker {worker_id} received shutdown signal");

                if response.send(()).is_err() {
                    tracing::error!("Worker {worker_id} failed to acknowledge shutdown");
                }
                break;
            }
            None => {
                tracing::debug!("Worker {worker_id} queue closed");
                break;
            }
        }
    }

    tracing::trace!("Worker {worker_id} stopped");
}
