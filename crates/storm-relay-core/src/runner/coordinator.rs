use crate::{
    Error, GenerationResult, Result, Stage,
    channel::{EventSender, Progress},
    context::RequestId,
};
use core::time::Duration;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Everything the supervisor of one run owns.
pub struct Supervision {
    pub request_id: RequestId,
    pub topic: String,
    pub progress_rx: mpsc::Receiver<Progress>,
    pub outcome_rx: oneshot::Receiver<Result<String>>,
    pub started_rx: oneshot::Receiver<()>,
    pub events: EventSender,
    pub result_tx: oneshot::Sender<Result<GenerationResult>>,
    pub cancel: CancellationToken,
    pub timeout: Option<Duration>,
}

/// What ended the forwarding loop.
#[derive(Clone, Copy)]
enum Ending {
    /// The job dropped its progress sender; its outcome is ready or imminent.
    Finished,
    /// The deadline passed while the job was still running.
    TimedOut(Duration),
}

/// Supervises one run from the first progress report to the terminal event.
///
/// This task sits between the worker thread and the consumer of the run's
/// events:
///
/// - Forwards every progress report, stamped with a sequence number, in the
///   order the job emitted it.
/// - Applies the run's deadline, if any. The deadline starts when a worker
///   picks the job up, so time spent in the queue does not count.
/// - Emits exactly one terminal event (`done` or `error`) and resolves the
///   run's result.
///
/// If the consumer goes away the run's token is cancelled and further
/// reports are discarded, so the worker never blocks on a full channel. A
/// run that is still queued when this happens is skipped by its worker. On
/// timeout the worker is abandoned: the terminal event and the result are
/// produced right away, and the supervisor then keeps draining progress in
/// the background until the job finally returns.
pub async fn supervise_run(run: Supervision) {
    let Supervision {
        request_id,
        topic,
        mut progress_rx,
        outcome_rx,
        started_rx,
        mut events,
        result_tx,
        cancel,
        timeout,
    } = run;
    let started = Instant::now();

    let deadline = async move {
        let Some(limit) = timeout else {
            return std::future::pending().await;
        };
        // A job that never starts cannot time out; its outcome ends the run.
        if started_rx.await.is_err() {
            return std::future::pending().await;
        }
        tokio::time::sleep(limit).await;
        limit
    };
    tokio::pin!(deadline);

    let mut consumer_gone = false;
    let ending = loop {
        tokio::select! {
            biased;
            limit = &mut deadline => break Ending::TimedOut(limit),
            () = events.closed(), if !consumer_gone => {
                consumer_gone = true;
                cancel.cancel();
                tracing::info!(
                    event = "consumer_disconnected",
                    %request_id,
                    "Consumer went away, cancelling run"
                );
            }
            report = progress_rx.recv() => {
                let Some(Progress { stage, message }) = report else {
                    break Ending::Finished;
                };
                if consumer_gone {
                    continue;
                }
                tokio::select! {
                    biased;
                    limit = &mut deadline => break Ending::TimedOut(limit),
                    sent = events.send(stage, message) => {
                        if sent.is_err() {
                            consumer_gone = true;
                            cancel.cancel();
                            tracing::info!(
                                event = "consumer_disconnected",
                                %request_id,
                                "Consumer went away, cancelling run"
                            );
                        }
                    }
                }
            }
        }
    };

    let result = match ending {
        Ending::Finished => match outcome_rx.await {
            Ok(Ok(content)) => Ok(GenerationResult {
                topic,
                content,
                request_id,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Internal(
                "run was dropped before completion".to_string(),
            )),
        },
        Ending::TimedOut(limit) => {
            cancel.cancel();
            Err(Error::Timeout { limit })
        }
    };

    let elapsed_ms = started.elapsed().as_millis() as u64;
    match &result {
        Ok(_) => {
            if let Err(e) = events.send(Stage::Done, "Article generated").await {
                tracing::debug!("Terminal event not delivered: {e}");
            }
            tracing::info!(
                event = "run_completed",
                %request_id,
                elapsed_ms,
                progress_events = events.delivered(),
                "Run completed"
            );
        }
        Err(e) => {
            if let Err(send_err) = events.send(Stage::Error, e.description()).await {
                tracing::debug!("Terminal event not delivered: {send_err}");
            }
            tracing::warn!(
                event = "run_failed",
                %request_id,
                elapsed_ms,
                kind = e.kind(),
                "Run failed: {e}"
            );
        }
    }
    drop(events);

    if result_tx.send(result).is_err() {
        tracing::debug!("Run result dropped by its consumer");
    }

    if matches!(ending, Ending::TimedOut(_)) {
        // The worker still owns the sender; keep it unblocked until the job
        // returns.
        while progress_rx.recv().await.is_some() {}
        tracing::info!(
            event = "abandoned_run_finished",
            %request_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Abandoned run finished on its worker"
        );
    }
}
