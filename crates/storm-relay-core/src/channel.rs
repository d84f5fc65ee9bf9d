//! Bounded progress channels between a blocking job and an async consumer.
//!
//! Progress crosses two bounded hops:
//!
//! 1. [`ProgressSender`] -> run supervisor. The job calls
//!    [`ProgressHook::emit`] synchronously from its worker thread; when the
//!    hop is full the worker blocks until the supervisor catches up.
//! 2. [`EventSender`] -> [`ProgressStream`]. The supervisor stamps each
//!    report with the request id, a gap-free sequence number and a timestamp,
//!    then hands it to whoever drains the run.
//!
//! Neither hop ever drops an event. A slow HTTP client therefore slows the
//! supervisor, which in turn stalls the worker at its next `emit`.

use crate::{Error, ProgressEvent, Result, Stage, context::RequestId};
use chrono::Utc;
use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// Default capacity of both progress hops.
pub const DEFAULT_PROGRESS_CAPACITY: usize = 256;

/// The progress-reporting capability handed to a generation job.
pub trait ProgressHook: Send + Sync {
    /// Reports that the job reached `stage`. Blocks while the channel is full.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::ReservedStage`] for `done`/`error`, and with
    /// [`Error::ChannelError`] once the run has been abandoned.
    fn emit(&self, stage: Stage, message: &str) -> Result<()>;

    /// Cooperative cancellation checkpoint. Jobs should stop early once this
    /// returns `true`.
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// A raw progress report, before it is stamped by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub stage: Stage,
    pub message: String,
}

/// Job-side end of the first hop.
#[derive(Debug)]
pub struct ProgressSender {
    tx: mpsc::Sender<Progress>,
    cancel: CancellationToken,
}

impl ProgressHook for ProgressSender {
    fn emit(&self, stage: Stage, message: &str) -> Result<()> {
        if stage.is_terminal() {
            return Err(Error::ReservedStage { stage });
        }

        self.tx
            .blocking_send(Progress {
                stage,
                message: message.to_string(),
            })
            .map_err(|_| Error::ChannelError {
                context: "progress receiver dropped".to_string(),
            })
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Creates the first hop. `emit` on the returned sender must be called from
/// a thread that is not driving an async runtime.
///
/// # Panics
///
/// Panics if `capacity` is zero.
#[must_use]
pub fn progress_channel(
    capacity: usize,
    cancel: CancellationToken,
) -> (ProgressSender, mpsc::Receiver<Progress>) {
    let (tx, rx) = mpsc::channel(capacity);
    (ProgressSender { tx, cancel }, rx)
}

/// Supervisor-side end of the second hop. Assigns sequence numbers and closes
/// itself after the terminal event.
#[derive(Debug)]
pub struct EventSender {
    tx: Option<mpsc::Sender<ProgressEvent>>,
    request_id: RequestId,
    next_sequence: u64,
}

impl EventSender {
    /// Stamps and delivers one event, waiting for room if the consumer lags.
    ///
    /// After a terminal stage is delivered the sender closes, so nothing can
    /// follow it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelError`] if the consumer is gone or the terminal
    /// event was already sent.
    pub async fn send(&mut self, stage: Stage, message: impl Into<String>) -> Result<()> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(Error::ChannelError {
                context: "event channel already closed".to_string(),
            });
        };

        let event = ProgressEvent {
            request_id: self.request_id,
            sequence: self.next_sequence,
            stage,
            message: message.into(),
            timestamp: Utc::now(),
        };

        if tx.send(event).await.is_err() {
            self.tx = None;
            return Err(Error::ChannelError {
                context: "event consumer disconnected".to_string(),
            });
        }

        self.next_sequence += 1;
        if stage.is_terminal() {
            self.tx = None;
        }
        Ok(())
    }

    /// Resolves once the consumer has dropped its [`ProgressStream`], or
    /// immediately if this sender is already closed.
    pub async fn closed(&self) {
        if let Some(tx) = self.tx.as_ref() {
            tx.closed().await;
        }
    }

    /// `true` once the terminal event was sent or the consumer went away.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.tx.is_none()
    }

    /// Number of events delivered so far.
    #[must_use]
    pub const fn delivered(&self) -> u64 {
        self.next_sequence
    }
}

/// Consumer-side end of the second hop.
#[derive(Debug)]
pub struct ProgressStream {
    rx: mpsc::Receiver<ProgressEvent>,
}

impl ProgressStream {
    /// Receives the next event, or `None` once the run's channel is closed.
    pub async fn next_event(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }

    /// Consumes the channel as a lazy, finite stream in emission order.
    pub fn drain(self) -> impl Stream<Item = ProgressEvent> + Send + 'static {
        ReceiverStream::new(self.rx)
    }
}

/// Creates the second hop for one request.
///
/// # Panics
///
/// Panics if `capacity` is zero.
#[must_use]
pub fn event_channel(capacity: usize, request_id: RequestId) -> (EventSender, ProgressStream) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        EventSender {
            tx: Some(tx),
            request_id,
            next_sequence: 0,
        },
        ProgressStream { rx },
    )
}
