//! Task runner: schedules generation jobs and hands back run handles.
//!
//! A [`TaskRunner`] owns the worker pool and the generator. Each call to
//! [`TaskRunner::start`] allocates a fresh [`MemoryStore`] and progress
//! channel, queues the job on the pool, spawns a supervisor task for it and
//! returns immediately with a [`RunHandle`].
//!
//! - `coordinator` - The per-run supervisor (sequencing, timeout, terminal
//!   event).
//! - `processor` - What a worker thread does with one job.

pub(crate) mod coordinator;
pub(crate) mod processor;

use crate::{
    Error, GenerationRequest, GenerationResult, ProgressEvent, Result,
    channel::{DEFAULT_PROGRESS_CAPACITY, ProgressStream, event_channel, progress_channel},
    context::{RequestContext, RequestId},
    generator::ArticleGenerator,
    pool::{RunJob, WorkerPool},
    store::{DEFAULT_MAX_ARTIFACT_BYTES, MemoryStore},
    types::DEFAULT_MAX_TOPIC_CHARS,
};
use coordinator::{Supervision, supervise_run};
use core::time::Duration;
use futures::Stream;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::Instrument;

/// Tunables of a [`TaskRunner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Worker threads executing jobs. Must be at least 1.
    pub num_workers: usize,
    /// Runs that may wait for a free worker before `start` reports
    /// [`Error::ServerBusy`].
    pub queue_capacity: usize,
    /// Capacity of each progress hop. Must be at least 1.
    pub progress_buffer_size: usize,
    /// Per-artifact ceiling of each run's store.
    pub max_artifact_bytes: usize,
    /// Maximum run duration, counted from the moment a worker picks the job
    /// up; `None` disables the deadline.
    pub run_timeout: Option<Duration>,
    /// How long [`TaskRunner::shutdown`] waits for in-flight runs.
    pub shutdown_timeout: Duration,
    /// Longest accepted topic, in characters.
    pub max_topic_chars: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            num_workers: 2,
            queue_capacity: 8,
            progress_buffer_size: DEFAULT_PROGRESS_CAPACITY,
            max_artifact_bytes: DEFAULT_MAX_ARTIFACT_BYTES,
            run_timeout: Some(Duration::from_secs(30 * 60)),
            shutdown_timeout: Duration::from_secs(30),
            max_topic_chars: DEFAULT_MAX_TOPIC_CHARS,
        }
    }
}

struct Inner {
    config: RunnerConfig,
    pool: WorkerPool,
    generator: Arc<dyn ArticleGenerator>,
}

/// Cheaply cloneable entry point for starting runs.
#[derive(Clone)]
pub struct TaskRunner {
    inner: Arc<Inner>,
}

impl TaskRunner {
    /// Spawns the worker pool described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the configuration is unusable or the
    /// worker threads cannot be spawned.
    pub fn new(config: RunnerConfig, generator: Arc<dyn ArticleGenerator>) -> Result<Self> {
        if config.progress_buffer_size == 0 {
            return Err(Error::Internal(
                "progress buffer size must be at least 1".to_string(),
            ));
        }

        let pool = WorkerPool::new(
            config.num_workers,
            config.queue_capacity,
            config.shutdown_timeout,
        )?;

        tracing::info!(
            event = "runner_started",
            num_workers = config.num_workers,
            capacity = pool.capacity(),
            "Task runner started"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                pool,
                generator,
            }),
        })
    }

    /// Validates `request` and schedules its run. Never blocks, but must be
    /// called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] for an empty or oversized topic.
    /// - [`Error::ServerBusy`] when every worker and queue slot is taken.
    /// - [`Error::ServiceShutdown`] once shutdown has begun.
    ///
    /// Nothing is scheduled when an error is returned.
    pub fn start(&self, request: &GenerationRequest, ctx: &RequestContext) -> Result<RunHandle> {
        let Inner {
            config,
            pool,
            generator,
        } = self.inner.as_ref();

        request.validate(config.max_topic_chars)?;
        let lease = pool.try_admit()?;

        let request_id = ctx.id();
        let cancel = pool.run_token();
        let (progress, progress_rx) =
            progress_channel(config.progress_buffer_size, cancel.clone());
        let (events, stream) = event_channel(config.progress_buffer_size, request_id);
        let (outcome, outcome_rx) = oneshot::channel();
        let (started, started_rx) = oneshot::channel();
        let (result_tx, result_rx) = oneshot::channel();

        let span = tracing::info_span!("run", %request_id, topic = %request.topic);

        pool.submit(RunJob {
            topic: request.topic.clone(),
            generator: Arc::clone(generator),
            store: MemoryStore::with_limit(config.max_artifact_bytes),
            progress,
            outcome,
            started,
            span: span.clone(),
            lease,
        })?;

        tracing::info!(
            parent: &span,
            event = "run_queued",
            active_runs = pool.active_runs(),
            "Run queued"
        );

        tokio::spawn(
            supervise_run(Supervision {
                request_id,
                topic: request.topic.clone(),
                progress_rx,
                outcome_rx,
                started_rx,
                events,
                result_tx,
                cancel,
                timeout: config.run_timeout,
            })
            .instrument(span),
        );

        Ok(RunHandle {
            request_id,
            events: stream,
            result: RunResult { rx: result_rx },
        })
    }

    /// Admitted runs whose worker has not finished yet.
    #[must_use]
    pub fn active_runs(&self) -> usize {
        self.inner.pool.active_runs()
    }

    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.inner.pool.is_accepting()
    }

    #[must_use]
    pub fn generator_ready(&self) -> bool {
        self.inner.generator.is_ready()
    }

    #[must_use]
    pub fn config(&self) -> &RunnerConfig {
        &self.inner.config
    }

    /// Refuses new runs, drains or cancels in-flight ones and stops the
    /// workers.
    ///
    /// # Errors
    ///
    /// Propagates failures of the pool shutdown.
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.pool.shutdown().await
    }
}

/// The caller's view of one scheduled run.
#[derive(Debug)]
pub struct RunHandle {
    request_id: RequestId,
    events: ProgressStream,
    result: RunResult,
}

impl RunHandle {
    #[must_use]
    pub const fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Splits the handle into its event stream and its pending result.
    #[must_use]
    pub fn split(self) -> (ProgressStream, RunResult) {
        (self.events, self.result)
    }

    /// The run's progress events in emission order, ending after the
    /// terminal event. The result is discarded.
    pub fn drain(self) -> impl Stream<Item = ProgressEvent> + Send + 'static {
        self.events.drain()
    }

    /// Waits for the run to finish, discarding its progress events.
    ///
    /// # Errors
    ///
    /// Returns the run's failure: [`Error::Pipeline`] for job errors and
    /// panics, [`Error::Timeout`] when the deadline passed.
    pub async fn await_result(self) -> Result<GenerationResult> {
        let (mut events, result) = self.split();
        while events.next_event().await.is_some() {}
        result.wait().await
    }
}

/// The pending outcome of one run.
#[derive(Debug)]
pub struct RunResult {
    rx: oneshot::Receiver<Result<GenerationResult>>,
}

impl RunResult {
    /// Resolves once the run's terminal event has been emitted.
    ///
    /// # Errors
    ///
    /// Returns the run's failure, or [`Error::Internal`] if the supervisor
    /// vanished without reporting.
    pub async fn wait(self) -> Result<GenerationResult> {
        self.rx.await.unwrap_or_else(|_| {
            Err(Error::Internal(
                "run supervisor exited without a result".to_string(),
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ProgressHook, Stage, store::ArtifactStore};
    use futures::StreamExt;
    use std::{
        collections::HashSet,
        sync::{
            Mutex as StdMutex,
            atomic::{AtomicUsize, Ordering},
            mpsc as std_mpsc,
        },
    };

    /// Emits the four pipeline stages and returns a fixed article.
    struct Scripted;

    impl ArticleGenerator for Scripted {
        fn run(
            &self,
            topic: &str,
            store: &dyn ArtifactStore,
            progress: &dyn ProgressHook,
        ) -> anyhow::Result<String> {
            for stage in [Stage::Research, Stage::Outline, Stage::Draft, Stage::Polish] {
                progress.emit(stage, &format!("{stage} for {topic}"))?;
            }
            store.write_str("out/storm_gen_article.txt", topic)?;
            Ok(format!("Fake result for {topic}"))
        }
    }

    struct Failing;

    impl ArticleGenerator for Failing {
        fn run(
            &self,
            _topic: &str,
            _store: &dyn ArtifactStore,
            progress: &dyn ProgressHook,
        ) -> anyhow::Result<String> {
            progress.emit(Stage::Research, "starting")?;
            anyhow::bail!("search provider unavailable")
        }
    }

    struct Panicking;

    impl ArticleGenerator for Panicking {
        fn run(
            &self,
            _topic: &str,
            _store: &dyn ArtifactStore,
            _progress: &dyn ProgressHook,
        ) -> anyhow::Result<String> {
            panic!("model crashed")
        }
    }

    /// Writes only artifacts and leaves article resolution to the runner.
    struct ArtifactsOnly;

    impl ArticleGenerator for ArtifactsOnly {
        fn run(
            &self,
            topic: &str,
            store: &dyn ArtifactStore,
            _progress: &dyn ProgressHook,
        ) -> anyhow::Result<String> {
            store.write_str(&format!("{topic}/storm_gen_article.txt"), "draft text")?;
            Ok(String::new())
        }
    }

    /// Blocks until released, then reports how many artifacts its store saw.
    struct Gated {
        started: StdMutex<std_mpsc::Sender<()>>,
        release: StdMutex<std_mpsc::Receiver<()>>,
        calls: Arc<AtomicUsize>,
    }

    /// A gated generator plus its start notifications, release handle and
    /// invocation counter.
    fn gated() -> (
        Gated,
        std_mpsc::Receiver<()>,
        std_mpsc::Sender<()>,
        Arc<AtomicUsize>,
    ) {
        let (started_tx, started_rx) = std_mpsc::channel();
        let (release_tx, release_rx) = std_mpsc::channel();
        let calls = Arc::new(AtomicUsize::new(0));
        let generator = Gated {
            started: StdMutex::new(started_tx),
            release: StdMutex::new(release_rx),
            calls: Arc::clone(&calls),
        };
        (generator, started_rx, release_tx, calls)
    }

    impl ArticleGenerator for Gated {
        fn run(
            &self,
            topic: &str,
            store: &dyn ArtifactStore,
            _progress: &dyn ProgressHook,
        ) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _ = self.started.lock().unwrap().send(());
            let _ = self.release.lock().unwrap().recv();
            store.write_str("mine.txt", topic)?;
            Ok(format!("{topic}:{}", store.list("").len()))
        }
    }

    /// Writes one artifact of the given size.
    struct Oversized(usize);

    impl ArticleGenerator for Oversized {
        fn run(
            &self,
            _topic: &str,
            store: &dyn ArtifactStore,
            progress: &dyn ProgressHook,
        ) -> anyhow::Result<String> {
            progress.emit(Stage::Draft, "writing")?;
            store.write("t/huge.bin", &vec![0; self.0])?;
            Ok("unreachable".to_string())
        }
    }

    /// Keeps reporting progress until cancelled.
    struct Endless;

    impl ArticleGenerator for Endless {
        fn run(
            &self,
            _topic: &str,
            _store: &dyn ArtifactStore,
            progress: &dyn ProgressHook,
        ) -> anyhow::Result<String> {
            while !progress.is_cancelled() {
                progress.emit(Stage::Research, "still researching")?;
                std::thread::sleep(Duration::from_millis(5));
            }
            anyhow::bail!("cancelled")
        }
    }

    fn runner(generator: impl ArticleGenerator, config: RunnerConfig) -> TaskRunner {
        TaskRunner::new(config, Arc::new(generator)).unwrap()
    }

    fn request(topic: &str) -> GenerationRequest {
        GenerationRequest::new(topic, true)
    }

    async fn wait_until_idle(runner: &TaskRunner) {
        for _ in 0..200 {
            if runner.active_runs() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("runs still active: {}", runner.active_runs());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn successful_run_streams_ordered_events_and_one_terminal() {
        let runner = runner(Scripted, RunnerConfig::default());
        let ctx = RequestContext::new();
        let handle = runner.start(&request("Test"), &ctx).unwrap();
        assert_eq!(handle.request_id(), ctx.id());

        let (events, result) = handle.split();
        let events: Vec<_> = events.drain().collect().await;

        let stages: Vec<_> = events.iter().map(|e| e.stage).collect();
        assert_eq!(
            stages,
            vec![Stage::Research, Stage::Outline, Stage::Draft, Stage::Polish, Stage::Done]
        );
        let sequences: Vec<_> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2, 3, 4]);
        assert!(events.iter().all(|e| e.request_id == ctx.id()));

        let result = result.wait().await.unwrap();
        assert_eq!(result.content, "Fake result for Test");
        assert_eq!(result.topic, "Test");
        assert_eq!(result.request_id, ctx.id());

        wait_until_idle(&runner).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn await_result_returns_the_article() {
        let runner = runner(Scripted, RunnerConfig::default());
        let result = runner
            .start(&request("Test Topic"), &RequestContext::new())
            .unwrap()
            .await_result()
            .await
            .unwrap();
        assert_eq!(result.content, "Fake result for Test Topic");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failing_job_ends_with_its_error_description() {
        let runner = runner(Failing, RunnerConfig::default());
        let (events, result) = runner
            .start(&request("Test"), &RequestContext::new())
            .unwrap()
            .split();
        let events: Vec<_> = events.drain().collect().await;

        let last = events.last().unwrap();
        assert_eq!(last.stage, Stage::Error);
        assert_eq!(last.message, "search provider unavailable");
        assert_eq!(events.iter().filter(|e| e.stage.is_terminal()).count(), 1);

        let err = result.wait().await.unwrap_err();
        assert_eq!(err, Error::Pipeline("search provider unavailable".to_string()));

        wait_until_idle(&runner).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn panicking_job_fails_the_run_and_keeps_the_worker() {
        let config = RunnerConfig {
            num_workers: 1,
            ..RunnerConfig::default()
        };
        let runner = runner(Panicking, config);
        let err = runner
            .start(&request("Test"), &RequestContext::new())
            .unwrap()
            .await_result()
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "pipeline_error");
        assert!(err.description().contains("model crashed"));

        // The single worker survived the panic and takes the next run.
        let err = runner
            .start(&request("Again"), &RequestContext::new())
            .unwrap()
            .await_result()
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "pipeline_error");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn empty_article_is_resolved_from_the_store() {
        let runner = runner(ArtifactsOnly, RunnerConfig::default());
        let result = runner
            .start(&request("topic"), &RequestContext::new())
            .unwrap()
            .await_result()
            .await
            .unwrap();
        assert_eq!(result.content, "draft text");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn deadline_fails_the_run_and_cancels_the_job() {
        let config = RunnerConfig {
            run_timeout: Some(Duration::from_millis(100)),
            ..RunnerConfig::default()
        };
        let runner = runner(Endless, config);
        let (events, result) = runner
            .start(&request("Test"), &RequestContext::new())
            .unwrap()
            .split();

        let events: Vec<_> = events.drain().collect().await;
        let last = events.last().unwrap();
        assert_eq!(last.stage, Stage::Error);
        assert!(last.message.contains("maximum duration"));

        let err = result.wait().await.unwrap_err();
        assert_eq!(err.kind(), "timeout");

        // The job honours the cancelled token and gives its slot back.
        wait_until_idle(&runner).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dropped_consumer_lets_the_worker_finish() {
        let config = RunnerConfig {
            progress_buffer_size: 1,
            run_timeout: None,
            ..RunnerConfig::default()
        };
        let runner = runner(Endless, config);
        let handle = runner.start(&request("Test"), &RequestContext::new()).unwrap();
        drop(handle);

        wait_until_idle(&runner).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn admission_beyond_pool_and_queue_is_rejected() {
        let (generator, started_rx, release_tx, _calls) = gated();
        let config = RunnerConfig {
            num_workers: 1,
            queue_capacity: 1,
            ..RunnerConfig::default()
        };
        let runner = runner(generator, config);

        let first = runner.start(&request("a"), &RequestContext::new()).unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = runner.start(&request("b"), &RequestContext::new()).unwrap();

        let err = runner
            .start(&request("c"), &RequestContext::new())
            .unwrap_err();
        assert_eq!(err, Error::ServerBusy { capacity: 2 });
        assert_eq!(runner.active_runs(), 2);

        release_tx.send(()).unwrap();
        release_tx.send(()).unwrap();
        assert_eq!(first.await_result().await.unwrap().content, "a:1");
        assert_eq!(second.await_result().await.unwrap().content, "b:1");
        wait_until_idle(&runner).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_runs_get_distinct_ids_and_isolated_stores() {
        let (generator, _started_rx, release_tx, _calls) = gated();
        let runner = runner(generator, RunnerConfig::default());

        let handles: Vec<_> = (0..4)
            .map(|i| {
                runner
                    .start(&request(&format!("topic-{i}")), &RequestContext::new())
                    .unwrap()
            })
            .collect();
        let ids: HashSet<_> = handles.iter().map(RunHandle::request_id).collect();
        assert_eq!(ids.len(), 4);

        for _ in 0..4 {
            release_tx.send(()).unwrap();
        }
        for (i, handle) in handles.into_iter().enumerate() {
            // Each store only ever holds the run's own artifact.
            assert_eq!(
                handle.await_result().await.unwrap().content,
                format!("topic-{i}:1")
            );
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn oversized_artifact_fails_with_the_store_guard() {
        let config = RunnerConfig {
            max_artifact_bytes: 8,
            ..RunnerConfig::default()
        };
        let runner = runner(Oversized(64), config);
        let (events, result) = runner
            .start(&request("Test"), &RequestContext::new())
            .unwrap()
            .split();
        let events: Vec<_> = events.drain().collect().await;
        assert_eq!(events.last().unwrap().stage, Stage::Error);

        let err = result.wait().await.unwrap_err();
        assert_eq!(err.kind(), "store_capacity_exceeded");
        assert_eq!(
            err,
            Error::StoreCapacityExceeded {
                path: "t/huge.bin".to_string(),
                size: 64,
                limit: 8,
            }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn queue_time_does_not_count_against_the_deadline() {
        let (generator, started_rx, release_tx, calls) = gated();
        let config = RunnerConfig {
            num_workers: 1,
            queue_capacity: 1,
            run_timeout: Some(Duration::from_millis(100)),
            ..RunnerConfig::default()
        };
        let runner = runner(generator, config);

        let first = runner.start(&request("a"), &RequestContext::new()).unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = runner.start(&request("b"), &RequestContext::new()).unwrap();

        // The first run outlives its deadline while the second one waits.
        assert_eq!(first.await_result().await.unwrap_err().kind(), "timeout");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        release_tx.send(()).unwrap();
        release_tx.send(()).unwrap();
        assert_eq!(second.await_result().await.unwrap().content, "b:1");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        wait_until_idle(&runner).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn abandoned_queued_run_is_never_executed() {
        let (generator, started_rx, release_tx, calls) = gated();
        let config = RunnerConfig {
            num_workers: 1,
            queue_capacity: 1,
            run_timeout: None,
            ..RunnerConfig::default()
        };
        let runner = runner(generator, config);

        let first = runner.start(&request("a"), &RequestContext::new()).unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = runner.start(&request("b"), &RequestContext::new()).unwrap();
        drop(second);

        // Let the supervisor notice the disconnect and cancel the run.
        tokio::time::sleep(Duration::from_millis(50)).await;
        release_tx.send(()).unwrap();
        assert_eq!(first.await_result().await.unwrap().content, "a:1");

        wait_until_idle(&runner).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_skips_runs_still_in_the_queue() {
        let (generator, started_rx, release_tx, calls) = gated();
        let config = RunnerConfig {
            num_workers: 1,
            queue_capacity: 1,
            run_timeout: None,
            shutdown_timeout: Duration::from_millis(50),
            ..RunnerConfig::default()
        };
        let runner = runner(generator, config);

        let first = runner.start(&request("a"), &RequestContext::new()).unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = runner.start(&request("b"), &RequestContext::new()).unwrap();

        let shutdown = tokio::spawn({
            let runner = runner.clone();
            async move { runner.shutdown().await }
        });
        tokio::time::sleep(Duration::from_millis(150)).await;
        release_tx.send(()).unwrap();

        assert_eq!(first.await_result().await.unwrap().content, "a:1");
        assert_eq!(second.await_result().await.unwrap_err(), Error::Cancelled);
        shutdown.await.unwrap().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalid_topic_is_rejected_before_scheduling() {
        let runner = runner(Scripted, RunnerConfig::default());
        let err = runner
            .start(&request("   "), &RequestContext::new())
            .unwrap_err();
        assert_eq!(err.kind(), "validation_error");
        assert_eq!(runner.active_runs(), 0);
    }

    #[tokio::test]
    async fn shutdown_refuses_new_runs() {
        let runner = runner(Scripted, RunnerConfig {
            shutdown_timeout: Duration::from_millis(100),
            ..RunnerConfig::default()
        });
        runner.shutdown().await.unwrap();
        assert!(!runner.is_accepting());
        assert_eq!(
            runner
                .start(&request("late"), &RequestContext::new())
                .unwrap_err(),
            Error::ServiceShutdown
        );
    }

    #[test]
    fn zero_sized_progress_buffer_is_rejected() {
        let config = RunnerConfig {
            progress_buffer_size: 0,
            ..RunnerConfig::default()
        };
        assert!(TaskRunner::new(config, Arc::new(Scripted)).is_err());
    }
}
