use crate::{
    Error, Result,
    channel::ProgressHook,
    pool::RunJob,
    store::{ArtifactStore, MemoryStore},
};
use std::{
    any::Any,
    panic::{AssertUnwindSafe, catch_unwind},
    time::Instant,
};

/// Executes one generation job on the calling worker thread.
///
/// The job runs inside the run's span so every record it logs carries the
/// request id. Whatever the outcome, the progress sender is dropped before
/// the outcome is reported, which lets the supervisor see the end of the
/// progress stream first and then the result. The store and the admission
/// lease are released on this thread once the job is over.
///
/// # Outcome mapping
///
/// - A run cancelled while it was queued is not executed and reports
///   [`Error::Cancelled`].
/// - A non-empty article is returned as is.
/// - An empty article is resolved from the artifacts left in the store.
/// - A tripped store guard keeps its [`Error::StoreCapacityExceeded`] class.
/// - Any other error, or a panic, becomes [`Error::Pipeline`] carrying its
///   description.
pub fn execute_job(worker_id: usize, job: RunJob) {
    let RunJob {
        topic,
        generator,
        store,
        progress,
        outcome,
        started,
        span,
        lease,
    } = job;
    let _entered = span.enter();

    if progress.is_cancelled() {
        tracing::info!(event = "job_skipped", worker_id, "Run was cancelled while queued");
        drop(progress);
        drop(store);
        drop(lease);
        if outcome.send(Err(Error::Cancelled)).is_err() {
            tracing::debug!("Supervisor gone before worker {worker_id} reported its outcome");
        }
        return;
    }

    tracing::debug!(event = "job_started", worker_id, "Worker {worker_id} picked up run");
    // The supervisor may already be gone; the job still runs to completion.
    let _ = started.send(());
    let started = Instant::now();

    let ran = catch_unwind(AssertUnwindSafe(|| {
        generator.run(&topic, &store, &progress)
    }));
    drop(progress);

    let result = match ran {
        Ok(Ok(article)) if article.is_empty() => resolve_article(&store),
        Ok(Ok(article)) => Ok(article),
        Ok(Err(e)) => Err(job_error(&e)),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!(event = "job_panicked", worker_id, "Generation job panicked: {message}");
            Err(Error::Pipeline(message))
        }
    };

    tracing::debug!(
        event = "job_finished",
        worker_id,
        artifacts = store.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        ok = result.is_ok(),
        "Worker {worker_id} finished run"
    );

    drop(store);
    drop(lease);

    if outcome.send(result).is_err() {
        tracing::debug!("Supervisor gone before worker {worker_id} reported its outcome");
    }
}

/// Classifies a job failure. Store guard violations keep their class, every
/// other failure is reported as the job described it.
fn job_error(err: &anyhow::Error) -> Error {
    match err.downcast_ref::<Error>() {
        Some(guard @ Error::StoreCapacityExceeded { .. }) => guard.clone(),
        _ => Error::Pipeline(format!("{err:#}")),
    }
}

/// Picks the finished article from the artifacts a job left behind.
fn resolve_article(store: &MemoryStore) -> Result<String> {
    if let Some(file) = store.find_article() {
        tracing::debug!(path = %file.path, "Resolved article from store");
        return Ok(String::from_utf8_lossy(&file.bytes).into_owned());
    }

    Err(Error::Pipeline(format!(
        "No article file found in memory. Available files: {:?}",
        store.list("")
    )))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("generation job panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("generation job panicked: {message}")
    } else {
        "generation job panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_article_falls_back_to_polished_artifact() {
        let store = MemoryStore::new();
        store.write_str("topic/storm_gen_article.txt", "draft").unwrap();
        store
            .write_str("topic/storm_gen_article_polished.txt", "polished")
            .unwrap();
        assert_eq!(resolve_article(&store).unwrap(), "polished");
    }

    #[test]
    fn missing_article_lists_available_files() {
        let store = MemoryStore::new();
        store.write_str("topic/storm_gen_outline.txt", "# outline").unwrap();
        let err = resolve_article(&store).unwrap_err();
        assert_eq!(err.kind(), "pipeline_error");
        assert!(err.description().contains("topic/storm_gen_outline.txt"));
    }

    #[test]
    fn store_guard_keeps_its_class() {
        let store = MemoryStore::with_limit(8);
        let err = anyhow::Error::from(store.write("t/huge.bin", &[0; 64]).unwrap_err());
        assert_eq!(
            job_error(&err),
            Error::StoreCapacityExceeded {
                path: "t/huge.bin".to_string(),
                size: 64,
                limit: 8,
            }
        );
    }

    #[test]
    fn other_failures_become_pipeline_errors() {
        let err = anyhow::Error::from(Error::NotFound {
            path: "t/outline.txt".to_string(),
        })
        .context("reading the outline");
        assert_eq!(
            job_error(&err),
            Error::Pipeline("reading the outline: Artifact not found: t/outline.txt".to_string())
        );
        assert_eq!(
            job_error(&anyhow::anyhow!("LM provider returned 500")),
            Error::Pipeline("LM provider returned 500".to_string())
        );
    }

    #[test]
    fn panic_payloads_are_described() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "generation job panicked: boom");
        let payload: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(payload.as_ref()), "generation job panicked");
    }
}
