//! NDJSON wire encoding of a run.
//!
//! Every [`ProgressEvent`] becomes one newline-terminated JSON object, written
//! as soon as the event arrives. The terminal chunk additionally carries the
//! outcome: the [`GenerationResult`] and `"status":"completed"` after `done`,
//! or `{kind, message}` and `"status":"failed"` after `error`. Because the
//! HTTP status line is already sent by the time a run fails, the trailing
//! status is the only failure signal a streaming client gets.

use crate::{
    Error, GenerationResult, ProgressEvent, Result, Stage,
    channel::ProgressStream,
    runner::{RunHandle, RunResult},
};
use bytes::Bytes;
use core::convert::Infallible;
use futures::{Stream, StreamExt};
use serde::Serialize;

/// Final state reported by the terminal chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Failed,
}

/// Machine-readable failure attached to the terminal `error` chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkError {
    pub kind: &'static str,
    pub message: String,
}

impl From<&Error> for ChunkError {
    fn from(err: &Error) -> Self {
        Self {
            kind: err.kind(),
            message: err.description(),
        }
    }
}

/// One line of the NDJSON stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamChunk {
    #[serde(flatten)]
    pub event: ProgressEvent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<GenerationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ChunkError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
}

impl StreamChunk {
    #[must_use]
    pub const fn progress(event: ProgressEvent) -> Self {
        Self {
            event,
            result: None,
            error: None,
            status: None,
        }
    }

    #[must_use]
    pub const fn completed(event: ProgressEvent, result: GenerationResult) -> Self {
        Self {
            event,
            result: Some(result),
            error: None,
            status: Some(RunStatus::Completed),
        }
    }

    #[must_use]
    pub fn failed(event: ProgressEvent, err: &Error) -> Self {
        Self {
            event,
            result: None,
            error: Some(err.into()),
            status: Some(RunStatus::Failed),
        }
    }

    /// Error class carried by a failed terminal chunk.
    #[must_use]
    pub fn failure_kind(&self) -> Option<&'static str> {
        self.error.as_ref().map(|error| error.kind)
    }

    /// Serializes the chunk as one JSON line, including the trailing `\n`.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        match serde_json::to_vec(self) {
            Ok(mut line) => {
                line.push(b'\n');
                Bytes::from(line)
            }
            Err(e) => {
                tracing::error!(event = "chunk_encoding_failed", "Failed to encode chunk: {e}");
                fallback_line(&self.event, &e.to_string())
            }
        }
    }
}

/// A failed terminal line for a chunk that could not be serialized.
fn fallback_line(event: &ProgressEvent, reason: &str) -> Bytes {
    let line = serde_json::json!({
        "request_id": event.request_id,
        "sequence": event.sequence,
        "stage": Stage::Error,
        "message": reason,
        "timestamp": event.timestamp,
        "error": {
            "kind": Error::Internal(String::new()).kind(),
            "message": reason,
        },
        "status": RunStatus::Failed,
    });
    let mut bytes = line.to_string().into_bytes();
    bytes.push(b'\n');
    Bytes::from(bytes)
}

/// Pairs a terminal event with the run's outcome.
async fn terminal_chunk(event: ProgressEvent, result: RunResult) -> StreamChunk {
    match (event.stage, result.wait().await) {
        (Stage::Done, Ok(outcome)) => StreamChunk::completed(event, outcome),
        (_, Err(err)) => StreamChunk::failed(event, &err),
        (_, Ok(_)) => StreamChunk::failed(
            event,
            &Error::Internal("run reported an error event but succeeded".to_string()),
        ),
    }
}

enum State {
    Streaming(ProgressStream, RunResult),
    Finished,
}

/// The run's chunks as a lazy stream, ending right after the terminal chunk.
///
/// Dropping the stream drops the run's event stream, which the supervisor
/// treats as a disconnect.
pub fn run_chunks(handle: RunHandle) -> impl Stream<Item = StreamChunk> + Send + 'static {
    let (events, result) = handle.split();

    futures::stream::unfold(State::Streaming(events, result), |state| async move {
        let State::Streaming(mut events, result) = state else {
            return None;
        };

        match events.next_event().await {
            Some(event) if event.stage.is_terminal() => {
                let chunk = terminal_chunk(event, result).await;
                Some((chunk, State::Finished))
            }
            Some(event) => Some((
                StreamChunk::progress(event),
                State::Streaming(events, result),
            )),
            None => {
                // The channel closed without a terminal event; surface
                // whatever the run reported.
                let outcome: Result<GenerationResult> = result.wait().await;
                if let Err(e) = outcome {
                    tracing::warn!("Run stream closed without a terminal event: {e}");
                }
                None
            }
        }
    })
}

/// Encodes a run as a lazy stream of NDJSON lines. See [`run_chunks`].
pub fn encode_run(
    handle: RunHandle,
) -> impl Stream<Item = core::result::Result<Bytes, Infallible>> + Send + 'static {
    run_chunks(handle).map(|chunk| Ok(chunk.encode()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ArticleGenerator, ProgressHook, RequestContext, RequestId, RunnerConfig, TaskRunner,
        store::ArtifactStore,
    };
    use chrono::Utc;
    use futures::StreamExt;
    use std::sync::Arc;

    struct Stub {
        fail: bool,
    }

    impl ArticleGenerator for Stub {
        fn run(
            &self,
            topic: &str,
            _store: &dyn ArtifactStore,
            progress: &dyn ProgressHook,
        ) -> anyhow::Result<String> {
            for stage in [Stage::Research, Stage::Outline, Stage::Draft, Stage::Polish] {
                progress.emit(stage, stage.as_str())?;
            }
            if self.fail {
                anyhow::bail!("outline model refused");
            }
            Ok(format!("Fake result for {topic}"))
        }
    }

    async fn encoded_lines(fail: bool) -> Vec<serde_json::Value> {
        let runner = TaskRunner::new(RunnerConfig::default(), Arc::new(Stub { fail })).unwrap();
        let handle = runner
            .start(
                &crate::GenerationRequest::new("Test", true),
                &RequestContext::new(),
            )
            .unwrap();

        let chunks: Vec<_> = encode_run(handle).collect().await;
        chunks
            .into_iter()
            .map(|chunk| {
                let bytes = chunk.unwrap();
                assert_eq!(bytes.last(), Some(&b'\n'));
                serde_json::from_slice(&bytes).unwrap()
            })
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn completed_run_ends_with_result_chunk() {
        let lines = encoded_lines(false).await;
        let stages: Vec<_> = lines.iter().map(|l| l["stage"].as_str().unwrap()).collect();
        assert_eq!(stages, vec!["research", "outline", "draft", "polish", "done"]);

        let last = lines.last().unwrap();
        assert_eq!(last["status"], "completed");
        assert_eq!(last["result"]["content"], "Fake result for Test");
        assert!(lines[..4].iter().all(|l| l.get("status").is_none()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_run_ends_with_error_chunk() {
        let lines = encoded_lines(true).await;
        let last = lines.last().unwrap();
        assert_eq!(last["stage"], "error");
        assert_eq!(last["status"], "failed");
        assert_eq!(last["error"]["kind"], "pipeline_error");
        assert_eq!(last["error"]["message"], "outline model refused");
        assert_eq!(last["message"], "outline model refused");
        assert!(last.get("result").is_none());
    }

    fn sample_event() -> ProgressEvent {
        ProgressEvent {
            request_id: RequestId::generate(),
            sequence: 7,
            stage: Stage::Polish,
            message: "Polishing".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn only_failed_chunks_report_a_failure_kind() {
        let event = sample_event();
        assert_eq!(StreamChunk::progress(event.clone()).failure_kind(), None);

        let err = Error::StoreCapacityExceeded {
            path: "t/huge.bin".to_string(),
            size: 64,
            limit: 8,
        };
        let chunk = StreamChunk::failed(event, &err);
        assert_eq!(chunk.failure_kind(), Some("store_capacity_exceeded"));
    }

    #[test]
    fn fallback_line_is_a_failed_terminal_chunk() {
        let event = sample_event();
        let line = fallback_line(&event, "map key must be a string");
        assert_eq!(line.last(), Some(&b'\n'));

        let value: serde_json::Value = serde_json::from_slice(&line).unwrap();
        assert_eq!(value["request_id"], event.request_id.to_string());
        assert_eq!(value["sequence"], 7);
        assert_eq!(value["stage"], "error");
        assert_eq!(value["status"], "failed");
        assert_eq!(value["error"]["kind"], "internal_error");
        assert_eq!(value["error"]["message"], "map key must be a string");
    }

    #[test]
    fn progress_chunk_is_a_flat_event() {
        let event = ProgressEvent {
            request_id: RequestId::generate(),
            sequence: 3,
            stage: Stage::Draft,
            message: "Writing".to_string(),
            timestamp: Utc::now(),
        };
        let line = StreamChunk::progress(event.clone()).encode();
        let value: serde_json::Value = serde_json::from_slice(&line).unwrap();
        assert_eq!(value["sequence"], 3);
        assert_eq!(value["stage"], "draft");
        assert_eq!(value["request_id"], event.request_id.to_string());
        assert_eq!(value.as_object().unwrap().len(), 5);
    }
}
