//! Request handlers for the relay's HTTP endpoints.
//!
//! ## Responsibilities
//!
//! - Decode and validate generation requests before any worker is involved.
//! - Start runs on the shared [`TaskRunner`] and either await their result or
//!   stream their progress as NDJSON.
//! - Report liveness and load on `/health` without touching any state.

use super::error::ApiError;
use crate::server::telemetry::{
    decrement_runs_inflight, increment_progress_events, increment_requests,
    increment_run_errors, increment_runs_inflight, record_run_duration,
};
use axum::{
    Extension, Json,
    body::Body,
    extract::{State, rejection::JsonRejection},
    http::header,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use core::convert::Infallible;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use storm_relay_core::{
    GenerationRequest, RequestContext, RunHandle, StreamChunk, TaskRunner, run_chunks,
};

/// Shared state of all handlers, built once in `main`.
#[derive(Clone)]
pub struct AppState {
    runner: TaskRunner,
    started: Instant,
}

impl AppState {
    #[must_use]
    pub fn new(runner: TaskRunner) -> Self {
        Self {
            runner,
            started: Instant::now(),
        }
    }

    #[must_use]
    pub const fn runner(&self) -> &TaskRunner {
        &self.runner
    }
}

#[derive(Debug, Serialize)]
pub struct RootResponse {
    pub status: &'static str,
    pub message: &'static str,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub timestamp: DateTime<Utc>,
    /// Whole seconds since the service started.
    pub uptime: u64,
    pub active_runs: usize,
}

#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub result: String,
}

/// Body of `POST /query/stream`; streaming is implied.
#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub topic: String,
}

/// Keeps the in-flight gauge and the duration histogram in step with one
/// run, however the request ends.
struct RunMetrics {
    started: Instant,
}

impl RunMetrics {
    fn start() -> Self {
        increment_runs_inflight();
        Self {
            started: Instant::now(),
        }
    }

    /// Records one streamed chunk, counting the run as failed when the chunk
    /// carries an error.
    fn observe(&self, chunk: &StreamChunk) {
        increment_progress_events();
        if let Some(kind) = chunk.failure_kind() {
            increment_run_errors(kind);
        }
    }
}

impl Drop for RunMetrics {
    fn drop(&mut self) {
        decrement_runs_inflight();
        record_run_duration(self.started.elapsed().as_secs_f64() * 1_000.0);
    }
}

pub async fn root() -> Json<RootResponse> {
    Json(RootResponse {
        status: "ok",
        message: "STORM relay is running",
    })
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let runner = state.runner();
    let generator_ok = runner.generator_ready();
    let accepting = runner.is_accepting();
    let healthy = generator_ok && accepting;
    tracing::info!(
        event = "health_check",
        healthy,
        generator_ok,
        accepting,
        "Health check performed"
    );

    Json(HealthResponse {
        status: if healthy { "healthy" } else { "unhealthy" },
        version: env!("CARGO_PKG_VERSION"),
        timestamp: Utc::now(),
        uptime: state.started.elapsed().as_secs(),
        active_runs: runner.active_runs(),
    })
}

/// `POST /query`: waits for the article, or streams when `stream` is set.
pub async fn query(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    payload: Result<Json<GenerationRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload.map_err(|rejection| reject(&rejection, &ctx))?;
    tracing::info!(
        event = "query_request_received",
        topic = %request.topic,
        stream = request.stream,
        "Query request received"
    );
    let handle = start_run(&state, &request, &ctx)?;

    if request.stream {
        return Ok(ndjson_response(handle));
    }

    let metrics = RunMetrics::start();
    let outcome = handle.await_result().await;
    drop(metrics);

    match outcome {
        Ok(result) => Ok(Json(QueryResponse {
            result: result.content,
        })
        .into_response()),
        Err(e) => {
            increment_run_errors(e.kind());
            Err(ApiError::new(&e, ctx.id()))
        }
    }
}

/// `POST /query/stream`: streams progress and the result as NDJSON.
pub async fn query_stream(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    payload: Result<Json<StreamQuery>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(StreamQuery { topic }) = payload.map_err(|rejection| reject(&rejection, &ctx))?;
    tracing::info!(event = "stream_request_received", %topic, "Stream request received");
    let handle = start_run(&state, &GenerationRequest::new(topic, true), &ctx)?;
    Ok(ndjson_response(handle))
}

fn reject(rejection: &JsonRejection, ctx: &RequestContext) -> ApiError {
    increment_run_errors("validation_error");
    ApiError::malformed(rejection, ctx.id())
}

fn start_run(
    state: &AppState,
    request: &GenerationRequest,
    ctx: &RequestContext,
) -> Result<RunHandle, ApiError> {
    increment_requests();
    state.runner().start(request, ctx).map_err(|e| {
        increment_run_errors(e.kind());
        ApiError::new(&e, ctx.id())
    })
}

fn ndjson_response(handle: RunHandle) -> Response {
    let metrics = RunMetrics::start();
    let stream = run_chunks(handle).map(move |chunk| {
        metrics.observe(&chunk);
        Ok::<_, Infallible>(chunk.encode())
    });

    (
        [
            (header::CONTENT_TYPE, "application/x-ndjson"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}
