//! HTTP error responses.
//!
//! Every failure a client can observe outside of a stream becomes an
//! [`ApiError`], rendered as `{detail, kind, request_id}` with a status code
//! derived from the error class.

use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use storm_relay_core::{Error, RequestId};

/// A failed request, ready to be rendered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    detail: String,
    request_id: RequestId,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    detail: &'a str,
    kind: &'static str,
    request_id: RequestId,
}

impl ApiError {
    #[must_use]
    pub fn new(err: &Error, request_id: RequestId) -> Self {
        Self {
            status: status_for(err),
            kind: err.kind(),
            detail: err.description(),
            request_id,
        }
    }

    /// A request body that is not valid JSON or does not match the expected
    /// shape.
    #[must_use]
    pub fn malformed(rejection: &JsonRejection, request_id: RequestId) -> Self {
        Self {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            kind: "validation_error",
            detail: rejection.body_text(),
            request_id,
        }
    }

    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    #[must_use]
    pub const fn kind(&self) -> &'static str {
        self.kind
    }
}

/// Status code for each error class.
#[must_use]
pub const fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::Validation { .. } => StatusCode::BAD_REQUEST,
        Error::ServerBusy { .. } | Error::ServiceShutdown | Error::Cancelled => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        Error::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        Error::NotFound { .. } => StatusCode::NOT_FOUND,
        Error::Pipeline(_)
        | Error::StoreCapacityExceeded { .. }
        | Error::InvalidPath { .. }
        | Error::ReservedStage { .. }
        | Error::ChannelError { .. }
        | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(
                event = "request_failed",
                kind = self.kind,
                status = self.status.as_u16(),
                "{}",
                self.detail
            );
        } else {
            tracing::info!(
                event = "request_rejected",
                kind = self.kind,
                status = self.status.as_u16(),
                "{}",
                self.detail
            );
        }

        let body = ErrorBody {
            detail: &self.detail,
            kind: self.kind,
            request_id: self.request_id,
        };
        (self.status, Json(body)).into_response()
    }
}
