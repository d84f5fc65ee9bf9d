use axum::{
    extract::Request,
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use storm_relay_core::RequestContext;
use tracing::Instrument;

/// HTTP header carrying the request id on every response.
pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Middleware that assigns every request its correlation id.
///
/// This middleware:
/// 1. Generates a fresh [`RequestContext`] before any handler runs. An
///    incoming `x-request-id` header is ignored.
/// 2. Inserts the context into the request extensions for handlers.
/// 3. Runs the rest of the stack inside a `request` span carrying
///    `request_id`, so every record logged on behalf of the request has it.
/// 4. Echoes the id in the `x-request-id` response header.
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let ctx = RequestContext::new();
    let request_id = ctx.id();
    let span = tracing::info_span!(
        "request",
        %request_id,
        method = %request.method(),
        path = %request.uri().path(),
    );

    request.extensions_mut().insert(ctx.clone());

    let mut response = async {
        tracing::info!(event = "request_received", "Request received");
        let response = next.run(request).await;
        tracing::info!(
            event = "request_completed",
            status = response.status().as_u16(),
            elapsed_ms = ctx.elapsed().as_millis() as u64,
            "Request completed"
        );
        response
    }
    .instrument(span)
    .await;

    if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    response
}
