//! Request-scoped tracing.
//!
//! Every `/v1/messages` request runs inside a `request` span that carries its
//! id and the lane currently serving it. Log lines emitted under the span,
//! including those from the spawned SSE relay, inherit both fields. The lane
//! field is rewritten when a fallback moves the request to the other lane.

use tracing::Span;

/// Generate a new unique request ID using UUID v4.
pub fn generate_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Span for one request. `lane` stays empty until [`record_lane`] fills it.
pub fn request_span(request_id: &str) -> Span {
    tracing::info_span!("request", request_id = %request_id, lane = tracing::field::Empty)
}

/// Point the request span at the lane now serving the request.
pub fn record_lane(span: &Span, lane: &str) {
    span.record("lane", lane);
}
