//! Unified per-request metrics recording.
//!
//! Single responsibility: convert a finished request's [`RequestStats`] into
//! Prometheus observations. Both the buffered and the streaming path end here.

use std::time::Duration;

use crate::core::metrics::get_metrics;

/// Request statistics - pure data structure.
#[derive(Debug, Clone)]
pub struct RequestStats {
    pub lane: String,
    pub model: String,
    /// `stream` or `nonstream`.
    pub op: &'static str,
    pub status: u16,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Wall-clock time from dispatch to completion.
    pub dirty: Duration,
    /// First chunk to last chunk, or `dirty` when nothing streamed.
    pub stream: Duration,
    pub ttft: Option<Duration>,
}

impl RequestStats {
    pub fn new(lane: impl Into<String>, model: impl Into<String>, op: &'static str) -> Self {
        Self {
            lane: lane.into(),
            model: model.into(),
            op,
            status: 0,
            input_tokens: 0,
            output_tokens: 0,
            dirty: Duration::ZERO,
            stream: Duration::ZERO,
            ttft: None,
        }
    }
}

/// Record all request metrics in one place.
pub fn record_request_metrics(stats: &RequestStats) {
    let metrics = get_metrics();
    let status = stats.status.to_string();

    metrics
        .requests
        .with_label_values(&[&stats.lane, stats.op, &status])
        .inc();
    metrics
        .request_duration
        .with_label_values(&[&stats.lane, stats.op])
        .observe(stats.dirty.as_secs_f64());

    let lane_model = [stats.lane.as_str(), stats.model.as_str()];
    metrics
        .dirty_seconds
        .with_label_values(&lane_model)
        .inc_by(stats.dirty.as_secs_f64());
    metrics
        .stream_seconds
        .with_label_values(&lane_model)
        .inc_by(stats.stream.as_secs_f64());

    if let Some(ttft) = stats.ttft {
        metrics
            .ttft
            .with_label_values(&lane_model)
            .observe(ttft.as_secs_f64());
        tracing::debug!(
            lane = %stats.lane,
            model = %stats.model,
            ttft_secs = format!("{:.3}", ttft.as_secs_f64()),
            "Request TTFT"
        );
    }

    if stats.input_tokens > 0 || stats.output_tokens > 0 {
        metrics
            .input_tokens
            .with_label_values(&lane_model)
            .inc_by(stats.input_tokens);
        metrics
            .output_tokens
            .with_label_values(&lane_model)
            .inc_by(stats.output_tokens);

        tracing::debug!(
            lane = %stats.lane,
            model = %stats.model,
            input_tokens = stats.input_tokens,
            output_tokens = stats.output_tokens,
            "Request tokens"
        );
    }
}
