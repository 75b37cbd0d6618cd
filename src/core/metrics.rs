//! Prometheus metrics for monitoring the routing proxy.
//!
//! All metrics live in the default registry behind a process-wide
//! [`OnceLock`], so handlers, background loops and tests can reach them
//! without threading a registry through the application state.

use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec,
    register_int_counter, register_int_counter_vec, CounterVec, Gauge, GaugeVec, HistogramVec,
    IntCounter, IntCounterVec,
};
use std::sync::OnceLock;

/// Container for all application metrics.
pub struct Metrics {
    /// Completed `/v1/messages` requests by final lane, op (`stream`/`nonstream`) and status.
    pub requests: IntCounterVec,
    /// End-to-end latency of completed requests.
    pub request_duration: HistogramVec,
    /// Partial stream files retained after an abnormal end.
    pub partial_writes: IntCounter,
    /// Readiness probe outcome per lane (1=reachable, 0=unreachable).
    pub upstream_ready: GaugeVec,

    pub input_tokens: IntCounterVec,
    pub output_tokens: IntCounterVec,
    pub stream_seconds: CounterVec,
    pub dirty_seconds: CounterVec,
    pub ttft: HistogramVec,

    /// Requests that went to the preferred lane while quota pressure was visible.
    pub preferred_attempt: IntCounterVec,
    /// Requests moved off the preferred lane by a quota decision or fallback.
    pub rerouted_on_limit: IntCounterVec,
    /// Milliseconds burned on first attempts that ended in a quota overshoot.
    pub wasted_retry_ms: CounterVec,

    pub store_writes: IntCounter,
    pub store_write_errors: IntCounter,
    pub rollup_duration: HistogramVec,
    pub store_size_bytes: Gauge,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Initialize the metrics registry.
///
/// This should be called once at application startup. Subsequent calls will
/// return the same instance.
pub fn init_metrics() -> &'static Metrics {
    METRICS.get_or_init(|| {
        let requests = register_int_counter_vec!(
            "ccp_requests_total",
            "Completed messages requests",
            &["lane", "op", "status"]
        )
        .expect("Failed to register requests metric");

        let request_duration = register_histogram_vec!(
            "ccp_request_duration_seconds",
            "End-to-end request latency in seconds",
            &["lane", "op"],
            vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
        )
        .expect("Failed to register request_duration metric");

        let partial_writes = register_int_counter!(
            "ccp_partial_writes_total",
            "Partial stream captures retained after abnormal termination"
        )
        .expect("Failed to register partial_writes metric");

        let upstream_ready = register_gauge_vec!(
            "ccp_upstream_ready",
            "Upstream readiness by lane (1=reachable, 0=unreachable)",
            &["lane"]
        )
        .expect("Failed to register upstream_ready metric");

        let input_tokens = register_int_counter_vec!(
            "ccp_input_tokens_total",
            "Input tokens by lane and model",
            &["lane", "model"]
        )
        .expect("Failed to register input_tokens metric");

        let output_tokens = register_int_counter_vec!(
            "ccp_output_tokens_total",
            "Output tokens by lane and model",
            &["lane", "model"]
        )
        .expect("Failed to register output_tokens metric");

        let stream_seconds = register_counter_vec!(
            "ccp_stream_seconds_total",
            "Effective streaming seconds by lane and model",
            &["lane", "model"]
        )
        .expect("Failed to register stream_seconds metric");

        let dirty_seconds = register_counter_vec!(
            "ccp_dirty_seconds_total",
            "Wall-clock request seconds by lane and model",
            &["lane", "model"]
        )
        .expect("Failed to register dirty_seconds metric");

        let ttft = register_histogram_vec!(
            "ccp_ttft_seconds",
            "Time to first byte from upstream in seconds",
            &["lane", "model"],
            vec![0.05, 0.1, 0.2, 0.5, 1.0, 2.0, 5.0, 10.0]
        )
        .expect("Failed to register ttft metric");

        let preferred_attempt = register_int_counter_vec!(
            "ccp_preferred_attempt_total",
            "Preferred lane attempted under quota pressure",
            &["lane", "model"]
        )
        .expect("Failed to register preferred_attempt metric");

        let rerouted_on_limit = register_int_counter_vec!(
            "ccp_rerouted_on_limit_total",
            "Requests rerouted away from the preferred lane",
            &["mode", "model"]
        )
        .expect("Failed to register rerouted_on_limit metric");

        let wasted_retry_ms = register_counter_vec!(
            "ccp_wasted_retry_ms_total",
            "Milliseconds spent on first attempts that hit a quota overshoot",
            &["model"]
        )
        .expect("Failed to register wasted_retry_ms metric");

        let store_writes = register_int_counter!(
            "ccp_store_writes_total",
            "Samples written to the store"
        )
        .expect("Failed to register store_writes metric");

        let store_write_errors = register_int_counter!(
            "ccp_store_write_errors_total",
            "Failed sample writes"
        )
        .expect("Failed to register store_write_errors metric");

        let rollup_duration = register_histogram_vec!(
            "ccp_rollup_duration_seconds",
            "Rollup pass duration in seconds",
            &["granularity"],
            vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
        )
        .expect("Failed to register rollup_duration metric");

        let store_size_bytes =
            register_gauge!("ccp_store_size_bytes", "Approximate sample store size")
                .expect("Failed to register store_size_bytes metric");

        Metrics {
            requests,
            request_duration,
            partial_writes,
            upstream_ready,
            input_tokens,
            output_tokens,
            stream_seconds,
            dirty_seconds,
            ttft,
            preferred_attempt,
            rerouted_on_limit,
            wasted_retry_ms,
            store_writes,
            store_write_errors,
            rollup_duration,
            store_size_bytes,
        }
    })
}

/// Get the global metrics instance, registering it on first use.
pub fn get_metrics() -> &'static Metrics {
    init_metrics()
}
