//! The `/v1/messages` pipeline.
//!
//! A request moves through [`RequestPhase`]s: the router and license gate
//! pick a lane and a decision event is written; the request is dispatched;
//! the response is either relayed as SSE or buffered; a buffered failure may
//! trigger one fallback to the other lane; finally exactly one completion
//! event, ledger sample, metric observation and store sample are recorded.
//!
//! A request never reaches an upstream more than twice. The 401 header flip,
//! the network fallback and the status fallback share that budget.

use crate::api::state::AppState;
use crate::api::streaming::{relay_sse, RelayOptions, StreamSummary};
use crate::api::upstream::{backfill_tokens, build_upstream_headers, from_reqwest_headers, to_reqwest_headers};
use crate::core::error::{AppError, Result};
use crate::core::logging::{generate_request_id, record_lane, request_span};
use crate::core::metrics::get_metrics;
use crate::core::stream_metrics::{record_request_metrics, RequestStats};
use crate::services::lane::{HeaderMode, Lane};
use crate::services::license::LICENSE_BLOCK;
use crate::services::quota::{unix_seconds, QuotaDecisionInfo, UsageSample};
use crate::services::router::{RerouteDecision, RerouteMode, QUOTA_PASS, QUOTA_RUN_TO_LIMIT, QUOTA_WARN_ATTEMPT};
use crate::services::store::StoredSample;
use crate::services::telemetry::{AnomalyRecord, UsageEntry, EVENT_DECISION};
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use rand::Rng;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{Instrument, Span};

pub const REQUEST_ID_HEADER: &str = "x-ccp-request-id";

pub const FALLBACK: &str = "fallback";
pub const QUOTA_OVERSHOOT: &str = "quota_overshoot";
pub const NET_FALLBACK: &str = "net_fallback";

const DISPATCH_BUDGET: u8 = 2;
const SSE_CONTENT_TYPE: &str = "text/event-stream";

/// Lifecycle of one `/v1/messages` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    Received,
    Decided,
    Dispatched,
    Streaming,
    Buffering,
    FallbackTriggered,
    FallbackDispatched,
    Completed,
}

#[derive(Debug, thiserror::Error)]
enum DispatchError {
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    #[error("no response headers within {0:?}")]
    HeaderTimeout(Duration),
}

/// Label written to `decision`/`decision_reason` of the first decision event.
pub fn decision_label(
    paused: bool,
    manual_override: bool,
    lane: Lane,
    license_block: Option<&'static str>,
    quota_decision: &str,
) -> &'static str {
    let mut label = if paused {
        "failover_paused"
    } else if manual_override {
        "manual_override"
    } else if lane.is_offload() {
        "forced_model"
    } else {
        "pass_through"
    };
    if let Some(block) = license_block {
        label = block;
    }
    if !quota_decision.is_empty() && quota_decision != QUOTA_PASS {
        label = static_decision(quota_decision);
    }
    label
}

fn static_decision(decision: &str) -> &'static str {
    use crate::services::router::*;
    match decision {
        QUOTA_COOLDOWN => QUOTA_COOLDOWN,
        QUOTA_BLOCK => QUOTA_BLOCK,
        QUOTA_PREEMPTIVE_WARN => QUOTA_PREEMPTIVE_WARN,
        QUOTA_PREEMPTIVE_PASS => QUOTA_PREEMPTIVE_PASS,
        QUOTA_WARN_ATTEMPT => QUOTA_WARN_ATTEMPT,
        QUOTA_RUN_TO_LIMIT => QUOTA_RUN_TO_LIMIT,
        _ => QUOTA_PASS,
    }
}

/// Completion error type: an explicit override, else derived from the status.
pub fn error_type(status: u16, err_override: Option<&'static str>) -> &'static str {
    if let Some(e) = err_override {
        return e;
    }
    match status {
        401 => "401",
        429 => "429",
        s if s >= 500 => "5xx",
        s if s >= 400 => "4xx",
        _ => "",
    }
}

/// Final numbers of one request, handed to completion accounting.
struct Outcome {
    status: u16,
    op: &'static str,
    input_tokens: u64,
    output_tokens: u64,
    /// Zero means nothing streamed; wall-clock latency is used instead.
    stream: Duration,
    ttft: Option<Duration>,
    err_override: Option<&'static str>,
    reason: &'static str,
    backoff_ms: u64,
}

/// Per-request state shared by every phase.
struct Exchange {
    state: Arc<AppState>,
    rid: String,
    model: String,
    stream: bool,
    body: Bytes,
    client_headers: HeaderMap,
    info: QuotaDecisionInfo,
    reroute: RerouteDecision,
    decision: &'static str,
    lane: Lane,
    phase: RequestPhase,
    dispatches: u8,
    retried: bool,
    wasted_retry_ms: i64,
    fallback_reason: Option<&'static str>,
    started: Instant,
    dispatched_at: Instant,
    span: Span,
}

impl Exchange {
    fn advance(&mut self, phase: RequestPhase) {
        tracing::trace!(from = ?self.phase, to = ?phase, "phase");
        self.phase = phase;
    }

    fn h2(&self) -> bool {
        !self.state.config.force_h1
    }

    fn budget_left(&self) -> bool {
        self.dispatches < DISPATCH_BUDGET
    }

    /// Telemetry fields shared by decision and completion events.
    fn base_entry(&self, lane: Lane) -> UsageEntry {
        UsageEntry {
            ts: unix_seconds(Utc::now()),
            rid: self.rid.clone(),
            lane: lane.as_str().to_string(),
            model: self.model.clone(),
            upstream: lane.upstream_label().to_string(),
            h2: self.h2(),
            rolling_used_tokens: self.info.rolling_used,
            rolling_capacity_tokens: self.info.rolling_capacity,
            weekly_used_tokens: self.info.weekly_used,
            weekly_capacity_tokens: self.info.weekly_capacity,
            headroom_pct_rolling: self.reroute.headroom_rolling,
            headroom_pct_weekly: self.reroute.headroom_weekly,
            warn_pct_config: self.info.warn_pct_config,
            warn_pct_auto: self.info.warn_pct_auto,
            warn_pct_confidence: self.info.warn_confidence,
            gap_seconds_p50: self.info.gap_seconds_p50,
            gap_seconds_p95: self.info.gap_seconds_p95,
            gap_samples: self.info.gap_samples,
            reroute_mode: self.reroute.mode.as_str().to_string(),
            preferred_attempt: self.reroute.preferred_attempt,
            cooldown_active: self.reroute.cooldown_active,
            cooldown_next_ts: self.reroute.cooldown_next_ts(),
            ..Default::default()
        }
    }

    fn emit_decision(&self, lane: Lane, label: &'static str, reroute_decision: &str, header_mode: &str) {
        let entry = UsageEntry {
            status: -1,
            event: EVENT_DECISION.to_string(),
            decision: label.to_string(),
            decision_reason: label.to_string(),
            reroute_decision: reroute_decision.to_string(),
            header_mode: header_mode.to_string(),
            ..self.base_entry(lane)
        };
        tracing::info!(
            lane = %lane,
            model = %self.model,
            decision = label,
            reroute = reroute_decision,
            "Routing decision"
        );
        self.state.telemetry.record(&entry);
    }

    /// Send the client body to `lane`. `mode` overrides the lane's header mode.
    async fn send(
        &mut self,
        lane: Lane,
        mode: Option<HeaderMode>,
    ) -> std::result::Result<reqwest::Response, DispatchError> {
        let endpoint = self.state.lanes.get(lane);
        let headers = build_upstream_headers(
            &self.client_headers,
            &self.state.config.anthropic_version,
            endpoint.headers.as_ref(),
            mode,
        );
        let client = self.state.clients.for_request(self.stream);
        let request = client
            .post(endpoint.messages_url())
            .headers(to_reqwest_headers(&headers))
            .body(self.body.clone());

        self.dispatches += 1;
        self.dispatched_at = Instant::now();
        tracing::debug!(
            lane = %lane,
            attempt = self.dispatches,
            url = %endpoint.messages_url(),
            "Dispatching upstream request"
        );

        let header_timeout = self.state.clients.header_timeout;
        if self.stream && !header_timeout.is_zero() {
            match tokio::time::timeout(header_timeout, request.send()).await {
                Ok(result) => Ok(result?),
                Err(_) => Err(DispatchError::HeaderTimeout(header_timeout)),
            }
        } else {
            Ok(request.send().await?)
        }
    }

    /// Record a second decision event and move the request to `alt`.
    fn begin_fallback(&mut self, alt: Lane, reason: &'static str) {
        self.advance(RequestPhase::FallbackTriggered);
        self.reroute.selected_lane = alt;
        self.reroute.preferred_attempt = false;
        self.reroute.decision = reason;
        get_metrics()
            .rerouted_on_limit
            .with_label_values(&[self.reroute.mode.as_str(), &self.model])
            .inc();
        let header_mode = self.state.lanes.get(alt).header_mode_label();
        self.emit_decision(alt, reason, reason, header_mode);
        self.decision = reason;
        self.fallback_reason = Some(reason);
        self.lane = alt;
        record_lane(&self.span, alt.as_str());
    }

    /// A dispatch failed at the transport level: account for it and answer 502.
    fn transport_failure(&mut self, err: DispatchError) -> AppError {
        tracing::warn!(error = %err, "Upstream request failed");
        self.complete(Outcome {
            status: StatusCode::BAD_GATEWAY.as_u16(),
            op: if self.stream { "stream" } else { "nonstream" },
            input_tokens: 0,
            output_tokens: 0,
            stream: Duration::ZERO,
            ttft: None,
            err_override: None,
            reason: "upstream_error",
            backoff_ms: 0,
        });
        AppError::Upstream(err.to_string())
    }

    /// Completion accounting. Runs once per request.
    fn complete(&mut self, outcome: Outcome) {
        if self.phase == RequestPhase::Completed {
            return;
        }
        self.advance(RequestPhase::Completed);
        let state = self.state.clone();
        let latency = self.started.elapsed();
        let stream = if outcome.stream.is_zero() {
            latency
        } else {
            outcome.stream
        };

        if self.reroute.mode != RerouteMode::RunToCap {
            let (active, until) = state.cooldowns.info(&self.model);
            if active {
                self.reroute.cooldown_active = true;
                self.reroute.cooldown_until = until;
            }
        }
        if self.reroute.decision == QUOTA_OVERSHOOT && self.wasted_retry_ms > 0 {
            get_metrics()
                .wasted_retry_ms
                .with_label_values(&[&self.model])
                .inc_by(self.wasted_retry_ms as f64);
        }

        let err_type = error_type(outcome.status, outcome.err_override);
        let header_mode = state.lanes.get(self.lane).header_mode_label();
        let entry = UsageEntry {
            input_tokens: outcome.input_tokens,
            output_tokens: outcome.output_tokens,
            status: i32::from(outcome.status),
            reason: outcome.reason.to_string(),
            op: outcome.op.to_string(),
            latency_ms: latency.as_millis() as u64,
            stream_ms: stream.as_millis() as u64,
            ttft_ms: outcome.ttft.map(|t| t.as_millis() as u64).unwrap_or(0),
            err_type: err_type.to_string(),
            header_mode: header_mode.to_string(),
            retry: self.retried,
            backoff_ms: outcome.backoff_ms,
            decision_reason: self.decision.to_string(),
            reroute_decision: self.reroute.decision.to_string(),
            wasted_retry_ms: self.wasted_retry_ms,
            ..self.base_entry(self.lane)
        };
        state.telemetry.record(&entry);

        state.ledger.record_usage(
            UsageSample::new(
                self.model.clone(),
                outcome.input_tokens,
                outcome.output_tokens,
                latency,
                stream,
                outcome.ttft,
            )
            .with_outcome(
                self.lane.as_str(),
                outcome.status,
                outcome.reason,
                self.reroute.mode.as_str(),
            ),
        );

        record_request_metrics(&RequestStats {
            lane: self.lane.as_str().to_string(),
            model: self.model.clone(),
            op: outcome.op,
            status: outcome.status,
            input_tokens: outcome.input_tokens,
            output_tokens: outcome.output_tokens,
            dirty: latency,
            stream,
            ttft: outcome.ttft,
        });

        if let Some(store) = state.store.as_ref() {
            let sample = StoredSample {
                ts: entry.ts,
                rid: self.rid.clone(),
                model: self.model.clone(),
                lane: self.lane.as_str().to_string(),
                op: outcome.op.to_string(),
                input_tokens: outcome.input_tokens,
                output_tokens: outcome.output_tokens,
                dirty_s: latency.as_secs_f64(),
                stream_s: stream.as_secs_f64(),
                ttft_ms: entry.ttft_ms,
                status: outcome.status,
                err_type: outcome.err_override.unwrap_or_default().to_string(),
                decision: self.decision.to_string(),
                reroute_mode: self.reroute.mode.as_str().to_string(),
                warn_pct_auto: self.info.warn_pct_auto,
                gap_seconds_p50: self.info.gap_seconds_p50,
                gap_seconds_p95: self.info.gap_seconds_p95,
                gap_samples: self.info.gap_samples,
                upstream: self.lane.upstream_label().to_string(),
                h2: self.h2(),
                header_mode: header_mode.to_string(),
            };
            match store.write_sample(sample) {
                Ok(()) => get_metrics().store_writes.inc(),
                Err(e) => {
                    get_metrics().store_write_errors.inc();
                    tracing::warn!("Store write failed: {:#}", e);
                }
            }
        }

        tracing::info!(
            model = %self.model,
            status = outcome.status,
            op = outcome.op,
            reason = outcome.reason,
            latency_ms = latency.as_millis() as u64,
            input_tokens = outcome.input_tokens,
            output_tokens = outcome.output_tokens,
            "Request completed"
        );
    }
}

/// `POST /v1/messages`.
pub async fn messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let rid = generate_request_id();
    let span = request_span(&rid);
    let planned = span.in_scope(|| plan(state, headers, body, rid.clone(), span.clone()));
    let mut response = match planned {
        Ok(exchange) => run(exchange)
            .instrument(span)
            .await
            .unwrap_or_else(IntoResponse::into_response),
        Err(e) => e.into_response(),
    };
    if let Ok(value) = HeaderValue::from_str(&rid) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Parse the request, decide the lane and write the decision event.
fn plan(
    state: Arc<AppState>,
    client_headers: HeaderMap,
    body: Bytes,
    rid: String,
    span: Span,
) -> Result<Exchange> {
    let parsed: Value =
        serde_json::from_slice(&body).map_err(|e| AppError::BadRequest(format!("invalid json: {e}")))?;
    let Some(object) = parsed.as_object() else {
        return Err(AppError::BadRequest("request body must be a JSON object".into()));
    };
    let model = object
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let stream = object.get("stream").and_then(Value::as_bool).unwrap_or(false);

    let choice = state.router.decide_lane(&model);
    let info = state.ledger.decision_info(&model);
    let mut reroute = state.router.build_reroute_decision(&model, choice.lane, &info);

    let (lane, license_block) = state.license.enforce(reroute.selected_lane);
    if lane != reroute.selected_lane {
        reroute.selected_lane = lane;
        reroute.preferred_attempt = lane == reroute.preferred_lane;
    }
    record_lane(&span, lane.as_str());
    let quota_decision = reroute.decision;
    let label = decision_label(
        state.router.settings().paused,
        choice.manual_override,
        lane,
        license_block,
        quota_decision,
    );

    let metrics = get_metrics();
    if reroute.preferred_attempt && (quota_decision == QUOTA_RUN_TO_LIMIT || quota_decision == QUOTA_WARN_ATTEMPT) {
        metrics
            .preferred_attempt
            .with_label_values(&[reroute.selected_lane.as_str(), &model])
            .inc();
    }
    if !reroute.preferred_attempt && quota_decision != QUOTA_PASS {
        metrics
            .rerouted_on_limit
            .with_label_values(&[reroute.mode.as_str(), &model])
            .inc();
    }

    let now = Instant::now();
    let mut exchange = Exchange {
        state: state.clone(),
        rid,
        model,
        stream,
        body,
        client_headers,
        info,
        reroute,
        decision: label,
        lane,
        phase: RequestPhase::Received,
        dispatches: 0,
        retried: false,
        wasted_retry_ms: 0,
        fallback_reason: None,
        started: now,
        dispatched_at: now,
        span,
    };

    let header_mode = if license_block == Some(LICENSE_BLOCK) {
        ""
    } else {
        state.lanes.get(lane).header_mode_label()
    };
    exchange.emit_decision(lane, label, quota_decision, header_mode);
    exchange.advance(RequestPhase::Decided);
    Ok(exchange)
}

async fn run(mut ex: Exchange) -> Result<Response> {
    let state = ex.state.clone();

    let first_lane = ex.lane;
    let mut response = match ex.send(first_lane, None).await {
        Ok(response) => response,
        Err(err) if first_lane == Lane::Zai && state.config.net_fallback && ex.budget_left() => {
            tracing::warn!(error = %err, "Offload lane unreachable, falling back");
            ex.begin_fallback(Lane::Anthropic, NET_FALLBACK);
            ex.advance(RequestPhase::FallbackDispatched);
            match ex.send(Lane::Anthropic, None).await {
                Ok(response) => response,
                Err(err) => return Err(ex.transport_failure(err)),
            }
        }
        Err(err) => return Err(ex.transport_failure(err)),
    };
    if ex.phase == RequestPhase::Decided {
        ex.advance(RequestPhase::Dispatched);
    }

    if ex.lane == Lane::Zai
        && response.status().as_u16() == 401
        && !ex.stream
        && ex.budget_left()
    {
        let configured = state.config.zai_header_mode;
        tracing::info!(
            from = %configured,
            to = %configured.flip(),
            "Offload lane rejected credentials, retrying with flipped header mode"
        );
        ex.retried = true;
        response = match ex.send(Lane::Zai, Some(configured.flip())).await {
            Ok(response) => response,
            Err(err) => return Err(ex.transport_failure(err)),
        };
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    if ex.stream || content_type.contains(SSE_CONTENT_TYPE) {
        stream_response(ex, response, content_type)
    } else {
        buffered_response(ex, response).await
    }
}

fn stream_response(mut ex: Exchange, response: reqwest::Response, content_type: String) -> Result<Response> {
    ex.advance(RequestPhase::Streaming);
    let status = StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let upstream_headers = from_reqwest_headers(response.headers());
    let options = RelayOptions {
        request_id: ex.rid.clone(),
        idle_timeout: ex.state.config.timeouts.sse_idle,
        partials_dir: ex.state.config.partials_dir.clone(),
        started: ex.dispatched_at,
    };

    let upstream = Box::pin(response.bytes_stream());
    let body = relay_sse(upstream, options, move |summary: StreamSummary| {
        let extractor = ex.state.lanes.get(ex.lane).tokens.as_ref();
        let (input_tokens, output_tokens) = backfill_tokens(
            extractor,
            &upstream_headers,
            &[],
            summary.input_tokens,
            summary.output_tokens,
        );
        let reason = summary
            .end
            .reason()
            .or(ex.fallback_reason)
            .unwrap_or("ok");
        ex.complete(Outcome {
            status: status.as_u16(),
            op: "stream",
            input_tokens,
            output_tokens,
            stream: summary.stream,
            ttft: summary.ttft,
            err_override: summary.end.err_override(),
            reason,
            backoff_ms: 0,
        });
    });

    let mut builder = Response::builder().status(status);
    if !content_type.is_empty() {
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }
    builder
        .body(body)
        .map_err(|e| AppError::Internal(format!("failed to build stream response: {e}")))
}

/// Read a whole upstream body; a read failure counts as a transport failure.
async fn read_body(
    response: reqwest::Response,
) -> std::result::Result<(StatusCode, HeaderMap, Bytes), DispatchError> {
    let status = StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let headers = from_reqwest_headers(response.headers());
    let bytes = response.bytes().await?;
    Ok((status, headers, bytes))
}

async fn buffered_response(mut ex: Exchange, response: reqwest::Response) -> Result<Response> {
    ex.advance(RequestPhase::Buffering);
    let state = ex.state.clone();

    let (mut status, mut headers, mut bytes) = match read_body(response).await {
        Ok(parts) => parts,
        Err(err) => return Err(ex.transport_failure(err)),
    };

    let code = status.as_u16();
    let trigger = code >= 500 || (code == 429 && ex.lane == Lane::Zai);
    if trigger {
        let reason = if code == 429 && ex.lane == Lane::Zai {
            state.cooldowns.mark(&ex.model);
            state.ledger.note_quota_429(&ex.model);
            QUOTA_OVERSHOOT
        } else {
            FALLBACK
        };
        let (alt, _) = state.license.enforce(state.router.fallback_lane(ex.lane));

        if alt != ex.lane && ex.budget_left() {
            ex.wasted_retry_ms = ex.started.elapsed().as_millis() as i64;
            if reason == QUOTA_OVERSHOOT && ex.reroute.mode != RerouteMode::RunToCap {
                let (active, until) = state.cooldowns.info(&ex.model);
                ex.reroute.cooldown_active = true;
                ex.reroute.cooldown_until = if active {
                    until
                } else {
                    chrono::Duration::from_std(state.config.quota_cooldown)
                        .ok()
                        .map(|d| Utc::now() + d)
                };
            }
            tracing::warn!(
                from = %ex.lane,
                to = %alt,
                status = code,
                reason,
                "Upstream failed, falling back"
            );
            ex.begin_fallback(alt, reason);
            ex.advance(RequestPhase::FallbackDispatched);

            let second = match ex.send(alt, None).await {
                Ok(response) => response,
                Err(err) => return Err(ex.transport_failure(err)),
            };
            (status, headers, bytes) = match read_body(second).await {
                Ok(parts) => parts,
                Err(err) => return Err(ex.transport_failure(err)),
            };
        }
    }

    let extractor = state.lanes.get(ex.lane).tokens.as_ref();
    let (input_tokens, output_tokens) = backfill_tokens(extractor, &headers, &bytes, 0, 0);

    let mut backoff_ms = 0;
    let final_code = status.as_u16();
    if state.config.backoff_simulation && ex.lane == Lane::Zai && (final_code == 429 || final_code == 503) {
        let delay = Duration::from_millis(rand::thread_rng().gen_range(200..600));
        backoff_ms = delay.as_millis() as u64;
        state.telemetry.anomaly(&AnomalyRecord {
            ts: unix_seconds(Utc::now()),
            rid: ex.rid.clone(),
            event: "backoff".to_string(),
            status: final_code,
            delay_s: delay.as_secs_f64(),
            lane: ex.lane.as_str().to_string(),
            model: ex.model.clone(),
        });
        tokio::time::sleep(delay).await;
    }

    ex.complete(Outcome {
        status: final_code,
        op: "nonstream",
        input_tokens,
        output_tokens,
        stream: Duration::ZERO,
        ttft: None,
        err_override: None,
        reason: ex.fallback_reason.unwrap_or("ok"),
        backoff_ms,
    });

    let mut builder = Response::builder().status(status);
    if let Some(content_type) = headers.get(header::CONTENT_TYPE) {
        builder = builder.header(header::CONTENT_TYPE, content_type.clone());
    }
    builder
        .body(Body::from(bytes))
        .map_err(|e| AppError::Internal(format!("failed to build response: {e}")))
}
