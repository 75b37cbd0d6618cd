//! SSE relay from an upstream body to the client.
//!
//! A reader task splits the upstream body into newline-terminated chunks and
//! feeds them over a channel. The relay task forwards each chunk to the client
//! as soon as it arrives, mirrors it to the partial recorder, and watches an
//! idle timer that is reset on every chunk. When the relay ends, for whatever
//! reason, the completion callback receives a [`StreamSummary`].

use crate::api::disconnect::DisconnectStream;
use crate::core::metrics::get_metrics;
use crate::core::partial::PartialRecorder;
use crate::core::StreamCancelHandle;
use axum::body::{Body, Bytes};
use bytes::BytesMut;
use futures::stream::{Stream, StreamExt};
use serde_json::Value;
use std::fmt::Display;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{Instrument, Span};

const CHANNEL_CAPACITY: usize = 64;

/// How a relayed stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    /// Upstream closed the body normally.
    Clean,
    /// No chunk arrived within the idle timeout.
    IdleTimeout,
    /// Reading the upstream body failed.
    UpstreamError(String),
    /// The client stopped consuming the response.
    ClientDisconnect,
}

impl StreamEnd {
    pub fn is_clean(&self) -> bool {
        matches!(self, StreamEnd::Clean)
    }

    /// Error type recorded on the completion event, overriding the status.
    pub fn err_override(&self) -> Option<&'static str> {
        match self {
            StreamEnd::Clean => None,
            StreamEnd::IdleTimeout => Some("idle_timeout"),
            StreamEnd::UpstreamError(_) => Some("stream_error"),
            StreamEnd::ClientDisconnect => Some("client_disconnect"),
        }
    }

    /// Completion reason. Only a clean end or an idle timeout change it.
    pub fn reason(&self) -> Option<&'static str> {
        match self {
            StreamEnd::Clean => Some("streaming"),
            StreamEnd::IdleTimeout => Some("stream_timeout"),
            _ => None,
        }
    }
}

/// Outcome of one relayed stream.
#[derive(Debug, Clone)]
pub struct StreamSummary {
    pub end: StreamEnd,
    /// Dispatch to first chunk.
    pub ttft: Option<Duration>,
    /// First chunk to last chunk.
    pub stream: Duration,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub bytes: u64,
}

pub struct RelayOptions {
    pub request_id: String,
    /// Zero disables the idle timer.
    pub idle_timeout: Duration,
    pub partials_dir: Option<PathBuf>,
    /// When the upstream request was dispatched.
    pub started: Instant,
}

/// Picks token counts out of Anthropic-style SSE `data:` lines.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SseUsageScanner {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl SseUsageScanner {
    pub fn observe(&mut self, line: &[u8]) {
        let Some(data) = line.strip_prefix(b"data:") else {
            return;
        };
        let Ok(event) = serde_json::from_slice::<Value>(data.trim_ascii()) else {
            return;
        };
        let usage = match event.get("type").and_then(Value::as_str) {
            Some("message_start") => event.get("message").and_then(|m| m.get("usage")),
            _ => event.get("usage"),
        };
        let Some(usage) = usage else {
            return;
        };
        if let Some(input) = usage.get("input_tokens").and_then(Value::as_u64) {
            if input > 0 {
                self.input_tokens = input;
            }
        }
        if let Some(output) = usage.get("output_tokens").and_then(Value::as_u64) {
            if output > 0 {
                self.output_tokens = output;
            }
        }
    }
}

/// Start relaying `upstream` and return the client-facing body. `on_finish`
/// runs exactly once, after the relay has stopped and the partial capture
/// has been settled.
pub fn relay_sse<S, E, F>(upstream: S, options: RelayOptions, on_finish: F) -> Body
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
    E: Display + Send + 'static,
    F: FnOnce(StreamSummary) + Send + 'static,
{
    let (client_tx, client_rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(CHANNEL_CAPACITY);
    let cancel_handle = StreamCancelHandle::new();
    let relay_cancel = cancel_handle.clone();

    tokio::spawn(
        async move {
            let summary = run_relay(upstream, options, client_tx, relay_cancel).await;
            on_finish(summary);
        }
        .instrument(Span::current()),
    );

    let client_stream = Box::pin(futures::stream::unfold(client_rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }));
    Body::from_stream(DisconnectStream::new(client_stream, cancel_handle))
}

async fn run_relay<S, E>(
    upstream: S,
    options: RelayOptions,
    client_tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
    cancel: StreamCancelHandle,
) -> StreamSummary
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
    E: Display + Send + 'static,
{
    let (line_tx, mut line_rx) = mpsc::channel::<Result<Bytes, String>>(CHANNEL_CAPACITY);
    let reader = tokio::spawn(read_lines(upstream, line_tx).in_current_span());

    let mut recorder = match options.partials_dir.as_deref() {
        Some(dir) => PartialRecorder::create(dir, &options.request_id).await,
        None => None,
    };
    let mut scanner = SseUsageScanner::default();
    let mut first: Option<Instant> = None;
    let mut last: Option<Instant> = None;
    let mut bytes = 0u64;
    let idle_timeout = options.idle_timeout;

    let end = loop {
        let idle = async {
            if idle_timeout.is_zero() {
                std::future::pending::<()>().await
            } else {
                tokio::time::sleep(idle_timeout).await
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break StreamEnd::ClientDisconnect,
            item = line_rx.recv() => match item {
                Some(Ok(chunk)) => {
                    let now = Instant::now();
                    first.get_or_insert(now);
                    last = Some(now);
                    bytes += chunk.len() as u64;
                    scanner.observe(&chunk);
                    if let Some(recorder) = recorder.as_mut() {
                        recorder.write(&chunk).await;
                    }
                    if client_tx.send(Ok(chunk)).await.is_err() {
                        break StreamEnd::ClientDisconnect;
                    }
                }
                Some(Err(e)) => break StreamEnd::UpstreamError(e),
                None => break StreamEnd::Clean,
            },
            _ = idle => break StreamEnd::IdleTimeout,
        }
    };

    reader.abort();
    // The relay stopped on its own terms; dropping the body is not a disconnect.
    cancel.mark_completed();
    drop(client_tx);

    match &end {
        StreamEnd::Clean => {}
        StreamEnd::IdleTimeout => tracing::warn!(
            idle_ms = idle_timeout.as_millis() as u64,
            "Upstream stream idle, aborting"
        ),
        StreamEnd::UpstreamError(e) => tracing::warn!(error = %e, "Upstream stream read failed"),
        StreamEnd::ClientDisconnect => tracing::info!(bytes, "Client disconnected during stream"),
    }

    let keep = !end.is_clean();
    match recorder {
        Some(recorder) => recorder.finish(keep).await,
        None if keep => get_metrics().partial_writes.inc(),
        None => {}
    }

    StreamSummary {
        ttft: first.map(|f| f.saturating_duration_since(options.started)),
        stream: match (first, last) {
            (Some(f), Some(l)) => l.saturating_duration_since(f),
            _ => Duration::ZERO,
        },
        input_tokens: scanner.input_tokens,
        output_tokens: scanner.output_tokens,
        bytes,
        end,
    }
}

/// Split the upstream body into newline-terminated chunks. A trailing
/// partial line is flushed when the body ends.
async fn read_lines<S, E>(mut upstream: S, tx: mpsc::Sender<Result<Bytes, String>>)
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Display,
{
    let mut buffer = BytesMut::new();
    while let Some(item) = upstream.next().await {
        match item {
            Ok(bytes) => {
                buffer.extend_from_slice(&bytes);
                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line = buffer.split_to(pos + 1).freeze();
                    if tx.send(Ok(line)).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                if !buffer.is_empty() {
                    let _ = tx.send(Ok(buffer.split().freeze())).await;
                }
                let _ = tx.send(Err(e.to_string())).await;
                return;
            }
        }
    }
    if !buffer.is_empty() {
        let _ = tx.send(Ok(buffer.freeze())).await;
    }
}
