//! SSE relay through the full pipeline.

mod common;

use axum::{
    body::{Body, Bytes},
    http::StatusCode,
    response::Response,
    routing::post,
    Router,
};
use common::*;
use pretty_assertions::assert_eq;
use std::convert::Infallible;
use std::time::Duration;
use wiremock::{
    matchers::{method, path},
    Mock, ResponseTemplate,
};

const SSE_BODY: &str = concat!(
    "event: message_start\n",
    "data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":25,\"output_tokens\":1}}}\n",
    "\n",
    "event: content_block_delta\n",
    "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"hello\"}}\n",
    "\n",
    "event: message_delta\n",
    "data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":9}}\n",
    "\n",
    "event: message_stop\n",
    "data: {\"type\":\"message_stop\"}\n",
    "\n",
);

const FIRST_EVENT: &str = "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":5}}}\n\n";
const LATE_EVENT: &str = "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n";

/// An upstream that sends one event, stalls, then sends another.
async fn stalling_upstream(stall: Duration) -> String {
    let app = Router::new().route(
        "/v1/messages",
        post(move || async move {
            let chunks = futures::stream::unfold(0u8, move |step| async move {
                match step {
                    0 => Some((Ok::<_, Infallible>(Bytes::from_static(FIRST_EVENT.as_bytes())), 1)),
                    1 => {
                        tokio::time::sleep(stall).await;
                        Some((Ok(Bytes::from_static(LATE_EVENT.as_bytes())), 2))
                    }
                    _ => None,
                }
            });
            Response::builder()
                .header("content-type", "text/event-stream")
                .body(Body::from_stream(chunks))
                .unwrap()
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn test_stream_relayed_verbatim_with_usage() {
    let partials = tempfile::tempdir().unwrap();
    let dir = partials.path().to_path_buf();
    let h = harness().config(move |c| c.partials_dir = Some(dir)).start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(SSE_BODY, "text/event-stream"))
        .mount(&h.zai)
        .await;

    let reply = post_messages(&h.app, &message_body(HAIKU, true)).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(
        reply.headers.get("content-type").unwrap(),
        "text/event-stream"
    );
    assert_eq!(reply.text(), SSE_BODY);

    let completion = wait_for_completion(&h.telemetry, &reply.request_id()).await;
    assert_eq!(completion.op, "stream");
    assert_eq!(completion.status, 200);
    assert_eq!(completion.input_tokens, 25);
    assert_eq!(completion.output_tokens, 9);
    assert_eq!(completion.reason, "streaming");
    assert_eq!(completion.err_type, "");
    assert!(completion.ttft_ms <= completion.latency_ms);

    // a clean stream leaves no partial capture behind
    assert_eq!(std::fs::read_dir(partials.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_event_stream_content_type_streams_without_flag() {
    let h = harness().start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(SSE_BODY, "text/event-stream"))
        .mount(&h.anth)
        .await;

    let reply = post_messages(&h.app, &message_body(SONNET, false)).await;
    assert_eq!(reply.text(), SSE_BODY);

    let completion = wait_for_completion(&h.telemetry, &reply.request_id()).await;
    assert_eq!(completion.op, "stream");
}

#[tokio::test]
async fn test_idle_timeout_keeps_flushed_bytes() {
    let upstream = stalling_upstream(Duration::from_millis(200)).await;
    let partials = tempfile::tempdir().unwrap();
    let dir = partials.path().to_path_buf();
    let h = harness()
        .config(move |c| {
            c.zai_base_url = upstream;
            c.timeouts.sse_idle = Duration::from_millis(50);
            c.partials_dir = Some(dir);
        })
        .start()
        .await;

    let reply = post_messages(&h.app, &message_body(HAIKU, true)).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.text(), FIRST_EVENT);

    let completion = wait_for_completion(&h.telemetry, &reply.request_id()).await;
    assert_eq!(completion.reason, "stream_timeout");
    assert_eq!(completion.err_type, "idle_timeout");
    assert_eq!(completion.input_tokens, 5);

    // the interrupted stream is captured for inspection
    let kept: Vec<_> = std::fs::read_dir(partials.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(kept.len(), 1);
    assert_eq!(std::fs::read_to_string(&kept[0]).unwrap(), FIRST_EVENT);
}

#[tokio::test]
async fn test_stream_error_status_is_relayed() {
    let h = harness().start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(
            ResponseTemplate::new(529).set_body_raw(
                "event: error\ndata: {\"type\":\"error\"}\n\n",
                "text/event-stream",
            ),
        )
        .mount(&h.anth)
        .await;

    let reply = post_messages(&h.app, &message_body(SONNET, true)).await;
    assert_eq!(reply.status.as_u16(), 529);
    // streams are never retried on another lane
    assert!(h.zai.received_requests().await.unwrap().is_empty());

    let completion = wait_for_completion(&h.telemetry, &reply.request_id()).await;
    assert_eq!(completion.status, 529);
    assert_eq!(completion.err_type, "5xx");
}
