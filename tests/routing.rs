//! Routing decisions observed end to end: lane choice, decision labels,
//! quota-driven reroutes and request hygiene.

mod common;

use axum::http::StatusCode;
use ccp_proxy::services::{RerouteMode, Store, UsageSample};
use common::*;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::time::Duration;
use wiremock::{
    matchers::{header, method, path},
    Mock, ResponseTemplate,
};

fn record(h: &Harness, model: &str, tokens: u64) {
    h.state.ledger.record_usage(UsageSample::new(
        model,
        tokens,
        0,
        Duration::from_secs(1),
        Duration::from_secs(1),
        None,
    ));
}

async fn mount_ok(server: &wiremock::MockServer, text: &str) {
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(anthropic_reply(text)))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_haiku_goes_to_offload_with_lane_key() {
    let h = harness().start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", ZAI_KEY))
        .respond_with(ResponseTemplate::new(200).set_body_json(anthropic_reply("from zai")))
        .expect(1)
        .mount(&h.zai)
        .await;

    let reply = post_messages(&h.app, &message_body(HAIKU, false)).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.json()["content"][0]["text"], "from zai");

    let rid = reply.request_id();
    assert!(!rid.is_empty());
    let entries = h.telemetry.entries_for(&rid);
    assert_eq!(entries.len(), 2);
    assert!(entries[0].is_decision());
    assert_eq!(entries[0].status, -1);
    assert_eq!(entries[0].decision, "forced_model");
    assert_eq!(entries[0].upstream, "zai");
    assert_eq!(entries[0].header_mode, "x-api-key");
    assert_eq!(entries[1].lane, "zai");
    assert_eq!(entries[1].status, 200);
    assert_eq!(entries[1].input_tokens, 12);
    assert_eq!(entries[1].output_tokens, 7);
    assert_eq!(entries[1].op, "nonstream");

    // client credentials never reach the offload lane
    let received = h.zai.received_requests().await.unwrap();
    assert!(received[0].headers.get("authorization").is_none());
}

#[tokio::test]
async fn test_sonnet_passes_through_with_client_token() {
    let h = harness().start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("authorization", "Bearer client-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(anthropic_reply("from anth")))
        .expect(1)
        .mount(&h.anth)
        .await;

    let reply = post_messages(&h.app, &message_body(SONNET, false)).await;
    assert_eq!(reply.status, StatusCode::OK);

    let decision = &h.telemetry.entries_for(&reply.request_id())[0];
    assert_eq!(decision.decision, "pass_through");
    assert_eq!(decision.lane, "anthropic");
    assert_eq!(decision.upstream, "anth");
    assert_eq!(decision.header_mode, "");
}

#[tokio::test]
async fn test_quota_block_reroutes_to_default_lane() {
    let h = harness().quotas(rolling_quota(HAIKU, 100, 0.0)).start().await;
    mount_ok(&h.anth, "default lane").await;
    record(&h, HAIKU, 60);
    record(&h, HAIKU, 60);

    let reply = post_messages(&h.app, &message_body(HAIKU, false)).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.json()["content"][0]["text"], "default lane");
    assert!(h.zai.received_requests().await.unwrap().is_empty());

    let entries = h.telemetry.entries_for(&reply.request_id());
    assert_eq!(entries[0].decision, "quota_block");
    assert_eq!(entries[0].reroute_decision, "quota_block");
    assert_eq!(entries[0].lane, "anthropic");
    assert!(!entries[0].preferred_attempt);
    assert_eq!(entries[0].rolling_used_tokens, 120);
    assert_eq!(entries[0].rolling_capacity_tokens, 100);
    assert_eq!(entries[1].lane, "anthropic");
}

#[tokio::test]
async fn test_preemptive_warn_reroutes_early() {
    let h = harness()
        .quotas(rolling_quota(HAIKU, 100, 0.6))
        .config(|c| c.reroute_mode = RerouteMode::Preemptive)
        .start()
        .await;
    mount_ok(&h.anth, "default lane").await;
    record(&h, HAIKU, 85);

    let reply = post_messages(&h.app, &message_body(HAIKU, false)).await;
    assert_eq!(reply.status, StatusCode::OK);

    let decision = &h.telemetry.entries_for(&reply.request_id())[0];
    assert_eq!(decision.decision, "quota_preemptive_warn");
    assert_eq!(decision.lane, "anthropic");
    assert_eq!(decision.reroute_mode, "preemptive");
}

#[tokio::test]
async fn test_run_to_cap_stays_on_offload() {
    let h = harness()
        .quotas(rolling_quota(HAIKU, 100, 0.6))
        .config(|c| c.reroute_mode = RerouteMode::RunToCap)
        .start()
        .await;
    mount_ok(&h.zai, "offload").await;
    record(&h, HAIKU, 85);

    let reply = post_messages(&h.app, &message_body(HAIKU, false)).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.json()["content"][0]["text"], "offload");

    let decision = &h.telemetry.entries_for(&reply.request_id())[0];
    assert_eq!(decision.decision, "quota_run_to_limit");
    assert_eq!(decision.lane, "zai");
    assert!(decision.preferred_attempt);
}

#[tokio::test]
async fn test_license_block_forces_default_lane() {
    let h = harness().unlicensed().start().await;
    mount_ok(&h.anth, "default lane").await;

    let reply = post_messages(&h.app, &message_body(HAIKU, false)).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert!(h.zai.received_requests().await.unwrap().is_empty());

    let decision = &h.telemetry.entries_for(&reply.request_id())[0];
    assert_eq!(decision.decision, "license_block");
    assert_eq!(decision.lane, "anthropic");
    assert_eq!(decision.header_mode, "");

    // the offload key stays off the default lane
    let received = h.anth.received_requests().await.unwrap();
    assert!(received[0].headers.get("x-api-key").is_none());
}

#[tokio::test]
async fn test_paused_routes_everything_to_default() {
    let h = harness().config(|c| c.paused = true).start().await;
    mount_ok(&h.anth, "paused").await;

    let reply = post_messages(&h.app, &message_body(HAIKU, false)).await;
    assert_eq!(reply.status, StatusCode::OK);
    let decision = &h.telemetry.entries_for(&reply.request_id())[0];
    assert_eq!(decision.decision, "failover_paused");
    assert_eq!(decision.lane, "anthropic");
}

#[tokio::test]
async fn test_manual_override_pins_lane() {
    let h = harness()
        .config(|c| c.manual_model = Some(HAIKU.to_string()))
        .start()
        .await;
    mount_ok(&h.zai, "pinned").await;

    let reply = post_messages(&h.app, &message_body(SONNET, false)).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.json()["content"][0]["text"], "pinned");

    let decision = &h.telemetry.entries_for(&reply.request_id())[0];
    assert_eq!(decision.decision, "manual_override");
    assert_eq!(decision.lane, "zai");
    // telemetry keys on the model the client asked for
    assert_eq!(decision.model, SONNET);
}

#[tokio::test]
async fn test_hop_by_hop_headers_stripped_and_version_forwarded() {
    let h = harness().start().await;
    mount_ok(&h.anth, "ok").await;

    let reply = post_messages_with(
        &h.app,
        &message_body(SONNET, false),
        &[
            ("authorization", "Bearer client-token"),
            ("x-api-key", "client-key"),
            ("connection", "keep-alive"),
            ("anthropic-version", "2024-10-22"),
            ("anthropic-beta", "tools-2024"),
        ],
    )
    .await;
    assert_eq!(reply.status, StatusCode::OK);

    let received = h.anth.received_requests().await.unwrap();
    let headers = &received[0].headers;
    assert!(headers.get("connection").is_none());
    assert!(headers.get("x-api-key").is_none());
    assert_eq!(headers.get("anthropic-version").unwrap(), "2024-10-22");
    assert_eq!(headers.get("anthropic-beta").unwrap(), "tools-2024");
    assert_eq!(headers.get("accept-encoding").unwrap(), "identity");
    assert_eq!(headers.get("authorization").unwrap(), "Bearer client-token");
}

#[tokio::test]
async fn test_default_anthropic_version_applied() {
    let h = harness()
        .config(|c| c.anthropic_version = "2023-01-01".into())
        .start()
        .await;
    mount_ok(&h.anth, "ok").await;

    post_messages(&h.app, &message_body(SONNET, false)).await;
    let received = h.anth.received_requests().await.unwrap();
    assert_eq!(received[0].headers.get("anthropic-version").unwrap(), "2023-01-01");
}

#[tokio::test]
async fn test_invalid_json_is_rejected_without_dispatch() {
    let h = harness().start().await;

    let reply = post(&h.app, "/v1/messages", "{not json").await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert!(!reply.request_id().is_empty());
    assert_eq!(reply.json()["type"], "error");

    let reply = post(&h.app, "/v1/messages", "[1,2]").await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);

    assert!(h.anth.received_requests().await.unwrap().is_empty());
    assert!(h.zai.received_requests().await.unwrap().is_empty());
    assert!(h.telemetry.entries().is_empty());
}

#[tokio::test]
async fn test_loose_fields_are_tolerated() {
    let h = harness().start().await;
    mount_ok(&h.anth, "ok").await;

    // a non-string model and a non-bool stream count as absent
    let reply = post_messages(&h.app, &json!({"model": 42, "stream": "yes", "messages": []})).await;
    assert_eq!(reply.status, StatusCode::OK);

    let completion = &h.telemetry.completions()[0];
    assert_eq!(completion.model, "");
    assert_eq!(completion.op, "nonstream");
}

#[tokio::test]
async fn test_decision_precedes_completion() {
    let h = harness().start().await;
    mount_ok(&h.zai, "ok").await;
    mount_ok(&h.anth, "ok").await;

    let mut rids = Vec::new();
    for model in [HAIKU, SONNET, HAIKU] {
        rids.push(post_messages(&h.app, &message_body(model, false)).await.request_id());
    }
    for rid in rids {
        let entries = h.telemetry.entries_for(&rid);
        assert_eq!(entries.len(), 2, "rid {rid}");
        assert!(entries[0].is_decision());
        assert!(!entries[1].is_decision());
        assert_eq!(entries[0].model, entries[1].model);
    }
}

#[tokio::test]
async fn test_completion_recorded_in_ledger_and_store() {
    let h = harness().quotas(rolling_quota(HAIKU, 1000, 0.8)).start().await;
    mount_ok(&h.zai, "ok").await;

    post_messages(&h.app, &message_body(HAIKU, false)).await;

    let info = h.state.ledger.decision_info(HAIKU);
    assert_eq!(info.rolling_used, 19);

    let samples = h.store.list_samples(0.0, Some(HAIKU)).unwrap();
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].lane, "zai");
    assert_eq!(samples[0].decision, "forced_model");
    assert_eq!(samples[0].status, 200);
    assert_eq!(samples[0].upstream, "zai");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_requests_share_quota_and_cooldown_state() {
    const REQUESTS: usize = 24;
    let h = harness().start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&h.zai)
        .await;
    mount_ok(&h.anth, "served").await;

    let handles: Vec<_> = (0..REQUESTS)
        .map(|i| {
            let app = h.app.clone();
            let model = if i % 2 == 0 { HAIKU } else { SONNET };
            tokio::spawn(async move { post_messages(&app, &message_body(model, false)).await })
        })
        .collect();

    let mut rids = Vec::new();
    for handle in handles {
        let reply = handle.await.unwrap();
        assert_eq!(reply.status, StatusCode::OK);
        rids.push(reply.request_id());
    }
    rids.sort();
    rids.dedup();
    assert_eq!(rids.len(), REQUESTS);

    // one completion per request, and at most one extra dispatch each
    let mut fallbacks = 0;
    for rid in &rids {
        let entries = h.telemetry.entries_for(rid);
        let completions = entries.iter().filter(|e| !e.is_decision()).count();
        let decisions = entries.iter().filter(|e| e.is_decision()).count();
        assert_eq!(completions, 1, "request {rid}");
        assert!((1..=2).contains(&decisions), "request {rid}");
        fallbacks += decisions - 1;
    }
    let dispatched = h.zai.received_requests().await.unwrap().len()
        + h.anth.received_requests().await.unwrap().len();
    assert_eq!(dispatched, REQUESTS + fallbacks);
    assert!(dispatched <= 2 * REQUESTS);

    // every request left exactly one sample behind
    let report = h.state.ledger.usage_report();
    let recorded: u64 = [HAIKU, SONNET].iter().map(|m| report.models[*m].reqs).sum();
    assert_eq!(recorded, REQUESTS as u64);
    assert_eq!(h.store.list_samples(0.0, None).unwrap().len(), REQUESTS);

    // the first offload 429 cooled the lane down for everyone after it
    let (active, _) = h.state.cooldowns.info(HAIKU);
    assert!(active);
    assert!(h.zai.received_requests().await.unwrap().len() <= REQUESTS / 2);
}
