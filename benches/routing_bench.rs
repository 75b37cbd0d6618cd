//! Benchmarks for the per-request routing path.
//!
//! Run with: cargo bench --bench routing_bench

use ccp_proxy::api::streaming::SseUsageScanner;
use ccp_proxy::services::{
    quota_config::QuotaModelConfig, CatalogState, CooldownTracker, LaneRouter, Policy, QuotaLedger,
    QuotasFile, RerouteMode, UsageSample,
};
use ccp_proxy::services::{router::RouterSettings, Lane};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::time::Duration;

const MODEL: &str = "claude-3-5-haiku-20241022";

fn create_router(mode: RerouteMode) -> LaneRouter {
    let settings = RouterSettings {
        has_zai_key: true,
        reroute_mode: mode,
        ..Default::default()
    };
    LaneRouter::new(
        settings,
        Policy::embedded(),
        CatalogState::empty(),
        Arc::new(CooldownTracker::new(Duration::from_secs(60))),
    )
}

fn create_ledger(samples: usize) -> QuotaLedger {
    let mut cfg = QuotasFile::builtin();
    cfg.models.insert(
        MODEL.to_string(),
        QuotaModelConfig {
            provider: "zai".into(),
            rolling_tokens: 10_000_000,
            weekly_limit_type: "tokens".into(),
            weekly_limit_value: 50_000_000,
            warn_pct: 0.8,
        },
    );
    let ledger = QuotaLedger::new(cfg, None);
    for i in 0..samples {
        ledger.record_usage(UsageSample::new(
            MODEL,
            100 + i as u64 % 50,
            40,
            Duration::from_millis(800),
            Duration::from_millis(600),
            Some(Duration::from_millis(120)),
        ));
    }
    ledger
}

fn bench_decide_lane(c: &mut Criterion) {
    let router = create_router(RerouteMode::Hybrid);
    let mut group = c.benchmark_group("decide_lane");
    group.throughput(Throughput::Elements(1));

    for model in [MODEL, "claude-sonnet-4", "glm-4.6"] {
        group.bench_with_input(BenchmarkId::from_parameter(model), model, |b, model| {
            b.iter(|| black_box(router.decide_lane(black_box(model))));
        });
    }
    group.finish();
}

fn bench_reroute_decision(c: &mut Criterion) {
    let mut group = c.benchmark_group("reroute_decision");

    for samples in [0, 100, 1_000, 10_000].iter() {
        let ledger = create_ledger(*samples);
        let router = create_router(RerouteMode::Hybrid);

        group.bench_with_input(BenchmarkId::from_parameter(samples), samples, |b, _| {
            b.iter(|| {
                let info = ledger.decision_info(MODEL);
                black_box(router.build_reroute_decision(MODEL, Lane::Zai, &info));
            });
        });
    }
    group.finish();
}

fn bench_record_usage(c: &mut Criterion) {
    let ledger = create_ledger(1_000);

    c.bench_function("record_usage", |b| {
        b.iter(|| {
            ledger.record_usage(black_box(UsageSample::new(
                MODEL,
                120,
                30,
                Duration::from_millis(500),
                Duration::ZERO,
                None,
            )));
        });
    });
}

fn bench_sse_scanner(c: &mut Criterion) {
    let lines: [&[u8]; 5] = [
        br#"event: message_start"#,
        br#"data: {"type":"message_start","message":{"usage":{"input_tokens":25,"output_tokens":1}}}"#,
        br#"data: {"type":"content_block_delta","delta":{"type":"text_delta","text":"hello world"}}"#,
        br#"data: {"type":"message_delta","usage":{"output_tokens":9}}"#,
        br#"data: {"type":"message_stop"}"#,
    ];

    let mut group = c.benchmark_group("sse_scanner");
    group.throughput(Throughput::Elements(lines.len() as u64));
    group.bench_function("observe_stream", |b| {
        b.iter(|| {
            let mut scanner = SseUsageScanner::default();
            for line in &lines {
                scanner.observe(black_box(line));
            }
            black_box(scanner)
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_decide_lane,
    bench_reroute_decision,
    bench_record_usage,
    bench_sse_scanner
);
criterion_main!(benches);
