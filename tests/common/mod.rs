//! Shared harness: a proxy wired to two wiremock upstreams with in-memory
//! telemetry and store.

#![allow(dead_code)]

use axum::{
    body::{to_bytes, Body, Bytes},
    http::{HeaderMap, Request, StatusCode},
    Router,
};
use ccp_proxy::{
    api::{build_router, AppState},
    core::{init_metrics, ProxyConfig},
    services::{
        quota_config::{QuotaModelConfig, QuotaWindows},
        license::OFFLOAD_FEATURE,
        CatalogState, LicenseClaims, MemoryStore, MemoryTelemetry, QuotasFile, Store, TelemetrySink, UsageEntry,
    },
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use wiremock::MockServer;

pub const HAIKU: &str = "claude-3-5-haiku-20241022";
pub const SONNET: &str = "claude-sonnet-4";
pub const ZAI_KEY: &str = "zai-test-key";

pub struct Harness {
    pub app: Router,
    pub state: Arc<AppState>,
    pub telemetry: Arc<MemoryTelemetry>,
    pub store: Arc<MemoryStore>,
    pub anth: MockServer,
    pub zai: MockServer,
}

pub struct HarnessBuilder {
    quotas: QuotasFile,
    catalog: CatalogState,
    license: Option<LicenseClaims>,
    configure: Vec<Box<dyn FnOnce(&mut ProxyConfig)>>,
}

impl HarnessBuilder {
    pub fn quotas(mut self, quotas: QuotasFile) -> Self {
        self.quotas = quotas;
        self
    }

    pub fn catalog(mut self, catalog: CatalogState) -> Self {
        self.catalog = catalog;
        self
    }

    /// Community mode: no claims, so the offload lane is gated off.
    pub fn unlicensed(mut self) -> Self {
        self.license = None;
        self
    }

    pub fn config(mut self, f: impl FnOnce(&mut ProxyConfig) + 'static) -> Self {
        self.configure.push(Box::new(f));
        self
    }

    pub async fn start(self) -> Harness {
        init_metrics();
        let anth = MockServer::start().await;
        let zai = MockServer::start().await;

        let mut config = ProxyConfig::default();
        config.anthropic_base_url = anth.uri();
        config.zai_base_url = zai.uri();
        config.zai_api_key = Some(ZAI_KEY.to_string());
        config.dev_enable = true;
        config.store.enabled = true;
        for f in self.configure {
            f(&mut config);
        }

        let telemetry = MemoryTelemetry::new();
        let store = Arc::new(MemoryStore::new(30));
        let state = Arc::new(
            AppState::builder(config)
                .catalog(self.catalog)
                .quotas(self.quotas, None)
                .license(self.license)
                .telemetry(telemetry.clone() as Arc<dyn TelemetrySink>)
                .store(Some(store.clone() as Arc<dyn Store>))
                .build()
                .expect("state builds"),
        );

        Harness {
            app: build_router(state.clone()),
            state,
            telemetry,
            store,
            anth,
            zai,
        }
    }
}

pub fn harness() -> HarnessBuilder {
    HarnessBuilder {
        quotas: QuotasFile::builtin(),
        catalog: CatalogState::empty(),
        license: Some(LicenseClaims {
            plan: "pro".into(),
            features: vec![OFFLOAD_FEATURE.to_string()],
            exp: None,
        }),
        configure: Vec::new(),
    }
}

/// Quotas with a rolling cap for one model.
pub fn rolling_quota(model: &str, rolling_tokens: i64, warn_pct: f64) -> QuotasFile {
    let mut quotas = QuotasFile::builtin();
    quotas.models.insert(
        model.to_string(),
        QuotaModelConfig {
            provider: "zai".into(),
            rolling_tokens,
            warn_pct,
            ..Default::default()
        },
    );
    quotas
}

/// Quotas with a weekly token cap and a short weekly window.
pub fn weekly_quota(model: &str, weekly_tokens: i64, weekly_seconds: i64) -> QuotasFile {
    let mut quotas = QuotasFile {
        windows: QuotaWindows {
            rolling_seconds: 3600,
            weekly_seconds,
        },
        ..Default::default()
    };
    quotas.models.insert(
        model.to_string(),
        QuotaModelConfig {
            provider: "zai".into(),
            weekly_limit_type: "tokens".into(),
            weekly_limit_value: weekly_tokens,
            ..Default::default()
        },
    );
    quotas
}

pub fn message_body(model: &str, stream: bool) -> Value {
    json!({
        "model": model,
        "max_tokens": 16,
        "stream": stream,
        "messages": [{"role": "user", "content": "hi"}]
    })
}

pub fn anthropic_reply(text: &str) -> Value {
    json!({
        "id": "msg_test",
        "type": "message",
        "role": "assistant",
        "content": [{"type": "text", "text": text}],
        "usage": {"input_tokens": 12, "output_tokens": 7}
    })
}

pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Reply {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).expect("json body")
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn request_id(&self) -> String {
        self.headers
            .get("x-ccp-request-id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    }
}

pub async fn send(app: &Router, request: Request<Body>) -> Reply {
    let response = app.clone().oneshot(request).await.expect("router responds");
    let status = response.status();
    let headers = response.headers().clone();
    let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
    Reply { status, headers, body }
}

pub async fn post_messages(app: &Router, body: &Value) -> Reply {
    post_messages_with(app, body, &[("authorization", "Bearer client-token")]).await
}

pub async fn post_messages_with(app: &Router, body: &Value, headers: &[(&str, &str)]) -> Reply {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/v1/messages")
        .header("content-type", "application/json");
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    send(app, builder.body(Body::from(body.to_string())).expect("request")).await
}

pub async fn get(app: &Router, uri: &str) -> Reply {
    send(app, Request::builder().uri(uri).body(Body::empty()).expect("request")).await
}

pub async fn post(app: &Router, uri: &str, body: &str) -> Reply {
    send(
        app,
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request"),
    )
    .await
}

/// Completion records arrive after the response for streamed requests.
pub async fn wait_for_completion(telemetry: &MemoryTelemetry, rid: &str) -> UsageEntry {
    for _ in 0..200 {
        if let Some(entry) = telemetry
            .entries_for(rid)
            .into_iter()
            .find(|e| !e.is_decision())
        {
            return entry;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("no completion recorded for {rid}");
}
