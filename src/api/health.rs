//! Liveness, readiness and Prometheus endpoints.

use crate::api::state::AppState;
use crate::core::error::{AppError, Result};
use crate::core::metrics::get_metrics;
use crate::services::license::LicenseSummary;
use crate::services::quota::unix_seconds;
use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Reachability of one provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub ok: bool,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub url: String,
    /// Whether a credential is configured for this provider.
    pub credential: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadinessReport {
    pub providers: BTreeMap<String, ProviderStatus>,
    pub ts: f64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license: Option<LicenseSummary>,
}

struct ProbeTarget {
    name: String,
    base_url: String,
    credential: bool,
}

/// `GET /healthz`
pub async fn healthz() -> &'static str {
    "ok"
}

/// `GET /readyz`
///
/// Sends `OPTIONS <base>/v1/messages` to every provider concurrently. Any
/// status from 200 to 405 counts as reachable, which includes 401.
pub async fn readyz(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let catalog = state.router.catalog();
    let mut report = ReadinessReport {
        providers: BTreeMap::new(),
        ts: unix_seconds(Utc::now()),
        source: catalog.source.clone(),
        error: None,
        license: state.license.summary(),
    };

    if let Some(error) = catalog.error.as_ref() {
        tracing::warn!(error = %error, "Readiness degraded: provider catalog failed to load");
        report.error = Some(error.clone());
        return (StatusCode::SERVICE_UNAVAILABLE, Json(report)).into_response();
    }

    let targets: Vec<ProbeTarget> = if catalog.catalog.providers.is_empty() {
        vec![
            ProbeTarget {
                name: "anth".to_string(),
                base_url: state.config.anthropic_base_url.clone(),
                credential: state.config.anthropic_pass_through
                    || state.config.anthropic_fallback_token.is_some(),
            },
            ProbeTarget {
                name: "zai".to_string(),
                base_url: state.config.zai_base_url.clone(),
                credential: state.config.zai_key().is_some(),
            },
        ]
    } else {
        catalog
            .catalog
            .providers
            .iter()
            .map(|(name, entry)| ProbeTarget {
                name: name.clone(),
                base_url: entry.base_url.clone(),
                credential: entry.has_credential(),
            })
            .collect()
    };

    let version = headers
        .get("anthropic-version")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or(&state.config.anthropic_version)
        .to_string();

    let client = match reqwest::Client::builder().timeout(PROBE_TIMEOUT).build() {
        Ok(client) => client,
        Err(e) => return AppError::Internal(format!("probe client: {e}")).into_response(),
    };

    let probes = targets.into_iter().map(|target| {
        let client = client.clone();
        let version = version.clone();
        async move {
            let status = probe(&client, &target, &version).await;
            (target.name, status)
        }
    });
    let metrics = get_metrics();
    for (name, status) in futures::future::join_all(probes).await {
        if status.error.as_deref() != Some("no_base_url") {
            let lane = if name == "anth" { "anthropic" } else { name.as_str() };
            metrics
                .upstream_ready
                .with_label_values(&[lane])
                .set(if status.ok { 1.0 } else { 0.0 });
        }
        tracing::debug!(provider = %name, ok = status.ok, status = status.status, "Readiness probe");
        report.providers.insert(name, status);
    }

    (StatusCode::OK, Json(report)).into_response()
}

async fn probe(client: &reqwest::Client, target: &ProbeTarget, version: &str) -> ProviderStatus {
    if target.base_url.trim().is_empty() {
        return ProviderStatus {
            ok: false,
            status: 0,
            error: Some("no_base_url".to_string()),
            url: String::new(),
            credential: target.credential,
        };
    }
    let url = format!("{}/v1/messages", target.base_url.trim_end_matches('/'));
    match client
        .request(reqwest::Method::OPTIONS, &url)
        .header("anthropic-version", version)
        .send()
        .await
    {
        Ok(response) => {
            let status = response.status().as_u16();
            ProviderStatus {
                ok: (200..=405).contains(&status),
                status,
                error: None,
                url,
                credential: target.credential,
            }
        }
        Err(e) => ProviderStatus {
            ok: false,
            status: 0,
            error: Some(e.to_string()),
            url,
            credential: target.credential,
        },
    }
}

/// Prometheus metrics endpoint.
#[tracing::instrument]
pub async fn metrics_handler() -> Result<Response> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| AppError::Internal(e.to_string()))?;

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", encoder.format_type())
        .body(Body::from(buffer))
        .map_err(|e| AppError::Internal(e.to_string()))
}
