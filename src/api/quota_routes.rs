//! Quota and usage endpoints.

use crate::api::state::AppState;
use crate::core::error::{AppError, Result};
use crate::services::quota::{QuotaConfigDump, UsageReport, UsageSample};
use crate::services::quota_config::load_quotas;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_SIM_MODEL: &str = "claude-haiku-4.5";
const DEFAULT_SAMPLES_LOOKBACK_SECS: f64 = 24.0 * 3600.0;

/// `GET /v1/usage`
pub async fn usage(State(state): State<Arc<AppState>>) -> Json<UsageReport> {
    Json(state.ledger.usage_report())
}

/// `GET /v1/quotas`
pub async fn quotas(State(state): State<Arc<AppState>>) -> Json<QuotaConfigDump> {
    Json(state.ledger.config_dump())
}

#[derive(Debug, Default, Deserialize)]
pub struct ReloadQuery {
    #[serde(default)]
    pub file: Option<String>,
}

/// `POST /v1/quotas/reload[?file=]`
///
/// Swaps the quota config and windows atomically; recorded samples survive.
pub async fn reload(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ReloadQuery>,
) -> Result<StatusCode> {
    let paths = match query.file.as_deref().map(str::trim) {
        Some(file) if !file.is_empty() => vec![PathBuf::from(file)],
        _ => state.quota_paths.clone(),
    };
    let (cfg, path) = load_quotas(&paths).map_err(|e| {
        tracing::warn!("Quota reload rejected: {:#}", e);
        AppError::InvalidQuotas(format!("{e:#}"))
    })?;
    tracing::info!(path = %path.display(), models = cfg.models.len(), "Quotas reloaded");
    state.ledger.reload(cfg, Some(path));
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct SimUsageRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default, rename = "in")]
    pub input_tokens: u64,
    #[serde(default, rename = "out")]
    pub output_tokens: u64,
    #[serde(default)]
    pub repeat: u32,
    #[serde(default)]
    pub seconds: u64,
    #[serde(default)]
    pub interval_ms: u64,
}

/// `POST /v1/dev/sim-usage`. Only routed when dev endpoints are enabled.
pub async fn sim_usage(State(state): State<Arc<AppState>>, body: axum::body::Bytes) -> Result<Json<Value>> {
    let req: SimUsageRequest =
        serde_json::from_slice(&body).map_err(|e| AppError::BadRequest(format!("bad json: {e}")))?;
    let model = if req.model.trim().is_empty() {
        DEFAULT_SIM_MODEL.to_string()
    } else {
        req.model
    };
    let repeat = req.repeat.max(1);
    let duration = Duration::from_secs(req.seconds.max(1));

    for i in 0..repeat {
        state.ledger.record_usage(UsageSample::new(
            model.clone(),
            req.input_tokens,
            req.output_tokens,
            duration,
            duration,
            None,
        ));
        if req.interval_ms > 0 && i + 1 < repeat {
            tokio::time::sleep(Duration::from_millis(req.interval_ms)).await;
        }
    }
    tracing::debug!(model = %model, repeat, "Simulated usage recorded");
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Default, Deserialize)]
pub struct SamplesQuery {
    pub since: Option<f64>,
    pub model: Option<String>,
}

fn store_of(state: &AppState) -> Result<&Arc<dyn crate::services::store::Store>> {
    state
        .store
        .as_ref()
        .ok_or_else(|| AppError::NotFound("sample store disabled".into()))
}

fn model_filter(model: &Option<String>) -> Option<&str> {
    model.as_deref().map(str::trim).filter(|m| !m.is_empty())
}

/// `GET /v1/usage/samples?since=&model=`. `since` defaults to the last 24h.
pub async fn samples(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SamplesQuery>,
) -> Result<Json<Value>> {
    let store = store_of(&state)?;
    let since = query.since.unwrap_or_else(|| {
        crate::services::quota::unix_seconds(chrono::Utc::now()) - DEFAULT_SAMPLES_LOOKBACK_SECS
    });
    let samples = store
        .list_samples(since, model_filter(&query.model))
        .map_err(|e| AppError::Internal(format!("{e:#}")))?;
    Ok(Json(json!({ "samples": samples })))
}

#[derive(Debug, Default, Deserialize)]
pub struct RollupsQuery {
    pub granularity: Option<String>,
    pub since: Option<f64>,
    pub model: Option<String>,
}

/// `GET /v1/usage/rollups?granularity=hour|day&since=&model=`
pub async fn rollups(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RollupsQuery>,
) -> Result<Json<Value>> {
    let store = store_of(&state)?;
    let since = query.since.unwrap_or(0.0);
    let model = model_filter(&query.model);
    let granularity = query.granularity.as_deref().unwrap_or("hour");
    let rollups = match granularity {
        "hour" => store
            .list_rollups_hour(since, model)
            .map(|r| serde_json::to_value(r).unwrap_or_default()),
        "day" => store
            .list_rollups_day(since, model)
            .map(|r| serde_json::to_value(r).unwrap_or_default()),
        other => {
            return Err(AppError::BadRequest(format!(
                "granularity must be hour or day, got {other:?}"
            )))
        }
    }
    .map_err(|e| AppError::Internal(format!("{e:#}")))?;
    Ok(Json(json!({ "granularity": granularity, "rollups": rollups })))
}
