//! ccp - routing proxy entry point
//!
//! Loads policy, catalog, quotas and license from disk, wires the telemetry
//! sinks and background tasks, then serves until Ctrl-C.

use anyhow::Result;
use ccp_proxy::{
    api::{build_router, AppState},
    core::{init_metrics, JsonlWriter, ProxyConfig},
    services::{
        calibration::probe_report_path,
        license::load_license,
        policy::{default_policy_paths, default_provider_paths, load_catalog_state, resolve_policy},
        quota_config::{default_quota_paths, load_quotas, QuotasFile},
        BackgroundTasks, JsonlTelemetry, MemoryStore, Store, TelemetrySink,
    },
};
use chrono::Local;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> Result<()> {
    // Load .env file if present (before reading any environment variables)
    dotenvy::dotenv().ok();

    let worker_threads = std::env::var("TOKIO_WORKER_THREADS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or_else(|| detect_cpu_limit().unwrap_or_else(num_cpus_fallback));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    runtime.block_on(async_main())
}

/// Custom time formatter that uses local timezone (respects TZ environment variable)
struct LocalTime;

impl tracing_subscriber::fmt::time::FormatTime for LocalTime {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%d %H:%M:%S"))
    }
}

fn init_tracing() {
    let no_color = std::env::var("NO_COLOR").is_ok();
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    // Noise suppression is appended even when RUST_LOG is set, otherwise a
    // bare "trace" lets hyper's per-frame logs through.
    let base_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,ccp_proxy=debug".to_string());
    let filter = tracing_subscriber::EnvFilter::new(format!(
        "{},hyper=warn,hyper::proto=warn,h2=warn,reqwest=warn",
        base_filter
    ));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_timer(LocalTime))
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_timer(LocalTime)
                    .with_ansi(!no_color),
            )
            .init();
    }
}

async fn async_main() -> Result<()> {
    init_tracing();
    init_metrics();

    // the repo root decides where the policy lives, and the policy feeds config
    let root = ProxyConfig::from_env().repo_root;
    let policy = resolve_policy(&default_policy_paths(&root));
    let config = ProxyConfig::from_env_with_policy(Some(&policy));

    let catalog = load_catalog_state(&default_provider_paths(&root));
    if let Some(error) = catalog.error.as_ref() {
        tracing::warn!("Provider catalog unavailable, routing without it: {}", error);
    } else {
        tracing::info!(
            source = %catalog.source,
            providers = catalog.catalog.providers.len(),
            "Provider catalog loaded"
        );
    }

    let quota_paths = default_quota_paths(&root);
    let (quotas, quotas_path) = match load_quotas(&quota_paths) {
        Ok((cfg, path)) => {
            tracing::info!(path = %path.display(), models = cfg.models.len(), "Quotas loaded");
            (cfg, Some(path))
        }
        Err(e) => {
            tracing::warn!("Using built-in quota windows: {:#}", e);
            (QuotasFile::builtin(), None)
        }
    };

    let license = load_license(config.license_file.as_deref());

    let jsonl = if config.usage_log.enabled {
        let usage = JsonlWriter::spawn(
            config.usage_log.usage_path.clone(),
            config.usage_log.max_bytes,
            config.usage_log.buffer_size,
        )
        .await?;
        let anomalies = JsonlWriter::spawn(
            config.usage_log.anomaly_path.clone(),
            config.usage_log.max_bytes,
            config.usage_log.buffer_size,
        )
        .await?;
        tracing::info!(path = %usage.path().display(), "Usage log enabled");
        Some(Arc::new(JsonlTelemetry::new(usage, anomalies)))
    } else {
        None
    };

    let store: Option<Arc<dyn Store>> = if config.store.enabled {
        Some(Arc::new(MemoryStore::new(config.store.rollup_retention_days)))
    } else {
        None
    };

    let mut builder = AppState::builder(config.clone())
        .policy(policy)
        .catalog(catalog)
        .quotas(quotas, quotas_path)
        .quota_paths(quota_paths)
        .license(license)
        .store(store.clone());
    if let Some(sink) = jsonl.clone() {
        builder = builder.telemetry(sink as Arc<dyn TelemetrySink>);
    }
    let state = Arc::new(builder.build()?);

    let mut tasks = BackgroundTasks::new();
    tasks.spawn_calibrator(
        state.ledger.clone(),
        probe_report_path(&root),
        config.calibration_interval,
    );
    if let Some(store) = store {
        tasks.spawn_rollups(
            store,
            config.store.rollup_interval,
            Duration::from_secs(u64::from(config.store.sample_ttl_days) * 86_400),
        );
    }

    let app = build_router(state.clone());

    let host: std::net::IpAddr = config.server.host.parse()?;
    let addr = SocketAddr::from((host, config.server.port));
    tracing::info!("Starting ccp on {}", addr);
    tracing::info!(
        anthropic = %config.anthropic_base_url,
        zai = %config.zai_base_url,
        offload = config.zai_key().is_some(),
        reroute_mode = %config.reroute_mode,
        "Upstream lanes"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tasks.shutdown().await;
    if let Some(sink) = jsonl {
        sink.flush().await;
    }
    if let Some(store) = state.store.as_ref() {
        if let Err(e) = store.close() {
            tracing::warn!("Store close failed: {:#}", e);
        }
    }
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

fn num_cpus_fallback() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Detect CPU limit from cgroup (for containerized environments)
fn detect_cpu_limit() -> Option<usize> {
    // cgroup v2
    if let Ok(max) = std::fs::read_to_string("/sys/fs/cgroup/cpu.max") {
        let parts: Vec<&str> = max.split_whitespace().collect();
        if parts.len() == 2 {
            if let (Ok(quota), Ok(period)) = (parts[0].parse::<i64>(), parts[1].parse::<i64>()) {
                if quota > 0 {
                    return Some(((quota as f64 / period as f64).ceil() as usize).max(1));
                }
            }
        }
    }

    // cgroup v1
    let quota = std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_quota_us")
        .ok()?
        .trim()
        .parse::<i64>()
        .ok()?;
    let period = std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_period_us")
        .ok()?
        .trim()
        .parse::<i64>()
        .ok()?;

    if quota > 0 {
        Some(((quota as f64 / period as f64).ceil() as usize).max(1))
    } else {
        None
    }
}
