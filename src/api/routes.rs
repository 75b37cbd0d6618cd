//! HTTP router assembly.

use crate::api::health::{healthz, metrics_handler, readyz};
use crate::api::proxy::messages;
use crate::api::quota_routes::{quotas, reload, rollups, samples, sim_usage, usage};
use crate::api::state::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Build the proxy router. The dev endpoint is only mounted when enabled, the
/// sample endpoints only when a store is configured.
pub fn build_router(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_handler))
        .route("/v1/messages", post(messages))
        .route("/v1/usage", get(usage))
        .route("/v1/quotas", get(quotas))
        .route("/v1/quotas/reload", post(reload));

    if state.config.dev_enable {
        router = router.route("/v1/dev/sim-usage", post(sim_usage));
    }
    if state.store.is_some() {
        router = router
            .route("/v1/usage/samples", get(samples))
            .route("/v1/usage/rollups", get(rollups));
    }

    router
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
