//! Shared application state.

use crate::api::upstream::{LaneTable, UpstreamClients};
use crate::core::config::ProxyConfig;
use crate::services::cooldown::CooldownTracker;
use crate::services::license::{LicenseClaims, LicenseGate};
use crate::services::policy::{CatalogState, Policy};
use crate::services::quota::QuotaLedger;
use crate::services::quota_config::QuotasFile;
use crate::services::router::{LaneRouter, RouterSettings};
use crate::services::store::Store;
use crate::services::telemetry::{TelemetrySink, TracingTelemetry};
use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;

/// Everything a handler needs; shared behind an `Arc`.
pub struct AppState {
    pub config: ProxyConfig,
    pub router: LaneRouter,
    pub ledger: Arc<QuotaLedger>,
    pub cooldowns: Arc<CooldownTracker>,
    pub license: LicenseGate,
    pub telemetry: Arc<dyn TelemetrySink>,
    pub store: Option<Arc<dyn Store>>,
    pub clients: UpstreamClients,
    pub lanes: LaneTable,
    /// Candidate quota files for `/v1/quotas/reload` without `?file=`.
    pub quota_paths: Vec<PathBuf>,
}

impl AppState {
    pub fn builder(config: ProxyConfig) -> AppStateBuilder {
        AppStateBuilder::new(config)
    }
}

/// Assembles [`AppState`]; anything not supplied gets its built-in default.
pub struct AppStateBuilder {
    config: ProxyConfig,
    policy: Policy,
    catalog: CatalogState,
    quotas: QuotasFile,
    quotas_path: Option<PathBuf>,
    quota_paths: Vec<PathBuf>,
    license: Option<LicenseClaims>,
    telemetry: Option<Arc<dyn TelemetrySink>>,
    store: Option<Arc<dyn Store>>,
}

impl AppStateBuilder {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            policy: Policy::embedded(),
            catalog: CatalogState::empty(),
            quotas: QuotasFile::builtin(),
            quotas_path: None,
            quota_paths: Vec::new(),
            license: None,
            telemetry: None,
            store: None,
        }
    }

    pub fn policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    pub fn catalog(mut self, catalog: CatalogState) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn quotas(mut self, quotas: QuotasFile, path: Option<PathBuf>) -> Self {
        self.quotas = quotas;
        self.quotas_path = path;
        self
    }

    pub fn quota_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.quota_paths = paths;
        self
    }

    pub fn license(mut self, claims: Option<LicenseClaims>) -> Self {
        self.license = claims;
        self
    }

    pub fn telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(sink);
        self
    }

    pub fn store(mut self, store: Option<Arc<dyn Store>>) -> Self {
        self.store = store;
        self
    }

    pub fn build(self) -> anyhow::Result<AppState> {
        let config = self.config;
        let clients = UpstreamClients::new(&config.timeouts, config.force_h1)
            .context("Failed to build upstream HTTP clients")?;
        let cooldowns = Arc::new(CooldownTracker::new(config.quota_cooldown));
        let router = LaneRouter::new(
            RouterSettings::from_config(&config),
            self.policy,
            self.catalog,
            cooldowns.clone(),
        );

        let license = LicenseGate::new(self.license);
        let ledger = Arc::new(QuotaLedger::new(self.quotas, self.quotas_path));
        ledger.set_license_summary(license.summary());

        Ok(AppState {
            lanes: LaneTable::from_config(&config),
            router,
            ledger,
            cooldowns,
            license,
            telemetry: self
                .telemetry
                .unwrap_or_else(|| Arc::new(TracingTelemetry) as Arc<dyn TelemetrySink>),
            store: self.store,
            clients,
            quota_paths: self.quota_paths,
            config,
        })
    }
}
