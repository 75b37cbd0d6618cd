//! Routing, quota and telemetry services.
//!
//! This module contains the domain logic behind `/v1/messages`:
//! - Lanes, routing policy and the provider catalog
//! - Quota configuration, the quota ledger and its calibration
//! - Cooldowns, the license gate and the reroute engine
//! - Sample storage, telemetry sinks and background tasks

pub mod calibration;
pub mod cooldown;
pub mod lane;
pub mod license;
pub mod policy;
pub mod quota;
pub mod quota_config;
pub mod router;
pub mod store;
pub mod tasks;
pub mod telemetry;

// Re-export commonly used types
pub use cooldown::CooldownTracker;
pub use lane::{HeaderMode, Lane};
pub use license::{LicenseClaims, LicenseGate};
pub use policy::{CatalogState, Policy, ProviderCatalog};
pub use quota::{QuotaDecisionInfo, QuotaLedger, UsageSample};
pub use quota_config::QuotasFile;
pub use router::{LaneRouter, RerouteDecision, RerouteMode};
pub use store::{MemoryStore, Store, StoredSample};
pub use tasks::BackgroundTasks;
pub use telemetry::{JsonlTelemetry, MemoryTelemetry, TelemetrySink, UsageEntry};
