//! ccp-proxy - a routing reverse proxy for the Anthropic messages API
//!
//! Clients send `POST /v1/messages` as they would to Anthropic. The proxy picks
//! a lane per request and forwards the body unchanged:
//!
//! - **Lanes**: the Anthropic upstream, or an Anthropic-compatible offload
//!   provider (z.ai), chosen by model name, policy, catalog or manual override
//! - **Quota-aware rerouting**: rolling and weekly token windows per model with
//!   warn/block thresholds, cooldowns after offload 429s, and a run-to-cap mode
//! - **Bounded fallback**: one retry on the other lane after a 5xx, an offload
//!   429, an offload 401 (header flip) or an offload transport failure
//! - **Streaming**: SSE relayed chunk by chunk with an idle timeout and partial
//!   capture of interrupted streams
//! - **Telemetry**: decision and completion events as JSONL, Prometheus metrics,
//!   and an optional in-memory sample store with hourly and daily rollups
//!
//! # Architecture
//!
//! - [`core`]: configuration, errors, request spans, metrics, JSONL writers
//! - [`services`]: routing, quota ledger, cooldowns, license gate, store
//! - [`api`]: the `/v1/messages` pipeline and the operator endpoints
//!
//! # Configuration
//!
//! Everything is read from the environment (a `.env` file is honoured).
//! Commonly set:
//! - `PORT`: listen port (default: 8082)
//! - `ZAI_API_KEY`: enables the offload lane
//! - `CCP_REROUTE_MODE`: `hybrid` (default), `preemptive` or `run2cap`
//! - `CCP_DEV_ENABLE`: mounts `POST /v1/dev/sim-usage`

pub mod api;
pub mod core;
pub mod services;

// Re-export commonly used types for convenience
pub use api::{build_router, AppState, AppStateBuilder};
pub use core::{AppError, ProxyConfig, Result};
pub use services::{Lane, LaneRouter, QuotaLedger};
