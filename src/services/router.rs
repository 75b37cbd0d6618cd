//! Lane selection and quota-aware reroute decisions.
//!
//! [`LaneRouter::decide_lane`] picks the preferred lane for a model from the
//! pause/force flags, the manual pin, the provider catalog and the policy.
//! [`LaneRouter::build_reroute_decision`] then weighs that preference against
//! the model's quota state and cooldown, under the configured [`RerouteMode`].

use crate::core::config::ProxyConfig;
use crate::services::cooldown::CooldownTracker;
use crate::services::lane::Lane;
use crate::services::policy::{CatalogState, Policy};
use crate::services::quota::QuotaDecisionInfo;
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

pub const QUOTA_PASS: &str = "quota_pass";
pub const QUOTA_COOLDOWN: &str = "quota_cooldown";
pub const QUOTA_BLOCK: &str = "quota_block";
pub const QUOTA_PREEMPTIVE_WARN: &str = "quota_preemptive_warn";
pub const QUOTA_PREEMPTIVE_PASS: &str = "quota_preemptive_pass";
pub const QUOTA_WARN_ATTEMPT: &str = "quota_warn_attempt";
pub const QUOTA_RUN_TO_LIMIT: &str = "quota_run_to_limit";

/// How quota pressure affects the preferred lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RerouteMode {
    /// Attempt the preferred lane, tagging warn pressure; reroute on block.
    #[default]
    Hybrid,
    /// Reroute as soon as the warn threshold is crossed.
    Preemptive,
    /// Always attempt the preferred lane, even past the cap.
    RunToCap,
}

impl RerouteMode {
    /// Unknown or empty values select [`RerouteMode::Hybrid`].
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "preemptive" => RerouteMode::Preemptive,
            "run2cap" | "run_to_cap" | "run-to-cap" | "runlimit" | "run" => RerouteMode::RunToCap,
            _ => RerouteMode::Hybrid,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            RerouteMode::Hybrid => "hybrid",
            RerouteMode::Preemptive => "preemptive",
            RerouteMode::RunToCap => "run2cap",
        }
    }
}

impl fmt::Display for RerouteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of [`LaneRouter::decide_lane`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaneChoice {
    pub lane: Lane,
    /// Model name the routing tables were matched against.
    pub routed_model: String,
    /// A manual model pin was in effect.
    pub manual_override: bool,
}

/// Per-request reroute verdict. Never stored beyond the request.
#[derive(Debug, Clone, PartialEq)]
pub struct RerouteDecision {
    pub mode: RerouteMode,
    pub preferred_lane: Lane,
    pub fallback_lane: Lane,
    pub selected_lane: Lane,
    pub decision: &'static str,
    pub preferred_attempt: bool,
    pub headroom_rolling: f64,
    pub headroom_weekly: f64,
    pub cooldown_active: bool,
    pub cooldown_until: Option<DateTime<Utc>>,
}

impl RerouteDecision {
    /// Decision for a request that bypasses quota evaluation.
    pub fn pass(mode: RerouteMode, preferred: Lane, fallback: Lane) -> Self {
        Self {
            mode,
            preferred_lane: preferred,
            fallback_lane: fallback,
            selected_lane: preferred,
            decision: QUOTA_PASS,
            preferred_attempt: true,
            headroom_rolling: 1.0,
            headroom_weekly: 1.0,
            cooldown_active: false,
            cooldown_until: None,
        }
    }

    /// Unix seconds of `cooldown_until`, zero when unset.
    pub fn cooldown_next_ts(&self) -> f64 {
        self.cooldown_until
            .map(crate::services::quota::unix_seconds)
            .unwrap_or(0.0)
    }
}

fn headroom(capacity: u64, pct: f64) -> f64 {
    if capacity > 0 {
        (1.0 - pct).max(0.0)
    } else {
        1.0
    }
}

/// Routing settings that do not change at runtime.
#[derive(Debug, Clone, Default)]
pub struct RouterSettings {
    pub paused: bool,
    pub force_haiku_to_zai: bool,
    pub has_zai_key: bool,
    pub reroute_mode: RerouteMode,
    pub manual_model: Option<String>,
    pub manual_model_file: Option<PathBuf>,
}

impl RouterSettings {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            paused: config.paused,
            force_haiku_to_zai: config.force_haiku_to_zai,
            has_zai_key: config.zai_key().is_some(),
            reroute_mode: config.reroute_mode,
            manual_model: config.manual_model.clone(),
            manual_model_file: config.manual_model_file.clone(),
        }
    }
}

pub struct LaneRouter {
    settings: RouterSettings,
    policy: ArcSwap<Policy>,
    catalog: ArcSwap<CatalogState>,
    cooldowns: Arc<CooldownTracker>,
}

impl LaneRouter {
    pub fn new(
        settings: RouterSettings,
        policy: Policy,
        catalog: CatalogState,
        cooldowns: Arc<CooldownTracker>,
    ) -> Self {
        Self {
            settings,
            policy: ArcSwap::from_pointee(policy),
            catalog: ArcSwap::from_pointee(catalog),
            cooldowns,
        }
    }

    pub fn settings(&self) -> &RouterSettings {
        &self.settings
    }

    pub fn mode(&self) -> RerouteMode {
        self.settings.reroute_mode
    }

    pub fn catalog(&self) -> Arc<CatalogState> {
        self.catalog.load_full()
    }

    pub fn policy(&self) -> Arc<Policy> {
        self.policy.load_full()
    }

    pub fn swap_catalog(&self, catalog: CatalogState) {
        self.catalog.store(Arc::new(catalog));
    }

    pub fn swap_policy(&self, policy: Policy) {
        self.policy.store(Arc::new(policy));
    }

    /// Manual model pin: the configured value, else the pin file (re-read on
    /// every call so edits apply without a restart).
    pub fn manual_model(&self) -> Option<String> {
        if let Some(model) = self.settings.manual_model.as_deref() {
            let model = model.trim();
            if !model.is_empty() {
                return Some(model.to_string());
            }
        }
        let path = self.settings.manual_model_file.as_ref()?;
        let content = std::fs::read_to_string(path).ok()?;
        let model = content.trim();
        (!model.is_empty()).then(|| model.to_string())
    }

    pub fn decide_lane(&self, model: &str) -> LaneChoice {
        let choice = |lane: Lane, routed: &str, manual: bool| LaneChoice {
            lane,
            routed_model: routed.to_string(),
            manual_override: manual,
        };
        let has_key = self.settings.has_zai_key;

        if self.settings.paused {
            return choice(Lane::Anthropic, model, false);
        }
        if self.settings.force_haiku_to_zai {
            let lane = if has_key { Lane::Zai } else { Lane::Anthropic };
            return choice(lane, model, false);
        }

        let manual = self.manual_model();
        let manual_override = manual.is_some();
        let routed = manual.unwrap_or_else(|| model.to_string());
        let normalized = routed.trim().to_lowercase();

        let catalog = self.catalog.load();
        if catalog.is_healthy() {
            if let Some(lane) = catalog.catalog.lane_for_model(&normalized) {
                return choice(lane, &routed, manual_override);
            }
        }

        let policy = self.policy.load();
        if let Some(lane) = policy.lane_for_model(&routed).and_then(Lane::from_provider_id) {
            match lane {
                Lane::Zai if has_key => return choice(Lane::Zai, &routed, manual_override),
                Lane::Anthropic => return choice(Lane::Anthropic, &routed, manual_override),
                Lane::Zai => {}
            }
        }

        if normalized.contains("haiku") && has_key {
            return choice(Lane::Zai, &routed, manual_override);
        }
        choice(Lane::Anthropic, &routed, manual_override)
    }

    /// The other lane when it can serve, else the default lane.
    pub fn fallback_lane(&self, preferred: Lane) -> Lane {
        match preferred {
            Lane::Zai => Lane::Anthropic,
            Lane::Anthropic if self.settings.has_zai_key => Lane::Zai,
            Lane::Anthropic => Lane::Anthropic,
        }
    }

    pub fn build_reroute_decision(
        &self,
        model: &str,
        preferred: Lane,
        info: &QuotaDecisionInfo,
    ) -> RerouteDecision {
        self.build_reroute_decision_at(model, preferred, info, Utc::now())
    }

    pub fn build_reroute_decision_at(
        &self,
        model: &str,
        preferred: Lane,
        info: &QuotaDecisionInfo,
        now: DateTime<Utc>,
    ) -> RerouteDecision {
        let mode = self.settings.reroute_mode;
        let fallback = self.fallback_lane(preferred);
        let mut out = RerouteDecision::pass(mode, preferred, fallback);
        out.headroom_rolling = headroom(info.rolling_capacity, info.rolling_pct);
        out.headroom_weekly = headroom(info.weekly_capacity, info.weekly_pct);

        let has_alternative = fallback != preferred;
        let reroute = |mut out: RerouteDecision, decision: &'static str| {
            out.selected_lane = out.fallback_lane;
            out.preferred_attempt = false;
            out.decision = decision;
            out
        };

        if mode == RerouteMode::RunToCap {
            out.decision = QUOTA_RUN_TO_LIMIT;
            return out;
        }

        let (active, until) = self.cooldowns.info_at(model, now);
        if active {
            out.cooldown_active = true;
            out.cooldown_until = until;
            if has_alternative {
                return reroute(out, QUOTA_COOLDOWN);
            }
        }

        if info.block && has_alternative {
            return reroute(out, QUOTA_BLOCK);
        }

        let threshold = if info.warn_pct_auto > 0.0 {
            info.warn_pct_auto
        } else {
            info.warn_pct_config
        };
        let warn_active = info.warn
            || (threshold > 0.0 && info.rolling_pct >= threshold)
            || (threshold > 0.0 && info.weekly_capacity > 0 && info.weekly_pct >= threshold);

        match mode {
            RerouteMode::Preemptive if warn_active && has_alternative => {
                reroute(out, QUOTA_PREEMPTIVE_WARN)
            }
            RerouteMode::Preemptive if warn_active => {
                out.decision = QUOTA_WARN_ATTEMPT;
                out
            }
            RerouteMode::Preemptive => {
                out.decision = QUOTA_PREEMPTIVE_PASS;
                out
            }
            RerouteMode::Hybrid if warn_active => {
                out.decision = QUOTA_WARN_ATTEMPT;
                out
            }
            _ => {
                out.decision = QUOTA_PASS;
                out
            }
        }
    }
}
