//! Quota ledger: per-model usage samples over rolling and weekly windows.
//!
//! One mutex guards the configuration, every model's samples and the
//! calibration map, because pruning walks all models at once. Percentages and
//! warn/block flags are always derived from the live samples by one
//! evaluation routine shared by routing decisions and the `/v1/usage` report.

use crate::services::calibration::ProbeGap;
use crate::services::license::LicenseSummary;
use crate::services::quota_config::{load_quotas, QuotasFile, WeeklyLimit};
use chrono::{DateTime, Local, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Samples needed in an hour-of-day bucket before its throughput is reported.
const MIN_HOURLY_SAMPLES: usize = 10;
/// Sample count at which calibration confidence saturates.
const CONFIDENCE_SAMPLES: f64 = 50.0;
const DEFAULT_AUTO_WARN_PCT: f64 = 0.9;

/// One completed request attempt. Never mutated after it is recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSample {
    pub ts: DateTime<Utc>,
    pub model: String,
    #[serde(default)]
    pub lane: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Wall-clock seconds of the attempt.
    pub dirty_seconds: f64,
    /// Effective streaming seconds; equals `dirty_seconds` when nothing streamed.
    pub stream_seconds: f64,
    pub ttft_ms: u64,
    #[serde(default)]
    pub status: u16,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub reroute_mode: String,
}

impl UsageSample {
    pub fn new(
        model: impl Into<String>,
        input_tokens: u64,
        output_tokens: u64,
        dirty: Duration,
        stream: Duration,
        ttft: Option<Duration>,
    ) -> Self {
        let dirty_seconds = dirty.as_secs_f64();
        let stream_seconds = if stream.is_zero() {
            dirty_seconds
        } else {
            stream.as_secs_f64()
        };
        Self {
            ts: Utc::now(),
            model: model.into(),
            lane: String::new(),
            input_tokens,
            output_tokens,
            dirty_seconds,
            stream_seconds,
            ttft_ms: ttft.map(|t| t.as_millis() as u64).unwrap_or(0),
            status: 0,
            reason: String::new(),
            reroute_mode: String::new(),
        }
    }

    pub fn with_outcome(
        mut self,
        lane: impl Into<String>,
        status: u16,
        reason: impl Into<String>,
        reroute_mode: impl Into<String>,
    ) -> Self {
        self.lane = lane.into();
        self.status = status;
        self.reason = reason.into();
        self.reroute_mode = reroute_mode.into();
        self
    }

    pub fn at(mut self, ts: DateTime<Utc>) -> Self {
        self.ts = ts;
        self
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn effective_stream_seconds(&self) -> f64 {
        if self.stream_seconds > 0.0 {
            self.stream_seconds
        } else {
            self.dirty_seconds
        }
    }
}

#[derive(Debug, Default)]
struct ModelCounters {
    samples: Vec<UsageSample>,
    session_in: u64,
    session_out: u64,
    session_dirty: f64,
    session_stream: f64,
    session_count: u64,
}

/// Auto-derived warn threshold and observed 429 gap statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalibrationStats {
    pub warn_pct_auto: f64,
    pub warn_confidence: f64,
    pub gap_seconds_p50: f64,
    pub gap_seconds_p95: f64,
    pub gap_samples: u64,
}

/// Quota state of one model as seen by the router.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuotaDecisionInfo {
    pub rolling_used: u64,
    pub rolling_capacity: u64,
    pub rolling_pct: f64,
    pub weekly_used: u64,
    /// Only set for token-based weekly limits.
    pub weekly_capacity: u64,
    pub weekly_pct: f64,
    pub warn: bool,
    pub block: bool,
    pub warn_pct_config: f64,
    pub warn_pct_auto: f64,
    pub warn_confidence: f64,
    pub gap_seconds_p50: f64,
    pub gap_seconds_p95: f64,
    pub gap_samples: u64,
}

/// Window sums and flags for one model at one instant.
#[derive(Debug, Clone, Default)]
struct Evaluation {
    rolling_in: u64,
    rolling_out: u64,
    weekly_tokens: u64,
    rolling_pct: f64,
    weekly_pct: f64,
    warn: bool,
    block: bool,
}

struct LedgerInner {
    cfg: QuotasFile,
    path: Option<PathBuf>,
    loaded: DateTime<Utc>,
    rolling_window: Duration,
    weekly_window: Duration,
    models: HashMap<String, ModelCounters>,
    calibration: HashMap<String, CalibrationStats>,
    license: Option<LicenseSummary>,
}

fn cutoff(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|w| now.checked_sub_signed(w))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl LedgerInner {
    fn prune(&mut self, now: DateTime<Utc>) {
        let weekly_cutoff = cutoff(now, self.weekly_window);
        for counters in self.models.values_mut() {
            counters.samples.retain(|s| s.ts > weekly_cutoff);
        }
    }

    fn evaluate(&self, model: &str, now: DateTime<Utc>) -> Evaluation {
        let mut eval = Evaluation::default();
        let cfg = self.cfg.model(model).cloned().unwrap_or_default();
        let rolling_cutoff = cutoff(now, self.rolling_window);
        let weekly_cutoff = cutoff(now, self.weekly_window);

        let mut weekly_dirty = 0.0;
        if let Some(counters) = self.models.get(model) {
            for s in &counters.samples {
                if s.ts > rolling_cutoff {
                    eval.rolling_in += s.input_tokens;
                    eval.rolling_out += s.output_tokens;
                }
                if s.ts > weekly_cutoff {
                    eval.weekly_tokens += s.total_tokens();
                    weekly_dirty += s.dirty_seconds;
                }
            }
        }

        if let Some(cap) = cfg.rolling_cap() {
            eval.rolling_pct = (eval.rolling_in + eval.rolling_out) as f64 / cap as f64;
            if eval.rolling_pct >= 1.0 {
                eval.block = true;
            }
        }
        match cfg.weekly_limit() {
            Some(WeeklyLimit::Hours(hours)) => {
                eval.weekly_pct = weekly_dirty / (hours as f64 * 3600.0);
            }
            Some(WeeklyLimit::Tokens(cap)) => {
                eval.weekly_pct = eval.weekly_tokens as f64 / cap as f64;
                if eval.weekly_pct >= 1.0 {
                    eval.block = true;
                }
            }
            None => {}
        }
        if cfg.warn_pct > 0.0 && eval.rolling_pct >= cfg.warn_pct {
            eval.warn = true;
        }
        eval
    }

    fn initial_calibration(&self, model: &str) -> CalibrationStats {
        let cfg_warn = self.cfg.model(model).map(|c| c.warn_pct).unwrap_or(0.0);
        CalibrationStats {
            warn_pct_auto: cfg_warn.max(0.0),
            ..Default::default()
        }
    }

    fn calibration_entry(&mut self, model: &str) -> &mut CalibrationStats {
        if !self.calibration.contains_key(model) {
            let initial = self.initial_calibration(model);
            self.calibration.insert(model.to_string(), initial);
        }
        self.calibration.entry(model.to_string()).or_default()
    }

    /// Calibration for `model` without creating an entry for it.
    fn calibration_snapshot(&self, model: &str) -> CalibrationStats {
        self.calibration
            .get(model)
            .cloned()
            .unwrap_or_else(|| self.initial_calibration(model))
    }
}

/// Shared quota state. Cheap to share behind an `Arc`.
pub struct QuotaLedger {
    inner: Mutex<LedgerInner>,
}

impl QuotaLedger {
    pub fn new(cfg: QuotasFile, path: Option<PathBuf>) -> Self {
        let rolling_window = cfg.rolling_window();
        let weekly_window = cfg.weekly_window();
        Self {
            inner: Mutex::new(LedgerInner {
                cfg,
                path,
                loaded: Utc::now(),
                rolling_window,
                weekly_window,
                models: HashMap::new(),
                calibration: HashMap::new(),
                license: None,
            }),
        }
    }

    /// Load from the first usable path, or start with the built-in defaults.
    pub fn from_paths(paths: &[PathBuf]) -> Self {
        match load_quotas(paths) {
            Ok((cfg, path)) => {
                tracing::info!(
                    path = %path.display(),
                    models = cfg.models.len(),
                    "Loaded quotas"
                );
                Self::new(cfg, Some(path))
            }
            Err(e) => {
                tracing::info!("Using built-in quotas ({:#})", e);
                Self::new(QuotasFile::builtin(), None)
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, LedgerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a sample, update session totals and prune the weekly window.
    pub fn record_usage(&self, sample: UsageSample) {
        self.record_usage_at(sample, Utc::now());
    }

    pub fn record_usage_at(&self, mut sample: UsageSample, now: DateTime<Utc>) {
        if sample.dirty_seconds < 0.0 {
            sample.dirty_seconds = 0.0;
        }
        if sample.stream_seconds <= 0.0 {
            sample.stream_seconds = sample.dirty_seconds;
        }

        let mut inner = self.lock();
        let counters = inner.models.entry(sample.model.clone()).or_default();
        counters.session_in += sample.input_tokens;
        counters.session_out += sample.output_tokens;
        counters.session_dirty += sample.dirty_seconds;
        counters.session_stream += sample.stream_seconds;
        counters.session_count += 1;
        counters.samples.push(sample);
        inner.prune(now);
    }

    pub fn decision_info(&self, model: &str) -> QuotaDecisionInfo {
        self.decision_info_at(model, Utc::now())
    }

    pub fn decision_info_at(&self, model: &str, now: DateTime<Utc>) -> QuotaDecisionInfo {
        let mut inner = self.lock();
        inner.prune(now);
        // configured models are tracked from first sight; anything else only
        // once it has recorded usage, so arbitrary client model names stay out
        if inner.cfg.model(model).is_some() {
            inner.models.entry(model.to_string()).or_default();
        }

        let cfg = inner.cfg.model(model).cloned().unwrap_or_default();
        let eval = inner.evaluate(model, now);
        let stats = inner.calibration_snapshot(model);

        QuotaDecisionInfo {
            rolling_used: eval.rolling_in + eval.rolling_out,
            rolling_capacity: cfg.rolling_cap().unwrap_or(0),
            rolling_pct: eval.rolling_pct,
            weekly_used: eval.weekly_tokens,
            weekly_capacity: cfg.weekly_token_cap().unwrap_or(0),
            weekly_pct: eval.weekly_pct,
            warn: eval.warn,
            block: eval.block,
            warn_pct_config: cfg.warn_pct,
            warn_pct_auto: if stats.warn_pct_auto > 0.0 {
                stats.warn_pct_auto
            } else {
                cfg.warn_pct
            },
            warn_confidence: stats.warn_confidence,
            gap_seconds_p50: stats.gap_seconds_p50,
            gap_seconds_p95: stats.gap_seconds_p95,
            gap_samples: stats.gap_samples,
        }
    }

    pub fn should_block(&self, model: &str) -> bool {
        self.decision_info(model).block
    }

    /// Count an observed quota 429 for calibration.
    pub fn note_quota_429(&self, model: &str) {
        let mut inner = self.lock();
        inner.calibration_entry(model).gap_samples += 1;
    }

    pub fn calibration(&self, model: &str) -> CalibrationStats {
        self.lock().calibration_snapshot(model)
    }

    /// Number of models the ledger is tracking.
    pub fn tracked_models(&self) -> usize {
        self.lock().models.len()
    }

    /// One calibration pass over every model with recorded samples.
    pub fn run_calibration_tick(&self, probe: &HashMap<String, ProbeGap>) {
        let mut inner = self.lock();
        let models: Vec<(String, usize)> = inner
            .models
            .iter()
            .map(|(name, c)| (name.clone(), c.samples.len()))
            .collect();

        for (model, count) in models {
            let cfg_warn = inner.cfg.model(&model).map(|c| c.warn_pct).unwrap_or(0.0);
            let stats = inner.calibration_entry(&model);
            if cfg_warn > 0.0 {
                stats.warn_pct_auto = cfg_warn;
            } else if stats.warn_pct_auto <= 0.0 {
                stats.warn_pct_auto = DEFAULT_AUTO_WARN_PCT;
            }
            stats.warn_confidence = if count > 0 {
                (count as f64 / CONFIDENCE_SAMPLES).min(1.0)
            } else {
                0.0
            };
            if let Some(gap) = probe.get(&model.to_lowercase()) {
                if gap.gap_seconds_p50 > 0.0 {
                    stats.gap_seconds_p50 = gap.gap_seconds_p50;
                }
                if gap.gap_seconds_p95 > 0.0 {
                    stats.gap_seconds_p95 = gap.gap_seconds_p95;
                }
                if gap.samples > 0 {
                    stats.gap_samples = gap.samples;
                }
            }
        }
    }

    /// Swap in a new configuration. Recorded samples are kept.
    pub fn reload(&self, cfg: QuotasFile, path: Option<PathBuf>) {
        let mut inner = self.lock();
        inner.rolling_window = cfg.rolling_window();
        inner.weekly_window = cfg.weekly_window();
        inner.cfg = cfg;
        inner.path = path;
        inner.loaded = Utc::now();
    }

    pub fn set_license_summary(&self, summary: Option<LicenseSummary>) {
        self.lock().license = summary;
    }

    pub fn config_dump(&self) -> QuotaConfigDump {
        let inner = self.lock();
        QuotaConfigDump {
            config: inner.cfg.clone(),
            path: path_string(&inner.path),
            loaded: inner.loaded.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        }
    }

    pub fn windows(&self) -> (Duration, Duration) {
        let inner = self.lock();
        (inner.rolling_window, inner.weekly_window)
    }

    pub fn usage_report(&self) -> UsageReport {
        self.usage_report_at(Utc::now())
    }

    pub fn usage_report_at(&self, now: DateTime<Utc>) -> UsageReport {
        let mut inner = self.lock();
        inner.prune(now);

        let mut models = BTreeMap::new();
        let names: Vec<String> = inner.models.keys().cloned().collect();
        for model in names {
            let eval = inner.evaluate(&model, now);
            let stats = inner.calibration_snapshot(&model);
            let view = build_model_view(&inner, &model, &eval, &stats, now);
            models.insert(model, view);
        }

        UsageReport {
            models,
            ts: unix_seconds(now),
            path: path_string(&inner.path),
            license: inner.license.clone(),
        }
    }
}

fn path_string(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_default()
}

pub(crate) fn unix_seconds(ts: DateTime<Utc>) -> f64 {
    ts.timestamp_micros() as f64 / 1e6
}

fn build_model_view(
    inner: &LedgerInner,
    model: &str,
    eval: &Evaluation,
    stats: &CalibrationStats,
    now: DateTime<Utc>,
) -> ModelUsageView {
    let cfg = inner.cfg.model(model).cloned().unwrap_or_default();
    let rolling_cutoff = cutoff(now, inner.rolling_window);
    let empty = ModelCounters::default();
    let counters = inner.models.get(model).unwrap_or(&empty);

    let mut rolling_dirty = 0.0;
    let mut rolling_stream = 0.0;
    let mut rolling_count = 0usize;
    let mut oldest_rolling: Option<DateTime<Utc>> = None;
    let mut ttft_values: Vec<f64> = Vec::new();
    let mut hour_out = [0u64; 24];
    let mut hour_stream = [0f64; 24];
    let mut hour_dirty = [0f64; 24];
    let mut hour_samples = [0usize; 24];

    for s in &counters.samples {
        let effective = s.effective_stream_seconds();
        if s.ts > rolling_cutoff {
            rolling_count += 1;
            rolling_dirty += s.dirty_seconds;
            rolling_stream += effective;
            ttft_values.push(s.ttft_ms as f64);
            if oldest_rolling.map_or(true, |oldest| s.ts < oldest) {
                oldest_rolling = Some(s.ts);
            }
        }
        let hour = s.ts.with_timezone(&Local).hour() as usize;
        hour_samples[hour] += 1;
        hour_out[hour] += s.output_tokens;
        hour_stream[hour] += effective;
        hour_dirty[hour] += s.dirty_seconds;
    }

    let eta_rolling_sec = oldest_rolling
        .and_then(|oldest| {
            let expires = oldest + chrono::Duration::from_std(inner.rolling_window).ok()?;
            Some((expires - now).num_seconds().max(0))
        })
        .unwrap_or(0);

    ttft_values.sort_by(|a, b| a.total_cmp(b));
    let hourly = (0..24)
        .map(|hour| {
            let mut bucket = HourSpeed {
                hour: hour as u32,
                samples: hour_samples[hour],
                out_elr_tps: None,
                out_dirty_tps: None,
            };
            if hour_samples[hour] >= MIN_HOURLY_SAMPLES {
                if hour_stream[hour] > 0.0 {
                    bucket.out_elr_tps = Some(calc_tps(hour_out[hour], hour_stream[hour]));
                }
                if hour_dirty[hour] > 0.0 {
                    bucket.out_dirty_tps = Some(calc_tps(hour_out[hour], hour_dirty[hour]));
                }
            }
            bucket
        })
        .collect();

    ModelUsageView {
        provider: cfg.provider.clone(),
        rolling_in: eval.rolling_in,
        rolling_out: eval.rolling_out,
        rolling_pct: eval.rolling_pct,
        weekly_pct: eval.weekly_pct,
        reqs: rolling_count as u64,
        eta_rolling_sec,
        warn: eval.warn,
        block: eval.block,
        warn_pct_auto: stats.warn_pct_auto,
        warn_pct_confidence: stats.warn_confidence,
        gap_seconds_p50: stats.gap_seconds_p50,
        gap_seconds_p95: stats.gap_seconds_p95,
        gap_samples: stats.gap_samples,
        speeds: ModelSpeeds {
            rolling: SpeedSnapshot::from_totals(
                eval.rolling_in,
                eval.rolling_out,
                rolling_stream,
                rolling_dirty,
            ),
            session: SpeedSnapshot::from_totals(
                counters.session_in,
                counters.session_out,
                counters.session_stream,
                counters.session_dirty,
            ),
            ttft_ms: TtftSnapshot {
                p50: percentile_linear(&ttft_values, 0.50),
                p90: percentile_linear(&ttft_values, 0.90),
                p99: percentile_linear(&ttft_values, 0.99),
            },
            hourly,
            rolling_samples: rolling_count,
            weekly_samples: counters.samples.len(),
        },
    }
}

/// Tokens per second, zero when either side is non-positive.
pub fn calc_tps(tokens: u64, seconds: f64) -> f64 {
    if tokens == 0 || seconds <= 0.0 {
        0.0
    } else {
        tokens as f64 / seconds
    }
}

/// Percentile of pre-sorted values with linear interpolation between ranks.
pub fn percentile_linear(sorted: &[f64], p: f64) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    if p <= 0.0 {
        return sorted[0];
    }
    if p >= 1.0 {
        return sorted[n - 1];
    }
    let pos = p * (n - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    if lower == upper {
        return sorted[lower];
    }
    let weight = pos - lower as f64;
    sorted[lower] * (1.0 - weight) + sorted[upper] * weight
}

fn is_zero_f64(v: &f64) -> bool {
    *v == 0.0
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SpeedSnapshot {
    pub out_elr_tps: f64,
    pub out_dirty_tps: f64,
    pub in_elr_tps: f64,
    pub in_dirty_tps: f64,
    pub total_elr_tps: f64,
    pub total_dirty_tps: f64,
}

impl SpeedSnapshot {
    fn from_totals(input: u64, output: u64, stream: f64, dirty: f64) -> Self {
        Self {
            out_elr_tps: calc_tps(output, stream),
            out_dirty_tps: calc_tps(output, dirty),
            in_elr_tps: calc_tps(input, stream),
            in_dirty_tps: calc_tps(input, dirty),
            total_elr_tps: calc_tps(input + output, stream),
            total_dirty_tps: calc_tps(input + output, dirty),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TtftSnapshot {
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HourSpeed {
    pub hour: u32,
    pub samples: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub out_elr_tps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub out_dirty_tps: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelSpeeds {
    pub rolling: SpeedSnapshot,
    pub session: SpeedSnapshot,
    pub ttft_ms: TtftSnapshot,
    pub hourly: Vec<HourSpeed>,
    pub rolling_samples: usize,
    pub weekly_samples: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelUsageView {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub provider: String,
    pub rolling_in: u64,
    pub rolling_out: u64,
    pub rolling_pct: f64,
    pub weekly_pct: f64,
    pub reqs: u64,
    pub eta_rolling_sec: i64,
    pub warn: bool,
    pub block: bool,
    #[serde(skip_serializing_if = "is_zero_f64")]
    pub warn_pct_auto: f64,
    #[serde(skip_serializing_if = "is_zero_f64")]
    pub warn_pct_confidence: f64,
    #[serde(skip_serializing_if = "is_zero_f64")]
    pub gap_seconds_p50: f64,
    #[serde(skip_serializing_if = "is_zero_f64")]
    pub gap_seconds_p95: f64,
    #[serde(skip_serializing_if = "is_zero_u64")]
    pub gap_samples: u64,
    pub speeds: ModelSpeeds,
}

/// Body of `GET /v1/usage`.
#[derive(Debug, Clone, Serialize)]
pub struct UsageReport {
    pub models: BTreeMap<String, ModelUsageView>,
    pub ts: f64,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license: Option<LicenseSummary>,
}

/// Body of `GET /v1/quotas`.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaConfigDump {
    pub config: QuotasFile,
    pub path: String,
    pub loaded: String,
}
