//! Sample store and hourly/daily rollups.
//!
//! The proxy writes one [`StoredSample`] per completed request. Rollups are
//! recomputed from samples by the background rollup loop; both are served by
//! the `/v1/usage/samples` and `/v1/usage/rollups` endpoints.

use crate::services::quota::percentile_linear;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

const HOUR_ROLLUP_LOOKBACK_HOURS: i64 = 48;
const DAY_ROLLUP_LOOKBACK_DAYS: i64 = 31;

/// Persisted record of one completed request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredSample {
    /// Unix seconds.
    pub ts: f64,
    pub rid: String,
    pub model: String,
    pub lane: String,
    pub op: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub dirty_s: f64,
    pub stream_s: f64,
    pub ttft_ms: u64,
    pub status: u16,
    #[serde(default)]
    pub err_type: String,
    #[serde(default)]
    pub decision: String,
    #[serde(default)]
    pub reroute_mode: String,
    #[serde(default)]
    pub warn_pct_auto: f64,
    #[serde(default)]
    pub gap_seconds_p50: f64,
    #[serde(default)]
    pub gap_seconds_p95: f64,
    #[serde(default)]
    pub gap_samples: u64,
    #[serde(default)]
    pub upstream: String,
    #[serde(default)]
    pub h2: bool,
    #[serde(default)]
    pub header_mode: String,
}

impl StoredSample {
    fn effective_stream_s(&self) -> f64 {
        if self.stream_s > 0.0 {
            self.stream_s
        } else {
            self.dirty_s
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HourRollup {
    /// Unix seconds of the hour start.
    pub window_start: f64,
    pub model: String,
    pub in_tokens: u64,
    pub out_tokens: u64,
    pub dirty_s: f64,
    pub stream_s: f64,
    pub count: u64,
    pub p50_ttft: f64,
    pub p90_ttft: f64,
    pub p99_ttft: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DayRollup {
    /// `YYYY-MM-DD` in UTC.
    pub date: String,
    pub model: String,
    pub in_tokens: u64,
    pub out_tokens: u64,
    pub dirty_s: f64,
    pub stream_s: f64,
    pub count: u64,
}

/// Persistence for usage samples. Failures are never surfaced to clients.
pub trait Store: Send + Sync {
    fn write_sample(&self, sample: StoredSample) -> Result<()>;
    /// Samples with `ts >= since`, optionally for one model, oldest first.
    fn list_samples(&self, since: f64, model: Option<&str>) -> Result<Vec<StoredSample>>;
    /// Recompute hour rollups; returns the number of windows written.
    fn rollup_hour(&self, now: DateTime<Utc>) -> Result<usize>;
    fn rollup_day(&self, now: DateTime<Utc>) -> Result<usize>;
    fn list_rollups_hour(&self, since: f64, model: Option<&str>) -> Result<Vec<HourRollup>>;
    fn list_rollups_day(&self, since: f64, model: Option<&str>) -> Result<Vec<DayRollup>>;
    /// Drop samples older than `cutoff`; returns how many were removed.
    fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;
    fn size_bytes(&self) -> u64;
    fn close(&self) -> Result<()>;
}

#[derive(Default)]
struct MemoryInner {
    samples: Vec<StoredSample>,
    hours: BTreeMap<(i64, String), HourRollup>,
    days: BTreeMap<(String, String), DayRollup>,
    closed: bool,
}

/// In-process [`Store`].
pub struct MemoryStore {
    retention_days: u32,
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new(retention_days: u32) -> Self {
        Self {
            retention_days,
            inner: Mutex::new(MemoryInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn retention_cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        (self.retention_days > 0).then(|| now - Duration::days(self.retention_days as i64))
    }
}

fn model_matches(filter: Option<&str>, model: &str) -> bool {
    filter.map_or(true, |m| m.is_empty() || m == model)
}

fn day_key(ts: f64) -> String {
    DateTime::<Utc>::from_timestamp(ts as i64, 0)
        .unwrap_or_default()
        .format("%Y-%m-%d")
        .to_string()
}

impl Store for MemoryStore {
    fn write_sample(&self, sample: StoredSample) -> Result<()> {
        let mut inner = self.lock();
        if inner.closed {
            anyhow::bail!("store closed");
        }
        inner.samples.push(sample);
        Ok(())
    }

    fn list_samples(&self, since: f64, model: Option<&str>) -> Result<Vec<StoredSample>> {
        let inner = self.lock();
        let mut out: Vec<StoredSample> = inner
            .samples
            .iter()
            .filter(|s| s.ts >= since && model_matches(model, &s.model))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.ts.total_cmp(&b.ts));
        Ok(out)
    }

    fn rollup_hour(&self, now: DateTime<Utc>) -> Result<usize> {
        let since = (now - Duration::hours(HOUR_ROLLUP_LOOKBACK_HOURS)).timestamp() as f64;
        let mut inner = self.lock();

        let mut windows: BTreeMap<(i64, String), (HourRollup, Vec<f64>)> = BTreeMap::new();
        for s in inner.samples.iter().filter(|s| s.ts >= since) {
            let win = (s.ts / 3600.0).floor() as i64 * 3600;
            let (rollup, ttfts) = windows
                .entry((win, s.model.clone()))
                .or_insert_with(|| {
                    (
                        HourRollup {
                            window_start: win as f64,
                            model: s.model.clone(),
                            ..Default::default()
                        },
                        Vec::new(),
                    )
                });
            rollup.in_tokens += s.input_tokens;
            rollup.out_tokens += s.output_tokens;
            rollup.dirty_s += s.dirty_s;
            rollup.stream_s += s.effective_stream_s();
            rollup.count += 1;
            ttfts.push(s.ttft_ms as f64);
        }

        let written = windows.len();
        for (key, (mut rollup, mut ttfts)) in windows {
            ttfts.sort_by(|a, b| a.total_cmp(b));
            rollup.p50_ttft = percentile_linear(&ttfts, 0.50);
            rollup.p90_ttft = percentile_linear(&ttfts, 0.90);
            rollup.p99_ttft = percentile_linear(&ttfts, 0.99);
            inner.hours.insert(key, rollup);
        }
        if let Some(cutoff) = self.retention_cutoff(now) {
            let cutoff = cutoff.timestamp();
            inner.hours.retain(|(win, _), _| *win >= cutoff);
        }
        Ok(written)
    }

    fn rollup_day(&self, now: DateTime<Utc>) -> Result<usize> {
        let since = (now - Duration::days(DAY_ROLLUP_LOOKBACK_DAYS)).timestamp() as f64;
        let mut inner = self.lock();

        let mut days: BTreeMap<(String, String), DayRollup> = BTreeMap::new();
        for s in inner.samples.iter().filter(|s| s.ts >= since) {
            let date = day_key(s.ts);
            let rollup = days
                .entry((date.clone(), s.model.clone()))
                .or_insert_with(|| DayRollup {
                    date,
                    model: s.model.clone(),
                    ..Default::default()
                });
            rollup.in_tokens += s.input_tokens;
            rollup.out_tokens += s.output_tokens;
            rollup.dirty_s += s.dirty_s;
            rollup.stream_s += s.effective_stream_s();
            rollup.count += 1;
        }

        let written = days.len();
        inner.days.extend(days);
        if let Some(cutoff) = self.retention_cutoff(now) {
            let cutoff = cutoff.format("%Y-%m-%d").to_string();
            inner.days.retain(|(date, _), _| *date >= cutoff);
        }
        Ok(written)
    }

    fn list_rollups_hour(&self, since: f64, model: Option<&str>) -> Result<Vec<HourRollup>> {
        let inner = self.lock();
        Ok(inner
            .hours
            .values()
            .filter(|r| r.window_start >= since && model_matches(model, &r.model))
            .cloned()
            .collect())
    }

    fn list_rollups_day(&self, since: f64, model: Option<&str>) -> Result<Vec<DayRollup>> {
        let since_day = day_key(since);
        let inner = self.lock();
        Ok(inner
            .days
            .values()
            .filter(|r| r.date >= since_day && model_matches(model, &r.model))
            .cloned()
            .collect())
    }

    fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let cutoff = cutoff.timestamp() as f64;
        let mut inner = self.lock();
        let before = inner.samples.len();
        inner.samples.retain(|s| s.ts >= cutoff);
        Ok(before - inner.samples.len())
    }

    fn size_bytes(&self) -> u64 {
        let inner = self.lock();
        let samples = inner.samples.len() * std::mem::size_of::<StoredSample>();
        let hours = inner.hours.len() * std::mem::size_of::<HourRollup>();
        let days = inner.days.len() * std::mem::size_of::<DayRollup>();
        (samples + hours + days) as u64
    }

    fn close(&self) -> Result<()> {
        self.lock().closed = true;
        Ok(())
    }
}
