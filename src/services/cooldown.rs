//! Per-model cooldown after a quota 429 on the offload lane.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::time::Duration;

/// Map of model → time of the last quota 429.
///
/// Kept apart from the quota ledger so the decision path never waits on
/// ledger work.
pub struct CooldownTracker {
    cooldown: Duration,
    last_429: DashMap<String, DateTime<Utc>>,
}

impl CooldownTracker {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_429: DashMap::new(),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub fn mark(&self, model: &str) {
        self.mark_at(model, Utc::now());
    }

    pub fn mark_at(&self, model: &str, ts: DateTime<Utc>) {
        self.last_429.insert(model.to_string(), ts);
    }

    /// `(active, until)`; `until` is set whenever a 429 was ever recorded.
    pub fn info(&self, model: &str) -> (bool, Option<DateTime<Utc>>) {
        self.info_at(model, Utc::now())
    }

    pub fn info_at(&self, model: &str, now: DateTime<Utc>) -> (bool, Option<DateTime<Utc>>) {
        let Some(ts) = self.last_429.get(model).map(|entry| *entry.value()) else {
            return (false, None);
        };
        let until = chrono::Duration::from_std(self.cooldown)
            .ok()
            .and_then(|d| ts.checked_add_signed(d))
            .unwrap_or(ts);
        (now < until, Some(until))
    }
}
