//! Decision and completion events.
//!
//! Every `/v1/messages` request produces one decision event before the first
//! dispatch, one more for a fallback, and exactly one completion event. All of
//! them carry the same `rid`.

use crate::core::usage_log::JsonlWriter;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

pub const EVENT_DECISION: &str = "decision";

fn is_false(v: &bool) -> bool {
    !*v
}

fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

fn is_zero_f64(v: &f64) -> bool {
    *v == 0.0
}

/// One line of `usage.jsonl`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageEntry {
    pub ts: f64,
    pub rid: String,
    pub lane: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// `-1` on decision events.
    pub status: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub op: String,
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(default)]
    pub stream_ms: u64,
    #[serde(default)]
    pub ttft_ms: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub err_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub upstream: String,
    #[serde(default)]
    pub h2: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub header_mode: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub retry: bool,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub backoff_ms: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub event: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub decision: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub decision_reason: String,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub rolling_used_tokens: u64,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub rolling_capacity_tokens: u64,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub weekly_used_tokens: u64,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub weekly_capacity_tokens: u64,
    #[serde(default)]
    pub headroom_pct_rolling: f64,
    #[serde(default)]
    pub headroom_pct_weekly: f64,
    #[serde(rename = "warn_pct_cfg", default, skip_serializing_if = "is_zero_f64")]
    pub warn_pct_config: f64,
    #[serde(default, skip_serializing_if = "is_zero_f64")]
    pub warn_pct_auto: f64,
    #[serde(default, skip_serializing_if = "is_zero_f64")]
    pub warn_pct_confidence: f64,
    #[serde(default, skip_serializing_if = "is_zero_f64")]
    pub gap_seconds_p50: f64,
    #[serde(default, skip_serializing_if = "is_zero_f64")]
    pub gap_seconds_p95: f64,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub gap_samples: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reroute_mode: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reroute_decision: String,
    #[serde(default)]
    pub preferred_attempt: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub cooldown_active: bool,
    #[serde(default, skip_serializing_if = "is_zero_f64")]
    pub cooldown_next_ts: f64,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub wasted_retry_ms: i64,
}

impl UsageEntry {
    pub fn is_decision(&self) -> bool {
        self.event == EVENT_DECISION
    }
}

/// Line of `anomalies.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub ts: f64,
    pub rid: String,
    pub event: String,
    pub status: u16,
    pub delay_s: f64,
    pub lane: String,
    pub model: String,
}

/// Destination for usage events. Implementations must not block the caller.
pub trait TelemetrySink: Send + Sync {
    fn record(&self, entry: &UsageEntry);
    fn anomaly(&self, record: &AnomalyRecord);
}

/// JSONL files with size rotation.
pub struct JsonlTelemetry {
    usage: JsonlWriter,
    anomalies: JsonlWriter,
}

impl JsonlTelemetry {
    pub fn new(usage: JsonlWriter, anomalies: JsonlWriter) -> Self {
        Self { usage, anomalies }
    }

    pub async fn flush(&self) {
        self.usage.flush().await;
        self.anomalies.flush().await;
    }
}

impl TelemetrySink for JsonlTelemetry {
    fn record(&self, entry: &UsageEntry) {
        tracing::debug!(
            rid = %entry.rid,
            lane = %entry.lane,
            model = %entry.model,
            status = entry.status,
            event = %entry.event,
            decision = %entry.decision_reason,
            "usage event"
        );
        self.usage.write(entry);
    }

    fn anomaly(&self, record: &AnomalyRecord) {
        self.anomalies.write(record);
    }
}

/// In-process sink, inspectable from tests and tooling.
#[derive(Default)]
pub struct MemoryTelemetry {
    entries: Mutex<Vec<UsageEntry>>,
    anomalies: Mutex<Vec<AnomalyRecord>>,
}

impl MemoryTelemetry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn entries(&self) -> Vec<UsageEntry> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn entries_for(&self, rid: &str) -> Vec<UsageEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.rid == rid)
            .collect()
    }

    pub fn decisions(&self) -> Vec<UsageEntry> {
        self.entries().into_iter().filter(|e| e.is_decision()).collect()
    }

    pub fn completions(&self) -> Vec<UsageEntry> {
        self.entries().into_iter().filter(|e| !e.is_decision()).collect()
    }

    pub fn anomalies(&self) -> Vec<AnomalyRecord> {
        self.anomalies.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl TelemetrySink for MemoryTelemetry {
    fn record(&self, entry: &UsageEntry) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry.clone());
    }

    fn anomaly(&self, record: &AnomalyRecord) {
        self.anomalies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record.clone());
    }
}

/// Sink used when the usage log is disabled: events go to tracing only.
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn record(&self, entry: &UsageEntry) {
        tracing::debug!(
            rid = %entry.rid,
            lane = %entry.lane,
            model = %entry.model,
            status = entry.status,
            event = %entry.event,
            decision = %entry.decision_reason,
            "usage event"
        );
    }

    fn anomaly(&self, record: &AnomalyRecord) {
        tracing::warn!(
            rid = %record.rid,
            lane = %record.lane,
            status = record.status,
            delay_s = record.delay_s,
            "{}",
            record.event
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_event_serialization() {
        let entry = UsageEntry {
            ts: 1.5,
            rid: "r1".into(),
            lane: "zai".into(),
            model: "glm-4.6".into(),
            status: -1,
            event: EVENT_DECISION.into(),
            decision: "quota_block".into(),
            decision_reason: "quota_block".into(),
            warn_pct_config: 0.8,
            headroom_pct_rolling: 1.0,
            headroom_pct_weekly: 1.0,
            ..Default::default()
        };
        let v = serde_json::to_value(&entry).unwrap();
        assert_eq!(v["status"], -1);
        assert_eq!(v["event"], "decision");
        assert_eq!(v["warn_pct_cfg"], 0.8);
        assert!(v.get("err_type").is_none());
        assert!(v.get("retry").is_none());
        assert!(entry.is_decision());
    }

    #[test]
    fn test_memory_sink_groups_by_rid() {
        let sink = MemoryTelemetry::new();
        for (rid, event) in [("a", EVENT_DECISION), ("a", ""), ("b", EVENT_DECISION)] {
            sink.record(&UsageEntry {
                rid: rid.into(),
                event: event.into(),
                ..Default::default()
            });
        }
        assert_eq!(sink.entries_for("a").len(), 2);
        assert_eq!(sink.decisions().len(), 2);
        assert_eq!(sink.completions().len(), 1);
    }

    #[tokio::test]
    async fn test_jsonl_sink_writes_lines() {
        let dir = tempfile::tempdir().unwrap();
        let usage = JsonlWriter::spawn(dir.path().join("usage.jsonl"), 0, 16)
            .await
            .unwrap();
        let anomalies = JsonlWriter::spawn(dir.path().join("anomalies.jsonl"), 0, 16)
            .await
            .unwrap();
        let sink = JsonlTelemetry::new(usage, anomalies);
        sink.record(&UsageEntry {
            rid: "r9".into(),
            status: 200,
            ..Default::default()
        });
        sink.anomaly(&AnomalyRecord {
            ts: 1.0,
            rid: "r9".into(),
            event: "backoff".into(),
            status: 429,
            delay_s: 0.25,
            lane: "zai".into(),
            model: "glm".into(),
        });
        sink.flush().await;

        let text = std::fs::read_to_string(dir.path().join("usage.jsonl")).unwrap();
        let parsed: UsageEntry = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(parsed.rid, "r9");
        let anomalies = std::fs::read_to_string(dir.path().join("anomalies.jsonl")).unwrap();
        assert!(anomalies.contains("\"backoff\""));
    }
}
