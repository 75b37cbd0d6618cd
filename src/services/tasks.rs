//! Periodic background work owned by the server lifecycle.
//!
//! The calibrator refreshes per-model warn thresholds and probe gaps; the
//! rollup loop compacts stored samples. Both stop when [`BackgroundTasks::shutdown`]
//! flips the shared `watch` channel.

use crate::core::metrics::get_metrics;
use crate::services::calibration::load_probe_gaps;
use crate::services::quota::QuotaLedger;
use crate::services::store::Store;
use chrono::{Datelike, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub struct BackgroundTasks {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            handles: Vec::new(),
        }
    }

    /// Run one calibration pass now and then every `interval`.
    pub fn spawn_calibrator(&mut self, ledger: Arc<QuotaLedger>, probe_path: PathBuf, interval: Duration) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let probe = load_probe_gaps(&probe_path);
                        ledger.run_calibration_tick(&probe);
                        tracing::debug!(probe_models = probe.len(), "Calibration tick");
                    }
                    _ = shutdown_rx.changed() => {
                        tracing::info!("Calibrator shutting down");
                        break;
                    }
                }
            }
        });
        self.handles.push(handle);
    }

    /// Hourly rollups every `interval`, daily rollups on UTC day change, and
    /// sample pruning past `sample_ttl`.
    pub fn spawn_rollups(&mut self, store: Arc<dyn Store>, interval: Duration, sample_ttl: Duration) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // the first tick fires immediately; rollups start one interval in
            ticker.tick().await;
            let mut last_day = Utc::now().ordinal();
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        last_day = run_rollup_pass(store.as_ref(), last_day, sample_ttl);
                    }
                    _ = shutdown_rx.changed() => {
                        tracing::info!("Rollup loop shutting down");
                        break;
                    }
                }
            }
        });
        self.handles.push(handle);
    }

    /// Signal every task and wait for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::warn!("Background task ended abnormally: {}", e);
            }
        }
    }
}

impl Default for BackgroundTasks {
    fn default() -> Self {
        Self::new()
    }
}

/// One rollup pass; returns the UTC ordinal day it observed.
pub fn run_rollup_pass(store: &dyn Store, last_day: u32, sample_ttl: Duration) -> u32 {
    let metrics = get_metrics();

    let start = Instant::now();
    if let Err(e) = store.rollup_hour(Utc::now()) {
        tracing::warn!("Hourly rollup failed: {:#}", e);
    }
    metrics
        .rollup_duration
        .with_label_values(&["hour"])
        .observe(start.elapsed().as_secs_f64());

    let now = Utc::now();
    let today = now.ordinal();
    if today != last_day {
        let start = Instant::now();
        if let Err(e) = store.rollup_day(now) {
            tracing::warn!("Daily rollup failed: {:#}", e);
        }
        metrics
            .rollup_duration
            .with_label_values(&["day"])
            .observe(start.elapsed().as_secs_f64());
    }

    if let Ok(ttl) = chrono::Duration::from_std(sample_ttl) {
        if let Err(e) = store.prune_before(now - ttl) {
            tracing::warn!("Sample prune failed: {:#}", e);
        }
    }
    metrics.store_size_bytes.set(store.size_bytes() as f64);
    today
}
