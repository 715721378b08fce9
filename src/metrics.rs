//! Process-local metrics registry.
//!
//! Counters and histograms are kept in-process and flushed to the log as a
//! JSON snapshot on a fixed cadence. The snapshot carries the canonical
//! metric names so downstream scrapers see a stable schema.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::time::{interval, Duration};

#[derive(Debug, Default)]
struct Histogram {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl Histogram {
    fn observe(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum += value;
    }

    fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            count: self.count,
            sum: self.sum,
            min: if self.count == 0 { 0.0 } else { self.min },
            max: if self.count == 0 { 0.0 } else { self.max },
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

/// Point-in-time view of every pipeline metric, serialisable to JSON.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub events_processed_total: u64,
    pub events_failed_total: u64,
    pub cache_hits_total: u64,
    pub cache_misses_total: u64,
    pub timestamp_parse_failures_total: u64,
    pub consumer_lag: u64,
    pub ab_variant_assignments: HashMap<String, u64>,
    pub feature_drift_alerts: HashMap<String, u64>,
    pub feature_computation_seconds: HistogramSnapshot,
    pub batch_size: HistogramSnapshot,
    pub feature_value_distribution: HashMap<String, HistogramSnapshot>,
}

#[derive(Default)]
pub struct PipelineMetrics {
    events_processed: AtomicU64,
    events_failed: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    timestamp_parse_failures: AtomicU64,
    consumer_lag: AtomicU64,
    variant_assignments: Mutex<HashMap<String, u64>>,
    drift_alerts: Mutex<HashMap<String, u64>>,
    computation_seconds: Mutex<Histogram>,
    batch_sizes: Mutex<Histogram>,
    feature_values: Mutex<HashMap<String, Histogram>>,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_processed(&self) {
        self.events_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failed(&self) {
        self.events_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_timestamp_parse_failure(&self) {
        self.timestamp_parse_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_consumer_lag(&self, lag: u64) {
        self.consumer_lag.store(lag, Ordering::Relaxed);
    }

    pub fn inc_variant_assignment(&self, variant: &str) {
        let mut assignments = self.variant_assignments.lock().unwrap();
        *assignments.entry(variant.to_string()).or_insert(0) += 1;
    }

    pub fn inc_drift_alert(&self, feature_name: &str) {
        let mut alerts = self.drift_alerts.lock().unwrap();
        *alerts.entry(feature_name.to_string()).or_insert(0) += 1;
    }

    pub fn observe_computation_seconds(&self, seconds: f64) {
        self.computation_seconds.lock().unwrap().observe(seconds);
    }

    pub fn observe_batch_size(&self, size: usize) {
        self.batch_sizes.lock().unwrap().observe(size as f64);
    }

    pub fn observe_feature_value(&self, feature_name: &str, value: f64) {
        let mut values = self.feature_values.lock().unwrap();
        values
            .entry(feature_name.to_string())
            .or_default()
            .observe(value);
    }

    pub fn drift_alert_count(&self, feature_name: &str) -> u64 {
        self.drift_alerts
            .lock()
            .unwrap()
            .get(feature_name)
            .copied()
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_processed_total: self.events_processed.load(Ordering::Relaxed),
            events_failed_total: self.events_failed.load(Ordering::Relaxed),
            cache_hits_total: self.cache_hits.load(Ordering::Relaxed),
            cache_misses_total: self.cache_misses.load(Ordering::Relaxed),
            timestamp_parse_failures_total: self
                .timestamp_parse_failures
                .load(Ordering::Relaxed),
            consumer_lag: self.consumer_lag.load(Ordering::Relaxed),
            ab_variant_assignments: self.variant_assignments.lock().unwrap().clone(),
            feature_drift_alerts: self.drift_alerts.lock().unwrap().clone(),
            feature_computation_seconds: self.computation_seconds.lock().unwrap().snapshot(),
            batch_size: self.batch_sizes.lock().unwrap().snapshot(),
            feature_value_distribution: self
                .feature_values
                .lock()
                .unwrap()
                .iter()
                .map(|(name, histogram)| (name.clone(), histogram.snapshot()))
                .collect(),
        }
    }
}

/// Log the metrics snapshot every `flush_secs` until shutdown.
pub async fn metrics_flush_task(
    metrics: Arc<PipelineMetrics>,
    flush_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut timer = interval(Duration::from_secs(flush_secs.max(1)));
    // First tick fires immediately; skip it so the first flush has data.
    timer.tick().await;

    loop {
        tokio::select! {
            _ = timer.tick() => {
                match serde_json::to_string(&metrics.snapshot()) {
                    Ok(json) => log::info!("📈 metrics: {}", json),
                    Err(e) => log::warn!("failed to serialise metrics snapshot: {}", e),
                }
            }
            _ = shutdown.changed() => {
                if let Ok(json) = serde_json::to_string(&metrics.snapshot()) {
                    log::info!("📈 final metrics: {}", json);
                }
                break;
            }
        }
    }
}
