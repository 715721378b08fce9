//! Online drift detection over feature value distributions.
//!
//! Per feature, three cache keys: an hour-trimmed sorted set of raw values,
//! a rolling Welford statistics hash with a one-hour TTL, and a baseline
//! hash snapshotted from the stats. Baseline rotation is passive: the
//! baseline's TTL lapses after an hour and the next observation re-seeds it,
//! so the detector always compares the current rolling hour against the
//! prior one without a scheduler.

use crate::cache::{CacheStore, Clock};
use crate::metrics::PipelineMetrics;
use crate::registry::{DriftConfig, DriftThresholds};
use std::collections::HashMap;
use std::sync::Arc;

const ROLLING_WINDOW_SECONDS: i64 = 3_600;

struct RollingStats {
    count: i64,
    mean: f64,
    m2: f64,
    std: f64,
}

fn parse_field(fields: &HashMap<String, String>, name: &str, default: f64) -> f64 {
    fields
        .get(name)
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

pub struct DriftDetector {
    cache: Arc<dyn CacheStore>,
    metrics: Arc<PipelineMetrics>,
    clock: Clock,
    enabled: bool,
    thresholds: HashMap<String, DriftThresholds>,
}

impl DriftDetector {
    pub fn new(
        cache: Arc<dyn CacheStore>,
        metrics: Arc<PipelineMetrics>,
        clock: Clock,
        config: &DriftConfig,
    ) -> Self {
        Self {
            cache,
            metrics,
            clock,
            enabled: config.enabled,
            thresholds: config.thresholds.clone(),
        }
    }

    /// Record one observation for a feature and alert when the rolling
    /// statistics diverge from the baseline beyond the feature's thresholds.
    /// Features without thresholds are monitored but never alert.
    pub fn record(&self, feature_name: &str, value: f64) {
        if !self.enabled || !value.is_finite() {
            return;
        }

        let now = (self.clock)().timestamp();

        let values_key = format!("drift:values:{}", feature_name);
        let member = format!("{}:{}", now, value);
        if let Err(e) = self.cache.zadd(&values_key, &member, now as f64) {
            log::warn!("drift value log write failed for {}: {}", feature_name, e);
            return;
        }
        if let Err(e) = self
            .cache
            .zremrangebyscore(&values_key, (now - ROLLING_WINDOW_SECONDS) as f64)
        {
            log::warn!("drift value log trim failed for {}: {}", feature_name, e);
        }

        let Some(stats) = self.update_statistics(feature_name, value) else {
            return;
        };

        self.check_drift(feature_name, &stats);
    }

    /// Welford's online update of {count, mean, m2, std}.
    fn update_statistics(&self, feature_name: &str, value: f64) -> Option<RollingStats> {
        let stats_key = format!("drift:stats:{}", feature_name);

        let fields = match self.cache.hgetall(&stats_key) {
            Ok(fields) => fields,
            Err(e) => {
                log::warn!("drift stats read failed for {}: {}", feature_name, e);
                return None;
            }
        };

        let count = parse_field(&fields, "count", 0.0) as i64;
        let mean = parse_field(&fields, "mean", 0.0);
        let m2 = parse_field(&fields, "m2", 0.0);

        let count = count + 1;
        let delta = value - mean;
        let mean = mean + delta / count as f64;
        let delta2 = value - mean;
        let m2 = m2 + delta * delta2;
        let std = if count > 1 { (m2 / count as f64).sqrt() } else { 0.0 };

        let updated = [
            ("count", count.to_string()),
            ("mean", mean.to_string()),
            ("m2", m2.to_string()),
            ("std", std.to_string()),
        ];
        if let Err(e) = self.cache.hset_all(&stats_key, &updated) {
            log::warn!("drift stats write failed for {}: {}", feature_name, e);
            return None;
        }
        if let Err(e) = self.cache.expire(&stats_key, ROLLING_WINDOW_SECONDS) {
            log::warn!("drift stats expire failed for {}: {}", feature_name, e);
        }

        Some(RollingStats {
            count,
            mean,
            m2,
            std,
        })
    }

    fn check_drift(&self, feature_name: &str, current: &RollingStats) {
        let Some(thresholds) = self.thresholds.get(feature_name) else {
            return;
        };

        let baseline_key = format!("drift:baseline:{}", feature_name);
        let baseline = match self.cache.hgetall(&baseline_key) {
            Ok(fields) => fields,
            Err(e) => {
                log::warn!("drift baseline read failed for {}: {}", feature_name, e);
                return;
            }
        };

        if baseline.is_empty() {
            // First sample after startup or after the baseline TTL lapsed:
            // snapshot the current stats as the new comparison point.
            let seeded = [
                ("count", current.count.to_string()),
                ("mean", current.mean.to_string()),
                ("m2", current.m2.to_string()),
                ("std", current.std.to_string()),
            ];
            if self.cache.hset_all(&baseline_key, &seeded).is_ok() {
                let _ = self.cache.expire(&baseline_key, ROLLING_WINDOW_SECONDS);
            }
            return;
        }

        let baseline_mean = parse_field(&baseline, "mean", 0.0);
        let baseline_std = parse_field(&baseline, "std", 1.0);

        let mean_shift = (current.mean - baseline_mean).abs();
        let std_shift = (current.std - baseline_std).abs();

        if mean_shift > thresholds.mean_shift || std_shift > thresholds.std_shift {
            log::warn!(
                "📉 drift detected for {}: mean_shift={:.2}, std_shift={:.2}",
                feature_name,
                mean_shift,
                std_shift
            );
            self.metrics.inc_drift_alert(feature_name);
        }
    }
}
