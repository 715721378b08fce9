//! Feature computation: one raw event in, one versioned feature record out.
//!
//! Stages run in a fixed order because later ones consume earlier results:
//! identity and variant seeding, temporal, categorical one-hots, windowed
//! aggregations, seconds-since-last-event, session flag, new-user flag,
//! ratios, then the variant-gated engagement score. Every optional feature
//! is gated by the registry; identity fields and the raw event always ship.

use crate::cache::{CacheStore, Clock};
use crate::counters::ActivityCounters;
use crate::drift::DriftDetector;
use crate::metrics::PipelineMetrics;
use crate::registry::FeatureRegistry;
use crate::types::{FeatureRecord, RawEvent};
use chrono::{DateTime, Datelike, SecondsFormat, Timelike, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

const EVENT_TYPES: [&str; 6] = ["login", "logout", "purchase", "view", "click", "search"];
const DEVICE_TYPES: [&str; 3] = ["mobile", "desktop", "tablet"];

const WINDOW_FEATURES: [(&str, i64); 4] = [
    ("activity_count_1h", 3_600),
    ("activity_count_6h", 21_600),
    ("activity_count_24h", 86_400),
    ("activity_count_7d", 604_800),
];

const SESSION_GAP_SECONDS: f64 = 1_800.0;
const LAST_EVENT_TTL_SECONDS: i64 = 86_400;
const FIRST_EVENT_TTL_SECONDS: i64 = 7 * 86_400;
const NEW_USER_HOURS: f64 = 24.0;

/// Parse an event timestamp: RFC 3339 first, then offset-less ISO-8601
/// assumed UTC (upstream producers emit both shapes).
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn to_rfc3339(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub struct FeatureComputer {
    registry: Arc<FeatureRegistry>,
    cache: Arc<dyn CacheStore>,
    counters: ActivityCounters,
    drift: DriftDetector,
    metrics: Arc<PipelineMetrics>,
    clock: Clock,
}

impl FeatureComputer {
    pub fn new(
        registry: Arc<FeatureRegistry>,
        cache: Arc<dyn CacheStore>,
        counters: ActivityCounters,
        drift: DriftDetector,
        metrics: Arc<PipelineMetrics>,
        clock: Clock,
    ) -> Self {
        Self {
            registry,
            cache,
            counters,
            drift,
            metrics,
            clock,
        }
    }

    /// Derive the full feature record for one event.
    pub async fn compute(&self, event: &RawEvent) -> FeatureRecord {
        let started = Instant::now();
        let now = (self.clock)();

        let user_id = event.user_id().to_string();
        let event_type = event.event_type().to_string();

        // Resolve the event time. A missing producer timestamp falls back to
        // now; an unparsable one does too, keeping the original string in the
        // record and surfacing the failure as a counter.
        let (event_time, timestamp, parseable) = match event.ingested_at() {
            Some(raw) => match parse_timestamp(raw) {
                Some(dt) => (dt, raw.to_string(), true),
                None => {
                    self.metrics.inc_timestamp_parse_failure();
                    log::warn!("unparsable event timestamp '{}', using current time", raw);
                    (now, raw.to_string(), false)
                }
            },
            None => (now, to_rfc3339(now), true),
        };

        let variant = self.registry.variant(&user_id).to_string();
        self.metrics.inc_variant_assignment(&variant);

        let mut record = FeatureRecord {
            user_id: user_id.clone(),
            event_type: event_type.clone(),
            timestamp,
            computed_at: to_rfc3339(now),
            feature_version: self.registry.version().to_string(),
            ab_variant: variant.clone(),
            features: BTreeMap::new(),
            raw_event: event.as_value().clone(),
        };

        self.temporal_features(&mut record, event_time, parseable, &variant);
        self.categorical_features(&mut record, &event_type, event.device_type(), &variant);
        self.windowed_features(&mut record, &user_id, &event_type, &variant)
            .await;
        self.session_features(&mut record, &user_id, event_time, &variant);
        self.new_user_feature(&mut record, &user_id, event_time, &variant);
        self.ratio_features(&mut record, &user_id, &variant);
        let engagement = self.engagement_score(&mut record, &variant);

        // Both scoring paths feed the same drift series
        self.drift.record("engagement_score", engagement as f64);
        if let Some(count_1h) = record.get_i64("activity_count_1h") {
            self.drift.record("activity_count_1h", count_1h as f64);
        }
        self.metrics
            .observe_feature_value("engagement_score", engagement as f64);

        self.metrics
            .observe_computation_seconds(started.elapsed().as_secs_f64());
        record
    }

    fn active(&self, feature_name: &str, variant: &str) -> bool {
        self.registry.active(feature_name, variant)
    }

    fn cache_get(&self, key: &str) -> Option<String> {
        match self.cache.get(key) {
            Ok(value) => value,
            Err(e) => {
                log::warn!("cache read failed for {}: {}", key, e);
                None
            }
        }
    }

    fn cache_set_ex(&self, key: &str, value: &str, ttl_seconds: i64) {
        if let Err(e) = self.cache.set_ex(key, value, ttl_seconds) {
            log::warn!("cache write failed for {}: {}", key, e);
        }
    }

    /// Hour of day, day of week, weekend flag. Omitted entirely when the
    /// producer timestamp did not parse.
    fn temporal_features(
        &self,
        record: &mut FeatureRecord,
        event_time: DateTime<Utc>,
        parseable: bool,
        variant: &str,
    ) {
        if !parseable {
            return;
        }

        let day_of_week = event_time.weekday().num_days_from_monday() as i64;

        if self.active("hour_of_day", variant) {
            record.set_int("hour_of_day", event_time.hour() as i64);
        }
        if self.active("day_of_week", variant) {
            record.set_int("day_of_week", day_of_week);
        }
        if self.active("is_weekend", variant) {
            record.set_bool("is_weekend", day_of_week >= 5);
        }
    }

    /// One-hot encodings over the fixed event-type and device-type sets.
    /// An out-of-set value yields all zeros for its group.
    fn categorical_features(
        &self,
        record: &mut FeatureRecord,
        event_type: &str,
        device_type: &str,
        variant: &str,
    ) {
        if self.active("event_type_encoded", variant) {
            for et in EVENT_TYPES {
                record.set_int(&format!("event_type_{}", et), (event_type == et) as i64);
            }
        }
        if self.active("device_type_encoded", variant) {
            for dt in DEVICE_TYPES {
                record.set_int(&format!("device_type_{}", dt), (device_type == dt) as i64);
            }
        }
    }

    async fn windowed_features(
        &self,
        record: &mut FeatureRecord,
        user_id: &str,
        event_type: &str,
        variant: &str,
    ) {
        for (name, window_seconds) in WINDOW_FEATURES {
            if !self.active(name, variant) {
                continue;
            }
            let ttl = self.registry.ttl(name);
            let count = self.counters.bump_window(user_id, window_seconds, ttl).await;
            record.set_int(name, count);
        }

        if self.active("event_type_frequency_24h", variant) {
            let freq = self.counters.bump_event_type_freq(user_id, event_type);
            record.set_int("event_type_frequency_24h", freq);
        }
    }

    /// Delta to the previous event and the in-session flag. The delta is
    /// clamped non-negative; a first-ever event has no delta and counts as
    /// an active session.
    fn session_features(
        &self,
        record: &mut FeatureRecord,
        user_id: &str,
        event_time: DateTime<Utc>,
        variant: &str,
    ) {
        let last_event_key = format!("last_event:{}", user_id);

        let delta = self
            .cache_get(&last_event_key)
            .and_then(|s| parse_timestamp(&s))
            .map(|last| ((event_time - last).num_milliseconds() as f64 / 1000.0).max(0.0));

        if let Some(seconds) = delta {
            record.set_float("seconds_since_last_event", seconds);
        }

        self.cache_set_ex(&last_event_key, &to_rfc3339(event_time), LAST_EVENT_TTL_SECONDS);

        if self.active("is_active_session", variant) {
            record.set_bool(
                "is_active_session",
                delta.map_or(true, |d| d < SESSION_GAP_SECONDS),
            );
        }
    }

    fn new_user_feature(
        &self,
        record: &mut FeatureRecord,
        user_id: &str,
        event_time: DateTime<Utc>,
        variant: &str,
    ) {
        if !self.active("is_new_user", variant) {
            return;
        }

        let first_event_key = format!("first_event:{}", user_id);
        match self.cache_get(&first_event_key) {
            None => {
                self.cache_set_ex(&first_event_key, &to_rfc3339(event_time), FIRST_EVENT_TTL_SECONDS);
                record.set_bool("is_new_user", true);
            }
            Some(first) => {
                let is_new = parse_timestamp(&first)
                    .map(|first_time| {
                        (event_time - first_time).num_seconds() as f64 / 3_600.0 < NEW_USER_HOURS
                    })
                    .unwrap_or(false);
                record.set_bool("is_new_user", is_new);
            }
        }
    }

    fn ratio_features(&self, record: &mut FeatureRecord, user_id: &str, variant: &str) {
        if self.active("activity_trend", variant) {
            let count_1h = record.get_i64("activity_count_1h").unwrap_or(0);
            let count_24h = record.get_i64("activity_count_24h").unwrap_or(0);
            let trend = count_1h as f64 / count_24h.max(1) as f64;
            record.set_float("activity_trend", trend.clamp(0.0, 1.0));
        }

        if self.active("purchase_rate_24h", variant) {
            // Read-only lookups; the event's own type was already bumped
            let purchases = self.counters.read_event_type_freq(user_id, "purchase");
            let views = self.counters.read_event_type_freq(user_id, "view");
            record.set_float("purchase_rate_24h", purchases as f64 / views.max(1) as f64);
        }
    }

    /// Piecewise composite score in [0, 100]. Variant B users get the v2
    /// formula under its own feature name; everyone else gets v1.
    fn engagement_score(&self, record: &mut FeatureRecord, variant: &str) -> i64 {
        if variant == "B" && self.active("engagement_score_v2", variant) {
            let score = engagement_v2(record);
            record.set_int("engagement_score_v2", score);
            score
        } else {
            let score = engagement_v1(record);
            record.set_int("engagement_score", score);
            score
        }
    }
}

fn engagement_v1(record: &FeatureRecord) -> i64 {
    let mut score = 0i64;

    let count_1h = record.get_i64("activity_count_1h").unwrap_or(0);
    if count_1h > 5 {
        score += 30;
    } else if count_1h > 2 {
        score += 15;
    }

    if record.get_bool("is_active_session").unwrap_or(false) {
        score += 20;
    }

    if record.get_i64("event_type_frequency_24h").unwrap_or(0) > 10 {
        score += 50;
    }

    score.min(100)
}

fn engagement_v2(record: &FeatureRecord) -> i64 {
    let mut score = 0i64;

    // Activity tier (40 points)
    let count_1h = record.get_i64("activity_count_1h").unwrap_or(0);
    let count_24h = record.get_i64("activity_count_24h").unwrap_or(0);
    if count_24h > 20 {
        score += 40;
    } else if count_24h > 10 {
        score += 30;
    } else if count_24h > 5 {
        score += 20;
    } else if count_1h > 0 {
        score += 10;
    }

    // Session (20 points)
    if record.get_bool("is_active_session").unwrap_or(false) {
        score += 20;
    }

    // Trend tier (20 points)
    let trend = record.get_f64("activity_trend").unwrap_or(0.0);
    if trend > 0.5 {
        score += 20;
    } else if trend > 0.2 {
        score += 10;
    }

    // Purchase tier (20 points)
    let purchase_rate = record.get_f64("purchase_rate_24h").unwrap_or(0.0);
    if purchase_rate > 0.1 {
        score += 20;
    } else if purchase_rate > 0.05 {
        score += 10;
    }

    score.min(100)
}
