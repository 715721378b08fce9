//! Wire-level data model: raw events, feature records, dead letters.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A raw event consumed from the `raw-events` topic.
///
/// Events are produced externally and carry opaque passthrough fields, so the
/// payload is kept as a JSON object and accessed through defaulting getters
/// rather than a rigid struct. The full object travels into the output record
/// under `raw_event` untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent(Value);

impl RawEvent {
    /// Parse a topic line into an event. Anything that is not a JSON object
    /// is rejected; the caller dead-letters it.
    pub fn from_json(line: &str) -> Result<Self, String> {
        let value: Value =
            serde_json::from_str(line).map_err(|e| format!("invalid JSON: {}", e))?;
        if !value.is_object() {
            return Err("event is not a JSON object".to_string());
        }
        Ok(Self(value))
    }

    pub fn from_value(value: Value) -> Result<Self, String> {
        if !value.is_object() {
            return Err("event is not a JSON object".to_string());
        }
        Ok(Self(value))
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn user_id(&self) -> &str {
        self.str_field("user_id").unwrap_or("unknown")
    }

    pub fn event_type(&self) -> &str {
        self.str_field("event_type").unwrap_or("unknown")
    }

    pub fn ingested_at(&self) -> Option<&str> {
        self.str_field("ingested_at")
    }

    pub fn device_type(&self) -> &str {
        self.str_field("device_type").unwrap_or("unknown")
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

/// A single computed feature value.
///
/// Feature values are one of: integer count or small-integer category,
/// floating ratio, or boolean flag. Serialised untagged so the output topic
/// carries plain JSON scalars.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl FeatureValue {
    /// Numeric view used by the feature store column and drift statistics.
    pub fn as_f64(&self) -> f64 {
        match self {
            FeatureValue::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            FeatureValue::Int(i) => *i as f64,
            FeatureValue::Float(f) => *f,
        }
    }
}

/// The per-event output tuple persisted to the store and published to the
/// `feature-events` topic.
///
/// Identity fields are always present; the feature map only holds names the
/// registry activated for the user's variant.
#[derive(Debug, Clone, Serialize)]
pub struct FeatureRecord {
    pub user_id: String,
    pub event_type: String,
    pub timestamp: String,
    pub computed_at: String,
    pub feature_version: String,
    pub ab_variant: String,
    #[serde(flatten)]
    pub features: BTreeMap<String, FeatureValue>,
    pub raw_event: Value,
}

impl FeatureRecord {
    pub fn set_int(&mut self, name: &str, value: i64) {
        self.features.insert(name.to_string(), FeatureValue::Int(value));
    }

    pub fn set_float(&mut self, name: &str, value: f64) {
        self.features.insert(name.to_string(), FeatureValue::Float(value));
    }

    pub fn set_bool(&mut self, name: &str, value: bool) {
        self.features.insert(name.to_string(), FeatureValue::Bool(value));
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        match self.features.get(name)? {
            FeatureValue::Int(i) => Some(*i),
            FeatureValue::Float(f) => Some(*f as i64),
            FeatureValue::Bool(_) => None,
        }
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        match self.features.get(name)? {
            FeatureValue::Bool(_) => None,
            v => Some(v.as_f64()),
        }
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.features.get(name)? {
            FeatureValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

/// Record published to the `dead-letter-queue` topic for events whose
/// processing failed terminally. Always carries the unmodified original.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterRecord {
    pub original_event: Value,
    pub error: String,
    pub timestamp: String,
}
