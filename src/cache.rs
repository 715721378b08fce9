//! In-process TTL cache with strings, hashes and sorted sets.
//!
//! Backs the windowed counters, session keys and drift state. Callers treat
//! every error as a cache miss and keep going, so an unavailable cache only
//! degrades counter accuracy, never the pipeline.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

/// Injectable time source. Production wires the system clock; tests advance
/// a manual one to exercise TTL expiry and baseline rotation.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

#[derive(Debug)]
pub enum CacheError {
    /// Key holds a value of another type (string op on a hash, etc.)
    WrongType { key: String },
    /// Backend not reachable; callers degrade to the miss path
    Unavailable(String),
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::WrongType { key } => {
                write!(f, "wrong value type for cache key '{}'", key)
            }
            CacheError::Unavailable(msg) => write!(f, "cache unavailable: {}", msg),
        }
    }
}

impl std::error::Error for CacheError {}

/// Key-value cache operations used across the pipeline.
///
/// Modelled on the handful of operations the feature computation path needs:
/// expiring strings for counters and session markers, hashes for rolling
/// statistics, sorted sets for the drift value log.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Set a string value with a TTL in seconds.
    fn set_ex(&self, key: &str, value: &str, ttl_seconds: i64) -> Result<(), CacheError>;

    /// Increment an integer value, creating it at 1. Returns the new value.
    fn incr(&self, key: &str) -> Result<i64, CacheError>;

    /// Refresh the TTL of an existing key. No-op when the key is absent.
    fn expire(&self, key: &str, ttl_seconds: i64) -> Result<(), CacheError>;

    /// Read all fields of a hash; absent keys yield an empty map.
    fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, CacheError>;

    /// Write (or overwrite) the given hash fields, keeping any others.
    fn hset_all(&self, key: &str, fields: &[(&str, String)]) -> Result<(), CacheError>;

    /// Add a member to a sorted set with the given score.
    fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), CacheError>;

    /// Remove members scoring at or below `max_score`; returns removed count.
    fn zremrangebyscore(&self, key: &str, max_score: f64) -> Result<usize, CacheError>;

    fn zcard(&self, key: &str) -> Result<usize, CacheError>;

    /// Drop every key. Cache contents are reconstructible from the stream.
    fn clear(&self) -> Result<(), CacheError>;
}

enum CacheValue {
    Str(String),
    Hash(HashMap<String, String>),
    SortedSet(BTreeMap<String, f64>),
}

struct Entry {
    value: CacheValue,
    expires_at: Option<i64>,
}

impl Entry {
    fn is_expired(&self, now: i64) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// Mutex-guarded in-memory cache with lazy expiry against the injected clock.
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Clock,
}

impl MemoryCache {
    pub fn new(clock: Clock) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn now(&self) -> i64 {
        (self.clock)().timestamp()
    }
}

/// Drop the entry if its TTL has lapsed, then hand back whatever is live.
fn live_entry<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
    now: i64,
) -> Option<&'a mut Entry> {
    if entries.get(key).is_some_and(|e| e.is_expired(now)) {
        entries.remove(key);
        return None;
    }
    entries.get_mut(key)
}

impl CacheStore for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = self.now();
        let mut entries = self.entries.lock().unwrap();
        match live_entry(&mut entries, key, now) {
            None => Ok(None),
            Some(entry) => match &entry.value {
                CacheValue::Str(s) => Ok(Some(s.clone())),
                _ => Err(CacheError::WrongType { key: key.to_string() }),
            },
        }
    }

    fn set_ex(&self, key: &str, value: &str, ttl_seconds: i64) -> Result<(), CacheError> {
        let now = self.now();
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            key.to_string(),
            Entry {
                value: CacheValue::Str(value.to_string()),
                expires_at: Some(now + ttl_seconds),
            },
        );
        Ok(())
    }

    fn incr(&self, key: &str) -> Result<i64, CacheError> {
        let now = self.now();
        let mut entries = self.entries.lock().unwrap();
        match live_entry(&mut entries, key, now) {
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: CacheValue::Str("1".to_string()),
                        expires_at: None,
                    },
                );
                Ok(1)
            }
            Some(entry) => match &mut entry.value {
                CacheValue::Str(s) => {
                    let current: i64 = s
                        .parse()
                        .map_err(|_| CacheError::WrongType { key: key.to_string() })?;
                    let next = current + 1;
                    *s = next.to_string();
                    Ok(next)
                }
                _ => Err(CacheError::WrongType { key: key.to_string() }),
            },
        }
    }

    fn expire(&self, key: &str, ttl_seconds: i64) -> Result<(), CacheError> {
        let now = self.now();
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = live_entry(&mut entries, key, now) {
            entry.expires_at = Some(now + ttl_seconds);
        }
        Ok(())
    }

    fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, CacheError> {
        let now = self.now();
        let mut entries = self.entries.lock().unwrap();
        match live_entry(&mut entries, key, now) {
            None => Ok(HashMap::new()),
            Some(entry) => match &entry.value {
                CacheValue::Hash(fields) => Ok(fields.clone()),
                _ => Err(CacheError::WrongType { key: key.to_string() }),
            },
        }
    }

    fn hset_all(&self, key: &str, fields: &[(&str, String)]) -> Result<(), CacheError> {
        let now = self.now();
        let mut entries = self.entries.lock().unwrap();
        match live_entry(&mut entries, key, now) {
            None => {
                let mut map = HashMap::new();
                for (field, value) in fields {
                    map.insert(field.to_string(), value.clone());
                }
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: CacheValue::Hash(map),
                        expires_at: None,
                    },
                );
                Ok(())
            }
            Some(entry) => match &mut entry.value {
                CacheValue::Hash(map) => {
                    for (field, value) in fields {
                        map.insert(field.to_string(), value.clone());
                    }
                    Ok(())
                }
                _ => Err(CacheError::WrongType { key: key.to_string() }),
            },
        }
    }

    fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), CacheError> {
        let now = self.now();
        let mut entries = self.entries.lock().unwrap();
        match live_entry(&mut entries, key, now) {
            None => {
                let mut set = BTreeMap::new();
                set.insert(member.to_string(), score);
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: CacheValue::SortedSet(set),
                        expires_at: None,
                    },
                );
                Ok(())
            }
            Some(entry) => match &mut entry.value {
                CacheValue::SortedSet(set) => {
                    set.insert(member.to_string(), score);
                    Ok(())
                }
                _ => Err(CacheError::WrongType { key: key.to_string() }),
            },
        }
    }

    fn zremrangebyscore(&self, key: &str, max_score: f64) -> Result<usize, CacheError> {
        let now = self.now();
        let mut entries = self.entries.lock().unwrap();
        match live_entry(&mut entries, key, now) {
            None => Ok(0),
            Some(entry) => match &mut entry.value {
                CacheValue::SortedSet(set) => {
                    let before = set.len();
                    set.retain(|_, score| *score > max_score);
                    Ok(before - set.len())
                }
                _ => Err(CacheError::WrongType { key: key.to_string() }),
            },
        }
    }

    fn zcard(&self, key: &str) -> Result<usize, CacheError> {
        let now = self.now();
        let mut entries = self.entries.lock().unwrap();
        match live_entry(&mut entries, key, now) {
            None => Ok(0),
            Some(entry) => match &entry.value {
                CacheValue::SortedSet(set) => Ok(set.len()),
                _ => Err(CacheError::WrongType { key: key.to_string() }),
            },
        }
    }

    fn clear(&self) -> Result<(), CacheError> {
        self.entries.lock().unwrap().clear();
        Ok(())
    }
}
