//! Feature registry loaded from the declarative YAML document.
//!
//! Source of truth for feature names and versions, cache TTLs, A/B variant
//! configuration and drift thresholds. Loaded once at startup; malformed
//! configuration is fatal.

use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

/// Variants pinned to this features version see every registered feature,
/// not just the ones matching their own version.
pub const SUPERSET_FEATURES_VERSION: &str = "v2";

#[derive(Debug)]
pub enum RegistryError {
    Io(std::io::Error),
    Parse(serde_yaml::Error),
    Invalid(String),
}

impl From<std::io::Error> for RegistryError {
    fn from(err: std::io::Error) -> Self {
        RegistryError::Io(err)
    }
}

impl From<serde_yaml::Error> for RegistryError {
    fn from(err: serde_yaml::Error) -> Self {
        RegistryError::Parse(err)
    }
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::Io(e) => write!(f, "failed to read registry config: {}", e),
            RegistryError::Parse(e) => write!(f, "failed to parse registry config: {}", e),
            RegistryError::Invalid(msg) => write!(f, "invalid registry config: {}", msg),
        }
    }
}

impl std::error::Error for RegistryError {}

fn default_feature_version() -> String {
    "v1".to_string()
}

fn default_ttl_seconds() -> i64 {
    300
}

fn default_traffic_percentage() -> u32 {
    50
}

fn default_mean_shift() -> f64 {
    10.0
}

fn default_std_shift() -> f64 {
    5.0
}

/// One registered feature. The category it belongs to is the map key in
/// [`RegistryConfig::features`]; the engine treats the definitions as a flat
/// set keyed by name.
#[derive(Debug, Clone, Deserialize)]
pub struct FeatureDef {
    pub name: String,
    #[serde(default = "default_feature_version")]
    pub version: String,
    #[serde(default)]
    pub ttl_seconds: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_ttl_seconds")]
    pub default_ttl_seconds: i64,
    #[serde(default)]
    pub feature_ttls: HashMap<String, i64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: default_ttl_seconds(),
            feature_ttls: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AbConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub variants: Vec<VariantConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VariantConfig {
    pub id: String,
    #[serde(default = "default_traffic_percentage")]
    pub traffic_percentage: u32,
    #[serde(default = "default_feature_version")]
    pub features_version: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DriftConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub thresholds: HashMap<String, DriftThresholds>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DriftThresholds {
    #[serde(default = "default_mean_shift")]
    pub mean_shift: f64,
    #[serde(default = "default_std_shift")]
    pub std_shift: f64,
}

/// The registry document as written in `features.yaml`.
#[derive(Debug, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_feature_version")]
    pub feature_version: String,
    #[serde(default)]
    pub features: BTreeMap<String, Vec<FeatureDef>>,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub ab_testing: AbConfig,
    #[serde(default)]
    pub drift_detection: DriftConfig,
}

/// Parsed registry with the per-variant active sets precomputed, so the hot
/// path answers `active()` with two set lookups.
pub struct FeatureRegistry {
    version: String,
    default_ttl: i64,
    ttls: HashMap<String, i64>,
    ab_enabled: bool,
    variants: Vec<VariantConfig>,
    known_features: HashSet<String>,
    active_sets: HashMap<String, HashSet<String>>,
    drift: DriftConfig,
}

impl FeatureRegistry {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self, RegistryError> {
        let config: RegistryConfig = serde_yaml::from_str(text)?;
        Self::from_config(config)
    }

    pub fn from_config(config: RegistryConfig) -> Result<Self, RegistryError> {
        if config.ab_testing.enabled {
            if config.ab_testing.variants.is_empty() {
                return Err(RegistryError::Invalid(
                    "ab_testing.enabled requires at least one variant".to_string(),
                ));
            }
            let total: u32 = config
                .ab_testing
                .variants
                .iter()
                .map(|v| v.traffic_percentage)
                .sum();
            if total != 100 {
                return Err(RegistryError::Invalid(format!(
                    "variant traffic percentages must sum to 100, got {}",
                    total
                )));
            }
            let mut seen = HashSet::new();
            for variant in &config.ab_testing.variants {
                if variant.id.is_empty() {
                    return Err(RegistryError::Invalid("variant id cannot be empty".to_string()));
                }
                if !seen.insert(variant.id.as_str()) {
                    return Err(RegistryError::Invalid(format!(
                        "duplicate variant id '{}'",
                        variant.id
                    )));
                }
            }
        }

        let defs: Vec<&FeatureDef> = config.features.values().flatten().collect();

        let mut ttls = HashMap::new();
        for def in &defs {
            if let Some(ttl) = def.ttl_seconds {
                ttls.insert(def.name.clone(), ttl);
            }
        }
        // cache.feature_ttls wins over per-definition TTLs
        for (name, ttl) in &config.cache.feature_ttls {
            ttls.insert(name.clone(), *ttl);
        }

        let known_features: HashSet<String> = defs.iter().map(|d| d.name.clone()).collect();

        let mut active_sets = HashMap::new();
        for variant in &config.ab_testing.variants {
            let active: HashSet<String> = defs
                .iter()
                .filter(|d| {
                    d.version == variant.features_version
                        || variant.features_version == SUPERSET_FEATURES_VERSION
                })
                .map(|d| d.name.clone())
                .collect();
            active_sets.insert(variant.id.clone(), active);
        }

        Ok(Self {
            version: config.feature_version,
            default_ttl: config.cache.default_ttl_seconds,
            ttls,
            ab_enabled: config.ab_testing.enabled,
            variants: config.ab_testing.variants,
            known_features,
            active_sets,
            drift: config.drift_detection,
        })
    }

    /// The global feature-set version stamped on every output record.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Cache TTL for a feature, falling back to the configured default.
    pub fn ttl(&self, feature_name: &str) -> i64 {
        self.ttls
            .get(feature_name)
            .copied()
            .unwrap_or(self.default_ttl)
    }

    /// Deterministic A/B variant for a user.
    ///
    /// The user id is reduced to a bucket in 0..100 via a stable 128-bit
    /// digest, then the variant list is walked accumulating traffic
    /// percentages; the first variant whose cumulative bound exceeds the
    /// bucket wins. Disabled A/B always yields the first variant.
    pub fn variant(&self, user_id: &str) -> &str {
        let first = self.variants.first().map(|v| v.id.as_str()).unwrap_or("A");
        if !self.ab_enabled {
            return first;
        }

        let bucket = user_bucket(user_id) as u32;
        let mut cumulative = 0u32;
        for variant in &self.variants {
            cumulative += variant.traffic_percentage;
            if bucket < cumulative {
                return &variant.id;
            }
        }
        first
    }

    /// Whether a feature is computed for the given variant.
    ///
    /// Names the registry does not know stay active so computed extras keep
    /// flowing through (forward compatibility).
    pub fn active(&self, feature_name: &str, variant_id: &str) -> bool {
        if !self.known_features.contains(feature_name) {
            return true;
        }
        match self.active_sets.get(variant_id) {
            Some(active) => active.contains(feature_name),
            None => true,
        }
    }

    pub fn drift_config(&self) -> &DriftConfig {
        &self.drift
    }
}

/// Stable 128-bit digest of the user id reduced to a 0..100 bucket.
fn user_bucket(user_id: &str) -> u8 {
    let digest = Sha256::digest(user_id.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    (u128::from_be_bytes(bytes) % 100) as u8
}
