//! featureflow — online feature computation engine for e-commerce event
//! streams.
//!
//! The pipeline consumes raw user events from the `raw-events` topic,
//! derives a versioned set of ML features per event (windowed aggregations,
//! categorical encodings, ratio features and a composite engagement score),
//! assigns each user a deterministic A/B variant that selects which feature
//! version is computed, monitors feature distributions for drift, and
//! persists results to the durable feature store while publishing them to
//! the `feature-events` topic. Events that fail terminally land on the
//! `dead-letter-queue` topic with their original payload intact.

pub mod cache;
pub mod compute;
pub mod config;
pub mod counters;
pub mod drift;
pub mod metrics;
pub mod registry;
pub mod runner;
pub mod store;
pub mod topic;
pub mod types;
