//! End-to-end pipeline tests: raw-events topic in, feature store plus
//! feature-events topic out, dead letters on terminal failures, committed
//! offsets across restarts.

use featureflow::cache::{system_clock, CacheStore, MemoryCache};
use featureflow::compute::FeatureComputer;
use featureflow::counters::ActivityCounters;
use featureflow::drift::DriftDetector;
use featureflow::metrics::PipelineMetrics;
use featureflow::registry::FeatureRegistry;
use featureflow::runner::{consume_raw_events, PipelineRunner};
use featureflow::store::{FeatureStore, SqliteFeatureStore};
use featureflow::topic::{topic_path, OffsetStore, TopicReader, TopicWriter};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;

const REGISTRY_YAML: &str = r#"
feature_version: v1
features:
  derived:
    - name: engagement_score
      version: v1
    - name: engagement_score_v2
      version: v2
cache:
  default_ttl_seconds: 300
ab_testing:
  enabled: true
  variants:
    - id: A
      traffic_percentage: 100
      features_version: v1
drift_detection:
  enabled: true
  thresholds:
    engagement_score:
      mean_shift: 15.0
"#;

const GROUP: &str = "integration-group";

struct RunningPipeline {
    runner: JoinHandle<()>,
    consumer: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
    store: Arc<SqliteFeatureStore>,
    metrics: Arc<PipelineMetrics>,
}

impl RunningPipeline {
    async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = tokio::time::timeout(Duration::from_secs(5), self.runner).await;
        let _ = tokio::time::timeout(Duration::from_secs(5), self.consumer).await;
    }
}

fn start_pipeline(data_dir: &str, db_path: &str, batch_size: usize, timeout_ms: u64) -> RunningPipeline {
    let clock = system_clock();
    let registry = Arc::new(FeatureRegistry::from_yaml(REGISTRY_YAML).unwrap());
    let cache: Arc<dyn CacheStore> = Arc::new(MemoryCache::new(clock.clone()));
    let metrics = Arc::new(PipelineMetrics::new());
    let sqlite = Arc::new(SqliteFeatureStore::open(db_path, "sql").unwrap());
    let store: Arc<dyn FeatureStore> = sqlite.clone();

    let counters = ActivityCounters::new(cache.clone(), store.clone(), metrics.clone(), clock.clone());
    let drift = DriftDetector::new(
        cache.clone(),
        metrics.clone(),
        clock.clone(),
        registry.drift_config(),
    );
    let computer = FeatureComputer::new(registry, cache, counters, drift, metrics.clone(), clock.clone());

    let features = TopicWriter::open(topic_path(data_dir, "feature-events")).unwrap();
    let dead_letters = TopicWriter::open(topic_path(data_dir, "dead-letter-queue")).unwrap();
    let offsets = OffsetStore::new(data_dir, "raw-events", GROUP);
    let reader = TopicReader::new(topic_path(data_dir, "raw-events"), offsets.load());

    let runner = PipelineRunner::new(
        computer,
        store,
        features,
        dead_letters,
        offsets,
        metrics.clone(),
        clock,
        batch_size,
        Duration::from_millis(timeout_ms),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (tx, rx) = mpsc::channel(1_000);

    let consumer = tokio::spawn(consume_raw_events(
        reader,
        tx,
        metrics.clone(),
        shutdown_rx.clone(),
    ));
    let runner = tokio::spawn(runner.run(rx, shutdown_rx));

    RunningPipeline {
        runner,
        consumer,
        shutdown: shutdown_tx,
        store: sqlite,
        metrics,
    }
}

fn produce_event(data_dir: &str, user_id: &str, event_type: &str) -> serde_json::Value {
    let event = json!({
        "user_id": user_id,
        "event_type": event_type,
        "ingested_at": chrono::Utc::now().to_rfc3339(),
        "device_type": "mobile",
        "session_token": format!("token-{}", user_id),
    });
    let mut writer = TopicWriter::open(topic_path(data_dir, "raw-events")).unwrap();
    writer.produce(&event).unwrap();
    event
}

fn read_topic(data_dir: &str, topic: &str) -> Vec<serde_json::Value> {
    match std::fs::read_to_string(topic_path(data_dir, topic)) {
        Ok(text) => text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).unwrap())
            .collect(),
        Err(_) => Vec::new(),
    }
}

#[tokio::test]
async fn test_events_flow_to_store_and_output_topic() {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().to_str().unwrap();
    let db_path = dir.path().join("features.db");

    // Three events, then idle: far below the batch size, so only the
    // timeout can flush them.
    for user in ["alice", "bob", "carol"] {
        produce_event(data_dir, user, "view");
    }

    let pipeline = start_pipeline(data_dir, db_path.to_str().unwrap(), 1_000, 500);
    sleep(Duration::from_millis(1_500)).await;

    // All three persisted
    for user in ["alice", "bob", "carol"] {
        let rows = pipeline.store.load_user_features(user).unwrap();
        assert!(!rows.is_empty(), "no stored features for {}", user);
        assert!(rows.iter().any(|r| r.feature_name == "engagement_score"));
        assert!(rows.iter().all(|r| r.feature_version == "v1"));
        assert!(rows.iter().all(|r| r.ab_variant == "A"));
    }

    // All three published, with invariants holding
    let published = read_topic(data_dir, "feature-events");
    assert_eq!(published.len(), 3);
    for record in &published {
        let score = record["engagement_score"].as_i64().unwrap();
        assert!((0..=100).contains(&score));
        assert_eq!(record["feature_version"], json!("v1"));
        assert_eq!(record["ab_variant"], json!("A"));
        assert!(record["raw_event"]["session_token"].is_string());
        if let Some(trend) = record["activity_trend"].as_f64() {
            assert!((0.0..=1.0).contains(&trend));
        }
    }

    assert!(read_topic(data_dir, "dead-letter-queue").is_empty());
    assert_eq!(pipeline.metrics.snapshot().events_processed_total, 3);
    assert_eq!(pipeline.metrics.snapshot().events_failed_total, 0);

    // Offsets advanced only after the flush
    let committed = OffsetStore::new(data_dir, "raw-events", GROUP).load();
    assert!(committed > 0);

    pipeline.stop().await;
}

#[tokio::test]
async fn test_store_rejection_routes_to_dead_letter_queue() {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().to_str().unwrap();
    let db_path = dir.path().join("features.db");

    let pipeline = start_pipeline(data_dir, db_path.to_str().unwrap(), 1_000, 300);
    sleep(Duration::from_millis(200)).await;

    // Make every upsert fail deterministically
    let saboteur = rusqlite::Connection::open(&db_path).unwrap();
    saboteur.execute("DROP TABLE features", []).unwrap();
    drop(saboteur);

    let original = produce_event(data_dir, "dora", "purchase");
    sleep(Duration::from_millis(1_500)).await;

    let dead = read_topic(data_dir, "dead-letter-queue");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0]["original_event"], original);
    assert!(dead[0]["error"].as_str().unwrap().contains("features"));
    assert!(dead[0]["timestamp"].is_string());

    assert!(read_topic(data_dir, "feature-events").is_empty());
    assert_eq!(pipeline.metrics.snapshot().events_failed_total, 1);
    assert_eq!(pipeline.metrics.snapshot().events_processed_total, 0);

    pipeline.stop().await;
}

#[tokio::test]
async fn test_consumer_group_resumes_from_committed_offset() {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().to_str().unwrap();
    let db_path = dir.path().join("features.db");
    let db = db_path.to_str().unwrap();

    produce_event(data_dir, "alice", "view");
    produce_event(data_dir, "alice", "click");

    let pipeline = start_pipeline(data_dir, db, 1_000, 200);
    sleep(Duration::from_millis(1_000)).await;
    pipeline.stop().await;

    assert_eq!(read_topic(data_dir, "feature-events").len(), 2);

    // New events arrive while the pipeline is down
    produce_event(data_dir, "bob", "view");

    let pipeline = start_pipeline(data_dir, db, 1_000, 200);
    sleep(Duration::from_millis(1_000)).await;
    let store = pipeline.store.clone();
    pipeline.stop().await;

    // Only the new event was processed; the first two were not replayed
    let published = read_topic(data_dir, "feature-events");
    assert_eq!(published.len(), 3);
    assert_eq!(
        published
            .iter()
            .filter(|r| r["user_id"] == json!("alice"))
            .count(),
        2
    );

    // Replay law: the store still holds exactly one row per (user, feature)
    let rows = store.load_user_features("alice").unwrap();
    let mut names: Vec<&str> = rows.iter().map(|r| r.feature_name.as_str()).collect();
    names.sort_unstable();
    let before = names.len();
    names.dedup();
    assert_eq!(before, names.len());
}
