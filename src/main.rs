use featureflow::cache::{system_clock, CacheStore, MemoryCache};
use featureflow::compute::FeatureComputer;
use featureflow::config::{
    RuntimeConfig, DEAD_LETTER_TOPIC, FEATURE_EVENTS_TOPIC, RAW_EVENTS_TOPIC,
};
use featureflow::counters::ActivityCounters;
use featureflow::drift::DriftDetector;
use featureflow::metrics::{metrics_flush_task, PipelineMetrics};
use featureflow::registry::FeatureRegistry;
use featureflow::runner::{consume_raw_events, PipelineRunner};
use featureflow::store::{FeatureStore, SqliteFeatureStore};
use featureflow::topic::{topic_path, OffsetStore, TopicReader, TopicWriter};
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run().await {
        log::error!("❌ fatal: {}", e);
        process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = RuntimeConfig::from_env()?;
    let registry = Arc::new(FeatureRegistry::load(&config.features_config)?);

    log::info!("🚀 Starting featureflow pipeline");
    log::info!("   ├─ feature version: {}", registry.version());
    log::info!(
        "   ├─ drift detection enabled: {}",
        registry.drift_config().enabled
    );
    log::info!(
        "   ├─ batch: size={} timeout={}s",
        config.batch_size,
        config.batch_timeout_secs
    );
    log::info!("   ├─ topic data dir: {}", config.topic_data_dir);
    log::info!("   └─ feature store: {}", config.store_path);

    let clock = system_clock();
    let metrics = Arc::new(PipelineMetrics::new());
    let cache: Arc<dyn CacheStore> = Arc::new(MemoryCache::new(clock.clone()));
    let store: Arc<dyn FeatureStore> =
        Arc::new(SqliteFeatureStore::open(&config.store_path, &config.schema_dir)?);

    let counters = ActivityCounters::new(
        cache.clone(),
        store.clone(),
        metrics.clone(),
        clock.clone(),
    );
    let drift = DriftDetector::new(
        cache.clone(),
        metrics.clone(),
        clock.clone(),
        registry.drift_config(),
    );
    let computer = FeatureComputer::new(
        registry,
        cache,
        counters,
        drift,
        metrics.clone(),
        clock.clone(),
    );

    let features = TopicWriter::open(topic_path(&config.topic_data_dir, FEATURE_EVENTS_TOPIC))?;
    let dead_letters = TopicWriter::open(topic_path(&config.topic_data_dir, DEAD_LETTER_TOPIC))?;
    let offsets = OffsetStore::new(
        &config.topic_data_dir,
        RAW_EVENTS_TOPIC,
        &config.consumer_group,
    );
    let reader = TopicReader::new(
        topic_path(&config.topic_data_dir, RAW_EVENTS_TOPIC),
        offsets.load(),
    );

    let runner = PipelineRunner::new(
        computer,
        store,
        features,
        dead_letters,
        offsets,
        metrics.clone(),
        clock,
        config.batch_size,
        Duration::from_secs_f64(config.batch_timeout_secs),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handler(shutdown_tx);

    let (tx, rx) = mpsc::channel(10_000);
    tokio::spawn(consume_raw_events(
        reader,
        tx,
        metrics.clone(),
        shutdown_rx.clone(),
    ));
    tokio::spawn(metrics_flush_task(
        metrics,
        config.metrics_flush_secs,
        shutdown_rx.clone(),
    ));

    runner.run(rx, shutdown_rx).await;

    log::info!("✅ featureflow pipeline stopped");
    Ok(())
}

/// Flip the shutdown flag on SIGINT or SIGTERM; the runner drains after the
/// current batch.
fn spawn_signal_handler(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(stream) => stream,
                Err(e) => {
                    log::error!("failed to install SIGTERM handler: {}", e);
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => log::info!("🛑 SIGINT received"),
                _ = sigterm.recv() => log::info!("🛑 SIGTERM received"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            log::info!("🛑 interrupt received");
        }
        let _ = shutdown_tx.send(true);
    });
}
