//! Pipeline runner: consume, batch, compute, persist, publish.
//!
//! A consumer task tails the raw-events topic into a channel; the runner
//! buffers events and flushes on a size or time cutoff. A flush computes
//! features for every buffered event, upserts the successes into the store
//! under one transaction, publishes them to the feature-events topic, routes
//! failures to the dead-letter topic and only then commits the consumer
//! offset. Events for one user arrive in order on the single channel, which
//! keeps the read-modify-write cache keys consistent.

use crate::cache::Clock;
use crate::compute::FeatureComputer;
use crate::metrics::PipelineMetrics;
use crate::store::FeatureStore;
use crate::topic::{OffsetStore, TopicReader, TopicWriter};
use crate::types::{DeadLetterRecord, FeatureRecord, RawEvent};
use chrono::SecondsFormat;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep, MissedTickBehavior};

const CONSUMER_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One consumed topic entry. Malformed lines are carried through to the
/// flush so they are dead-lettered and their offset still advances.
pub enum ConsumedEvent {
    Event {
        offset: u64,
        event: RawEvent,
    },
    Malformed {
        offset: u64,
        raw: String,
        error: String,
    },
}

impl ConsumedEvent {
    fn offset(&self) -> u64 {
        match self {
            ConsumedEvent::Event { offset, .. } => *offset,
            ConsumedEvent::Malformed { offset, .. } => *offset,
        }
    }
}

/// Tail the raw-events topic into the runner's channel until shutdown.
pub async fn consume_raw_events(
    mut reader: TopicReader,
    tx: mpsc::Sender<ConsumedEvent>,
    metrics: Arc<PipelineMetrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        match reader.poll_line().await {
            Ok(Some((offset, line))) => {
                let consumed = match RawEvent::from_json(&line) {
                    Ok(event) => ConsumedEvent::Event { offset, event },
                    Err(error) => ConsumedEvent::Malformed {
                        offset,
                        raw: line,
                        error,
                    },
                };
                if tx.send(consumed).await.is_err() {
                    break;
                }
                let lag = reader.log_size().await.saturating_sub(reader.position());
                metrics.set_consumer_lag(lag);
            }
            Ok(None) => {
                let lag = reader.log_size().await.saturating_sub(reader.position());
                metrics.set_consumer_lag(lag);
                tokio::select! {
                    _ = sleep(CONSUMER_POLL_INTERVAL) => {}
                    _ = shutdown.changed() => break,
                }
            }
            Err(e) => {
                log::error!("consumer read failed: {}", e);
                tokio::select! {
                    _ = sleep(Duration::from_secs(1)) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
    }

    log::info!("consumer stopped");
}

pub struct PipelineRunner {
    computer: FeatureComputer,
    store: Arc<dyn FeatureStore>,
    features: TopicWriter,
    dead_letters: TopicWriter,
    offsets: OffsetStore,
    metrics: Arc<PipelineMetrics>,
    clock: Clock,
    batch_size: usize,
    batch_timeout: Duration,
}

impl PipelineRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        computer: FeatureComputer,
        store: Arc<dyn FeatureStore>,
        features: TopicWriter,
        dead_letters: TopicWriter,
        offsets: OffsetStore,
        metrics: Arc<PipelineMetrics>,
        clock: Clock,
        batch_size: usize,
        batch_timeout: Duration,
    ) -> Self {
        Self {
            computer,
            store,
            features,
            dead_letters,
            offsets,
            metrics,
            clock,
            batch_size,
            batch_timeout,
        }
    }

    /// Main loop. Exits after draining once the channel closes or a shutdown
    /// signal arrives; the residual batch is always flushed.
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<ConsumedEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        log::info!(
            "🚀 pipeline runner started (batch_size={}, batch_timeout={:?})",
            self.batch_size,
            self.batch_timeout
        );

        let mut batch: Vec<ConsumedEvent> = Vec::with_capacity(self.batch_size);
        let mut flush_timer = interval(self.batch_timeout);
        flush_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        flush_timer.tick().await;

        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(consumed) => {
                        batch.push(consumed);
                        if batch.len() >= self.batch_size {
                            self.flush(&mut batch).await;
                            flush_timer.reset();
                        }
                    }
                    None => {
                        self.flush(&mut batch).await;
                        break;
                    }
                },
                _ = flush_timer.tick() => {
                    if !batch.is_empty() {
                        self.flush(&mut batch).await;
                    }
                }
                _ = shutdown.changed() => {
                    log::info!("🛑 shutdown requested, flushing residual batch");
                    self.flush(&mut batch).await;
                    break;
                }
            }
        }

        log::info!("✅ pipeline runner stopped");
    }

    async fn flush(&mut self, batch: &mut Vec<ConsumedEvent>) {
        if batch.is_empty() {
            return;
        }

        let events = std::mem::take(batch);
        let max_offset = events.last().map(|e| e.offset());
        self.metrics.observe_batch_size(events.len());

        let mut computed: Vec<(RawEvent, FeatureRecord)> = Vec::new();
        for consumed in events {
            match consumed {
                ConsumedEvent::Event { event, .. } => {
                    let record = self.computer.compute(&event).await;
                    computed.push((event, record));
                }
                ConsumedEvent::Malformed { raw, error, .. } => {
                    log::error!("malformed event dead-lettered: {}", error);
                    self.metrics.inc_failed();
                    self.dead_letter(Value::String(raw), &error);
                }
            }
        }

        // Persist the whole batch in one transaction. If that fails, retry
        // each record alone so a single poison event cannot sink the batch.
        let batch_records: Vec<FeatureRecord> =
            computed.iter().map(|(_, record)| record.clone()).collect();
        let persisted: Vec<(RawEvent, FeatureRecord)> =
            match self.store.upsert_features(&batch_records).await {
                Ok(()) => computed,
                Err(e) => {
                    log::error!("batch persist failed, retrying per event: {}", e);
                    let mut survivors = Vec::new();
                    for (event, record) in computed {
                        match self
                            .store
                            .upsert_features(std::slice::from_ref(&record))
                            .await
                        {
                            Ok(()) => survivors.push((event, record)),
                            Err(e) => {
                                log::error!(
                                    "persist failed for user {}: {}",
                                    record.user_id,
                                    e
                                );
                                self.metrics.inc_failed();
                                self.dead_letter(event.into_value(), &e.to_string());
                            }
                        }
                    }
                    survivors
                }
            };

        // Publish only what was persisted
        let flushed = persisted.len();
        for (event, record) in persisted {
            match self.features.produce(&record) {
                Ok(()) => self.metrics.inc_processed(),
                Err(e) => {
                    log::error!("publish failed for user {}: {}", record.user_id, e);
                    self.metrics.inc_failed();
                    self.dead_letter(event.into_value(), &e.to_string());
                }
            }
        }

        // Offsets advance only once the batch is persisted and published
        if let Some(offset) = max_offset {
            if let Err(e) = self.offsets.commit(offset) {
                log::error!("offset commit failed: {}", e);
            }
        }

        log::debug!("flushed {} events", flushed);
    }

    fn dead_letter(&mut self, original_event: Value, error: &str) {
        let record = DeadLetterRecord {
            original_event,
            error: error.to_string(),
            timestamp: (self.clock)().to_rfc3339_opts(SecondsFormat::Micros, true),
        };
        if let Err(e) = self.dead_letters.produce(&record) {
            log::error!("dead-letter publish failed, dropping event: {}", e);
        }
    }
}
