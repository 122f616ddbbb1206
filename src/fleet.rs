//! Discovers topics and supervises one worker and one sink per topic
//!
//! Every discovery cycle refreshes the topic list, and each topic matching the
//! configured pattern that has no pipeline yet gets one: a [Sink] fed by the
//! topic's [Worker], whose consumer positions are committed by the sink's flush
//! listener. Topics failing to spawn are retried with exponential backoff.
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use regex::Regex;
use tokio::{
    sync::{watch, Mutex, RwLock},
    task::{JoinHandle, JoinSet},
    time::{sleep, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
    admin::TopicAdmin,
    decoder::Decoder,
    error::{AdminError, HandlerError, SinkError, SpawnError, WorkerError},
    sink::{Sink, SinkFactory},
    worker::{MessageHandler, Notification, Record, StartOffset, Worker, WorkerFactory},
};

/// How long close waits for a sink's final flush and its flush loop
const SINK_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Retries of writes rejected by a full sink. Records are never dropped.
#[derive(Debug, Clone)]
pub struct BackpressurePolicy {
    pub backoff: Duration,
    /// consecutive rejections after which an alert is logged and retries slow down
    pub alert_after: u32,
    pub slow_backoff: Duration,
}

impl Default for BackpressurePolicy {
    fn default() -> Self {
        BackpressurePolicy {
            backoff: Duration::from_secs(1),
            alert_after: 60,
            slow_backoff: Duration::from_secs(10),
        }
    }
}

impl BackpressurePolicy {
    fn delay(&self, attempts: u32) -> Duration {
        if attempts >= self.alert_after {
            self.slow_backoff
        } else {
            self.backoff
        }
    }
}

/// Backoff of topics that failed to spawn
#[derive(Debug, Clone)]
pub struct SpawnBackoff {
    /// wait before the first retry, zero retries on every cycle
    pub initial: Duration,
    pub max: Duration,
}

impl Default for SpawnBackoff {
    fn default() -> Self {
        SpawnBackoff {
            initial: Duration::from_secs(60),
            max: Duration::from_secs(30 * 60),
        }
    }
}

impl SpawnBackoff {
    fn delay(&self, failures: u32) -> Duration {
        let doublings = failures.saturating_sub(1).min(16);
        self.initial.saturating_mul(1 << doublings).min(self.max)
    }
}

#[derive(Debug, Clone)]
pub struct FleetConfig {
    /// consumer group of a topic is `group_prefix + topic`
    pub group_prefix: String,
    pub topic_pattern: Regex,
    pub discovery_interval: Duration,
    pub backpressure: BackpressurePolicy,
    pub spawn_backoff: SpawnBackoff,
}

/// Decodes records and writes them into the topic's sink, waiting while the sink is full.
struct SinkWriter {
    sink: Arc<Sink>,
    decoder: Arc<dyn Decoder + Send + Sync>,
    policy: BackpressurePolicy,
}

impl SinkWriter {
    fn encode(&self, record: &Record) -> Option<Vec<u8>> {
        let Some(payload) = &record.payload else {
            debug!(topic = %record.topic, offset = record.offset, "skipping tombstone");
            return None;
        };
        let entry = match self.decoder.decode(payload) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(topic = %record.topic, partition = record.partition, offset = record.offset, error = %e, "dropping undecodable record");
                return None;
            }
        };
        match self.sink.format().encode(&entry) {
            Ok(line) => Some(line),
            Err(e) => {
                warn!(topic = %record.topic, partition = record.partition, offset = record.offset, error = %e, "dropping unencodable record");
                None
            }
        }
    }
}

#[async_trait]
impl MessageHandler for SinkWriter {
    async fn on_message(&self, record: &Record) -> Result<(), HandlerError> {
        let Some(line) = self.encode(record) else {
            return Ok(());
        };
        let mut attempts: u32 = 0;
        loop {
            match self.sink.on_message(&line) {
                Ok(()) => {
                    if attempts >= self.policy.alert_after {
                        info!(topic = %record.topic, attempts, "sink accepts writes again");
                    }
                    return Ok(());
                }
                Err(SinkError::Stopped) => {
                    return Err(HandlerError::SinkStopped(record.topic.clone()))
                }
                Err(e) => {
                    attempts += 1;
                    if attempts == self.policy.alert_after {
                        error!(topic = %record.topic, attempts, error = %e, "sink keeps rejecting writes, consumption of topic is stalled");
                    } else {
                        debug!(topic = %record.topic, attempts, error = %e, "sink rejected write");
                    }
                    sleep(self.policy.delay(attempts)).await;
                }
            }
        }
    }
}

struct Pipeline {
    worker: Worker,
    sink: Arc<Sink>,
    flusher: JoinHandle<()>,
}

impl Pipeline {
    /// Halts consumption, flushes the sink (which commits) and leaves the group.
    /// Marked positions are committed on close only when the final flush succeeded,
    /// since the worker stopped before it and every marked record was then uploaded.
    async fn shutdown(mut self, topic: &str) {
        self.worker.stop().await;
        let flushed = match tokio::time::timeout(SINK_STOP_TIMEOUT, self.sink.stop()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(topic, error = %e, "final flush failed, unflushed records will be redelivered");
                false
            }
            Err(_) => {
                warn!(topic, "final flush did not finish in time, unflushed records will be redelivered");
                false
            }
        };
        if tokio::time::timeout(SINK_STOP_TIMEOUT, &mut self.flusher)
            .await
            .is_err()
        {
            warn!(topic, "sink flush loop did not stop in time");
            self.flusher.abort();
        }
        self.worker.close(flushed).await;
    }
}

struct SpawnFailure {
    failures: u32,
    retry_at: Instant,
}

pub struct Fleet {
    config: FleetConfig,
    admin: TopicAdmin,
    sinks: Arc<dyn SinkFactory>,
    workers: Arc<dyn WorkerFactory>,
    decoder: Arc<dyn Decoder + Send + Sync>,
    pipelines: RwLock<HashMap<String, Pipeline>>,
    failures: Mutex<HashMap<String, SpawnFailure>>,
    spawn_errors: std::sync::Mutex<HashMap<String, u64>>,
    discovery: Mutex<()>,
    stopped: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl Fleet {
    pub fn new(
        config: FleetConfig,
        admin: TopicAdmin,
        sinks: Arc<dyn SinkFactory>,
        workers: Arc<dyn WorkerFactory>,
        decoder: Arc<dyn Decoder + Send + Sync>,
    ) -> Fleet {
        Fleet {
            config,
            admin,
            sinks,
            workers,
            decoder,
            pipelines: RwLock::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            spawn_errors: std::sync::Mutex::new(HashMap::new()),
            discovery: Mutex::new(()),
            stopped: AtomicBool::new(false),
            shutdown: watch::channel(false).0,
        }
    }

    /// Runs discovery cycles until [Fleet::close] is called.
    pub async fn run(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.config.discovery_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(pattern = %self.config.topic_pattern, "fleet started");
        while !self.is_stopped() {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.discover().await {
                        error!(error = %e, "topic discovery failed");
                    }
                }
            }
        }
        info!("fleet discovery stopped");
    }

    /// One discovery cycle. Returns the number of pipelines spawned.
    pub async fn discover(&self) -> Result<usize, AdminError> {
        let _cycle = self.discovery.lock().await;
        if self.is_stopped() {
            return Ok(0);
        }
        self.admin.refresh_topics().await?;

        let mut spawned = 0;
        for topic in self.admin.topics().await {
            if !self.config.topic_pattern.is_match(&topic) {
                continue;
            }
            if self.pipelines.read().await.contains_key(&topic) {
                continue;
            }
            if !self.retry_due(&topic).await {
                continue;
            }
            match self.spawn(&topic).await {
                Ok(pipeline) => {
                    self.failures.lock().await.remove(&topic);
                    let mut pipelines = self.pipelines.write().await;
                    if self.is_stopped() {
                        drop(pipelines);
                        pipeline.shutdown(&topic).await;
                        break;
                    }
                    pipelines.insert(topic.clone(), pipeline);
                    spawned += 1;
                    info!(%topic, "topic pipeline started");
                }
                Err(e) => self.spawn_failed(&topic, e).await,
            }
        }
        Ok(spawned)
    }

    async fn retry_due(&self, topic: &str) -> bool {
        match self.failures.lock().await.get(topic) {
            Some(failure) => Instant::now() >= failure.retry_at,
            None => true,
        }
    }

    async fn spawn_failed(&self, topic: &str, e: SpawnError) {
        let count = {
            let mut errors = self.spawn_errors.lock().unwrap_or_else(|e| e.into_inner());
            let count = errors.entry(topic.to_string()).or_default();
            *count += 1;
            *count
        };
        let mut failures = self.failures.lock().await;
        let failure = failures.entry(topic.to_string()).or_insert(SpawnFailure {
            failures: 0,
            retry_at: Instant::now(),
        });
        failure.failures += 1;
        let delay = self.config.spawn_backoff.delay(failure.failures);
        failure.retry_at = Instant::now() + delay;
        error!(%topic, error = %e, spawn_errors = count, retry_in = ?delay, "failed to spawn topic pipeline");
    }

    async fn spawn(&self, topic: &str) -> Result<Pipeline, SpawnError> {
        let sink = Arc::new(self.sinks.create(topic).await?);
        let group_id = format!("{}{}", self.config.group_prefix, topic);
        let mut worker = self
            .workers
            .create(&group_id, topic, StartOffset::Oldest)
            .await?;

        let error_topic = topic.to_string();
        worker.on_error(Arc::new(move |e: &WorkerError| {
            error!(topic = %error_topic, error = %e, "consumer error");
        }));
        let notification_topic = topic.to_string();
        worker.on_notification(Arc::new(move |n: &Notification| {
            info!(topic = %notification_topic, notification = ?n, "consumer group rebalance");
        }));
        worker.on_message(Arc::new(SinkWriter {
            sink: sink.clone(),
            decoder: self.decoder.clone(),
            policy: self.config.backpressure.clone(),
        }));
        sink.add_flush_listener(Arc::new(worker.commit_hook()));

        let flusher = tokio::spawn(sink.clone().start());
        worker.start();
        debug!(%topic, %group_id, "spawned worker and sink");
        Ok(Pipeline {
            worker,
            sink,
            flusher,
        })
    }

    /// Stops discovery, then shuts down every pipeline concurrently: consumption
    /// halts, each sink makes a final flush (committing what it uploaded) and the
    /// sessions leave their groups. A topic whose upload hangs does not hold back
    /// the others.
    pub async fn close(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown.send(true);
        let pipelines: Vec<_> = self.pipelines.write().await.drain().collect();
        info!(topics = pipelines.len(), "closing fleet");
        let mut shutdowns = JoinSet::new();
        for (topic, pipeline) in pipelines {
            shutdowns.spawn(async move { pipeline.shutdown(&topic).await });
        }
        while let Some(result) = shutdowns.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "pipeline shutdown task failed");
            }
        }
        info!("fleet closed");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Topics with a running pipeline, sorted
    pub async fn active_topics(&self) -> Vec<String> {
        let mut topics: Vec<_> = self.pipelines.read().await.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Number of failed spawn attempts of a topic
    pub fn spawn_errors(&self, topic: &str) -> u64 {
        self.spawn_errors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(topic)
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_backoff_doubles_up_to_max() {
        let backoff = SpawnBackoff {
            initial: Duration::from_secs(10),
            max: Duration::from_secs(60),
        };
        assert_eq!(backoff.delay(1), Duration::from_secs(10));
        assert_eq!(backoff.delay(2), Duration::from_secs(20));
        assert_eq!(backoff.delay(3), Duration::from_secs(40));
        assert_eq!(backoff.delay(4), Duration::from_secs(60));
        assert_eq!(backoff.delay(100), Duration::from_secs(60));

        let every_cycle = SpawnBackoff {
            initial: Duration::ZERO,
            ..backoff
        };
        assert_eq!(every_cycle.delay(7), Duration::ZERO);
    }

    #[test]
    fn backpressure_slows_down_after_alert() {
        let policy = BackpressurePolicy {
            backoff: Duration::from_millis(10),
            alert_after: 3,
            slow_backoff: Duration::from_millis(100),
        };
        assert_eq!(policy.delay(1), Duration::from_millis(10));
        assert_eq!(policy.delay(2), Duration::from_millis(10));
        assert_eq!(policy.delay(3), Duration::from_millis(100));
    }
}
