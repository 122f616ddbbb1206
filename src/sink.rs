//! Buffered output of one topic
//!
//! A [Sink] accumulates encoded records, flushes them to its [Uploader] when
//! the size threshold is reached or the buffer gets too old, and notifies its
//! [FlushListener]s after every successful upload. Listeners use that signal to
//! commit consumer positions, so nothing is acknowledged to Kafka before it is
//! durably stored.
pub mod aggregator;
pub mod store;

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    sync::{Mutex as AsyncMutex, Notify},
    time::{interval_at, sleep, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
    error::{SinkError, UploadError},
    format::Format,
    settings::SinkSettings,
};

/// Separator appended to every buffered record
pub const RECORD_SEPARATOR: u8 = b'\n';

/// Durable destination of flushed buffers.
#[async_trait]
pub trait Uploader: Send + Sync {
    /// backend name used in logs and errors
    fn name(&self) -> &'static str;
    async fn upload(&self, topic: &str, content: Vec<u8>) -> Result<(), UploadError>;
}

/// Observer of a sink's flushes.
#[async_trait]
pub trait FlushListener: Send + Sync {
    /// Called while the flushed content is being snapshotted, under the buffer lock.
    fn on_snapshot(&self) {}
    /// Called after the snapshot was uploaded successfully.
    async fn on_flush(&self) -> Result<(), anyhow::Error>;
}

/// Builds the sink of a newly discovered topic.
#[async_trait]
pub trait SinkFactory: Send + Sync {
    async fn create(&self, topic: &str) -> Result<Sink, SinkError>;
}

#[derive(Debug, Clone)]
pub struct FlushPolicy {
    /// flush once this many bytes are buffered
    pub max_bytes: Option<usize>,
    /// flush once this many records are buffered
    pub max_batches: Option<usize>,
    /// never hold a record longer than this
    pub max_age: Duration,
    /// how often the flush loop re-checks the size threshold
    pub poll_interval: Duration,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        FlushPolicy {
            max_bytes: Some(10 * 1024 * 1024),
            max_batches: None,
            max_age: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl FlushPolicy {
    fn is_reached(&self, bytes: usize, batches: usize) -> bool {
        self.max_bytes.is_some_and(|max| bytes >= max)
            || self.max_batches.is_some_and(|max| batches >= max)
    }
}

#[derive(Default)]
struct Buffer {
    data: Vec<u8>,
    batches: usize,
    stopped: bool,
}

pub struct Sink {
    topic: String,
    format: Format,
    policy: FlushPolicy,
    uploader: Box<dyn Uploader>,
    buffer: Mutex<Buffer>,
    listeners: Mutex<Vec<Arc<dyn FlushListener>>>,
    flushing: AsyncMutex<()>,
    stopped: AtomicBool,
    wake: Notify,
}

impl Sink {
    pub fn new(
        topic: &str,
        format: Format,
        policy: FlushPolicy,
        uploader: Box<dyn Uploader>,
    ) -> Sink {
        Sink {
            topic: topic.to_string(),
            format,
            policy,
            uploader,
            buffer: Mutex::new(Buffer::default()),
            listeners: Mutex::new(Vec::new()),
            flushing: AsyncMutex::new(()),
            stopped: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn format(&self) -> Format {
        self.format
    }

    /// Buffered bytes and records
    pub fn buffered(&self) -> (usize, usize) {
        let buffer = self.lock_buffer();
        (buffer.data.len(), buffer.batches)
    }

    /// Appends one record. Never blocks and never drops: when the threshold is
    /// already reached the record is rejected with [SinkError::BufferFull].
    pub fn on_message(&self, record: &[u8]) -> Result<(), SinkError> {
        let mut buffer = self.lock_buffer();
        if buffer.stopped {
            return Err(SinkError::Stopped);
        }
        if self.policy.is_reached(buffer.data.len(), buffer.batches) {
            return Err(SinkError::BufferFull);
        }
        buffer.data.extend_from_slice(record);
        buffer.data.push(RECORD_SEPARATOR);
        buffer.batches += 1;
        if self.policy.is_reached(buffer.data.len(), buffer.batches) {
            self.wake.notify_one();
        }
        Ok(())
    }

    /// Registers a listener, invoked in registration order after each successful flush.
    pub fn add_flush_listener(&self, listener: Arc<dyn FlushListener>) {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    /// Flush loop, runs until [Sink::stop] is called.
    pub async fn start(self: Arc<Self>) {
        let mut ticker = interval_at(Instant::now() + self.policy.max_age, self.policy.max_age);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(topic = %self.topic, "sink flush loop started");
        while !self.stopped.load(Ordering::Acquire) {
            if self.is_full() {
                if self.flush().await.is_err() {
                    sleep(self.policy.poll_interval).await;
                }
                continue;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.stopped.load(Ordering::Acquire) {
                        let _ = self.flush().await;
                    }
                }
                _ = self.wake.notified() => {}
                _ = sleep(self.policy.poll_interval) => {}
            }
        }
        debug!(topic = %self.topic, "sink flush loop finished");
    }

    /// Uploads the buffered records. On failure the buffer is kept for the next attempt.
    pub async fn flush(&self) -> Result<(), SinkError> {
        let _flushing = self.flushing.lock().await;
        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let (content, batches) = {
            let buffer = self.lock_buffer();
            if buffer.batches == 0 {
                return Ok(());
            }
            for listener in &listeners {
                listener.on_snapshot();
            }
            (buffer.data.clone(), buffer.batches)
        };
        let bytes = content.len();

        if let Err(e) = self.uploader.upload(&self.topic, content).await {
            error!(topic = %self.topic, bytes, batches, error = %e, "flush failed, keeping buffer");
            return Err(SinkError::Upload {
                backend: self.uploader.name(),
                source: e,
            });
        }

        for listener in &listeners {
            if let Err(e) = listener.on_flush().await {
                error!(topic = %self.topic, error = %e, "post-flush callback failed");
            }
        }

        {
            let mut buffer = self.lock_buffer();
            buffer.data.drain(..bytes);
            buffer.batches -= batches;
        }
        info!(topic = %self.topic, backend = self.uploader.name(), bytes, batches, "flushed");
        Ok(())
    }

    /// Rejects further writes and makes one final flush attempt.
    pub async fn stop(&self) -> Result<(), SinkError> {
        {
            let mut buffer = self.lock_buffer();
            if buffer.stopped {
                return Ok(());
            }
            buffer.stopped = true;
        }
        self.stopped.store(true, Ordering::Release);
        self.wake.notify_one();
        let result = self.flush().await;
        if result.is_err() {
            let (bytes, batches) = self.buffered();
            warn!(topic = %self.topic, bytes, batches, "sink stopped with unflushed records");
        }
        result
    }

    fn is_full(&self) -> bool {
        let buffer = self.lock_buffer();
        self.policy.is_reached(buffer.data.len(), buffer.batches)
    }

    fn lock_buffer(&self) -> MutexGuard<'_, Buffer> {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Creates sinks backed by the configured backend
pub struct BackendSinkFactory {
    settings: SinkSettings,
    policy: FlushPolicy,
}

impl BackendSinkFactory {
    pub fn new(settings: SinkSettings, policy: FlushPolicy) -> Self {
        BackendSinkFactory { settings, policy }
    }
}

#[async_trait]
impl SinkFactory for BackendSinkFactory {
    async fn create(&self, topic: &str) -> Result<Sink, SinkError> {
        let (uploader, format): (Box<dyn Uploader>, Format) = match &self.settings {
            SinkSettings::ObjectStore(s) => (
                Box::new(store::ObjectStoreUploader::new(s)?),
                s.format.unwrap_or_default(),
            ),
            SinkSettings::Aggregator(s) => (
                Box::new(aggregator::AggregatorUploader::new(s)?),
                s.format.unwrap_or_default(),
            ),
        };
        Ok(Sink::new(topic, format, self.policy.clone(), uploader))
    }
}
