//! Cached view of the topics known to the source log
use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use rdkafka::{
    consumer::{BaseConsumer, Consumer},
    ClientConfig,
};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::AdminError;

/// Lists every topic currently known to the source log.
#[async_trait]
pub trait TopicSource: Send + Sync {
    async fn list_topics(&self) -> Result<Vec<String>, AdminError>;
}

/// Kafka cluster metadata as a [TopicSource]
pub struct KafkaTopicSource {
    consumer: Arc<BaseConsumer>,
    timeout: Duration,
}

impl KafkaTopicSource {
    pub fn new(config: &ClientConfig, timeout: Duration) -> Result<Self, AdminError> {
        Ok(KafkaTopicSource {
            consumer: Arc::new(config.create()?),
            timeout,
        })
    }
}

#[async_trait]
impl TopicSource for KafkaTopicSource {
    async fn list_topics(&self) -> Result<Vec<String>, AdminError> {
        let consumer = self.consumer.clone();
        let timeout = self.timeout;
        // fetch_metadata blocks until the broker answers
        let topics = tokio::task::spawn_blocking(move || {
            consumer.fetch_metadata(None, timeout).map(|metadata| {
                metadata
                    .topics()
                    .iter()
                    .map(|t| t.name().to_string())
                    .collect::<Vec<_>>()
            })
        })
        .await??;
        Ok(topics)
    }
}

/// Topic list cache. Refreshes are serialized with reads of the cache.
pub struct TopicAdmin {
    source: Arc<dyn TopicSource>,
    topics: Mutex<Vec<String>>,
}

impl TopicAdmin {
    pub fn new(source: Arc<dyn TopicSource>) -> Self {
        TopicAdmin {
            source,
            topics: Mutex::new(Vec::new()),
        }
    }

    /// Replaces the cache with the current topic list.
    /// On failure the cache is left as it was.
    pub async fn refresh_topics(&self) -> Result<(), AdminError> {
        let mut topics = self.topics.lock().await;
        Self::refresh_locked(self.source.as_ref(), &mut topics).await
    }

    /// Cached topics, refreshed once first if the cache is empty.
    pub async fn topics(&self) -> Vec<String> {
        let mut topics = self.topics.lock().await;
        if topics.is_empty() {
            if let Err(e) = Self::refresh_locked(self.source.as_ref(), &mut topics).await {
                warn!(error = %e, "refreshing empty topic cache");
            }
        }
        topics.clone()
    }

    /// Checks the cache, forcing one refresh on a miss.
    pub async fn exist(&self, topic: &str) -> bool {
        let mut topics = self.topics.lock().await;
        if topics.iter().any(|t| t == topic) {
            return true;
        }
        if let Err(e) = Self::refresh_locked(self.source.as_ref(), &mut topics).await {
            warn!(topic, error = %e, "refreshing topics on cache miss");
            return false;
        }
        topics.iter().any(|t| t == topic)
    }

    async fn refresh_locked(
        source: &dyn TopicSource,
        topics: &mut Vec<String>,
    ) -> Result<(), AdminError> {
        let fresh = source.list_topics().await?;
        debug!(count = fresh.len(), "refreshed topic list");
        *topics = fresh;
        Ok(())
    }
}
