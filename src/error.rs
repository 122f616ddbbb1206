//! Error types shared across the fleet
use rdkafka::error::KafkaError;
use thiserror::Error;

/// Failures of the topic administration capability.
#[derive(Debug, Error)]
pub enum AdminError {
    #[error("fetching topic metadata: {0}")]
    Kafka(#[from] KafkaError),

    #[error("metadata task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Failures of a sink backend upload.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("object store: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("http request: {0}")]
    Http(#[from] reqwest::Error),

    #[error("aggregator responded with {status}: {body}")]
    Rejected { status: u16, body: String },
}

#[derive(Debug, Error)]
pub enum SinkError {
    /// The sink was stopped and accepts no more writes.
    #[error("sink is stopped")]
    Stopped,

    /// The flush threshold is reached; retry after the next flush.
    #[error("buffer full")]
    BufferFull,

    #[error("upload to {backend} failed: {source}")]
    Upload {
        backend: &'static str,
        #[source]
        source: UploadError,
    },

    #[error("invalid sink configuration: {0}")]
    Configuration(String),
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("kafka: {0}")]
    Kafka(#[from] KafkaError),

    #[error("commit failed: {0}")]
    Commit(String),
}

/// Reasons a message handler refuses a record. The record is left unmarked.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("sink for topic {0} is stopped")]
    SinkStopped(String),
}

/// Failures while bringing up the pipeline of a newly matched topic.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("creating sink: {0}")]
    Sink(#[from] SinkError),

    #[error("creating worker: {0}")]
    Worker(#[from] WorkerError),
}
