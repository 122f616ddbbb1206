//! ## logship
//! Consumer fleet relaying log topics from Kafka into object storage or a remote log aggregator.
//!
//! ## Configuration
//! Example config:
//! ```toml
//! kafka_broker = "localhost:9092"
//! topic_pattern = "^logs_.*"              # every matching topic gets its own consumer
//! group_prefix = "logship-"               # consumer group is prefix + topic
//! decoder = "json"
//!
//! [flush]
//! max_bytes = 10485760                    # flush once 10MiB are buffered per topic
//! max_age_seconds = 60                    # or once the buffer is a minute old
//!
//! [sink]
//! type = "object_store"
//! store = "s3"
//! bucket = "log-archive"
//! region = "eu-west-1"
//! ```
//!
//! ## How it works
//! The [Fleet] polls the cluster for topics matching `topic_pattern`. For every
//! new topic it creates a [Sink] buffering encoded records and a [Worker] reading
//! the topic with a consumer group of its own. Records are decoded by a
//! [Decoder], encoded into the sink's line format and appended to the sink; a
//! full sink blocks the worker until it is flushed.
//!
//! ## Kafka offsets
//! Offsets are committed only after the sink uploaded the records they cover,
//! so every record reaches the destination at least once. A crash between an
//! upload and its commit results in duplicates, never in loss.
//!
//! [Fleet]: fleet::Fleet
//! [Sink]: sink::Sink
//! [Worker]: worker::Worker
//! [Decoder]: decoder::Decoder

pub mod admin;
pub mod decoder;
pub mod error;
pub mod fleet;
pub mod format;
pub mod settings;
pub mod sink;
pub mod worker;
