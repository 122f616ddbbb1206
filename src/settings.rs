//! Application config
use std::{collections::HashMap, time::Duration};

use config::{Config, ConfigError, File};
use rdkafka::ClientConfig;
use regex::Regex;
use serde::Deserialize;

use crate::{
    fleet::{BackpressurePolicy, FleetConfig, SpawnBackoff},
    format::Format,
    sink::FlushPolicy,
};

/// Buffering thresholds of every sink
#[derive(Deserialize, Default, Clone)]
pub struct Flush {
    /// max buffered bytes per topic (default: 10MiB)
    pub max_bytes: Option<usize>,
    /// max buffered records per topic (default: unlimited)
    pub max_batches: Option<usize>,
    /// max age of buffered records (default: 60s)
    pub max_age_seconds: Option<u64>,
    /// how often full buffers are checked for (default: 1000ms)
    pub poll_interval_ms: Option<u64>,
}

/// Retries of writes into a full sink
#[derive(Deserialize, Default, Clone)]
pub struct Backpressure {
    /// pause between retries (default: 1000ms)
    pub backoff_ms: Option<u64>,
    /// consecutive rejections before alerting (default: 60)
    pub alert_after: Option<u32>,
    /// pause between retries after the alert (default: 10000ms)
    pub slow_backoff_ms: Option<u64>,
}

/// Retries of topics that failed to spawn
#[derive(Deserialize, Default, Clone)]
pub struct SpawnRetry {
    /// wait before the first retry, doubled on every further failure (default: 60s)
    pub initial_seconds: Option<u64>,
    /// upper bound of the wait (default: 1800s)
    pub max_seconds: Option<u64>,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    S3,
    Local,
    Memory,
}

/// Object storage destination
#[derive(Deserialize, Debug, Clone)]
pub struct ObjectStoreSettings {
    pub store: StoreKind,
    /// S3 bucket
    pub bucket: Option<String>,
    /// S3 region
    pub region: Option<String>,
    /// custom S3 endpoint, e.g. MinIO
    pub endpoint: Option<String>,
    /// static credentials (default: taken from environment)
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// root directory of local store
    pub path: Option<String>,
    /// key prefix of uploaded objects (default: "logs")
    pub prefix: Option<String>,
    pub format: Option<Format>,
}

/// Remote log aggregator accepting newline-delimited records over HTTP
#[derive(Deserialize, Debug, Clone)]
pub struct AggregatorSettings {
    /// ingestion endpoint
    pub url: String,
    /// bearer token
    pub token: Option<String>,
    /// name of the field holding the record timestamp
    pub timestamp_field: Option<String>,
    /// name of the field holding the log message
    pub message_field: Option<String>,
    /// name of the field holding the log level
    pub level_field: Option<String>,
    /// extra request headers
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// request timeout (default: 30s)
    pub timeout_seconds: Option<u64>,
    pub format: Option<Format>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkSettings {
    ObjectStore(ObjectStoreSettings),
    Aggregator(AggregatorSettings),
}

#[derive(Deserialize)]
pub struct Settings {
    /// address of bootstrap kafka broker
    pub kafka_broker: String,
    /// extra librdkafka properties
    #[serde(default)]
    pub kafka_properties: HashMap<String, String>,
    /// consumer group of a topic is this prefix followed by topic name (default: "logship-")
    pub group_prefix: Option<String>,
    /// regular expression selecting topics to ship
    pub topic_pattern: String,
    /// topic discovery period (default: 60s)
    pub discovery_interval_seconds: Option<u64>,
    /// metadata request timeout (default: 10s)
    pub metadata_timeout_seconds: Option<u64>,
    /// name of decoder to use (default: "json")
    pub decoder: Option<String>,
    /// Decoder-specific configuration
    pub custom: Option<toml::Value>,
    #[serde(default)]
    pub flush: Flush,
    #[serde(default)]
    pub backpressure: Backpressure,
    #[serde(default)]
    pub spawn_retry: SpawnRetry,
    pub sink: SinkSettings,
}

impl Settings {
    pub fn new(cfgfile: &str) -> Result<Self, ConfigError> {
        let cfg = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(cfgfile).required(true))
            .build()?;
        let mut settings: Settings = cfg.try_deserialize()?;
        settings.group_prefix = match settings.group_prefix {
            None => Some(String::from("logship-")),
            Some(x) => Some(x),
        };
        settings.decoder = match settings.decoder {
            None => Some(String::from("json")),
            Some(x) => Some(x),
        };
        Ok(settings)
    }

    pub fn flush_policy(&self) -> FlushPolicy {
        let default = FlushPolicy::default();
        FlushPolicy {
            max_bytes: self.flush.max_bytes.or(default.max_bytes),
            max_batches: self.flush.max_batches.or(default.max_batches),
            max_age: self
                .flush
                .max_age_seconds
                .map_or(default.max_age, Duration::from_secs),
            poll_interval: self
                .flush
                .poll_interval_ms
                .map_or(default.poll_interval, Duration::from_millis),
        }
    }

    pub fn fleet_config(&self) -> Result<FleetConfig, regex::Error> {
        let backpressure = BackpressurePolicy::default();
        let spawn = SpawnBackoff::default();
        Ok(FleetConfig {
            group_prefix: self.group_prefix.clone().unwrap_or_default(),
            topic_pattern: Regex::new(&self.topic_pattern)?,
            discovery_interval: Duration::from_secs(self.discovery_interval_seconds.unwrap_or(60)),
            backpressure: BackpressurePolicy {
                backoff: self
                    .backpressure
                    .backoff_ms
                    .map_or(backpressure.backoff, Duration::from_millis),
                alert_after: self
                    .backpressure
                    .alert_after
                    .unwrap_or(backpressure.alert_after),
                slow_backoff: self
                    .backpressure
                    .slow_backoff_ms
                    .map_or(backpressure.slow_backoff, Duration::from_millis),
            },
            spawn_backoff: SpawnBackoff {
                initial: self
                    .spawn_retry
                    .initial_seconds
                    .map_or(spawn.initial, Duration::from_secs),
                max: self
                    .spawn_retry
                    .max_seconds
                    .map_or(spawn.max, Duration::from_secs),
            },
        })
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata_timeout_seconds.unwrap_or(10))
    }

    /// Client config shared by consumers and metadata requests
    pub fn kafka_config(&self) -> ClientConfig {
        let mut cfg = ClientConfig::new();
        cfg.set("bootstrap.servers", &self.kafka_broker);
        for (key, value) in &self.kafka_properties {
            cfg.set(key, value);
        }
        cfg
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn load(body: &str) -> Settings {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        Settings::new(file.path().to_str().unwrap()).unwrap()
    }

    #[test]
    fn applies_defaults() {
        let settings = load(
            r#"
            kafka_broker = "localhost:9092"
            topic_pattern = "^logs_.*"

            [sink]
            type = "object_store"
            store = "memory"
            "#,
        );
        assert_eq!(settings.group_prefix.as_deref(), Some("logship-"));
        assert_eq!(settings.decoder.as_deref(), Some("json"));

        let policy = settings.flush_policy();
        assert_eq!(policy.max_bytes, Some(10 * 1024 * 1024));
        assert_eq!(policy.max_batches, None);
        assert_eq!(policy.max_age, Duration::from_secs(60));

        let fleet = settings.fleet_config().unwrap();
        assert_eq!(fleet.discovery_interval, Duration::from_secs(60));
        assert_eq!(fleet.backpressure.alert_after, 60);
        assert_eq!(fleet.spawn_backoff.max, Duration::from_secs(1800));
        assert!(fleet.topic_pattern.is_match("logs_nginx"));
        assert!(matches!(
            settings.sink,
            SinkSettings::ObjectStore(ObjectStoreSettings {
                store: StoreKind::Memory,
                ..
            })
        ));
    }

    #[test]
    fn reads_aggregator_sink_and_overrides() {
        let settings = load(
            r#"
            kafka_broker = "localhost:9092"
            group_prefix = "ship-"
            topic_pattern = "orders_.*"
            decoder = "plain"

            [kafka_properties]
            "security.protocol" = "ssl"

            [flush]
            max_bytes = 25
            max_age_seconds = 5

            [spawn_retry]
            initial_seconds = 0

            [sink]
            type = "aggregator"
            url = "http://localhost:8080/ingest"
            message_field = "message"
            format = "flat"
            headers = { "x-tenant" = "shop" }
            "#,
        );
        assert_eq!(settings.group_prefix.as_deref(), Some("ship-"));
        assert_eq!(settings.flush_policy().max_bytes, Some(25));
        assert_eq!(settings.flush_policy().max_age, Duration::from_secs(5));
        assert_eq!(
            settings.fleet_config().unwrap().spawn_backoff.initial,
            Duration::ZERO
        );
        assert_eq!(
            settings.kafka_config().get("security.protocol"),
            Some("ssl")
        );
        match settings.sink {
            SinkSettings::Aggregator(a) => {
                assert_eq!(a.format, Some(Format::Flat));
                assert_eq!(a.message_field.as_deref(), Some("message"));
                assert_eq!(a.headers["x-tenant"], "shop");
            }
            _ => panic!("expected aggregator sink"),
        }
    }

    #[test]
    fn invalid_pattern_is_an_error() {
        let settings = load(
            r#"
            kafka_broker = "localhost:9092"
            topic_pattern = "orders_("

            [sink]
            type = "object_store"
            store = "memory"
            "#,
        );
        assert!(settings.fleet_config().is_err());
    }
}
