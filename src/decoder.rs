//! Manages decoders
pub mod avro;
pub mod json;
pub mod plain;

use std::sync::Arc;

use anyhow::{anyhow, Result};

/// Confluent [header](https://docs.confluent.io/platform/current/schema-registry/fundamentals/serdes-develop/index.html#wire-format) length
pub const CONFLUENT_HEADER_LEN: usize = 5;

/// Decoded log record - JSON object of field names and values
pub type Entry = serde_json::Map<String, serde_json::Value>;

/// Decoder converts binary message from Kafka into log entry
pub trait Decoder {
    fn get_name(&self) -> String;
    fn decode(&self, message: &[u8]) -> Result<Entry, anyhow::Error>;
}

/// Creates decoder of specified name.
/// If you add your own decoders, register them here
pub fn get_decoder(
    name: &str,
    decoder_settings: Option<toml::Value>,
) -> Result<Arc<dyn Decoder + Send + Sync>, anyhow::Error> {
    match name {
        "json" => Ok(Arc::new(json::Decoder {})),
        "plain" => Ok(Arc::new(plain::Decoder {})),
        "avro" => match decoder_settings {
            Some(s) => Ok(Arc::new(avro::new(s.try_into()?)?)),
            None => Err(anyhow!("avro config missing")),
        },
        _ => Err(anyhow!("unknown decoder {}", name)),
    }
}
