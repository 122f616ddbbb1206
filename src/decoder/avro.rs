//! Generic decoder of Avro records into log entries
use std::{io::BufReader, time::Duration};

use anyhow::anyhow;
use apache_avro::{from_avro_datum, types::Value, Schema};
use chrono::{DateTime, NaiveDate, SecondsFormat};
use serde::Deserialize;
use serde_json::{Map, Number, Value as JsonValue};

use super::{Entry, CONFLUENT_HEADER_LEN};

/// Days between 0001-01-01 and 1970-01-01
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

#[derive(Deserialize)]
pub struct Settings {
    /// path to Avro schema of the messages
    pub schema_file: String,
    /// messages are prefixed with Confluent header (default: true)
    pub confluent_header: Option<bool>,
}

pub struct Decoder {
    schema: Schema,
    skip_header: bool,
}

pub fn new(settings: Settings) -> Result<Decoder, anyhow::Error> {
    let schema = std::fs::read_to_string(&settings.schema_file)
        .map_err(|e| anyhow!("reading schema {}: {e}", settings.schema_file))?;
    from_schema(&schema, settings.confluent_header.unwrap_or(true))
}

pub fn from_schema(schema: &str, skip_header: bool) -> Result<Decoder, anyhow::Error> {
    Ok(Decoder {
        schema: Schema::parse_str(schema)?,
        skip_header,
    })
}

impl super::Decoder for Decoder {
    fn get_name(&self) -> String {
        String::from("avro")
    }

    fn decode(&self, message: &[u8]) -> Result<Entry, anyhow::Error> {
        let body = if self.skip_header {
            message
                .get(CONFLUENT_HEADER_LEN..)
                .ok_or_else(|| anyhow!("message shorter than confluent header"))?
        } else {
            message
        };
        let mut datum = BufReader::new(body);
        match from_avro_datum(&self.schema, &mut datum, None)? {
            Value::Record(fields) => {
                let mut entry = Entry::new();
                for (name, value) in fields {
                    entry.insert(name, avro2json(value)?);
                }
                Ok(entry)
            }
            _ => Err(anyhow!("avro message must be a record")),
        }
    }
}

fn avro2json(v: Value) -> Result<JsonValue, anyhow::Error> {
    match v {
        Value::Null => Ok(JsonValue::Null),
        Value::Boolean(x) => Ok(JsonValue::from(x)),
        Value::Int(x) => Ok(JsonValue::from(x)),
        Value::Long(x) => Ok(JsonValue::from(x)),
        Value::Float(x) => float(f64::from(x)),
        Value::Double(x) => float(x),
        Value::Bytes(x) | Value::Fixed(_, x) => Ok(JsonValue::from(
            x.into_iter().map(JsonValue::from).collect::<Vec<_>>(),
        )),
        Value::String(x) | Value::Enum(_, x) => Ok(JsonValue::from(x)),
        Value::Union(_, x) => avro2json(*x),
        Value::Array(x) => Ok(JsonValue::Array(
            x.into_iter().map(avro2json).collect::<Result<_, _>>()?,
        )),
        Value::Map(x) => {
            let mut m = Map::new();
            for (k, v) in x {
                m.insert(k, avro2json(v)?);
            }
            Ok(JsonValue::Object(m))
        }
        Value::Record(x) => {
            let mut m = Map::new();
            for (k, v) in x {
                m.insert(k, avro2json(v)?);
            }
            Ok(JsonValue::Object(m))
        }
        Value::Date(x) => NaiveDate::from_num_days_from_ce_opt(UNIX_EPOCH_DAYS_FROM_CE + x)
            .map(|d| JsonValue::from(d.to_string()))
            .ok_or_else(|| anyhow!("date out of range: {x}")),
        Value::TimeMillis(x) => Ok(JsonValue::from(x)),
        Value::TimeMicros(x) => Ok(JsonValue::from(x)),
        Value::TimestampMillis(x) | Value::LocalTimestampMillis(x) => {
            timestamp(DateTime::from_timestamp_millis(x), x)
        }
        Value::TimestampMicros(x) | Value::LocalTimestampMicros(x) => {
            timestamp(DateTime::from_timestamp_micros(x), x)
        }
        Value::Duration(x) => {
            let duration = Duration::from_millis(u32::from(x.millis()) as u64)
                + Duration::from_secs(86400 * u32::from(x.days()) as u64)
                + Duration::from_secs(30 * 86400 * u32::from(x.months()) as u64);
            Ok(JsonValue::from(duration.as_millis() as u64))
        }
        Value::Uuid(x) => Ok(JsonValue::from(x.to_string())),
        Value::Decimal(_) => Err(anyhow!("unsupported decimal type")),
        #[allow(unreachable_patterns)]
        other => Err(anyhow!("unsupported avro value {other:?}")),
    }
}

fn float(x: f64) -> Result<JsonValue, anyhow::Error> {
    Number::from_f64(x)
        .map(JsonValue::Number)
        .ok_or_else(|| anyhow!("non-finite float {x}"))
}

fn timestamp(ts: Option<DateTime<chrono::Utc>>, raw: i64) -> Result<JsonValue, anyhow::Error> {
    ts.map(|t| JsonValue::from(t.to_rfc3339_opts(SecondsFormat::AutoSi, true)))
        .ok_or_else(|| anyhow!("timestamp out of range: {raw}"))
}
