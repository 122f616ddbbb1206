use anyhow::anyhow;
use serde_json::Value;

use super::Entry;

pub struct Decoder;

impl super::Decoder for Decoder {
    fn get_name(&self) -> String {
        String::from("json")
    }
    fn decode(&self, message: &[u8]) -> Result<Entry, anyhow::Error> {
        match serde_json::from_slice(message)? {
            Value::Object(entry) => Ok(entry),
            _ => Err(anyhow!("json message must be an object")),
        }
    }
}
