//! Treats every message as a single line of text
use anyhow::anyhow;
use serde_json::Value;

use super::Entry;

pub struct Decoder;

impl super::Decoder for Decoder {
    fn get_name(&self) -> String {
        String::from("plain")
    }
    fn decode(&self, message: &[u8]) -> Result<Entry, anyhow::Error> {
        let text = std::str::from_utf8(message)?.trim_end_matches(['\r', '\n']);
        if text.is_empty() {
            return Err(anyhow!("empty message"));
        }
        let mut entry = Entry::new();
        entry.insert(String::from("message"), Value::from(text));
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use crate::decoder::Decoder as _;

    use super::*;

    #[test]
    fn wraps_text_into_message_field() {
        let entry = Decoder.decode(b"GET /health 200\n").unwrap();
        assert_eq!(entry.len(), 1);
        assert_eq!(entry["message"], "GET /health 200");
    }

    #[test]
    fn rejects_empty_and_binary_payloads() {
        assert!(Decoder.decode(b"\n").is_err());
        assert!(Decoder.decode(&[0xff, 0xfe, 0x00]).is_err());
    }
}
