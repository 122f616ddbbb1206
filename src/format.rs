//! Line formats written into sinks
use serde::Deserialize;
use serde_json::Value;

use crate::decoder::Entry;

/// Text representation of one entry inside a sink buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Format {
    /// one JSON object per line
    #[default]
    Json,
    /// `key=value` pairs, nested keys joined with `.`
    Flat,
}

impl Format {
    /// Encodes an entry without the trailing record separator.
    pub fn encode(&self, entry: &Entry) -> Result<Vec<u8>, anyhow::Error> {
        match self {
            Format::Json => Ok(serde_json::to_vec(entry)?),
            Format::Flat => {
                let mut pairs = Vec::new();
                for (key, value) in entry {
                    flatten(key, value, &mut pairs);
                }
                pairs.sort();
                Ok(pairs.join(" ").into_bytes())
            }
        }
    }

    /// Media type of a buffer holding lines of this format
    pub fn content_type(&self) -> &'static str {
        match self {
            Format::Json => "application/x-ndjson",
            Format::Flat => "text/plain; charset=utf-8",
        }
    }
}

fn flatten(prefix: &str, value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Object(fields) => {
            for (key, value) in fields {
                flatten(&format!("{prefix}.{key}"), value, out);
            }
        }
        Value::Array(items) => {
            for (i, value) in items.iter().enumerate() {
                flatten(&format!("{prefix}.{i}"), value, out);
            }
        }
        Value::String(s) => out.push(format!("{}={}", quoted(prefix), quoted(s))),
        other => out.push(format!("{}={other}", quoted(prefix))),
    }
}

/// Keys and values go through the same quoting, so neither can break a line or a pair.
fn quoted(s: &str) -> String {
    if needs_quoting(s) {
        Value::from(s).to_string()
    } else {
        s.to_string()
    }
}

fn needs_quoting(s: &str) -> bool {
    s.is_empty()
        || s.chars()
            .any(|c| c.is_whitespace() || c.is_control() || c == '=' || c == '"')
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn entry(v: Value) -> Entry {
        match v {
            Value::Object(m) => m,
            _ => unreachable!(),
        }
    }

    #[test]
    fn json_is_single_line() {
        let e = entry(json!({"message": "line\nbreak", "level": "warn"}));
        let line = Format::Json.encode(&e).unwrap();
        assert!(!line.contains(&b'\n'));
        let back: Value = serde_json::from_slice(&line).unwrap();
        assert_eq!(back["message"], "line\nbreak");
    }

    #[test]
    fn flat_sorts_and_quotes() {
        let e = entry(json!({
            "msg": "user logged in",
            "level": "info",
            "http": {"status": 200, "path": "/login"},
            "tags": ["a", "b"],
            "ok": true,
            "empty": "",
        }));
        let line = String::from_utf8(Format::Flat.encode(&e).unwrap()).unwrap();
        assert_eq!(
            line,
            r#"empty="" http.path=/login http.status=200 level=info msg="user logged in" ok=true tags.0=a tags.1=b"#
        );
    }

    #[test]
    fn flat_quotes_keys_that_would_break_the_line() {
        let e = entry(json!({
            "bad\nkey": 1,
            "a=b": "x",
            "with space": {"inner": "y"},
        }));
        let line = String::from_utf8(Format::Flat.encode(&e).unwrap()).unwrap();
        assert!(!line.contains('\n'));
        assert!(!line.contains('\r'));
        assert_eq!(
            line,
            r#""a=b"=x "bad\nkey"=1 "with space.inner"=y"#
        );
    }

    #[test]
    fn content_type_follows_format() {
        assert_eq!(Format::Json.content_type(), "application/x-ndjson");
        assert!(Format::Flat.content_type().starts_with("text/plain"));
    }

    #[test]
    fn defaults_to_json() {
        assert_eq!(Format::default(), Format::Json);
    }
}
