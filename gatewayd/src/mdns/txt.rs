use std::collections::BTreeMap;
use serde_json::Value;

const MAX_TXT_STRING: usize = 255;

/// Encode metadata as `key=value` TXT strings. Strings are written raw,
/// everything else as JSON.
pub fn encode(metadata: &BTreeMap<String, Value>) -> Vec<Vec<u8>> {
    metadata
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let entry = format!("{key}={value}");
            if entry.len() > MAX_TXT_STRING {
                tracing::warn!("Skipping TXT entry {} ({} bytes)", key, entry.len());
                return None;
            }
            Some(entry.into_bytes())
        })
        .collect()
}

/// Decode TXT strings back into metadata. Each value is parsed as JSON when
/// possible and kept as a string otherwise; a bare key is a `true` flag.
pub fn decode(strings: &[Vec<u8>]) -> BTreeMap<String, Value> {
    let mut metadata = BTreeMap::new();
    for raw in strings {
        let text = String::from_utf8_lossy(raw);
        let (key, value) = match text.split_once('=') {
            Some((key, value)) => (
                key,
                serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string())),
            ),
            None => (text.as_ref(), Value::Bool(true)),
        };
        if key.is_empty() {
            continue;
        }
        metadata.insert(key.to_string(), value);
    }
    metadata
}
